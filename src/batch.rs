//! Indirect draw batch
//!
//! One batch owns an ordered list of draw item instances that share
//! aggregated buffers, compiles them into a packed command record stream,
//! validates that the aggregation assumptions still hold, runs the GPU
//! frustum cull, and issues the indirect draws. Per-item visibility
//! changes patch the CPU mirror in place; the GPU buffer is only
//! re-uploaded when the mirror is dirty.

use std::sync::Arc;

use cgmath::{Matrix4, Vector2};

use crate::command_layout::CommandLayout;
use crate::config::BatchConfig;
use crate::culling::{
    frustum, CullParams, CullResources, CullingPipeline, CullingPipelineRegistry,
    CullingProgram, VisibleInstanceCounter,
};
use crate::dispatch_buffer::{cull_views, draw_views, DispatchBuffer};
use crate::draw_item::{AggregationPolicy, DrawItem, DrawItemInstance};
use crate::draw_item::combine_hash;
use crate::error::{BatchError, BatchResult};

/// Outcome of batch validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    /// The compiled stream still matches the items.
    ValidBatch,
    /// Recompile this batch's dispatch buffer only.
    RebuildBatch,
    /// Tear down and re-partition every batch.
    RebuildAllBatches,
}

/// Per-draw performance counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchRenderStats {
    pub draw_calls: u32,
    pub items_drawn: u32,
}

/// Frame inputs for the cull pass.
///
/// The batch caches its cull bind group against `item_bounds` and
/// `instance_data`; after replacing either buffer, call
/// [`IndirectDrawBatch::invalidate_cull_resources`].
pub struct CullContext<'a> {
    pub cull_matrix: Matrix4<f32>,
    /// Minimum/maximum projected diameter in NDC units.
    pub draw_range_ndc: Vector2<f32>,
    /// One bounding sphere (center xyz, radius w) per record, in item order.
    pub item_bounds: &'a wgpu::Buffer,
    /// Per-instance translate/uniform-scale data, required for instance
    /// culling. Pre-flattened: entry `i` of a record's instances sits at
    /// `instanceIndexDC + i * instance_index_width`, so the cull shader
    /// indexes it directly instead of resolving an instance-index
    /// indirection first.
    pub instance_data: Option<&'a wgpu::Buffer>,
}

/// Aggregate resources the executor binds before issuing the draws.
pub struct DrawBindings<'a> {
    /// All aggregated buffer ranges, bound the way the drawing shader
    /// expects them.
    pub bind_group: &'a wgpu::BindGroup,
    pub index_buffer: Option<wgpu::BufferSlice<'a>>,
    pub index_format: wgpu::IndexFormat,
}

pub struct IndirectDrawBatch {
    instances: Vec<DrawItemInstance>,
    config: BatchConfig,
    layout: CommandLayout,
    use_draw_arrays: bool,
    use_instance_culling: bool,
    use_gpu_culling: bool,

    command_mirror: Vec<u32>,
    dispatch: Option<DispatchBuffer>,
    cull_input: Option<DispatchBuffer>,
    instance_count_offset: u32,
    cull_instance_count_offset: u32,

    buffer_arrays_hash: u64,
    bar_element_offsets_hash: u64,
    visible_instance_total: u32,
    total_num_elements: u32,
    total_vertex_count: u32,
    dirty: bool,
    compiled: bool,

    culling_program: CullingProgram,
    cull_pipeline: Option<Arc<CullingPipeline>>,
    cull_resources: Option<CullResources>,
    counter: Option<VisibleInstanceCounter>,
}

impl IndirectDrawBatch {
    /// Build a batch over an ordered, non-empty instance list. The record
    /// shape is fixed here from the first item and the configuration.
    pub fn new(
        mut instances: Vec<DrawItemInstance>,
        config: BatchConfig,
    ) -> BatchResult<Self> {
        let first = instances.first().ok_or(BatchError::EmptyBatch)?;
        let item = &first.item;

        let indexed = item.topology_range.is_some();
        let use_draw_arrays = !indexed;
        let use_gpu_culling = config.enable_gpu_frustum_culling;
        let use_instance_culling = item.instance_index_range.is_some()
            && use_gpu_culling
            && config.enable_gpu_instance_frustum_culling;
        let levels = item.instancer_num_levels() as u32;
        let layout = CommandLayout::new(indexed, use_instance_culling, levels);
        let buffer_arrays_hash = item.buffer_arrays_hash;

        for (index, instance) in instances.iter_mut().enumerate() {
            instance.set_batch_index(index as u32);
        }

        let mut culling_program = CullingProgram::new();
        culling_program.initialize(use_draw_arrays, use_instance_culling, buffer_arrays_hash);

        log::debug!(
            "[IndirectDrawBatch] New batch: {} items, indexed={}, instance_culling={}, levels={}",
            instances.len(),
            indexed,
            use_instance_culling,
            levels
        );

        Ok(Self {
            instances,
            config,
            layout,
            use_draw_arrays,
            use_instance_culling,
            use_gpu_culling,
            command_mirror: Vec::new(),
            dispatch: None,
            cull_input: None,
            instance_count_offset: layout.instance_count_offset(),
            cull_instance_count_offset: layout.cull_instance_count_offset(),
            buffer_arrays_hash,
            bar_element_offsets_hash: 0,
            visible_instance_total: 0,
            total_num_elements: 0,
            total_vertex_count: 0,
            dirty: false,
            compiled: false,
            culling_program,
            cull_pipeline: None,
            cull_resources: None,
            counter: None,
        })
    }

    pub fn layout(&self) -> CommandLayout {
        self.layout
    }

    pub fn instances(&self) -> &[DrawItemInstance] {
        &self.instances
    }

    pub fn visible_instance_total(&self) -> u32 {
        self.visible_instance_total
    }

    pub fn dispatch_buffer(&self) -> Option<&DispatchBuffer> {
        self.dispatch.as_ref()
    }

    pub fn cull_input_buffer(&self) -> Option<&DispatchBuffer> {
        self.cull_input.as_ref()
    }

    /// Replace one instance's item, as the scene layer does when buffers
    /// migrate. The batch notices through validation, never eagerly.
    pub fn update_item(&mut self, index: usize, item: Arc<DrawItem>) -> BatchResult<()> {
        let count = self.instances.len();
        let instance = self
            .instances
            .get_mut(index)
            .ok_or(BatchError::InstanceIndexOutOfRange { index, count })?;
        instance.item = item;
        Ok(())
    }

    pub fn set_enable_tiny_prim_culling(&mut self, enabled: bool) {
        self.culling_program.set_tiny_prim_culling(enabled);
    }

    /// Compile the command record stream into the CPU mirror.
    ///
    /// Device-free: GPU buffers are realized separately so the stream
    /// itself stays testable. The produced stream must cover exactly
    /// `item_count * record_size` u32s.
    pub fn compile_commands(&mut self) -> BatchResult<()> {
        let num_uints = self.layout.num_uints();
        let expected = self.instances.len() * num_uints as usize;

        let mut stream = Vec::with_capacity(expected);
        let mut visible_total = 0u32;
        let mut num_elements_total = 0u32;
        let mut vertex_total = 0u32;

        for (index, instance) in self.instances.iter().enumerate() {
            let record_start = stream.len();
            let counts = self.layout.encode_item(
                &instance.item,
                instance.visible,
                instance.batch_index(),
                index,
                &mut stream,
            )?;
            visible_total += counts.instance_count;
            num_elements_total += counts.num_elements;
            vertex_total += counts.vertex_count;

            if log::log_enabled!(log::Level::Trace) {
                log::trace!(
                    "[IndirectDrawBatch] record {}: {:?}",
                    index,
                    &stream[record_start..]
                );
            }
        }

        if stream.len() != expected {
            return Err(BatchError::CommandStreamMismatch {
                expected,
                actual: stream.len(),
            });
        }

        self.command_mirror = stream;
        self.visible_instance_total = visible_total;
        self.total_num_elements = num_elements_total;
        self.total_vertex_count = vertex_total;
        self.instance_count_offset = self.layout.instance_count_offset();
        self.cull_instance_count_offset = self.layout.cull_instance_count_offset();
        self.bar_element_offsets_hash = self.element_offsets_hash();
        if let Some(first) = self.instances.first() {
            self.buffer_arrays_hash = first.item.buffer_arrays_hash;
        }
        self.culling_program.initialize(
            self.use_draw_arrays,
            self.use_instance_culling,
            self.buffer_arrays_hash,
        );
        self.compiled = true;
        self.dirty = true;

        log::debug!(
            "[IndirectDrawBatch] Compiled {} records ({} uints, {} visible instances)",
            self.instances.len(),
            self.command_mirror.len(),
            visible_total
        );
        Ok(())
    }

    /// Create the GPU dispatch buffer (and the cull-input duplicate when
    /// GPU culling is on) with their named views.
    pub fn realize_dispatch_buffers(&mut self, device: &wgpu::Device) -> BatchResult<()> {
        if !self.compiled {
            return Err(BatchError::NotCompiled);
        }
        let count = self.instances.len() as u32;
        let num_uints = self.layout.num_uints();

        let mut dispatch = DispatchBuffer::new(device, "Dispatch Buffer", count, num_uints);
        dispatch.set_views(draw_views(&self.layout));
        self.dispatch = Some(dispatch);

        self.cull_input = if self.use_gpu_culling {
            let mut cull_input =
                DispatchBuffer::new(device, "Cull Input Buffer", count, num_uints);
            cull_input.set_views(cull_views(&self.layout));
            Some(cull_input)
        } else {
            None
        };
        self.invalidate_cull_resources();
        self.dirty = true;
        Ok(())
    }

    /// Drop the cached cull bind group. Required whenever the buffers a
    /// previous [`CullContext`] pointed at are replaced; also happens
    /// automatically when the dispatch buffers or the culling pipeline
    /// change.
    pub fn invalidate_cull_resources(&mut self) {
        self.cull_resources = None;
        self.cull_pipeline = None;
    }

    fn element_offsets_hash(&self) -> u64 {
        self.instances
            .iter()
            .fold(0u64, |hash, instance| {
                combine_hash(hash, instance.item.element_offsets_hash())
            })
    }

    /// Decide whether the compiled stream still matches the items.
    ///
    /// The shallow check compares only the representative item's
    /// buffer-arrays hash. The deep check scans every item and is meant
    /// for callers that already know something moved.
    pub fn validate(&mut self, deep: bool, policy: &dyn AggregationPolicy) -> ValidationResult {
        let Some(first) = self.instances.first() else {
            // An empty batch breaks the construction contract; only a
            // full re-partition can recover.
            return ValidationResult::RebuildAllBatches;
        };

        if first.item.buffer_arrays_hash != self.buffer_arrays_hash {
            log::debug!("[IndirectDrawBatch] Buffer arrays hash changed, rebuilding batch");
            self.buffer_arrays_hash = first.item.buffer_arrays_hash;
            return ValidationResult::RebuildBatch;
        }
        if !deep {
            return ValidationResult::ValidBatch;
        }

        let representative = first.item.clone();
        for instance in &self.instances {
            if instance.item.geometric_shader.is_none() {
                return ValidationResult::RebuildAllBatches;
            }
            if !policy.is_aggregated(&representative, &instance.item) {
                return ValidationResult::RebuildAllBatches;
            }
        }

        let offsets_hash = self.element_offsets_hash();
        if offsets_hash != self.bar_element_offsets_hash {
            log::debug!("[IndirectDrawBatch] Element offsets moved, rebuilding batch");
            self.bar_element_offsets_hash = offsets_hash;
            return ValidationResult::RebuildBatch;
        }
        ValidationResult::ValidBatch
    }

    /// The intentionally out-of-band diagnostic scan: verifies every item
    /// is drawable and aggregated with the representative. Not called on
    /// the frame path.
    pub fn validate_compatibility(&self, policy: &dyn AggregationPolicy) -> BatchResult<()> {
        let first = self.instances.first().ok_or(BatchError::EmptyBatch)?;
        let representative = &first.item;
        let expected_levels = representative.instancer_num_levels();
        for (index, instance) in self.instances.iter().enumerate() {
            let item = &instance.item;
            if item.geometric_shader.is_none() {
                return Err(BatchError::MissingGeometricShader { item: index });
            }
            if item.instancer_num_levels() != expected_levels {
                return Err(BatchError::InstancerLevelMismatch {
                    item: index,
                    expected: expected_levels,
                    actual: item.instancer_num_levels(),
                });
            }
            if !policy.is_aggregated(representative, item) {
                return Err(BatchError::NotAggregated { item: index });
            }
        }
        Ok(())
    }

    /// Whether GPU culling applies this frame. Per-instance transforms
    /// without per-instance culling would leave the record shape and the
    /// cull shader disagreeing, so culling is skipped entirely then.
    fn culling_enabled_for_frame(&self) -> bool {
        if !self.use_gpu_culling {
            return false;
        }
        let has_instancing = self
            .instances
            .first()
            .map_or(false, |i| i.item.instance_index_range.is_some());
        !(has_instancing && !self.use_instance_culling)
    }

    /// Freeze-culling holds the previous frame's counts, except when the
    /// mirror is dirty: stale counts would then be overwritten by the
    /// upload anyway.
    fn should_run_culling(&self, mirror_dirty: bool) -> bool {
        self.culling_enabled_for_frame() && (!self.config.freeze_culling || mirror_dirty)
    }

    /// Counters for one executed draw: one indirect draw per record slot,
    /// with the running live-instance total as the visible-item count.
    /// Invisible items occupy a record slot but are not drawn.
    fn render_stats(&self) -> BatchRenderStats {
        BatchRenderStats {
            draw_calls: self.instances.len() as u32,
            items_drawn: self.visible_instance_total,
        }
    }

    fn totals_are_zero(&self) -> bool {
        if self.layout.indexed {
            self.total_num_elements == 0
        } else {
            self.total_vertex_count == 0
        }
    }

    /// Compile and upload as needed, then run the selected culling
    /// variant. Returns the visible-instance count when diagnostic
    /// counting is enabled and culling ran.
    ///
    /// Submits its own command buffer; the subsequent render pass sees
    /// the cull-patched dispatch buffer.
    pub fn prepare_draw(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        registry: &CullingPipelineRegistry,
        cull: &CullContext<'_>,
    ) -> BatchResult<Option<u32>> {
        if !self.compiled {
            self.compile_commands()?;
        }
        if self.dispatch.is_none() {
            self.realize_dispatch_buffers(device)?;
        }
        if self.totals_are_zero() {
            return Ok(None);
        }

        let mirror_dirty = self.dirty;
        let run_culling = self.should_run_culling(mirror_dirty);

        if mirror_dirty {
            let dispatch = self.dispatch.as_ref().ok_or(BatchError::NotCompiled)?;
            dispatch.upload(queue, &self.command_mirror)?;
            if let Some(cull_input) = &self.cull_input {
                cull_input.upload(queue, &self.command_mirror)?;
            }
            self.dirty = false;
        }

        if !run_culling {
            return Ok(None);
        }

        let counting = self.config.enable_gpu_count_visible_instances;
        let pipeline = self
            .culling_program
            .get_or_compile(device, registry, counting);

        // The bind group outlives the frame; rebuild only when the
        // pipeline variant changed or the dispatch buffers were recreated.
        let stale = self.cull_resources.is_none()
            || self
                .cull_pipeline
                .as_ref()
                .map_or(true, |cached| !Arc::ptr_eq(cached, &pipeline));
        if stale {
            let dispatch = self.dispatch.as_ref().ok_or(BatchError::NotCompiled)?;
            let cull_input = self.cull_input.as_ref().ok_or(BatchError::NotCompiled)?;
            let counter = self
                .counter
                .get_or_insert_with(|| VisibleInstanceCounter::new(device));
            self.cull_resources = Some(CullResources::new(
                device,
                &pipeline,
                dispatch,
                cull_input,
                cull.item_bounds,
                cull.instance_data,
                counter,
            )?);
            self.cull_pipeline = Some(pipeline.clone());
        }
        let resources = self.cull_resources.as_ref().ok_or(BatchError::NotCompiled)?;
        let draw_count = self.instances.len() as u32;
        resources.upload_params(
            queue,
            &CullParams {
                cull_matrix: cull.cull_matrix,
                draw_range_ndc: cull.draw_range_ndc,
                command_num_uints: self.layout.num_uints(),
                draw_count,
                instance_count_offset: self.instance_count_offset,
                cull_instance_count_offset: self.cull_instance_count_offset,
                instance_index_dc_offset: self.layout.instance_index_dc_offset(),
                instance_index_width: self.layout.instance_index_width(),
            },
        );
        if counting {
            if let Some(counter) = &self.counter {
                counter.reset(queue);
            }
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Cull Encoder"),
        });
        if self.use_instance_culling {
            frustum::run_instance_culling(&mut encoder, &pipeline, resources, draw_count)?;
        } else {
            frustum::run_non_instance_culling(&mut encoder, &pipeline, resources, draw_count);
        }
        if counting {
            if let Some(counter) = &self.counter {
                counter.copy_to_staging(&mut encoder);
            }
        }
        queue.submit(Some(encoder.finish()));

        if counting {
            let counter = self.counter.as_ref().ok_or(BatchError::NotCompiled)?;
            // Diagnostic path only: blocks until the GPU finished.
            let visible = counter.read_back(device)?;
            log::debug!("[IndirectDrawBatch] {} visible instances after cull", visible);
            return Ok(Some(visible));
        }
        Ok(None)
    }

    /// Bind the aggregate resources and issue one indirect draw per
    /// record slot against the cull-patched dispatch buffer.
    pub fn execute_draw<'a>(
        &'a self,
        pass: &mut wgpu::RenderPass<'a>,
        bindings: &DrawBindings<'a>,
    ) -> BatchResult<BatchRenderStats> {
        let dispatch = self.dispatch.as_ref().ok_or(BatchError::NotCompiled)?;
        if self.totals_are_zero() {
            return Ok(BatchRenderStats::default());
        }

        pass.set_bind_group(0, bindings.bind_group, &[]);

        let count = dispatch.count();
        if self.layout.indexed {
            let index_buffer = bindings
                .index_buffer
                .ok_or(BatchError::MissingIndexBuffer)?;
            pass.set_index_buffer(index_buffer, bindings.index_format);
            for i in 0..count {
                pass.draw_indexed_indirect(dispatch.buffer(), dispatch.record_byte_offset(i));
            }
        } else {
            for i in 0..count {
                pass.draw_indirect(dispatch.buffer(), dispatch.record_byte_offset(i));
            }
        }

        Ok(self.render_stats())
    }

    /// O(1) patch for one instance whose visibility flipped. Rewrites the
    /// live and cull count slots in the CPU mirror and marks the batch
    /// dirty; the stream is never recompiled for this.
    pub fn set_instance_visibility(&mut self, index: usize, visible: bool) -> BatchResult<()> {
        if !self.compiled {
            return Err(BatchError::NotCompiled);
        }
        let count = self.instances.len();
        let instance = self
            .instances
            .get_mut(index)
            .ok_or(BatchError::InstanceIndexOutOfRange { index, count })?;
        if instance.visible == visible {
            return Ok(());
        }
        instance.visible = visible;

        let width = self.layout.instance_index_width();
        let new_count = if !visible {
            0
        } else {
            instance
                .item
                .instance_index_range
                .as_ref()
                .map_or(1, |r| r.num_elements / width)
        };

        let base = instance.batch_index() as usize * self.layout.num_uints() as usize;
        let count_slot = base + self.instance_count_offset as usize;
        let cull_slot = base + self.cull_instance_count_offset as usize;
        let old_count = self.command_mirror[count_slot];
        self.command_mirror[count_slot] = new_count;
        self.command_mirror[cull_slot] = new_count;

        self.visible_instance_total = self.visible_instance_total - old_count + new_count;
        self.dirty = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw_item::{
        BufferArrayRange, DrawItemInstance, GeometricShader, SharedAggregatePolicy,
    };

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn gpu_culling_off() -> BatchConfig {
        BatchConfig {
            enable_gpu_frustum_culling: false,
            enable_gpu_count_visible_instances: false,
            enable_gpu_instance_frustum_culling: false,
            freeze_culling: false,
        }
    }

    fn elements_item(levels: usize, instance_elements: Option<u32>) -> DrawItem {
        let width = levels as u32 + 1;
        DrawItem {
            vertex_range: Some(BufferArrayRange::new(1, 0, 24)),
            topology_range: Some(BufferArrayRange::new(2, 0, 10)),
            instance_primvar_ranges: vec![None; levels],
            instance_index_range: instance_elements
                .map(|n| BufferArrayRange::new(4, 0, n * width)),
            geometric_shader: Some(GeometricShader::new(1, 3)),
            buffer_arrays_hash: 99,
            ..Default::default()
        }
    }

    fn arrays_item() -> DrawItem {
        DrawItem {
            vertex_range: Some(BufferArrayRange::new(1, 0, 24)),
            geometric_shader: Some(GeometricShader::new(1, 3)),
            buffer_arrays_hash: 99,
            ..Default::default()
        }
    }

    fn batch_of(items: Vec<(DrawItem, bool)>, config: BatchConfig) -> IndirectDrawBatch {
        let instances = items
            .into_iter()
            .map(|(item, visible)| DrawItemInstance::new(Arc::new(item), visible))
            .collect();
        IndirectDrawBatch::new(instances, config).expect("batch")
    }

    #[test]
    fn empty_batch_is_a_contract_violation() {
        assert!(matches!(
            IndirectDrawBatch::new(Vec::new(), gpu_culling_off()),
            Err(BatchError::EmptyBatch)
        ));
    }

    #[test]
    fn stream_length_is_exact_for_every_shape() {
        init_logs();
        let configs = [
            (gpu_culling_off(), false),
            (
                BatchConfig {
                    enable_gpu_frustum_culling: true,
                    enable_gpu_instance_frustum_culling: true,
                    ..gpu_culling_off()
                },
                true,
            ),
        ];
        for (config, culled) in configs {
            for indexed in [false, true] {
                let item = if indexed {
                    elements_item(0, Some(1))
                } else {
                    DrawItem {
                        instance_index_range: Some(BufferArrayRange::new(4, 0, 1)),
                        ..arrays_item()
                    }
                };
                let mut batch = batch_of(vec![(item.clone(), true), (item, false)], config);
                assert_eq!(batch.layout().instance_culling, culled);
                batch.compile_commands().expect("compile");
                assert_eq!(
                    batch.command_mirror.len(),
                    2 * batch.layout().num_uints() as usize
                );
            }
        }
    }

    #[test]
    fn three_items_one_invisible_compile_expected_counts() {
        init_logs();
        // Two visible draw-elements items with an instance-index range two
        // indices wide at one nesting level, one invisible item.
        let mut batch = batch_of(
            vec![
                (elements_item(1, Some(1)), true),
                (elements_item(1, Some(1)), true),
                (elements_item(1, Some(1)), false),
            ],
            gpu_culling_off(),
        );
        batch.compile_commands().expect("compile");

        let num_uints = batch.layout().num_uints() as usize;
        let offset = batch.layout().instance_count_offset() as usize;
        let counts: Vec<u32> = (0..3)
            .map(|i| batch.command_mirror[i * num_uints + offset])
            .collect();
        assert_eq!(counts, vec![1, 1, 0]);
        assert_eq!(batch.visible_instance_total(), 2);
    }

    #[test]
    fn invisible_items_zero_both_count_slots() {
        let config = BatchConfig {
            enable_gpu_frustum_culling: true,
            enable_gpu_instance_frustum_culling: true,
            ..gpu_culling_off()
        };
        let mut batch = batch_of(vec![(elements_item(0, Some(8)), false)], config);
        assert!(batch.layout().instance_culling);
        batch.compile_commands().expect("compile");

        let count_slot = batch.layout().instance_count_offset() as usize;
        let cull_slot = batch.layout().cull_instance_count_offset() as usize;
        assert_eq!(batch.command_mirror[count_slot], 0);
        assert_eq!(batch.command_mirror[cull_slot], 0);
    }

    #[test]
    fn item_without_instance_range_draws_once_when_visible() {
        let mut batch = batch_of(
            vec![(elements_item(0, None), true), (elements_item(0, None), false)],
            gpu_culling_off(),
        );
        batch.compile_commands().expect("compile");
        let num_uints = batch.layout().num_uints() as usize;
        let offset = batch.layout().instance_count_offset() as usize;
        assert_eq!(batch.command_mirror[offset], 1);
        assert_eq!(batch.command_mirror[num_uints + offset], 0);
    }

    #[test]
    fn shallow_validate_is_idempotent() {
        let mut batch = batch_of(vec![(elements_item(0, None), true)], gpu_culling_off());
        batch.compile_commands().expect("compile");
        let policy = SharedAggregatePolicy;
        for _ in 0..3 {
            assert_eq!(batch.validate(false, &policy), ValidationResult::ValidBatch);
        }
    }

    #[test]
    fn buffer_arrays_hash_drift_rebuilds_the_batch() {
        let mut batch = batch_of(vec![(elements_item(0, None), true)], gpu_culling_off());
        batch.compile_commands().expect("compile");

        let mut moved = elements_item(0, None);
        moved.buffer_arrays_hash = 100;
        batch.update_item(0, Arc::new(moved)).expect("update");

        let policy = SharedAggregatePolicy;
        assert_eq!(batch.validate(false, &policy), ValidationResult::RebuildBatch);
    }

    #[test]
    fn offset_drift_with_intact_aggregation_rebuilds_only_this_batch() {
        let mut batch = batch_of(
            vec![(elements_item(0, None), true), (elements_item(0, None), true)],
            gpu_culling_off(),
        );
        batch.compile_commands().expect("compile");

        // Same aggregates, different offset within them.
        let mut moved = elements_item(0, None);
        moved.vertex_range = Some(BufferArrayRange::new(1, 48, 24));
        batch.update_item(1, Arc::new(moved)).expect("update");

        let policy = SharedAggregatePolicy;
        assert_eq!(batch.validate(true, &policy), ValidationResult::RebuildBatch);
    }

    #[test]
    fn aggregation_failure_rebuilds_all_batches() {
        let mut batch = batch_of(
            vec![
                (elements_item(0, None), true),
                (elements_item(0, None), true),
                (elements_item(0, None), true),
            ],
            gpu_culling_off(),
        );
        batch.compile_commands().expect("compile");

        // One item migrated to a different vertex aggregate.
        let mut migrated = elements_item(0, None);
        migrated.vertex_range = Some(BufferArrayRange::new(7, 0, 24));
        batch.update_item(2, Arc::new(migrated)).expect("update");

        let policy = SharedAggregatePolicy;
        assert_eq!(
            batch.validate(true, &policy),
            ValidationResult::RebuildAllBatches
        );
    }

    #[test]
    fn missing_geometric_shader_rebuilds_all_batches() {
        let mut batch = batch_of(
            vec![(elements_item(0, None), true), (elements_item(0, None), true)],
            gpu_culling_off(),
        );
        batch.compile_commands().expect("compile");

        let mut broken = elements_item(0, None);
        broken.geometric_shader = None;
        batch.update_item(1, Arc::new(broken)).expect("update");

        let policy = SharedAggregatePolicy;
        assert_eq!(
            batch.validate(true, &policy),
            ValidationResult::RebuildAllBatches
        );
    }

    #[test]
    fn visibility_toggle_round_trips() {
        let mut batch = batch_of(
            vec![(elements_item(1, Some(3)), true), (elements_item(1, Some(3)), true)],
            gpu_culling_off(),
        );
        batch.compile_commands().expect("compile");
        let original_mirror = batch.command_mirror.clone();
        let original_total = batch.visible_instance_total();
        assert_eq!(original_total, 6);

        batch.set_instance_visibility(1, false).expect("hide");
        assert_eq!(batch.visible_instance_total(), 3);
        assert!(batch.dirty);

        batch.set_instance_visibility(1, true).expect("show");
        assert_eq!(batch.command_mirror, original_mirror);
        assert_eq!(batch.visible_instance_total(), original_total);
    }

    #[test]
    fn visibility_patch_writes_both_slots_without_recompiling() {
        let config = BatchConfig {
            enable_gpu_frustum_culling: true,
            enable_gpu_instance_frustum_culling: true,
            ..gpu_culling_off()
        };
        let mut batch = batch_of(vec![(elements_item(0, Some(4)), true)], config);
        batch.compile_commands().expect("compile");
        assert_ne!(
            batch.layout().instance_count_offset(),
            batch.layout().cull_instance_count_offset()
        );

        batch.set_instance_visibility(0, false).expect("hide");
        let count_slot = batch.layout().instance_count_offset() as usize;
        let cull_slot = batch.layout().cull_instance_count_offset() as usize;
        assert_eq!(batch.command_mirror[count_slot], 0);
        assert_eq!(batch.command_mirror[cull_slot], 0);

        batch.set_instance_visibility(0, true).expect("show");
        assert_eq!(batch.command_mirror[count_slot], 4);
        assert_eq!(batch.command_mirror[cull_slot], 4);
    }

    #[test]
    fn render_stats_count_visible_items_only() {
        let mut batch = batch_of(
            vec![
                (elements_item(1, Some(1)), true),
                (elements_item(1, Some(1)), true),
                (elements_item(1, Some(1)), false),
            ],
            gpu_culling_off(),
        );
        batch.compile_commands().expect("compile");

        // Every record slot gets an indirect draw, but the invisible item
        // contributes nothing to the visible total.
        let stats = batch.render_stats();
        assert_eq!(stats.draw_calls, 3);
        assert_eq!(stats.items_drawn, 2);

        batch.set_instance_visibility(1, false).expect("hide");
        assert_eq!(batch.render_stats().items_drawn, 1);
        assert_eq!(batch.render_stats().draw_calls, 3);
    }

    #[test]
    fn cull_resources_start_uncached_and_invalidate_is_reentrant() {
        let mut batch = batch_of(vec![(elements_item(0, Some(4)), true)], gpu_culling_off());
        assert!(batch.cull_resources.is_none());
        assert!(batch.cull_pipeline.is_none());

        batch.compile_commands().expect("compile");
        assert!(batch.cull_resources.is_none());

        batch.invalidate_cull_resources();
        batch.invalidate_cull_resources();
        assert!(batch.cull_resources.is_none());
        assert!(batch.cull_pipeline.is_none());
    }

    #[test]
    fn visibility_patch_before_compile_is_rejected() {
        let mut batch = batch_of(vec![(elements_item(0, None), true)], gpu_culling_off());
        assert!(matches!(
            batch.set_instance_visibility(0, false),
            Err(BatchError::NotCompiled)
        ));
    }

    #[test]
    fn culling_disabled_when_instancing_lacks_instance_culling() {
        let config = BatchConfig {
            enable_gpu_frustum_culling: true,
            enable_gpu_instance_frustum_culling: false,
            ..gpu_culling_off()
        };
        let instanced = batch_of(vec![(elements_item(0, Some(4)), true)], config);
        assert!(!instanced.culling_enabled_for_frame());

        let plain = batch_of(vec![(elements_item(0, None), true)], config);
        assert!(plain.culling_enabled_for_frame());
    }

    #[test]
    fn freeze_culling_bypassed_while_dirty() {
        let config = BatchConfig {
            enable_gpu_frustum_culling: true,
            enable_gpu_instance_frustum_culling: true,
            freeze_culling: true,
            ..gpu_culling_off()
        };
        let batch = batch_of(vec![(elements_item(0, Some(4)), true)], config);
        assert!(batch.should_run_culling(true));
        assert!(!batch.should_run_culling(false));
    }

    #[test]
    fn compatibility_scan_reports_the_offending_item() {
        let mut batch = batch_of(
            vec![(elements_item(1, None), true), (elements_item(1, None), true)],
            gpu_culling_off(),
        );
        let policy = SharedAggregatePolicy;
        assert!(batch.validate_compatibility(&policy).is_ok());

        let mut mismatched = elements_item(2, None);
        mismatched.buffer_arrays_hash = 99;
        batch.update_item(1, Arc::new(mismatched)).expect("update");
        assert!(matches!(
            batch.validate_compatibility(&policy),
            Err(BatchError::InstancerLevelMismatch { item: 1, expected: 1, actual: 2 })
        ));
    }
}
