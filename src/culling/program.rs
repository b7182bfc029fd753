//! Culling pipeline compilation and sharing
//!
//! Compiled compute pipelines are deduplicated across batches through a
//! registry keyed by culling configuration; each batch keeps a small
//! `CullingProgram` state machine deciding when its pipeline must be
//! fetched again or rebuilt.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::shader_package;

/// Unique key for one compiled culling shader variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CullingShaderKey {
    pub use_draw_arrays: bool,
    pub use_instance_culling: bool,
    pub count_visible_instances: bool,
    pub tiny_prim_culling: bool,
}

/// A compiled culling pipeline: the cull entry point, plus the reset entry
/// point for the two-phase instanced variant.
pub struct CullingPipeline {
    pub(crate) cull_pipeline: wgpu::ComputePipeline,
    pub(crate) reset_pipeline: Option<wgpu::ComputePipeline>,
    pub(crate) bind_group_layout: wgpu::BindGroupLayout,
    key: CullingShaderKey,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl CullingPipeline {
    pub fn new(device: &wgpu::Device, key: CullingShaderKey) -> Self {
        let source = shader_package::culling_shader_source(&key);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(shader_package::shader_name(&key)),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let mut entries = vec![
            // Cull parameters
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            // Cull-input command stream
            storage_entry(1, true),
            // Live dispatch buffer
            storage_entry(2, false),
            // Item bounds
            storage_entry(3, true),
        ];
        if key.use_instance_culling {
            // Per-instance transform data
            entries.push(storage_entry(4, true));
            // Visible-instance counter
            entries.push(storage_entry(5, false));
        } else {
            entries.push(storage_entry(4, false));
        }

        let bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Culling Bind Group Layout"),
                entries: &entries,
            });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Culling Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let (cull_entry, reset_entry) = if key.use_instance_culling {
            ("cull_instances", Some("reset_counts"))
        } else {
            ("cull_draws", None)
        };

        let cull_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Frustum Cull Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: cull_entry,
        });
        let reset_pipeline = reset_entry.map(|entry| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("Reset Counts Pipeline"),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: entry,
            })
        });

        Self {
            cull_pipeline,
            reset_pipeline,
            bind_group_layout,
            key,
        }
    }

    pub fn key(&self) -> CullingShaderKey {
        self.key
    }
}

/// Shares compiled culling pipelines across batches. At most one pipeline
/// exists per distinct key, even under concurrent first-use.
#[derive(Default)]
pub struct CullingPipelineRegistry {
    pipelines: Mutex<FxHashMap<CullingShaderKey, Arc<CullingPipeline>>>,
}

impl CullingPipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        device: &wgpu::Device,
        key: CullingShaderKey,
    ) -> Arc<CullingPipeline> {
        let mut pipelines = self.pipelines.lock();
        pipelines
            .entry(key)
            .or_insert_with(|| {
                log::debug!("[CullingPipelineRegistry] Compiling pipeline for {:?}", key);
                Arc::new(CullingPipeline::new(device, key))
            })
            .clone()
    }
}

/// Per-batch culling program state.
///
/// The pipeline is fetched lazily on first use. A tiny-prim toggle only
/// dirties the program; a change of draw mode, instance-culling mode or
/// the owning buffer-arrays hash resets it entirely.
#[derive(Default)]
pub struct CullingProgram {
    use_draw_arrays: bool,
    use_instance_culling: bool,
    buffer_arrays_hash: u64,
    tiny_prim_culling: bool,
    dirty: bool,
    compiled: Option<Arc<CullingPipeline>>,
}

impl CullingProgram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the batch configuration this program serves. Resets the
    /// compiled pipeline when any of it changed.
    pub fn initialize(
        &mut self,
        use_draw_arrays: bool,
        use_instance_culling: bool,
        buffer_arrays_hash: u64,
    ) {
        if use_draw_arrays != self.use_draw_arrays
            || use_instance_culling != self.use_instance_culling
            || buffer_arrays_hash != self.buffer_arrays_hash
        {
            self.reset();
        }
        self.use_draw_arrays = use_draw_arrays;
        self.use_instance_culling = use_instance_culling;
        self.buffer_arrays_hash = buffer_arrays_hash;
    }

    /// Toggle tiny-primitive culling; a change marks the program dirty so
    /// the next use fetches the matching shader variant.
    pub fn set_tiny_prim_culling(&mut self, enabled: bool) {
        if self.tiny_prim_culling != enabled {
            self.tiny_prim_culling = enabled;
            self.dirty = true;
        }
    }

    pub fn tiny_prim_culling(&self) -> bool {
        self.tiny_prim_culling
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty || self.compiled.is_none()
    }

    fn reset(&mut self) {
        self.compiled = None;
        self.dirty = false;
    }

    /// Current shader key for this program.
    pub fn shader_key(&self, count_visible_instances: bool) -> CullingShaderKey {
        CullingShaderKey {
            use_draw_arrays: self.use_draw_arrays,
            use_instance_culling: self.use_instance_culling,
            count_visible_instances,
            tiny_prim_culling: self.tiny_prim_culling,
        }
    }

    /// Fetch (or lazily compile) the pipeline for the current key.
    pub fn get_or_compile(
        &mut self,
        device: &wgpu::Device,
        registry: &CullingPipelineRegistry,
        count_visible_instances: bool,
    ) -> Arc<CullingPipeline> {
        let key = self.shader_key(count_visible_instances);
        match &self.compiled {
            Some(pipeline) if !self.dirty && pipeline.key() == key => pipeline.clone(),
            _ => {
                let pipeline = registry.get_or_create(device, key);
                self.compiled = Some(pipeline.clone());
                self.dirty = false;
                pipeline
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_resets_on_mode_change() {
        let mut program = CullingProgram::new();
        program.initialize(false, true, 42);
        assert!(program.is_dirty()); // nothing compiled yet

        program.set_tiny_prim_culling(true);
        assert!(program.is_dirty());
        assert!(program.tiny_prim_culling());

        // A buffer-arrays hash change resets the whole program
        program.initialize(false, true, 43);
        assert!(program.is_dirty());
    }

    #[test]
    fn tiny_prim_toggle_is_idempotent() {
        let mut program = CullingProgram::new();
        program.set_tiny_prim_culling(false);
        assert!(!program.tiny_prim_culling());
        program.set_tiny_prim_culling(true);
        program.set_tiny_prim_culling(true);
        assert!(program.tiny_prim_culling());
    }

    #[test]
    fn shader_key_reflects_program_state() {
        let mut program = CullingProgram::new();
        program.initialize(true, false, 7);
        program.set_tiny_prim_culling(true);
        let key = program.shader_key(true);
        assert!(key.use_draw_arrays);
        assert!(!key.use_instance_culling);
        assert!(key.count_visible_instances);
        assert!(key.tiny_prim_culling);
    }
}
