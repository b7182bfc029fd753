//! Frustum culling execution
//!
//! Hosts the per-frame side of the cull: uniform parameters, the GPU
//! resources bound to a cull pass, the phase ordering for the two-phase
//! instanced engine, and the visible-instance counter readback.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use cgmath::{Matrix4, Vector2};
use futures::channel::oneshot;

use crate::dispatch_buffer::DispatchBuffer;
use crate::error::{BatchError, BatchResult};

use super::program::CullingPipeline;

const WORKGROUP_SIZE: u32 = 64;

/// Parameters for one cull pass, in host types.
#[derive(Debug, Clone, Copy)]
pub struct CullParams {
    /// View-projection matrix the bounds are tested against.
    pub cull_matrix: Matrix4<f32>,
    /// Minimum and maximum projected diameter in NDC units; only the
    /// minimum is consulted, and only when tiny-prim culling is enabled.
    pub draw_range_ndc: Vector2<f32>,
    pub command_num_uints: u32,
    pub draw_count: u32,
    pub instance_count_offset: u32,
    pub cull_instance_count_offset: u32,
    pub instance_index_dc_offset: u32,
    pub instance_index_width: u32,
}

/// GPU-side mirror of [`CullParams`]. Field order matches the WGSL
/// `CullParams` uniform struct exactly.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct CullParamsUniform {
    cull_matrix: [[f32; 4]; 4],
    draw_range_ndc: [f32; 2],
    command_num_uints: u32,
    draw_count: u32,
    instance_count_offset: u32,
    cull_instance_count_offset: u32,
    instance_index_dc_offset: u32,
    instance_index_width: u32,
}

impl CullParams {
    pub(crate) fn to_uniform(self) -> CullParamsUniform {
        CullParamsUniform {
            cull_matrix: self.cull_matrix.into(),
            draw_range_ndc: self.draw_range_ndc.into(),
            command_num_uints: self.command_num_uints,
            draw_count: self.draw_count,
            instance_count_offset: self.instance_count_offset,
            cull_instance_count_offset: self.cull_instance_count_offset,
            instance_index_dc_offset: self.instance_index_dc_offset,
            instance_index_width: self.instance_index_width,
        }
    }
}

/// Phase ordering for the two-phase instanced cull.
///
/// Counts must be zeroed before instances re-accumulate them, so the
/// reset dispatch always precedes the cull dispatch, with pass boundaries
/// providing the memory barrier in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullPhase {
    Reset,
    Cull,
    Done,
}

impl CullPhase {
    pub fn next(self) -> CullPhase {
        match self {
            CullPhase::Reset => CullPhase::Cull,
            CullPhase::Cull => CullPhase::Done,
            CullPhase::Done => CullPhase::Done,
        }
    }
}

/// Tracks how many instances survived the cull, when enabled.
///
/// The counter lives in a small storage buffer the shader accumulates
/// into; results travel through a staging buffer and a blocking map.
pub struct VisibleInstanceCounter {
    buffer: wgpu::Buffer,
    staging: wgpu::Buffer,
}

impl VisibleInstanceCounter {
    pub fn new(device: &wgpu::Device) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Visible Instance Counter"),
            size: std::mem::size_of::<u32>() as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Visible Instance Counter Staging"),
            size: std::mem::size_of::<u32>() as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self { buffer, staging }
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn reset(&self, queue: &wgpu::Queue) {
        queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(&[0u32]));
    }

    pub fn copy_to_staging(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.copy_buffer_to_buffer(
            &self.buffer,
            0,
            &self.staging,
            0,
            std::mem::size_of::<u32>() as u64,
        );
    }

    /// Block until the staged counter value is readable and return it.
    /// Only valid after the copy recorded by [`copy_to_staging`] was
    /// submitted.
    ///
    /// [`copy_to_staging`]: Self::copy_to_staging
    pub fn read_back(&self, device: &wgpu::Device) -> BatchResult<u32> {
        let slice = self.staging.slice(..);
        let (tx, rx) = oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device.poll(wgpu::Maintain::Wait);

        match pollster::block_on(rx) {
            Ok(Ok(())) => {
                let count = {
                    let data = slice.get_mapped_range();
                    bytemuck::cast_slice::<u8, u32>(&data)[0]
                };
                self.staging.unmap();
                Ok(count)
            }
            _ => Err(BatchError::ReadbackFailed),
        }
    }
}

/// GPU resources bound into a cull pass for one batch.
pub struct CullResources {
    params_buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

impl CullResources {
    /// Assemble the bind group for a cull pass. Created once per pipeline
    /// variant and reused across frames; only the uniform contents change
    /// per frame. `instance_data` must be present exactly when the
    /// pipeline variant performs instance culling; the counter binding
    /// falls back to a dummy slot-sized buffer when counting is disabled.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &wgpu::Device,
        pipeline: &CullingPipeline,
        dispatch: &DispatchBuffer,
        cull_input: &DispatchBuffer,
        item_bounds: &wgpu::Buffer,
        instance_data: Option<&wgpu::Buffer>,
        counter: &VisibleInstanceCounter,
    ) -> BatchResult<Self> {
        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Cull Params"),
            size: std::mem::size_of::<CullParamsUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: params_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: cull_input.as_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: dispatch.as_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: item_bounds.as_entire_binding(),
            },
        ];
        if pipeline.key().use_instance_culling {
            let instance_data = instance_data.ok_or(BatchError::MissingInstanceData)?;
            entries.push(wgpu::BindGroupEntry {
                binding: 4,
                resource: instance_data.as_entire_binding(),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: 5,
                resource: counter.buffer().as_entire_binding(),
            });
        } else {
            entries.push(wgpu::BindGroupEntry {
                binding: 4,
                resource: counter.buffer().as_entire_binding(),
            });
        }

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Cull Bind Group"),
            layout: &pipeline.bind_group_layout,
            entries: &entries,
        });

        Ok(Self {
            params_buffer,
            bind_group,
        })
    }

    pub fn upload_params(&self, queue: &wgpu::Queue, params: &CullParams) {
        queue.write_buffer(
            &self.params_buffer,
            0,
            bytemuck::cast_slice(&[params.to_uniform()]),
        );
    }
}

fn workgroups_for(draw_count: u32) -> u32 {
    draw_count.div_ceil(WORKGROUP_SIZE)
}

/// Record the two-phase instanced cull: one pass zeroing the live counts,
/// a second pass re-accumulating them. The pass boundary orders the
/// writes; the phase value walks Reset then Cull so neither dispatch can
/// be skipped or reordered.
pub fn run_instance_culling(
    encoder: &mut wgpu::CommandEncoder,
    pipeline: &Arc<CullingPipeline>,
    resources: &CullResources,
    draw_count: u32,
) -> BatchResult<()> {
    let reset = pipeline
        .reset_pipeline
        .as_ref()
        .ok_or(BatchError::NotCompiled)?;

    let mut phase = CullPhase::Reset;
    while phase != CullPhase::Done {
        let (label, compute) = match phase {
            CullPhase::Reset => ("Cull Reset Pass", reset),
            CullPhase::Cull => ("Cull Pass", &pipeline.cull_pipeline),
            CullPhase::Done => unreachable!(),
        };
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(compute);
        pass.set_bind_group(0, &resources.bind_group, &[]);
        // One workgroup per record; threads within it stride the instances.
        pass.dispatch_workgroups(draw_count, 1, 1);
        drop(pass);
        phase = phase.next();
    }
    Ok(())
}

/// Record the single-phase non-instanced cull: one invocation per record.
pub fn run_non_instance_culling(
    encoder: &mut wgpu::CommandEncoder,
    pipeline: &Arc<CullingPipeline>,
    resources: &CullResources,
    draw_count: u32,
) {
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some("Cull Pass"),
        timestamp_writes: None,
    });
    pass.set_pipeline(&pipeline.cull_pipeline);
    pass.set_bind_group(0, &resources.bind_group, &[]);
    pass.dispatch_workgroups(workgroups_for(draw_count), 1, 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::SquareMatrix;

    #[test]
    fn phase_order_is_reset_then_cull_then_done() {
        let phase = CullPhase::Reset;
        let phase = phase.next();
        assert_eq!(phase, CullPhase::Cull);
        let phase = phase.next();
        assert_eq!(phase, CullPhase::Done);
        assert_eq!(phase.next(), CullPhase::Done);
    }

    #[test]
    fn uniform_layout_matches_shader_struct() {
        // mat4x4 (64) + vec2 (8) + six u32 fields (24)
        assert_eq!(std::mem::size_of::<CullParamsUniform>(), 96);
    }

    #[test]
    fn uniform_mirrors_params() {
        let params = CullParams {
            cull_matrix: Matrix4::identity(),
            draw_range_ndc: Vector2::new(0.01, 1.0),
            command_num_uints: 19,
            draw_count: 3,
            instance_count_offset: 1,
            cull_instance_count_offset: 6,
            instance_index_dc_offset: 14,
            instance_index_width: 2,
        };
        let uniform = params.to_uniform();
        assert_eq!(uniform.command_num_uints, 19);
        assert_eq!(uniform.draw_count, 3);
        assert_eq!(uniform.cull_instance_count_offset, 6);
        assert_eq!(uniform.instance_index_width, 2);
        assert_eq!(uniform.draw_range_ndc, [0.01, 1.0]);
    }

    #[test]
    fn workgroup_count_covers_all_records() {
        assert_eq!(workgroups_for(1), 1);
        assert_eq!(workgroups_for(64), 1);
        assert_eq!(workgroups_for(65), 2);
        assert_eq!(workgroups_for(0), 0);
    }
}
