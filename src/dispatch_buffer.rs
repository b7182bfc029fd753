//! GPU-resident dispatch buffer
//!
//! Holds the compiled command record stream plus named logical views that
//! let shaders address aggregate offsets without knowing the record layout.
//! A cull-input duplicate of the buffer exists only when GPU culling is
//! enabled: the cull pass writes into the live buffer, so its read source
//! must be a separate buffer with the same contents.

use crate::command_layout::CommandLayout;
use crate::error::{BatchError, BatchResult};

/// View names shared with the culling and drawing shaders.
pub mod views {
    pub const DRAW_DISPATCH: &str = "drawDispatch";
    pub const DRAWING_COORD0: &str = "drawingCoord0";
    pub const DRAWING_COORD1: &str = "drawingCoord1";
    pub const DRAWING_COORD2: &str = "drawingCoord2";
    pub const DRAWING_COORD_I: &str = "drawingCoordI";
    pub const DRAW_COMMAND_INDEX: &str = "drawCommandIndex";
    pub const INSTANCE_COUNT_INPUT: &str = "instanceCountInput";
}

/// A named logical view: offset within one record and component width,
/// both in u32 units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferView {
    pub name: &'static str,
    pub offset: u32,
    pub width: u32,
}

/// Views the drawing shaders consume: the indirect draw header and the
/// three drawing-coordinate blocks, plus the per-level instance
/// coordinates when instancing is nested.
pub fn draw_views(layout: &CommandLayout) -> Vec<BufferView> {
    let mut views = vec![
        BufferView {
            name: views::DRAW_DISPATCH,
            width: 1,
            offset: layout.count_offset(),
        },
        BufferView {
            name: views::DRAWING_COORD0,
            width: 4,
            offset: layout.drawing_coord0_offset(),
        },
        BufferView {
            name: views::DRAWING_COORD1,
            width: 4,
            offset: layout.drawing_coord1_offset(),
        },
        BufferView {
            name: views::DRAWING_COORD2,
            width: 2,
            offset: layout.drawing_coord2_offset(),
        },
    ];
    if layout.instancer_levels > 0 {
        views.push(BufferView {
            name: views::DRAWING_COORD_I,
            width: layout.instancer_levels,
            offset: layout.instance_coord_offset(),
        });
    }
    views
}

/// The reduced view set the culling pass reads. The dispatch header points
/// at the cull sub-header for instance culling, and drawingCoord1 narrows
/// to two components: the cull pass needs the instance-index coordinate but
/// not the shader or vertex coordinates.
pub fn cull_views(layout: &CommandLayout) -> Vec<BufferView> {
    let mut views = vec![
        BufferView {
            name: views::DRAW_DISPATCH,
            width: 1,
            offset: layout.cull_dispatch_offset(),
        },
        BufferView {
            name: views::DRAWING_COORD0,
            width: 4,
            offset: layout.drawing_coord0_offset(),
        },
    ];
    if layout.instance_culling {
        views.push(BufferView {
            name: views::DRAWING_COORD1,
            width: 2,
            offset: layout.drawing_coord1_offset(),
        });
        if layout.instancer_levels > 0 {
            views.push(BufferView {
                name: views::DRAWING_COORD_I,
                width: layout.instancer_levels,
                offset: layout.instance_coord_offset(),
            });
        }
        views.push(BufferView {
            name: views::DRAW_COMMAND_INDEX,
            width: 1,
            offset: layout.base_instance_offset(),
        });
    } else {
        views.push(BufferView {
            name: views::DRAW_COMMAND_INDEX,
            width: 1,
            offset: layout.base_instance_offset(),
        });
        views.push(BufferView {
            name: views::INSTANCE_COUNT_INPUT,
            width: 1,
            offset: layout.instance_count_offset(),
        });
    }
    views
}

/// GPU buffer holding `count` records of `command_num_uints` u32s each.
pub struct DispatchBuffer {
    buffer: wgpu::Buffer,
    count: u32,
    command_num_uints: u32,
    views: Vec<BufferView>,
}

impl DispatchBuffer {
    pub fn new(device: &wgpu::Device, label: &str, count: u32, command_num_uints: u32) -> Self {
        let size = u64::from(count) * u64::from(command_num_uints) * 4;
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::INDIRECT
                | wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            count,
            command_num_uints,
            views: Vec::new(),
        }
    }

    /// Register the named sub-views for shader consumption.
    pub fn set_views(&mut self, views: Vec<BufferView>) {
        self.views = views;
    }

    pub fn view(&self, name: &str) -> Option<BufferView> {
        self.views.iter().copied().find(|v| v.name == name)
    }

    pub fn views(&self) -> &[BufferView] {
        &self.views
    }

    /// Upload the full record stream. The stream length must match the
    /// registered record count exactly.
    pub fn upload(&self, queue: &wgpu::Queue, data: &[u32]) -> BatchResult<()> {
        let expected = (self.count * self.command_num_uints) as usize;
        if data.len() != expected {
            return Err(BatchError::UploadSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(data));
        Ok(())
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn command_num_uints(&self) -> u32 {
        self.command_num_uints
    }

    /// Byte offset of record `index`, for per-record indirect draws.
    pub fn record_byte_offset(&self, index: u32) -> u64 {
        u64::from(index) * u64::from(self.command_num_uints) * 4
    }

    pub fn as_binding(&self) -> wgpu::BindingResource {
        self.buffer.as_entire_binding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find(views: &[BufferView], name: &str) -> BufferView {
        views
            .iter()
            .copied()
            .find(|v| v.name == name)
            .unwrap_or_else(|| panic!("missing view {name}"))
    }

    #[test]
    fn draw_views_cover_the_record_header() {
        let layout = CommandLayout::new(true, true, 2);
        let v = draw_views(&layout);
        assert_eq!(find(&v, views::DRAW_DISPATCH).offset, 0);
        assert_eq!(find(&v, views::DRAWING_COORD0).offset, 9);
        assert_eq!(find(&v, views::DRAWING_COORD1).offset, 13);
        assert_eq!(find(&v, views::DRAWING_COORD2).offset, 17);
        let coord_i = find(&v, views::DRAWING_COORD_I);
        assert_eq!(coord_i.offset, 19);
        assert_eq!(coord_i.width, 2);
    }

    #[test]
    fn cull_views_point_at_the_cull_sub_header() {
        let layout = CommandLayout::new(true, true, 0);
        let v = cull_views(&layout);
        assert_eq!(find(&v, views::DRAW_DISPATCH).offset, 5);
        assert_eq!(find(&v, views::DRAWING_COORD1).width, 2);
        assert_eq!(find(&v, views::DRAW_COMMAND_INDEX).offset, 4);
        assert!(v.iter().all(|view| view.name != views::INSTANCE_COUNT_INPUT));
    }

    #[test]
    fn non_instanced_cull_views_expose_the_input_count() {
        let layout = CommandLayout::new(false, false, 0);
        let v = cull_views(&layout);
        assert_eq!(find(&v, views::DRAW_DISPATCH).offset, 0);
        assert_eq!(find(&v, views::INSTANCE_COUNT_INPUT).offset, 1);
        assert_eq!(find(&v, views::DRAW_COMMAND_INDEX).offset, 3);
    }

    #[test]
    fn no_instance_coord_view_without_nesting() {
        let layout = CommandLayout::new(false, false, 0);
        assert!(draw_views(&layout)
            .iter()
            .all(|view| view.name != views::DRAWING_COORD_I));
    }
}
