//! Packed indirect draw command layout
//!
//! One draw command record is a fixed tuple of u32 fields followed by one
//! drawing coordinate per instancer nesting level. Four shapes exist,
//! selected by (draw-arrays vs draw-elements) x (instance culling on/off);
//! they are expressed here as a single layout value parameterized by those
//! two booleans rather than four duplicated structs. Field order is the wire
//! format shared with the culling and drawing shaders; the reserved padding
//! field in the simplest shape carries no data but must be preserved so that
//! configuration changes cannot silently alter pipeline state between
//! otherwise-identical shapes.

use crate::draw_item::{element_offset, DrawItem};
use crate::error::{BatchError, BatchResult};

/// Number of drawing-coordinate fields in every record shape:
/// model, constant, element, primitive, fvar, instanceIndex, shader,
/// vertex, topologyVisibility, varying.
pub const NUM_DRAWING_COORDS: u32 = 10;

/// Per-item counters accumulated while encoding a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodedCounts {
    pub num_elements: u32,
    pub vertex_count: u32,
    pub instance_count: u32,
}

/// The shape of one command record, fixed per batch at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandLayout {
    /// Draw-elements (index buffer present) vs draw-arrays
    pub indexed: bool,
    /// Whether the record carries the cull sub-header
    pub instance_culling: bool,
    /// Instancer nesting depth shared by every item in the batch
    pub instancer_levels: u32,
}

impl CommandLayout {
    pub fn new(indexed: bool, instance_culling: bool, instancer_levels: u32) -> Self {
        Self {
            indexed,
            instance_culling,
            instancer_levels,
        }
    }

    /// Fixed header size in u32 units: 15, 18, 15 or 19.
    pub fn header_uints(&self) -> u32 {
        self.drawing_coord0_offset() + NUM_DRAWING_COORDS
    }

    /// Total record size in u32 units, including per-level coordinates.
    pub fn num_uints(&self) -> u32 {
        self.header_uints() + self.instancer_levels
    }

    /// Offset of the indirect draw `count` field. Always first.
    pub fn count_offset(&self) -> u32 {
        0
    }

    /// Offset of the live `instanceCount` field, patched by incremental
    /// visibility updates and by the culling shader.
    pub fn instance_count_offset(&self) -> u32 {
        1
    }

    /// Offset of the `baseInstance` field, which doubles as the draw
    /// command index read by the culling pass.
    pub fn base_instance_offset(&self) -> u32 {
        if self.indexed {
            4
        } else {
            3
        }
    }

    /// Offset of the reserved padding field; present only in the
    /// draw-arrays, non-culled shape.
    pub fn reserved_offset(&self) -> Option<u32> {
        (!self.indexed && !self.instance_culling).then_some(4)
    }

    /// Offset of the cull sub-header (`cullCount`), when present.
    pub fn cull_count_offset(&self) -> Option<u32> {
        self.instance_culling
            .then(|| self.base_instance_offset() + 1)
    }

    /// Offset of the `cullInstanceCount` field. Identical to the live
    /// instance count slot when instance culling is off, so incremental
    /// patches can unconditionally write both.
    pub fn cull_instance_count_offset(&self) -> u32 {
        match self.cull_count_offset() {
            Some(cull_count) => cull_count + 1,
            None => self.instance_count_offset(),
        }
    }

    /// Offset of the first drawing coordinate (`modelDC`).
    pub fn drawing_coord0_offset(&self) -> u32 {
        match (self.indexed, self.instance_culling) {
            (false, false) => 5,
            (false, true) => 8,
            (true, false) => 5,
            (true, true) => 9,
        }
    }

    /// Offset of the second drawing coordinate block (`fvarDC`).
    pub fn drawing_coord1_offset(&self) -> u32 {
        self.drawing_coord0_offset() + 4
    }

    /// Offset of the third drawing coordinate block (`topologyVisibilityDC`).
    pub fn drawing_coord2_offset(&self) -> u32 {
        self.drawing_coord0_offset() + 8
    }

    /// Offset of the `instanceIndexDC` drawing coordinate.
    pub fn instance_index_dc_offset(&self) -> u32 {
        self.drawing_coord1_offset() + 1
    }

    /// Offset of the per-level instance coordinates appended after the
    /// fixed header.
    pub fn instance_coord_offset(&self) -> u32 {
        self.header_uints()
    }

    /// Offset the cull pass treats as its indirect draw header: the cull
    /// sub-header when instance culling is on, the live header otherwise.
    pub fn cull_dispatch_offset(&self) -> u32 {
        self.cull_count_offset().unwrap_or(0)
    }

    /// Instance index width: elements per instance in the instance-index
    /// indirection range.
    pub fn instance_index_width(&self) -> u32 {
        self.instancer_levels + 1
    }

    /// Encode one item's record, appending exactly `num_uints` values.
    ///
    /// `base_instance` is the item's slot in the batch; the culling shader
    /// uses it to locate the record it rewrites.
    pub fn encode_item(
        &self,
        item: &DrawItem,
        visible: bool,
        base_instance: u32,
        item_index: usize,
        out: &mut Vec<u32>,
    ) -> BatchResult<EncodedCounts> {
        let shader = item
            .geometric_shader
            .ok_or(BatchError::MissingGeometricShader { item: item_index })?;
        if item.instancer_num_levels() != self.instancer_levels as usize {
            return Err(BatchError::InstancerLevelMismatch {
                item: item_index,
                expected: self.instancer_levels as usize,
                actual: item.instancer_num_levels(),
            });
        }

        let index_bar = item.topology_range.as_ref();
        let vertex_bar = item.vertex_range.as_ref();
        let num_indices_per_primitive = shader.primitive_index_size;

        let mut num_elements = index_bar.map_or(0, |r| r.num_elements);
        let vertex_offset = element_offset(vertex_bar);
        let vertex_count = vertex_bar.map_or(0, |r| r.num_elements);
        // An empty vertex range means the data source never produced
        // primvars; force the element count to zero rather than draw
        // uninitialized vertices.
        if vertex_count == 0 {
            num_elements = 0;
        }

        // Drawing coordinates
        let model_dc = 0; // reserved for future extension
        let constant_dc = element_offset(item.constant_range.as_ref());
        let element_dc = element_offset(item.element_range.as_ref());
        let primitive_dc = element_offset(index_bar);
        let fvar_dc = element_offset(item.fvar_range.as_ref());
        let instance_index_dc = element_offset(item.instance_index_range.as_ref());
        let shader_dc = element_offset(item.material_shader.shader_data.as_ref());
        let vertex_dc = vertex_offset;
        let topology_visibility_dc = element_offset(item.topology_visibility_range.as_ref());
        let varying_dc = element_offset(item.varying_range.as_ref());

        let indices_count = num_elements * num_indices_per_primitive;
        // An instance-index range can exist yet be empty; the count must
        // then be 0, not 1, or the culling shader would write one result
        // out of bounds. No range at all means a single non-instanced draw.
        let mut instance_count = item
            .instance_index_range
            .as_ref()
            .map_or(1, |r| r.num_elements / self.instance_index_width());
        if !visible {
            instance_count = 0;
        }
        let first_index =
            index_bar.map_or(0, |r| r.element_offset * num_indices_per_primitive);

        if self.indexed {
            out.push(indices_count);
            out.push(instance_count);
            out.push(first_index);
            out.push(vertex_offset); // baseVertex
            out.push(base_instance);
        } else {
            out.push(vertex_count);
            out.push(instance_count);
            out.push(vertex_offset); // first
            out.push(base_instance);
        }
        if self.instance_culling {
            out.push(1); // cullCount, always one draw-call-worth of work
            out.push(instance_count); // cullInstanceCount
            out.push(0); // cullFirstVertex (not used)
            out.push(base_instance); // cullBaseInstance
        } else if !self.indexed {
            out.push(0); // reserved padding, part of the wire format
        }
        out.push(model_dc);
        out.push(constant_dc);
        out.push(element_dc);
        out.push(primitive_dc);
        out.push(fvar_dc);
        out.push(instance_index_dc);
        out.push(shader_dc);
        out.push(vertex_dc);
        out.push(topology_visibility_dc);
        out.push(varying_dc);
        for level in &item.instance_primvar_ranges {
            out.push(element_offset(level.as_ref()));
        }

        Ok(EncodedCounts {
            num_elements,
            vertex_count,
            instance_count,
        })
    }
}
