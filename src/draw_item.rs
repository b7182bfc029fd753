//! Draw items and their aggregated buffer ranges
//!
//! A draw item describes one drawable surface through non-owning handles
//! into aggregated GPU buffers. The batch never mutates the ranges, it only
//! reads offsets and counts from them; the aggregation subsystem that packs
//! items into shared buffers lives outside this crate and is consumed here
//! as an opaque predicate (`AggregationPolicy`).

use std::hash::Hasher;
use std::sync::Arc;

use rustc_hash::FxHasher;

/// Order-dependent 64-bit hash combine.
pub(crate) fn combine_hash(seed: u64, value: u64) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_u64(seed);
    hasher.write_u64(value);
    hasher.finish()
}

/// A handle into a larger aggregated GPU buffer.
///
/// `aggregate_id` identifies the owning aggregate; two ranges with the same
/// id live in the same GPU buffer. `element_offset` is the range's position
/// within the aggregate, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferArrayRange {
    pub aggregate_id: u64,
    pub element_offset: u32,
    pub num_elements: u32,
}

impl BufferArrayRange {
    pub fn new(aggregate_id: u64, element_offset: u32, num_elements: u32) -> Self {
        Self {
            aggregate_id,
            element_offset,
            num_elements,
        }
    }

    /// Whether `other` lives in the same aggregate as this range.
    pub fn is_aggregated_with(&self, other: Option<&BufferArrayRange>) -> bool {
        other.map_or(false, |o| o.aggregate_id == self.aggregate_id)
    }
}

/// Element offset of a possibly-absent range; absent ranges draw at offset 0.
pub(crate) fn element_offset(range: Option<&BufferArrayRange>) -> u32 {
    range.map_or(0, |r| r.element_offset)
}

/// Handle to the geometric shader that draws the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometricShader {
    pub id: u64,
    /// Indices per primitive: 3 for triangles, 4 for quads, n for patches.
    pub primitive_index_size: u32,
}

impl GeometricShader {
    pub fn new(id: u64, primitive_index_size: u32) -> Self {
        Self {
            id,
            primitive_index_size,
        }
    }
}

/// Handle to the material/shader-data of the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaterialShader {
    pub id: u64,
    /// Aggregated shader parameter data; absent ranges get a zero offset.
    pub shader_data: Option<BufferArrayRange>,
}

/// Immutable-per-frame descriptor of one drawable surface.
///
/// All ranges are optional; a missing range contributes a zero drawing
/// coordinate rather than skipping the item.
#[derive(Debug, Clone, Default)]
pub struct DrawItem {
    pub constant_range: Option<BufferArrayRange>,
    pub vertex_range: Option<BufferArrayRange>,
    pub varying_range: Option<BufferArrayRange>,
    /// Per-face (element) primvar data
    pub element_range: Option<BufferArrayRange>,
    pub fvar_range: Option<BufferArrayRange>,
    /// Index buffer; absent means the batch draws arrays
    pub topology_range: Option<BufferArrayRange>,
    pub topology_visibility_range: Option<BufferArrayRange>,
    /// One range per instancer nesting level
    pub instance_primvar_ranges: Vec<Option<BufferArrayRange>>,
    pub instance_index_range: Option<BufferArrayRange>,
    pub geometric_shader: Option<GeometricShader>,
    pub material_shader: MaterialShader,
    /// Hash of the owning aggregated buffer set; changes when buffers are
    /// reallocated or migrated
    pub buffer_arrays_hash: u64,
}

impl DrawItem {
    pub fn instancer_num_levels(&self) -> usize {
        self.instance_primvar_ranges.len()
    }

    /// Hash of every element offset within the item's aggregates. Used by
    /// deep validation to detect offsets moving inside otherwise-compatible
    /// aggregates.
    pub fn element_offsets_hash(&self) -> u64 {
        let mut hash = 0u64;
        hash = combine_hash(hash, u64::from(element_offset(self.constant_range.as_ref())));
        hash = combine_hash(hash, u64::from(element_offset(self.vertex_range.as_ref())));
        hash = combine_hash(hash, u64::from(element_offset(self.varying_range.as_ref())));
        hash = combine_hash(hash, u64::from(element_offset(self.element_range.as_ref())));
        hash = combine_hash(hash, u64::from(element_offset(self.fvar_range.as_ref())));
        hash = combine_hash(hash, u64::from(element_offset(self.topology_range.as_ref())));
        hash = combine_hash(
            hash,
            u64::from(element_offset(self.topology_visibility_range.as_ref())),
        );
        hash = combine_hash(
            hash,
            u64::from(element_offset(self.instance_index_range.as_ref())),
        );
        hash = combine_hash(
            hash,
            u64::from(element_offset(self.material_shader.shader_data.as_ref())),
        );
        for level in &self.instance_primvar_ranges {
            hash = combine_hash(hash, u64::from(element_offset(level.as_ref())));
        }
        hash
    }
}

/// Wraps a draw item with a mutable visibility flag and its slot in the
/// owning batch's command stream. Created by the scene layer; the batch
/// only observes it.
#[derive(Debug, Clone)]
pub struct DrawItemInstance {
    pub item: Arc<DrawItem>,
    pub visible: bool,
    batch_index: u32,
}

impl DrawItemInstance {
    pub fn new(item: Arc<DrawItem>, visible: bool) -> Self {
        Self {
            item,
            visible,
            batch_index: 0,
        }
    }

    /// Stable index of this instance's command record within its batch.
    pub fn batch_index(&self) -> u32 {
        self.batch_index
    }

    pub(crate) fn set_batch_index(&mut self, index: u32) {
        self.batch_index = index;
    }
}

/// External policy deciding whether two draw items share compatible
/// aggregated memory. Failing this predicate requires re-partitioning all
/// batches, not just recompiling one.
pub trait AggregationPolicy: Send + Sync {
    fn is_aggregated(&self, a: &DrawItem, b: &DrawItem) -> bool;
}

/// Default policy: two items aggregate when every buffer role either is
/// absent on both or lives in the same aggregate, and their instancer
/// nesting depths match.
#[derive(Debug, Default)]
pub struct SharedAggregatePolicy;

fn same_aggregate(a: Option<&BufferArrayRange>, b: Option<&BufferArrayRange>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.aggregate_id == b.aggregate_id,
        (None, None) => true,
        _ => false,
    }
}

impl AggregationPolicy for SharedAggregatePolicy {
    fn is_aggregated(&self, a: &DrawItem, b: &DrawItem) -> bool {
        if a.instancer_num_levels() != b.instancer_num_levels() {
            return false;
        }
        same_aggregate(a.constant_range.as_ref(), b.constant_range.as_ref())
            && same_aggregate(a.vertex_range.as_ref(), b.vertex_range.as_ref())
            && same_aggregate(a.varying_range.as_ref(), b.varying_range.as_ref())
            && same_aggregate(a.element_range.as_ref(), b.element_range.as_ref())
            && same_aggregate(a.fvar_range.as_ref(), b.fvar_range.as_ref())
            && same_aggregate(a.topology_range.as_ref(), b.topology_range.as_ref())
            && same_aggregate(
                a.topology_visibility_range.as_ref(),
                b.topology_visibility_range.as_ref(),
            )
            && same_aggregate(
                a.instance_index_range.as_ref(),
                b.instance_index_range.as_ref(),
            )
            && a.instance_primvar_ranges
                .iter()
                .zip(&b.instance_primvar_ranges)
                .all(|(x, y)| same_aggregate(x.as_ref(), y.as_ref()))
    }
}
