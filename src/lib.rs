//! GPU-driven indirect draw batching with frustum culling.
//!
//! Draw items that share aggregated GPU buffers are compiled into one
//! packed indirect-command stream per batch. A compute pass culls against
//! the view frustum by rewriting per-record instance counts in place, and
//! the draw executor then issues the indirect draws straight from the
//! cull-patched buffer. Per-item visibility changes patch the CPU mirror
//! in O(1) without recompiling the stream.

pub mod batch;
pub mod command_layout;
pub mod config;
pub mod culling;
pub mod dispatch_buffer;
pub mod draw_item;
pub mod error;
pub mod shader_package;

pub use batch::{
    BatchRenderStats, CullContext, DrawBindings, IndirectDrawBatch, ValidationResult,
};
pub use command_layout::{CommandLayout, EncodedCounts, NUM_DRAWING_COORDS};
pub use config::BatchConfig;
pub use culling::{
    CullParams, CullPhase, CullingPipeline, CullingPipelineRegistry, CullingProgram,
    CullingShaderKey, VisibleInstanceCounter,
};
pub use dispatch_buffer::{BufferView, DispatchBuffer};
pub use draw_item::{
    AggregationPolicy, BufferArrayRange, DrawItem, DrawItemInstance, GeometricShader,
    MaterialShader, SharedAggregatePolicy,
};
pub use error::{BatchError, BatchResult};
