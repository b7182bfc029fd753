//! GPU frustum culling
//!
//! The cull pass rewrites per-record instance counts directly inside the
//! dispatch buffer before the draw executes. Two engines exist, selected
//! once per batch: a two-phase instanced variant (reset, barrier, cull,
//! barrier) and a single-phase non-instanced variant. Compiled pipelines
//! are shared across batches through a registry keyed by configuration.

pub mod frustum;
pub mod program;

pub use frustum::{CullParams, CullPhase, CullResources, VisibleInstanceCounter};
pub use program::{CullingPipeline, CullingPipelineRegistry, CullingProgram, CullingShaderKey};
