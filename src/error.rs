//! Batch subsystem error handling
//!
//! Internal-consistency faults are surfaced to the caller as a failed batch
//! rather than corrupting GPU state. Recovery is delegated upward as a
//! rebuild decision; no retries happen inside this crate.

use thiserror::Error;

/// Type alias for batch operation results
pub type BatchResult<T> = Result<T, BatchError>;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch contains no draw item instances")]
    EmptyBatch,

    #[error("compiled command stream length mismatch: expected {expected} uints, got {actual}")]
    CommandStreamMismatch { expected: usize, actual: usize },

    #[error("draw item {item} has no geometric shader")]
    MissingGeometricShader { item: usize },

    #[error("draw item {item} instancer depth {actual} does not match batch depth {expected}")]
    InstancerLevelMismatch {
        item: usize,
        expected: usize,
        actual: usize,
    },

    #[error("draw item {item} is not aggregated with the batch representative")]
    NotAggregated { item: usize },

    #[error("batch index {index} out of range ({count} items)")]
    InstanceIndexOutOfRange { index: usize, count: usize },

    #[error("batch has not been compiled yet")]
    NotCompiled,

    #[error("per-instance culling requires instance transform data")]
    MissingInstanceData,

    #[error("dispatch buffer upload size mismatch: expected {expected} uints, got {actual}")]
    UploadSizeMismatch { expected: usize, actual: usize },

    #[error("visible instance counter readback failed")]
    ReadbackFailed,

    #[error("indexed batch drawn without an index buffer")]
    MissingIndexBuffer,
}
