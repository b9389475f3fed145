//! Error types for gaitscope_analysis.

use thiserror::Error;

/// Result type alias using [`AnalysisError`].
pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Errors that can occur while streaming, reducing or persisting embeddings.
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// The reducer ran out of memory on a bucket.
    ///
    /// Not retried: bucket capacity is an operator trade-off.
    #[error(
        "Reducer exhausted its resources on bucket {bucket} ({records} records, capacity {capacity}): {message}; \
         rerun with a smaller bucket capacity"
    )]
    ResourceExhausted {
        /// 0-based bucket index.
        bucket: usize,
        /// Records in the bucket.
        records: usize,
        /// Configured bucket capacity.
        capacity: usize,
        /// Message reported by the reducer.
        message: String,
    },

    /// Records were dropped or duplicated between producer and result.
    #[error("Record count mismatch: {emitted} emitted, {received} received")]
    CountMismatch {
        /// Records the producer emitted.
        emitted: usize,
        /// Records that reached the result.
        received: usize,
    },

    /// The reducer failed for a reason other than exhaustion.
    #[error("Reduction failed on bucket {bucket}: {message}")]
    Reduction {
        /// 0-based bucket index.
        bucket: usize,
        /// Message reported by the reducer.
        message: String,
    },

    /// Descriptors within a stream differ in length.
    #[error("Descriptor mismatch: {0}")]
    DescriptorMismatch(String),

    /// The producer stopped without sending the end-of-stream marker.
    #[error("Record stream closed before end of stream")]
    StreamClosed,

    /// The consumer stopped accepting records.
    #[error("Embedding consumer stopped accepting records")]
    ConsumerStopped,

    /// The consumer thread panicked.
    #[error("Embedding consumer panicked: {0}")]
    ConsumerPanicked(String),

    /// Reading or writing an npz archive failed.
    #[error("Archive error: {0}")]
    Archive(String),

    /// Core error, including configuration errors.
    #[error("Core error: {0}")]
    CoreError(#[from] gaitscope_core::CoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
