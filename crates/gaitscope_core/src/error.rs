//! Error types for gaitscope_core.

use thiserror::Error;

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur in gaitscope_core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Invalid tensor shape provided.
    #[error("Invalid shape: expected {expected}, got {got}")]
    InvalidShape {
        /// Expected shape description.
        expected: String,
        /// Actual shape description.
        got: String,
    },

    /// Shape mismatch between tensors.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Dimension error.
    #[error("Dimension error: expected {expected} dimensions, got {got}")]
    DimensionError {
        /// Expected number of dimensions.
        expected: usize,
        /// Actual number of dimensions.
        got: usize,
    },

    /// A configuration value was rejected before any work started.
    #[error("Invalid configuration: `{field}` = {value} ({reason})")]
    InvalidConfig {
        /// Name of the offending field or flag.
        field: String,
        /// The offending value, rendered for the operator.
        value: String,
        /// What the value must satisfy.
        reason: String,
    },

    /// Temporal alignment could not be performed.
    #[error("Temporal alignment failed: {0}")]
    Reconciliation(String),

    /// The encoder reported a failure during a forward or backward pass.
    #[error("Encoder error: {0}")]
    Encoder(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CoreError {
    /// Build an [`CoreError::InvalidConfig`] from any displayable value.
    pub fn invalid_config(
        field: impl Into<String>,
        value: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
