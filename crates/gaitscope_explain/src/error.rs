//! Error types for gaitscope_explain.

use thiserror::Error;

/// Result type alias using [`ExplainError`].
pub type Result<T> = std::result::Result<T, ExplainError>;

/// Errors that can occur while capturing, attributing or persisting.
#[derive(Error, Debug)]
pub enum ExplainError {
    /// A requested layer ordinal is not in the discovered layer index.
    #[error("Layer {ordinal} is invalid; the encoder exposes layers 1..={available}")]
    InvalidLayer {
        /// The offending ordinal.
        ordinal: usize,
        /// Number of discovered layers.
        available: usize,
    },

    /// No layer was selected for capture.
    #[error("No layer selected for capture")]
    NoLayersSelected,

    /// A hooked layer produced no activation during the forward pass.
    #[error("Layer {tag} produced no activation during the forward pass")]
    MissingFeatures {
        /// Display tag of the layer.
        tag: String,
    },

    /// A hooked layer received no gradient during the backward pass.
    #[error("Layer {tag} received no gradient during the backward pass")]
    MissingGradient {
        /// Display tag of the layer.
        tag: String,
    },

    /// Two partial tensors of one layer could not be joined along height.
    #[error("Cannot merge partial {buffer} of layer {tag}: stored {stored}, incoming {incoming}")]
    MergeShapeMismatch {
        /// Display tag of the layer.
        tag: String,
        /// Which buffer (`features` or `gradients`).
        buffer: &'static str,
        /// Shape of the stored partial.
        stored: String,
        /// Shape of the incoming partial.
        incoming: String,
    },

    /// Captured activation and gradient disagree in shape.
    #[error("Layer {tag}: features {features} and gradients {gradients} differ in shape")]
    CaptureShapeMismatch {
        /// Display tag of the layer.
        tag: String,
        /// Feature shape.
        features: String,
        /// Gradient shape.
        gradients: String,
    },

    /// The gallery descriptor set is empty.
    #[error("Gallery descriptor set is empty")]
    EmptyGallery,

    /// Probe and gallery descriptors are not comparable.
    #[error("Descriptor mismatch: {0}")]
    DescriptorMismatch(String),

    /// Heatmaps were pushed out of ascending layer order.
    #[error("Layer {ordinal} pushed after layer {last}; heatmaps must follow ascending layer order")]
    LayerOrder {
        /// Ordinal being pushed.
        ordinal: usize,
        /// Last ordinal already in the bundle.
        last: usize,
    },

    /// A bundle is malformed.
    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),

    /// Reading or writing an npz archive failed.
    #[error("Archive error: {0}")]
    Archive(String),

    /// Core error.
    #[error("Core error: {0}")]
    CoreError(#[from] gaitscope_core::CoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
