//! Encoder capability traits.
//!
//! gaitscope never owns the network it explains. An encoder exposes its
//! leaf layers, runs forward and backward passes, and reports each leaf
//! layer's output and output-gradient to a [`LayerHooks`] implementation
//! supplied by the caller.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::shape::TensorLayout;

/// Whether a layer's output still carries the temporal axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TemporalExtent {
    /// One slot per (possibly compressed) time step.
    #[default]
    Sequence,
    /// Output of a set-level operation; reported with a time axis of length 1.
    Set,
}

/// Description of one leaf layer as enumerated by the encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    /// Fully qualified module path, e.g. `backbone.conv1`.
    pub name: String,
    /// Short description of the operation, e.g. `Conv3d(1, 32, 3)`.
    pub kind: String,
    /// Temporal extent of the output.
    #[serde(default)]
    pub temporal: TemporalExtent,
}

impl LayerInfo {
    /// Create a sequence-level layer description.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            temporal: TemporalExtent::Sequence,
        }
    }

    /// Mark the layer as a set-level (time-free) operation.
    #[must_use]
    pub fn set_level(mut self) -> Self {
        self.temporal = TemporalExtent::Set;
        self
    }

    /// Display tag `"<ordinal>_<name with '.' replaced by '-'>"`.
    #[must_use]
    pub fn tag(&self, ordinal: usize) -> String {
        format!("{}_{}", ordinal, self.name.replace('.', "-"))
    }
}

/// Interceptor invoked by an encoder for every leaf layer.
///
/// Ordinals are 1-based positions in [`GaitEncoder::layers`]. Tensors are
/// passed in the encoder's native layout. A layer that processes its input
/// in height-wise partitions calls the hook once per partition.
pub trait LayerHooks<B: Backend> {
    /// Called with a layer's output after each raw forward invocation.
    fn on_forward(&mut self, ordinal: usize, output: Tensor<B, 5>);

    /// Called with the gradients w.r.t. a layer's output(s) after each raw
    /// backward invocation.
    fn on_backward(&mut self, ordinal: usize, grad_output: Vec<Tensor<B, 5>>);
}

/// Hooks that observe nothing, used for plain inference.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl<B: Backend> LayerHooks<B> for NoHooks {
    fn on_forward(&mut self, _ordinal: usize, _output: Tensor<B, 5>) {}

    fn on_backward(&mut self, _ordinal: usize, _grad_output: Vec<Tensor<B, 5>>) {}
}

/// Result of one forward pass.
#[derive(Debug)]
pub struct ForwardPass<B: Backend, T> {
    /// Final descriptor of shape `(1, channels, parts)`.
    pub descriptor: Tensor<B, 3>,
    /// Whatever the encoder needs to run the matching backward pass.
    pub tape: T,
}

/// A pretrained gait encoder operating on silhouette sequences.
pub trait GaitEncoder<B: Backend> {
    /// State retained between a forward pass and its backward pass.
    type Tape;

    /// Model name used when naming persisted results.
    fn name(&self) -> &str;

    /// Native axis order of 5D layer outputs. Queried once when hooks are
    /// registered.
    fn native_layout(&self) -> TensorLayout {
        TensorLayout::TimeFirst
    }

    /// Leaf layers in module order.
    fn layers(&self) -> Vec<LayerInfo>;

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `frames` - Silhouettes of shape `(T, 1, H, W)` with values in `[0, 1]`
    /// * `hooks` - Interceptor notified for every leaf layer
    fn forward(
        &self,
        frames: Tensor<B, 4>,
        hooks: &mut dyn LayerHooks<B>,
    ) -> Result<ForwardPass<B, Self::Tape>>;

    /// Backward pass seeded with `∂target/∂descriptor`.
    fn backward(
        &self,
        tape: Self::Tape,
        seed: Tensor<B, 3>,
        hooks: &mut dyn LayerHooks<B>,
    ) -> Result<()>;
}
