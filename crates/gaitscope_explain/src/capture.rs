//! Activation and gradient capture through encoder hooks.
//!
//! [`HookRegistry`] holds the encoder's discovered layer index. Registering
//! a selection of ordinals yields a [`CaptureSession`], owned by the caller,
//! which is passed to the encoder as its [`LayerHooks`] and read back after
//! the backward pass. One session serves one sample at a time.

use burn::prelude::*;
use gaitscope_core::{GaitEncoder, LayerHooks, LayerInfo, SequenceShape, TemporalExtent, TensorLayout};

use crate::error::{ExplainError, Result};

/// Height axis of the canonical `(B, T, C, H, W)` layout.
const HEIGHT_AXIS: usize = 3;

/// Merge state of one capture buffer.
#[derive(Debug, Clone)]
enum Slot<B: Backend> {
    Empty,
    /// A single partial, possibly the first half of a height-split layer.
    Partial(Tensor<B, 5>),
    /// Two partials joined along height.
    Merged(Tensor<B, 5>),
}

/// Buffer holding at most one un-merged partial tensor.
#[derive(Debug, Clone)]
pub struct PartialBuffer<B: Backend> {
    slot: Slot<B>,
}

impl<B: Backend> PartialBuffer<B> {
    fn new() -> Self {
        Self { slot: Slot::Empty }
    }

    /// Push a canonical tensor.
    ///
    /// A push onto a pending partial concatenates along height in push
    /// order. A push onto an already merged tensor starts a fresh partial.
    fn push(&mut self, incoming: Tensor<B, 5>) -> std::result::Result<(), (SequenceShape, SequenceShape)> {
        let slot = std::mem::replace(&mut self.slot, Slot::Empty);
        self.slot = match slot {
            Slot::Empty | Slot::Merged(_) => Slot::Partial(incoming),
            Slot::Partial(stored) => {
                let stored_shape = SequenceShape::of(&stored);
                let incoming_shape = SequenceShape::of(&incoming);
                if !stored_shape.is_concat_compatible(&incoming_shape) {
                    self.slot = Slot::Partial(stored);
                    return Err((stored_shape, incoming_shape));
                }
                Slot::Merged(Tensor::cat(vec![stored, incoming], HEIGHT_AXIS))
            }
        };
        Ok(())
    }

    /// The current tensor, merged or not.
    #[must_use]
    pub fn current(&self) -> Option<&Tensor<B, 5>> {
        match &self.slot {
            Slot::Empty => None,
            Slot::Partial(t) | Slot::Merged(t) => Some(t),
        }
    }

    /// Whether the buffer holds a merged tensor.
    #[must_use]
    pub fn is_merged(&self) -> bool {
        matches!(self.slot, Slot::Merged(_))
    }

    fn take(&mut self) -> Option<Tensor<B, 5>> {
        match std::mem::replace(&mut self.slot, Slot::Empty) {
            Slot::Empty => None,
            Slot::Partial(t) | Slot::Merged(t) => Some(t),
        }
    }

    fn clear(&mut self) {
        self.slot = Slot::Empty;
    }
}

/// A hooked layer and its capture buffers.
#[derive(Debug, Clone)]
pub struct LayerHandle<B: Backend> {
    ordinal: usize,
    name: String,
    tag: String,
    temporal: TemporalExtent,
    pending_features: PartialBuffer<B>,
    pending_gradients: PartialBuffer<B>,
}

impl<B: Backend> LayerHandle<B> {
    fn new(ordinal: usize, info: &LayerInfo) -> Self {
        Self {
            ordinal,
            name: info.name.clone(),
            tag: info.tag(ordinal),
            temporal: info.temporal,
            pending_features: PartialBuffer::new(),
            pending_gradients: PartialBuffer::new(),
        }
    }

    /// 1-based position in the layer index.
    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Qualified layer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Display tag `"<ordinal>_<name>"`.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Temporal extent of the layer output.
    #[must_use]
    pub fn temporal(&self) -> TemporalExtent {
        self.temporal
    }

    /// Pending activation buffer.
    #[must_use]
    pub fn pending_features(&self) -> &PartialBuffer<B> {
        &self.pending_features
    }

    /// Pending gradient buffer.
    #[must_use]
    pub fn pending_gradients(&self) -> &PartialBuffer<B> {
        &self.pending_gradients
    }
}

/// Activation and gradient of one layer, canonical layout `(1, T, C, H, W)`.
#[derive(Debug, Clone)]
pub struct LayerCapture<B: Backend> {
    /// 1-based layer ordinal.
    pub ordinal: usize,
    /// Display tag.
    pub tag: String,
    /// Temporal extent of the layer output.
    pub temporal: TemporalExtent,
    /// Layer output.
    pub features: Tensor<B, 5>,
    /// Gradient of the attribution target w.r.t. the layer output.
    pub gradients: Tensor<B, 5>,
}

/// Capture state for one registered layer selection.
///
/// Implements [`LayerHooks`] so it can be handed straight to an encoder.
/// Hooks cannot fail from the encoder's point of view; the first capture
/// fault is kept and reported by [`CaptureSession::take_captures`].
#[derive(Debug)]
pub struct CaptureSession<B: Backend> {
    layout: TensorLayout,
    handles: Vec<LayerHandle<B>>,
    fault: Option<ExplainError>,
}

impl<B: Backend> CaptureSession<B> {
    /// Hooked layers in ascending ordinal order.
    #[must_use]
    pub fn handles(&self) -> &[LayerHandle<B>] {
        &self.handles
    }

    /// Native layout captured tensors are normalized from.
    #[must_use]
    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    /// Tags of the hooked layers in ascending ordinal order.
    #[must_use]
    pub fn tags(&self) -> Vec<&str> {
        self.handles.iter().map(|h| h.tag()).collect()
    }

    /// Drop everything captured so far and clear any fault.
    pub fn reset(&mut self) {
        for handle in &mut self.handles {
            handle.pending_features.clear();
            handle.pending_gradients.clear();
        }
        self.fault = None;
    }

    /// Take the captured activation/gradient pair of every hooked layer.
    ///
    /// Leaves the session empty and ready for the next sample.
    ///
    /// # Errors
    ///
    /// Returns the first fault recorded by a hook, or a missing or
    /// mismatched capture for any hooked layer.
    pub fn take_captures(&mut self) -> Result<Vec<LayerCapture<B>>> {
        if let Some(fault) = self.fault.take() {
            self.reset();
            return Err(fault);
        }

        let mut captures = Vec::with_capacity(self.handles.len());
        let mut failure = None;
        for handle in &mut self.handles {
            let features = handle.pending_features.take();
            let gradients = handle.pending_gradients.take();
            if failure.is_some() {
                continue;
            }
            let (features, gradients) = match (features, gradients) {
                (None, _) => {
                    failure = Some(ExplainError::MissingFeatures {
                        tag: handle.tag.clone(),
                    });
                    continue;
                }
                (Some(_), None) => {
                    failure = Some(ExplainError::MissingGradient {
                        tag: handle.tag.clone(),
                    });
                    continue;
                }
                (Some(f), Some(g)) => (f, g),
            };
            if features.dims() != gradients.dims() {
                failure = Some(ExplainError::CaptureShapeMismatch {
                    tag: handle.tag.clone(),
                    features: SequenceShape::of(&features).to_string(),
                    gradients: SequenceShape::of(&gradients).to_string(),
                });
                continue;
            }
            captures.push(LayerCapture {
                ordinal: handle.ordinal,
                tag: handle.tag.clone(),
                temporal: handle.temporal,
                features,
                gradients,
            });
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(captures),
        }
    }

    fn handle_mut(&mut self, ordinal: usize) -> Option<&mut LayerHandle<B>> {
        self.handles.iter_mut().find(|h| h.ordinal == ordinal)
    }

    fn record(&mut self, ordinal: usize, tensor: Tensor<B, 5>, gradient: bool) {
        let layout = self.layout;
        let Some(handle) = self.handle_mut(ordinal) else {
            return;
        };
        let canonical = layout.to_canonical(tensor);
        let (buffer, name) = if gradient {
            (&mut handle.pending_gradients, "gradients")
        } else {
            (&mut handle.pending_features, "features")
        };
        if let Err((stored, incoming)) = buffer.push(canonical) {
            let err = ExplainError::MergeShapeMismatch {
                tag: handle.tag.clone(),
                buffer: name,
                stored: stored.to_string(),
                incoming: incoming.to_string(),
            };
            tracing::error!("{err}");
            self.fault.get_or_insert(err);
        }
    }
}

impl<B: Backend> LayerHooks<B> for CaptureSession<B> {
    fn on_forward(&mut self, ordinal: usize, output: Tensor<B, 5>) {
        self.record(ordinal, output, false);
    }

    fn on_backward(&mut self, ordinal: usize, grad_output: Vec<Tensor<B, 5>>) {
        // Layers with several outputs report one gradient per output; the
        // first one belongs to the primary output.
        if let Some(first) = grad_output.into_iter().next() {
            self.record(ordinal, first, true);
        }
    }
}

/// Index of an encoder's leaf layers, used to register captures.
#[derive(Debug, Clone)]
pub struct HookRegistry {
    model: String,
    layout: TensorLayout,
    layers: Vec<LayerInfo>,
}

impl HookRegistry {
    /// Discover the leaf layers of an encoder.
    pub fn discover<B: Backend, E: GaitEncoder<B>>(encoder: &E) -> Self {
        let registry = Self {
            model: encoder.name().to_string(),
            layout: encoder.native_layout(),
            layers: encoder.layers(),
        };
        tracing::debug!("Layer index of {}:\n{}", registry.model, registry.to_table());
        registry
    }

    /// Build a registry from an explicit layer list.
    pub fn from_layers(model: impl Into<String>, layout: TensorLayout, layers: Vec<LayerInfo>) -> Self {
        Self {
            model: model.into(),
            layout,
            layers,
        }
    }

    /// Model name.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Number of discovered layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Check if the encoder exposes no layers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Look up a layer by 1-based ordinal.
    #[must_use]
    pub fn layer(&self, ordinal: usize) -> Option<&LayerInfo> {
        ordinal.checked_sub(1).and_then(|i| self.layers.get(i))
    }

    /// Iterate over `(ordinal, layer)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &LayerInfo)> {
        self.layers.iter().enumerate().map(|(i, l)| (i + 1, l))
    }

    /// Render the layer index as a text table for operator selection.
    #[must_use]
    pub fn to_table(&self) -> String {
        let name_width = self
            .layers
            .iter()
            .map(|l| l.name.len())
            .max()
            .unwrap_or(4)
            .max(4);
        let mut output = format!("{:>4}  {:<name_width$}  Kind\n", "Id", "Name");
        for (ordinal, layer) in self.iter() {
            let set = match layer.temporal {
                TemporalExtent::Set => " [set]",
                TemporalExtent::Sequence => "",
            };
            output.push_str(&format!(
                "{:>4}  {:<name_width$}  {}{}\n",
                ordinal, layer.name, layer.kind, set
            ));
        }
        output
    }

    /// Register hooks on the selected layers.
    ///
    /// Duplicates are removed and the selection is sorted ascending; the
    /// order of the returned handles is the order heatmaps are reported in.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::InvalidLayer`] for an ordinal outside the
    /// index and [`ExplainError::NoLayersSelected`] for an empty selection.
    pub fn register<B: Backend>(&self, ordinals: &[usize]) -> Result<CaptureSession<B>> {
        if ordinals.is_empty() {
            return Err(ExplainError::NoLayersSelected);
        }
        for &ordinal in ordinals {
            if self.layer(ordinal).is_none() {
                return Err(ExplainError::InvalidLayer {
                    ordinal,
                    available: self.layers.len(),
                });
            }
        }

        let mut selected = ordinals.to_vec();
        selected.sort_unstable();
        selected.dedup();

        let mut handles = Vec::with_capacity(selected.len());
        for ordinal in selected {
            if let Some(info) = self.layer(ordinal) {
                tracing::info!("Hooking layer {}: {}", ordinal, info.name);
                handles.push(LayerHandle::new(ordinal, info));
            }
        }

        Ok(CaptureSession {
            layout: self.layout,
            handles,
            fault: None,
        })
    }

    /// Remove the hooks of a session, releasing its buffers.
    ///
    /// The session stays usable as [`LayerHooks`] but captures nothing
    /// afterwards. Returns the number of layers that were hooked.
    pub fn remove<B: Backend>(&self, session: &mut CaptureSession<B>) -> usize {
        session.reset();
        let count = session.handles.len();
        session.handles.clear();
        tracing::debug!("Removed hooks from {} layer(s) of {}", count, self.model);
        count
    }
}
