//! Samples, sample sinks and the forward-pass driver.

use burn::prelude::*;
use ndarray::{Array3, Array4, Axis};
use serde::{Deserialize, Serialize};

use crate::encoder::{ForwardPass, GaitEncoder, LayerHooks, NoHooks};
use crate::error::{CoreError, Result};

/// Identity of one gait sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceKey {
    /// Subject identifier.
    pub subject: String,
    /// Walking condition, e.g. `nm-01`.
    pub condition: String,
    /// Camera view, e.g. `090`.
    pub view: String,
}

impl SequenceKey {
    /// Create a new key.
    pub fn new(
        subject: impl Into<String>,
        condition: impl Into<String>,
        view: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            condition: condition.into(),
            view: view.into(),
        }
    }
}

impl std::fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.subject, self.condition, self.view)
    }
}

/// One silhouette sequence as yielded by a sample source.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Sequence identity.
    pub key: SequenceKey,
    /// Silhouettes of shape `(T, H, W)` with values in `[0, 1]`.
    pub frames: Array3<f32>,
}

impl Sample {
    /// Create a new sample.
    ///
    /// # Errors
    ///
    /// Returns an error if the sequence has no frames or empty frames.
    pub fn new(key: SequenceKey, frames: Array3<f32>) -> Result<Self> {
        let (t, h, w) = frames.dim();
        if t == 0 || h == 0 || w == 0 {
            return Err(CoreError::InvalidShape {
                expected: "(T>0, H>0, W>0)".to_string(),
                got: format!("({t}, {h}, {w})"),
            });
        }
        Ok(Self { key, frames })
    }

    /// Label used for embeddings (the subject).
    #[must_use]
    pub fn label(&self) -> &str {
        &self.key.subject
    }

    /// Number of frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len_of(Axis(0))
    }

    /// Check if the sample holds no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encoder input of shape `(T, 1, H, W)`.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        let (t, h, w) = self.frames.dim();
        let values: Vec<f32> = self.frames.iter().copied().collect();
        Tensor::from_data(TensorData::new(values, [t, 1, h, w]), device)
    }

    /// Frames as 8-bit RGB images `(T, H, W, 3)`, grayscale replicated
    /// over the three channels.
    #[must_use]
    pub fn rgb_frames(&self) -> Array4<u8> {
        let (t, h, w) = self.frames.dim();
        Array4::from_shape_fn((t, h, w, 3), |(i, y, x, _)| {
            (self.frames[[i, y, x]] * 255.0).round().clamp(0.0, 255.0) as u8
        })
    }
}

/// Per-use-case behaviour plugged into the [`InferenceDriver`].
///
/// A sink decides whether the forward pass is observed (by returning hooks)
/// and what happens with its result.
pub trait SampleSink<B: Backend, E: GaitEncoder<B>> {
    /// Error type surfaced by this sink.
    type Error: From<CoreError>;

    /// Called before the sample's forward pass.
    fn before_sample(&mut self, _sample: &Sample) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    /// Hooks observing the forward pass, if any.
    fn hooks(&mut self) -> Option<&mut dyn LayerHooks<B>> {
        None
    }

    /// Called with the completed forward pass.
    fn on_sample(
        &mut self,
        encoder: &E,
        pass: ForwardPass<B, E::Tape>,
        sample: &Sample,
    ) -> std::result::Result<(), Self::Error>;
}

/// Drives sequential forward passes over a sample source.
///
/// Samples are processed strictly in source order, one at a time, so a
/// sink never sees a second forward pass before it has finished with the
/// first.
pub struct InferenceDriver<'a, B: Backend, E: GaitEncoder<B>> {
    encoder: &'a E,
    device: B::Device,
}

impl<'a, B: Backend, E: GaitEncoder<B>> InferenceDriver<'a, B, E> {
    /// Create a driver for an encoder on a device.
    pub fn new(encoder: &'a E, device: B::Device) -> Self {
        Self { encoder, device }
    }

    /// The driven encoder.
    #[must_use]
    pub fn encoder(&self) -> &E {
        self.encoder
    }

    /// The device inputs are created on.
    #[must_use]
    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Run one forward pass per sample and hand each to the sink.
    ///
    /// Returns the number of samples processed.
    pub fn run<I, S>(&self, samples: I, sink: &mut S) -> std::result::Result<usize, S::Error>
    where
        I: IntoIterator<Item = Sample>,
        S: SampleSink<B, E>,
    {
        let mut processed = 0;
        for sample in samples {
            sink.before_sample(&sample)?;
            let frames = sample.to_tensor::<B>(&self.device);
            let pass = match sink.hooks() {
                Some(hooks) => self.encoder.forward(frames, hooks)?,
                None => self.encoder.forward(frames, &mut NoHooks)?,
            };
            sink.on_sample(self.encoder, pass, &sample)?;
            processed += 1;
        }
        Ok(processed)
    }
}
