//! Toy encoder shared by the integration tests.
//!
//! `StripEncoder` mimics the structure of a set-based gait network closely
//! enough to exercise every capture path:
//!
//! 1. `backbone.conv1` maps the silhouette into `C` channels with a
//!    per-channel weight and signed bias, reporting its output as two
//!    height halves, channel-first
//! 2. `temporal.pool` averages consecutive frame pairs (`T -> T/2`)
//! 3. `set.pool` averages over time (set level)
//!
//! The descriptor is the mean of `P` horizontal strips per channel. The bias
//! keeps part descriptors of different subjects from being collinear. Every
//! layer is affine, so the backward pass is computed in closed form.

#![allow(dead_code)]

use burn::prelude::*;
use burn_ndarray::NdArray;
use gaitscope::core::{
    ForwardPass, GaitEncoder, LayerHooks, LayerInfo, Result, Sample, Seed, SequenceKey, TensorLayout,
};
use ndarray::Array3;
use rand::prelude::*;

pub type TestBackend = NdArray;

/// Tape of one forward pass: input frames, height and width.
#[derive(Debug, Clone, Copy)]
pub struct StripTape {
    frames: usize,
    height: usize,
    width: usize,
}

pub struct StripEncoder {
    weights: Vec<f32>,
    biases: Vec<f32>,
    parts: usize,
}

impl StripEncoder {
    pub fn new(channels: usize, parts: usize, seed: Seed) -> Self {
        let mut rng = seed.derive("strip-encoder").to_rng();
        let weights = (0..channels).map(|_| rng.gen_range(0.5..1.5)).collect();
        let biases = (0..channels)
            .map(|i| {
                let magnitude = rng.gen_range(0.2..0.6);
                if i % 2 == 0 { magnitude } else { -magnitude }
            })
            .collect();
        Self { weights, biases, parts }
    }

    fn channels(&self) -> usize {
        self.weights.len()
    }

    /// Report a canonical `(1, T, C, H, W)` tensor channel-first in two
    /// height halves, top first.
    fn emit_split(
        &self,
        ordinal: usize,
        tensor: Tensor<TestBackend, 5>,
        hooks: &mut dyn LayerHooks<TestBackend>,
        gradient: bool,
    ) {
        let native = tensor.swap_dims(1, 2);
        let h = native.dims()[3];
        let top = native.clone().narrow(3, 0, h / 2);
        let bottom = native.narrow(3, h / 2, h - h / 2);
        for half in [top, bottom] {
            if gradient {
                hooks.on_backward(ordinal, vec![half]);
            } else {
                hooks.on_forward(ordinal, half);
            }
        }
    }
}

impl GaitEncoder<TestBackend> for StripEncoder {
    type Tape = StripTape;

    fn name(&self) -> &str {
        "StripSet"
    }

    fn native_layout(&self) -> TensorLayout {
        TensorLayout::ChannelFirst
    }

    fn layers(&self) -> Vec<LayerInfo> {
        vec![
            LayerInfo::new("backbone.conv1", format!("Conv2d(1, {}, 1)", self.channels())),
            LayerInfo::new("temporal.pool", "AvgPool(2)"),
            LayerInfo::new("set.pool", "SetPooling(mean)").set_level(),
        ]
    }

    fn forward(
        &self,
        frames: Tensor<TestBackend, 4>,
        hooks: &mut dyn LayerHooks<TestBackend>,
    ) -> Result<ForwardPass<TestBackend, StripTape>> {
        let [t, _, h, w] = frames.dims();
        let c = self.channels();
        let device = frames.device();

        let per_channel = |values: &[f32]| {
            Tensor::<TestBackend, 1>::from_data(TensorData::new(values.to_vec(), [c]), &device)
                .reshape([1, 1, c, 1, 1])
                .repeat_dim(1, t)
                .repeat_dim(3, h)
                .repeat_dim(4, w)
        };
        let conv = frames.reshape([1, t, 1, h, w]).repeat_dim(2, c) * per_channel(&self.weights)
            + per_channel(&self.biases);
        self.emit_split(1, conv.clone(), hooks, false);

        let pooled = conv
            .reshape([1, t / 2, 2, c * h * w])
            .mean_dim(2)
            .reshape([1, t / 2, c, h, w]);
        hooks.on_forward(2, pooled.clone().swap_dims(1, 2));

        let set = pooled.mean_dim(1);
        hooks.on_forward(3, set.clone().swap_dims(1, 2));

        let strip = h / self.parts;
        let descriptor = set
            .reshape([1, c, self.parts, strip * w])
            .mean_dim(3)
            .reshape([1, c, self.parts]);

        Ok(ForwardPass {
            descriptor,
            tape: StripTape {
                frames: t,
                height: h,
                width: w,
            },
        })
    }

    fn backward(
        &self,
        tape: StripTape,
        seed: Tensor<TestBackend, 3>,
        hooks: &mut dyn LayerHooks<TestBackend>,
    ) -> Result<()> {
        let StripTape { frames: t, height: h, width: w } = tape;
        let c = self.channels();
        let strip = h / self.parts;
        let slots = t / 2;

        let grad_set = seed
            .reshape([1, c, self.parts, 1])
            .repeat_dim(3, strip * w)
            .div_scalar((strip * w) as f32)
            .reshape([1, 1, c, h, w]);
        hooks.on_backward(3, vec![grad_set.clone().swap_dims(1, 2)]);

        let grad_pooled = grad_set.repeat_dim(1, slots).div_scalar(slots as f32);
        hooks.on_backward(2, vec![grad_pooled.clone().swap_dims(1, 2)]);

        let grad_conv = grad_pooled
            .reshape([1, slots, 1, c * h * w])
            .repeat_dim(2, 2)
            .div_scalar(2.0)
            .reshape([1, t, c, h, w]);
        self.emit_split(1, grad_conv, hooks, true);
        Ok(())
    }
}

/// A walking blob: a bright block drifting across the frame, shifted per
/// subject, plus a little seeded noise.
pub fn walking_sample(subject: usize, frames: usize, seed: Seed) -> Sample {
    let (h, w) = (15, 12);
    let mut rng = seed.derive(&format!("subject-{subject}")).to_rng();
    let data = Array3::from_shape_fn((frames, h, w), |(t, y, x)| {
        let left = (t + subject) % (w - 4);
        let body = x >= left && x < left + 4 && y >= 2 + subject % 3;
        let base = if body { 0.9 } else { 0.05 };
        base + rng.gen::<f32>() * 0.05
    });
    Sample::new(
        SequenceKey::new(format!("{subject:03}"), "nm-01", "090"),
        data,
    )
    .expect("valid sample")
}
