//! Grad-CAM heatmaps from captured layer activations and gradients.
//!
//! For one temporal slot with activation `A` and gradient `G`, both
//! `(C, H', W')`:
//!
//! ```text
//! w_c  = mean_{h,w} G[c]
//! raw  = |Σ_c A[c] · w_c|
//! norm = (raw − min(raw)) / range     range floored to 1 when raw is constant
//! ```
//!
//! The absolute value keeps magnitude rather than only positive
//! contribution; activations and gradients of silhouette encoders are often
//! negative and clipping would blank most of the map. The normalized map is
//! resized to the frame resolution, quantized to `[0, 255]` and colored
//! with a JET color scale.

use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use gaitscope_core::{tensor_to_vec, temporal_align_u8, TemporalExtent};
use ndarray::{Array2, Array3, Array4, Axis};

use crate::bundle::LayerHeatmaps;
use crate::capture::LayerCapture;
use crate::error::{ExplainError, Result};

/// Unnormalized Grad-CAM map `|Σ_c A[c] · mean_hw(G[c])|`, shape `(H', W')`.
pub fn grad_cam_map<B: Backend>(features: Tensor<B, 3>, gradients: Tensor<B, 3>) -> Tensor<B, 2> {
    let [_, h, w] = features.dims();

    // Global average pool of the gradient: (C, H', W') -> (C, 1, 1)
    let weights = gradients.mean_dim(2).mean_dim(1);

    // Channel-weighted sum: (C, H', W') -> (1, H', W')
    let cam = (features * weights).sum_dim(0);

    cam.abs().reshape([h, w])
}

/// Min-max normalize to `[0, 1]`, flooring a zero range to 1.
pub fn min_max_normalize<B: Backend, const D: usize>(map: Tensor<B, D>) -> Tensor<B, D> {
    let min: f32 = map.clone().min().into_scalar().elem();
    let max: f32 = map.clone().max().into_scalar().elem();
    let range = max - min;
    let range = if range > 0.0 { range } else { 1.0 };
    map.sub_scalar(min).div_scalar(range)
}

/// 8-bit Grad-CAM intensity of layer `tag` resized to `size = [H, W]`.
///
/// # Errors
///
/// Returns [`ExplainError::CaptureShapeMismatch`] naming `tag` if the two
/// maps disagree in shape, or an error if the backend data cannot be read.
pub fn intensity_map<B: Backend>(
    tag: &str,
    features: Tensor<B, 3>,
    gradients: Tensor<B, 3>,
    size: [usize; 2],
) -> Result<Array2<u8>> {
    if features.dims() != gradients.dims() {
        return Err(ExplainError::CaptureShapeMismatch {
            tag: tag.to_string(),
            features: format!("{:?}", features.dims()),
            gradients: format!("{:?}", gradients.dims()),
        });
    }
    let [h, w] = size;

    let cam = min_max_normalize(grad_cam_map(features, gradients));
    let [ch, cw] = cam.dims();
    let cam = cam.reshape([1, 1, ch, cw]);
    let resized = if [ch, cw] == size {
        cam
    } else {
        interpolate(cam, size, InterpolateOptions::new(InterpolateMode::Bilinear))
    };

    let values = tensor_to_vec(resized.mul_scalar(255.0))?;
    let values = values
        .into_iter()
        .map(|v| v.round().clamp(0.0, 255.0) as u8)
        .collect();
    Array2::from_shape_vec((h, w), values)
        .map_err(|e| gaitscope_core::CoreError::ShapeMismatch(e.to_string()).into())
}

fn jet_channel(x: f32, center: f32) -> u8 {
    let v = (1.5 - (4.0 * x - center).abs()).clamp(0.0, 1.0);
    (v * 255.0).round() as u8
}

/// Map 8-bit intensities to JET colors, `(H, W) -> (H, W, 3)` RGB.
///
/// Low intensities are blue, high intensities red.
#[must_use]
pub fn apply_jet(intensity: &Array2<u8>) -> Array3<u8> {
    let (h, w) = intensity.dim();
    Array3::from_shape_fn((h, w, 3), |(y, x, c)| {
        let v = f32::from(intensity[[y, x]]) / 255.0;
        match c {
            0 => jet_channel(v, 3.0),
            1 => jet_channel(v, 2.0),
            _ => jet_channel(v, 1.0),
        }
    })
}

/// Colored heatmap `(H, W, 3)` for one slot.
///
/// # Errors
///
/// See [`intensity_map`].
pub fn compute_heatmap<B: Backend>(
    tag: &str,
    features: Tensor<B, 3>,
    gradients: Tensor<B, 3>,
    size: [usize; 2],
) -> Result<Array3<u8>> {
    Ok(apply_jet(&intensity_map(tag, features, gradients, size)?))
}

/// Heatmaps of one captured layer paired against the source frames.
///
/// `frames` is the `(T, H, W, 3)` source sequence. A sequence layer with
/// `T'` slots yields `T'` heatmaps, one per slot; pair them with
/// [`LayerHeatmaps::paired_frames`]. A set-level layer yields `T`
/// identical heatmaps, one per source frame.
///
/// # Errors
///
/// Returns an error for a batch size other than 1, an empty capture, or a
/// failed heatmap computation.
pub fn layer_heatmaps<B: Backend>(capture: &LayerCapture<B>, frames: &Array4<u8>) -> Result<LayerHeatmaps> {
    let [batch, slots, channels, fh, fw] = capture.features.dims();
    if batch != 1 || slots == 0 {
        return Err(ExplainError::CaptureShapeMismatch {
            tag: capture.tag.clone(),
            features: format!("{:?}", capture.features.dims()),
            gradients: format!("{:?}", capture.gradients.dims()),
        });
    }
    let (frame_count, h, w, _) = frames.dim();
    let size = [h, w];

    let slot = |t: usize| -> Result<Array3<u8>> {
        let features = capture
            .features
            .clone()
            .narrow(1, t, 1)
            .reshape([channels, fh, fw]);
        let gradients = capture
            .gradients
            .clone()
            .narrow(1, t, 1)
            .reshape([channels, fh, fw]);
        compute_heatmap(&capture.tag, features, gradients, size)
    };

    let heatmaps: Vec<Array3<u8>> = match capture.temporal {
        TemporalExtent::Set => {
            if slots != 1 {
                tracing::warn!(
                    "Set-level layer {} reported {} temporal slots; using the first",
                    capture.tag,
                    slots
                );
            }
            let map = slot(0)?;
            vec![map; frame_count]
        }
        TemporalExtent::Sequence => (0..slots).map(slot).collect::<Result<_>>()?,
    };

    let views: Vec<_> = heatmaps.iter().map(|m| m.view()).collect();
    let stacked = ndarray::stack(Axis(0), &views)
        .map_err(|e| gaitscope_core::CoreError::ShapeMismatch(e.to_string()))?;

    Ok(LayerHeatmaps::new(capture.ordinal, capture.tag.clone(), stacked))
}

/// Source frames aligned to `slots` temporal slots.
///
/// # Errors
///
/// Returns a reconciliation error for `slots == 0`.
pub fn frames_for_slots(frames: &Array4<u8>, slots: usize) -> Result<Array4<u8>> {
    if frames.len_of(Axis(0)) != slots {
        tracing::debug!(
            "Aligning {} source frames to {} layer slots",
            frames.len_of(Axis(0)),
            slots
        );
    }
    Ok(temporal_align_u8(frames, slots)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gaitscope_core::backend::NdArray;

    type TestBackend = NdArray;

    fn tensor3(values: Vec<f32>, dims: [usize; 3]) -> Tensor<TestBackend, 3> {
        Tensor::from_data(TensorData::new(values, dims), &Default::default())
    }

    fn capture(slots: usize, temporal: TemporalExtent) -> LayerCapture<TestBackend> {
        let dims = [1, slots, 2, 4, 3];
        let n: usize = dims.iter().product();
        let features: Vec<f32> = (0..n).map(|i| ((i * 7) % 11) as f32 - 5.0).collect();
        let gradients: Vec<f32> = (0..n).map(|i| ((i * 3) % 5) as f32 * 0.1).collect();
        LayerCapture {
            ordinal: 2,
            tag: "2_backbone-conv2".to_string(),
            temporal,
            features: Tensor::from_data(TensorData::new(features, dims), &Default::default()),
            gradients: Tensor::from_data(TensorData::new(gradients, dims), &Default::default()),
        }
    }

    #[test]
    fn test_grad_cam_takes_absolute_value() {
        // One channel, gradient mean 1, features negative -> raw map negative.
        let features = tensor3(vec![-1.0, -2.0, -3.0, -4.0], [1, 2, 2]);
        let gradients = tensor3(vec![1.0; 4], [1, 2, 2]);
        let map = tensor_to_vec(grad_cam_map(features, gradients)).unwrap();
        assert_eq!(map, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_grad_cam_weights_channels_by_mean_gradient() {
        // Channel 0 weight 2, channel 1 weight 0.
        let features = tensor3(vec![1.0, 1.0, 1.0, 1.0, 5.0, 5.0, 5.0, 5.0], [2, 2, 2]);
        let gradients = tensor3(vec![1.0, 3.0, 2.0, 2.0, -1.0, 1.0, -1.0, 1.0], [2, 2, 2]);
        let map = tensor_to_vec(grad_cam_map(features, gradients)).unwrap();
        assert!(map.iter().all(|v| (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_heatmap_values_are_eight_bit() {
        let features = tensor3((0..24).map(|i| i as f32 - 12.0).collect(), [2, 3, 4]);
        let gradients = tensor3((0..24).map(|i| (i % 5) as f32).collect(), [2, 3, 4]);
        let intensity = intensity_map("1_conv", features.clone(), gradients.clone(), [3, 4]).unwrap();
        assert_eq!(*intensity.iter().max().unwrap(), 255);
        assert_eq!(*intensity.iter().min().unwrap(), 0);

        let resized = intensity_map("1_conv", features, gradients, [6, 8]).unwrap();
        assert_eq!(resized.dim(), (6, 8));
    }

    #[test]
    fn test_zero_inputs_yield_uniform_map() {
        let features = tensor3(vec![0.0; 12], [1, 3, 4]);
        let gradients = tensor3(vec![0.0; 12], [1, 3, 4]);
        let heatmap = compute_heatmap("1_conv", features, gradients, [3, 4]).unwrap();
        let first = heatmap[[0, 0, 0]];
        assert!(heatmap.index_axis(Axis(2), 0).iter().all(|&v| v == first));
    }

    #[test]
    fn test_jet_endpoints() {
        let intensity = Array2::from_shape_vec((1, 2), vec![0_u8, 255]).unwrap();
        let colored = apply_jet(&intensity);
        // Low end is dark blue, high end dark red.
        assert_eq!(colored[[0, 0, 0]], 0);
        assert!(colored[[0, 0, 2]] > 100);
        assert!(colored[[0, 1, 0]] > 100);
        assert_eq!(colored[[0, 1, 2]], 0);
    }

    #[test]
    fn test_compressed_layer_gets_one_heatmap_per_slot() {
        let frames = Array4::<u8>::zeros((8, 6, 5, 3));
        let heatmaps = layer_heatmaps(&capture(3, TemporalExtent::Sequence), &frames).unwrap();
        assert_eq!(heatmaps.len(), 3);
        assert_eq!(heatmaps.heatmaps.dim(), (3, 6, 5, 3));

        let paired = frames_for_slots(&frames, heatmaps.len()).unwrap();
        assert_eq!(paired.dim(), (3, 6, 5, 3));
    }

    #[test]
    fn test_paired_frames_average_each_slot_bin() {
        // Frame t is filled with 10·t; bins of 8 -> 3 are [0,3), [2,6), [5,8).
        let frames = Array4::from_shape_fn((8, 6, 5, 3), |(t, _, _, _)| (t * 10) as u8);
        let heatmaps = layer_heatmaps(&capture(3, TemporalExtent::Sequence), &frames).unwrap();

        let paired = heatmaps.paired_frames(&frames).unwrap();
        assert_eq!(paired, temporal_align_u8(&frames, 3).unwrap());
        for (slot, expected) in [10_u8, 35, 60].into_iter().enumerate() {
            assert!(paired.index_axis(Axis(0), slot).iter().all(|&v| v == expected));
        }
    }

    #[test]
    fn test_shape_mismatch_names_the_layer() {
        let features = tensor3(vec![0.0; 12], [1, 3, 4]);
        let gradients = tensor3(vec![0.0; 24], [2, 3, 4]);
        let err = intensity_map("3_set-pool", features, gradients, [3, 4]).unwrap_err();
        match err {
            ExplainError::CaptureShapeMismatch { tag, .. } => assert_eq!(tag, "3_set-pool"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_set_layer_is_replicated_per_frame() {
        let frames = Array4::<u8>::zeros((8, 6, 5, 3));
        let heatmaps = layer_heatmaps(&capture(1, TemporalExtent::Set), &frames).unwrap();
        assert_eq!(heatmaps.len(), 8);
        let first = heatmaps.heatmaps.index_axis(Axis(0), 0).to_owned();
        for t in 1..8 {
            assert_eq!(heatmaps.heatmaps.index_axis(Axis(0), t), first);
        }
    }
}
