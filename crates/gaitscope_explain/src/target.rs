//! Attribution target selection.
//!
//! The scalar explained by the saliency pass is the distance from a probe
//! descriptor to its closest gallery row. Descriptors are `(N, C, P)`:
//! distances are computed per part over the channel axis and averaged over
//! parts.

use std::str::FromStr;

use burn::prelude::*;
use gaitscope_core::{tensor_to_vec, SequenceKey};
use serde::{Deserialize, Serialize};

use crate::error::{ExplainError, Result};

const NORM_EPS: f32 = 1e-12;

/// Per-part distance metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// `‖x − y‖` per part, which equals `sqrt(max(0, |x|² + |y|² − 2 x·y))`.
    #[default]
    Euclidean,
    /// `1 − x̂·ŷ` per part on unit-normalized vectors.
    Cosine,
}

impl FromStr for DistanceMetric {
    type Err = gaitscope_core::CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euc" | "euclidean" => Ok(Self::Euclidean),
            "cos" | "cosine" => Ok(Self::Cosine),
            other => Err(gaitscope_core::CoreError::invalid_config(
                "metric",
                other,
                "expected 'euc' or 'cos'",
            )),
        }
    }
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Euclidean => write!(f, "euc"),
            Self::Cosine => write!(f, "cos"),
        }
    }
}

fn unit_parts<B: Backend>(x: Tensor<B, 3>) -> Tensor<B, 3> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(NORM_EPS);
    x / norm
}

/// Per-part distance between every row of `x` and every row of `y`.
///
/// `x` is `(1, C, P)`, `y` is `(N, C, P)`; returns `(N, P)`.
pub fn part_distances<B: Backend>(x: Tensor<B, 3>, y: Tensor<B, 3>, metric: DistanceMetric) -> Tensor<B, 2> {
    let [n, _, p] = y.dims();
    match metric {
        DistanceMetric::Euclidean => {
            let diff = x.repeat_dim(0, n) - y;
            diff.powf_scalar(2.0).sum_dim(1).sqrt().reshape([n, p])
        }
        DistanceMetric::Cosine => {
            let x = unit_parts(x).repeat_dim(0, n);
            let y = unit_parts(y);
            let similarity = (x * y).sum_dim(1).reshape([n, p]);
            similarity.neg().add_scalar(1.0).clamp_min(0.0)
        }
    }
}

/// Part-averaged distance of the probe to every gallery row, shape `(N,)`.
pub fn part_distance<B: Backend>(x: Tensor<B, 3>, y: Tensor<B, 3>, metric: DistanceMetric) -> Tensor<B, 1> {
    let [n, _, _] = y.dims();
    part_distances(x, y, metric).mean_dim(1).reshape([n])
}

/// Closed-form `∂distance/∂x` for a single gallery row `y`, both `(1, C, P)`.
fn distance_gradient<B: Backend>(x: Tensor<B, 3>, y: Tensor<B, 3>, metric: DistanceMetric) -> Tensor<B, 3> {
    let [_, _, p] = x.dims();
    let parts = p as f32;
    match metric {
        DistanceMetric::Euclidean => {
            let diff = x - y;
            let d = diff.clone().powf_scalar(2.0).sum_dim(1).sqrt();
            let nonzero = d.clone().greater_elem(0.0).float();
            let safe = d.clone().mask_fill(d.equal_elem(0.0), 1.0);
            diff / safe.mul_scalar(parts) * nonzero
        }
        DistanceMetric::Cosine => {
            let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(NORM_EPS);
            let x_hat = x / norm.clone();
            let y_hat = unit_parts(y);
            let dot = (x_hat.clone() * y_hat.clone()).sum_dim(1);
            (y_hat - x_hat * dot).neg() / norm.mul_scalar(parts)
        }
    }
}

/// Descriptors of the reference set, computed once per saliency run.
#[derive(Debug, Clone)]
pub struct GalleryDescriptorSet<B: Backend> {
    descriptors: Tensor<B, 3>,
    keys: Vec<SequenceKey>,
}

impl<B: Backend> GalleryDescriptorSet<B> {
    /// Create a gallery from stacked descriptors `(N, C, P)` and their keys.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::EmptyGallery`] for `N == 0` and
    /// [`ExplainError::DescriptorMismatch`] if the key count differs from `N`.
    pub fn new(descriptors: Tensor<B, 3>, keys: Vec<SequenceKey>) -> Result<Self> {
        let [n, _, _] = descriptors.dims();
        if n == 0 {
            return Err(ExplainError::EmptyGallery);
        }
        if keys.len() != n {
            return Err(ExplainError::DescriptorMismatch(format!(
                "{} gallery descriptors but {} keys",
                n,
                keys.len()
            )));
        }
        Ok(Self { descriptors, keys })
    }

    /// Stack per-sequence descriptors `(1, C, P)` into a gallery.
    ///
    /// # Errors
    ///
    /// See [`GalleryDescriptorSet::new`]; also fails if the descriptors
    /// disagree in shape.
    pub fn from_rows(rows: Vec<(SequenceKey, Tensor<B, 3>)>) -> Result<Self> {
        let Some((_, first)) = rows.first() else {
            return Err(ExplainError::EmptyGallery);
        };
        let [_, c, p] = first.dims();
        let mut keys = Vec::with_capacity(rows.len());
        let mut tensors = Vec::with_capacity(rows.len());
        for (key, row) in rows {
            let [b, rc, rp] = row.dims();
            if b != 1 || rc != c || rp != p {
                return Err(ExplainError::DescriptorMismatch(format!(
                    "gallery row {key} has shape [{b}, {rc}, {rp}], expected [1, {c}, {p}]"
                )));
            }
            keys.push(key);
            tensors.push(row);
        }
        Self::new(Tensor::cat(tensors, 0), keys)
    }

    /// Number of gallery rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always false; an empty gallery cannot be constructed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Stacked descriptors `(N, C, P)`.
    #[must_use]
    pub fn descriptors(&self) -> &Tensor<B, 3> {
        &self.descriptors
    }

    /// Gallery keys in row order.
    #[must_use]
    pub fn keys(&self) -> &[SequenceKey] {
        &self.keys
    }

    /// Descriptor shape `[C, P]`.
    #[must_use]
    pub fn descriptor_dims(&self) -> [usize; 2] {
        let [_, c, p] = self.descriptors.dims();
        [c, p]
    }
}

/// The scalar a saliency pass explains, with the gradient that seeds it.
#[derive(Debug, Clone)]
pub struct AttributionTarget<B: Backend> {
    /// Minimum part-averaged distance over the gallery.
    pub value: f32,
    /// Row index of the nearest gallery descriptor.
    pub nearest: usize,
    /// Distance to every gallery row.
    pub distances: Vec<f32>,
    /// `∂value/∂probe`, shape `(1, C, P)`.
    pub seed_gradient: Tensor<B, 3>,
}

/// Select the nearest gallery row for a probe descriptor.
///
/// Ties resolve to the lowest row index.
///
/// # Errors
///
/// Returns [`ExplainError::DescriptorMismatch`] if the probe is not
/// `(1, C, P)` with the gallery's `C` and `P`.
pub fn select_target<B: Backend>(
    probe: &Tensor<B, 3>,
    gallery: &GalleryDescriptorSet<B>,
    metric: DistanceMetric,
) -> Result<AttributionTarget<B>> {
    let [b, c, p] = probe.dims();
    let [gc, gp] = gallery.descriptor_dims();
    if b != 1 || c != gc || p != gp {
        return Err(ExplainError::DescriptorMismatch(format!(
            "probe has shape [{b}, {c}, {p}], gallery rows are [1, {gc}, {gp}]"
        )));
    }

    let distances = tensor_to_vec(part_distance(
        probe.clone(),
        gallery.descriptors().clone(),
        metric,
    ))?;

    let (nearest, value) = distances
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::INFINITY), |best, (i, d)| if d < best.1 { (i, d) } else { best });

    tracing::debug!(
        "Nearest gallery row {} ({}) at {} distance {:.6}",
        nearest,
        gallery.keys()[nearest],
        metric,
        value
    );

    let row = gallery.descriptors().clone().narrow(0, nearest, 1);
    let seed_gradient = distance_gradient(probe.clone(), row, metric);

    Ok(AttributionTarget {
        value,
        nearest,
        distances,
        seed_gradient,
    })
}
