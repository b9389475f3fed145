//! # gaitscope_explain
//!
//! Explainability tools for gait encoders: layer capture, attribution
//! targets, Grad-CAM saliency and per-sequence attribution bundles.
//!
//! This crate provides:
//! - [`HookRegistry`] and [`CaptureSession`] for capturing layer
//!   activations and gradients, including height-split layers
//! - [`select_target`] for the nearest-gallery distance a saliency pass
//!   explains
//! - [`compute_heatmap`] and [`layer_heatmaps`] for Grad-CAM heatmaps
//! - [`AttributionBundle`] and [`ResultAggregator`] for persisting and
//!   comparing results
//! - [`run_saliency`] tying the above to an encoder

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod bundle;
mod capture;
mod config;
mod driver;
mod error;
mod saliency;
mod target;

pub use bundle::{
    comparison_frames, merged_layers, overlay, AttributionBundle, BundleManifest, ComparisonStack,
    LayerHeatmaps, ManifestLayer, ResultAggregator, FRAMES_KEY, HEATMAP_PREFIX, ORIGIN_KEY,
};
pub use capture::{CaptureSession, HookRegistry, LayerCapture, LayerHandle, PartialBuffer};
pub use config::SaliencyConfig;
pub use driver::{run_saliency, GalleryCollector, SaliencyDriver, SaliencyOutcome, SaliencyReport};
pub use error::{ExplainError, Result};
pub use saliency::{
    apply_jet, compute_heatmap, frames_for_slots, grad_cam_map, intensity_map, layer_heatmaps,
    min_max_normalize,
};
pub use target::{
    part_distance, part_distances, select_target, AttributionTarget, DistanceMetric,
    GalleryDescriptorSet,
};
