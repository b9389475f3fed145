//! # gaitscope_core
//!
//! Core types and traits for gaitscope, the diagnostic toolkit for
//! silhouette-sequence gait encoders.
//!
//! This crate provides:
//! - [`GaitEncoder`] and [`LayerHooks`], the capability an encoder exposes
//!   so its leaf layers can be observed without modifying it
//! - [`TensorLayout`] and [`SequenceShape`] for the canonical
//!   `(B, T, C, H, W)` layout of captured tensors
//! - [`temporal_align`] for reconciling sequences of different lengths
//! - [`Sample`], [`SampleSink`] and [`InferenceDriver`] for running
//!   forward passes over a sample source
//! - [`Seed`] for reproducible random streams
//! - Error types and common utilities
//!
//! ## Shape Convention
//!
//! Captured layer tensors follow `(B, T, C, H, W)`:
//! - `B`: Batch size (always 1 during attribution)
//! - `T`: Temporal slots, possibly fewer than input frames
//! - `C`: Channels
//! - `H`, `W`: Spatial height and width
//!
//! Descriptors follow `(N, C, P)` where `P` is the number of body parts.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod align;
mod encoder;
mod error;
mod sample;
mod seed;
mod shape;
mod tensor;

pub use align::{temporal_align, temporal_align_like, temporal_align_u8, temporal_bins};
pub use encoder::{ForwardPass, GaitEncoder, LayerHooks, LayerInfo, NoHooks, TemporalExtent};
pub use error::{CoreError, Result};
pub use sample::{InferenceDriver, Sample, SampleSink, SequenceKey};
pub use seed::Seed;
pub use shape::{SequenceShape, TensorLayout};
pub use tensor::tensor_to_vec;

/// Backend type aliases for convenience
pub mod backend {
    #[cfg(feature = "backend-ndarray")]
    pub use burn_ndarray::NdArray;
}
