//! # gaitscope_analysis
//!
//! Streaming embedding of gait descriptors for visual inspection.
//!
//! This crate provides:
//! - [`StreamingEmbedder`], a bounded producer/consumer pipeline reducing
//!   descriptors bucket by bucket
//! - The [`Reducer`] capability and the built-in [`PcaReducer`]
//! - [`EmbeddingCollector`] and [`embed_samples`] for embedding encoder
//!   descriptors directly
//! - [`EmbeddingBundle`] persistence

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod bundle;
mod collector;
mod config;
mod embedding;
mod error;
mod reduce;

pub use bundle::{EmbeddingBundle, FEATS_KEY, LABEL_IDS_KEY};
pub use collector::{embed_samples, EmbeddingCollector};
pub use config::EmbeddingConfig;
pub use embedding::{
    fit_display_dim, normalize_columns, Bucket, Embedding, EmbeddingRecord, RecordSender, StreamMessage,
    StreamingEmbedder, MAX_DISPLAY_DIM,
};
pub use error::{AnalysisError, Result};
pub use reduce::{reducer_fn, PcaReducer, ReduceError, Reducer};
