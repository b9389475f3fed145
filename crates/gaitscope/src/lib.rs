//! # gaitscope
//!
//! Diagnostics for pretrained silhouette-sequence gait encoders.
//!
//! gaitscope answers two questions about an encoder it does not own:
//!
//! - **Where does it look?** Layer-wise Grad-CAM saliency of a probe
//!   sequence against its nearest gallery descriptor, persisted as
//!   attribution bundles ([`explain`])
//! - **How does its descriptor space cluster?** Streaming low-dimensional
//!   embedding of descriptors in bounded buckets ([`analysis`])
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gaitscope::prelude::*;
//!
//! // List the encoder's leaf layers to pick ordinals from
//! println!("{}", HookRegistry::discover::<NdArray, _>(&encoder).to_table());
//!
//! // Explain every probe against the gallery
//! let config = SaliencyConfig { layers: vec![1, 4, 7], ..Default::default() };
//! let report = run_saliency::<NdArray, _, _, _>(&encoder, device, gallery, probes, &config)?;
//!
//! // Embed the descriptors of a dataset bucket by bucket
//! let embed = EmbeddingConfig::default();
//! let embedding = embed_samples::<NdArray, _, _, _>(
//!     &encoder,
//!     device,
//!     samples,
//!     PcaReducer::new(embed.embed_dim, embed.seed),
//!     &embed,
//! )?;
//! EmbeddingBundle::try_from(embedding)?.save("embedding.npz")?;
//! ```
//!
//! ## Feature Flags
//!
//! - `backend-ndarray` (default): CPU backend using ndarray

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export all crates
pub use gaitscope_analysis as analysis;
pub use gaitscope_core as core;
pub use gaitscope_explain as explain;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use gaitscope::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use gaitscope_core::{
        temporal_align, ForwardPass, GaitEncoder, InferenceDriver, LayerHooks, LayerInfo, Sample,
        SampleSink, Seed, SequenceKey, TemporalExtent, TensorLayout,
    };

    #[cfg(feature = "backend-ndarray")]
    pub use gaitscope_core::backend::NdArray;

    // Saliency
    pub use gaitscope_explain::{
        comparison_frames, run_saliency, AttributionBundle, DistanceMetric, HookRegistry,
        ResultAggregator, SaliencyConfig, SaliencyReport,
    };

    // Embedding
    pub use gaitscope_analysis::{
        embed_samples, Embedding, EmbeddingBundle, EmbeddingConfig, PcaReducer, Reducer,
        StreamingEmbedder,
    };
}
