//! Embedding of encoder descriptors straight from a sample source.

use burn::prelude::*;
use gaitscope_core::{tensor_to_vec, ForwardPass, GaitEncoder, InferenceDriver, Sample, SampleSink};

use crate::config::EmbeddingConfig;
use crate::embedding::{Embedding, EmbeddingRecord, RecordSender, StreamingEmbedder};
use crate::error::{AnalysisError, Result};
use crate::reduce::Reducer;

/// Sink publishing each forward pass as an [`EmbeddingRecord`].
#[derive(Debug)]
pub struct EmbeddingCollector<'s> {
    sender: &'s mut RecordSender,
}

impl<'s> EmbeddingCollector<'s> {
    /// Create a collector publishing on `sender`.
    pub fn new(sender: &'s mut RecordSender) -> Self {
        Self { sender }
    }
}

impl<B: Backend, E: GaitEncoder<B>> SampleSink<B, E> for EmbeddingCollector<'_> {
    type Error = AnalysisError;

    fn on_sample(&mut self, _encoder: &E, pass: ForwardPass<B, E::Tape>, sample: &Sample) -> Result<()> {
        let descriptor = tensor_to_vec(pass.descriptor)?;
        self.sender.send(EmbeddingRecord::new(descriptor, sample.label()))
    }
}

/// Embed the descriptors of every sample.
///
/// Forward passes run on the calling thread in source order; the reducer
/// runs on the embedder's consumer thread.
///
/// # Errors
///
/// Returns a configuration, encoder or streaming error.
pub fn embed_samples<B, E, I, R>(
    encoder: &E,
    device: B::Device,
    samples: I,
    reducer: R,
    config: &EmbeddingConfig,
) -> Result<Embedding>
where
    B: Backend,
    E: GaitEncoder<B>,
    I: IntoIterator<Item = Sample>,
    R: Reducer + Send,
{
    let embedder = StreamingEmbedder::from_config(config)?;
    let driver = InferenceDriver::<B, E>::new(encoder, device);
    embedder.run_with(
        |sender| {
            let mut sink = EmbeddingCollector::new(sender);
            let processed = driver.run(samples, &mut sink)?;
            tracing::debug!("Produced {} descriptors", processed);
            Ok(())
        },
        reducer,
    )
}
