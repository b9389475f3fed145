//! Sample sinks for gallery collection and saliency, and the saliency run
//! that ties them together.

use std::path::PathBuf;

use burn::prelude::*;
use gaitscope_core::{ForwardPass, GaitEncoder, InferenceDriver, LayerHooks, Sample, SampleSink, SequenceKey};

use crate::bundle::ResultAggregator;
use crate::capture::{CaptureSession, HookRegistry};
use crate::config::SaliencyConfig;
use crate::error::{ExplainError, Result};
use crate::saliency::layer_heatmaps;
use crate::target::{select_target, DistanceMetric, GalleryDescriptorSet};

/// Collects gallery descriptors from plain forward passes.
#[derive(Debug)]
pub struct GalleryCollector<B: Backend> {
    rows: Vec<(SequenceKey, Tensor<B, 3>)>,
}

impl<B: Backend> Default for GalleryCollector<B> {
    fn default() -> Self {
        Self { rows: Vec::new() }
    }
}

impl<B: Backend> GalleryCollector<B> {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of descriptors collected so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Freeze the collected descriptors into a gallery.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::EmptyGallery`] if no sample was seen.
    pub fn finish(self) -> Result<GalleryDescriptorSet<B>> {
        GalleryDescriptorSet::from_rows(self.rows)
    }
}

impl<B: Backend, E: GaitEncoder<B>> SampleSink<B, E> for GalleryCollector<B> {
    type Error = ExplainError;

    fn on_sample(&mut self, _encoder: &E, pass: ForwardPass<B, E::Tape>, sample: &Sample) -> Result<()> {
        self.rows.push((sample.key.clone(), pass.descriptor));
        Ok(())
    }
}

/// Outcome of explaining one probe sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SaliencyOutcome {
    /// Probe identity.
    pub key: SequenceKey,
    /// Distance to the nearest gallery row.
    pub target: f32,
    /// Identity of the nearest gallery row.
    pub nearest: SequenceKey,
    /// Path of the persisted bundle.
    pub path: PathBuf,
}

/// Explains each probe against a fixed gallery and persists its bundle.
pub struct SaliencyDriver<'g, B: Backend> {
    session: CaptureSession<B>,
    gallery: &'g GalleryDescriptorSet<B>,
    metric: DistanceMetric,
    aggregator: ResultAggregator,
    outcomes: Vec<SaliencyOutcome>,
}

impl<'g, B: Backend> SaliencyDriver<'g, B> {
    /// Create a driver from a registered capture session.
    pub fn new(
        session: CaptureSession<B>,
        gallery: &'g GalleryDescriptorSet<B>,
        metric: DistanceMetric,
        aggregator: ResultAggregator,
    ) -> Self {
        Self {
            session,
            gallery,
            metric,
            aggregator,
            outcomes: Vec::new(),
        }
    }

    /// Outcomes so far, in probe order.
    #[must_use]
    pub fn outcomes(&self) -> &[SaliencyOutcome] {
        &self.outcomes
    }

    /// Release the capture session and the collected outcomes.
    pub fn into_parts(self) -> (CaptureSession<B>, Vec<SaliencyOutcome>) {
        (self.session, self.outcomes)
    }
}

impl<B: Backend, E: GaitEncoder<B>> SampleSink<B, E> for SaliencyDriver<'_, B> {
    type Error = ExplainError;

    fn before_sample(&mut self, _sample: &Sample) -> Result<()> {
        self.session.reset();
        Ok(())
    }

    fn hooks(&mut self) -> Option<&mut dyn LayerHooks<B>> {
        Some(&mut self.session)
    }

    fn on_sample(&mut self, encoder: &E, pass: ForwardPass<B, E::Tape>, sample: &Sample) -> Result<()> {
        let target = select_target(&pass.descriptor, self.gallery, self.metric)?;
        encoder.backward(pass.tape, target.seed_gradient, &mut self.session)?;
        let captures = self.session.take_captures()?;

        let frames = sample.rgb_frames();
        self.aggregator.begin(sample.key.clone(), frames.clone());
        for capture in &captures {
            self.aggregator.push(layer_heatmaps(capture, &frames)?)?;
        }
        let path = self.aggregator.flush()?;

        self.outcomes.push(SaliencyOutcome {
            key: sample.key.clone(),
            target: target.value,
            nearest: self.gallery.keys()[target.nearest].clone(),
            path,
        });
        Ok(())
    }
}

/// Summary of a saliency run.
#[derive(Debug, Clone)]
pub struct SaliencyReport {
    /// Number of gallery descriptors.
    pub gallery_size: usize,
    /// Tags of the hooked layers in ascending ordinal order.
    pub layers: Vec<String>,
    /// One outcome per probe, in probe order.
    pub outcomes: Vec<SaliencyOutcome>,
}

/// Explain every probe sequence against the gallery.
///
/// Hooks are registered before any forward pass so that an invalid layer
/// selection fails before work starts. The gallery is collected first with
/// plain forward passes; probes are then processed one at a time.
///
/// # Errors
///
/// Returns the first configuration, capture or persistence error.
pub fn run_saliency<B, E, G, P>(
    encoder: &E,
    device: B::Device,
    gallery: G,
    probes: P,
    config: &SaliencyConfig,
) -> Result<SaliencyReport>
where
    B: Backend,
    E: GaitEncoder<B>,
    G: IntoIterator<Item = Sample>,
    P: IntoIterator<Item = Sample>,
{
    config.validate()?;

    let registry = HookRegistry::discover::<B, E>(encoder);
    let session = registry.register::<B>(&config.normalized_layers())?;
    let layers = session.tags().into_iter().map(str::to_string).collect();

    let driver = InferenceDriver::new(encoder, device);

    let mut collector = GalleryCollector::<B>::new();
    driver.run(gallery, &mut collector)?;
    let gallery = collector.finish()?;
    tracing::info!("Gallery holds {} descriptors", gallery.len());

    let aggregator = ResultAggregator::new(config.save_dir.clone(), config.model_name.clone());
    let mut saliency = SaliencyDriver::new(session, &gallery, config.metric, aggregator);
    let processed = driver.run(probes, &mut saliency)?;
    tracing::info!("Explained {} probe sequence(s)", processed);

    let (mut session, outcomes) = saliency.into_parts();
    registry.remove(&mut session);

    Ok(SaliencyReport {
        gallery_size: gallery.len(),
        layers,
        outcomes,
    })
}
