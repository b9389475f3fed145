//! Per-sequence attribution bundles: accumulation, persistence, comparison.
//!
//! A bundle is written as a compressed npz archive holding the source frames
//! under `imgs` and one `heatmaps/<tag>` array per layer, plus a JSON
//! manifest next to it that fixes the layer order.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use gaitscope_core::{temporal_align_u8, SequenceKey};
use ndarray::{Array3, Array4, ArrayView3, Axis, Zip};
use ndarray_npy::{NpzReader, NpzWriter};
use serde::{Deserialize, Serialize};

use crate::error::{ExplainError, Result};
use crate::saliency::frames_for_slots;

/// Archive key of the source frames.
pub const FRAMES_KEY: &str = "imgs";

/// Archive key prefix of per-layer heatmaps.
pub const HEATMAP_PREFIX: &str = "heatmaps/";

/// Archive key of the origin stack in a comparison archive.
pub const ORIGIN_KEY: &str = "origin";

/// Heatmaps of one layer, `(T', H, W, 3)` RGB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerHeatmaps {
    /// 1-based layer ordinal.
    pub ordinal: usize,
    /// Display tag.
    pub tag: String,
    /// One colored heatmap per temporal slot.
    pub heatmaps: Array4<u8>,
}

impl LayerHeatmaps {
    /// Create a new layer entry.
    pub fn new(ordinal: usize, tag: impl Into<String>, heatmaps: Array4<u8>) -> Self {
        Self {
            ordinal,
            tag: tag.into(),
            heatmaps,
        }
    }

    /// Number of heatmaps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heatmaps.len_of(Axis(0))
    }

    /// Check if the layer holds no heatmaps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Source frames paired slot-by-slot with these heatmaps.
    ///
    /// # Errors
    ///
    /// Returns a reconciliation error if the layer is empty.
    pub fn paired_frames(&self, frames: &Array4<u8>) -> Result<Array4<u8>> {
        frames_for_slots(frames, self.len())
    }
}

/// Layer entry of a bundle manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestLayer {
    /// 1-based layer ordinal.
    pub ordinal: usize,
    /// Display tag.
    pub tag: String,
    /// Number of heatmaps stored for the layer.
    pub frames: usize,
}

/// JSON sidecar of a persisted bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    /// Model name.
    pub model: String,
    /// Sequence identity.
    pub key: SequenceKey,
    /// Number of source frames.
    pub frames: usize,
    /// Layers in ascending ordinal order.
    pub layers: Vec<ManifestLayer>,
}

/// Frames and heatmaps of one sequence.
#[derive(Debug, Clone)]
pub struct AttributionBundle {
    key: SequenceKey,
    frames: Array4<u8>,
    layers: Vec<LayerHeatmaps>,
}

impl AttributionBundle {
    /// Create an empty bundle for a sequence with `(T, H, W, 3)` frames.
    pub fn new(key: SequenceKey, frames: Array4<u8>) -> Self {
        Self {
            key,
            frames,
            layers: Vec::new(),
        }
    }

    /// Sequence identity.
    #[must_use]
    pub fn key(&self) -> &SequenceKey {
        &self.key
    }

    /// Source frames `(T, H, W, 3)`.
    #[must_use]
    pub fn frames(&self) -> &Array4<u8> {
        &self.frames
    }

    /// Layers in ascending ordinal order.
    #[must_use]
    pub fn layers(&self) -> &[LayerHeatmaps] {
        &self.layers
    }

    /// Look up a layer by tag.
    #[must_use]
    pub fn layer(&self, tag: &str) -> Option<&LayerHeatmaps> {
        self.layers.iter().find(|l| l.tag == tag)
    }

    /// Append a layer.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::LayerOrder`] unless the ordinal is greater
    /// than every ordinal already present, and
    /// [`ExplainError::InvalidBundle`] if the heatmap resolution differs
    /// from the frames.
    pub fn push_layer(&mut self, layer: LayerHeatmaps) -> Result<()> {
        if let Some(last) = self.layers.last() {
            if layer.ordinal <= last.ordinal {
                return Err(ExplainError::LayerOrder {
                    ordinal: layer.ordinal,
                    last: last.ordinal,
                });
            }
        }
        let (_, h, w, c) = self.frames.dim();
        let (_, lh, lw, lc) = layer.heatmaps.dim();
        if (lh, lw, lc) != (h, w, c) {
            return Err(ExplainError::InvalidBundle(format!(
                "layer {} has {}x{}x{} heatmaps, frames are {}x{}x{}",
                layer.tag, lh, lw, lc, h, w, c
            )));
        }
        self.layers.push(layer);
        Ok(())
    }

    /// File stem `<model>_<subject>-<condition>-<view>`.
    #[must_use]
    pub fn file_stem(&self, model: &str) -> String {
        format!("{}_{}", model, self.key)
    }

    /// Manifest describing this bundle.
    #[must_use]
    pub fn manifest(&self, model: &str) -> BundleManifest {
        BundleManifest {
            model: model.to_string(),
            key: self.key.clone(),
            frames: self.frames.len_of(Axis(0)),
            layers: self
                .layers
                .iter()
                .map(|l| ManifestLayer {
                    ordinal: l.ordinal,
                    tag: l.tag.clone(),
                    frames: l.len(),
                })
                .collect(),
        }
    }

    /// Write the archive and its manifest into `dir`.
    ///
    /// Returns the archive path. No archive is left behind when either
    /// file fails to write.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or either file
    /// cannot be written.
    pub fn save(&self, dir: impl AsRef<Path>, model: &str) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let stem = self.file_stem(model);
        let archive_path = dir.join(format!("{stem}.npz"));
        let manifest_path = dir.join(format!("{stem}.json"));

        let manifest = serde_json::to_string_pretty(&self.manifest(model))?;
        let written = self
            .write_archive(&archive_path)
            .and_then(|()| std::fs::write(&manifest_path, manifest).map_err(ExplainError::from));
        if let Err(err) = written {
            tracing::warn!("Discarding incomplete bundle {}: {}", archive_path.display(), err);
            let _ = std::fs::remove_file(&archive_path);
            return Err(err);
        }

        Ok(archive_path)
    }

    fn write_archive(&self, path: &Path) -> Result<()> {
        let mut npz = NpzWriter::new_compressed(File::create(path)?);
        npz.add_array(FRAMES_KEY, &self.frames)
            .map_err(|e| ExplainError::Archive(format!("Failed to write '{FRAMES_KEY}': {e}")))?;
        for layer in &self.layers {
            let name = format!("{HEATMAP_PREFIX}{}", layer.tag);
            npz.add_array(name.as_str(), &layer.heatmaps)
                .map_err(|e| ExplainError::Archive(format!("Failed to write '{name}': {e}")))?;
        }
        npz.finish()
            .map_err(|e| ExplainError::Archive(format!("Failed to finish archive: {e}")))?;
        Ok(())
    }

    /// Read a bundle written by [`AttributionBundle::save`].
    ///
    /// `path` may name either the archive or its manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if either file is missing or the archive does not
    /// match the manifest.
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, BundleManifest)> {
        let archive_path = path.as_ref().with_extension("npz");
        let manifest_path = path.as_ref().with_extension("json");

        let manifest: BundleManifest =
            serde_json::from_reader(BufReader::new(File::open(&manifest_path)?))?;

        let mut npz = NpzReader::new(File::open(&archive_path)?)
            .map_err(|e| ExplainError::Archive(format!("Failed to read npz file: {e}")))?;
        let frames: Array4<u8> = npz
            .by_name(FRAMES_KEY)
            .map_err(|e| ExplainError::Archive(format!("Failed to read '{FRAMES_KEY}' from npz: {e}")))?;
        if frames.len_of(Axis(0)) != manifest.frames {
            return Err(ExplainError::InvalidBundle(format!(
                "manifest lists {} frames, archive holds {}",
                manifest.frames,
                frames.len_of(Axis(0))
            )));
        }

        let mut bundle = Self::new(manifest.key.clone(), frames);
        for entry in &manifest.layers {
            let name = format!("{HEATMAP_PREFIX}{}", entry.tag);
            let heatmaps: Array4<u8> = npz
                .by_name(&name)
                .map_err(|e| ExplainError::Archive(format!("Failed to read '{name}' from npz: {e}")))?;
            bundle.push_layer(LayerHeatmaps::new(entry.ordinal, entry.tag.clone(), heatmaps))?;
        }

        Ok((bundle, manifest))
    }
}

fn check_opacity(opacity: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&opacity) {
        return Err(gaitscope_core::CoreError::invalid_config(
            "opacity",
            opacity,
            "must lie in [0, 1]",
        )
        .into());
    }
    Ok(())
}

/// Blend a heatmap over a frame: `heatmap·α + frame·(1−α)`.
///
/// # Errors
///
/// Returns a configuration error for `opacity` outside `[0, 1]` and
/// [`ExplainError::InvalidBundle`] if the images differ in shape.
pub fn overlay(heatmap: ArrayView3<'_, u8>, frame: ArrayView3<'_, u8>, opacity: f32) -> Result<Array3<u8>> {
    check_opacity(opacity)?;
    if heatmap.dim() != frame.dim() {
        return Err(ExplainError::InvalidBundle(format!(
            "cannot overlay {:?} heatmap on {:?} frame",
            heatmap.dim(),
            frame.dim()
        )));
    }
    Ok(Zip::from(&heatmap).and(&frame).map_collect(|&h, &f| {
        (f32::from(h) * opacity + f32::from(f) * (1.0 - opacity))
            .round()
            .clamp(0.0, 255.0) as u8
    }))
}

fn overlay_stack(heatmaps: &Array4<u8>, frames: &Array4<u8>, opacity: f32) -> Result<Array4<u8>> {
    let mut out = Array4::<u8>::zeros(heatmaps.raw_dim());
    for ((mut slot, heatmap), frame) in out
        .axis_iter_mut(Axis(0))
        .zip(heatmaps.axis_iter(Axis(0)))
        .zip(frames.axis_iter(Axis(0)))
    {
        slot.assign(&overlay(heatmap, frame, opacity)?);
    }
    Ok(out)
}

/// Overlay every layer's heatmaps on the frames paired with them.
///
/// Returns `(tag, overlays)` per layer in ascending ordinal order.
///
/// # Errors
///
/// See [`overlay`].
pub fn merged_layers(bundle: &AttributionBundle, opacity: f32) -> Result<Vec<(String, Array4<u8>)>> {
    check_opacity(opacity)?;
    bundle
        .layers()
        .iter()
        .map(|layer| {
            let frames = layer.paired_frames(bundle.frames())?;
            Ok((layer.tag.clone(), overlay_stack(&layer.heatmaps, &frames, opacity)?))
        })
        .collect()
}

/// Frames and layer overlays aligned to a common length for side-by-side
/// comparison.
#[derive(Debug, Clone)]
pub struct ComparisonStack {
    /// Common temporal length.
    pub length: usize,
    /// `origin` followed by each layer tag in ascending ordinal order.
    pub tags: Vec<String>,
    /// One `(length, H, W, 3)` stack per tag.
    pub stacks: Vec<Array4<u8>>,
}

impl ComparisonStack {
    /// Write the stack as a compressed npz archive, one array per tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut npz = NpzWriter::new_compressed(File::create(path.as_ref())?);
        for (tag, stack) in self.tags.iter().zip(&self.stacks) {
            npz.add_array(tag.as_str(), stack)
                .map_err(|e| ExplainError::Archive(format!("Failed to write '{tag}': {e}")))?;
        }
        npz.finish()
            .map_err(|e| ExplainError::Archive(format!("Failed to finish archive: {e}")))?;
        Ok(())
    }
}

/// Align frames and every layer to the shortest length among them and
/// overlay each layer on the aligned frames.
///
/// # Errors
///
/// Returns a configuration error for an invalid opacity and
/// [`ExplainError::InvalidBundle`] for a bundle without layers.
pub fn comparison_frames(bundle: &AttributionBundle, opacity: f32) -> Result<ComparisonStack> {
    check_opacity(opacity)?;
    if bundle.layers().is_empty() {
        return Err(ExplainError::InvalidBundle(format!(
            "bundle {} holds no heatmaps",
            bundle.key()
        )));
    }

    let source_len = bundle.frames().len_of(Axis(0));
    let length = bundle
        .layers()
        .iter()
        .map(LayerHeatmaps::len)
        .fold(source_len, usize::min);

    let compressed: Vec<&str> = bundle
        .layers()
        .iter()
        .filter(|l| l.len() != length)
        .map(|l| l.tag.as_str())
        .collect();
    if length != source_len || !compressed.is_empty() {
        tracing::warn!(
            "Temporal compression detected; aligning {} frames and layers [{}] to {} slots",
            source_len,
            compressed.join(", "),
            length
        );
    }

    let origin = temporal_align_u8(bundle.frames(), length)?;
    let mut tags = vec![ORIGIN_KEY.to_string()];
    let mut stacks = Vec::with_capacity(bundle.layers().len() + 1);
    for layer in bundle.layers() {
        let heatmaps = temporal_align_u8(&layer.heatmaps, length)?;
        tags.push(layer.tag.clone());
        stacks.push(overlay_stack(&heatmaps, &origin, opacity)?);
    }
    stacks.insert(0, origin);

    Ok(ComparisonStack { length, tags, stacks })
}

/// Accumulates one sequence's heatmaps and persists them once complete.
#[derive(Debug)]
pub struct ResultAggregator {
    save_dir: PathBuf,
    model_name: String,
    current: Option<AttributionBundle>,
}

impl ResultAggregator {
    /// Create an aggregator writing into `save_dir`.
    pub fn new(save_dir: impl Into<PathBuf>, model_name: impl Into<String>) -> Self {
        Self {
            save_dir: save_dir.into(),
            model_name: model_name.into(),
            current: None,
        }
    }

    /// Output directory.
    #[must_use]
    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    /// Start a new sequence, discarding any unflushed one.
    pub fn begin(&mut self, key: SequenceKey, frames: Array4<u8>) {
        if let Some(stale) = self.current.take() {
            tracing::warn!("Discarding unflushed bundle {}", stale.key());
        }
        self.current = Some(AttributionBundle::new(key, frames));
    }

    /// Add one layer's heatmaps to the current sequence.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::InvalidBundle`] when no sequence was begun,
    /// or the ordering error from [`AttributionBundle::push_layer`].
    pub fn push(&mut self, layer: LayerHeatmaps) -> Result<()> {
        match self.current.as_mut() {
            Some(bundle) => bundle.push_layer(layer),
            None => Err(ExplainError::InvalidBundle(
                "heatmaps pushed before a sequence was begun".to_string(),
            )),
        }
    }

    /// Persist the current sequence and reset for the next one.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::InvalidBundle`] when no sequence was begun,
    /// or a write error.
    pub fn flush(&mut self) -> Result<PathBuf> {
        let bundle = self.current.take().ok_or_else(|| {
            ExplainError::InvalidBundle("flush called before a sequence was begun".to_string())
        })?;
        let path = bundle.save(&self.save_dir, &self.model_name)?;
        tracing::info!("The results have been saved in {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SequenceKey {
        SequenceKey::new("075", "nm-05", "090")
    }

    fn frames(t: usize, value: u8) -> Array4<u8> {
        Array4::from_elem((t, 4, 3, 3), value)
    }

    fn bundle() -> AttributionBundle {
        let mut bundle = AttributionBundle::new(key(), frames(8, 100));
        bundle
            .push_layer(LayerHeatmaps::new(1, "1_backbone-conv1", frames(8, 200)))
            .unwrap();
        bundle
            .push_layer(LayerHeatmaps::new(4, "4_temporal-pool", frames(4, 50)))
            .unwrap();
        bundle
    }

    #[test]
    fn test_push_layer_enforces_ascending_order() {
        let mut bundle = bundle();
        let err = bundle
            .push_layer(LayerHeatmaps::new(2, "2_backbone-conv2", frames(8, 0)))
            .unwrap_err();
        assert!(matches!(err, ExplainError::LayerOrder { ordinal: 2, last: 4 }));

        assert!(bundle
            .push_layer(LayerHeatmaps::new(4, "4_temporal-pool", frames(4, 0)))
            .is_err());
    }

    #[test]
    fn test_push_layer_checks_resolution() {
        let mut bundle = AttributionBundle::new(key(), frames(8, 0));
        let wrong = Array4::zeros((8, 2, 3, 3));
        assert!(matches!(
            bundle.push_layer(LayerHeatmaps::new(1, "1_a", wrong)),
            Err(ExplainError::InvalidBundle(_))
        ));
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(bundle().file_stem("GaitSet"), "GaitSet_075-nm-05-090");
    }

    #[test]
    fn test_save_and_load_preserve_layer_order() {
        let dir = tempfile::tempdir().unwrap();
        let original = bundle();
        let path = original.save(dir.path(), "GaitSet").unwrap();
        assert_eq!(path.file_name().unwrap(), "GaitSet_075-nm-05-090.npz");
        assert!(path.with_extension("json").exists());

        let (loaded, manifest) = AttributionBundle::load(&path).unwrap();
        assert_eq!(manifest.model, "GaitSet");
        assert_eq!(loaded.key(), &key());
        assert_eq!(loaded.frames(), original.frames());
        let tags: Vec<&str> = loaded.layers().iter().map(|l| l.tag.as_str()).collect();
        assert_eq!(tags, vec!["1_backbone-conv1", "4_temporal-pool"]);
        assert_eq!(loaded.layers()[1].heatmaps, original.layers()[1].heatmaps);
    }

    #[test]
    fn test_failed_manifest_leaves_no_archive() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the manifest should go makes its write fail.
        std::fs::create_dir(dir.path().join("GaitSet_075-nm-05-090.json")).unwrap();

        let err = bundle().save(dir.path(), "GaitSet").unwrap_err();
        assert!(matches!(err, ExplainError::IoError(_)));
        assert!(!dir.path().join("GaitSet_075-nm-05-090.npz").exists());
    }

    #[test]
    fn test_overlay_blends() {
        let heat = Array3::from_elem((2, 2, 3), 200_u8);
        let frame = Array3::from_elem((2, 2, 3), 100_u8);
        let out = overlay(heat.view(), frame.view(), 0.6).unwrap();
        assert!(out.iter().all(|&v| v == 160));

        let only_frame = overlay(heat.view(), frame.view(), 0.0).unwrap();
        assert_eq!(only_frame, frame);
    }

    #[test]
    fn test_overlay_rejects_bad_opacity() {
        let img = Array3::<u8>::zeros((2, 2, 3));
        for opacity in [-0.1, 1.5, f32::NAN] {
            assert!(overlay(img.view(), img.view(), opacity).is_err());
        }
    }

    #[test]
    fn test_merged_layers_pair_compressed_frames() {
        let merged = merged_layers(&bundle(), 0.5).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].1.dim(), (8, 4, 3, 3));
        assert_eq!(merged[1].0, "4_temporal-pool");
        assert_eq!(merged[1].1.dim(), (4, 4, 3, 3));
        assert!(merged[1].1.iter().all(|&v| v == 75));
    }

    #[test]
    fn test_comparison_aligns_to_shortest() {
        let stack = comparison_frames(&bundle(), 0.6).unwrap();
        assert_eq!(stack.length, 4);
        assert_eq!(stack.tags, vec!["origin", "1_backbone-conv1", "4_temporal-pool"]);
        assert!(stack.stacks.iter().all(|s| s.dim() == (4, 4, 3, 3)));
        assert!(stack.stacks[0].iter().all(|&v| v == 100));
        assert!(stack.stacks[1].iter().all(|&v| v == 160));
    }

    #[test]
    fn test_aggregator_requires_begin() {
        let dir = tempfile::tempdir().unwrap();
        let mut aggregator = ResultAggregator::new(dir.path(), "GaitSet");
        assert!(aggregator.flush().is_err());
        assert!(aggregator
            .push(LayerHeatmaps::new(1, "1_a", frames(8, 0)))
            .is_err());

        aggregator.begin(key(), frames(8, 0));
        aggregator
            .push(LayerHeatmaps::new(1, "1_a", frames(8, 0)))
            .unwrap();
        let path = aggregator.flush().unwrap();
        assert!(path.exists());
        assert!(aggregator.flush().is_err());
    }
}
