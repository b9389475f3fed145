//! Persistence of embeddings.
//!
//! Coordinates and class indices go into a compressed npz archive; the
//! label strings go into a JSON sidecar with the same stem, since npy
//! arrays cannot hold strings.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2};
use ndarray_npy::{NpzReader, NpzWriter};
use serde::{Deserialize, Serialize};

use crate::embedding::Embedding;
use crate::error::{AnalysisError, Result};

/// Archive key of the coordinates.
pub const FEATS_KEY: &str = "feats";

/// Archive key of the per-record class indices.
pub const LABEL_IDS_KEY: &str = "label_ids";

#[derive(Debug, Serialize, Deserialize)]
struct LabelSidecar {
    labels: Vec<String>,
    classes: Vec<String>,
}

/// Embedding coordinates with labels and class indices.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingBundle {
    /// Coordinates `(N, D)`.
    pub coords: Array2<f32>,
    /// Labels in record order.
    pub labels: Vec<String>,
    /// Sorted unique labels.
    pub classes: Vec<String>,
    /// Index into `classes` per record.
    pub label_ids: Vec<u32>,
}

impl EmbeddingBundle {
    /// Build a bundle, deriving classes and class indices from the labels.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::CountMismatch`] if the label count differs
    /// from the number of rows.
    pub fn new(coords: Array2<f32>, labels: Vec<String>) -> Result<Self> {
        if coords.nrows() != labels.len() {
            return Err(AnalysisError::CountMismatch {
                emitted: coords.nrows(),
                received: labels.len(),
            });
        }
        let classes: Vec<String> = labels
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let label_ids = labels
            .iter()
            .map(|l| classes.binary_search(l).map(|i| i as u32).unwrap_or(0))
            .collect();
        Ok(Self {
            coords,
            labels,
            classes,
            label_ids,
        })
    }

    /// Sidecar path for an archive path.
    #[must_use]
    pub fn sidecar_path(path: &Path) -> PathBuf {
        path.with_extension("json")
    }

    /// Write the archive and its label sidecar.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut npz = NpzWriter::new_compressed(File::create(path)?);
        npz.add_array(FEATS_KEY, &self.coords)
            .map_err(|e| AnalysisError::Archive(format!("Failed to write '{FEATS_KEY}': {e}")))?;
        npz.add_array(LABEL_IDS_KEY, &Array1::from(self.label_ids.clone()))
            .map_err(|e| AnalysisError::Archive(format!("Failed to write '{LABEL_IDS_KEY}': {e}")))?;
        npz.finish()
            .map_err(|e| AnalysisError::Archive(format!("Failed to finish archive: {e}")))?;

        let sidecar = LabelSidecar {
            labels: self.labels.clone(),
            classes: self.classes.clone(),
        };
        std::fs::write(Self::sidecar_path(path), serde_json::to_string_pretty(&sidecar)?)?;
        tracing::info!("Embedding saved to {}", path.display());
        Ok(())
    }

    /// Read a bundle written by [`EmbeddingBundle::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if a file is missing or the archive and sidecar
    /// disagree.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut npz = NpzReader::new(File::open(path)?)
            .map_err(|e| AnalysisError::Archive(format!("Failed to read npz file: {e}")))?;
        let coords: Array2<f32> = npz
            .by_name(FEATS_KEY)
            .map_err(|e| AnalysisError::Archive(format!("Failed to read '{FEATS_KEY}' from npz: {e}")))?;
        let label_ids: Array1<u32> = npz
            .by_name(LABEL_IDS_KEY)
            .map_err(|e| AnalysisError::Archive(format!("Failed to read '{LABEL_IDS_KEY}' from npz: {e}")))?;

        let sidecar: LabelSidecar =
            serde_json::from_reader(BufReader::new(File::open(Self::sidecar_path(path))?))?;

        let bundle = Self::new(coords, sidecar.labels)?;
        if bundle.classes != sidecar.classes || bundle.label_ids != label_ids.to_vec() {
            return Err(AnalysisError::Archive(
                "label sidecar does not match the archive".to_string(),
            ));
        }
        Ok(bundle)
    }
}

impl TryFrom<Embedding> for EmbeddingBundle {
    type Error = AnalysisError;

    fn try_from(embedding: Embedding) -> Result<Self> {
        Self::new(embedding.coords, embedding.labels)
    }
}
