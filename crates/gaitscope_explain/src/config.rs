//! Saliency run configuration.

use std::path::{Path, PathBuf};

use gaitscope_core::CoreError;
use serde::{Deserialize, Serialize};

use crate::target::DistanceMetric;

/// Configuration of a saliency run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaliencyConfig {
    /// 1-based layer ordinals to hook.
    pub layers: Vec<usize>,
    /// Metric used to pick the nearest gallery row.
    pub metric: DistanceMetric,
    /// Model name used in bundle file names.
    pub model_name: String,
    /// Directory bundles are written to.
    pub save_dir: PathBuf,
    /// Heatmap opacity used when overlaying on frames.
    pub opacity: f32,
}

impl Default for SaliencyConfig {
    fn default() -> Self {
        Self {
            layers: Vec::new(),
            metric: DistanceMetric::Euclidean,
            model_name: "GaitSet".to_string(),
            save_dir: PathBuf::from("./visualization"),
            opacity: 0.6,
        }
    }
}

impl SaliencyConfig {
    /// Selected ordinals, duplicate-free and ascending.
    #[must_use]
    pub fn normalized_layers(&self) -> Vec<usize> {
        let mut layers = self.layers.clone();
        layers.sort_unstable();
        layers.dedup();
        layers
    }

    /// Check the configuration before any capture begins.
    ///
    /// Layer ordinals are checked against the encoder at registration.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.layers.is_empty() {
            return Err(CoreError::invalid_config("layers", "[]", "select at least one layer"));
        }
        if let Some(&zero) = self.layers.iter().find(|&&l| l == 0) {
            return Err(CoreError::invalid_config("layers", zero, "layer ids start at 1"));
        }
        if !(0.0..=1.0).contains(&self.opacity) {
            return Err(CoreError::invalid_config("opacity", self.opacity, "must lie in [0, 1]"));
        }
        if self.model_name.trim().is_empty() {
            return Err(CoreError::invalid_config("model_name", "\"\"", "must not be empty"));
        }
        Ok(())
    }

    /// Load and validate a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or fails
    /// validation.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_opacity() {
        let config = SaliencyConfig::default();
        assert!((config.opacity - 0.6).abs() < f32::EPSILON);
        assert_eq!(config.metric, DistanceMetric::Euclidean);
    }

    #[test]
    fn test_normalized_layers_sorted_unique() {
        let config = SaliencyConfig {
            layers: vec![12, 3, 7, 3],
            ..Default::default()
        };
        assert_eq!(config.normalized_layers(), vec![3, 7, 12]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = SaliencyConfig {
            layers: vec![1],
            ..Default::default()
        };
        assert!(base.validate().is_ok());

        let no_layers = SaliencyConfig {
            layers: vec![],
            ..base.clone()
        };
        assert!(no_layers.validate().is_err());

        let opacity = SaliencyConfig {
            opacity: 1.2,
            ..base.clone()
        };
        let err = opacity.validate().unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig { ref field, .. } if field == "opacity"));

        let zero = SaliencyConfig {
            layers: vec![0, 2],
            ..base
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saliency.json");
        std::fs::write(&path, r#"{"layers": [5, 2], "metric": "cosine", "model_name": "GaitGL"}"#).unwrap();

        let config = SaliencyConfig::from_json_file(&path).unwrap();
        assert_eq!(config.metric, DistanceMetric::Cosine);
        assert_eq!(config.normalized_layers(), vec![2, 5]);
        assert!((config.opacity - 0.6).abs() < f32::EPSILON);
    }
}
