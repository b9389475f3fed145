//! Embedding run configuration.

use std::path::Path;

use gaitscope_core::{CoreError, Seed};
use serde::{Deserialize, Serialize};

/// Configuration of a streaming embedding run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Records per bucket handed to the reducer at once.
    pub bucket_capacity: usize,
    /// Capacity of the producer/consumer channel.
    pub channel_capacity: usize,
    /// Requested embedding dimension.
    pub embed_dim: usize,
    /// Seed of the built-in reducer.
    pub seed: Seed,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            bucket_capacity: 1000,
            channel_capacity: 64,
            embed_dim: 2,
            seed: Seed::DEFAULT,
        }
    }
}

impl EmbeddingConfig {
    /// Check the configuration before streaming starts.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.bucket_capacity == 0 {
            return Err(CoreError::invalid_config("bucket_capacity", 0, "must be positive"));
        }
        if self.channel_capacity == 0 {
            return Err(CoreError::invalid_config("channel_capacity", 0, "must be positive"));
        }
        if self.embed_dim == 0 {
            return Err(CoreError::invalid_config("embed_dim", 0, "must be positive"));
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
