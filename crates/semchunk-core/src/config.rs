//! Store configuration.
//!
//! Every section has defaults, so a config file only needs the values it
//! changes. Durations are given in milliseconds.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default embedding dimensionality.
pub const DEFAULT_DIMENSIONS: usize = 1536;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Embedding dimensionality D
    pub dimensions: usize,
    /// Vector index settings
    pub index: IndexConfig,
    /// Query planner settings
    pub planner: PlannerConfig,
    /// Ingest settings
    pub ingest: IngestConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
            index: IndexConfig::default(),
            planner: PlannerConfig::default(),
            ingest: IngestConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Defaults with a different dimensionality.
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            dimensions,
            ..Self::default()
        }
    }

    /// Load from a JSON file and validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: StoreConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the components cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.dimensions == 0 {
            return Err(Error::Config("dimensions must be positive".to_string()));
        }
        self.index.validate()?;
        self.planner.validate()?;
        self.ingest.validate()
    }
}

/// Vector index settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Fixed cluster count; `sqrt(n)` when unset
    pub clusters: Option<usize>,
    /// Upper bound for the automatic cluster count
    pub max_clusters: usize,
    /// Live vectors required before the index is trained
    pub min_train_size: usize,
    /// Vectors sampled for k-means
    pub train_sample_size: usize,
    /// Lloyd iterations per training
    pub kmeans_iterations: usize,
    /// Retrain after this many inserts since the last training
    pub retrain_after_inserts: usize,
    /// Retrain when tombstones exceed this share of entries
    pub max_tombstone_ratio: f32,
    /// RNG seed for sampling and seeding
    pub seed: u64,
    /// Retrain in the background once a write crosses a threshold
    pub auto_retrain: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            clusters: None,
            max_clusters: 1024,
            min_train_size: 256,
            train_sample_size: 20_000,
            kmeans_iterations: 20,
            retrain_after_inserts: 10_000,
            max_tombstone_ratio: 0.2,
            seed: 0x5eed,
            auto_retrain: true,
        }
    }
}

impl IndexConfig {
    fn validate(&self) -> Result<()> {
        if self.clusters == Some(0) || self.max_clusters == 0 {
            return Err(Error::Config("cluster count must be positive".to_string()));
        }
        if self.min_train_size == 0 || self.train_sample_size == 0 {
            return Err(Error::Config("training sizes must be positive".to_string()));
        }
        if self.kmeans_iterations == 0 {
            return Err(Error::Config("kmeans_iterations must be positive".to_string()));
        }
        if !(self.max_tombstone_ratio > 0.0 && self.max_tombstone_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "max_tombstone_ratio must be in (0, 1], got {}",
                self.max_tombstone_ratio
            )));
        }
        Ok(())
    }
}

/// Query planner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Clusters probed by default
    pub probe_count: usize,
    /// Exact scan when the estimated match count is at most this multiple of k
    pub exact_scan_factor: usize,
    /// Initial over-fetch multiple for the index path
    pub oversample_factor: usize,
    /// Doublings of k' before giving up
    pub max_retries: usize,
    /// Per-search deadline in milliseconds
    pub search_timeout_ms: u64,
    /// Lifetime of cached cardinality statistics in milliseconds
    pub stats_ttl_ms: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            probe_count: 8,
            exact_scan_factor: 4,
            oversample_factor: 2,
            max_retries: 3,
            search_timeout_ms: 250,
            stats_ttl_ms: 30_000,
        }
    }
}

impl PlannerConfig {
    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub fn stats_ttl(&self) -> Duration {
        Duration::from_millis(self.stats_ttl_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.probe_count == 0 {
            return Err(Error::Config("probe_count must be positive".to_string()));
        }
        if self.exact_scan_factor == 0 {
            return Err(Error::Config("exact_scan_factor must be positive".to_string()));
        }
        if self.oversample_factor == 0 {
            return Err(Error::Config("oversample_factor must be positive".to_string()));
        }
        Ok(())
    }
}

/// Ingest settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Extra attempts for a failed index insert
    pub index_retries: u32,
    /// First backoff delay in milliseconds, doubled per attempt
    pub retry_backoff_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            index_retries: 3,
            retry_backoff_ms: 20,
        }
    }
}

impl IngestConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.index_retries > 16 {
            return Err(Error::Config("index_retries must be at most 16".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::default();
        assert_eq!(config.dimensions, 1536);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "dimensions": 8, "planner": {{ "probe_count": 2 }} }}"#).unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.dimensions, 8);
        assert_eq!(config.planner.probe_count, 2);
        assert_eq!(config.planner.max_retries, 3);
        assert_eq!(config.index, IndexConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = StoreConfig::with_dimensions(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.dimensions = 4;
        config.index.max_tombstone_ratio = 1.5;
        assert!(config.validate().is_err());

        config.index.max_tombstone_ratio = 0.2;
        config.planner.probe_count = 0;
        assert!(config.validate().is_err());

        config.planner.probe_count = 8;
        config.planner.exact_scan_factor = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
