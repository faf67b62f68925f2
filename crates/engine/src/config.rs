//! Discovery run configuration, read from TOML
//!
//! ```toml
//! max_factors = 6
//! min_sample = 15
//! prune_ratio = 0.5
//! prune = true
//! batch_size = 2000
//! metadata_every = 5
//! workers = 4
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::LoadError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Side + size + optional factors
    pub max_factors: usize,
    /// Minimum matching-set size a strategy must plausibly reach
    pub min_sample: usize,
    /// Scale applied to the smallest factor set when estimating an intersection
    pub prune_ratio: f64,
    /// Disable for an exhaustive enumeration
    pub prune: bool,
    /// Summaries buffered before one append
    pub batch_size: usize,
    /// Flushes between metadata rewrites
    pub metadata_every: usize,
    /// Parallel shards, each with its own cache and output file
    pub workers: usize,
    /// Summaries with fewer bets are not written
    pub min_bets_to_write: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_factors: 6,
            min_sample: 15,
            prune_ratio: 0.5,
            prune: true,
            batch_size: 2000,
            metadata_every: 5,
            workers: 1,
            min_bets_to_write: 0,
        }
    }
}

impl DiscoveryConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: DiscoveryConfig = toml::from_str(&contents).map_err(|source| LoadError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        if self.max_factors < 2 {
            return Err(LoadError::Config("max_factors must be at least 2".to_string()));
        }
        if !(self.prune_ratio > 0.0 && self.prune_ratio.is_finite()) {
            return Err(LoadError::Config("prune_ratio must be a positive number".to_string()));
        }
        if self.batch_size == 0 {
            return Err(LoadError::Config("batch_size must be at least 1".to_string()));
        }
        if self.metadata_every == 0 {
            return Err(LoadError::Config("metadata_every must be at least 1".to_string()));
        }
        if self.workers == 0 {
            return Err(LoadError::Config("workers must be at least 1".to_string()));
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
        let config = DiscoveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_factors, 6);
        assert!(config.prune);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "min_sample = 10\nprune = false\nworkers = 3").unwrap();
        let config = DiscoveryConfig::load(file.path()).unwrap();
        assert_eq!(config.min_sample, 10);
        assert!(!config.prune);
        assert_eq!(config.workers, 3);
        assert_eq!(config.batch_size, 2000);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_factors = 1").unwrap();
        assert!(matches!(DiscoveryConfig::load(file.path()), Err(LoadError::Config(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_factor = 4").unwrap();
        assert!(matches!(DiscoveryConfig::load(file.path()), Err(LoadError::Toml { .. })));
    }
}
