//! Engine configuration
//!
//! Defaults merged with an optional TOML file and `FETCHKIT_`-prefixed
//! environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::Format;
use serde::{Deserialize, Serialize};

use crate::cache::StorageRoots;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub queues: QueuesConfig,
    pub retry: RetryConfig,
    pub memory: MemoryConfig,
}

/// Storage tier roots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Durable root for `permanent` files
    pub support_dir: PathBuf,
    /// Reclaimable root for `cached` files (also hosts transfer scratch)
    pub cache_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            support_dir: PathBuf::from("./data/support"),
            cache_dir: PathBuf::from("./data/cache"),
        }
    }
}

/// Queue concurrency and callback pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuesConfig {
    /// Concurrent downloads on the normal queue (0 is treated as 1)
    pub normal_simultaneous: usize,
    /// Concurrent downloads on the priority queue (0 is treated as 1)
    pub priority_simultaneous: usize,
    /// Minimum interval between transfer-data callbacks, in milliseconds
    pub transfer_throttle_ms: u64,
    /// Cloud-asset batching window, in milliseconds
    pub cloud_batch_window_ms: u64,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            normal_simultaneous: 20,
            priority_simultaneous: 30,
            transfer_throttle_ms: 250,
            cloud_batch_window_ms: 500,
        }
    }
}

/// Mirror retry budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts allowed per (resource, mirror) pair
    pub per_mirror_budget: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            per_mirror_budget: 3,
        }
    }
}

/// Memory cache bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub file_capacity: u64,
    pub image_capacity: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            file_capacity: 100_000,
            image_capacity: 500,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            queues: QueuesConfig::default(),
            retry: RetryConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration: defaults, then the TOML file at `path` (if it
    /// exists), then `FETCHKIT_*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config = figment::Figment::new()
            .merge(figment::providers::Serialized::defaults(Self::default()))
            .merge(figment::providers::Toml::file(path.as_ref()))
            .merge(figment::providers::Env::prefixed("FETCHKIT_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Persist the configuration as pretty TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        tracing::info!("Configuration saved to {:?}", path);
        Ok(())
    }

    pub fn storage_roots(&self) -> StorageRoots {
        StorageRoots::new(&self.storage.support_dir, &self.storage.cache_dir)
    }

    pub fn transfer_throttle(&self) -> Duration {
        Duration::from_millis(self.queues.transfer_throttle_ms)
    }

    pub fn cloud_batch_window(&self) -> Duration {
        Duration::from_millis(self.queues.cloud_batch_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.queues.normal_simultaneous, 20);
        assert_eq!(config.queues.priority_simultaneous, 30);
        assert_eq!(config.retry.per_mirror_budget, 3);
        assert_eq!(config.transfer_throttle(), Duration::from_millis(250));
        assert_eq!(config.cloud_batch_window(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.queues.normal_simultaneous, 20);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config/fetchkit.toml");

        let mut config = EngineConfig::default();
        config.queues.normal_simultaneous = 4;
        config.retry.per_mirror_budget = 5;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.queues.normal_simultaneous, 4);
        assert_eq!(loaded.retry.per_mirror_budget, 5);
    }
}
