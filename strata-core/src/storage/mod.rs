//! Partition store - owns the folder tree, open file sets and maintenance

mod clock;
mod handle;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use handle::StoreHandle;
pub use store::PartitionStore;

use crate::config;
use crate::partition::{FolderNaming, PartitionUnit};
use crate::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Partition store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory holding the partition folders
    pub root: PathBuf,
    /// Partition granularity
    pub partition_unit: PartitionUnit,
    /// Name day folders `yyyyMMdd` instead of epoch millis
    pub compat_folder_names: bool,
    /// Open file sets before a quarter of them is closed
    pub max_open_folders: usize,
    /// Cache flush period in ms; 0 flushes on every write
    pub flush_period_ms: u64,
    /// Days of data to keep; 0 keeps everything
    pub lifetime_days: u32,
    /// Size cap in MB; 0 disables size eviction
    pub max_size_mb: u64,
    /// Period of the retention jobs in ms
    pub expiration_check_interval_ms: u64,
    /// Delay before the first retention run in ms
    pub expiration_initial_delay_ms: u64,
    /// Period of the external-change reload in ms; 0 disables it
    pub reload_interval_ms: u64,
    /// Shared decode cache capacity in records
    pub cache_capacity: usize,
    /// Use a no-op decode cache
    pub cache_disabled: bool,
    /// Reject appends and run no maintenance jobs
    pub read_only: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            partition_unit: PartitionUnit::Days,
            compat_folder_names: false,
            max_open_folders: config::DEFAULT_MAX_OPEN_FOLDERS,
            flush_period_ms: config::DEFAULT_FLUSH_PERIOD_MS,
            lifetime_days: 0,
            max_size_mb: 0,
            expiration_check_interval_ms: config::DEFAULT_EXPIRATION_CHECK_INTERVAL_MS,
            expiration_initial_delay_ms: config::DEFAULT_EXPIRATION_INITIAL_DELAY_MS,
            reload_interval_ms: 0,
            cache_capacity: config::DEFAULT_CACHE_CAPACITY,
            cache_disabled: false,
            read_only: false,
        }
    }
}

impl StoreConfig {
    /// Default configuration rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check combinations and clamp values to their minimums
    pub fn validate(mut self) -> Result<Self> {
        if self.compat_folder_names && self.partition_unit != PartitionUnit::Days {
            return Err(StoreError::Config(format!(
                "compatibility folder names require day partitions, got {:?}",
                self.partition_unit
            )));
        }
        if self.root.as_os_str().is_empty() {
            return Err(StoreError::Config("root directory must not be empty".into()));
        }
        self.max_open_folders = self.max_open_folders.max(config::MIN_MAX_OPEN_FOLDERS);
        if self.flush_period_ms > 0 {
            self.flush_period_ms = self.flush_period_ms.max(config::MIN_FLUSH_PERIOD_MS);
        }
        if self.max_size_mb > 0 {
            self.max_size_mb = self.max_size_mb.max(config::MIN_MAX_SIZE_MB);
        }
        self.expiration_check_interval_ms = self
            .expiration_check_interval_ms
            .max(config::MIN_EXPIRATION_CHECK_INTERVAL_MS);
        Ok(self)
    }

    pub fn folder_naming(&self) -> FolderNaming {
        if self.compat_folder_names {
            FolderNaming::Compat
        } else {
            FolderNaming::Millis
        }
    }

    /// Every append invalidates immediately instead of waiting for the flusher
    pub fn flush_on_write(&self) -> bool {
        self.flush_period_ms == 0
    }

    pub fn flush_period(&self) -> Duration {
        Duration::from_millis(self.flush_period_ms)
    }

    pub fn expiration_check_interval(&self) -> Duration {
        Duration::from_millis(self.expiration_check_interval_ms)
    }

    pub fn expiration_initial_delay(&self) -> Duration {
        Duration::from_millis(self.expiration_initial_delay_ms)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_millis(self.reload_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.partition_unit, PartitionUnit::Days);
        assert_eq!(config.max_open_folders, 512);
        assert_eq!(config.flush_period_ms, 10_000);
        assert_eq!(config.cache_capacity, 100_000);
        assert_eq!(config.folder_naming(), FolderNaming::Millis);
        assert!(!config.flush_on_write());
    }

    #[test]
    fn test_validate_clamps() {
        let config = StoreConfig {
            max_open_folders: 1,
            flush_period_ms: 10,
            max_size_mb: 1,
            expiration_check_interval_ms: 1,
            ..StoreConfig::new("/tmp/x")
        }
        .validate()
        .unwrap();
        assert_eq!(config.max_open_folders, 8);
        assert_eq!(config.flush_period_ms, 1_000);
        assert_eq!(config.max_size_mb, 2);
        assert_eq!(config.expiration_check_interval_ms, 300_000);

        let zero = StoreConfig {
            flush_period_ms: 0,
            max_size_mb: 0,
            ..StoreConfig::new("/tmp/x")
        }
        .validate()
        .unwrap();
        assert!(zero.flush_on_write());
        assert_eq!(zero.max_size_mb, 0);
    }

    #[test]
    fn test_compat_requires_days() {
        let err = StoreConfig {
            compat_folder_names: true,
            partition_unit: PartitionUnit::Hours,
            ..StoreConfig::new("/tmp/x")
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));

        let ok = StoreConfig {
            compat_folder_names: true,
            ..StoreConfig::new("/tmp/x")
        }
        .validate()
        .unwrap();
        assert_eq!(ok.folder_naming(), FolderNaming::Compat);
    }

    #[test]
    fn test_from_json() {
        let config = StoreConfig::from_json_str(
            r#"{ "root": "/var/lib/strata", "partition_unit": "hours", "lifetime_days": 7 }"#,
        )
        .unwrap();
        assert_eq!(config.root, PathBuf::from("/var/lib/strata"));
        assert_eq!(config.partition_unit, PartitionUnit::Hours);
        assert_eq!(config.lifetime_days, 7);
        assert_eq!(config.max_open_folders, 512);

        let err = StoreConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn test_load_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("store.json");
        std::fs::write(&path, r#"{ "max_size_mb": 100, "read_only": true }"#).unwrap();
        let config = StoreConfig::load(&path).unwrap();
        assert_eq!(config.max_size_mb, 100);
        assert!(config.read_only);
    }
}
