//! Strata Core - embedded time-series storage engine
//!
//! Persists labeled numeric samples into time-aligned partition folders and
//! serves point and range reads through a bounded decode cache.
//!
//! # Architecture
//!
//! - **Codec**: byte-exact record layouts for fixed and flexible interval files
//! - **File Unit**: one physical file of samples for one label within one partition
//! - **Partition File Set**: the sorted file units of one (label, partition)
//! - **Decode Cache**: size-bounded shared cache of fully decoded files
//! - **Partition Store**: folder lock, partition list, open sets, maintenance jobs

pub mod cache;
pub mod codec;
pub mod file;
pub mod maintenance;
pub mod partition;
pub mod storage;

mod error;
mod types;

pub use error::{Result, StoreError};
pub use storage::{PartitionStore, StoreConfig, StoreHandle};
pub use types::*;

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// On-disk format constants and configuration defaults
pub mod config {
    /// File header: start timestamp followed by the storage period
    pub const HEADER_SIZE: u64 = 16;

    /// Fixed-interval slot: value (f64) + quality (u8)
    pub const FIXED_RECORD_SIZE: u64 = 9;

    /// Flexible-interval record: timestamp (i64) + value (f64) + quality (u8)
    pub const FLEXIBLE_RECORD_SIZE: u64 = 17;

    /// Period marker stored in the header of flexible-interval files
    pub const FLEXIBLE_PERIOD: i64 = -1;

    /// Extension of every sample file
    pub const FILE_EXTENSION: &str = ".slots";

    /// Milliseconds in one day
    pub const MILLIS_PER_DAY: i64 = 86_400_000;

    /// Shared decode cache capacity, in records
    pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

    /// Open partition file sets before eviction kicks in
    pub const DEFAULT_MAX_OPEN_FOLDERS: usize = 512;
    pub const MIN_MAX_OPEN_FOLDERS: usize = 8;

    /// Flusher period (10s)
    pub const DEFAULT_FLUSH_PERIOD_MS: u64 = 10_000;
    pub const MIN_FLUSH_PERIOD_MS: u64 = 1_000;

    /// Smallest accepted size cap
    pub const MIN_MAX_SIZE_MB: u64 = 2;

    /// Retention check cadence (1 day, at least 5 minutes)
    pub const DEFAULT_EXPIRATION_CHECK_INTERVAL_MS: u64 = 86_400_000;
    pub const MIN_EXPIRATION_CHECK_INTERVAL_MS: u64 = 5 * 60 * 1000;

    /// Delay before the first retention check (2 minutes)
    pub const DEFAULT_EXPIRATION_INITIAL_DELAY_MS: u64 = 2 * 60 * 1000;
}
