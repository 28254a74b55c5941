//! The store's maintenance jobs
//!
//! Jobs hold a weak reference so a running scheduler never keeps a closed
//! store alive.

use super::MaintenanceJob;
use crate::storage::PartitionStore;
use crate::Result;
use std::sync::{Arc, Weak};
use tracing::info;

macro_rules! store_or_return {
    ($weak:expr) => {
        match $weak.upgrade() {
            Some(store) if !store.is_closed() => store,
            _ => return Ok(()),
        }
    };
}

/// Invalidates the decode cache of every open file set
pub struct Flusher {
    store: Weak<PartitionStore>,
}

impl Flusher {
    pub fn new(store: &Arc<PartitionStore>) -> Self {
        Self {
            store: Arc::downgrade(store),
        }
    }
}

impl MaintenanceJob for Flusher {
    fn name(&self) -> &'static str {
        "flusher"
    }

    fn run(&self) -> Result<()> {
        let store = store_or_return!(self.store);
        store.flush()
    }

    fn runs_on_stop(&self) -> bool {
        true
    }
}

/// Deletes partitions older than the configured lifetime
pub struct AgeDeletion {
    store: Weak<PartitionStore>,
}

impl AgeDeletion {
    pub fn new(store: &Arc<PartitionStore>) -> Self {
        Self {
            store: Arc::downgrade(store),
        }
    }
}

impl MaintenanceJob for AgeDeletion {
    fn name(&self) -> &'static str {
        "age-deletion"
    }

    fn run(&self) -> Result<()> {
        let store = store_or_return!(self.store);
        let deleted = store.delete_expired()?;
        if deleted > 0 {
            info!(deleted, "Deleted expired partitions");
        }
        Ok(())
    }
}

/// Deletes the oldest partitions while the store exceeds its size cap
pub struct SizeEviction {
    store: Weak<PartitionStore>,
}

impl SizeEviction {
    pub fn new(store: &Arc<PartitionStore>) -> Self {
        Self {
            store: Arc::downgrade(store),
        }
    }
}

impl MaintenanceJob for SizeEviction {
    fn name(&self) -> &'static str {
        "size-eviction"
    }

    fn run(&self) -> Result<()> {
        let store = store_or_return!(self.store);
        let deleted = store.evict_oversize()?;
        if deleted > 0 {
            info!(deleted, "Evicted partitions over the size cap");
        }
        Ok(())
    }
}

/// Picks up partition folders changed by other processes
pub struct PartitionReload {
    store: Weak<PartitionStore>,
}

impl PartitionReload {
    pub fn new(store: &Arc<PartitionStore>) -> Self {
        Self {
            store: Arc::downgrade(store),
        }
    }
}

impl MaintenanceJob for PartitionReload {
    fn name(&self) -> &'static str {
        "partition-reload"
    }

    fn run(&self) -> Result<()> {
        let store = store_or_return!(self.store);
        let found = store.reload_partitions()?;
        if !found.is_empty() {
            info!(count = found.len(), "Found new partitions");
        }
        Ok(())
    }
}
