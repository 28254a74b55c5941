//! Reference-counted store handle
//!
//! Every clone of a [`StoreHandle`] counts as one reference. Dropping the
//! last one closes the store; `close` closes it right away for everyone.

use super::{Clock, PartitionStore, StoreConfig};
use crate::{Quality, Result, Sample, SeriesConfig, StoreError, Timestamp};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Outstanding handles of one store
#[derive(Debug)]
struct ReferenceCounter {
    count: AtomicUsize,
    closed: AtomicBool,
}

impl ReferenceCounter {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn acquire(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// True when this was the last reference
    fn release(&self) -> bool {
        self.count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// True for the first caller only
    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Cloneable entry point to a partition store
#[derive(Debug)]
pub struct StoreHandle {
    store: Arc<PartitionStore>,
    refs: Arc<ReferenceCounter>,
}

impl StoreHandle {
    /// Open the store described by `config`
    pub fn open(config: StoreConfig) -> Result<Self> {
        Ok(Self::from_store(PartitionStore::open(config)?))
    }

    /// Open with an explicit time source
    pub fn open_with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self::from_store(PartitionStore::open_with_clock(config, clock)?))
    }

    fn from_store(store: Arc<PartitionStore>) -> Self {
        Self {
            store,
            refs: Arc::new(ReferenceCounter::new()),
        }
    }

    fn store(&self) -> Result<&PartitionStore> {
        if self.refs.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(&self.store)
    }

    /// Close the store now, regardless of other handles
    pub fn close(self) -> Result<()> {
        if self.refs.mark_closed() {
            self.store.close()
        } else {
            Ok(())
        }
    }

    pub fn is_closed(&self) -> bool {
        self.refs.is_closed()
    }

    /// Number of live handles
    pub fn references(&self) -> usize {
        self.refs.count.load(Ordering::Acquire)
    }

    /// Direct access to the underlying store
    pub fn inner(&self) -> &Arc<PartitionStore> {
        &self.store
    }

    pub fn append(
        &self,
        label: &str,
        value: f64,
        timestamp: Timestamp,
        quality: Quality,
        series: &SeriesConfig,
    ) -> Result<()> {
        self.store()?.append(label, value, timestamp, quality, series)
    }

    pub fn read(&self, label: &str, timestamp: Timestamp) -> Result<Option<Sample>> {
        self.store()?.read(label, timestamp)
    }

    pub fn read_range(&self, label: &str, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>> {
        self.store()?.read_range(label, start, end)
    }

    pub fn read_next(&self, label: &str, timestamp: Timestamp) -> Result<Option<Sample>> {
        self.store()?.read_next(label, timestamp)
    }

    pub fn read_previous(&self, label: &str, timestamp: Timestamp) -> Result<Option<Sample>> {
        self.store()?.read_previous(label, timestamp)
    }

    pub fn count(&self, label: &str, start: Timestamp, end: Timestamp) -> Result<u64> {
        self.store()?.count(label, start, end)
    }

    pub fn delete_before(&self, cutoff: Timestamp) -> Result<usize> {
        self.store()?.delete_before(cutoff)
    }

    pub fn delete_after(&self, cutoff: Timestamp) -> Result<usize> {
        self.store()?.delete_after(cutoff)
    }

    /// Run age-based retention now
    pub fn delete_expired(&self) -> Result<usize> {
        self.store()?.delete_expired()
    }

    /// Run size-based retention now
    pub fn evict_oversize(&self) -> Result<usize> {
        self.store()?.evict_oversize()
    }

    pub fn reload_partitions(&self) -> Result<Vec<Timestamp>> {
        self.store()?.reload_partitions()
    }

    pub fn disk_usage(&self) -> Result<u64> {
        self.store()?.disk_usage()
    }

    pub fn config(&self) -> &StoreConfig {
        self.store.config()
    }

    pub fn partitions(&self) -> Result<Vec<Timestamp>> {
        Ok(self.store()?.partitions())
    }

    pub fn labels(&self, partition: Timestamp) -> Result<Vec<String>> {
        self.store()?.labels(partition)
    }

    pub fn flush(&self) -> Result<()> {
        self.store()?.flush()
    }
}

impl Clone for StoreHandle {
    fn clone(&self) -> Self {
        self.refs.acquire();
        Self {
            store: self.store.clone(),
            refs: self.refs.clone(),
        }
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        if self.refs.release() && self.refs.mark_closed() {
            if let Err(e) = self.store.close() {
                warn!(error = %e, "Error closing store on last handle drop");
            }
        }
    }
}
