//! Partition store implementation
//!
//! Lock order: folder lock, then a file set's unit list, then a file unit's
//! mutex. Never the reverse.

use super::{Clock, StoreConfig, SystemClock};
use crate::cache::{DecodeCache, LruDecodeCache, NoopCache};
use crate::file::SampleFile;
use crate::maintenance::{AgeDeletion, Flusher, PartitionReload, Scheduler, SizeEviction};
use crate::partition::{
    self, encode_label, next_partition_start, partition_start, AppendOutcome, FileSet, FolderNaming, Partition,
};
use crate::{Quality, Result, Sample, SeriesConfig, StoreError, TimeRange, Timestamp};
use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Open file sets keyed by (label, partition start)
type SetKey = (String, Timestamp);

/// Everything guarded by the folder lock
#[derive(Debug, Default)]
struct FolderState {
    /// Partition folders, sorted by start
    partitions: Vec<Partition>,
}

impl FolderState {
    fn contains(&self, start: Timestamp) -> bool {
        self.partitions.binary_search_by_key(&start, |p| p.start).is_ok()
    }
}

/// Owner of the partition tree under one root directory
pub struct PartitionStore {
    me: Weak<PartitionStore>,
    config: StoreConfig,
    naming: FolderNaming,
    folders: RwLock<FolderState>,
    open_sets: SkipMap<SetKey, Arc<FileSet>>,
    cache: Arc<dyn DecodeCache>,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
    evicting: AtomicBool,
    evictor: Mutex<Option<JoinHandle<()>>>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl PartitionStore {
    /// Open a store using the system clock
    pub fn open(config: StoreConfig) -> Result<Arc<Self>> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open a store, scan its partitions and start the maintenance jobs
    pub fn open_with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        let config = config.validate()?;
        if !config.read_only {
            fs::create_dir_all(&config.root)?;
        }

        let cache: Arc<dyn DecodeCache> = if config.cache_disabled {
            Arc::new(NoopCache)
        } else {
            Arc::new(LruDecodeCache::new(config.cache_capacity))
        };
        let naming = config.folder_naming();
        let partitions = scan_partitions(&config.root, naming)?;
        info!(
            root = %config.root.display(),
            partitions = partitions.len(),
            read_only = config.read_only,
            "Opened partition store"
        );

        let store = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            naming,
            folders: RwLock::new(FolderState { partitions }),
            open_sets: SkipMap::new(),
            cache,
            clock,
            closed: AtomicBool::new(false),
            evicting: AtomicBool::new(false),
            evictor: Mutex::new(None),
            scheduler: Mutex::new(None),
        });

        if !store.config.read_only {
            let scheduler = store.start_jobs()?;
            *store.scheduler.lock() = Some(scheduler);
        }
        Ok(store)
    }

    fn start_jobs(self: &Arc<Self>) -> Result<Scheduler> {
        let config = &self.config;
        let mut scheduler = Scheduler::new();
        if !config.flush_on_write() {
            let period = config.flush_period();
            scheduler.schedule(Arc::new(Flusher::new(self)), period, period)?;
        }
        let delay = config.expiration_initial_delay();
        let interval = config.expiration_check_interval();
        if config.lifetime_days > 0 {
            scheduler.schedule(Arc::new(AgeDeletion::new(self)), delay, interval)?;
        }
        if config.max_size_mb > 0 {
            scheduler.schedule(Arc::new(SizeEviction::new(self)), delay, interval)?;
        }
        if config.reload_interval_ms > 0 {
            let period = config.reload_interval();
            scheduler.schedule(Arc::new(PartitionReload::new(self)), period, period)?;
        }
        Ok(scheduler)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn partition_path(&self, start: Timestamp) -> PathBuf {
        self.config.root.join(self.naming.folder_name(start))
    }

    fn set_key(label: &str, start: Timestamp) -> SetKey {
        (label.to_string(), start)
    }

    /// Partitions overlapping `[a, b]`, ascending
    fn partitions_between(&self, folders: &FolderState, a: Timestamp, b: Timestamp) -> Vec<Timestamp> {
        let range = TimeRange::new(a, b);
        folders
            .partitions
            .iter()
            .filter(|p| {
                let end = next_partition_start(p.start, self.config.partition_unit).saturating_sub(1);
                TimeRange::new(p.start, end).overlaps(&range)
            })
            .map(|p| p.start)
            .collect()
    }

    /// Open set for (label, partition), loading it lazily. Returns `None`
    /// when the label has no folder in that partition. Needs at least the
    /// read side of the folder lock.
    fn open_set(&self, folders: &FolderState, label: &str, start: Timestamp) -> Result<Option<Arc<FileSet>>> {
        let key = Self::set_key(label, start);
        if let Some(entry) = self.open_sets.get(&key) {
            return Ok(Some(entry.value().clone()));
        }
        if !folders.contains(start) {
            return Ok(None);
        }
        let encoded = encode_label(label);
        let dir = self.partition_path(start).join(encoded.as_ref());
        if !dir.is_dir() {
            return Ok(None);
        }
        let set = Arc::new(FileSet::load(dir, encoded.into_owned(), self.cache.clone())?);
        let set = self.open_sets.get_or_insert(key, set).value().clone();
        self.check_open_limit();
        Ok(Some(set))
    }

    /// Like `open_set`, but always yields a set. Write lock only.
    fn open_set_for_write(&self, label: &str, start: Timestamp) -> Result<Arc<FileSet>> {
        let key = Self::set_key(label, start);
        if let Some(entry) = self.open_sets.get(&key) {
            return Ok(entry.value().clone());
        }
        let encoded = encode_label(label);
        let dir = self.partition_path(start).join(encoded.as_ref());
        let set = Arc::new(FileSet::load(dir, encoded.into_owned(), self.cache.clone())?);
        let set = self.open_sets.get_or_insert(key, set).value().clone();
        self.check_open_limit();
        Ok(set)
    }

    /// Close and forget every open set. Write lock only.
    fn close_open_sets(&self, _folders: &mut FolderState) {
        while let Some(entry) = self.open_sets.pop_front() {
            if let Err(e) = entry.value().close_all() {
                warn!(label = %entry.key().0, error = %e, "Failed to close file set");
            }
        }
    }

    fn reload_locked(&self, folders: &mut FolderState) -> Result<()> {
        folders.partitions = scan_partitions(&self.config.root, self.naming)?;
        Ok(())
    }

    /// Make sure the folder of partition `start` exists. Starting a new
    /// partition closes every open set.
    fn start_partition(&self, folders: &mut FolderState, start: Timestamp) -> Result<()> {
        if folders.contains(start) {
            return Ok(());
        }
        self.close_open_sets(folders);
        let path = self.partition_path(start);
        if !path.is_dir() {
            fs::create_dir_all(&path)?;
            info!(partition = start, path = %path.display(), "Created partition");
        }
        self.reload_locked(folders)
    }

    /// Append one sample for `label`
    pub fn append(
        &self,
        label: &str,
        value: f64,
        timestamp: Timestamp,
        quality: Quality,
        series: &SeriesConfig,
    ) -> Result<()> {
        self.ensure_open()?;
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }

        let rounded = series.round(timestamp);
        let start = partition_start(rounded, self.config.partition_unit);
        let sample = Sample::new(rounded, value, quality);
        let period = series.storage_period();
        let flush = self.config.flush_on_write();

        // fast path: any open set with a unit, read lock only
        {
            let _folders = self.folders.read();
            if let Some(entry) = self.open_sets.get(&Self::set_key(label, start)) {
                let set = entry.value().clone();
                match set.append(timestamp, sample, period, flush)? {
                    AppendOutcome::NeedsCreate => {}
                    outcome => {
                        if outcome == AppendOutcome::Ignored {
                            debug!(label, timestamp, "Append ignored");
                        }
                        return Ok(());
                    }
                }
            }
        }

        // slow path: the folder or the first unit may need creating
        {
            let mut folders = self.folders.write();
            self.ensure_open()?;
            self.start_partition(&mut folders, start)?;
            let set = self.open_set_for_write(label, start)?;
            match set.append(timestamp, sample, period, flush)? {
                AppendOutcome::NeedsCreate => {
                    let unit = set.create_unit(timestamp, period)?;
                    unit.append(sample)?;
                    unit.close()?;
                    set.reload()?;
                }
                AppendOutcome::Ignored => debug!(label, timestamp, "Append ignored"),
                AppendOutcome::Written => {}
            }
        }
        Ok(())
    }

    /// Sample of `label` at `timestamp`
    pub fn read(&self, label: &str, timestamp: Timestamp) -> Result<Option<Sample>> {
        self.ensure_open()?;
        let folders = self.folders.read();
        let start = partition_start(timestamp, self.config.partition_unit);
        let Some(set) = self.open_set(&folders, label, start)? else {
            return Ok(None);
        };
        match set.for_timestamp(timestamp) {
            Some(unit) => unit.read(timestamp),
            None => Ok(None),
        }
    }

    /// Samples of `label` within `[start, end]`, oldest first
    pub fn read_range(&self, label: &str, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>> {
        if start > end {
            self.ensure_open()?;
            return Ok(Vec::new());
        }
        if start == end {
            return Ok(self.read(label, start)?.into_iter().collect());
        }
        self.ensure_open()?;
        let folders = self.folders.read();
        let mut samples = Vec::new();
        for partition in self.partitions_between(&folders, start, end) {
            let Some(set) = self.open_set(&folders, label, partition)? else {
                continue;
            };
            for unit in set.between(start, end) {
                samples.extend(unit.read_range(start, end)?);
            }
        }
        Ok(samples)
    }

    /// First sample of `label` at or after `timestamp`
    pub fn read_next(&self, label: &str, timestamp: Timestamp) -> Result<Option<Sample>> {
        self.ensure_open()?;
        let folders = self.folders.read();
        for partition in self.partitions_between(&folders, timestamp, Timestamp::MAX) {
            let Some(set) = self.open_set(&folders, label, partition)? else {
                continue;
            };
            for unit in set.from(timestamp) {
                if let Some(sample) = unit.read_next(timestamp)? {
                    return Ok(Some(sample));
                }
            }
        }
        Ok(None)
    }

    /// Last sample of `label` at or before `timestamp`
    pub fn read_previous(&self, label: &str, timestamp: Timestamp) -> Result<Option<Sample>> {
        self.ensure_open()?;
        let folders = self.folders.read();
        for partition in self.partitions_between(&folders, Timestamp::MIN, timestamp).into_iter().rev() {
            let Some(set) = self.open_set(&folders, label, partition)? else {
                continue;
            };
            for unit in set.until(timestamp).into_iter().rev() {
                if let Some(sample) = unit.read_previous(timestamp)? {
                    return Ok(Some(sample));
                }
            }
        }
        Ok(None)
    }

    /// Number of stored records of `label` within `[start, end]`.
    /// Empty slots inside fixed-interval files are counted.
    pub fn count(&self, label: &str, start: Timestamp, end: Timestamp) -> Result<u64> {
        self.ensure_open()?;
        if start > end {
            return Ok(0);
        }
        let folders = self.folders.read();
        let range = TimeRange::new(start, end);
        let mut total = 0;
        for partition in self.partitions_between(&folders, start, end) {
            let Some(set) = self.open_set(&folders, label, partition)? else {
                continue;
            };
            for unit in set.between(start, end) {
                total += unit.dataset_count(Some(range))?;
            }
        }
        Ok(total)
    }

    /// Sorted partition starts
    pub fn partitions(&self) -> Vec<Timestamp> {
        self.folders.read().partitions.iter().map(|p| p.start).collect()
    }

    /// Labels with a folder in the partition starting at `start`
    pub fn labels(&self, start: Timestamp) -> Result<Vec<String>> {
        self.ensure_open()?;
        let folders = self.folders.read();
        if !folders.contains(start) {
            return Ok(Vec::new());
        }
        let mut labels = Vec::new();
        for entry in fs::read_dir(self.partition_path(start))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(partition::decode_label) {
                Some(label) => labels.push(label),
                None => warn!(folder = ?name, "Skipping undecodable label folder"),
            }
        }
        labels.sort();
        Ok(labels)
    }

    fn remove_partition(&self, folders: &mut FolderState, index: usize) -> Result<()> {
        let partition = folders.partitions.remove(index);
        match fs::remove_dir_all(&partition.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(partition = partition.start, "Deleted partition");
        Ok(())
    }

    /// Delete every partition whose start satisfies `pred`
    fn delete_where(&self, folders: &mut FolderState, pred: impl Fn(Timestamp) -> bool) -> Result<usize> {
        self.close_open_sets(folders);
        self.cache.clear();
        let mut deleted = 0;
        let mut i = 0;
        while i < folders.partitions.len() {
            if pred(folders.partitions[i].start) {
                self.remove_partition(folders, i)?;
                deleted += 1;
            } else {
                i += 1;
            }
        }
        Ok(deleted)
    }

    /// Delete every partition that ends before the partition containing
    /// `cutoff`. That partition itself survives.
    pub fn delete_before(&self, cutoff: Timestamp) -> Result<usize> {
        self.ensure_open()?;
        let limit = partition_start(cutoff, self.config.partition_unit);
        let mut folders = self.folders.write();
        self.delete_where(&mut folders, |start| start < limit)
    }

    /// Delete the partition containing `cutoff` and every later one
    pub fn delete_after(&self, cutoff: Timestamp) -> Result<usize> {
        self.ensure_open()?;
        let limit = partition_start(cutoff, self.config.partition_unit);
        let mut folders = self.folders.write();
        self.delete_where(&mut folders, |start| start >= limit)
    }

    /// Age-based retention: drop partitions starting before
    /// `now - (lifetime_days + 1) days`
    pub fn delete_expired(&self) -> Result<usize> {
        self.ensure_open()?;
        let days = self.config.lifetime_days;
        if days == 0 {
            return Ok(0);
        }
        let keep = (days as i64 + 1).saturating_mul(crate::config::MILLIS_PER_DAY);
        let cutoff = self.clock.now_millis().saturating_sub(keep);

        let mut folders = self.folders.write();
        self.reload_locked(&mut folders)?;
        let expired = folders.partitions.iter().take_while(|p| p.start < cutoff).count();
        if expired > 0 {
            self.close_open_sets(&mut folders);
            self.cache.clear();
            for _ in 0..expired {
                self.remove_partition(&mut folders, 0)?;
            }
        }
        self.reload_locked(&mut folders)?;
        Ok(expired)
    }

    /// Size-based retention: drop the oldest partitions while the root
    /// exceeds the cap, always keeping at least one partition
    pub fn evict_oversize(&self) -> Result<usize> {
        self.ensure_open()?;
        let limit = self.config.max_size_mb;
        if limit == 0 {
            return Ok(0);
        }
        let mut folders = self.folders.write();
        let mut usage = disk_usage(&self.config.root)?;
        let mut deleted = 0;
        while usage / 1_000_000 > limit && folders.partitions.len() >= 2 {
            self.close_open_sets(&mut folders);
            self.cache.clear();
            self.remove_partition(&mut folders, 0)?;
            deleted += 1;
            usage = disk_usage(&self.config.root)?;
        }
        if deleted > 0 {
            debug!(deleted, usage, "Size eviction finished");
        }
        Ok(deleted)
    }

    /// Re-scan the root directory; returns partitions not known before
    pub fn reload_partitions(&self) -> Result<Vec<Timestamp>> {
        self.ensure_open()?;
        let mut folders = self.folders.write();
        let known: Vec<Timestamp> = folders.partitions.iter().map(|p| p.start).collect();
        self.close_open_sets(&mut folders);
        self.cache.clear();
        self.reload_locked(&mut folders)?;
        let found: Vec<Timestamp> = folders
            .partitions
            .iter()
            .map(|p| p.start)
            .filter(|s| known.binary_search(s).is_err())
            .collect();
        Ok(found)
    }

    /// Invalidate the decode of every open file unit
    pub fn flush(&self) -> Result<()> {
        let _folders = self.folders.read();
        for entry in self.open_sets.iter() {
            entry.value().flush()?;
        }
        Ok(())
    }

    /// Bytes used under the root directory
    pub fn disk_usage(&self) -> Result<u64> {
        Ok(disk_usage(&self.config.root)?)
    }

    /// Records held by the shared decode cache
    pub fn cache_weight(&self) -> usize {
        self.cache.weight()
    }

    pub fn open_set_count(&self) -> usize {
        self.open_sets.len()
    }

    /// Close a quarter of the open sets in the background once the ceiling
    /// is reached. Runs on its own thread so callers holding the folder
    /// lock cannot deadlock against it.
    fn check_open_limit(&self) {
        let max = self.config.max_open_folders;
        if self.open_sets.len() < max {
            return;
        }
        if self
            .evicting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let weak = self.me.clone();
        let spawned = thread::Builder::new()
            .name("strata-evict".into())
            .spawn(move || evict_open_sets(weak, max));
        match spawned {
            Ok(handle) => {
                if let Some(previous) = self.evictor.lock().replace(handle) {
                    let _ = previous.join();
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to spawn open-set eviction");
                self.evicting.store(false, Ordering::Release);
            }
        }
    }

    fn close_oldest_sets(&self, max: usize) {
        let folders = self.folders.write();
        let len = self.open_sets.len();
        if len >= max {
            let victims = (len / 4).max(1);
            let keys: Vec<SetKey> = self
                .open_sets
                .iter()
                .take(victims)
                .map(|e| e.key().clone())
                .collect();
            for key in keys {
                if let Some(entry) = self.open_sets.remove(&key) {
                    if let Err(e) = entry.value().close_all() {
                        warn!(label = %key.0, error = %e, "Failed to close file set");
                    }
                }
            }
            debug!(closed = victims, remaining = self.open_sets.len(), "Closed open file sets");
        }
        drop(folders);
    }

    /// Stop maintenance and close every file. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        // final job runs must still see an open store
        self.stop_jobs();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown()
    }

    fn stop_jobs(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(mut scheduler) = scheduler {
            scheduler.stop();
        }
    }

    fn shutdown(&self) -> Result<()> {
        self.stop_jobs();
        if let Some(handle) = self.evictor.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        let _folders = self.folders.write();
        let mut first_err = None;
        while let Some(entry) = self.open_sets.pop_front() {
            if let Err(e) = entry.value().close_all() {
                first_err.get_or_insert(e);
            }
        }
        self.cache.clear();
        info!(root = %self.config.root.display(), "Closed partition store");
        first_err.map_or(Ok(()), Err)
    }
}

fn evict_open_sets(store: Weak<PartitionStore>, max: usize) {
    if let Some(store) = store.upgrade() {
        if !store.is_closed() {
            store.close_oldest_sets(max);
        }
        store.evicting.store(false, Ordering::Release);
    }
}

impl Drop for PartitionStore {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            warn!(root = %self.config.root.display(), "Partition store dropped without close");
            if let Err(e) = self.shutdown() {
                warn!(error = %e, "Error closing dropped store");
            }
        }
    }
}

impl std::fmt::Debug for PartitionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionStore")
            .field("root", &self.config.root)
            .field("open_sets", &self.open_sets.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Partition folders under `root`, sorted by start
fn scan_partitions(root: &Path, naming: FolderNaming) -> Result<Vec<Partition>> {
    let mut partitions = Vec::new();
    if !root.is_dir() {
        return Ok(partitions);
    }
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        match name.to_str().and_then(|n| naming.parse(n)) {
            Some(start) => partitions.push(Partition::new(start, entry.path())),
            None => debug!(folder = ?name, "Ignoring non-partition folder"),
        }
    }
    partitions.sort();
    Ok(partitions)
}

/// Recursive size of everything under `path`; entries vanishing mid-walk
/// are skipped
fn disk_usage(path: &Path) -> io::Result<u64> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut total = meta.len();
    if meta.is_dir() {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(total),
            Err(e) => return Err(e),
        };
        for entry in entries {
            total += disk_usage(&entry?.path())?;
        }
    }
    Ok(total)
}
