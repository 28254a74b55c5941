//! Partition file set: the file units of one label within one partition

use crate::cache::{CacheKey, DecodeCache, FileCache};
use crate::codec::{self, FileKind};
use crate::config::HEADER_SIZE;
use crate::file::{FileUnit, SampleFile};
use crate::{Result, Sample, TimeRange, Timestamp};
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of appending through an existing set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Sample went to disk
    Written,
    /// Sample was dropped (too old, duplicate, or slot already taken)
    Ignored,
    /// The set has no unit yet; the caller must create one under the write lock
    NeedsCreate,
}

/// Units of one (label, partition), sorted ascending by start timestamp
pub struct FileSet {
    dir: PathBuf,
    /// Encoded label, also the cache key prefix
    label: String,
    cache: Arc<dyn DecodeCache>,
    units: RwLock<Vec<Arc<FileUnit>>>,
}

impl FileSet {
    /// Scan `dir` and open every sample file in it. A missing directory
    /// yields an empty set.
    pub fn load(dir: PathBuf, label: impl Into<String>, cache: Arc<dyn DecodeCache>) -> Result<Self> {
        let set = Self {
            dir,
            label: label.into(),
            cache,
            units: RwLock::new(Vec::new()),
        };
        let units = set.scan()?;
        *set.units.write() = units;
        Ok(set)
    }

    fn file_cache(&self, file: &str) -> FileCache {
        FileCache::new(CacheKey::new(self.label.clone(), file), self.cache.clone())
    }

    fn scan(&self) -> Result<Vec<Arc<FileUnit>>> {
        let mut units = Vec::new();
        if !self.dir.is_dir() {
            return Ok(units);
        }

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(crate::config::FILE_EXTENSION) || !entry.file_type()?.is_file() {
                continue;
            }
            if codec::parse_file_name(name).is_none() {
                warn!(file = %path.display(), "Skipping file with unknown prefix");
                continue;
            }
            if entry.metadata()?.len() < HEADER_SIZE {
                warn!(file = %path.display(), "Deleting file shorter than its header");
                fs::remove_file(&path)?;
                continue;
            }
            let cache = self.file_cache(name);
            units.push(Arc::new(FileUnit::open(path, cache)?));
        }

        units.sort_by_key(|u| u.start());
        Ok(units)
    }

    /// Re-scan the directory, closing the previously open units.
    /// Must run under the write side of the folder lock.
    pub fn reload(&self) -> Result<()> {
        let mut units = self.units.write();
        for unit in units.iter() {
            unit.close()?;
        }
        *units = self.scan()?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.read().is_empty()
    }

    /// The unit with the latest start
    pub fn current(&self) -> Option<Arc<FileUnit>> {
        self.units.read().last().cloned()
    }

    /// First unit whose `[start, latest]` contains `t`
    pub fn for_timestamp(&self, t: Timestamp) -> Option<Arc<FileUnit>> {
        self.units
            .read()
            .iter()
            .find(|u| u.time_range().contains(t))
            .cloned()
    }

    /// Units holding data at or after `t`
    pub fn from(&self, t: Timestamp) -> Vec<Arc<FileUnit>> {
        self.between(t, Timestamp::MAX)
    }

    /// Units starting at or before `t`
    pub fn until(&self, t: Timestamp) -> Vec<Arc<FileUnit>> {
        self.between(Timestamp::MIN, t)
    }

    /// Units overlapping `[a, b]`
    pub fn between(&self, a: Timestamp, b: Timestamp) -> Vec<Arc<FileUnit>> {
        let range = TimeRange::new(a, b);
        self.units
            .read()
            .iter()
            .filter(|u| u.time_range().overlaps(&range))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<FileUnit>> {
        self.units.read().clone()
    }

    /// Earliest start of any unit
    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.units.read().first().map(|u| u.start())
    }

    /// Create a new unit whose name and header both carry the raw
    /// `created` timestamp, keeping the list sorted
    pub fn create_unit(&self, created: Timestamp, period: i64) -> Result<Arc<FileUnit>> {
        let mut units = self.units.write();
        self.push_new(&mut units, created, period)
    }

    fn push_new(
        &self,
        units: &mut Vec<Arc<FileUnit>>,
        created: Timestamp,
        period: i64,
    ) -> Result<Arc<FileUnit>> {
        let kind = if period > 0 { FileKind::Fixed } else { FileKind::Flexible };
        let name = codec::file_name(kind, created);
        fs::create_dir_all(&self.dir)?;
        let unit = Arc::new(FileUnit::create(self.dir.join(&name), created, period, self.file_cache(&name))?);
        debug!(file = %unit.path().display(), period, "Created file unit");
        let start = unit.start();
        let pos = units.partition_point(|u| u.start() <= start);
        units.insert(pos, unit.clone());
        Ok(unit)
    }

    /// Append through the current unit.
    ///
    /// `sample.timestamp` is already rounded onto the series grid and
    /// `created` is the raw timestamp used to name a new unit. When the
    /// storage period differs from the current unit's and the current unit
    /// holds nothing at or after `created`, a new unit with the new period
    /// takes the sample.
    pub fn append(&self, created: Timestamp, sample: Sample, period: i64, flush: bool) -> Result<AppendOutcome> {
        let Some(current) = self.current() else {
            return Ok(AppendOutcome::NeedsCreate);
        };
        if current.start() >= sample.timestamp {
            return Ok(AppendOutcome::Ignored);
        }

        let target = if current.period() == period || current.period() == 0 {
            current
        } else {
            let mut units = self.units.write();
            let still_current = units.last().is_some_and(|u| Arc::ptr_eq(u, &current));
            if !still_current {
                // another writer rotated the set meanwhile
                return Ok(AppendOutcome::Ignored);
            }
            if current.latest_timestamp().unwrap_or(current.start()) >= created {
                return Ok(AppendOutcome::Ignored);
            }
            current.close()?;
            self.push_new(&mut units, created, period)?
        };

        let written = target.append(sample)?;
        if flush {
            target.flush()?;
        }
        Ok(if written {
            AppendOutcome::Written
        } else {
            AppendOutcome::Ignored
        })
    }

    /// Invalidate the decode of every unit
    pub fn flush(&self) -> Result<()> {
        for unit in self.units.read().iter() {
            unit.flush()?;
        }
        Ok(())
    }

    /// Close every unit
    pub fn close_all(&self) -> Result<()> {
        for unit in self.units.read().iter() {
            unit.close()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSet")
            .field("dir", &self.dir)
            .field("label", &self.label)
            .field("units", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LruDecodeCache;
    use tempfile::TempDir;

    fn shared() -> Arc<dyn DecodeCache> {
        Arc::new(LruDecodeCache::new(10_000))
    }

    fn first_append(set: &FileSet, sample: Sample, period: i64) {
        let unit = set.create_unit(sample.timestamp, period).unwrap();
        assert!(unit.append(sample).unwrap());
    }

    #[test]
    fn test_load_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let set = FileSet::load(temp_dir.path().join("nope"), "l", shared()).unwrap();
        assert!(set.is_empty());
        assert!(set.current().is_none());
        assert!(!temp_dir.path().join("nope").exists());
    }

    #[test]
    fn test_needs_create_then_append() {
        let temp_dir = TempDir::new().unwrap();
        let set = FileSet::load(temp_dir.path().join("label"), "label", shared()).unwrap();
        let outcome = set.append(0, Sample::good(0, 1.0), 1_000, false).unwrap();
        assert_eq!(outcome, AppendOutcome::NeedsCreate);

        first_append(&set, Sample::good(0, 1.0), 1_000);
        assert_eq!(
            set.append(1_000, Sample::good(1_000, 2.0), 1_000, false).unwrap(),
            AppendOutcome::Written
        );
        // at or before the unit start is ignored
        assert_eq!(
            set.append(0, Sample::good(0, 5.0), 1_000, false).unwrap(),
            AppendOutcome::Ignored
        );
        assert_eq!(set.len(), 1);
        assert_eq!(set.current().unwrap().dataset_count(None).unwrap(), 2);
    }

    #[test]
    fn test_interval_change_adds_unit() {
        let temp_dir = TempDir::new().unwrap();
        let set = FileSet::load(temp_dir.path().join("label"), "label", shared()).unwrap();
        first_append(&set, Sample::good(0, 1.0), 60_000);
        set.append(60_000, Sample::good(60_000, 2.0), 60_000, false).unwrap();

        let outcome = set.append(90_000, Sample::good(90_000, 3.0), -1, false).unwrap();
        assert_eq!(outcome, AppendOutcome::Written);
        assert_eq!(set.len(), 2);

        let units = set.all();
        assert_eq!(units[0].start(), 0);
        assert_eq!(units[1].start(), 90_000);
        assert_eq!(units[1].period(), -1);
        assert!(temp_dir.path().join("label").join("f90000.slots").exists());

        assert_eq!(set.for_timestamp(60_000).unwrap().start(), 0);
        assert_eq!(set.for_timestamp(90_000).unwrap().start(), 90_000);
        assert!(set.for_timestamp(75_000).is_none());
    }

    #[test]
    fn test_interval_change_header_keeps_raw_timestamp() {
        let temp_dir = TempDir::new().unwrap();
        let set = FileSet::load(temp_dir.path().join("label"), "label", shared()).unwrap();
        first_append(&set, Sample::good(0, 1.0), -1);
        set.append(100, Sample::good(100, 2.0), -1, false).unwrap();

        let outcome = set.append(5_400, Sample::good(5_000, 3.0), 1_000, false).unwrap();
        assert_eq!(outcome, AppendOutcome::Written);
        let unit = set.current().unwrap();
        assert_eq!(unit.start(), 5_000);
        assert_eq!(unit.read(5_000).unwrap().unwrap().value, 3.0);
        unit.close().unwrap();

        let path = temp_dir.path().join("label").join("c5400.slots");
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..8], &5_400i64.to_be_bytes());
        assert_eq!(&bytes[8..16], &1_000i64.to_be_bytes());

        // a reload aligns it the same way
        set.reload().unwrap();
        assert_eq!(set.current().unwrap().start(), 5_000);
        assert_eq!(set.for_timestamp(5_000).unwrap().read(5_000).unwrap().unwrap().value, 3.0);
    }

    #[test]
    fn test_interval_change_rejected_when_overlapping() {
        let temp_dir = TempDir::new().unwrap();
        let set = FileSet::load(temp_dir.path().join("label"), "label", shared()).unwrap();
        first_append(&set, Sample::good(0, 1.0), 60_000);
        set.append(120_000, Sample::good(120_000, 2.0), 60_000, false).unwrap();

        let outcome = set.append(100_000, Sample::good(100_000, 3.0), -1, false).unwrap();
        assert_eq!(outcome, AppendOutcome::Ignored);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_scan_sorts_and_cleans() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("label");
        fs::create_dir_all(&dir).unwrap();

        let backing = shared();
        for (name, start, period) in [("f500.slots", 500, -1), ("c100.slots", 100, 10)] {
            let cache = FileCache::new(CacheKey::new("label", name), backing.clone());
            let unit = FileUnit::create(dir.join(name), start, period, cache).unwrap();
            unit.append(Sample::good(start, 1.0)).unwrap();
            unit.close().unwrap();
        }
        fs::write(dir.join("c900.slots"), [0u8; 8]).unwrap();
        fs::write(dir.join("x100.slots"), [0u8; 40]).unwrap();
        fs::write(dir.join("notes.txt"), b"hello").unwrap();

        let set = FileSet::load(dir.clone(), "label", backing).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.first_timestamp(), Some(100));
        assert_eq!(set.current().unwrap().start(), 500);
        assert!(!dir.join("c900.slots").exists());
        assert!(dir.join("x100.slots").exists());

        assert_eq!(set.between(0, 200).len(), 1);
        assert_eq!(set.from(101).len(), 1);
        assert_eq!(set.until(600).len(), 2);
    }

    #[test]
    fn test_reload_picks_up_new_files() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("label");
        let backing = shared();
        let set = FileSet::load(dir.clone(), "label", backing.clone()).unwrap();
        first_append(&set, Sample::good(0, 1.0), -1);

        let other = FileSet::load(dir, "label", backing).unwrap();
        assert_eq!(other.len(), 1);
        other.create_unit(5_000, 100).unwrap();

        assert_eq!(set.len(), 1);
        set.reload().unwrap();
        assert_eq!(set.len(), 2);
    }
}
