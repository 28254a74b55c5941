//! File units
//!
//! A file unit is one physical file holding a contiguous run of samples for
//! one label within one partition. The layout is chosen by file-name prefix
//! and both layouts share the [`SampleFile`] contract.

mod fixed;
mod flexible;
mod handle;

pub use fixed::FixedIntervalFile;
pub use flexible::FlexibleIntervalFile;

use crate::cache::FileCache;
use crate::codec::{self, FileKind, Header};
use crate::{Result, Sample, StoreError, TimeRange, Timestamp};
use std::path::{Path, PathBuf};

/// Operations common to both file layouts
pub trait SampleFile {
    fn header(&self) -> Header;

    fn path(&self) -> &Path;

    /// Append one sample; returns false when the sample was ignored
    fn append(&self, sample: Sample) -> Result<bool>;

    /// Sample stored at `timestamp`
    fn read(&self, timestamp: Timestamp) -> Result<Option<Sample>>;

    /// Samples within `[start, end]`, oldest first
    fn read_range(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>>;

    /// Every sample in the file, served from the decode cache when possible
    fn read_fully(&self) -> Result<Vec<Sample>>;

    /// Number of stored records, optionally limited to a range
    fn dataset_count(&self, range: Option<TimeRange>) -> Result<u64>;

    /// Timestamp of the last stored record, `None` for an empty file
    fn latest_timestamp(&self) -> Option<Timestamp>;

    /// Invalidate the decode and push pending bytes to the OS
    fn flush(&self) -> Result<()>;

    /// Release the OS handle
    fn close(&self) -> Result<()>;

    /// First sample at or after `timestamp`
    fn read_next(&self, timestamp: Timestamp) -> Result<Option<Sample>> {
        let samples = self.read_fully()?;
        let idx = samples.partition_point(|s| s.timestamp < timestamp);
        Ok(samples.get(idx).copied())
    }

    /// Last sample at or before `timestamp`
    fn read_previous(&self, timestamp: Timestamp) -> Result<Option<Sample>> {
        let samples = self.read_fully()?;
        let idx = samples.partition_point(|s| s.timestamp <= timestamp);
        Ok(idx.checked_sub(1).map(|i| samples[i]))
    }

    fn start(&self) -> Timestamp {
        self.header().start
    }

    fn period(&self) -> i64 {
        self.header().period
    }

    /// `[start, latest]`, collapsing to the start for an empty file
    fn time_range(&self) -> TimeRange {
        let start = self.start();
        TimeRange::new(start, self.latest_timestamp().unwrap_or(start).max(start))
    }
}

/// A file unit of either layout
#[derive(Debug)]
pub enum FileUnit {
    Fixed(FixedIntervalFile),
    Flexible(FlexibleIntervalFile),
}

impl FileUnit {
    /// Create a new file at `path` whose layout follows `period`
    pub fn create(path: PathBuf, start: Timestamp, period: i64, cache: FileCache) -> Result<Self> {
        if period > 0 {
            Ok(FileUnit::Fixed(FixedIntervalFile::create(path, start, period, cache)?))
        } else {
            Ok(FileUnit::Flexible(FlexibleIntervalFile::create(path, start, cache)?))
        }
    }

    /// Open an existing file, choosing the layout from its name
    pub fn open(path: PathBuf, cache: FileCache) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StoreError::InvalidFormat(format!("bad file name {}", path.display())))?;
        let (kind, _) = codec::parse_file_name(name)
            .ok_or_else(|| StoreError::InvalidFormat(format!("not a sample file: {}", name)))?;
        match kind {
            FileKind::Fixed => Ok(FileUnit::Fixed(FixedIntervalFile::open(path, cache)?)),
            FileKind::Flexible => Ok(FileUnit::Flexible(FlexibleIntervalFile::open(path, cache)?)),
        }
    }

    pub fn kind(&self) -> FileKind {
        match self {
            FileUnit::Fixed(_) => FileKind::Fixed,
            FileUnit::Flexible(_) => FileKind::Flexible,
        }
    }

    fn inner(&self) -> &dyn SampleFile {
        match self {
            FileUnit::Fixed(f) => f,
            FileUnit::Flexible(f) => f,
        }
    }
}

impl SampleFile for FileUnit {
    fn header(&self) -> Header {
        self.inner().header()
    }

    fn path(&self) -> &Path {
        self.inner().path()
    }

    fn append(&self, sample: Sample) -> Result<bool> {
        self.inner().append(sample)
    }

    fn read(&self, timestamp: Timestamp) -> Result<Option<Sample>> {
        self.inner().read(timestamp)
    }

    fn read_range(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>> {
        self.inner().read_range(start, end)
    }

    fn read_fully(&self) -> Result<Vec<Sample>> {
        self.inner().read_fully()
    }

    fn dataset_count(&self, range: Option<TimeRange>) -> Result<u64> {
        self.inner().dataset_count(range)
    }

    fn latest_timestamp(&self) -> Option<Timestamp> {
        self.inner().latest_timestamp()
    }

    fn flush(&self) -> Result<()> {
        self.inner().flush()
    }

    fn close(&self) -> Result<()> {
        self.inner().close()
    }

    fn read_next(&self, timestamp: Timestamp) -> Result<Option<Sample>> {
        self.inner().read_next(timestamp)
    }

    fn read_previous(&self, timestamp: Timestamp) -> Result<Option<Sample>> {
        self.inner().read_previous(timestamp)
    }
}

/// Drop NaN placeholders before handing samples to callers
pub(crate) fn visible(samples: impl IntoIterator<Item = Sample>) -> Vec<Sample> {
    samples.into_iter().filter(|s| !s.is_gap()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, DecodeCache, LruDecodeCache};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn cache(name: &str) -> FileCache {
        let backing: Arc<dyn DecodeCache> = Arc::new(LruDecodeCache::new(1_000));
        FileCache::new(CacheKey::new("label", name), backing)
    }

    #[test]
    fn test_dispatch_by_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let fixed_path = temp_dir.path().join("c1000.slots");
        let flex_path = temp_dir.path().join("f1000.slots");

        let fixed = FileUnit::create(fixed_path.clone(), 1_000, 100, cache("c1000.slots")).unwrap();
        fixed.append(Sample::good(1_000, 1.0)).unwrap();
        fixed.close().unwrap();
        let flex = FileUnit::create(flex_path.clone(), 1_000, -1, cache("f1000.slots")).unwrap();
        flex.append(Sample::good(1_000, 2.0)).unwrap();
        flex.close().unwrap();

        let fixed = FileUnit::open(fixed_path, cache("c1000.slots")).unwrap();
        assert_eq!(fixed.kind(), FileKind::Fixed);
        assert_eq!(fixed.period(), 100);
        assert_eq!(fixed.read(1_000).unwrap().unwrap().value, 1.0);

        let flex = FileUnit::open(flex_path, cache("f1000.slots")).unwrap();
        assert_eq!(flex.kind(), FileKind::Flexible);
        assert_eq!(flex.period(), -1);
        assert_eq!(flex.read(1_000).unwrap().unwrap().value, 2.0);
    }

    #[test]
    fn test_open_rejects_unknown_name() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("x1000.slots");
        std::fs::write(&path, [0u8; 32]).unwrap();
        let err = FileUnit::open(path, cache("x1000.slots")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidFormat(_)));
    }

    #[test]
    fn test_time_range_of_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("f50.slots");
        let unit = FileUnit::create(path, 50, -1, cache("f50.slots")).unwrap();
        assert_eq!(unit.latest_timestamp(), None);
        assert_eq!(unit.time_range(), TimeRange::new(50, 50));
    }
}
