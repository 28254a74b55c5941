//! Fixed-interval file unit

use super::handle::FileCore;
use super::{visible, SampleFile};
use crate::cache::FileCache;
use crate::codec::{self, fixed, FileKind, Header};
use crate::{Result, Sample, TimeRange, Timestamp};
use std::path::{Path, PathBuf};

/// Dense slot file with one record per period
#[derive(Debug)]
pub struct FixedIntervalFile {
    core: FileCore,
}

impl FixedIntervalFile {
    /// Create a new file. The header stores `start` as given; in memory the
    /// start sits on the period grid, as it does after a reopen.
    pub fn create(path: PathBuf, start: Timestamp, period: i64, cache: FileCache) -> Result<Self> {
        let core = FileCore::create(path, Header::new(start, period), cache)?;
        let aligned = Header::new(codec::rounded_timestamp(start, period), period);
        Ok(Self {
            core: core.with_header(aligned),
        })
    }

    /// Open an existing file. The stored start is re-aligned to the period grid.
    pub fn open(path: PathBuf, cache: FileCache) -> Result<Self> {
        let core = FileCore::open(path, cache)?;
        let stored = *core.header();
        let aligned = Header::new(codec::rounded_timestamp(stored.start, stored.period), stored.period);
        Ok(Self {
            core: core.with_header(aligned),
        })
    }

    fn slots(&self, length: u64) -> u64 {
        codec::record_count(length, FileKind::Fixed)
    }

    fn decode_fully(&self) -> Result<Vec<Sample>> {
        let header = *self.core.header();
        let mut state = self.core.lock();
        let decoded = self
            .core
            .decoded(&mut state, |body| fixed::decode_all(&header, body))?;
        Ok(decoded.to_vec())
    }
}

impl SampleFile for FixedIntervalFile {
    fn header(&self) -> Header {
        *self.core.header()
    }

    fn path(&self) -> &Path {
        self.core.path()
    }

    /// Writes into the slot for `timestamp`, NaN-filling skipped slots.
    /// An already written slot is left untouched.
    fn append(&self, sample: Sample) -> Result<bool> {
        let header = *self.core.header();
        let index = fixed::slot_index(&header, sample.timestamp)?;
        let mut state = self.core.lock();
        let slots = self.slots(state.length);
        if index < slots {
            return Ok(false);
        }
        let bytes = fixed::encode_with_gaps(index - slots, sample.value, sample.quality);
        self.core.write_at(&mut state, fixed::slot_offset(slots), &bytes)?;
        Ok(true)
    }

    fn read(&self, timestamp: Timestamp) -> Result<Option<Sample>> {
        let header = *self.core.header();
        if timestamp < header.start || !fixed::on_grid(&header, timestamp) {
            return Ok(None);
        }
        let index = fixed::slot_index(&header, timestamp)?;
        let slot_ts = fixed::slot_timestamp(&header, index);

        let mut state = self.core.lock();
        if let Some(cached) = self.core.cache().get() {
            return Ok(cached
                .binary_search_by_key(&slot_ts, |s| s.timestamp)
                .ok()
                .map(|i| cached[i]));
        }
        if index >= self.slots(state.length) {
            return Ok(None);
        }
        let bytes = self
            .core
            .read_at(&mut state, fixed::slot_offset(index), fixed::SLOT_SIZE)?;
        if bytes.len() < fixed::SLOT_SIZE {
            return Ok(None);
        }
        let (value, quality) = fixed::decode_slot(&bytes);
        if value.is_nan() {
            return Ok(None);
        }
        Ok(Some(Sample::new(slot_ts, value, quality)))
    }

    fn read_range(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>> {
        if start > end {
            return Ok(Vec::new());
        }
        if TimeRange::new(start, end).covers(&self.time_range()) {
            return self.read_fully();
        }

        let header = *self.core.header();
        let mut state = self.core.lock();
        if let Some(cached) = self.core.cache().get() {
            let range = TimeRange::new(start, end);
            return Ok(cached.iter().filter(|s| range.contains(s.timestamp)).copied().collect());
        }
        let Some((first, last)) = fixed::slot_range(&header, self.slots(state.length), start, end) else {
            return Ok(Vec::new());
        };
        let len = ((last - first + 1) as usize) * fixed::SLOT_SIZE;
        let bytes = self.core.read_at(&mut state, fixed::slot_offset(first), len)?;
        let shifted = Header::new(fixed::slot_timestamp(&header, first), header.period);
        Ok(visible(fixed::decode_all(&shifted, &bytes)))
    }

    fn read_fully(&self) -> Result<Vec<Sample>> {
        self.decode_fully()
    }

    /// Slot arithmetic on the file length; empty slots inside the range count
    fn dataset_count(&self, range: Option<TimeRange>) -> Result<u64> {
        let header = *self.core.header();
        let slots = self.slots(self.core.lock().length);
        Ok(match range {
            None => slots,
            Some(r) => fixed::slot_range(&header, slots, r.start, r.end)
                .map(|(first, last)| last - first + 1)
                .unwrap_or(0),
        })
    }

    fn latest_timestamp(&self) -> Option<Timestamp> {
        let slots = self.slots(self.core.lock().length);
        slots
            .checked_sub(1)
            .map(|last| fixed::slot_timestamp(self.core.header(), last))
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.core.lock();
        self.core.flush(&mut state)
    }

    fn close(&self) -> Result<()> {
        let mut state = self.core.lock();
        self.core.close(&mut state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, DecodeCache, LruDecodeCache};
    use crate::{Quality, StoreError};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(start: Timestamp, period: i64) -> (TempDir, FixedIntervalFile, Arc<LruDecodeCache>) {
        let temp_dir = TempDir::new().unwrap();
        let shared = Arc::new(LruDecodeCache::new(10_000));
        let backing: Arc<dyn DecodeCache> = shared.clone();
        let name = format!("c{}.slots", start);
        let file = FixedIntervalFile::create(
            temp_dir.path().join(&name),
            start,
            period,
            FileCache::new(CacheKey::new("label", name), backing),
        )
        .unwrap();
        (temp_dir, file, shared)
    }

    #[test]
    fn test_append_and_read() {
        let (_dir, file, _) = setup(0, 1_000);
        for i in 0..5 {
            assert!(file.append(Sample::good(i * 1_000, i as f64)).unwrap());
        }
        assert_eq!(file.read(3_000).unwrap(), Some(Sample::good(3_000, 3.0)));
        // only exact slot timestamps hold a sample
        assert_eq!(file.read(2_600).unwrap(), None);
        assert!(file.read_range(2_600, 2_600).unwrap().is_empty());
        assert!(file.read_range(2_600, 2_700).unwrap().is_empty());
        assert_eq!(file.read(9_000).unwrap(), None);
        assert_eq!(file.latest_timestamp(), Some(4_000));
        assert_eq!(file.dataset_count(None).unwrap(), 5);
    }

    #[test]
    fn test_gap_fill() {
        let (_dir, file, _) = setup(0, 1_000);
        file.append(Sample::good(0, 1.0)).unwrap();
        file.append(Sample::new(4_000, 5.0, Quality::Bad)).unwrap();

        let len = std::fs::metadata(file.path()).unwrap().len();
        assert_eq!(len, 16 + 5 * 9);
        assert_eq!(file.read(2_000).unwrap(), None);
        assert_eq!(
            file.read_fully().unwrap(),
            vec![Sample::good(0, 1.0), Sample::new(4_000, 5.0, Quality::Bad)]
        );
        // gaps are still slots
        assert_eq!(file.dataset_count(None).unwrap(), 5);
    }

    #[test]
    fn test_existing_slot_not_overwritten() {
        let (_dir, file, _) = setup(0, 1_000);
        assert!(file.append(Sample::good(1_000, 1.0)).unwrap());
        assert!(!file.append(Sample::good(1_000, 9.0)).unwrap());
        assert_eq!(file.read(1_000).unwrap().unwrap().value, 1.0);
    }

    #[test]
    fn test_append_before_start_is_error() {
        let (_dir, file, _) = setup(10_000, 1_000);
        let err = file.append(Sample::good(5_000, 1.0)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTimestamp { .. }));
        assert_eq!(file.read(5_000).unwrap(), None);
    }

    #[test]
    fn test_read_range() {
        let (_dir, file, _) = setup(0, 1_000);
        for i in 0..10 {
            if i != 4 {
                file.append(Sample::good(i * 1_000, i as f64)).unwrap();
            }
        }
        let range = file.read_range(2_500, 6_000).unwrap();
        let ts: Vec<_> = range.iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, vec![3_000, 5_000, 6_000]);
        assert_eq!(file.read_range(-100, 100_000).unwrap().len(), 9);
        assert!(file.read_range(6_000, 2_000).unwrap().is_empty());
        assert_eq!(file.dataset_count(Some(TimeRange::new(2_500, 6_000))).unwrap(), 4);
    }

    #[test]
    fn test_next_and_previous() {
        let (_dir, file, _) = setup(0, 60_000);
        file.append(Sample::good(0, 0.0)).unwrap();
        file.append(Sample::good(60_000, 1.0)).unwrap();
        file.append(Sample::good(180_000, 3.0)).unwrap();

        assert_eq!(file.read_next(30_500).unwrap().unwrap().timestamp, 60_000);
        assert_eq!(file.read_next(60_000).unwrap().unwrap().timestamp, 60_000);
        assert_eq!(file.read_next(60_001).unwrap().unwrap().timestamp, 180_000);
        assert_eq!(file.read_next(180_001).unwrap(), None);
        assert_eq!(file.read_previous(179_999).unwrap().unwrap().timestamp, 60_000);
        assert_eq!(file.read_previous(-1).unwrap(), None);
    }

    #[test]
    fn test_cache_coherence() {
        let (_dir, file, shared) = setup(0, 1_000);
        file.append(Sample::good(0, 1.0)).unwrap();
        assert_eq!(file.read_fully().unwrap().len(), 1);
        assert_eq!(shared.weight(), 1);

        file.append(Sample::good(1_000, 2.0)).unwrap();
        assert_eq!(shared.weight(), 0);
        assert_eq!(file.read(1_000).unwrap().unwrap().value, 2.0);
        assert_eq!(file.read_fully().unwrap().len(), 2);
    }

    #[test]
    fn test_reopen_realigns_start() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("c1001.slots");
        let backing: Arc<dyn DecodeCache> = Arc::new(LruDecodeCache::new(100));
        let cache = FileCache::new(CacheKey::new("label", "c1001.slots"), backing);
        {
            let file = FixedIntervalFile::create(path.clone(), 1_001, 1_000, cache.clone()).unwrap();
            file.append(Sample::good(1_001, 1.0)).unwrap();
            file.close().unwrap();
        }
        let file = FixedIntervalFile::open(path, cache).unwrap();
        assert_eq!(file.start(), 1_000);
        assert_eq!(file.read(1_000).unwrap().unwrap().value, 1.0);
    }
}
