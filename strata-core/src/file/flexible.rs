//! Flexible-interval file unit

use super::handle::{FileCore, FileState};
use super::{visible, SampleFile};
use crate::cache::FileCache;
use crate::codec::{self, flexible, FileKind, Header};
use crate::config::HEADER_SIZE;
use crate::{Result, Sample, TimeRange, Timestamp};
use bytes::{Buf, BytesMut};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Append-only file of timestamped records
#[derive(Debug)]
pub struct FlexibleIntervalFile {
    core: FileCore,
}

impl FlexibleIntervalFile {
    /// Create a new, empty file starting at `start`
    pub fn create(path: PathBuf, start: Timestamp, cache: FileCache) -> Result<Self> {
        Ok(Self {
            core: FileCore::create(path, Header::flexible(start), cache)?,
        })
    }

    /// Open an existing file and recover the last written timestamp from disk
    pub fn open(path: PathBuf, cache: FileCache) -> Result<Self> {
        let core = FileCore::open(path, cache)?;
        {
            let mut state = core.lock();
            if let Some(offset) = flexible::last_record_offset(state.length) {
                let bytes = core.read_at(&mut state, offset, 8)?;
                if bytes.len() == 8 {
                    state.last_timestamp = Some((&bytes[..]).get_i64());
                }
            }
        }
        Ok(Self { core })
    }

    /// Cut off a trailing partial record before appending behind it
    fn repair_tail(&self, state: &mut FileState) -> Result<()> {
        let complete = flexible::complete_length(state.length);
        if complete != state.length {
            warn!(
                file = %self.core.path().display(),
                length = state.length,
                offset = complete,
                "Truncating partial trailing record"
            );
            self.core.truncate(state, complete)?;
        }
        Ok(())
    }

    fn decoded(&self) -> Result<Vec<Sample>> {
        let mut state = self.core.lock();
        let decoded = self.core.decoded(&mut state, flexible::decode_all)?;
        Ok(decoded.to_vec())
    }
}

impl SampleFile for FlexibleIntervalFile {
    fn header(&self) -> Header {
        *self.core.header()
    }

    fn path(&self) -> &Path {
        self.core.path()
    }

    /// Only strictly increasing timestamps at or after the start are written
    fn append(&self, sample: Sample) -> Result<bool> {
        if sample.timestamp < self.core.header().start {
            return Ok(false);
        }
        let mut state = self.core.lock();
        if state.last_timestamp.is_some_and(|last| sample.timestamp <= last) {
            return Ok(false);
        }
        self.repair_tail(&mut state)?;
        let mut buf = BytesMut::with_capacity(flexible::RECORD_SIZE);
        flexible::encode_record(&mut buf, &sample);
        let offset = state.length;
        self.core.write_at(&mut state, offset, &buf)?;
        state.last_timestamp = Some(sample.timestamp);
        Ok(true)
    }

    fn read(&self, timestamp: Timestamp) -> Result<Option<Sample>> {
        if timestamp < self.core.header().start {
            return Ok(None);
        }
        let samples = self.decoded()?;
        Ok(samples
            .binary_search_by_key(&timestamp, |s| s.timestamp)
            .ok()
            .map(|i| samples[i])
            .filter(|s| !s.is_gap()))
    }

    fn read_range(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Sample>> {
        if start > end {
            return Ok(Vec::new());
        }
        let range = TimeRange::new(start, end);
        let samples = self.decoded()?;
        if range.covers(&self.time_range()) {
            return Ok(visible(samples));
        }
        let from = samples.partition_point(|s| s.timestamp < start);
        let to = samples.partition_point(|s| s.timestamp <= end);
        Ok(visible(samples[from..to.max(from)].iter().copied()))
    }

    fn read_fully(&self) -> Result<Vec<Sample>> {
        Ok(visible(self.decoded()?))
    }

    fn read_next(&self, timestamp: Timestamp) -> Result<Option<Sample>> {
        let samples = self.decoded()?;
        let idx = samples.partition_point(|s| s.timestamp < timestamp);
        Ok(samples[idx..].iter().find(|s| !s.is_gap()).copied())
    }

    fn read_previous(&self, timestamp: Timestamp) -> Result<Option<Sample>> {
        let samples = self.decoded()?;
        let idx = samples.partition_point(|s| s.timestamp <= timestamp);
        Ok(samples[..idx].iter().rev().find(|s| !s.is_gap()).copied())
    }

    /// Counts stored records. A range covering the whole file is answered
    /// from the length; otherwise records are scanned until one lies past
    /// the end of the range.
    fn dataset_count(&self, range: Option<TimeRange>) -> Result<u64> {
        let covered = range.map_or(true, |r| r.covers(&self.time_range()));
        let mut state = self.core.lock();
        if covered {
            return Ok(codec::record_count(state.length, FileKind::Flexible));
        }
        let range = range.unwrap_or_else(TimeRange::all);
        if let Some(cached) = self.core.cache().get() {
            return Ok(cached.iter().filter(|s| range.contains(s.timestamp)).count() as u64);
        }
        let body = self.core.read_body(&mut state)?;
        Ok(flexible::count_between(&body, range.start, range.end))
    }

    fn latest_timestamp(&self) -> Option<Timestamp> {
        self.core.lock().last_timestamp
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

impl FlexibleIntervalFile {
    /// Bytes on disk, header included
    pub fn length(&self) -> u64 {
        self.core.lock().length.max(HEADER_SIZE)
    }
}
