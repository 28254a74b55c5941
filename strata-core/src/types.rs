//! Core types for Strata

use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Per-sample validity flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quality {
    Good,
    Bad,
}

impl Quality {
    /// On-disk byte
    pub fn as_byte(self) -> u8 {
        match self {
            Quality::Good => 1,
            Quality::Bad => 0,
        }
    }

    /// Anything but 1 decodes as bad
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => Quality::Good,
            _ => Quality::Bad,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Good => write!(f, "GOOD"),
            Quality::Bad => write!(f, "BAD"),
        }
    }
}

/// A single stored sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Timestamp in milliseconds
    pub timestamp: Timestamp,
    pub value: f64,
    pub quality: Quality,
}

impl Sample {
    /// Create a new sample
    pub fn new(timestamp: Timestamp, value: f64, quality: Quality) -> Self {
        Self {
            timestamp,
            value,
            quality,
        }
    }

    /// Create a sample with good quality
    pub fn good(timestamp: Timestamp, value: f64) -> Self {
        Self::new(timestamp, value, Quality::Good)
    }

    /// NaN marks "no data" and is never handed to callers
    pub fn is_gap(&self) -> bool {
        self.value.is_nan()
    }
}

/// Closed time interval `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// The whole representable timeline
    pub fn all() -> Self {
        Self::new(Timestamp::MIN, Timestamp::MAX)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    /// True if this range contains `other` entirely
    pub fn covers(&self, other: &TimeRange) -> bool {
        self.start <= other.start && self.end >= other.end
    }
}

/// How a label's samples are laid out on disk
///
/// A positive interval selects fixed-interval (slot) storage with that
/// period; zero or negative selects flexible-interval storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesConfig {
    pub interval_ms: i64,
}

impl SeriesConfig {
    /// Fixed-interval storage with the given period
    pub fn fixed(interval_ms: i64) -> Self {
        Self { interval_ms }
    }

    /// Flexible-interval storage
    pub fn flexible() -> Self {
        Self {
            interval_ms: crate::config::FLEXIBLE_PERIOD,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.interval_ms > 0
    }

    /// Period written to the file header
    pub fn storage_period(&self) -> i64 {
        if self.is_fixed() {
            self.interval_ms
        } else {
            crate::config::FLEXIBLE_PERIOD
        }
    }

    /// Timestamp as it will be stored
    pub fn round(&self, ts: Timestamp) -> Timestamp {
        if self.is_fixed() {
            crate::codec::rounded_timestamp(ts, self.interval_ms)
        } else {
            ts
        }
    }
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self::flexible()
    }
}
