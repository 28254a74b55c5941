//! Time partitions
//!
//! Partition boundaries are computed in UTC. A partition folder is named
//! either by its start in epoch milliseconds or, in compatibility mode, by
//! its `yyyyMMdd` date. The two naming schemes never mix within one store.

mod file_set;

pub use file_set::{AppendOutcome, FileSet};

use crate::config::MILLIS_PER_DAY;
use crate::Timestamp;
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::PathBuf;

/// Partition granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl PartitionUnit {
    /// Length in ms for units that have a fixed length
    fn fixed_millis(self) -> Option<i64> {
        match self {
            PartitionUnit::Seconds => Some(1_000),
            PartitionUnit::Minutes => Some(60_000),
            PartitionUnit::Hours => Some(3_600_000),
            PartitionUnit::Days => Some(MILLIS_PER_DAY),
            PartitionUnit::Weeks => Some(7 * MILLIS_PER_DAY),
            PartitionUnit::Months | PartitionUnit::Years => None,
        }
    }
}

/// Floor `ts` onto a multiple of `unit`, truncating toward zero on overflow
fn floor_to(ts: Timestamp, unit: i64) -> Timestamp {
    ts.div_euclid(unit)
        .checked_mul(unit)
        .unwrap_or((ts / unit) * unit)
}

fn midnight_millis(date: NaiveDate) -> Option<Timestamp> {
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis())
}

fn calendar_start(ts: Timestamp, unit: PartitionUnit) -> Option<Timestamp> {
    let date = DateTime::<Utc>::from_timestamp_millis(ts)?.date_naive();
    let start = match unit {
        PartitionUnit::Weeks => {
            let back = date.weekday().num_days_from_monday() as u64;
            date.checked_sub_days(chrono::Days::new(back))?
        }
        PartitionUnit::Months => date.with_day(1)?,
        PartitionUnit::Years => NaiveDate::from_ymd_opt(date.year(), 1, 1)?,
        _ => date,
    };
    midnight_millis(start)
}

/// Start of the partition containing `ts`.
///
/// Sub-day units truncate directly; date units go to UTC midnight and then
/// to the previous-or-same Monday, the first of the month, or January 1.
pub fn partition_start(ts: Timestamp, unit: PartitionUnit) -> Timestamp {
    match unit {
        PartitionUnit::Seconds | PartitionUnit::Minutes | PartitionUnit::Hours | PartitionUnit::Days => {
            floor_to(ts, unit.fixed_millis().unwrap_or(MILLIS_PER_DAY))
        }
        _ => calendar_start(ts, unit).unwrap_or_else(|| floor_to(ts, MILLIS_PER_DAY)),
    }
}

/// Start of the partition following the one starting at `start`
pub fn next_partition_start(start: Timestamp, unit: PartitionUnit) -> Timestamp {
    if let Some(len) = unit.fixed_millis() {
        return start.saturating_add(len);
    }
    let months = if unit == PartitionUnit::Years { 12 } else { 1 };
    DateTime::<Utc>::from_timestamp_millis(start)
        .and_then(|dt| dt.date_naive().checked_add_months(Months::new(months)))
        .and_then(midnight_millis)
        .unwrap_or(Timestamp::MAX)
}

/// Folder naming scheme of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderNaming {
    /// Decimal epoch milliseconds
    Millis,
    /// `yyyyMMdd`, days only
    Compat,
}

impl FolderNaming {
    pub fn folder_name(self, start: Timestamp) -> String {
        match self {
            FolderNaming::Millis => start.to_string(),
            FolderNaming::Compat => match DateTime::<Utc>::from_timestamp_millis(start) {
                Some(dt) => dt.format("%Y%m%d").to_string(),
                None => start.to_string(),
            },
        }
    }

    /// Parse a folder name back into the partition start
    pub fn parse(self, name: &str) -> Option<Timestamp> {
        match self {
            FolderNaming::Millis => name.parse().ok(),
            FolderNaming::Compat => {
                if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let date = NaiveDate::parse_from_str(name, "%Y%m%d").ok()?;
                midnight_millis(date)
            }
        }
    }
}

/// One partition folder on disk
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Partition {
    /// Partition start in ms
    pub start: Timestamp,
    pub path: PathBuf,
}

impl Partition {
    pub fn new(start: Timestamp, path: PathBuf) -> Self {
        Self { start, path }
    }
}

/// Percent-encode a label into a folder name
pub fn encode_label(label: &str) -> Cow<'_, str> {
    urlencoding::encode(label)
}

/// Decode a label folder name; `None` if it is not valid UTF-8 after decoding
pub fn decode_label(name: &str) -> Option<String> {
    urlencoding::decode(name).ok().map(Cow::into_owned)
}
