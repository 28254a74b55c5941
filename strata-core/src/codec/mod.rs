//! Binary record codec
//!
//! Every sample file starts with a 16-byte big-endian header
//! (`start_timestamp: i64`, `period: i64`). Fixed-interval files carry a
//! positive period followed by dense 9-byte slots; flexible-interval files
//! carry `-1` followed by 17-byte timestamped records.

pub mod fixed;
pub mod flexible;

use crate::config::{FILE_EXTENSION, FLEXIBLE_PERIOD, HEADER_SIZE};
use crate::{Result, StoreError, Timestamp};
use bytes::{Buf, BufMut, BytesMut};

/// File header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Timestamp of slot 0 (fixed) or lower bound of the file (flexible)
    pub start: Timestamp,
    /// Period in ms, or -1 for flexible-interval files
    pub period: i64,
}

impl Header {
    /// Header size in bytes
    pub const SIZE: usize = HEADER_SIZE as usize;

    pub fn new(start: Timestamp, period: i64) -> Self {
        Self { start, period }
    }

    pub fn flexible(start: Timestamp) -> Self {
        Self::new(start, FLEXIBLE_PERIOD)
    }

    pub fn kind(&self) -> FileKind {
        if self.period > 0 {
            FileKind::Fixed
        } else {
            FileKind::Flexible
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_i64(self.start);
        buf.put_i64(self.period);
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(StoreError::Corruption(format!(
                "header too short: {} bytes",
                data.len()
            )));
        }
        let mut cursor = &data[..Self::SIZE];
        Ok(Self {
            start: cursor.get_i64(),
            period: cursor.get_i64(),
        })
    }
}

/// The two on-disk layouts, told apart by file-name prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// `c` prefix, dense slots
    Fixed,
    /// `f` prefix, timestamped records
    Flexible,
}

impl FileKind {
    pub fn prefix(self) -> char {
        match self {
            FileKind::Fixed => 'c',
            FileKind::Flexible => 'f',
        }
    }

    pub fn from_prefix(c: char) -> Option<Self> {
        match c {
            'c' => Some(FileKind::Fixed),
            'f' => Some(FileKind::Flexible),
            _ => None,
        }
    }

    /// Size of one record in this layout
    pub fn record_size(self) -> u64 {
        match self {
            FileKind::Fixed => crate::config::FIXED_RECORD_SIZE,
            FileKind::Flexible => crate::config::FLEXIBLE_RECORD_SIZE,
        }
    }
}

/// `c<timestamp>.slots` or `f<timestamp>.slots`
pub fn file_name(kind: FileKind, created: Timestamp) -> String {
    format!("{}{}{}", kind.prefix(), created, FILE_EXTENSION)
}

/// Parse a sample file name back into its kind and creation timestamp
pub fn parse_file_name(name: &str) -> Option<(FileKind, Timestamp)> {
    let stem = name.strip_suffix(FILE_EXTENSION)?;
    let mut chars = stem.chars();
    let kind = FileKind::from_prefix(chars.next()?)?;
    let ts = chars.as_str().parse().ok()?;
    Some((kind, ts))
}

/// Round a timestamp onto the `step` grid.
///
/// Goes up only when the remainder is strictly more than half a step and
/// the result still fits in an i64; otherwise goes down. The remainder
/// keeps the sign of `timestamp`, so negative instants round toward zero.
pub fn rounded_timestamp(timestamp: Timestamp, step: i64) -> Timestamp {
    if step <= 0 {
        return timestamp;
    }
    let distance = timestamp % step;
    let down = timestamp - distance;
    if distance > step / 2 {
        if let Some(up) = down.checked_add(step) {
            return up;
        }
    }
    down
}

/// Number of whole records after the header
pub(crate) fn record_count(length: u64, kind: FileKind) -> u64 {
    length.saturating_sub(HEADER_SIZE) / kind.record_size()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = Header::new(1_000, 60_000);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..8], &1_000i64.to_be_bytes());
        assert_eq!(&bytes[8..], &60_000i64.to_be_bytes());
        assert_eq!(Header::from_bytes(&bytes).unwrap(), header);
        assert_eq!(header.kind(), FileKind::Fixed);

        let flex = Header::flexible(5);
        assert_eq!(&flex.to_bytes()[8..], &[0xff; 8]);
        assert_eq!(flex.kind(), FileKind::Flexible);
    }

    #[test]
    fn test_short_header() {
        let err = Header::from_bytes(&[0u8; 15]).unwrap_err();
        assert!(matches!(err, StoreError::Corruption(_)));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_file_names() {
        assert_eq!(file_name(FileKind::Fixed, 1234), "c1234.slots");
        assert_eq!(file_name(FileKind::Flexible, -5), "f-5.slots");
        assert_eq!(parse_file_name("c1234.slots"), Some((FileKind::Fixed, 1234)));
        assert_eq!(parse_file_name("f-5.slots"), Some((FileKind::Flexible, -5)));
        assert_eq!(parse_file_name("x1234.slots"), None);
        assert_eq!(parse_file_name("c1234.txt"), None);
        assert_eq!(parse_file_name("cabc.slots"), None);
        assert_eq!(parse_file_name(".slots"), None);
    }

    #[test]
    fn test_rounding() {
        assert_eq!(rounded_timestamp(0, 1000), 0);
        assert_eq!(rounded_timestamp(499, 1000), 0);
        // exactly half goes down
        assert_eq!(rounded_timestamp(500, 1000), 0);
        assert_eq!(rounded_timestamp(501, 1000), 1000);
        assert_eq!(rounded_timestamp(1999, 1000), 2000);
        assert_eq!(rounded_timestamp(-300, 1000), 0);
        assert_eq!(rounded_timestamp(17, 0), 17);
    }

    #[test]
    fn test_rounding_overflow() {
        let step = 1_000;
        let near_max = i64::MAX - 1;
        let rounded = rounded_timestamp(near_max, step);
        assert!(rounded <= near_max);
        assert_eq!(rounded % step, 0);
    }

    #[test]
    fn test_record_count() {
        assert_eq!(record_count(16, FileKind::Fixed), 0);
        assert_eq!(record_count(16 + 9 * 3 + 4, FileKind::Fixed), 3);
        assert_eq!(record_count(16 + 17 * 2, FileKind::Flexible), 2);
        assert_eq!(record_count(3, FileKind::Flexible), 0);
    }
}
