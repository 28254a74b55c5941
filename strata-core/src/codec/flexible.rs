//! Flexible-interval record layout
//!
//! After the header, a file is a sequence of 17-byte records
//! (`timestamp: i64`, `value: f64`, `quality: u8`) with strictly
//! increasing timestamps.

use crate::config::{FLEXIBLE_RECORD_SIZE, HEADER_SIZE};
use crate::{Quality, Sample, Timestamp};
use bytes::{Buf, BufMut, BytesMut};

/// Record size in bytes
pub const RECORD_SIZE: usize = FLEXIBLE_RECORD_SIZE as usize;

/// Encode one record
pub fn encode_record(buf: &mut BytesMut, sample: &Sample) {
    buf.put_i64(sample.timestamp);
    buf.put_f64(sample.value);
    buf.put_u8(sample.quality.as_byte());
}

/// Decode one record; `data` must hold at least 17 bytes
pub fn decode_record(mut data: &[u8]) -> Sample {
    let timestamp = data.get_i64();
    let value = data.get_f64();
    let quality = Quality::from_byte(data.get_u8());
    Sample::new(timestamp, value, quality)
}

/// Decode every complete record in `body`, NaN values included.
/// A trailing partial record is ignored.
pub fn decode_all(body: &[u8]) -> Vec<Sample> {
    body.chunks_exact(RECORD_SIZE).map(decode_record).collect()
}

/// Count records in `[start, end]`, stopping at the first record past `end`
pub fn count_between(body: &[u8], start: Timestamp, end: Timestamp) -> u64 {
    let mut count = 0;
    for chunk in body.chunks_exact(RECORD_SIZE) {
        let ts = (&chunk[..8]).get_i64();
        if ts > end {
            break;
        }
        if ts >= start {
            count += 1;
        }
    }
    count
}

/// Length of the file once a trailing partial record is cut off
pub fn complete_length(length: u64) -> u64 {
    if length < HEADER_SIZE {
        return length;
    }
    HEADER_SIZE + (length - HEADER_SIZE) / FLEXIBLE_RECORD_SIZE * FLEXIBLE_RECORD_SIZE
}

/// Offset of the last complete record, if any
pub fn last_record_offset(length: u64) -> Option<u64> {
    let complete = complete_length(length);
    if complete < HEADER_SIZE + FLEXIBLE_RECORD_SIZE {
        None
    } else {
        Some(complete - FLEXIBLE_RECORD_SIZE)
    }
}
