//! Fixed-interval slot layout
//!
//! Slot `i` holds the sample for `start + i * period` at byte offset
//! `16 + 9 * i`. A NaN value marks an empty slot.

use super::Header;
use crate::config::{FIXED_RECORD_SIZE, HEADER_SIZE};
use crate::{Quality, Result, Sample, StoreError, Timestamp};
use bytes::{Buf, BufMut, BytesMut};

/// Slot size in bytes
pub const SLOT_SIZE: usize = FIXED_RECORD_SIZE as usize;

/// Encode one slot
pub fn encode_slot(buf: &mut BytesMut, value: f64, quality: Quality) {
    buf.put_f64(value);
    buf.put_u8(quality.as_byte());
}

/// Decode one slot; `data` must hold at least 9 bytes
pub fn decode_slot(mut data: &[u8]) -> (f64, Quality) {
    let value = data.get_f64();
    let quality = Quality::from_byte(data.get_u8());
    (value, quality)
}

/// Slot index for `timestamp`, with a half period rounding to the later slot
pub fn slot_index(header: &Header, timestamp: Timestamp) -> Result<u64> {
    if timestamp < header.start {
        return Err(StoreError::InvalidTimestamp {
            timestamp,
            start: header.start,
        });
    }
    let period = header.period as i128;
    let distance = timestamp as i128 - header.start as i128;
    let (q, r) = (distance / period, distance % period);
    let index = if r >= period - r { q + 1 } else { q };
    Ok(index as u64)
}

/// Whether `timestamp` falls exactly on a slot
pub fn on_grid(header: &Header, timestamp: Timestamp) -> bool {
    (timestamp as i128 - header.start as i128) % header.period as i128 == 0
}

/// Byte offset of a slot
pub fn slot_offset(index: u64) -> u64 {
    HEADER_SIZE + index * FIXED_RECORD_SIZE
}

/// Timestamp represented by a slot
pub fn slot_timestamp(header: &Header, index: u64) -> Timestamp {
    header
        .start
        .saturating_add((index as i64).saturating_mul(header.period))
}

/// Bytes for `missing` empty slots followed by the target slot
pub fn encode_with_gaps(missing: u64, value: f64, quality: Quality) -> BytesMut {
    let mut buf = BytesMut::with_capacity((missing as usize + 1) * SLOT_SIZE);
    for _ in 0..missing {
        encode_slot(&mut buf, f64::NAN, Quality::Bad);
    }
    encode_slot(&mut buf, value, quality);
    buf
}

/// Decode every non-empty slot in `body` (the bytes after the header)
pub fn decode_all(header: &Header, body: &[u8]) -> Vec<Sample> {
    body.chunks_exact(SLOT_SIZE)
        .enumerate()
        .filter_map(|(i, chunk)| {
            let (value, quality) = decode_slot(chunk);
            if value.is_nan() {
                None
            } else {
                Some(Sample::new(slot_timestamp(header, i as u64), value, quality))
            }
        })
        .collect()
}

/// Slot range `[first, last]` whose timestamps fall into `[start, end]`,
/// clipped to `slots` existing slots. `None` if the range is empty.
pub fn slot_range(header: &Header, slots: u64, start: Timestamp, end: Timestamp) -> Option<(u64, u64)> {
    if slots == 0 || end < header.start || start > end {
        return None;
    }
    let period = header.period as i128;
    let from = (start as i128 - header.start as i128).max(0);
    let to = end as i128 - header.start as i128;
    let first = (from + period - 1) / period;
    let last = (to / period).min(slots as i128 - 1);
    if first > last {
        return None;
    }
    Some((first as u64, last as u64))
}
