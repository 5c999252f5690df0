//! Oplog record id packing.
//!
//! Oplog records carry their own ids: the first 8 bytes of the record are
//! a big-endian pair of `(seconds, ordinal)` packed into a single positive
//! 63-bit integer. Packing the timestamp into the id keeps the table in
//! time order and lets the truncate stones address whole time ranges.

use byteorder::{BigEndian, ByteOrder};

use crate::errdata;
use crate::error::Result;
use crate::store::RecordId;

/// Pack a `(seconds, ordinal)` timestamp into a record id.
///
/// Fails if the seconds value would set the sign bit: ids must stay
/// strictly positive.
pub fn id_for_time(seconds: u32, ordinal: u32) -> Result<RecordId> {
    if seconds & (1 << 31) != 0 {
        return errdata!("timestamp seconds {seconds} out of range for a record id");
    }
    Ok(RecordId::new(((seconds as i64) << 32) | ordinal as i64))
}

/// Extract the packed id from an oplog record's leading bytes.
pub fn extract_id(data: &[u8]) -> Result<RecordId> {
    if data.len() < 8 {
        return errdata!("oplog record of {} bytes is too short to carry an id", data.len());
    }
    let raw = BigEndian::read_i64(data);
    if raw <= 0 {
        return errdata!("oplog record id {raw} is not strictly positive");
    }
    Ok(RecordId::new(raw))
}

/// Build an oplog record: the packed id header followed by the payload.
/// Mostly useful for producers and tests.
pub fn make_record(seconds: u32, ordinal: u32, payload: &[u8]) -> Result<Vec<u8>> {
    let id = id_for_time(seconds, ordinal)?;
    let mut data = Vec::with_capacity(8 + payload.len());
    data.extend_from_slice(&id.repr().to_be_bytes());
    data.extend_from_slice(payload);
    Ok(data)
}
