//! Order-preserving key encoding for 64-bit record ids.
//!
//! Engine tables compare keys as raw bytes, so ids must be encoded such
//! that the byte comparison of two encoded keys matches the integer
//! comparison of the ids. Flipping the sign bit and emitting big-endian
//! bytes gives exactly that: negative ids sort before positive ones, and
//! within each sign the big-endian layout preserves magnitude order.

use crate::errdata;
use crate::error::Result;

/// Encoded width of an integer key.
pub const KEY_SIZE: usize = 8;

/// Encode an integer with order preservation.
pub fn encode_integer(i: i64) -> [u8; KEY_SIZE] {
    // Flip the sign bit to ensure negative numbers sort before positive
    let unsigned = (i as u64) ^ (1u64 << 63);
    unsigned.to_be_bytes()
}

/// Decode an integer from bytes.
pub fn decode_integer(bytes: &[u8]) -> Result<i64> {
    if bytes.len() != KEY_SIZE {
        return errdata!("integer key must be {KEY_SIZE} bytes, got {}", bytes.len());
    }

    let mut buf = [0u8; KEY_SIZE];
    buf.copy_from_slice(bytes);
    let unsigned = u64::from_be_bytes(buf);

    // Flip the sign bit back
    Ok((unsigned ^ (1u64 << 63)) as i64)
}
