//! QUIC variable-length integers (RFC 9000 section 16)
//!
//! The two most significant bits of the first byte select a 1, 2, 4 or 8
//! byte encoding; the remaining bits carry the value in network byte order.

use bytes::BufMut;

/// Largest value representable as a varint (2^62 - 1)
pub const MAX_VALUE: u64 = (1 << 62) - 1;

/// Number of bytes `value` occupies when encoded, or `None` if it is too large.
pub fn encoded_len(value: u64) -> Option<usize> {
    match value {
        0..=0x3f => Some(1),
        0x40..=0x3fff => Some(2),
        0x4000..=0x3fff_ffff => Some(4),
        0x4000_0000..=MAX_VALUE => Some(8),
        _ => None,
    }
}

/// Append `value` to `buf`. Returns `false` if the value exceeds [`MAX_VALUE`].
pub fn encode<B: BufMut>(value: u64, buf: &mut B) -> bool {
    match encoded_len(value) {
        Some(1) => buf.put_u8(value as u8),
        Some(2) => buf.put_u16(0x4000 | value as u16),
        Some(4) => buf.put_u32(0x8000_0000 | value as u32),
        Some(8) => buf.put_u64(0xc000_0000_0000_0000 | value),
        _ => return false,
    }
    true
}

/// Decode a varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` when `buf`
/// does not yet hold a complete varint.
pub fn decode(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = 1usize << (first >> 6);
    if buf.len() < len {
        return None;
    }

    let mut value = u64::from(first & 0x3f);
    for byte in &buf[1..len] {
        value = (value << 8) | u64::from(*byte);
    }
    Some((value, len))
}
