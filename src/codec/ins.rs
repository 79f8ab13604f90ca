//! INS: variable-length signed integers (1-3 bytes).
//!
//! ```text
//! 0xxx xxxx                        0 .. 127
//! 10xx xxxx  xxxx xxxx             128 .. 16383
//! 11xx xxxx  xxxx xxxx  xxxx xxxx  16384 .. 4194303
//!
//! 1000 0000  0xxx xxxx             -0 .. -127
//! 1100 0000  00xx xxxx  xxxx xxxx  -128 .. -16383
//! ```
//!
//! Negative values reuse the multi-byte forms with zero high bits, which the
//! positive encoding never produces. The three-byte form with a magnitude
//! below 128 is a reserved alternate encoding that the encoder never emits.

use super::CodecError;
use bytes::BufMut;

/// Largest positive value.
pub const MAX_POSITIVE: u32 = 4_194_303;

/// Largest negative magnitude.
pub const MAX_NEGATIVE: u32 = 16_383;

/// Longest encoding in bytes.
pub const MAX_WIDTH: usize = 3;

/// A decoded INS value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ins {
    /// Absolute value.
    pub magnitude: u32,
    /// Sign flag. `-0` is representable.
    pub negative: bool,
    /// Number of bytes the value occupied.
    pub width: u8,
}

impl Ins {
    /// Signed value (`-0` collapses to `0`).
    pub fn value(&self) -> i32 {
        if self.negative {
            -(self.magnitude as i32)
        } else {
            self.magnitude as i32
        }
    }

    /// True for the reserved three-byte form of a small negative value.
    pub fn is_alternate(&self) -> bool {
        self.negative && self.width == 3 && self.magnitude < 128
    }
}

/// Number of bytes used by an encoding starting with `first`.
pub fn encoded_len(first: u8) -> usize {
    match first & 0xC0 {
        0x00 | 0x40 => 1,
        0x80 => 2,
        _ => 3,
    }
}

/// Encodes a signed integer.
pub fn encode(n: i32) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(MAX_WIDTH);
    encode_into(n, &mut buf)?;
    Ok(buf)
}

/// Encodes a signed integer into `buf`.
pub fn encode_into<B: BufMut>(n: i32, buf: &mut B) -> Result<(), CodecError> {
    if n < 0 {
        put_negative(n.unsigned_abs(), buf)
    } else {
        put_positive(n as u32, buf)
    }
}

/// Encodes a positive value.
pub fn put_positive<B: BufMut>(m: u32, buf: &mut B) -> Result<(), CodecError> {
    if m < 0x80 {
        buf.put_u8(m as u8);
    } else if m < 0x4000 {
        buf.put_u16(0x8000 | m as u16);
    } else if m <= MAX_POSITIVE {
        let v = 0x00C0_0000 | m;
        buf.put_u8((v >> 16) as u8);
        buf.put_u16(v as u16);
    } else {
        return Err(CodecError::IntegerOutOfRange(m as i64));
    }
    Ok(())
}

/// Encodes a negative value by magnitude, so that `-0` can be written.
pub fn put_negative<B: BufMut>(m: u32, buf: &mut B) -> Result<(), CodecError> {
    if m < 0x80 {
        buf.put_u8(0x80);
        buf.put_u8(m as u8);
    } else if m <= MAX_NEGATIVE {
        buf.put_u8(0xC0);
        buf.put_u16(m as u16);
    } else {
        return Err(CodecError::IntegerOutOfRange(-(m as i64)));
    }
    Ok(())
}

/// Decodes one value from the start of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Ins, CodecError> {
    let first = *bytes.first().ok_or(CodecError::Truncated { needed: 1, available: 0 })?;
    let width = encoded_len(first);
    if bytes.len() < width {
        return Err(CodecError::Truncated { needed: width, available: bytes.len() });
    }

    let high = (first & 0x3F) as u32;
    let ins = match width {
        1 => Ins { magnitude: (first & 0x7F) as u32, negative: false, width: 1 },
        2 => {
            let low = bytes[1] as u32;
            if high != 0 {
                Ins { magnitude: (high << 8) | low, negative: false, width: 2 }
            } else {
                Ins { magnitude: low, negative: low & 0x80 == 0, width: 2 }
            }
        }
        _ => {
            let mid = bytes[1] as u32;
            let low = bytes[2] as u32;
            let magnitude = (high << 16) | (mid << 8) | low;
            let negative = high == 0 && mid & 0xC0 == 0;
            Ins { magnitude, negative, width: 3 }
        }
    };
    Ok(ins)
}
