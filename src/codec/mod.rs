//! Binary codecs used by the stream format.
//!
//! - **INS**: a 1-3 byte signed length prefix used to frame every record
//! - **III**: a compact typed key/value encoding used for manifests

pub mod iii;
pub mod ins;

pub use iii::{Map, Value};
pub use ins::Ins;

/// Errors produced by the INS and III codecs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The integer cannot be represented by the INS encoding.
    #[error("integer {0} is outside the INS range")]
    IntegerOutOfRange(i64),

    /// Not enough bytes to decode a complete value.
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required to finish decoding.
        needed: usize,
        /// Bytes that were available.
        available: usize,
    },

    /// A mapping key is empty or longer than 32 bytes.
    #[error("invalid key length {0} (must be 1..=32 bytes)")]
    InvalidKeyLength(usize),

    /// A string value is longer than 65,535 bytes.
    #[error("string value of {0} bytes is too long")]
    StringTooLong(usize),

    /// A nested mapping is too large to be length-prefixed.
    #[error("nested mapping of {0} bytes is too large")]
    NestedTooLarge(usize),

    /// A float value cannot be written as text.
    #[error("unsupported float value {0}")]
    UnsupportedFloat(String),

    /// Decoded bytes do not form a valid value.
    #[error("malformed input: {0}")]
    Malformed(String),
}
