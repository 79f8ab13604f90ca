//! III: typed key/value serialization.
//!
//! Each entry is one header byte, the key, then 0/1/2/4 length-or-value
//! bytes and an optional payload:
//!
//! ```text
//! ttt kkkkk
//! |||  \----- key length - 1 (keys are 1..=32 bytes)
//! \|/-------- type
//!
//! 000  false              100  true
//! 001  int, 1 byte        101  string, 1 byte length
//! 010  int, 2 bytes       110  string, 2 byte length
//! 011  int, 4 bytes       111  special, 4 bytes (see below)
//! ```
//!
//! The special type carries a 32-bit word `w`:
//! - `w == 1`: the integer `-1`
//! - `w == 0`: an empty nested mapping
//! - `w` a multiple of 256: a nested mapping of `w / 256` encoded bytes
//! - otherwise: a numeric text of `w` bytes (integers outside `0..=u32::MAX`
//!   and floats)

use super::CodecError;
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;

/// Longest key in bytes.
pub const MAX_KEY_LEN: usize = 32;

/// Longest string value in bytes.
pub const MAX_STRING_LEN: usize = 65_535;

/// A decoded mapping.
pub type Map = BTreeMap<String, Value>;

const T_FALSE: u8 = 0x00;
const T_INT8: u8 = 0x20;
const T_INT16: u8 = 0x40;
const T_INT32: u8 = 0x60;
const T_TRUE: u8 = 0x80;
const T_STR8: u8 = 0xA0;
const T_STR16: u8 = 0xC0;
const T_SPECIAL: u8 = 0xE0;

/// A value stored under a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float, stored as text.
    Float(f64),
    /// UTF-8 string up to 65,535 bytes.
    Str(String),
    /// Nested mapping.
    Map(Map),
}

impl Value {
    /// Returns the boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer, if this is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the string, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the nested mapping, if this is one.
    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Map> for Value {
    fn from(v: Map) -> Self {
        Value::Map(v)
    }
}

/// Encodes a mapping.
pub fn encode(map: &Map) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    for (key, value) in map {
        encode_entry(key, value, &mut out)?;
    }
    Ok(out)
}

fn encode_entry(key: &str, value: &Value, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let key_len = key.len();
    if key_len == 0 || key_len > MAX_KEY_LEN {
        return Err(CodecError::InvalidKeyLength(key_len));
    }
    let k = (key_len - 1) as u8;

    match value {
        Value::Bool(false) => put_key(out, T_FALSE | k, key),
        Value::Bool(true) => put_key(out, T_TRUE | k, key),
        Value::Int(-1) => {
            put_key(out, T_SPECIAL | k, key);
            out.put_u32(1);
        }
        Value::Int(n) if (0..=0xFF).contains(n) => {
            put_key(out, T_INT8 | k, key);
            out.put_u8(*n as u8);
        }
        Value::Int(n) if (0..=0xFFFF).contains(n) => {
            put_key(out, T_INT16 | k, key);
            out.put_u16(*n as u16);
        }
        Value::Int(n) if (0..=0xFFFF_FFFF).contains(n) => {
            put_key(out, T_INT32 | k, key);
            out.put_u32(*n as u32);
        }
        Value::Int(n) => put_numeric_text(out, k, key, &n.to_string()),
        Value::Float(f) => {
            if !f.is_finite() {
                return Err(CodecError::UnsupportedFloat(f.to_string()));
            }
            put_numeric_text(out, k, key, &format!("{:?}", f))
        }
        Value::Str(s) => {
            let len = s.len();
            if len <= 0xFF {
                put_key(out, T_STR8 | k, key);
                out.put_u8(len as u8);
            } else if len <= MAX_STRING_LEN {
                put_key(out, T_STR16 | k, key);
                out.put_u16(len as u16);
            } else {
                return Err(CodecError::StringTooLong(len));
            }
            out.put_slice(s.as_bytes());
        }
        Value::Map(m) => {
            let sub = encode(m)?;
            let word = (sub.len() as u64) * 256;
            if word > u32::MAX as u64 {
                return Err(CodecError::NestedTooLarge(sub.len()));
            }
            put_key(out, T_SPECIAL | k, key);
            out.put_u32(word as u32);
            out.put_slice(&sub);
        }
    }
    Ok(())
}

fn put_key(out: &mut Vec<u8>, header: u8, key: &str) {
    out.put_u8(header);
    out.put_slice(key.as_bytes());
}

// Numeric texts are always 2..=255 bytes, so the word never collides with
// the -1 marker or a nested length.
fn put_numeric_text(out: &mut Vec<u8>, k: u8, key: &str, text: &str) {
    put_key(out, T_SPECIAL | k, key);
    out.put_u32(text.len() as u32);
    out.put_slice(text.as_bytes());
}

/// Decodes a mapping.
pub fn decode(bytes: &[u8]) -> Result<Map, CodecError> {
    let mut map = Map::new();
    let mut buf = bytes;

    while buf.has_remaining() {
        let header = buf.get_u8();
        let key_len = (header & 0x1F) as usize + 1;
        let key = take(&mut buf, key_len)?;
        let key = String::from_utf8(key.to_vec())
            .map_err(|_| CodecError::Malformed("key is not valid UTF-8".to_string()))?;

        let extra = match (header & 0x60) >> 5 {
            0 => 0,
            1 => 1,
            2 => 2,
            _ => 4,
        };
        let raw = take(&mut buf, extra)?;
        let word = raw.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32);

        let value = match header & 0xE0 {
            T_FALSE => Value::Bool(false),
            T_TRUE => Value::Bool(true),
            T_INT8 | T_INT16 | T_INT32 => Value::Int(word as i64),
            T_STR8 | T_STR16 => {
                let s = take(&mut buf, word as usize)?;
                Value::Str(
                    String::from_utf8(s.to_vec())
                        .map_err(|_| CodecError::Malformed(format!("value of '{}' is not UTF-8", key)))?,
                )
            }
            _ => decode_special(&mut buf, word)?,
        };
        map.insert(key, value);
    }

    Ok(map)
}

fn decode_special(buf: &mut &[u8], word: u32) -> Result<Value, CodecError> {
    match word {
        0 => Ok(Value::Map(Map::new())),
        1 => Ok(Value::Int(-1)),
        w if w % 256 == 0 => {
            let sub = take(buf, (w / 256) as usize)?;
            Ok(Value::Map(decode(sub)?))
        }
        w if w < 256 => {
            let text = take(buf, w as usize)?;
            let text = std::str::from_utf8(text)
                .map_err(|_| CodecError::Malformed("numeric text is not UTF-8".to_string()))?;
            if let Ok(n) = text.parse::<i64>() {
                Ok(Value::Int(n))
            } else if let Ok(f) = text.parse::<f64>() {
                Ok(Value::Float(f))
            } else {
                Err(CodecError::Malformed(format!("invalid numeric text '{}'", text)))
            }
        }
        w => Err(CodecError::Malformed(format!("invalid special word {:#x}", w))),
    }
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    if buf.len() < n {
        return Err(CodecError::Truncated { needed: n, available: buf.len() });
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, Value)]) -> Map {
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_scalar_encodings() {
        assert_eq!(encode(&map(&[("a", Value::Bool(false))])).unwrap(), vec![0x00, b'a']);
        assert_eq!(encode(&map(&[("a", Value::Bool(true))])).unwrap(), vec![0x80, b'a']);
        assert_eq!(encode(&map(&[("a", Value::Int(7))])).unwrap(), vec![0x20, b'a', 7]);
        assert_eq!(encode(&map(&[("a", Value::Int(300))])).unwrap(), vec![0x40, b'a', 0x01, 0x2C]);
        assert_eq!(
            encode(&map(&[("a", Value::Int(70_000))])).unwrap(),
            vec![0x60, b'a', 0x00, 0x01, 0x11, 0x70]
        );
        assert_eq!(
            encode(&map(&[("a", Value::Int(-1))])).unwrap(),
            vec![0xE0, b'a', 0x00, 0x00, 0x00, 0x01]
        );
        assert_eq!(
            encode(&map(&[("ab", Value::Str("xy".into()))])).unwrap(),
            vec![0xA1, b'a', b'b', 2, b'x', b'y']
        );
    }

    #[test]
    fn test_roundtrip_nested() {
        let inner = map(&[
            ("maxl", Value::Int(10 * 1024 * 1024)),
            ("numb", Value::Bool(false)),
            ("hash", Value::Str("sha256".into())),
        ]);
        let deeper = map(&[("x", Value::Map(map(&[("y", Value::Int(-1))])))]);
        let m = map(&[
            ("sid", Value::Str("0102030405060708".into())),
            ("blk", Value::Map(inner)),
            ("deep", Value::Map(deeper)),
            ("empty", Value::Map(Map::new())),
        ]);

        let encoded = encode(&m).unwrap();
        assert_eq!(decode(&encoded).unwrap(), m);
    }

    #[test]
    fn test_large_and_negative_integers() {
        let m = map(&[
            ("max", Value::Int(u32::MAX as i64)),
            ("big", Value::Int(u32::MAX as i64 + 1)),
            ("neg", Value::Int(-42)),
            ("min", Value::Int(i64::MIN)),
        ]);
        let decoded = decode(&encode(&m).unwrap()).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn test_float_fallback() {
        let m = map(&[("f", Value::Float(1.5)), ("g", Value::Float(1e300))]);
        let decoded = decode(&encode(&m).unwrap()).unwrap();
        assert_eq!(decoded, m);

        assert!(encode(&map(&[("f", Value::Float(f64::NAN))])).is_err());
    }

    #[test]
    fn test_string_limits() {
        let long = "x".repeat(MAX_STRING_LEN);
        let m = map(&[("s", Value::Str(long))]);
        let encoded = encode(&m).unwrap();
        assert_eq!(encoded[0], T_STR16);
        assert_eq!(decode(&encoded).unwrap(), m);

        let too_long = map(&[("s", Value::Str("x".repeat(MAX_STRING_LEN + 1)))]);
        assert_eq!(encode(&too_long), Err(CodecError::StringTooLong(MAX_STRING_LEN + 1)));
    }

    #[test]
    fn test_key_limits() {
        let longest = map(&[(&"k".repeat(MAX_KEY_LEN), Value::Bool(true)), ("z", Value::Int(1))]);
        let encoded = encode(&longest).unwrap();
        assert_eq!(encoded[0], T_TRUE | 0x1F);
        assert_eq!(decode(&encoded).unwrap(), longest);

        // the length field has five bits; a 33rd byte would spill into the type
        let too_long = map(&[(&"k".repeat(33), Value::Bool(false))]);
        assert_eq!(encode(&too_long), Err(CodecError::InvalidKeyLength(33)));

        let empty = map(&[("", Value::Bool(true))]);
        assert_eq!(encode(&empty), Err(CodecError::InvalidKeyLength(0)));
    }

    #[test]
    fn test_truncated_input() {
        let encoded = encode(&map(&[("name", Value::Str("value".into()))])).unwrap();
        for cut in 1..encoded.len() {
            assert!(decode(&encoded[..cut]).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_malformed_special_word() {
        // special word 0x1234 is neither a marker, text length nor nested length
        let bytes = vec![0xE0, b'a', 0x00, 0x00, 0x12, 0x34];
        assert!(matches!(decode(&bytes), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_empty_map() {
        assert!(encode(&Map::new()).unwrap().is_empty());
        assert!(decode(&[]).unwrap().is_empty());
    }
}
