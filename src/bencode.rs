//! Bencode encoding and decoding (BEP-3).
//!
//! Only the subset the extension protocol needs: the four value kinds,
//! a canonical encoder, and a decoder that can stop at the end of the
//! first value (ut_metadata appends raw piece data after the dictionary).

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors produced while decoding bencode data.
#[derive(Debug, Error)]
pub enum BencodeError {
    /// Ran out of input mid-value.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A byte that cannot start or continue a value at this position.
    #[error("invalid byte {0:#04x} at offset {1}")]
    InvalidByte(u8, usize),

    /// An integer or string length that does not parse.
    #[error("invalid number at offset {0}")]
    InvalidNumber(usize),

    /// Trailing bytes after the top-level value.
    #[error("trailing data after value")]
    TrailingData,
}

/// A bencode value: integer, byte string, list, or dictionary.
///
/// Dictionary keys are raw byte strings and sort in encoding order by
/// construction (`BTreeMap`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Creates a byte-string value from a UTF-8 string.
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a dictionary entry by key. `None` for non-dicts.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

/// Encodes a value to its canonical bencode form.
pub fn encode(value: &Value) -> Bytes {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf);
    buf.freeze()
}

/// Appends the canonical encoding of `value` to `buf`.
pub fn encode_into(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Integer(i) => {
            buf.put_u8(b'i');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        Value::Bytes(b) => {
            buf.put_slice(b.len().to_string().as_bytes());
            buf.put_u8(b':');
            buf.put_slice(b);
        }
        Value::List(items) => {
            buf.put_u8(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
        Value::Dict(dict) => {
            buf.put_u8(b'd');
            for (key, val) in dict {
                buf.put_slice(key.len().to_string().as_bytes());
                buf.put_u8(b':');
                buf.put_slice(key);
                encode_into(val, buf);
            }
            buf.put_u8(b'e');
        }
    }
}

/// Decodes a single value that must span the entire input.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let (value, used) = decode_prefix(data)?;
    if used != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Decodes the first value in `data`, returning it and the number of
/// bytes consumed. Trailing bytes are left untouched.
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut pos = 0;
    let value = decode_at(data, &mut pos)?;
    Ok((value, pos))
}

fn decode_at(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    match data.get(*pos).copied() {
        None => Err(BencodeError::UnexpectedEof),
        Some(b'i') => {
            *pos += 1;
            let end = find_byte(data, *pos, b'e')?;
            let n = parse_i64(&data[*pos..end]).ok_or(BencodeError::InvalidNumber(*pos))?;
            *pos = end + 1;
            Ok(Value::Integer(n))
        }
        Some(b'l') => {
            *pos += 1;
            let mut items = Vec::new();
            while data.get(*pos).copied().ok_or(BencodeError::UnexpectedEof)? != b'e' {
                items.push(decode_at(data, pos)?);
            }
            *pos += 1;
            Ok(Value::List(items))
        }
        Some(b'd') => {
            *pos += 1;
            let mut dict = BTreeMap::new();
            while data.get(*pos).copied().ok_or(BencodeError::UnexpectedEof)? != b'e' {
                let key_pos = *pos;
                let key = match decode_at(data, pos)? {
                    Value::Bytes(b) => b,
                    _ => return Err(BencodeError::InvalidByte(data[key_pos], key_pos)),
                };
                let val = decode_at(data, pos)?;
                dict.insert(key, val);
            }
            *pos += 1;
            Ok(Value::Dict(dict))
        }
        Some(b'0'..=b'9') => {
            let colon = find_byte(data, *pos, b':')?;
            let len = parse_i64(&data[*pos..colon])
                .filter(|&n| n >= 0)
                .ok_or(BencodeError::InvalidNumber(*pos))? as usize;
            let start = colon + 1;
            let end = start.checked_add(len).ok_or(BencodeError::InvalidNumber(*pos))?;
            if end > data.len() {
                return Err(BencodeError::UnexpectedEof);
            }
            *pos = end;
            Ok(Value::Bytes(Bytes::copy_from_slice(&data[start..end])))
        }
        Some(b) => Err(BencodeError::InvalidByte(b, *pos)),
    }
}

fn find_byte(data: &[u8], from: usize, byte: u8) -> Result<usize, BencodeError> {
    data[from..]
        .iter()
        .position(|&b| b == byte)
        .map(|i| from + i)
        .ok_or(BencodeError::UnexpectedEof)
}

fn parse_i64(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trip() {
        for n in [0i64, 42, -17, i64::MAX, i64::MIN] {
            let encoded = encode(&Value::Integer(n));
            assert_eq!(decode(&encoded).unwrap(), Value::Integer(n));
        }
    }

    #[test]
    fn dict_keys_sorted() {
        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"zz"), Value::Integer(1));
        dict.insert(Bytes::from_static(b"aa"), Value::Integer(2));
        let encoded = encode(&Value::Dict(dict));
        assert_eq!(&encoded[..], b"d2:aai2e2:zzi1ee");
    }

    #[test]
    fn decode_prefix_leaves_trailer() {
        let (value, used) = decode_prefix(b"d4:spami1eeTRAILER").unwrap();
        assert_eq!(used, 11);
        assert_eq!(value.get(b"spam").and_then(Value::as_integer), Some(1));
    }

    #[test]
    fn rejects_trailing_data() {
        assert!(matches!(decode(b"i1ei2e"), Err(BencodeError::TrailingData)));
    }

    #[test]
    fn rejects_truncated_string() {
        assert!(matches!(decode(b"10:short"), Err(BencodeError::UnexpectedEof)));
    }

    #[test]
    fn nested_list() {
        let value = decode(b"ll4:spami7eee").unwrap();
        let outer = value.as_list().unwrap();
        let inner = outer[0].as_list().unwrap();
        assert_eq!(inner[0].as_str(), Some("spam"));
        assert_eq!(inner[1].as_integer(), Some(7));
    }
}
