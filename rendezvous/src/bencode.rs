//! Bencode, the framing used by the mainline DHT.
//!
//! Pure byte-in/byte-out code with no I/O so it can be exercised on its own.
//! Decoding is strict about integers (no leading zeros, no `-0`) and bounds
//! nesting depth; dictionary keys may arrive in any order.

use std::collections::BTreeMap;
use thiserror::Error;

/// Deeper nesting than this is rejected
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected byte 0x{byte:02x} at {pos}")]
    UnexpectedByte { pos: usize, byte: u8 },
    #[error("malformed integer at {pos}")]
    InvalidInt { pos: usize },
    #[error("malformed string length at {pos}")]
    InvalidLength { pos: usize },
    #[error("dictionary key at {pos} is not a byte string")]
    InvalidKey { pos: usize },
    #[error("nesting deeper than {MAX_DEPTH}")]
    TooDeep,
    #[error("trailing data at {pos}")]
    TrailingData { pos: usize },
}

impl Value {
    pub fn bytes(b: impl AsRef<[u8]>) -> Self {
        Value::Bytes(b.as_ref().to_vec())
    }

    /// Build a dictionary from `(key, value)` pairs
    pub fn dict<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<[u8]>,
    {
        Value::Dict(entries.into_iter().map(|(k, v)| (k.as_ref().to_vec(), v)).collect())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` for missing keys and non-dictionaries
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

pub fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            // BTreeMap iterates keys in raw byte order, as bencode requires
            out.push(b'd');
            for (k, v) in entries {
                out.extend_from_slice(k.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(k);
                encode_into(v, out);
            }
            out.push(b'e');
        }
    }
}

/// Decode exactly one value spanning all of `data`
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let (value, used) = decode_prefix(data)?;
    if used != data.len() {
        return Err(BencodeError::TrailingData { pos: used });
    }
    Ok(value)
}

/// Decode one value from the front of `data`, returning it and the bytes used
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;
    Ok((value, decoder.pos))
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Decoder<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data.get(self.pos).copied().ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => self.int().map(Value::Int),
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut entries = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key_pos = self.pos;
                    if !self.peek()?.is_ascii_digit() {
                        return Err(BencodeError::InvalidKey { pos: key_pos });
                    }
                    let key = self.byte_string()?;
                    let value = self.value(depth + 1)?;
                    entries.insert(key, value);
                }
                self.pos += 1;
                Ok(Value::Dict(entries))
            }
            b'0'..=b'9' => self.byte_string().map(Value::Bytes),
            byte => Err(BencodeError::UnexpectedByte { pos: self.pos, byte }),
        }
    }

    fn int(&mut self) -> Result<i64, BencodeError> {
        let start = self.pos;
        self.pos += 1;
        let rest = &self.data[self.pos..];
        let end = rest.iter().position(|&b| b == b'e').ok_or(BencodeError::UnexpectedEof)?;
        let digits = &rest[..end];

        let invalid = BencodeError::InvalidInt { pos: start };
        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        if unsigned.is_empty()
            || !unsigned.iter().all(u8::is_ascii_digit)
            || (unsigned.len() > 1 && unsigned[0] == b'0')
            || (digits[0] == b'-' && unsigned == b"0")
        {
            return Err(invalid);
        }
        let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInt { pos: start })?;
        let n = text.parse::<i64>().map_err(|_| invalid)?;
        self.pos += end + 1;
        Ok(n)
    }

    fn byte_string(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        let rest = &self.data[self.pos..];
        let colon = rest.iter().position(|&b| b == b':').ok_or(BencodeError::UnexpectedEof)?;
        let digits = &rest[..colon];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) || (digits.len() > 1 && digits[0] == b'0') {
            return Err(BencodeError::InvalidLength { pos: start });
        }
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidLength { pos: start })?;

        let body_start = self.pos + colon + 1;
        let body_end = body_start.checked_add(len).ok_or(BencodeError::InvalidLength { pos: start })?;
        if body_end > self.data.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        self.pos = body_end;
        Ok(self.data[body_start..body_end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn encodes_a_ping_query() {
        let msg = Value::dict([
            ("t", Value::from("aa")),
            ("y", Value::from("q")),
            ("q", Value::from("ping")),
            ("a", Value::dict([("id", Value::from("abcdefghij0123456789"))])),
        ]);
        assert_eq!(
            encode(&msg),
            b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe".to_vec()
        );
    }

    #[test]
    fn decodes_scalars_and_containers() {
        assert_eq!(decode(b"i42e"), Ok(Value::Int(42)));
        assert_eq!(decode(b"i-7e"), Ok(Value::Int(-7)));
        assert_eq!(decode(b"0:"), Ok(Value::Bytes(vec![])));
        assert_eq!(
            decode(b"l4:spami3ee"),
            Ok(Value::List(vec![Value::from("spam"), Value::Int(3)]))
        );
        let dict = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        assert_eq!(dict.get(b"cow").and_then(Value::as_bytes), Some(&b"moo"[..]));
    }

    #[test]
    fn accepts_unsorted_keys() {
        let v = decode(b"d1:bi2e1:ai1ee").unwrap();
        assert_eq!(encode(&v), b"d1:ai1e1:bi2ee".to_vec());
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(decode(b""), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b"i03e"), Err(BencodeError::InvalidInt { pos: 0 }));
        assert_eq!(decode(b"i-0e"), Err(BencodeError::InvalidInt { pos: 0 }));
        assert_eq!(decode(b"ie"), Err(BencodeError::InvalidInt { pos: 0 }));
        assert_eq!(decode(b"i12"), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b"5:abc"), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b"di1ei2ee"), Err(BencodeError::InvalidKey { pos: 1 }));
        assert_eq!(decode(b"i1ei2e"), Err(BencodeError::TrailingData { pos: 3 }));
        assert_eq!(decode(b"x"), Err(BencodeError::UnexpectedByte { pos: 0, byte: b'x' }));
        assert_eq!(decode(b"l1:a"), Err(BencodeError::UnexpectedEof));
    }

    #[test]
    fn bounds_nesting() {
        let mut deep = vec![b'l'; MAX_DEPTH + 2];
        deep.extend(vec![b'e'; MAX_DEPTH + 2]);
        assert_eq!(decode(&deep), Err(BencodeError::TooDeep));
    }

    #[test]
    fn huge_length_prefix_is_an_error() {
        assert!(decode(b"99999999999999999999999:x").is_err());
    }

    fn random_value(rng: &mut StdRng, depth: usize) -> Value {
        let kind = if depth > 3 { rng.gen_range(0..2) } else { rng.gen_range(0..4) };
        match kind {
            0 => Value::Int(rng.gen()),
            1 => {
                let len = rng.gen_range(0..24);
                Value::Bytes((0..len).map(|_| rng.gen()).collect())
            }
            2 => Value::List((0..rng.gen_range(0..5)).map(|_| random_value(rng, depth + 1)).collect()),
            _ => Value::Dict(
                (0..rng.gen_range(0..5))
                    .map(|_| {
                        let key: Vec<u8> = (0..rng.gen_range(0..6)).map(|_| rng.gen()).collect();
                        (key, random_value(rng, depth + 1))
                    })
                    .collect(),
            ),
        }
    }

    #[test]
    fn random_values_survive_a_round_trip() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..500 {
            let v = random_value(&mut rng, 0);
            assert_eq!(decode(&encode(&v)), Ok(v));
        }
    }

    #[test]
    fn mutated_input_never_panics() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..2000 {
            let mut bytes = encode(&random_value(&mut rng, 0));
            if !bytes.is_empty() {
                for _ in 0..rng.gen_range(1..4) {
                    let i = rng.gen_range(0..bytes.len());
                    bytes[i] = rng.gen();
                }
                bytes.truncate(rng.gen_range(0..=bytes.len()));
            }
            let _ = decode(&bytes);
        }
    }
}
