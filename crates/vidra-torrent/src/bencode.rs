//! Bencode codec with a typed value tree.
//!
//! Byte strings are kept raw; UTF-8 decoding is a read-side helper only.
//! Encoding emits dictionary keys in lexicographic byte order, which is
//! load-bearing for info-hash stability: decoding a sorted document and
//! re-encoding it must reproduce the input bytes.

use std::collections::BTreeMap;

use thiserror::Error;

/// Nesting depth after which decoding is aborted to bound stack usage.
const MAX_DEPTH: usize = 256;

/// Result alias for bencode operations.
pub type Result<T> = std::result::Result<T, BencodeError>;

/// Errors raised by the bencode codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    /// Unexpected byte, truncated input, or trailing garbage.
    #[error("malformed bencode: {reason}")]
    Malformed {
        /// What the decoder stumbled over.
        reason: &'static str,
    },
    /// An integer did not fit into 64 signed bits.
    #[error("bencode integer overflows 64 bits")]
    Overflow,
    /// More than [`MAX_DEPTH`] nested containers.
    #[error("bencode nesting deeper than {MAX_DEPTH} levels")]
    DepthExceeded,
}

fn malformed<T>(reason: &'static str) -> Result<T> {
    Err(BencodeError::Malformed { reason })
}

/// A decoded bencode value.
///
/// Dictionaries are keyed by raw bytes; the `BTreeMap` ordering doubles as
/// the canonical key order required on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A 64-bit signed integer (`i<n>e`).
    Int(i64),
    /// A raw byte string (`<len>:<bytes>`), no text encoding assumed.
    Bytes(Vec<u8>),
    /// A list (`l…e`).
    List(Vec<Value>),
    /// A dictionary (`d…e`) with byte-string keys.
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// The integer payload, if this is an integer.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// The raw bytes, if this is a byte string.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The byte string decoded as UTF-8, if this is a valid UTF-8 string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// The element list, if this is a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// The key/value map, if this is a dictionary.
    #[must_use]
    pub const fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Self::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Dictionary lookup by raw key.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|entries| entries.get(key))
    }
}

/// Decode a single bencode document.
///
/// # Errors
///
/// Fails on malformed input, integer overflow, excessive nesting, and on any
/// bytes trailing the top-level value.
pub fn decode(input: &[u8]) -> Result<Value> {
    let mut decoder = Decoder { input, pos: 0 };
    let value = decoder.value(0)?;
    if decoder.pos != decoder.input.len() {
        return malformed("trailing bytes after document");
    }
    Ok(value)
}

/// Encode a value into canonical bencode bytes.
#[must_use]
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(int) => {
            out.push(b'i');
            out.extend_from_slice(int.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            out.push(b'd');
            // BTreeMap iterates in ascending byte order, which is exactly the
            // canonical key order.
            for (key, item) in entries {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Decoder<'_> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Result<u8> {
        let byte = self.peek();
        self.pos += 1;
        byte.map_or_else(|| malformed("unexpected end of input"), Ok)
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::DepthExceeded);
        }
        match self.peek() {
            Some(b'i') => self.integer(),
            Some(b'l') => self.list(depth),
            Some(b'd') => self.dict(depth),
            Some(b'0'..=b'9') => Ok(Value::Bytes(self.byte_string()?)),
            Some(_) => malformed("unexpected byte"),
            None => malformed("unexpected end of input"),
        }
    }

    fn integer(&mut self) -> Result<Value> {
        self.pos += 1; // consume 'i'
        let negative = if self.peek() == Some(b'-') {
            self.pos += 1;
            true
        } else {
            false
        };

        let mut digits = 0usize;
        let mut acc: i64 = 0;
        loop {
            match self.bump()? {
                b'e' => break,
                byte @ b'0'..=b'9' => {
                    digits += 1;
                    // reject redundant leading zeros ("i03e", "i-0e")
                    if digits == 2 && acc == 0 {
                        return malformed("integer with leading zero");
                    }
                    let digit = i64::from(byte - b'0');
                    acc = acc
                        .checked_mul(10)
                        .and_then(|value| {
                            if negative {
                                value.checked_sub(digit)
                            } else {
                                value.checked_add(digit)
                            }
                        })
                        .ok_or(BencodeError::Overflow)?;
                }
                _ => return malformed("non-digit in integer"),
            }
        }
        if digits == 0 {
            return malformed("empty integer");
        }
        if negative && acc == 0 {
            return malformed("negative zero integer");
        }
        Ok(Value::Int(acc))
    }

    fn byte_string(&mut self) -> Result<Vec<u8>> {
        let mut len: usize = 0;
        loop {
            match self.bump()? {
                b':' => break,
                byte @ b'0'..=b'9' => {
                    len = len
                        .checked_mul(10)
                        .and_then(|value| value.checked_add((byte - b'0') as usize))
                        .ok_or(BencodeError::Overflow)?;
                }
                _ => return malformed("non-digit in string length"),
            }
        }
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.input.len())
            .ok_or(BencodeError::Malformed {
                reason: "string length past end of input",
            })?;
        let bytes = self.input[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value> {
        self.pos += 1; // consume 'l'
        let mut items = Vec::new();
        loop {
            if self.peek() == Some(b'e') {
                self.pos += 1;
                return Ok(Value::List(items));
            }
            items.push(self.value(depth + 1)?);
        }
    }

    fn dict(&mut self, depth: usize) -> Result<Value> {
        self.pos += 1; // consume 'd'
        let mut entries = BTreeMap::new();
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(Value::Dict(entries));
                }
                Some(b'0'..=b'9') => {
                    let key = self.byte_string()?;
                    let value = self.value(depth + 1)?;
                    if entries.insert(key, value).is_some() {
                        return malformed("duplicate dictionary key");
                    }
                }
                Some(_) => return malformed("dictionary key must be a string"),
                None => return malformed("unexpected end of input"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(value: &str) -> Value {
        Value::Bytes(value.as_bytes().to_vec())
    }

    #[test]
    fn encodes_dictionary_with_sorted_keys() {
        let mut entries = BTreeMap::new();
        entries.insert(b"spam".to_vec(), bytes("eggs"));
        entries.insert(b"cow".to_vec(), bytes("moo"));
        let encoded = encode(&Value::Dict(entries));
        assert_eq!(encoded, b"d3:cow3:moo4:spam4:eggse");
    }

    #[test]
    fn decodes_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-17e").unwrap(), Value::Int(-17));
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
        assert_eq!(decode(b"4:spam").unwrap(), bytes("spam"));
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Vec::new()));
    }

    #[test]
    fn decodes_nested_containers() {
        let value = decode(b"d4:listl4:spami7ee3:inti-1ee").unwrap();
        assert_eq!(
            value.get(b"list").and_then(Value::as_list).map(<[Value]>::len),
            Some(2)
        );
        assert_eq!(value.get(b"int").and_then(Value::as_int), Some(-1));
    }

    #[test]
    fn round_trips_sorted_documents_byte_for_byte() {
        let documents: &[&[u8]] = &[
            b"d3:cow3:moo4:spam4:eggse",
            b"l4:spam4:eggsi42ee",
            b"d4:infod6:lengthi1048576e4:name1:x12:piece lengthi262144eee",
            b"i-123456789e",
        ];
        for document in documents {
            let value = decode(document).unwrap();
            assert_eq!(&encode(&value), document);
            assert_eq!(decode(&encode(&value)).unwrap(), value);
        }
    }

    #[test]
    fn rejects_malformed_documents() {
        let cases: &[&[u8]] = &[
            b"",
            b"i42",          // unterminated integer
            b"ie",           // empty integer
            b"i-0e",         // negative zero
            b"i03e",         // leading zero
            b"izze",         // non-digit
            b"5:spam",       // string shorter than declared
            b"l4:spam",      // unterminated list
            b"d3:cow3:moo",  // unterminated dict
            b"di1e3:mooe",   // non-string dict key
            b"d3:aaai1e3:aaai2ee", // duplicate key
            b"i1ei2e",       // trailing document
            b"x",            // unknown token
        ];
        for case in cases {
            assert!(
                matches!(decode(case), Err(BencodeError::Malformed { .. })),
                "expected malformed for {case:?}"
            );
        }
    }

    #[test]
    fn rejects_integer_overflow() {
        assert_eq!(decode(b"i9223372036854775808e"), Err(BencodeError::Overflow));
        assert_eq!(
            decode(b"i-9223372036854775809e"),
            Err(BencodeError::Overflow)
        );
        // i64::MIN itself still fits
        assert_eq!(
            decode(b"i-9223372036854775808e").unwrap(),
            Value::Int(i64::MIN)
        );
    }

    #[test]
    fn rejects_excessive_nesting() {
        let mut document = Vec::new();
        document.extend(std::iter::repeat_n(b'l', 300));
        document.extend(std::iter::repeat_n(b'e', 300));
        assert_eq!(decode(&document), Err(BencodeError::DepthExceeded));
    }
}
