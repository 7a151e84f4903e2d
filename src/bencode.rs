//! Bencode codec
//!
//! Decodes and encodes the four bencode kinds: byte strings, integers,
//! lists, and dictionaries. Decoding is strict (dictionary keys must be
//! unique and in raw byte order), encoding is canonical, so
//! `encode(decode(b)) == b` for any conformantly encoded `b`. The infohash
//! computation depends on this.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::error::TorrentError;

/// A bencoded value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
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

    /// Byte string interpreted as UTF-8, lossy
    pub fn as_str_lossy(&self) -> Option<String> {
        self.as_bytes().map(|b| String::from_utf8_lossy(b).to_string())
    }

    /// Encode to canonical bencoded bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encode into an existing buffer
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Int(i) => {
                buf.push(b'i');
                buf.extend_from_slice(i.to_string().as_bytes());
                buf.push(b'e');
            }
            Value::Bytes(bytes) => {
                buf.extend_from_slice(bytes.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(bytes);
            }
            Value::List(list) => {
                buf.push(b'l');
                for item in list {
                    item.encode_into(buf);
                }
                buf.push(b'e');
            }
            Value::Dict(dict) => {
                buf.push(b'd');
                // BTreeMap iterates in raw byte order, which is the sort key
                for (key, value) in dict {
                    buf.extend_from_slice(key.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(key);
                    value.encode_into(buf);
                }
                buf.push(b'e');
            }
        }
    }
}

/// Encode a value to canonical bencoded bytes
pub fn encode(value: &Value) -> Vec<u8> {
    value.encode()
}

/// Decode a single value that must span the whole input
pub fn decode(data: &[u8]) -> Result<Value> {
    let mut decoder = Decoder::new(data);
    let value = decoder.decode()?;
    if decoder.position() != data.len() {
        return Err(TorrentError::malformed_with_source(
            "Trailing bytes after bencoded value",
            format!("consumed {} of {}", decoder.position(), data.len()),
        )
        .into());
    }
    Ok(value)
}

/// Cursor-based bencode decoder
///
/// `position()` is exposed so callers can record the byte span of a value,
/// which is how the metainfo parser captures the exact `info` slice.
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current cursor position in bytes
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Decode one value, advancing the cursor past it
    pub fn decode(&mut self) -> Result<Value> {
        match self.peek()? {
            b'i' => self.decode_int(),
            b'l' => self.decode_list(),
            b'd' => self.decode_dict(),
            b'0'..=b'9' => self.decode_bytes(),
            other => Err(TorrentError::malformed_with_source(
                "Unexpected tag byte",
                format!("0x{:02x} at offset {}", other, self.pos),
            )
            .into()),
        }
    }

    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| TorrentError::malformed("Truncated input").into())
    }

    fn decode_int(&mut self) -> Result<Value> {
        self.pos += 1; // skip 'i'
        let end = self.find(b'e').ok_or_else(|| {
            anyhow::Error::from(TorrentError::malformed("Unterminated integer"))
        })?;
        let digits = std::str::from_utf8(&self.data[self.pos..end])
            .map_err(|e| TorrentError::malformed_with_source("Non-UTF-8 integer", e.to_string()))?;
        let value: i64 = digits.parse().map_err(|_| {
            TorrentError::malformed_with_source("Non-numeric integer", digits.to_string())
        })?;
        self.pos = end + 1;
        Ok(Value::Int(value))
    }

    fn decode_bytes(&mut self) -> Result<Value> {
        let colon = self.find(b':').ok_or_else(|| {
            anyhow::Error::from(TorrentError::malformed("Unterminated string length"))
        })?;
        let digits = std::str::from_utf8(&self.data[self.pos..colon])
            .map_err(|e| TorrentError::malformed_with_source("Non-UTF-8 length", e.to_string()))?;
        let length: usize = digits.parse().map_err(|_| {
            TorrentError::malformed_with_source("Non-numeric length", digits.to_string())
        })?;
        let start = colon + 1;
        let end = start.checked_add(length).filter(|&e| e <= self.data.len());
        let end = end.ok_or_else(|| {
            anyhow::Error::from(TorrentError::malformed_with_source(
                "Truncated byte string",
                format!("need {} bytes at offset {}", length, start),
            ))
        })?;
        self.pos = end;
        Ok(Value::Bytes(self.data[start..end].to_vec()))
    }

    fn decode_list(&mut self) -> Result<Value> {
        self.pos += 1; // skip 'l'
        let mut list = Vec::new();
        while self.peek()? != b'e' {
            list.push(self.decode()?);
        }
        self.pos += 1; // skip 'e'
        Ok(Value::List(list))
    }

    fn decode_dict(&mut self) -> Result<Value> {
        self.pos += 1; // skip 'd'
        let mut dict = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        while self.peek()? != b'e' {
            let key = match self.decode()? {
                Value::Bytes(b) => b,
                _ => {
                    return Err(
                        TorrentError::malformed("Dictionary key is not a byte string").into()
                    )
                }
            };
            // keys must be strictly increasing in raw byte order
            if let Some(prev) = &last_key {
                if key.as_slice() <= prev.as_slice() {
                    return Err(TorrentError::malformed_with_source(
                        "Dictionary keys not in strict byte order",
                        String::from_utf8_lossy(&key).to_string(),
                    )
                    .into());
                }
            }
            let value = self.decode()?;
            last_key = Some(key.clone());
            dict.insert(key, value);
        }
        self.pos += 1; // skip 'e'
        Ok(Value::Dict(dict))
    }

    fn find(&self, byte: u8) -> Option<usize> {
        self.data[self.pos..]
            .iter()
            .position(|&b| b == byte)
            .map(|p| self.pos + p)
    }
}
