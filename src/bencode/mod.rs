//! Bencoding codec: decode/encode the canonical dictionary-list-integer-bytestring
//! format used by `.torrent` files and tracker responses.
//!
//! Dictionary keys MUST be sorted in lexicographic byte order on both encode
//! and decode; a dictionary decoded off the wire with out-of-order or
//! duplicate keys is rejected as `NonCanonicalDictionary` so that a later
//! re-encode is guaranteed to be byte-identical to the source (this is what
//! keeps the infohash stable across a round trip).
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

/// A decoded Bencode value.
///
/// Dictionaries use a `BTreeMap` rather than a `HashMap` so that iteration
/// order is always sorted, matching the wire format without a separate sort
/// step on every encode.
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Custom error type for Bencode operations.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed encoding: {0}")]
    MalformedEncoding(String),

    #[error("trailing garbage after top-level value")]
    TrailingGarbage,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("non-canonical dictionary: {0}")]
    NonCanonicalDictionary(String),

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("invalid integer format")]
    InvalidInteger,

    #[error("invalid string length")]
    InvalidStringLength,

    #[error("cannot encode type: {0}")]
    CannotEncodeType(&'static str),

    #[error("dictionary keys must be strings")]
    DictKeyNotString,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;

/// Decode a single top-level value, rejecting any trailing bytes.
pub fn decode(input: &[u8]) -> BencodeResult<BencodeValue> {
    let mut d = decoder::Decoder::new(input);
    let value = d.decode_value()?;
    if d.position() != input.len() {
        return Err(BencodeError::TrailingGarbage);
    }
    Ok(value)
}

/// Encode a value into its canonical bencode representation.
pub fn encode(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encoder::encode(&mut buf, value)?;
    Ok(buf)
}
