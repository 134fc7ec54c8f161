//! Bencode decoding.
//!
//! Unlike the original prototype (which consumed a `Read` byte-by-byte
//! through a peekable iterator), this decoder walks a byte slice and tracks
//! its cursor position. That lets callers capture the exact byte range of a
//! nested value (used by [`crate::torrent::metainfo`] to hash the `info`
//! dictionary without re-encoding it).
use super::{BencodeError, BencodeResult, BencodeValue};
use std::collections::BTreeMap;
use tracing::instrument;

pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    /// Current byte offset into the input.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Borrow a previously-recorded byte range of the original input.
    pub fn slice(&self, start: usize, end: usize) -> &'a [u8] {
        &self.input[start..end]
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.input.get(self.pos).copied().ok_or(BencodeError::UnexpectedEof)
    }

    fn advance(&mut self) -> BencodeResult<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn read_until(&mut self, delimiter: u8) -> BencodeResult<&'a [u8]> {
        let start = self.pos;
        loop {
            let b = self.peek()?;
            if b == delimiter {
                let slice = &self.input[start..self.pos];
                self.pos += 1;
                return Ok(slice);
            }
            self.pos += 1;
        }
    }

    #[instrument(skip(self), level = "trace")]
    pub fn decode_string(&mut self) -> BencodeResult<Vec<u8>> {
        let len_bytes = self.read_until(b':')?;
        let len_str =
            std::str::from_utf8(len_bytes).map_err(|_| BencodeError::InvalidStringLength)?;
        if len_str.len() > 1 && len_str.starts_with('0') {
            return Err(BencodeError::InvalidStringLength);
        }
        let length: usize = len_str.parse().map_err(|_| BencodeError::InvalidStringLength)?;
        if self.pos + length > self.input.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        let bytes = self.input[self.pos..self.pos + length].to_vec();
        self.pos += length;
        Ok(bytes)
    }

    #[instrument(skip(self), level = "trace")]
    pub fn decode_integer(&mut self) -> BencodeResult<i64> {
        let first = self.advance()?;
        if first != b'i' {
            return Err(BencodeError::MalformedEncoding(
                "integer must start with 'i'".into(),
            ));
        }
        let num_bytes = self.read_until(b'e')?;
        let num_str = std::str::from_utf8(num_bytes).map_err(|_| BencodeError::InvalidInteger)?;

        if num_str.is_empty() {
            return Err(BencodeError::InvalidInteger);
        }
        if num_str == "-0" {
            return Err(BencodeError::InvalidInteger);
        }
        let digits = num_str.strip_prefix('-').unwrap_or(num_str);
        if digits.len() > 1 && digits.starts_with('0') {
            return Err(BencodeError::InvalidInteger);
        }
        num_str.parse::<i64>().map_err(|_| BencodeError::IntegerOverflow)
    }

    #[instrument(skip(self), level = "trace")]
    fn decode_list(&mut self) -> BencodeResult<Vec<BencodeValue>> {
        let first = self.advance()?;
        if first != b'l' {
            return Err(BencodeError::MalformedEncoding("list must start with 'l'".into()));
        }
        let mut list = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(list);
            }
            list.push(self.decode_value()?);
        }
    }

    #[instrument(skip(self), level = "trace")]
    fn decode_dict(&mut self) -> BencodeResult<BTreeMap<Vec<u8>, BencodeValue>> {
        self.decode_dict_with(|_, _, _| {})
    }

    /// Decode a dictionary, invoking `on_entry(key, value_start, value_end)`
    /// for every entry as it's parsed. `value_start`/`value_end` are byte
    /// offsets into the original input, letting a caller (e.g. metainfo
    /// parsing) capture the exact source range of one particular value
    /// without re-encoding it.
    #[instrument(skip(self, on_entry), level = "trace")]
    pub fn decode_dict_with<F: FnMut(&[u8], usize, usize)>(
        &mut self,
        mut on_entry: F,
    ) -> BencodeResult<BTreeMap<Vec<u8>, BencodeValue>> {
        let first = self.advance()?;
        if first != b'd' {
            return Err(BencodeError::MalformedEncoding("dict must start with 'd'".into()));
        }
        let mut dict = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(dict);
            }
            let key = self.decode_string()?;
            if let Some(prev) = &last_key {
                if key <= *prev {
                    return Err(BencodeError::NonCanonicalDictionary(format!(
                        "key {:?} is not strictly greater than preceding key {:?}",
                        String::from_utf8_lossy(&key),
                        String::from_utf8_lossy(prev),
                    )));
                }
            }
            let value_start = self.pos;
            let value = self.decode_value()?;
            let value_end = self.pos;
            on_entry(&key, value_start, value_end);
            last_key = Some(key.clone());
            dict.insert(key, value);
        }
    }

    #[instrument(skip(self), level = "trace")]
    pub fn decode_value(&mut self) -> BencodeResult<BencodeValue> {
        match self.peek()? {
            b'0'..=b'9' => self.decode_string().map(BencodeValue::String),
            b'i' => self.decode_integer().map(BencodeValue::Integer),
            b'l' => self.decode_list().map(BencodeValue::List),
            b'd' => self.decode_dict().map(BencodeValue::Dict),
            other => Err(BencodeError::MalformedEncoding(format!(
                "unexpected character: {}",
                other as char
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_string() {
        let mut d = Decoder::new(b"5:hello");
        assert_eq!(d.decode_string().unwrap(), b"hello".to_vec());
    }

    #[test]
    fn decodes_negative_integer() {
        let mut d = Decoder::new(b"i-42e");
        assert_eq!(d.decode_integer().unwrap(), -42);
    }

    #[test]
    fn position_tracks_nested_value_range() {
        let input = b"d4:infod6:lengthi10eee";
        let mut d = Decoder::new(input);
        let dict = d.decode_dict().unwrap();
        assert!(dict.contains_key(b"info".as_slice()));
        assert_eq!(d.position(), input.len());
    }

    #[test]
    fn rejects_truncated_input() {
        let mut d = Decoder::new(b"5:hel");
        assert!(matches!(d.decode_string(), Err(BencodeError::UnexpectedEof)));
    }
}
