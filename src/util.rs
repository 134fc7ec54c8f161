//! Small helpers shared across modules that don't warrant their own crate
//! dependency (percent-encoding of raw, possibly non-UTF-8 byte strings for
//! tracker query parameters).

/// URL-encodes a byte slice per RFC 3986 unreserved characters
/// (`A-Z a-z 0-9 - . _ ~`); everything else becomes `%XX` uppercase hex.
///
/// `info_hash` and `peer_id` are raw 20-byte values, not necessarily valid
/// UTF-8, so this operates on bytes rather than going through `url::Url`'s
/// query-pair encoder (which assumes `&str` and would double-encode an
/// already-percent-encoded string).
pub fn percent_encode_bytes(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_unreserved_characters_untouched() {
        assert_eq!(percent_encode_bytes(b"abcXYZ019-._~"), "abcXYZ019-._~");
    }

    #[test]
    fn escapes_everything_else() {
        assert_eq!(percent_encode_bytes(b"Hello World!"), "Hello%20World%21");
    }
}
