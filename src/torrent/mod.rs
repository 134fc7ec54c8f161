//! Torrent metainfo parsing, InfoHash computation, and the errors raised at
//! `.torrent` load time.
//!
//! A malformed or unsafe metainfo file is a `ConfigError` condition (per the
//! engine's error taxonomy): it is fatal at load time and never recovered
//! from, unlike peer/tracker errors which the session recovers from locally.
use thiserror::Error;

pub mod info_hash;
pub mod metainfo;

pub use info_hash::InfoHash;
pub use metainfo::{FileEntry, Metainfo};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("missing or invalid field: {0}")]
    MissingField(String),

    #[error("invalid data type for field: {0}")]
    InvalidFieldType(String),

    #[error("pieces field length {0} is not a multiple of 20")]
    InvalidPiecesHashLength(usize),

    #[error("piece length {0} is not a power of two in [32768, 8388608]")]
    InvalidPieceLength(i64),

    #[error("declared total length does not match piece layout: expected {expected}, got {actual}")]
    LengthMismatch { expected: i64, actual: i64 },

    #[error("unsafe path component in file entry: {0:?}")]
    UnsafePath(String),

    #[error("path conversion error: {0}")]
    PathConversion(String),

    #[error("date parse error")]
    DateParseError,
}

/// Result type for torrent operations derived from `std::result`
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
