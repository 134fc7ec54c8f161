//! The peer wire protocol: handshake, message framing, and the per-peer
//! connection state machine (choke/interest flags, request pipelining).
pub mod codec;
pub mod connection;
pub mod handshake;
pub mod message;

pub use connection::PeerConnection;
pub use handshake::Handshake;
pub use message::Message;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake protocol string mismatch")]
    InvalidProtocol,
    #[error("info hash mismatch: peer is serving a different torrent")]
    InfoHashMismatch,
    #[error("remote peer id equals our own; refusing to connect to ourselves")]
    SelfConnection,
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("message length {0} exceeds the maximum allowed size")]
    MessageTooLarge(u32),
    #[error("request for piece {piece} offset {offset} timed out")]
    RequestTimeout { piece: u32, offset: u32 },
    #[error("peer connection closed")]
    ConnectionClosed,
}

pub type PeerResult<T> = Result<T, PeerError>;
