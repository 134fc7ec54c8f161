//! The top-level error taxonomy from the specification's error-handling
//! design: every leaf error converts into one of these five buckets so the
//! session loop can dispatch recovery by *kind* rather than by concrete
//! type.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Wire or tracker-response protocol violations. Recovered by closing
    /// the offending connection/tracker and surfacing a counter.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket or DNS failures. Recovered by closing and backing off.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Disk I/O or hash-mismatch failures. Hash mismatch is recovered
    /// locally (piece reset, peer penalised); other storage faults are
    /// fatal for the session.
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    /// Metainfo invalid, unsafe path, or similar — fatal at load time.
    #[error("config error: {0}")]
    Config(#[from] crate::torrent::TorrentError),

    /// Expected during shutdown; callers must not surface this to the user.
    #[error("cancelled")]
    Cancelled,
}

impl From<crate::peer::PeerError> for EngineError {
    fn from(err: crate::peer::PeerError) -> Self {
        match err {
            crate::peer::PeerError::Io(e) => EngineError::Transport(e),
            other => EngineError::Protocol(other.to_string()),
        }
    }
}

impl From<crate::tracker::TrackerError> for EngineError {
    fn from(err: crate::tracker::TrackerError) -> Self {
        match err {
            crate::tracker::TrackerError::Io(e) => EngineError::Transport(e),
            other => EngineError::Protocol(other.to_string()),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
