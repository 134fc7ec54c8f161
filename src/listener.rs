//! Inbound connection acceptance and outbound dialing. The listener reads
//! just enough of a handshake to learn which torrent (by info_hash) an
//! inbound peer is asking for before replying with our own handshake; the
//! dialer turns tracker-discovered endpoints into live connections.
use crate::peer::{Handshake, PeerConnection, PeerResult};
use crate::peer_id::PeerId;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};

pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    pub async fn bind(port: u16) -> PeerResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts one inbound connection and reads its handshake. `is_known`
    /// tells the listener whether the requested info_hash belongs to a
    /// torrent we're serving; on a match we reply with our own handshake
    /// and hand back a ready `PeerConnection`, otherwise the connection is
    /// dropped without a reply.
    #[instrument(level = "debug", skip(self, is_known))]
    pub async fn accept_one(
        &self,
        peer_id: PeerId,
        max_requests_in_flight: usize,
        is_known: impl Fn(&[u8; 20]) -> bool,
    ) -> PeerResult<Option<PeerConnection>> {
        let (mut stream, addr) = self.listener.accept().await?;
        let theirs = Handshake::read(&mut stream).await?;
        if !is_known(&theirs.info_hash) {
            warn!(%addr, "inbound handshake for an unknown torrent, dropping connection");
            return Ok(None);
        }
        if theirs.validate_not_self(peer_id.as_bytes()).is_err() {
            warn!(%addr, "inbound handshake named our own peer id, dropping connection");
            return Ok(None);
        }
        let ours = Handshake::new(theirs.info_hash, *peer_id.as_bytes());
        ours.write(&mut stream).await?;
        info!(%addr, "accepted inbound peer connection");
        Ok(Some(PeerConnection::from_accepted(addr, theirs.peer_id, stream, max_requests_in_flight)))
    }
}

/// Dials tracker-discovered peer addresses; failures are logged and
/// skipped rather than aborting the whole batch.
#[instrument(level = "debug", skip(addrs, peer_id))]
pub async fn dial_many(
    addrs: Vec<SocketAddr>,
    info_hash: [u8; 20],
    peer_id: PeerId,
    max_requests_in_flight: usize,
) -> Vec<PeerConnection> {
    let mut connections = Vec::with_capacity(addrs.len());
    for addr in addrs {
        match PeerConnection::connect(addr, info_hash, *peer_id.as_bytes(), max_requests_in_flight).await {
            Ok(connection) => connections.push(connection),
            Err(error) => warn!(%addr, %error, "failed to dial peer"),
        }
    }
    connections
}
