//! A single peer connection: framed message I/O plus the choke/interest
//! flags and request pipeline bookkeeping the session loop drives.
use super::codec::MessageCodec;
use super::handshake::Handshake;
use super::message::Message;
use super::{PeerError, PeerResult};
use crate::piece::{BlockRequest, Bitfield};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::instrument;

pub struct PeerConnection {
    pub addr: SocketAddr,
    pub peer_id: [u8; 20],
    stream: Framed<TcpStream, MessageCodec>,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub peer_bitfield: Option<Bitfield>,
    outstanding: HashMap<BlockRequest, Instant>,
    max_requests_in_flight: usize,
    last_sent: Instant,
}

impl PeerConnection {
    fn new(addr: SocketAddr, peer_id: [u8; 20], stream: TcpStream, max_requests_in_flight: usize) -> Self {
        Self {
            addr,
            peer_id,
            stream: Framed::new(stream, MessageCodec),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_bitfield: None,
            outstanding: HashMap::new(),
            max_requests_in_flight,
            last_sent: Instant::now(),
        }
    }

    /// Dials a peer and performs the outbound handshake.
    #[instrument(level = "debug", skip(info_hash, peer_id))]
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        max_requests_in_flight: usize,
    ) -> PeerResult<Self> {
        let (stream, theirs) = Handshake::dial(addr, info_hash, peer_id).await?;
        Ok(Self::new(addr, theirs.peer_id, stream, max_requests_in_flight))
    }

    /// Wraps an already-handshaken inbound connection (the listener reads
    /// and replies to the handshake itself, since it must learn the
    /// info_hash before it knows which torrent's peer_id to answer with).
    pub fn from_accepted(
        addr: SocketAddr,
        peer_id: [u8; 20],
        stream: TcpStream,
        max_requests_in_flight: usize,
    ) -> Self {
        Self::new(addr, peer_id, stream, max_requests_in_flight)
    }

    pub async fn send(&mut self, message: Message) -> PeerResult<()> {
        self.stream.send(message).await?;
        self.last_sent = Instant::now();
        Ok(())
    }

    /// Reads the next message, or `Ok(None)` if the peer closed the
    /// connection cleanly.
    pub async fn recv(&mut self) -> PeerResult<Option<Message>> {
        match self.stream.next().await {
            Some(result) => result.map(Some),
            None => Ok(None),
        }
    }

    pub fn set_am_choking(&mut self, choking: bool) {
        self.am_choking = choking;
    }

    pub fn set_am_interested(&mut self, interested: bool) {
        self.am_interested = interested;
    }

    pub fn set_peer_choking(&mut self, choking: bool) {
        self.peer_choking = choking;
        if choking {
            self.outstanding.clear();
        }
    }

    pub fn set_peer_interested(&mut self, interested: bool) {
        self.peer_interested = interested;
    }

    pub fn adopt_bitfield(&mut self, bitfield: Bitfield) {
        self.peer_bitfield = Some(bitfield);
    }

    pub fn mark_have(&mut self, piece_index: usize, piece_count: usize) {
        let bitfield = self.peer_bitfield.get_or_insert_with(|| Bitfield::new(piece_count));
        bitfield.set(piece_index, true);
    }

    pub fn has_piece(&self, piece_index: usize) -> bool {
        self.peer_bitfield.as_ref().is_some_and(|bf| bf.get(piece_index))
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn can_request_more(&self) -> bool {
        !self.peer_choking && self.outstanding.len() < self.max_requests_in_flight
    }

    pub fn record_request(&mut self, request: BlockRequest) {
        self.outstanding.insert(request, Instant::now());
    }

    pub fn clear_request(&mut self, request: &BlockRequest) {
        self.outstanding.remove(request);
    }

    /// Requests that have been outstanding longer than `timeout`; the
    /// session drops the peer (or re-requests elsewhere) for each.
    pub fn timed_out_requests(&self, timeout: Duration) -> Vec<BlockRequest> {
        let now = Instant::now();
        self.outstanding
            .iter()
            .filter(|(_, sent)| now.duration_since(**sent) > timeout)
            .map(|(req, _)| *req)
            .collect()
    }

    pub fn keepalive_due(&self, interval: Duration) -> bool {
        self.last_sent.elapsed() > interval
    }
}
