//! Piece and block bookkeeping: per-piece download state, the block bitmap,
//! and availability tracking. The actual selection policy lives in
//! [`picker`].
pub mod bitfield;
pub mod picker;

pub use bitfield::Bitfield;
pub use picker::PiecePicker;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

/// The unit of request/response on the wire; 16 KiB by convention.
pub const BLOCK_LENGTH: u32 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    Partial,
    Complete,
    Verified,
    Failed,
}

/// A single block request identifying a `(piece, offset, length)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece_index: u32,
    pub block_offset: u32,
    pub block_length: u32,
}

/// Splits a piece of `piece_length` bytes into block requests of at most
/// [`BLOCK_LENGTH`] bytes, in ascending offset order.
pub fn blocks_for_piece(piece_index: u32, piece_length: u32) -> Vec<BlockRequest> {
    let mut blocks = Vec::new();
    let mut offset = 0;
    while offset < piece_length {
        let length = BLOCK_LENGTH.min(piece_length - offset);
        blocks.push(BlockRequest { piece_index, block_offset: offset, block_length: length });
        offset += length;
    }
    blocks
}

/// Per-piece download bookkeeping.
#[derive(Debug, Clone)]
pub struct PieceEntry {
    pub index: u32,
    pub length: u32,
    pub hash: [u8; 20],
    pub state: PieceState,
    pub blocks: Vec<BlockRequest>,
    /// Blocks that have been fully written to storage.
    pub downloaded_blocks: HashSet<u32>,
    /// Peers a given block offset is currently outstanding against.
    pub requested_blocks: HashMap<u32, HashSet<SocketAddr>>,
    /// Peers that have delivered at least one block of the current attempt;
    /// tracked separately from `requested_blocks` since a block's entry
    /// there is cleared the moment it arrives, well before the piece (and
    /// therefore a possible hash-check failure) completes.
    contributors: HashSet<SocketAddr>,
}

impl PieceEntry {
    pub fn new(index: u32, length: u32, hash: [u8; 20]) -> Self {
        Self {
            index,
            length,
            hash,
            state: PieceState::Missing,
            blocks: blocks_for_piece(index, length),
            downloaded_blocks: HashSet::new(),
            requested_blocks: HashMap::new(),
            contributors: HashSet::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded_blocks.len() == self.blocks.len()
    }

    /// Marks a block as durably written, advancing `Missing`/`Partial` to
    /// `Complete` once every block in the piece has arrived. `contributor`
    /// is recorded so a later failed hash check can still name everyone who
    /// fed this attempt, even though their per-block request entry is
    /// cleared immediately below.
    pub fn mark_block_downloaded(&mut self, block_offset: u32, contributor: SocketAddr) {
        self.downloaded_blocks.insert(block_offset);
        self.requested_blocks.remove(&block_offset);
        self.contributors.insert(contributor);
        if self.is_complete() {
            self.state = PieceState::Complete;
        } else {
            self.state = PieceState::Partial;
        }
    }

    /// Resets all progress on a failed hash check. Call `contributing_peers`
    /// before this to find out who to penalise; it clears that history too.
    pub fn reset_on_failure(&mut self) {
        self.downloaded_blocks.clear();
        self.requested_blocks.clear();
        self.contributors.clear();
        self.state = PieceState::Failed;
    }

    pub fn mark_verified(&mut self) {
        self.state = PieceState::Verified;
    }

    /// How many distinct peers have an outstanding request for `block_offset`.
    pub fn request_count(&self, block_offset: u32) -> usize {
        self.requested_blocks.get(&block_offset).map_or(0, HashSet::len)
    }

    pub fn add_request(&mut self, block_offset: u32, peer: SocketAddr) {
        self.requested_blocks.entry(block_offset).or_default().insert(peer);
    }

    pub fn remove_request(&mut self, block_offset: u32, peer: &SocketAddr) {
        if let Some(peers) = self.requested_blocks.get_mut(&block_offset) {
            peers.remove(peer);
            if peers.is_empty() {
                self.requested_blocks.remove(&block_offset);
            }
        }
    }

    /// Peers that delivered a block of the current attempt; used to
    /// penalise the right peers when the piece fails verification. Must be
    /// called before `reset_on_failure` clears this history.
    pub fn contributing_peers(&self) -> HashSet<SocketAddr> {
        self.contributors.clone()
    }

    /// Peers with an outstanding request for `block_offset`, if any; used to
    /// cancel the other endgame-duplicated requests once one peer delivers
    /// the block first.
    pub fn requesters(&self, block_offset: u32) -> Vec<SocketAddr> {
        self.requested_blocks.get(&block_offset).map(|peers| peers.iter().copied().collect()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn blocks_for_piece_splits_into_16kib_chunks() {
        let blocks = blocks_for_piece(0, 16 * 1024 + 10);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].block_length, BLOCK_LENGTH);
        assert_eq!(blocks[1].block_length, 10);
        assert_eq!(blocks[1].block_offset, BLOCK_LENGTH);
    }

    #[test]
    fn piece_becomes_complete_once_every_block_downloaded() {
        let mut piece = PieceEntry::new(0, BLOCK_LENGTH + 10, [0u8; 20]);
        assert_eq!(piece.blocks.len(), 2);
        piece.mark_block_downloaded(0, addr(1));
        assert_eq!(piece.state, PieceState::Partial);
        piece.mark_block_downloaded(BLOCK_LENGTH, addr(1));
        assert_eq!(piece.state, PieceState::Complete);
    }

    #[test]
    fn failure_clears_downloaded_blocks() {
        let mut piece = PieceEntry::new(0, BLOCK_LENGTH + 10, [0u8; 20]);
        piece.mark_block_downloaded(0, addr(1));
        piece.reset_on_failure();
        assert!(piece.downloaded_blocks.is_empty());
        assert_eq!(piece.state, PieceState::Failed);
    }

    #[test]
    fn contributing_peers_survive_past_the_per_block_request_clear() {
        let mut piece = PieceEntry::new(0, BLOCK_LENGTH + 10, [0u8; 20]);
        piece.add_request(0, addr(1));
        piece.add_request(BLOCK_LENGTH, addr(2));
        piece.mark_block_downloaded(0, addr(1));
        piece.mark_block_downloaded(BLOCK_LENGTH, addr(2));
        assert_eq!(piece.state, PieceState::Complete);
        // requested_blocks is empty by now, but contributing_peers still
        // names both peers that fed this attempt.
        assert!(piece.requested_blocks.is_empty());
        let contributors = piece.contributing_peers();
        assert!(contributors.contains(&addr(1)));
        assert!(contributors.contains(&addr(2)));
    }

    #[test]
    fn requesters_lists_peers_with_an_outstanding_request_for_a_block() {
        let mut piece = PieceEntry::new(0, BLOCK_LENGTH, [0u8; 20]);
        piece.add_request(0, addr(1));
        piece.add_request(0, addr(2));
        let mut requesters = piece.requesters(0);
        requesters.sort_by_key(|a| a.port());
        assert_eq!(requesters, vec![addr(1), addr(2)]);
        assert!(piece.requesters(BLOCK_LENGTH).is_empty());
    }
}
