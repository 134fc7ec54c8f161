//! The block request decision procedure: endgame duplication, piece
//! selection mode, and in-piece ascending-offset ordering.
use super::{BlockRequest, PieceEntry, PieceState};
use crate::piece::Bitfield;
use rand::Rng;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Random,
    RarestFirst,
    HighAvailabilityThenRarest,
}

pub struct PiecePicker {
    pieces: Vec<PieceEntry>,
    availability: Vec<u32>,
    mode: SelectionMode,
    endgame_blocks_remaining: u32,
    endgame_factor: u32,
    high_availability_threshold: u32,
}

impl PiecePicker {
    pub fn new(
        pieces: Vec<PieceEntry>,
        mode: SelectionMode,
        endgame_blocks_remaining: u32,
        endgame_factor: u32,
        high_availability_threshold: u32,
    ) -> Self {
        let availability = vec![0u32; pieces.len()];
        Self {
            pieces,
            availability,
            mode,
            endgame_blocks_remaining,
            endgame_factor,
            high_availability_threshold,
        }
    }

    pub fn piece(&self, index: u32) -> &PieceEntry {
        &self.pieces[index as usize]
    }

    pub fn piece_mut(&mut self, index: u32) -> &mut PieceEntry {
        &mut self.pieces[index as usize]
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn availability(&self, index: u32) -> u32 {
        self.availability[index as usize]
    }

    pub fn owns_any_verified_piece(&self) -> bool {
        self.pieces.iter().any(|p| p.state == PieceState::Verified)
    }

    pub fn have_bitfield(&self) -> Bitfield {
        let mut bf = Bitfield::new(self.pieces.len());
        for piece in &self.pieces {
            if piece.state == PieceState::Verified {
                bf.set(piece.index as usize, true);
            }
        }
        bf
    }

    pub fn is_fully_verified(&self) -> bool {
        self.pieces.iter().all(|p| p.state == PieceState::Verified)
    }

    pub fn apply_bitfield(&mut self, bitfield: &Bitfield) {
        for i in bitfield.iter_set() {
            self.availability[i] += 1;
        }
    }

    pub fn apply_have(&mut self, piece_index: u32) {
        self.availability[piece_index as usize] += 1;
    }

    pub fn remove_peer_bitfield(&mut self, bitfield: &Bitfield) {
        for i in bitfield.iter_set() {
            if self.availability[i] > 0 {
                self.availability[i] -= 1;
            }
        }
    }

    fn remaining_blocks(&self) -> usize {
        self.pieces
            .iter()
            .filter(|p| matches!(p.state, PieceState::Missing | PieceState::Partial))
            .map(|p| p.blocks.len() - p.downloaded_blocks.len())
            .sum()
    }

    fn all_remaining_in_flight(&self) -> bool {
        self.pieces
            .iter()
            .filter(|p| matches!(p.state, PieceState::Missing | PieceState::Partial))
            .all(|p| {
                p.blocks.iter().all(|b| {
                    p.downloaded_blocks.contains(&b.block_offset)
                        || p.request_count(b.block_offset) > 0
                })
            })
    }

    /// Endgame is entered once every still-missing block already has an
    /// outstanding request and fewer than `endgame_blocks_remaining` remain.
    pub fn in_endgame(&self) -> bool {
        let remaining = self.remaining_blocks();
        remaining > 0
            && remaining <= self.endgame_blocks_remaining as usize
            && self.all_remaining_in_flight()
    }

    fn candidate_pieces(&self, peer_bitfield: &Bitfield) -> Vec<u32> {
        self.pieces
            .iter()
            .filter(|p| {
                matches!(p.state, PieceState::Missing | PieceState::Partial)
                    && peer_bitfield.get(p.index as usize)
                    && p.blocks.iter().any(|b| {
                        !p.downloaded_blocks.contains(&b.block_offset)
                            && p.request_count(b.block_offset) == 0
                    })
            })
            .map(|p| p.index)
            .collect()
    }

    fn pick_rarest(&self, candidates: &[u32]) -> u32 {
        *candidates
            .iter()
            .min_by_key(|&&i| self.availability[i as usize])
            .expect("candidates is non-empty")
    }

    fn choose_piece(&self, candidates: &[u32]) -> u32 {
        match self.mode {
            SelectionMode::Random => {
                let i = rand::rng().random_range(0..candidates.len());
                candidates[i]
            }
            SelectionMode::RarestFirst => self.pick_rarest(candidates),
            SelectionMode::HighAvailabilityThenRarest => {
                if !self.owns_any_verified_piece() {
                    let high_availability: Vec<u32> = candidates
                        .iter()
                        .copied()
                        .filter(|&i| self.availability[i as usize] >= self.high_availability_threshold)
                        .collect();
                    if !high_availability.is_empty() {
                        return self.pick_rarest(&high_availability);
                    }
                }
                self.pick_rarest(candidates)
            }
        }
    }

    fn pick_normal(&mut self, peer: SocketAddr, peer_bitfield: &Bitfield) -> Option<BlockRequest> {
        let candidates = self.candidate_pieces(peer_bitfield);
        if candidates.is_empty() {
            return None;
        }
        let chosen = self.choose_piece(&candidates);
        let piece = &mut self.pieces[chosen as usize];
        let block = piece
            .blocks
            .iter()
            .find(|b| {
                !piece.downloaded_blocks.contains(&b.block_offset)
                    && piece.request_count(b.block_offset) == 0
            })
            .copied()?;
        piece.add_request(block.block_offset, peer);
        Some(block)
    }

    fn pick_endgame(&mut self, peer: SocketAddr, peer_bitfield: &Bitfield) -> Option<BlockRequest> {
        let endgame_factor = self.endgame_factor as usize;
        for piece in &mut self.pieces {
            if !matches!(piece.state, PieceState::Missing | PieceState::Partial)
                || !peer_bitfield.get(piece.index as usize)
            {
                continue;
            }
            for block in piece.blocks.clone() {
                if piece.downloaded_blocks.contains(&block.block_offset) {
                    continue;
                }
                let already_from_peer = piece
                    .requested_blocks
                    .get(&block.block_offset)
                    .is_some_and(|peers| peers.contains(&peer));
                if !already_from_peer && piece.request_count(block.block_offset) < endgame_factor {
                    piece.add_request(block.block_offset, peer);
                    return Some(block);
                }
            }
        }
        None
    }

    /// Picks the next block to request from `peer`, or `None` if nothing is
    /// eligible (peer has nothing we need, or everything we need is already
    /// maximally requested).
    pub fn pick_block(&mut self, peer: SocketAddr, peer_bitfield: &Bitfield) -> Option<BlockRequest> {
        if self.in_endgame() {
            if let Some(block) = self.pick_endgame(peer, peer_bitfield) {
                return Some(block);
            }
        }
        self.pick_normal(peer, peer_bitfield)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn full_bitfield(n: usize) -> Bitfield {
        let mut bf = Bitfield::new(n);
        for i in 0..n {
            bf.set(i, true);
        }
        bf
    }

    fn pieces(n: usize) -> Vec<PieceEntry> {
        (0..n as u32).map(|i| PieceEntry::new(i, super::super::BLOCK_LENGTH, [0u8; 20])).collect()
    }

    #[test]
    fn rarest_first_prefers_lowest_availability_with_lowest_index_tiebreak() {
        let mut picker = PiecePicker::new(pieces(3), SelectionMode::RarestFirst, 20, 4, 4);
        picker.apply_have(0);
        picker.apply_have(0);
        picker.apply_have(1);
        // piece 2 has availability 0, rarest.
        let peer = addr(1);
        let bf = full_bitfield(3);
        let block = picker.pick_block(peer, &bf).unwrap();
        assert_eq!(block.piece_index, 2);
    }

    #[test]
    fn at_most_one_peer_may_request_a_block_outside_endgame() {
        let mut picker = PiecePicker::new(pieces(1), SelectionMode::RarestFirst, 0, 4, 4);
        let bf = full_bitfield(1);
        let first = picker.pick_block(addr(1), &bf);
        assert!(first.is_some());
        let second = picker.pick_block(addr(2), &bf);
        assert!(second.is_none());
    }

    #[test]
    fn endgame_duplicates_the_final_block_up_to_endgame_factor() {
        let mut picker = PiecePicker::new(pieces(1), SelectionMode::RarestFirst, 20, 3, 4);
        let bf = full_bitfield(1);
        let peers = [addr(1), addr(2), addr(3)];
        let mut requests = Vec::new();
        for &peer in &peers {
            requests.push(picker.pick_block(peer, &bf));
        }
        assert!(requests.iter().all(Option::is_some));
        assert_eq!(picker.piece(0).request_count(0), 3);
        // a fourth peer is refused: endgame_factor reached.
        assert!(picker.pick_block(addr(4), &bf).is_none());
    }

    #[test]
    fn high_availability_then_rarest_prefers_rare_high_availability_pieces_before_first_complete() {
        let mut picker =
            PiecePicker::new(pieces(3), SelectionMode::HighAvailabilityThenRarest, 20, 4, 4);
        // piece 0: availability 4 (>= threshold), piece 1: availability 10, piece 2: availability 0.
        for _ in 0..4 {
            picker.apply_have(0);
        }
        for _ in 0..10 {
            picker.apply_have(1);
        }
        let bf = full_bitfield(3);
        // Among high-availability candidates {0, 1}, piece 0 is rarer.
        let block = picker.pick_block(addr(1), &bf).unwrap();
        assert_eq!(block.piece_index, 0);
    }
}
