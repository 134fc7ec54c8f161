//! Engine-wide settings. Names match the normative identifiers in the
//! specification so the CLI, tests, and logs can all refer to the same
//! vocabulary.
use crate::piece::picker::SelectionMode;

#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_port: u16,
    pub max_connections_per_torrent: u32,
    pub max_requests_in_flight: u32,
    pub request_timeout_secs: u32,
    pub choke_interval_secs: u32,
    pub optimistic_unchoke_interval_secs: u32,
    pub upload_slots: u32,
    pub allocate_full_file_sizes: bool,
    pub max_queued_reads: u32,
    pub max_queued_writes: u32,
    pub piece_selection_mode: SelectionMode,
    pub endgame_blocks_remaining: u32,
    pub endgame_factor: u32,
    pub bad_piece_ban_threshold: u32,
    pub high_availability_threshold: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_port: 0,
            max_connections_per_torrent: 200,
            max_requests_in_flight: 32,
            request_timeout_secs: 60,
            choke_interval_secs: 10,
            optimistic_unchoke_interval_secs: 30,
            upload_slots: 4,
            allocate_full_file_sizes: false,
            max_queued_reads: 64,
            max_queued_writes: 64,
            piece_selection_mode: SelectionMode::HighAvailabilityThenRarest,
            endgame_blocks_remaining: 20,
            endgame_factor: 4,
            bad_piece_ban_threshold: 3,
            high_availability_threshold: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_specification() {
        let settings = Settings::default();
        assert_eq!(settings.max_requests_in_flight, 32);
        assert_eq!(settings.request_timeout_secs, 60);
        assert_eq!(settings.upload_slots, 4);
        assert_eq!(settings.endgame_blocks_remaining, 20);
        assert_eq!(settings.endgame_factor, 4);
    }
}
