//! Persistent resume state: which pieces have already been verified, so a
//! restarted download doesn't re-fetch and re-hash data it already has. The
//! bitmap is written next to the download as `<name>.resume`, replaced
//! atomically (write to a temp file, then rename) so a crash mid-write never
//! leaves a corrupt file behind.
use crate::piece::Bitfield;
use std::io;
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"TREZ";
const VERSION: u8 = 1;

fn resume_path(download_root: &Path, torrent_name: &str) -> PathBuf {
    download_root.join(format!("{torrent_name}.resume"))
}

/// Serializes a verified-pieces bitmap as `MAGIC | VERSION | piece_count:u32 | bitmap bytes`.
fn serialize(bitfield: &Bitfield) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 1 + 4 + bitfield.to_wire_bytes().len());
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    buf.extend_from_slice(&(bitfield.len() as u32).to_be_bytes());
    buf.extend_from_slice(bitfield.to_wire_bytes());
    buf
}

fn deserialize(bytes: &[u8]) -> Option<Bitfield> {
    if bytes.len() < 9 || &bytes[0..4] != MAGIC || bytes[4] != VERSION {
        return None;
    }
    let piece_count = u32::from_be_bytes(bytes[5..9].try_into().ok()?) as usize;
    Bitfield::from_wire_bytes(&bytes[9..], piece_count)
}

/// Atomically replaces `<name>.resume` with the given verified-pieces bitmap.
pub fn save(download_root: &Path, torrent_name: &str, bitfield: &Bitfield) -> io::Result<()> {
    let target = resume_path(download_root, torrent_name);
    let tmp = target.with_extension("resume.tmp");
    std::fs::write(&tmp, serialize(bitfield))?;
    std::fs::rename(&tmp, &target)?;
    Ok(())
}

/// Loads `<name>.resume` if present and well-formed for a torrent with
/// `piece_count` pieces. Any parse failure or piece-count mismatch is
/// treated as "no usable resume state" rather than an error: a stale or
/// corrupt resume file shouldn't block a fresh download.
pub fn load(download_root: &Path, torrent_name: &str, piece_count: usize) -> Option<Bitfield> {
    let bytes = std::fs::read(resume_path(download_root, torrent_name)).ok()?;
    let bitfield = deserialize(&bytes)?;
    if bitfield.len() != piece_count {
        return None;
    }
    Some(bitfield)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(label: &str) -> PathBuf {
        use rand::Rng;
        let suffix: u64 = rand::rng().random();
        let dir = std::env::temp_dir().join(format!("torrent-engine-resume-test-{label}-{suffix:x}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn round_trips_a_partially_verified_bitmap() {
        let dir = temp_dir("roundtrip");
        let mut bitfield = Bitfield::new(10);
        bitfield.set(0, true);
        bitfield.set(7, true);
        save(&dir, "movie.mkv", &bitfield).unwrap();

        let loaded = load(&dir, "movie.mkv", 10).unwrap();
        assert!(loaded.get(0));
        assert!(loaded.get(7));
        assert!(!loaded.get(1));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn mismatched_piece_count_is_treated_as_no_resume_state() {
        let dir = temp_dir("mismatch");
        let bitfield = Bitfield::new(10);
        save(&dir, "movie.mkv", &bitfield).unwrap();
        assert!(load(&dir, "movie.mkv", 11).is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_resume_file_returns_none() {
        let dir = temp_dir("missing");
        assert!(load(&dir, "movie.mkv", 5).is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn a_second_save_fully_replaces_the_first() {
        let dir = temp_dir("replace");
        let mut first = Bitfield::new(4);
        first.set(0, true);
        save(&dir, "file.bin", &first).unwrap();

        let mut second = Bitfield::new(4);
        second.set(3, true);
        save(&dir, "file.bin", &second).unwrap();

        let loaded = load(&dir, "file.bin", 4).unwrap();
        assert!(!loaded.get(0));
        assert!(loaded.get(3));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
