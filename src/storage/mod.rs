//! File storage: mapping piece/block byte ranges onto the torrent's file
//! layout, reading and writing blocks, and SHA-1 piece verification. The
//! actual actor loop (bounded queue, background task) lives in [`worker`].
pub mod worker;

use crate::torrent::metainfo::Metainfo;
use sha1::{Digest, Sha1};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

pub use worker::{ReadCommand, StorageHandle, WriteCommand};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("piece {0} failed hash verification")]
    HashMismatch(u32),
    #[error("piece index {0} out of range (torrent has {1} pieces)")]
    InvalidPieceIndex(u32, usize),
    #[error("block at offset {offset} length {length} is out of bounds for piece {piece} (size {piece_size})")]
    BlockOutOfBounds { piece: u32, offset: u32, length: u32, piece_size: i64 },
    #[error("storage worker is no longer running")]
    WorkerGone,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// One file's slice of a piece/block byte range: which file, at what
/// file-local offset, for how many bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileSlice {
    file_index: usize,
    file_offset: u64,
    length: u64,
}

struct OpenFile {
    path: PathBuf,
    handle: Mutex<File>,
}

/// Owns the open file handles for a torrent's download and maps
/// piece/block coordinates onto them. All methods here are blocking; callers
/// run them via [`worker`] on a blocking thread.
pub struct Storage {
    files: Vec<OpenFile>,
    file_lengths: Vec<i64>,
    piece_length: i64,
    total_length: i64,
    piece_hashes: Vec<[u8; 20]>,
}

fn file_path(download_root: &Path, metainfo: &Metainfo, file_index: usize) -> PathBuf {
    let entry = &metainfo.files[file_index];
    if metainfo.multi_file {
        let mut path = download_root.join(&metainfo.name);
        for component in &entry.path {
            path.push(component);
        }
        path
    } else {
        download_root.join(&metainfo.name)
    }
}

impl Storage {
    /// Opens (creating as needed) every file in the torrent's layout.
    /// Directories for multi-file torrents are created eagerly. When
    /// `allocate_full_file_sizes` is set, each file is pre-truncated to its
    /// final length so writes never need to extend it mid-download.
    pub fn open(
        download_root: &Path,
        metainfo: &Metainfo,
        allocate_full_file_sizes: bool,
    ) -> StorageResult<Self> {
        let mut files = Vec::with_capacity(metainfo.files.len());
        let mut file_lengths = Vec::with_capacity(metainfo.files.len());
        for index in 0..metainfo.files.len() {
            let path = file_path(download_root, metainfo, index);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let handle = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
            if allocate_full_file_sizes {
                handle.set_len(metainfo.files[index].length as u64)?;
            }
            file_lengths.push(metainfo.files[index].length);
            files.push(OpenFile { path, handle: Mutex::new(handle) });
        }
        Ok(Self {
            files,
            file_lengths,
            piece_length: metainfo.piece_length,
            total_length: metainfo.total_length(),
            piece_hashes: metainfo.piece_hashes.clone(),
        })
    }

    fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    fn piece_size(&self, index: u32) -> StorageResult<i64> {
        let num_pieces = self.num_pieces();
        if index as usize >= num_pieces {
            return Err(StorageError::InvalidPieceIndex(index, num_pieces));
        }
        Ok(if (index as usize) < num_pieces - 1 {
            self.piece_length
        } else {
            self.total_length - (num_pieces - 1) as i64 * self.piece_length
        })
    }

    /// Maps a byte range, relative to the start of the whole torrent, onto
    /// the sequence of `(file, file-local offset, length)` slices it spans.
    fn map_range(&self, mut torrent_offset: u64, mut remaining: u64) -> Vec<FileSlice> {
        let mut slices = Vec::new();
        let mut cursor: u64 = 0;
        for (file_index, &length) in self.file_lengths.iter().enumerate() {
            let length = length as u64;
            let file_end = cursor + length;
            if remaining == 0 {
                break;
            }
            if torrent_offset < file_end {
                let file_offset = torrent_offset - cursor;
                let available = file_end - torrent_offset;
                let take = available.min(remaining);
                slices.push(FileSlice { file_index, file_offset, length: take });
                torrent_offset += take;
                remaining -= take;
            }
            cursor = file_end;
        }
        slices
    }

    fn block_range(&self, piece_index: u32, block_offset: u32, block_length: u32) -> StorageResult<u64> {
        let piece_size = self.piece_size(piece_index)?;
        if block_offset as i64 + block_length as i64 > piece_size {
            return Err(StorageError::BlockOutOfBounds {
                piece: piece_index,
                offset: block_offset,
                length: block_length,
                piece_size,
            });
        }
        Ok(piece_index as u64 * self.piece_length as u64 + block_offset as u64)
    }

    pub fn write_block(&self, piece_index: u32, block_offset: u32, data: &[u8]) -> StorageResult<()> {
        let torrent_offset = self.block_range(piece_index, block_offset, data.len() as u32)?;
        let mut cursor = 0usize;
        for slice in self.map_range(torrent_offset, data.len() as u64) {
            let file = &self.files[slice.file_index];
            let mut handle = file.handle.lock().expect("storage file mutex poisoned");
            handle.seek(SeekFrom::Start(slice.file_offset))?;
            handle.write_all(&data[cursor..cursor + slice.length as usize])?;
            cursor += slice.length as usize;
        }
        Ok(())
    }

    pub fn read_block(&self, piece_index: u32, block_offset: u32, length: u32) -> StorageResult<Vec<u8>> {
        let torrent_offset = self.block_range(piece_index, block_offset, length)?;
        let mut buf = vec![0u8; length as usize];
        let mut cursor = 0usize;
        for slice in self.map_range(torrent_offset, length as u64) {
            let file = &self.files[slice.file_index];
            let mut handle = file.handle.lock().expect("storage file mutex poisoned");
            handle.seek(SeekFrom::Start(slice.file_offset))?;
            handle.read_exact(&mut buf[cursor..cursor + slice.length as usize])?;
            cursor += slice.length as usize;
        }
        Ok(buf)
    }

    fn read_piece(&self, piece_index: u32) -> StorageResult<Vec<u8>> {
        let piece_size = self.piece_size(piece_index)?;
        self.read_block(piece_index, 0, piece_size as u32)
    }

    /// Reads a piece back from disk and checks it against the expected
    /// SHA-1 hash from the metainfo.
    pub fn verify_piece(&self, piece_index: u32) -> StorageResult<bool> {
        let data = self.read_piece(piece_index)?;
        let expected = self
            .piece_hashes
            .get(piece_index as usize)
            .ok_or(StorageError::InvalidPieceIndex(piece_index, self.num_pieces()))?;
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let actual: [u8; 20] = hasher.finalize().into();
        Ok(&actual == expected)
    }

    pub fn file_paths(&self) -> Vec<&Path> {
        self.files.iter().map(|f| f.path.as_path()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::metainfo::Metainfo;
    use tempfile::TempDir;

    fn temp_dir(label: &str) -> TempDir {
        tempfile::Builder::new().prefix(&format!("torrent-engine-test-{label}-")).tempdir().expect("create temp dir")
    }

    fn sample_metainfo() -> Metainfo {
        // Mirrors the spec's single-file two-piece torrent: 20 bytes,
        // piece length 16, so piece 0 is 16 bytes and piece 1 is 4 bytes.
        let data = b"helloworldhelloworld";
        let mut piece0 = Sha1::new();
        piece0.update(&data[0..16]);
        let hash0: [u8; 20] = piece0.finalize().into();
        let mut piece1 = Sha1::new();
        piece1.update(&data[16..20]);
        let hash1: [u8; 20] = piece1.finalize().into();
        Metainfo {
            name: "sample.bin".to_string(),
            comment: None,
            created_by: None,
            creation_date: None,
            private: false,
            announce_tiers: vec![],
            piece_length: 16,
            piece_hashes: vec![hash0, hash1],
            files: vec![crate::torrent::metainfo::FileEntry {
                path: vec!["sample.bin".to_string()],
                length: 20,
                md5sum: None,
            }],
            multi_file: false,
            info_hash: crate::torrent::InfoHash::from_bytes([0u8; 20]),
        }
    }

    #[test]
    fn writes_and_reads_back_a_block_spanning_a_single_file() {
        let dir = temp_dir("rw");
        let metainfo = sample_metainfo();
        let storage = Storage::open(dir.path(), &metainfo, false).unwrap();
        storage.write_block(0, 0, &b"helloworldhelloworld"[0..16]).unwrap();
        storage.write_block(1, 0, &b"helloworldhelloworld"[16..20]).unwrap();
        let read_back = storage.read_block(0, 0, 16).unwrap();
        assert_eq!(read_back, b"helloworldhellow");
        let second = storage.read_block(1, 0, 4).unwrap();
        assert_eq!(second, b"orld");
    }

    #[test]
    fn verifies_correctly_hashed_pieces_and_rejects_corrupt_ones() {
        let dir = temp_dir("verify");
        let metainfo = sample_metainfo();
        let storage = Storage::open(dir.path(), &metainfo, false).unwrap();
        storage.write_block(0, 0, &b"helloworldhelloworld"[0..16]).unwrap();
        storage.write_block(1, 0, &b"helloworldhelloworld"[16..20]).unwrap();
        assert!(storage.verify_piece(0).unwrap());
        assert!(storage.verify_piece(1).unwrap());

        storage.write_block(0, 0, &[0u8; 16]).unwrap();
        assert!(!storage.verify_piece(0).unwrap());
    }

    #[test]
    fn rejects_block_that_overruns_piece_bounds() {
        let dir = temp_dir("bounds");
        let metainfo = sample_metainfo();
        let storage = Storage::open(dir.path(), &metainfo, false).unwrap();
        let err = storage.write_block(1, 0, &[0u8; 8]).unwrap_err();
        assert!(matches!(err, StorageError::BlockOutOfBounds { .. }));
    }
}
