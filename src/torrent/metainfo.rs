//! `.torrent` metainfo parsing: the top-level dictionary, the `info`
//! sub-dictionary, the file layout, and piece-hash bookkeeping.
use super::{InfoHash, TorrentError, TorrentResult};
use crate::bencode::decoder::Decoder;
use crate::bencode::BencodeValue;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

const MIN_PIECE_LENGTH: i64 = 32 * 1024;
const MAX_PIECE_LENGTH: i64 = 8 * 1024 * 1024;

/// One file within a (possibly multi-file) torrent, with its relative path
/// already joined against the torrent's top-level name for single-file
/// torrents.
#[derive(Debug, PartialEq, Clone)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: i64,
    pub md5sum: Option<String>,
}

/// A parsed and validated `.torrent` file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub name: String,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<SystemTime>,
    pub private: bool,
    pub announce_tiers: Vec<Vec<String>>,
    pub piece_length: i64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    pub multi_file: bool,
    pub info_hash: InfoHash,
}

fn reject_unsafe_component(component: &str) -> TorrentResult<()> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
    {
        return Err(TorrentError::UnsafePath(component.to_string()));
    }
    Ok(())
}

fn string_field(dict: &BencodeValue, key: &[u8], field_name: &str) -> TorrentResult<String> {
    match dict.as_dict().and_then(|d| d.get(key)) {
        Some(BencodeValue::String(s)) => String::from_utf8(s.clone())
            .map_err(|e| TorrentError::InvalidFormat(format!("{field_name} not UTF-8: {e}"))),
        _ => Err(TorrentError::MissingField(field_name.to_string())),
    }
}

fn optional_string_field(dict: &BencodeValue, key: &[u8]) -> Option<String> {
    match dict.as_dict().and_then(|d| d.get(key)) {
        Some(BencodeValue::String(s)) => String::from_utf8(s.clone()).ok(),
        _ => None,
    }
}

struct ParsedInfo {
    name: String,
    piece_length: i64,
    piece_hashes: Vec<[u8; 20]>,
    private: bool,
    files: Vec<FileEntry>,
    multi_file: bool,
}

fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength(pieces_bytes.len()));
    }
    Ok(pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

fn parse_path_list(value: &BencodeValue) -> TorrentResult<Vec<String>> {
    let items = value
        .as_list()
        .ok_or_else(|| TorrentError::InvalidFormat("file path is not a list".to_string()))?;
    let mut components = Vec::with_capacity(items.len());
    for item in items {
        let s = item
            .as_bytes()
            .ok_or_else(|| TorrentError::InvalidFormat("path component not a string".to_string()))?;
        let s = String::from_utf8(s.to_vec())
            .map_err(|e| TorrentError::InvalidFormat(format!("path component not UTF-8: {e}")))?;
        reject_unsafe_component(&s)?;
        components.push(s);
    }
    Ok(components)
}

fn parse_info(info_value: &BencodeValue) -> TorrentResult<ParsedInfo> {
    let dict = info_value
        .as_dict()
        .ok_or_else(|| TorrentError::InvalidFormat("info is not a dictionary".to_string()))?;

    let piece_length = dict
        .get(b"piece length".as_slice())
        .and_then(BencodeValue::as_integer)
        .ok_or_else(|| TorrentError::MissingField("piece length".to_string()))?;
    if piece_length < MIN_PIECE_LENGTH
        || piece_length > MAX_PIECE_LENGTH
        || piece_length & (piece_length - 1) != 0
    {
        return Err(TorrentError::InvalidPieceLength(piece_length));
    }

    let pieces_bytes = dict
        .get(b"pieces".as_slice())
        .and_then(BencodeValue::as_bytes)
        .ok_or_else(|| TorrentError::MissingField("pieces".to_string()))?;
    let piece_hashes = parse_pieces(pieces_bytes)?;

    let private = matches!(dict.get(b"private".as_slice()), Some(BencodeValue::Integer(1)));

    let name = string_field(info_value, b"name", "name")?;
    reject_unsafe_component(&name)?;

    let files = match dict.get(b"files".as_slice()) {
        Some(BencodeValue::List(entries)) => {
            let mut out = Vec::with_capacity(entries.len());
            for entry in entries {
                let entry_dict = entry.as_dict().ok_or_else(|| {
                    TorrentError::InvalidFormat("file entry is not a dictionary".to_string())
                })?;
                let length = entry_dict
                    .get(b"length".as_slice())
                    .and_then(BencodeValue::as_integer)
                    .ok_or_else(|| TorrentError::MissingField("file length".to_string()))?;
                let path_value = entry_dict
                    .get(b"path".as_slice())
                    .ok_or_else(|| TorrentError::MissingField("file path".to_string()))?;
                let mut path = vec![name.clone()];
                path.extend(parse_path_list(path_value)?);
                let md5sum = optional_string_field(entry, b"md5sum");
                out.push(FileEntry { path, length, md5sum });
            }
            out
        }
        None => {
            let length = dict
                .get(b"length".as_slice())
                .and_then(BencodeValue::as_integer)
                .ok_or_else(|| TorrentError::MissingField("length".to_string()))?;
            let md5sum = optional_string_field(info_value, b"md5sum");
            vec![FileEntry { path: vec![name.clone()], length, md5sum }]
        }
        Some(_) => {
            return Err(TorrentError::InvalidFieldType("files".to_string()));
        }
    };

    let multi_file = dict.contains_key(b"files".as_slice());

    Ok(ParsedInfo { name, piece_length, piece_hashes, private, files, multi_file })
}

fn parse_announce_list(value: &BencodeValue) -> TorrentResult<Vec<Vec<String>>> {
    let tiers = value
        .as_list()
        .ok_or_else(|| TorrentError::InvalidFormat("announce-list is not a list".to_string()))?;
    let mut result = Vec::with_capacity(tiers.len());
    for tier in tiers {
        let urls = tier
            .as_list()
            .ok_or_else(|| TorrentError::InvalidFormat("announce tier is not a list".to_string()))?;
        let mut tier_vec = Vec::with_capacity(urls.len());
        for url in urls {
            let s = url
                .as_bytes()
                .ok_or_else(|| TorrentError::InvalidFormat("tracker URL not a string".to_string()))?;
            tier_vec.push(
                String::from_utf8(s.to_vec())
                    .map_err(|e| TorrentError::InvalidFormat(format!("tracker URL not UTF-8: {e}")))?,
            );
        }
        result.push(tier_vec);
    }
    Ok(result)
}

impl Metainfo {
    /// Parse a complete `.torrent` file buffer.
    #[tracing::instrument(level = "debug", skip(data))]
    pub fn parse(data: &[u8]) -> TorrentResult<Metainfo> {
        let mut decoder = Decoder::new(data);
        let mut info_range: Option<(usize, usize)> = None;
        let root = decoder.decode_dict_with(|key, start, end| {
            if key == b"info" {
                info_range = Some((start, end));
            }
        })?;
        if decoder.position() != data.len() {
            return Err(TorrentError::Bencode(crate::bencode::BencodeError::TrailingGarbage));
        }

        let (info_start, info_end) = info_range.ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let info_hash = InfoHash::of_info_bytes(decoder.slice(info_start, info_end));

        let info_value = root
            .get(b"info".as_slice())
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let parsed_info = parse_info(info_value)?;

        let announce_tiers = if let Some(list_value) = root.get(b"announce-list".as_slice()) {
            parse_announce_list(list_value)?
        } else if let Some(BencodeValue::String(s)) = root.get(b"announce".as_slice()) {
            let announce = String::from_utf8(s.clone())
                .map_err(|e| TorrentError::InvalidFormat(format!("announce not UTF-8: {e}")))?;
            vec![vec![announce]]
        } else {
            Vec::new()
        };

        let creation_date = match root.get(b"creation date".as_slice()) {
            Some(BencodeValue::Integer(timestamp)) => {
                let secs: u64 = (*timestamp)
                    .try_into()
                    .map_err(|_| TorrentError::DateParseError)?;
                Some(UNIX_EPOCH + std::time::Duration::from_secs(secs))
            }
            _ => None,
        };

        let root_value = BencodeValue::Dict(root);
        let comment = optional_string_field(&root_value, b"comment");
        let created_by = optional_string_field(&root_value, b"created by");

        let metainfo = Metainfo {
            name: parsed_info.name,
            comment,
            created_by,
            creation_date,
            private: parsed_info.private,
            announce_tiers,
            piece_length: parsed_info.piece_length,
            piece_hashes: parsed_info.piece_hashes,
            files: parsed_info.files,
            multi_file: parsed_info.multi_file,
            info_hash,
        };
        metainfo.validate_length_invariant()?;
        Ok(metainfo)
    }

    fn validate_length_invariant(&self) -> TorrentResult<()> {
        let total = self.total_length();
        let piece_count = self.num_pieces() as i64;
        if piece_count == 0 {
            return Ok(());
        }
        let expected_last = total - (piece_count - 1) * self.piece_length;
        if expected_last < 1 || expected_last > self.piece_length {
            return Err(TorrentError::LengthMismatch {
                expected: (piece_count - 1) * self.piece_length + self.piece_length,
                actual: total,
            });
        }
        Ok(())
    }

    pub fn total_length(&self) -> i64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`, accounting for a possibly-shorter last piece.
    pub fn piece_size(&self, index: usize) -> i64 {
        if index >= self.num_pieces() {
            return 0;
        }
        if index < self.num_pieces() - 1 {
            self.piece_length
        } else {
            let total = self.total_length();
            total - (self.num_pieces() - 1) as i64 * self.piece_length
        }
    }

    /// Paths of the files whose byte ranges overlap piece `index`.
    pub fn file_paths_for_piece(&self, index: usize) -> Vec<PathBuf> {
        if index >= self.num_pieces() {
            return Vec::new();
        }
        let piece_start = index as i64 * self.piece_length;
        let piece_end = piece_start + self.piece_size(index);
        let mut position = 0i64;
        let mut paths = Vec::new();
        for file in &self.files {
            let file_start = position;
            let file_end = file_start + file.length;
            if file_end > piece_start && file_start < piece_end {
                paths.push(file.path.iter().collect::<PathBuf>());
            }
            position = file_end;
        }
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{encode, BencodeValue};
    use std::collections::BTreeMap;

    fn sample_torrent_bytes(piece_length: i64, piece_hashes: &[u8]) -> Vec<u8> {
        let mut info = BTreeMap::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(piece_length));
        info.insert(b"pieces".to_vec(), BencodeValue::String(piece_hashes.to_vec()));
        info.insert(b"name".to_vec(), BencodeValue::String(b"sample.txt".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(20));

        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://tracker.example.com/announce".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        encode(&BencodeValue::Dict(root)).unwrap()
    }

    fn sha1(data: &[u8]) -> [u8; 20] {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        out
    }

    #[test]
    fn parses_single_file_two_piece_torrent() {
        // "helloworldhelloworld" split into a 16-byte piece and a 4-byte piece.
        let data = b"helloworldhelloworld";
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&sha1(&data[0..16]));
        pieces.extend_from_slice(&sha1(&data[16..20]));

        let bytes = sample_torrent_bytes(16, &pieces);
        let metainfo = Metainfo::parse(&bytes).unwrap();

        assert_eq!(metainfo.num_pieces(), 2);
        assert_eq!(metainfo.piece_size(0), 16);
        assert_eq!(metainfo.piece_size(1), 4);
        assert_eq!(metainfo.total_length(), 20);
        assert!(!metainfo.multi_file);
        assert_eq!(metainfo.announce_tiers, vec![vec!["http://tracker.example.com/announce".to_string()]]);
    }

    #[test]
    fn rejects_pieces_length_not_multiple_of_20() {
        let bytes = sample_torrent_bytes(16, &[0u8; 21]);
        let err = Metainfo::parse(&bytes).unwrap_err();
        assert!(matches!(err, TorrentError::InvalidPiecesHashLength(21)));
    }

    #[test]
    fn rejects_non_power_of_two_piece_length() {
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&[0u8; 20]);
        let bytes = sample_torrent_bytes(50_000, &pieces);
        let err = Metainfo::parse(&bytes).unwrap_err();
        assert!(matches!(err, TorrentError::InvalidPieceLength(50_000)));
    }

    #[test]
    fn rejects_unsafe_path_component() {
        let mut info = BTreeMap::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(32768));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0u8; 20]));
        info.insert(b"name".to_vec(), BencodeValue::String(b"root".to_vec()));
        let mut file = BTreeMap::new();
        file.insert(b"length".to_vec(), BencodeValue::Integer(5));
        file.insert(
            b"path".to_vec(),
            BencodeValue::List(vec![BencodeValue::String(b"..".to_vec())]),
        );
        info.insert(b"files".to_vec(), BencodeValue::List(vec![BencodeValue::Dict(file)]));

        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://t".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        let bytes = encode(&BencodeValue::Dict(root)).unwrap();

        let err = Metainfo::parse(&bytes).unwrap_err();
        assert!(matches!(err, TorrentError::UnsafePath(_)));
    }

    #[test]
    fn re_encoding_parsed_info_hash_is_stable() {
        let data = b"helloworldhelloworld";
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&sha1(&data[0..16]));
        pieces.extend_from_slice(&sha1(&data[16..20]));
        let bytes = sample_torrent_bytes(16, &pieces);

        let first = Metainfo::parse(&bytes).unwrap();
        let second = Metainfo::parse(&bytes).unwrap();
        assert_eq!(first.info_hash, second.info_hash);
    }
}
