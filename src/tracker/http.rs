//! The HTTP(S) tracker announce/scrape protocol: a bencoded response over a
//! GET request whose query string is built by hand, since `info_hash` and
//! `peer_id` are raw 20-byte strings that must be percent-encoded exactly
//! once (routing them through `url::Url::query_pairs_mut` after encoding
//! would double-encode the `%` signs).
use super::{AnnounceEvent, AnnounceRequest, AnnounceResponse, ScrapeEntry, TrackerError, TrackerResult};
use crate::bencode::{self, BencodeValue};
use crate::util::percent_encode_bytes;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing::{debug, instrument};

pub struct HttpTracker {
    announce_url: String,
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new(announce_url: &str) -> Self {
        Self { announce_url: announce_url.to_string(), client: reqwest::Client::new() }
    }

    pub fn announce_url(&self) -> &str {
        &self.announce_url
    }

    fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            percent_encode_bytes(&request.info_hash),
            percent_encode_bytes(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );
        if let Some(event) = request.event.as_query_value() {
            query.push_str("&event=");
            query.push_str(event);
        }
        if let Some(numwant) = request.numwant {
            query.push_str(&format!("&numwant={numwant}"));
        }
        let separator = if self.announce_url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.announce_url, separator, query)
    }

    #[instrument(level = "debug", skip(self, request))]
    pub async fn announce(&self, request: &AnnounceRequest) -> TrackerResult<AnnounceResponse> {
        let url = self.build_announce_url(request);
        debug!(url, "sending HTTP announce");
        let response = self.client.get(&url).send().await?;
        let bytes = response.bytes().await?;
        parse_announce_response(&bytes)
    }

    fn scrape_url(&self) -> Option<String> {
        let slash = self.announce_url.rfind('/')?;
        let (head, tail) = self.announce_url.split_at(slash + 1);
        tail.strip_prefix("announce").map(|rest| format!("{head}scrape{rest}"))
    }

    pub async fn scrape(&self, info_hashes: &[[u8; 20]]) -> TrackerResult<Vec<ScrapeEntry>> {
        let base = self
            .scrape_url()
            .ok_or_else(|| TrackerError::MalformedResponse("tracker does not support scrape convention".into()))?;
        let params: String = info_hashes
            .iter()
            .map(|hash| format!("info_hash={}", percent_encode_bytes(hash)))
            .collect::<Vec<_>>()
            .join("&");
        let separator = if base.contains('?') { '&' } else { '?' };
        let url = format!("{base}{separator}{params}");
        let response = self.client.get(&url).send().await?;
        let bytes = response.bytes().await?;
        parse_scrape_response(&bytes)
    }
}

#[derive(Debug, Deserialize)]
struct HttpAnnounceWire {
    #[serde(default)]
    interval: i64,
    #[serde(rename = "min interval", default)]
    min_interval: Option<i64>,
    #[serde(default)]
    complete: i64,
    #[serde(default)]
    incomplete: i64,
    #[serde(default)]
    peers: PeersField,
    #[serde(default)]
    peers6: Option<Vec<u8>>,
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PeersField {
    Compact(Vec<u8>),
    Dict(Vec<PeerDict>),
}

impl Default for PeersField {
    fn default() -> Self {
        PeersField::Compact(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

fn parse_compact_ipv4(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

fn parse_compact_ipv6(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[0..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        })
        .collect()
}

fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
    let wire: HttpAnnounceWire = serde_bencode::from_bytes(bytes)
        .map_err(|e| TrackerError::MalformedResponse(e.to_string()))?;
    if let Some(reason) = wire.failure_reason {
        return Err(TrackerError::TrackerFailure(reason));
    }
    let mut peers = match wire.peers {
        PeersField::Compact(bytes) => parse_compact_ipv4(&bytes),
        PeersField::Dict(dicts) => dicts
            .into_iter()
            .filter_map(|dict| dict.ip.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, dict.port)))
            .collect(),
    };
    if let Some(peers6) = wire.peers6 {
        peers.extend(parse_compact_ipv6(&peers6));
    }
    Ok(AnnounceResponse {
        interval: wire.interval.max(0) as u32,
        min_interval: wire.min_interval.map(|v| v.max(0) as u32),
        seeders: wire.complete.max(0) as u32,
        leechers: wire.incomplete.max(0) as u32,
        peers,
    })
}

/// Scrape responses key the `files` dictionary by the raw 20-byte
/// info_hash, which isn't always valid UTF-8 — `serde_bencode`'s
/// string-keyed maps can't represent that, so this walks the decoded
/// `BencodeValue` tree directly instead.
fn parse_scrape_response(bytes: &[u8]) -> TrackerResult<Vec<ScrapeEntry>> {
    let value = bencode::decode(bytes).map_err(|e| TrackerError::MalformedResponse(e.to_string()))?;
    let root = value.as_dict().ok_or_else(|| TrackerError::MalformedResponse("scrape response is not a dict".into()))?;
    let files = root
        .get(b"files".as_slice())
        .and_then(BencodeValue::as_dict)
        .ok_or_else(|| TrackerError::MalformedResponse("scrape response missing 'files'".into()))?;

    let mut entries = Vec::with_capacity(files.len());
    for (key, value) in files {
        if key.len() != 20 {
            continue;
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(key);
        let stats = value
            .as_dict()
            .ok_or_else(|| TrackerError::MalformedResponse("scrape file entry is not a dict".into()))?;
        let field = |name: &[u8]| -> u32 {
            stats.get(name).and_then(BencodeValue::as_integer).unwrap_or(0).max(0) as u32
        };
        entries.push(ScrapeEntry {
            info_hash,
            complete: field(b"complete"),
            downloaded: field(b"downloaded"),
            incomplete: field(b"incomplete"),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrape_url_is_derived_from_the_announce_path() {
        let tracker = HttpTracker::new("http://tracker.example.com:6969/announce");
        assert_eq!(tracker.scrape_url().as_deref(), Some("http://tracker.example.com:6969/scrape"));
    }

    #[test]
    fn scrape_url_is_none_when_path_has_no_announce_segment() {
        let tracker = HttpTracker::new("http://tracker.example.com:6969/a");
        assert_eq!(tracker.scrape_url(), None);
    }

    #[test]
    fn announce_query_percent_encodes_info_hash_exactly_once() {
        let tracker = HttpTracker::new("http://tracker.example.com/announce");
        let request = AnnounceRequest {
            info_hash: [
                0xd8, 0xe8, 0xfc, 0xa2, 0xdc, 0x0f, 0x89, 0x6f, 0xd7, 0xcb, 0x4c, 0xb0, 0x03, 0x1b, 0xa2, 0x49, 0xb3,
                0x3e, 0x21, 0x3b,
            ],
            peer_id: [0u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: AnnounceEvent::Started,
            numwant: None,
        };
        let url = tracker.build_announce_url(&request);
        assert!(url.contains("info_hash=%D8%E8%FC%A2%DC%0F%89o%D7%CBL%B0%03%1B%A2I%B3%3E%21%3B"));
        assert!(!url.contains("%25"));
        assert!(url.contains("event=started"));
    }

    #[test]
    fn parses_compact_ipv4_peer_list() {
        let bytes = [127, 0, 0, 1, 0x1a, 0xe1];
        let peers = parse_compact_ipv4(&bytes);
        assert_eq!(peers, vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6881)]);
    }

    #[test]
    fn parses_compact_ipv6_peer_list() {
        let mut bytes = [0u8; 18];
        bytes[15] = 1; // ::1
        bytes[16..18].copy_from_slice(&6881u16.to_be_bytes());
        let peers = parse_compact_ipv6(&bytes);
        assert_eq!(peers, vec![SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 6881)]);
    }

    #[test]
    fn parses_scrape_response_keyed_by_raw_info_hash() {
        use std::collections::BTreeMap;
        let info_hash = [7u8; 20];
        let mut stats = BTreeMap::new();
        stats.insert(b"complete".to_vec(), BencodeValue::Integer(5));
        stats.insert(b"downloaded".to_vec(), BencodeValue::Integer(42));
        stats.insert(b"incomplete".to_vec(), BencodeValue::Integer(2));
        let mut files = BTreeMap::new();
        files.insert(info_hash.to_vec(), BencodeValue::Dict(stats));
        let mut root = BTreeMap::new();
        root.insert(b"files".to_vec(), BencodeValue::Dict(files));
        let encoded = bencode::encode(&BencodeValue::Dict(root)).unwrap();

        let entries = parse_scrape_response(&encoded).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].info_hash, info_hash);
        assert_eq!(entries[0].complete, 5);
        assert_eq!(entries[0].downloaded, 42);
        assert_eq!(entries[0].incomplete, 2);
    }
}
