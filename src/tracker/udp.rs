//! The UDP tracker protocol (BEP 15): connect/announce/scrape/error, with
//! the exact wire layout and exponential-backoff retry schedule.
use super::{AnnounceRequest, AnnounceResponse, ScrapeEntry, TrackerError, TrackerResult};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, instrument};

const PROTOCOL_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// A connection id is valid for 60 seconds per BEP 15.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);
/// `15 * 2^n` seconds per attempt, up to 8 retries, per BEP 15.
const MAX_RETRIES: u32 = 8;
const BASE_TIMEOUT_SECS: u64 = 15;

pub struct UdpTracker {
    announce_url: String,
    authority: String,
    connection: Option<(u64, Instant)>,
}

fn parse_authority(url: &str) -> TrackerResult<String> {
    let without_scheme = url
        .strip_prefix("udp://")
        .ok_or_else(|| TrackerError::UnsupportedScheme(url.to_string()))?;
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    if authority.is_empty() {
        return Err(TrackerError::MalformedResponse("empty UDP tracker authority".into()));
    }
    Ok(authority.to_string())
}

impl UdpTracker {
    pub fn new(announce_url: &str) -> TrackerResult<Self> {
        let authority = parse_authority(announce_url)?;
        Ok(Self { announce_url: announce_url.to_string(), authority, connection: None })
    }

    pub fn announce_url(&self) -> &str {
        &self.announce_url
    }

    async fn resolve(&self) -> TrackerResult<SocketAddr> {
        let mut addrs = tokio::net::lookup_host(&self.authority).await?;
        addrs.next().ok_or_else(|| {
            TrackerError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no addresses for {}", self.authority),
            ))
        })
    }

    async fn ensure_connection(&mut self, socket: &UdpSocket) -> TrackerResult<u64> {
        if let Some((id, obtained)) = self.connection {
            if obtained.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }
        let id = self.connect(socket).await?;
        self.connection = Some((id, Instant::now()));
        Ok(id)
    }

    #[instrument(level = "debug", skip(self, socket))]
    async fn connect(&mut self, socket: &UdpSocket) -> TrackerResult<u64> {
        let transaction_id: u32 = rand::rng().random();
        let mut request = Vec::with_capacity(16);
        request.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());
        let response = send_with_retries(socket, &request, transaction_id, ACTION_CONNECT).await?;
        if response.len() < 16 {
            return Err(TrackerError::MalformedResponse("connect response shorter than 16 bytes".into()));
        }
        Ok(u64::from_be_bytes(response[8..16].try_into().unwrap()))
    }

    #[instrument(level = "debug", skip(self, request))]
    pub async fn announce(&mut self, request: &AnnounceRequest) -> TrackerResult<AnnounceResponse> {
        let addr = self.resolve().await?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        let connection_id = self.ensure_connection(&socket).await?;

        let transaction_id: u32 = rand::rng().random();
        let key: u32 = rand::rng().random();
        let numwant: i32 = request.numwant.map(|n| n as i32).unwrap_or(-1);

        let mut buf = Vec::with_capacity(98);
        buf.extend_from_slice(&connection_id.to_be_bytes());
        buf.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        buf.extend_from_slice(&transaction_id.to_be_bytes());
        buf.extend_from_slice(&request.info_hash);
        buf.extend_from_slice(&request.peer_id);
        buf.extend_from_slice(&request.downloaded.to_be_bytes());
        buf.extend_from_slice(&request.left.to_be_bytes());
        buf.extend_from_slice(&request.uploaded.to_be_bytes());
        buf.extend_from_slice(&request.event.as_udp_code().to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes()); // IP address: 0 = use sender's
        buf.extend_from_slice(&key.to_be_bytes());
        buf.extend_from_slice(&numwant.to_be_bytes());
        buf.extend_from_slice(&request.port.to_be_bytes());

        debug!(connection_id, transaction_id, "sending UDP announce");
        let response = send_with_retries(&socket, &buf, transaction_id, ACTION_ANNOUNCE).await?;
        parse_announce_response(&response)
    }

    #[instrument(level = "debug", skip(self, info_hashes))]
    pub async fn scrape(&mut self, info_hashes: &[[u8; 20]]) -> TrackerResult<Vec<ScrapeEntry>> {
        let addr = self.resolve().await?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        let connection_id = self.ensure_connection(&socket).await?;

        let transaction_id: u32 = rand::rng().random();
        let mut buf = Vec::with_capacity(16 + 20 * info_hashes.len());
        buf.extend_from_slice(&connection_id.to_be_bytes());
        buf.extend_from_slice(&ACTION_SCRAPE.to_be_bytes());
        buf.extend_from_slice(&transaction_id.to_be_bytes());
        for hash in info_hashes {
            buf.extend_from_slice(hash);
        }
        let response = send_with_retries(&socket, &buf, transaction_id, ACTION_SCRAPE).await?;
        parse_scrape_response(&response, info_hashes)
    }
}

async fn send_with_retries(
    socket: &UdpSocket,
    request: &[u8],
    transaction_id: u32,
    expected_action: u32,
) -> TrackerResult<Vec<u8>> {
    let mut buf = vec![0u8; 2048];
    for attempt in 0..MAX_RETRIES {
        socket.send(request).await?;
        let wait = Duration::from_secs(BASE_TIMEOUT_SECS * 2u64.pow(attempt));
        match tokio::time::timeout(wait, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                let response = &buf[..n];
                if response.len() < 8 {
                    continue;
                }
                let action = u32::from_be_bytes(response[0..4].try_into().unwrap());
                let txn = u32::from_be_bytes(response[4..8].try_into().unwrap());
                if txn != transaction_id {
                    continue;
                }
                if action == ACTION_ERROR {
                    let message = String::from_utf8_lossy(&response[8..]).into_owned();
                    return Err(TrackerError::TrackerFailure(message));
                }
                if action != expected_action {
                    return Err(TrackerError::MalformedResponse(format!("unexpected action {action}")));
                }
                return Ok(response.to_vec());
            }
            Ok(Err(e)) => return Err(TrackerError::Io(e)),
            Err(_elapsed) => continue,
        }
    }
    Err(TrackerError::Timeout)
}

fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
    if bytes.len() < 20 {
        return Err(TrackerError::MalformedResponse("announce response shorter than 20 bytes".into()));
    }
    let interval = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
    let leechers = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
    let seeders = u32::from_be_bytes(bytes[16..20].try_into().unwrap());
    let peers = bytes[20..]
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect();
    Ok(AnnounceResponse { interval, min_interval: None, seeders, leechers, peers })
}

fn parse_scrape_response(bytes: &[u8], info_hashes: &[[u8; 20]]) -> TrackerResult<Vec<ScrapeEntry>> {
    let body = &bytes[8.min(bytes.len())..];
    if body.len() != info_hashes.len() * 12 {
        return Err(TrackerError::MalformedResponse("scrape response entry count mismatch".into()));
    }
    Ok(body
        .chunks_exact(12)
        .zip(info_hashes)
        .map(|(chunk, hash)| ScrapeEntry {
            info_hash: *hash,
            complete: u32::from_be_bytes(chunk[0..4].try_into().unwrap()),
            downloaded: u32::from_be_bytes(chunk[4..8].try_into().unwrap()),
            incomplete: u32::from_be_bytes(chunk[8..12].try_into().unwrap()),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_authority_strips_the_udp_scheme_and_path() {
        assert_eq!(parse_authority("udp://tracker.example.com:6969/announce").unwrap(), "tracker.example.com:6969");
        assert_eq!(parse_authority("udp://tracker.example.com:6969").unwrap(), "tracker.example.com:6969");
    }

    #[test]
    fn parse_authority_rejects_non_udp_scheme() {
        assert!(parse_authority("http://tracker.example.com/announce").is_err());
    }

    #[test]
    fn connect_request_matches_the_bep15_wire_layout() {
        let transaction_id = 0x1234_5678u32;
        let mut request = Vec::with_capacity(16);
        request.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());
        assert_eq!(request.len(), 16);
        assert_eq!(&request[0..8], &[0x00, 0x00, 0x04, 0x17, 0x27, 0x10, 0x19, 0x80]);
        assert_eq!(&request[8..12], &0u32.to_be_bytes());
        assert_eq!(&request[12..16], &transaction_id.to_be_bytes());
    }

    #[test]
    fn parses_announce_response_with_two_peers() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        bytes.extend_from_slice(&7u32.to_be_bytes()); // transaction id, not checked here
        bytes.extend_from_slice(&1800u32.to_be_bytes()); // interval
        bytes.extend_from_slice(&3u32.to_be_bytes()); // leechers
        bytes.extend_from_slice(&5u32.to_be_bytes()); // seeders
        bytes.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        bytes.extend_from_slice(&[10, 0, 0, 2, 0x1a, 0xe2]);
        let response = parse_announce_response(&bytes).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.leechers, 3);
        assert_eq!(response.seeders, 5);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0], SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6881));
    }

    #[test]
    fn parses_scrape_response_in_request_order() {
        let hashes = [[1u8; 20], [2u8; 20]];
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&ACTION_SCRAPE.to_be_bytes());
        bytes.extend_from_slice(&9u32.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&4u32.to_be_bytes());
        bytes.extend_from_slice(&5u32.to_be_bytes());
        bytes.extend_from_slice(&6u32.to_be_bytes());
        let entries = parse_scrape_response(&bytes, &hashes).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].info_hash, hashes[0]);
        assert_eq!((entries[0].complete, entries[0].downloaded, entries[0].incomplete), (1, 2, 3));
        assert_eq!((entries[1].complete, entries[1].downloaded, entries[1].incomplete), (4, 5, 6));
    }
}
