//! Tracker communication: HTTP(S) and UDP announce/scrape transports behind
//! a common request/response shape, and multi-tier failover across a
//! tracker list (BEP 12-style).
pub mod http;
pub mod udp;

use std::net::SocketAddr;
use thiserror::Error;
use tracing::{instrument, warn};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed tracker response: {0}")]
    MalformedResponse(String),
    #[error("tracker reported failure: {0}")]
    TrackerFailure(String),
    #[error("UDP tracker reply had a mismatched transaction id")]
    TransactionMismatch,
    #[error("UDP tracker request timed out after all retries")]
    Timeout,
    #[error("unsupported announce URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("all trackers in every tier failed")]
    AllTiersFailed,
}

pub type TrackerResult<T> = Result<T, TrackerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
    None,
}

impl AnnounceEvent {
    fn as_query_value(self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::None => None,
        }
    }

    fn as_udp_code(self) -> u32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub numwant: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub min_interval: Option<u32>,
    pub seeders: u32,
    pub leechers: u32,
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Copy)]
pub struct ScrapeEntry {
    pub info_hash: [u8; 20],
    pub complete: u32,
    pub downloaded: u32,
    pub incomplete: u32,
}

/// One configured tracker, dispatching to the HTTP or UDP wire protocol
/// depending on the announce URL's scheme.
pub enum TrackerTransport {
    Http(http::HttpTracker),
    Udp(udp::UdpTracker),
}

impl TrackerTransport {
    pub fn from_url(url: &str) -> TrackerResult<Self> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Self::Http(http::HttpTracker::new(url)))
        } else if url.starts_with("udp://") {
            Ok(Self::Udp(udp::UdpTracker::new(url)?))
        } else {
            Err(TrackerError::UnsupportedScheme(url.to_string()))
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Http(t) => t.announce_url(),
            Self::Udp(t) => t.announce_url(),
        }
    }

    pub async fn announce(&mut self, request: &AnnounceRequest) -> TrackerResult<AnnounceResponse> {
        match self {
            Self::Http(t) => t.announce(request).await,
            Self::Udp(t) => t.announce(request).await,
        }
    }

    pub async fn scrape(&mut self, info_hashes: &[[u8; 20]]) -> TrackerResult<Vec<ScrapeEntry>> {
        match self {
            Self::Http(t) => t.scrape(info_hashes).await,
            Self::Udp(t) => t.scrape(info_hashes).await,
        }
    }
}

/// A list of tracker tiers (the `announce-list` structure): within a tier,
/// trackers are tried in order and a success promotes that tracker to the
/// front of its tier; across tiers, the group keeps retrying from whichever
/// tier last succeeded before falling back to tier 0.
pub struct TrackerGroup {
    tiers: Vec<Vec<TrackerTransport>>,
    current_tier: usize,
}

impl TrackerGroup {
    pub fn new(tiers: Vec<Vec<TrackerTransport>>) -> Self {
        Self { tiers, current_tier: 0 }
    }

    #[instrument(level = "debug", skip_all)]
    pub async fn announce(&mut self, request: &AnnounceRequest) -> TrackerResult<AnnounceResponse> {
        let tier_count = self.tiers.len();
        for step in 0..tier_count {
            let tier_index = (self.current_tier + step) % tier_count;
            let tier = &mut self.tiers[tier_index];
            for position in 0..tier.len() {
                match tier[position].announce(request).await {
                    Ok(response) => {
                        if position != 0 {
                            tier.swap(0, position);
                        }
                        self.current_tier = tier_index;
                        return Ok(response);
                    }
                    Err(error) => {
                        warn!(tracker = tier[position].url(), %error, "announce failed, trying next tracker");
                    }
                }
            }
        }
        Err(TrackerError::AllTiersFailed)
    }

    pub async fn scrape(&mut self, info_hashes: &[[u8; 20]]) -> TrackerResult<Vec<ScrapeEntry>> {
        let tier_count = self.tiers.len();
        for step in 0..tier_count {
            let tier_index = (self.current_tier + step) % tier_count;
            let tier = &mut self.tiers[tier_index];
            for position in 0..tier.len() {
                match tier[position].scrape(info_hashes).await {
                    Ok(entries) => {
                        if position != 0 {
                            tier.swap(0, position);
                        }
                        return Ok(entries);
                    }
                    Err(error) => {
                        warn!(tracker = tier[position].url(), %error, "scrape failed, trying next tracker");
                    }
                }
            }
        }
        Err(TrackerError::AllTiersFailed)
    }
}
