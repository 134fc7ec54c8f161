//! A thin line-oriented driver: load a `.torrent` file, open storage, start
//! a session, and run the cooperative announce/choke/request loop until
//! every piece is verified or the user interrupts. Status is logged via
//! `tracing`; there is no UI beyond that.
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use torrent_engine::config::Settings;
use torrent_engine::peer::{Message, PeerConnection};
use torrent_engine::peer_id::PeerId;
use torrent_engine::piece::picker::SelectionMode;
use torrent_engine::piece::{BlockRequest, PieceState, BLOCK_LENGTH};
use torrent_engine::resume;
use torrent_engine::session::TorrentSession;
use torrent_engine::storage::{Storage, StorageHandle};
use torrent_engine::torrent::metainfo::Metainfo;
use torrent_engine::tracker::{AnnounceEvent, AnnounceRequest, TrackerGroup, TrackerTransport};
use torrent_engine::{listener, EngineError};
use tracing::{info, warn};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SelectionModeArg {
    Random,
    RarestFirst,
    HighAvailabilityThenRarest,
}

impl From<SelectionModeArg> for SelectionMode {
    fn from(value: SelectionModeArg) -> Self {
        match value {
            SelectionModeArg::Random => SelectionMode::Random,
            SelectionModeArg::RarestFirst => SelectionMode::RarestFirst,
            SelectionModeArg::HighAvailabilityThenRarest => SelectionMode::HighAvailabilityThenRarest,
        }
    }
}

/// A single-torrent BitTorrent client core, driven to completion from the
/// command line.
#[derive(Parser, Debug)]
#[command(name = "torrentd", version, about)]
struct Args {
    /// Path to the `.torrent` metainfo file.
    torrent_file: PathBuf,

    /// Directory the downloaded files are written into.
    #[arg(long, default_value = ".")]
    download_dir: PathBuf,

    #[arg(long)]
    listen_port: Option<u16>,

    #[arg(long)]
    upload_slots: Option<u32>,

    #[arg(long = "max-peers")]
    max_connections_per_torrent: Option<u32>,

    #[arg(long, value_enum)]
    piece_selection_mode: Option<SelectionModeArg>,

    /// Pre-allocate every file to its final size instead of growing it as
    /// blocks arrive.
    #[arg(long)]
    preallocate: bool,

    /// Increase log verbosity; repeatable (`-v`, `-vv`).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) {
    let default_directive = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let data = std::fs::read(&args.torrent_file)
        .with_context(|| format!("reading torrent file {}", args.torrent_file.display()))?;
    let metainfo = Metainfo::parse(&data).context("parsing torrent metainfo")?;
    info!(name = %metainfo.name, pieces = metainfo.num_pieces(), "loaded torrent");

    let mut settings = Settings::default();
    if let Some(port) = args.listen_port {
        settings.listen_port = port;
    }
    if let Some(slots) = args.upload_slots {
        settings.upload_slots = slots;
    }
    if let Some(max_peers) = args.max_connections_per_torrent {
        settings.max_connections_per_torrent = max_peers;
    }
    if let Some(mode) = args.piece_selection_mode {
        settings.piece_selection_mode = mode.into();
    }
    settings.allocate_full_file_sizes = args.preallocate;

    std::fs::create_dir_all(&args.download_dir)
        .with_context(|| format!("creating download directory {}", args.download_dir.display()))?;
    let storage = Storage::open(&args.download_dir, &metainfo, settings.allocate_full_file_sizes)
        .context("opening storage")?;
    let storage_handle =
        StorageHandle::spawn(storage, settings.max_queued_writes as usize, settings.max_queued_reads as usize);

    let tiers = metainfo
        .announce_tiers
        .iter()
        .map(|tier| {
            tier.iter()
                .filter_map(|url| match TrackerTransport::from_url(url) {
                    Ok(transport) => Some(transport),
                    Err(error) => {
                        warn!(url, %error, "skipping unsupported tracker URL");
                        None
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|tier| !tier.is_empty())
        .collect::<Vec<_>>();
    let trackers = TrackerGroup::new(tiers);

    let peer_id = PeerId::generate();
    let info_hash = *metainfo.info_hash.as_bytes();
    let num_pieces = metainfo.num_pieces();
    let name = metainfo.name.clone();

    let mut session = TorrentSession::new(metainfo, storage_handle, trackers, peer_id, settings.clone());

    if let Some(resumed) = resume::load(&args.download_dir, &name, num_pieces) {
        let verified = resumed.iter_set().count();
        for index in resumed.iter_set() {
            session.picker_mut().piece_mut(index as u32).mark_verified();
        }
        info!(verified, total = num_pieces, "restored resume state");
    }

    session.start().context("starting session")?;
    session.mark_running().context("marking session running")?;

    let announce_request = AnnounceRequest {
        info_hash,
        peer_id: *peer_id.as_bytes(),
        port: settings.listen_port,
        uploaded: session.uploaded(),
        downloaded: session.downloaded(),
        left: session.bytes_left(),
        event: AnnounceEvent::Started,
        numwant: Some(50),
    };
    let response = session
        .trackers_mut()
        .announce(&announce_request)
        .await
        .context("initial tracker announce")?;
    info!(peers = response.peers.len(), interval = response.interval, "announce succeeded");

    let connections = listener::dial_many(
        response.peers,
        info_hash,
        peer_id,
        settings.max_requests_in_flight as usize,
    )
    .await;
    info!(connected = connections.len(), "dialed peers");
    for connection in connections {
        session.register_peer(connection);
    }

    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(16);
    let accept_handle = tokio::spawn(accept_loop(
        settings.listen_port,
        peer_id,
        info_hash,
        settings.max_requests_in_flight as usize,
        inbound_tx,
    ));

    run_event_loop(&mut session, inbound_rx, &args.download_dir, &name).await;
    accept_handle.abort();

    let final_request = AnnounceRequest { event: AnnounceEvent::Stopped, ..announce_request };
    if let Err(error) = session.trackers_mut().announce(&final_request).await {
        warn!(%error, "final announce failed");
    }
    session.stop().ok();
    session.mark_stopped();
    Ok(())
}

/// Runs the accept loop on `port`, forwarding every connection whose
/// handshake names `info_hash` to `accepted`; any other request is dropped
/// by `Listener::accept_one` itself. Runs until the binary shuts down.
async fn accept_loop(
    port: u16,
    peer_id: PeerId,
    info_hash: [u8; 20],
    max_requests_in_flight: usize,
    accepted: tokio::sync::mpsc::Sender<PeerConnection>,
) {
    let bound = match listener::Listener::bind(port).await {
        Ok(listener) => listener,
        Err(error) => {
            warn!(%error, "failed to bind inbound listener, accepting no inbound peers");
            return;
        }
    };
    info!(addr = %bound.local_addr(), "listening for inbound peer connections");
    loop {
        match bound.accept_one(peer_id, max_requests_in_flight, |hash| hash == &info_hash).await {
            Ok(Some(connection)) => {
                if accepted.send(connection).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(error) => warn!(%error, "inbound handshake failed"),
        }
    }
}

/// Drives the peer wire protocol and the storage/verification pipeline
/// until the torrent is fully verified. Each iteration: drain any newly
/// accepted inbound connections, send interest where we lack pieces the
/// peer has, request blocks up to the per-peer pipeline depth, serve
/// inbound requests for pieces we've already verified, and process one
/// inbound message per peer.
async fn run_event_loop(
    session: &mut TorrentSession,
    mut inbound: tokio::sync::mpsc::Receiver<PeerConnection>,
    download_dir: &Path,
    torrent_name: &str,
) {
    let peer_rates: HashMap<SocketAddr, u64> = HashMap::new();
    let mut ticks = 0u32;
    loop {
        while let Ok(connection) = inbound.try_recv() {
            info!(addr = %connection.addr, "accepted inbound peer");
            session.register_peer(connection);
        }

        if session.picker().is_fully_verified() {
            info!("all pieces verified, download complete");
            break;
        }

        let addrs = session.peer_addrs();
        if addrs.is_empty() {
            warn!("no connected peers remain, stopping");
            break;
        }

        for addr in &addrs {
            match service_peer(session, *addr, download_dir, torrent_name).await {
                Ok(()) => {}
                Err(error) => {
                    warn!(%addr, %error, "dropping peer after error");
                    session.remove_peer(addr);
                }
            }
        }

        ticks += 1;
        if ticks % (session.settings().choke_interval_secs.max(1)) == 0 {
            let transitions = session.run_choke_round(&peer_rates);
            for (addr, unchoked) in transitions {
                if let Some(peer) = session.peer_mut(&addr) {
                    let message = if unchoked { Message::Unchoke } else { Message::Choke };
                    let _ = peer.send(message).await;
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn service_peer(
    session: &mut TorrentSession,
    addr: SocketAddr,
    download_dir: &Path,
    torrent_name: &str,
) -> Result<(), EngineError> {
    let piece_count = session.picker().piece_count();

    let message = session.peer_mut(&addr).ok_or(EngineError::Cancelled)?.recv().await?;
    if let Some(message) = message {
        match message {
            Message::Bitfield(bits) => match torrent_engine::piece::Bitfield::from_wire_bytes(&bits, piece_count) {
                Some(bitfield) => {
                    session.picker_mut().apply_bitfield(&bitfield);
                    session.peer_mut(&addr).ok_or(EngineError::Cancelled)?.adopt_bitfield(bitfield);
                }
                None => {
                    return Err(EngineError::Protocol(format!("bitfield length mismatch from {addr}")));
                }
            },
            Message::Have { piece_index } => {
                session.picker_mut().apply_have(piece_index);
                session
                    .peer_mut(&addr)
                    .ok_or(EngineError::Cancelled)?
                    .mark_have(piece_index as usize, piece_count);
            }
            Message::Unchoke => {
                session.peer_mut(&addr).ok_or(EngineError::Cancelled)?.set_peer_choking(false);
            }
            Message::Choke => {
                session.peer_mut(&addr).ok_or(EngineError::Cancelled)?.set_peer_choking(true);
            }
            Message::Interested => {
                session.peer_mut(&addr).ok_or(EngineError::Cancelled)?.set_peer_interested(true);
            }
            Message::NotInterested => {
                session.peer_mut(&addr).ok_or(EngineError::Cancelled)?.set_peer_interested(false);
            }
            Message::Request { index, begin, length } => {
                serve_request(session, addr, index, begin, length).await?;
            }
            Message::Piece { index, begin, block } => {
                handle_piece(session, addr, index, begin, block, download_dir, torrent_name).await?;
            }
            Message::Cancel { .. } => {
                // We answer Request synchronously rather than queueing sends,
                // so by the time Cancel arrives there's nothing left to drop.
            }
            Message::Port(_) | Message::KeepAlive | Message::Unknown { .. } => {}
        }
    }

    let needs_interest =
        session.peer(&addr).map(|peer| peer.peer_bitfield.is_some() && !peer.am_interested).unwrap_or(false);
    if needs_interest {
        let peer = session.peer_mut(&addr).ok_or(EngineError::Cancelled)?;
        peer.set_am_interested(true);
        peer.send(Message::Interested).await?;
    }

    loop {
        let next_bitfield = session
            .peer(&addr)
            .filter(|peer| peer.can_request_more())
            .and_then(|peer| peer.peer_bitfield.clone());
        let Some(bitfield) = next_bitfield else { break };
        let Some(block) = session.picker_mut().pick_block(addr, &bitfield) else { break };
        let peer = session.peer_mut(&addr).ok_or(EngineError::Cancelled)?;
        peer.record_request(block);
        peer.send(Message::Request { index: block.piece_index, begin: block.block_offset, length: block.block_length })
            .await?;
    }
    Ok(())
}

/// Serves an inbound block request by reading straight from storage and
/// replying with `Piece`, provided we aren't choking the requester and the
/// request names a piece we've verified and a bounded, in-range block.
async fn serve_request(
    session: &mut TorrentSession,
    addr: SocketAddr,
    index: u32,
    begin: u32,
    length: u32,
) -> Result<(), EngineError> {
    let am_choking = session.peer(&addr).map(|peer| peer.am_choking).unwrap_or(true);
    if am_choking {
        return Ok(());
    }

    let piece_count = session.picker().piece_count();
    let valid = (index as usize) < piece_count && length > 0 && length <= BLOCK_LENGTH && {
        let piece = session.picker().piece(index);
        piece.state == PieceState::Verified && (begin as u64 + length as u64) <= piece.length as u64
    };
    if !valid {
        warn!(%addr, index, begin, length, "rejecting out-of-bounds or unverified block request");
        return Ok(());
    }

    let block = session.storage().read_block(index, begin, length).await?;
    session.record_uploaded(length as u64);
    session.peer_mut(&addr).ok_or(EngineError::Cancelled)?.send(Message::Piece { index, begin, block }).await?;
    Ok(())
}

/// Writes an arriving block to storage, cancels the matching request on
/// every other peer it was duplicated to during endgame, and verifies and
/// persists the piece once it's fully downloaded.
async fn handle_piece(
    session: &mut TorrentSession,
    addr: SocketAddr,
    index: u32,
    begin: u32,
    block: Vec<u8>,
    download_dir: &Path,
    torrent_name: &str,
) -> Result<(), EngineError> {
    let length = block.len() as u32;
    let request = BlockRequest { piece_index: index, block_offset: begin, block_length: length };

    let other_requesters: Vec<SocketAddr> =
        session.picker().piece(index).requesters(begin).into_iter().filter(|other| *other != addr).collect();

    session.storage().write_block(index, begin, block).await?;
    session.record_downloaded(length as u64);
    session.picker_mut().piece_mut(index).mark_block_downloaded(begin, addr);
    if let Some(peer) = session.peer_mut(&addr) {
        peer.clear_request(&request);
    }

    for other in other_requesters {
        if let Some(peer) = session.peer_mut(&other) {
            peer.clear_request(&request);
            let _ = peer.send(Message::Cancel { index, begin, length }).await;
        }
    }

    if session.picker().piece(index).is_complete() {
        let verified = session.storage().verify_piece(index).await?;
        if verified {
            session.picker_mut().piece_mut(index).mark_verified();
            session.on_piece_verified();
            info!(index, "piece verified");
            if let Err(error) = resume::save(download_dir, torrent_name, &session.picker().have_bitfield()) {
                warn!(%error, "failed to persist resume state");
            }
        } else {
            let contributors = session.picker().piece(index).contributing_peers();
            warn!(index, "piece failed verification, resetting");
            session.picker_mut().piece_mut(index).reset_on_failure();
            for banned in session.penalize_failed_piece(contributors) {
                warn!(%banned, "banning peer after repeated bad pieces");
                session.remove_peer(&banned);
            }
        }
    }
    Ok(())
}
