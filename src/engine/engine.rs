// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::announce::{AnnounceEvent, AnnounceRequest, PeerSource};
use crate::bitfield::Bitfield;
use crate::command::{SessionCommand, SessionEvent, SessionEventSummary};
use crate::disk::cache::PieceReader;
use crate::disk::check;
use crate::disk::storage::{write_range, FileMap};
use crate::engine::addr_list::AddrList;
use crate::engine::choker::Choker;
use crate::engine::info_downloader::{InfoDownloader, METADATA_QUEUE_LENGTH};
use crate::engine::picker::{PickContext, PiecePicker};
use crate::engine::piece_downloader::{BlockOutcome, PieceDownloader};
use crate::engine::state::{Lifecycle, PeerExtendedState, PeerState, Stats};
use crate::engine::{
    EngineCommand, EngineHandle, EngineMessage, TorrentEvent, TorrentParameters,
};
use crate::errors::TorrentError;
use crate::metainfo::{self, Info, InfoHash};
use crate::peer::handshake::{self, Extensions, HandshakeOutcome, HandshakerParams};
use crate::peer::protocol::{
    addrs_to_compact, allowed_fast_set, compact_to_addrs, extended_handshake_payload,
    BlockInfo, LocalExtensionId, Message, MetadataMessage, PexMessage, BLOCK_SIZE,
    MAX_REQUEST_LENGTH, METADATA_MSG_DATA, METADATA_MSG_REJECT, METADATA_MSG_REQUEST,
};
use crate::peer::session::{PeerSession, PeerSessionParams};
use crate::resume::{ResumeSpec, Resumer};

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, Duration, Instant};

use tracing::{event, Level};

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

/// Allowed-fast pieces granted to each fast-extension peer.
const ALLOWED_FAST_GRANTS: usize = 10;

const SPEED_TICK: Duration = Duration::from_secs(1);
const REGULAR_UNCHOKE_INTERVAL: Duration = Duration::from_secs(10);
const OPTIMISTIC_UNCHOKE_INTERVAL: Duration = Duration::from_secs(30);
const PEX_INTERVAL: Duration = Duration::from_secs(75);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

const PEER_COMMAND_QUEUE: usize = 64;

const DIAL_BASE_COOLDOWN_SECS: u64 = 15;
const DIAL_MAX_COOLDOWN_SECS: u64 = 1800;
const DIAL_MAX_FAILURES: u32 = 10;

/// Drives one torrent from an info-hash to a fully verified on-disk file
/// set while seeding what it has. All torrent-global state lives here and
/// is touched only from `run`'s event loop; peers, handshakers and the
/// disk pipeline are tasks on the other end of channels.
pub struct Engine {
    cfg: Arc<crate::config::Settings>,
    download_dir: PathBuf,
    trackers: Vec<String>,
    blocklist: Option<HashSet<IpAddr>>,
    resumer: Option<Arc<dyn Resumer>>,
    created_at: i64,

    info_hash: InfoHash,
    local_peer_id: [u8; 20],
    info: Option<Info>,
    info_bytes: Option<Vec<u8>>,
    files: Option<Arc<FileMap>>,
    reader: Option<Arc<PieceReader>>,
    bitfield: Bitfield,
    have_bytes: u64,
    preverified: Option<Bitfield>,
    lifecycle: Lifecycle,
    completed: bool,
    last_announce_event: AnnounceEvent,

    peers: HashMap<SocketAddr, PeerState>,
    peer_ids: HashSet<[u8; 20]>,
    connected_ips: HashSet<IpAddr>,
    dialing: usize,
    dial_backoff: HashMap<SocketAddr, (u32, Instant)>,
    addrs: AddrList,

    downloaders: HashMap<SocketAddr, PieceDownloader>,
    info_downloader: Option<InfoDownloader>,
    metadata_failed: HashSet<SocketAddr>,
    picker: PiecePicker,
    choker: Choker,

    stats: Stats,
    writing: Option<u32>,
    pending_writes: VecDeque<(u32, Vec<u8>)>,
    resume_dirty: bool,

    msg_tx: mpsc::Sender<EngineMessage>,
    msg_rx: mpsc::Receiver<EngineMessage>,
    command_rx: mpsc::Receiver<EngineCommand>,
    peers_rx: mpsc::Receiver<(PeerSource, Vec<SocketAddr>)>,
    incoming_rx: mpsc::Receiver<TcpStream>,
    events_tx: Option<mpsc::Sender<TorrentEvent>>,
    announce_tx: watch::Sender<AnnounceRequest>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Engine {
    pub fn new(params: TorrentParameters) -> (Self, EngineHandle) {
        let cfg = params.settings;
        let (msg_tx, msg_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(16);
        let (peers_tx, peers_rx) = mpsc::channel(16);
        let (incoming_tx, incoming_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (shutdown_tx, _) = broadcast::channel(1);

        let (info, info_bytes, piece_count, mut trackers) = match params.metainfo {
            Some(metainfo) => {
                let count = metainfo.info.piece_count() as usize;
                let trackers = metainfo.trackers();
                (Some(metainfo.info), Some(metainfo.info_bencode), count, trackers)
            }
            None => (None, None, 0, Vec::new()),
        };
        if !params.trackers.is_empty() {
            trackers = params.trackers;
        }

        let bitfield = Bitfield::new(piece_count);
        let picker = PiecePicker::new(&Bitfield::new(0), cfg.endgame_threshold);
        let choker = Choker::new(cfg.unchoked_peers, cfg.optimistic_unchoked_peers);
        let addrs = AddrList::new(cfg.max_peer_addresses);

        let (announce_tx, announce_rx) = watch::channel(AnnounceRequest {
            info_hash: params.info_hash,
            peer_id: params.local_peer_id,
            port: cfg.port,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: AnnounceEvent::None,
        });

        let engine = Self {
            cfg,
            download_dir: params.download_dir,
            trackers,
            blocklist: params.blocklist,
            resumer: params.resumer,
            created_at: chrono::Utc::now().timestamp(),
            info_hash: params.info_hash,
            local_peer_id: params.local_peer_id,
            info,
            info_bytes,
            files: None,
            reader: None,
            bitfield,
            have_bytes: 0,
            preverified: params.preverified_bitfield,
            lifecycle: Lifecycle::Stopped,
            completed: false,
            last_announce_event: AnnounceEvent::None,
            peers: HashMap::new(),
            peer_ids: HashSet::new(),
            connected_ips: HashSet::new(),
            dialing: 0,
            dial_backoff: HashMap::new(),
            addrs,
            downloaders: HashMap::new(),
            info_downloader: None,
            metadata_failed: HashSet::new(),
            picker,
            choker,
            stats: Stats::default(),
            writing: None,
            pending_writes: VecDeque::new(),
            resume_dirty: false,
            msg_tx,
            msg_rx,
            command_rx,
            peers_rx,
            incoming_rx,
            events_tx: Some(events_tx),
            announce_tx,
            shutdown_tx,
        };
        let handle = EngineHandle {
            commands: command_tx,
            peers: peers_tx,
            incoming: incoming_tx,
            announce: announce_rx,
            events: events_rx,
        };
        (engine, handle)
    }

    pub async fn run(mut self) -> Result<(), TorrentError> {
        let mut speed_tick = interval(SPEED_TICK);
        let mut choke_tick = interval(REGULAR_UNCHOKE_INTERVAL);
        let mut optimistic_tick = interval(OPTIMISTIC_UNCHOKE_INTERVAL);
        let mut pex_tick = interval(PEX_INTERVAL);
        let mut maintenance_tick = interval(MAINTENANCE_INTERVAL);
        let mut resume_tick = interval(self.cfg.bitfield_write_interval());

        let result = loop {
            tokio::select! {
                Some(command) = self.command_rx.recv() => {
                    event!(Level::DEBUG, ?command);
                    match command {
                        EngineCommand::Start => self.start(),
                        EngineCommand::Stop => self.stop(),
                        EngineCommand::Shutdown => {
                            self.stop();
                            break Ok(());
                        }
                    }
                }

                Some(message) = self.msg_rx.recv() => {
                    if let Err(fatal) = self.handle_message(message) {
                        break Err(fatal);
                    }
                    self.maintenance();
                }

                Some((source, addrs)) = self.peers_rx.recv() => {
                    if source != PeerSource::Dht || self.dht_allowed() {
                        self.addrs.push_batch(source, addrs);
                        self.maintenance();
                    }
                }

                Some(stream) = self.incoming_rx.recv() => {
                    self.accept_incoming(stream);
                }

                _ = speed_tick.tick() => self.on_speed_tick(),
                _ = choke_tick.tick(), if self.lifecycle == Lifecycle::Running => {
                    self.on_regular_unchoke();
                }
                _ = optimistic_tick.tick(), if self.lifecycle == Lifecycle::Running => {
                    self.on_optimistic_unchoke();
                }
                _ = pex_tick.tick(), if self.lifecycle == Lifecycle::Running => {
                    self.on_pex_tick();
                }
                _ = maintenance_tick.tick(), if self.lifecycle == Lifecycle::Running => {
                    self.maintenance();
                }
                _ = resume_tick.tick() => self.flush_resume(false),
            }
        };

        let _ = self.shutdown_tx.send(());
        result
    }

    fn dht_allowed(&self) -> bool {
        self.cfg.dht_enabled && !self.info.as_ref().map(Info::is_private).unwrap_or(false)
    }

    fn emit(&self, torrent_event: TorrentEvent) {
        if let Some(tx) = &self.events_tx {
            let _ = tx.try_send(torrent_event);
        }
    }

    /// Fatal errors surface exactly once on the event channel; afterwards
    /// the channel is gone and `run` resolves with `TorrentClosed`.
    fn fatal(&mut self, error: TorrentError) -> TorrentError {
        event!(Level::ERROR, error = %error, "Fatal torrent error");
        self.lifecycle = Lifecycle::Stopped;
        match self.events_tx.take() {
            Some(tx) => {
                let _ = tx.try_send(TorrentEvent::Error(error));
                TorrentError::TorrentClosed
            }
            None => error,
        }
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    fn start(&mut self) {
        if self.lifecycle != Lifecycle::Stopped {
            return;
        }
        self.publish_announce(AnnounceEvent::Started);

        if let Some(info) = &self.info {
            let files = Arc::new(FileMap::from_info(&self.download_dir, info));
            self.files = Some(files.clone());
            self.lifecycle = Lifecycle::Allocating;
            self.emit(TorrentEvent::Allocating);
            check::spawn_allocator(files, self.msg_tx.clone(), self.shutdown_tx.subscribe());
        } else {
            // Magnet start: run the swarm for metadata only until the
            // info dictionary arrives.
            self.lifecycle = Lifecycle::Running;
            self.emit(TorrentEvent::Running);
        }
        self.flush_resume(true);
    }

    fn stop(&mut self) {
        if self.lifecycle == Lifecycle::Stopped {
            return;
        }
        self.lifecycle = Lifecycle::Stopping;
        self.publish_announce(AnnounceEvent::Stopped);
        self.flush_resume(true);

        for peer in self.peers.values() {
            let _ = peer.tx.try_send(SessionCommand::Disconnect);
        }
        self.downloaders.clear();
        self.info_downloader = None;
        self.pending_writes.clear();
        self.addrs.clear();

        self.lifecycle = Lifecycle::Stopped;
        self.emit(TorrentEvent::Stopped);
    }

    fn finish_allocation(&mut self) {
        let piece_count = self.info.as_ref().map(|i| i.piece_count() as usize).unwrap_or(0);
        match self.preverified.take() {
            Some(bitfield) if bitfield.len() == piece_count => {
                self.finish_verification(bitfield);
            }
            _ => {
                let (Some(files), Some(info)) = (self.files.clone(), self.info.clone()) else {
                    return;
                };
                self.lifecycle = Lifecycle::Verifying;
                self.emit(TorrentEvent::Verifying);
                check::spawn_verifier(files, info, self.msg_tx.clone(), self.shutdown_tx.subscribe());
            }
        }
    }

    fn finish_verification(&mut self, bitfield: Bitfield) {
        let Some(info) = self.info.clone() else {
            return;
        };
        self.bitfield = bitfield;
        self.have_bytes = (0..info.piece_count())
            .filter(|&i| self.bitfield.test(i as usize))
            .map(|i| info.piece_size(i) as u64)
            .sum();
        self.picker = PiecePicker::new(&self.bitfield, self.cfg.endgame_threshold);
        if let Some(files) = &self.files {
            self.reader = Some(Arc::new(PieceReader::new(
                files.clone(),
                info.piece_length as u64,
                self.cfg.piece_cache_pieces,
            )));
        }

        // Magnet flow: peers connected before we knew the piece count.
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.materialize_peer_bitfield(addr, &info);
        }

        self.lifecycle = Lifecycle::Running;
        self.emit(TorrentEvent::Running);
        self.resume_dirty = true;
        self.publish_announce(self.last_announce_event);
        self.check_completion();
        self.maintenance();
    }

    /// Applies deferred bitfield traffic, grants allowed-fast pieces and
    /// advertises what we already have to a peer that connected before
    /// the info dictionary was known.
    fn materialize_peer_bitfield(&mut self, addr: SocketAddr, info: &Info) {
        let piece_count = info.piece_count();
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        let mut bitfield = Bitfield::new(piece_count as usize);
        if peer.pending_have_all {
            bitfield.set_all();
        } else if let Some(bytes) = peer.pending_bitfield.take() {
            match Bitfield::from_bytes(bytes, piece_count as usize) {
                Ok(bf) => bitfield = bf,
                Err(violation) => {
                    let reason = violation.to_string();
                    self.close_peer(addr, &reason);
                    return;
                }
            }
        }
        for index in peer.pending_haves.drain(..) {
            if (index as usize) < bitfield.len() {
                bitfield.set(index as usize);
            }
        }
        peer.pending_have_all = false;
        peer.bitfield = bitfield;

        let fast = self.peers.get(&addr).map(|p| p.extensions.fast).unwrap_or(false);
        let grants = if fast {
            self.grant_allowed_fast(addr, piece_count)
        } else {
            Vec::new()
        };
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        for index in grants {
            let _ = peer.tx.try_send(SessionCommand::Send(Message::AllowedFast(index)));
        }
        for index in 0..piece_count {
            if self.bitfield.test(index as usize) {
                let _ = peer.tx.try_send(SessionCommand::Send(Message::Have(index)));
            }
        }

        let contribution = self.peers.get(&addr).map(|p| p.bitfield.clone());
        if let Some(bf) = contribution {
            self.picker.add_bitfield(&bf);
        }
        self.update_interest(addr);
    }

    /// The fetched info dictionary validated against the info-hash; leave
    /// metadata-only mode and bring the disk online.
    fn resolve_metadata(&mut self, raw: Vec<u8>, info: Info) {
        event!(Level::INFO, info_hash = %self.info_hash, name = %info.name, "Metadata resolved");
        self.bitfield = Bitfield::new(info.piece_count() as usize);
        let files = Arc::new(FileMap::from_info(&self.download_dir, &info));
        self.files = Some(files.clone());
        self.info_bytes = Some(raw);
        self.info = Some(info);
        self.emit(TorrentEvent::MetadataResolved);
        self.resume_dirty = true;

        self.lifecycle = Lifecycle::Allocating;
        self.emit(TorrentEvent::Allocating);
        check::spawn_allocator(files, self.msg_tx.clone(), self.shutdown_tx.subscribe());
    }

    // -----------------------------------------------------------------
    // Message dispatch
    // -----------------------------------------------------------------

    fn handle_message(&mut self, message: EngineMessage) -> Result<(), TorrentError> {
        match message {
            EngineMessage::Peer(addr, session_event) => {
                event!(Level::TRACE, peer = %addr, event = ?SessionEventSummary(&session_event));
                self.handle_peer_event(addr, session_event);
            }
            EngineMessage::Handshaked(outcome) => self.on_handshaked(outcome),
            EngineMessage::HandshakeFailed { addr, outgoing } => {
                if outgoing {
                    self.dialing = self.dialing.saturating_sub(1);
                    self.record_dial_failure(addr);
                }
            }
            EngineMessage::AllocationProgress { allocated } => {
                self.emit(TorrentEvent::AllocationProgress { allocated });
            }
            EngineMessage::Allocated { result } => match result {
                Ok(_) if self.lifecycle == Lifecycle::Allocating => self.finish_allocation(),
                Ok(_) => {}
                Err(e) => return Err(self.fatal(TorrentError::AllocationFailed(e))),
            },
            EngineMessage::VerifyProgress { checked } => {
                self.emit(TorrentEvent::VerifyProgress { checked });
            }
            EngineMessage::Verified { result } => match result {
                Ok(bitfield) if self.lifecycle == Lifecycle::Verifying => {
                    self.finish_verification(bitfield);
                }
                Ok(_) => {}
                Err(e) => return Err(self.fatal(TorrentError::VerificationFailed(e))),
            },
            EngineMessage::PieceHashed { addr, piece_index, data } => {
                self.on_piece_hashed(addr, piece_index, data);
            }
            EngineMessage::PieceWritten { piece_index, result } => match result {
                Ok(()) => self.on_piece_written(piece_index),
                Err(e) => return Err(self.fatal(TorrentError::WriteFailed(e))),
            },
        }
        Ok(())
    }

    fn handle_peer_event(&mut self, addr: SocketAddr, session_event: SessionEvent) {
        match session_event {
            SessionEvent::Disconnected => self.cleanup_peer(addr),
            SessionEvent::Snubbed => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.snubbed = true;
                }
                if let Some(dl) = self.downloaders.get(&addr) {
                    self.picker.set_snubbed(addr, dl.piece_index());
                }
            }
            SessionEvent::BlockSent { length } => {
                self.stats.uploaded += length as u64;
                self.stats.uploaded_tick += length as u64;
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.bytes_uploaded_in_period += length as u64;
                    peer.uploaded_tick += length as u64;
                }
                self.resume_dirty = true;
            }
            SessionEvent::Message(message) => self.handle_wire_message(addr, message),
        }
    }

    fn handle_wire_message(&mut self, addr: SocketAddr, message: Message) {
        if !self.peers.contains_key(&addr) {
            return;
        }
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_choking = true;
                }
                if let Some(dl) = self.downloaders.get_mut(&addr) {
                    dl.on_choke();
                }
            }
            Message::Unchoke => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_choking = false;
                }
                if let Some(dl) = self.downloaders.get_mut(&addr) {
                    dl.on_unchoke();
                }
                self.send_requests(addr);
            }
            Message::Interested => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_interested = true;
                }
            }
            Message::NotInterested => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.peer_interested = false;
                }
            }
            Message::Have(index) => self.on_have(addr, index),
            Message::Bitfield(bytes) => self.on_bitfield(addr, bytes),
            Message::HaveAll => {
                if !self.require_fast(addr, "HaveAll") {
                    return;
                }
                self.on_have_all(addr);
            }
            Message::HaveNone => {
                if !self.require_fast(addr, "HaveNone") {
                    return;
                }
                self.on_have_none(addr);
            }
            Message::AllowedFast(index) => {
                if !self.require_fast(addr, "AllowedFast") {
                    return;
                }
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.allowed_fast_in.insert(index);
                }
            }
            Message::SuggestPiece(index) => {
                if !self.require_fast(addr, "SuggestPiece") {
                    return;
                }
                event!(Level::TRACE, peer = %addr, index, "Ignoring SuggestPiece");
            }
            Message::Request(index, begin, length) => {
                self.on_request(addr, BlockInfo { piece_index: index, offset: begin, length });
            }
            Message::Cancel(index, begin, length) => {
                if let Some(peer) = self.peers.get(&addr) {
                    let block = BlockInfo { piece_index: index, offset: begin, length };
                    let _ = peer.tx.try_send(SessionCommand::CancelServe { block });
                }
            }
            Message::Piece(index, begin, data) => self.on_block(addr, index, begin, data),
            Message::RejectRequest(index, begin, length) => {
                if !self.require_fast(addr, "RejectRequest") {
                    return;
                }
                self.on_reject(addr, index, begin, length);
            }
            Message::Port(port) => {
                event!(Level::TRACE, peer = %addr, port, "Ignoring DHT port");
            }
            Message::Extended(id, payload) => self.on_extended(addr, id, payload),
        }
    }

    fn require_fast(&mut self, addr: SocketAddr, what: &str) -> bool {
        let fast = self.peers.get(&addr).map(|p| p.extensions.fast).unwrap_or(false);
        if !fast {
            self.close_peer(addr, &format!("{} without fast extension", what));
        }
        fast
    }

    fn on_have(&mut self, addr: SocketAddr, index: u32) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        if self.info.is_none() {
            peer.pending_haves.push(index);
            return;
        }
        if (index as usize) >= peer.bitfield.len() {
            self.close_peer(addr, "Have index out of range");
            return;
        }
        if !peer.bitfield.test(index as usize) {
            peer.bitfield.set(index as usize);
            self.picker.add_have(index);
        }
        self.update_interest(addr);
    }

    fn on_bitfield(&mut self, addr: SocketAddr, bytes: Vec<u8>) {
        let piece_count = match &self.info {
            Some(info) => info.piece_count() as usize,
            None => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.pending_bitfield = Some(bytes);
                }
                return;
            }
        };
        match Bitfield::from_bytes(bytes, piece_count) {
            Ok(bitfield) => {
                let Some(peer) = self.peers.get_mut(&addr) else {
                    return;
                };
                let old = std::mem::replace(&mut peer.bitfield, bitfield);
                let new = peer.bitfield.clone();
                self.picker.remove_bitfield(&old);
                self.picker.add_bitfield(&new);
                self.update_interest(addr);
            }
            Err(violation) => {
                let reason = violation.to_string();
                self.close_peer(addr, &reason);
            }
        }
    }

    fn on_have_all(&mut self, addr: SocketAddr) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        if self.info.is_none() {
            peer.pending_have_all = true;
            return;
        }
        let old = std::mem::replace(&mut peer.bitfield, Bitfield::full(self.bitfield.len()));
        let new = peer.bitfield.clone();
        self.picker.remove_bitfield(&old);
        self.picker.add_bitfield(&new);
        self.update_interest(addr);
    }

    fn on_have_none(&mut self, addr: SocketAddr) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        if self.info.is_none() {
            peer.pending_have_all = false;
            peer.pending_bitfield = None;
            peer.pending_haves.clear();
            return;
        }
        let old = std::mem::replace(&mut peer.bitfield, Bitfield::new(self.bitfield.len()));
        self.picker.remove_bitfield(&old);
        self.update_interest(addr);
    }

    fn on_request(&mut self, addr: SocketAddr, block: BlockInfo) {
        if block.length > MAX_REQUEST_LENGTH {
            let reason = format!("request length {} too large", block.length);
            self.close_peer(addr, &reason);
            return;
        }
        let Some(info) = &self.info else {
            return;
        };
        let piece_ok = (block.piece_index < info.piece_count())
            && self.bitfield.test(block.piece_index as usize)
            && block.offset as u64 + block.length as u64
                <= info.piece_size(block.piece_index) as u64;

        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        let fast = peer.extensions.fast;

        if !piece_ok {
            if fast {
                let _ = peer.tx.try_send(SessionCommand::Send(Message::RejectRequest(
                    block.piece_index,
                    block.offset,
                    block.length,
                )));
            }
            return;
        }

        if peer.am_choking {
            // Allowed-fast pieces stay requestable while choked.
            if !(fast && peer.allowed_fast_sent.contains(&block.piece_index)) {
                if fast {
                    let _ = peer.tx.try_send(SessionCommand::Send(Message::RejectRequest(
                        block.piece_index,
                        block.offset,
                        block.length,
                    )));
                }
                return;
            }
        }

        let Some(reader) = self.reader.clone() else {
            return;
        };
        let _ = peer.tx.try_send(SessionCommand::ServeBlock { block, reader });
    }

    fn on_block(&mut self, addr: SocketAddr, piece_index: u32, offset: u32, data: Vec<u8>) {
        let length = data.len() as u64;
        self.stats.downloaded += length;
        self.stats.downloaded_tick += length;
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.bytes_downloaded_in_period += length;
            peer.downloaded_tick += length;
            peer.snubbed = false;
        }

        let Some(dl) = self.downloaders.get_mut(&addr) else {
            self.stats.wasted += length;
            return;
        };
        if dl.piece_index() != piece_index {
            self.stats.wasted += length;
            return;
        }
        match dl.on_block(offset, data) {
            Err(violation) => {
                let reason = violation.to_string();
                self.close_peer(addr, &reason);
            }
            Ok(BlockOutcome::Duplicate) => self.stats.wasted += length,
            Ok(BlockOutcome::Progress) => self.send_requests(addr),
            Ok(BlockOutcome::Completed(buffer)) => {
                self.on_piece_assembled(addr, piece_index, buffer);
            }
        }
    }

    fn on_reject(&mut self, addr: SocketAddr, index: u32, begin: u32, _length: u32) {
        if let Some(peer) = self.peers.get_mut(&addr) {
            if peer.tolerated_rejects.remove(&(index, begin)) {
                return;
            }
        }
        let Some(dl) = self.downloaders.get_mut(&addr) else {
            self.close_peer(addr, "reject for block we never requested");
            return;
        };
        if dl.piece_index() != index {
            self.close_peer(addr, "reject for block we never requested");
            return;
        }
        match dl.on_reject(begin) {
            Ok(()) => self.send_requests(addr),
            Err(violation) => {
                let reason = violation.to_string();
                self.close_peer(addr, &reason);
            }
        }
    }

    /// All blocks of a piece arrived from `addr`: cancel endgame rivals
    /// and hash the buffer off the event loop.
    fn on_piece_assembled(&mut self, addr: SocketAddr, piece_index: u32, buffer: Vec<u8>) {
        self.downloaders.remove(&addr);

        for rival in self.picker.claimants(piece_index) {
            if rival == addr {
                continue;
            }
            let same_piece = self
                .downloaders
                .get(&rival)
                .map(|dl| dl.piece_index() == piece_index)
                .unwrap_or(false);
            if !same_piece {
                continue;
            }
            let outstanding = self
                .downloaders
                .remove(&rival)
                .map(|dl| dl.outstanding())
                .unwrap_or_default();
            if let Some(peer) = self.peers.get_mut(&rival) {
                for block in outstanding {
                    peer.tolerated_rejects.insert((block.piece_index, block.offset));
                    let _ = peer.tx.try_send(SessionCommand::Send(Message::Cancel(
                        block.piece_index,
                        block.offset,
                        block.length,
                    )));
                }
            }
            self.picker.release(piece_index, rival);
        }

        let Some(info) = &self.info else {
            return;
        };
        let expected = info.piece_hash(piece_index).map(<[u8]>::to_vec);
        let tx = self.msg_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let verification = tokio::task::spawn_blocking(move || match expected {
                Some(hash) if Sha1::digest(&buffer)[..] == hash[..] => Some(buffer),
                _ => None,
            });
            let data = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return,
                res = verification => res.unwrap_or(None),
            };
            let _ = tx.send(EngineMessage::PieceHashed { addr, piece_index, data }).await;
        });
    }

    fn on_piece_hashed(&mut self, addr: SocketAddr, piece_index: u32, data: Option<Vec<u8>>) {
        let piece_size = self
            .info
            .as_ref()
            .map(|i| i.piece_size(piece_index) as u64)
            .unwrap_or(0);
        match data {
            None => {
                // The peer that supplied the final block gets the blame.
                self.stats.wasted += piece_size;
                self.picker.release(piece_index, addr);
                self.close_peer(addr, "piece hash mismatch");
            }
            Some(data) => {
                let redundant = self.bitfield.test(piece_index as usize)
                    || self.writing == Some(piece_index)
                    || self.pending_writes.iter().any(|(i, _)| *i == piece_index);
                if redundant {
                    self.stats.wasted += piece_size;
                    self.picker.release(piece_index, addr);
                    return;
                }
                if self.writing.is_none() {
                    self.begin_write(piece_index, data);
                } else {
                    self.pending_writes.push_back((piece_index, data));
                }
            }
        }
    }

    fn begin_write(&mut self, piece_index: u32, data: Vec<u8>) {
        let (Some(files), Some(info)) = (self.files.clone(), self.info.as_ref()) else {
            return;
        };
        self.writing = Some(piece_index);
        let offset = piece_index as u64 * info.piece_length as u64;
        let reader = self.reader.clone();
        let tx = self.msg_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let write = async {
                write_range(&files, offset, &data).await?;
                if let Some(reader) = reader {
                    reader.insert(piece_index, Arc::new(data)).await;
                }
                Ok(())
            };
            let result = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return,
                res = write => res,
            };
            let _ = tx.send(EngineMessage::PieceWritten { piece_index, result }).await;
        });
    }

    fn on_piece_written(&mut self, piece_index: u32) {
        self.writing = None;

        if !self.bitfield.test(piece_index as usize) {
            self.bitfield.set(piece_index as usize);
            if let Some(info) = &self.info {
                self.have_bytes += info.piece_size(piece_index) as u64;
            }
            self.picker.mark_have(piece_index);
            self.resume_dirty = true;
            self.emit(TorrentEvent::PieceCompleted { piece_index });

            let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
            for addr in addrs {
                let lacks_piece = self
                    .peers
                    .get(&addr)
                    .map(|p| !p.bitfield.test(piece_index as usize))
                    .unwrap_or(false);
                if lacks_piece {
                    if let Some(peer) = self.peers.get(&addr) {
                        let _ = peer.tx.try_send(SessionCommand::Send(Message::Have(piece_index)));
                    }
                }
                self.update_interest(addr);
            }
        }

        if let Some((next_index, data)) = self.pending_writes.pop_front() {
            self.begin_write(next_index, data);
        }
        self.publish_announce(self.last_announce_event);
        self.check_completion();
    }

    fn check_completion(&mut self) {
        if self.completed
            || self.info.is_none()
            || self.bitfield.is_empty()
            || !self.bitfield.is_complete()
        {
            return;
        }
        self.completed = true;
        event!(Level::INFO, info_hash = %self.info_hash, "Download complete, seeding");

        let active: Vec<SocketAddr> = self.downloaders.keys().copied().collect();
        for addr in active {
            if let Some(dl) = self.downloaders.remove(&addr) {
                let piece_index = dl.piece_index();
                if let Some(peer) = self.peers.get_mut(&addr) {
                    for block in dl.outstanding() {
                        peer.tolerated_rejects.insert((block.piece_index, block.offset));
                        let _ = peer.tx.try_send(SessionCommand::Send(Message::Cancel(
                            block.piece_index,
                            block.offset,
                            block.length,
                        )));
                    }
                }
                self.picker.release(piece_index, addr);
            }
        }
        self.addrs.clear();

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            let drop_peer = self
                .peers
                .get(&addr)
                .map(|p| !p.peer_interested || p.bitfield.is_complete())
                .unwrap_or(false);
            if drop_peer {
                if let Some(peer) = self.peers.get(&addr) {
                    let _ = peer.tx.try_send(SessionCommand::Disconnect);
                }
            } else {
                self.update_interest(addr);
            }
        }

        self.publish_announce(AnnounceEvent::Completed);
        self.flush_resume(true);
        self.emit(TorrentEvent::Completed);
    }

    // -----------------------------------------------------------------
    // Extended protocol (BEP 10 / 9 / 11)
    // -----------------------------------------------------------------

    fn on_extended(&mut self, addr: SocketAddr, id: u8, payload: Vec<u8>) {
        if id == LocalExtensionId::Handshake.id() {
            self.on_extended_handshake(addr, &payload);
        } else if id == LocalExtensionId::UtMetadata.id() {
            self.on_ut_metadata(addr, &payload);
        } else if id == LocalExtensionId::UtPex.id() {
            self.on_ut_pex(addr, &payload);
        } else {
            event!(Level::TRACE, peer = %addr, id, "Unknown extended message");
        }
    }

    fn on_extended_handshake(&mut self, addr: SocketAddr, payload: &[u8]) {
        let Ok(hs) = serde_bencode::from_bytes::<crate::peer::protocol::ExtendedHandshake>(payload)
        else {
            event!(Level::DEBUG, peer = %addr, "Malformed extended handshake");
            return;
        };
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        // Repeat handshakes mid-session are ignored; the first one wins.
        if peer.ext.is_some() {
            return;
        }
        peer.ext = Some(PeerExtendedState {
            ut_metadata: hs.ut_metadata(),
            ut_pex: hs.ut_pex(),
            metadata_size: hs.metadata_size,
        });
    }

    fn on_ut_metadata(&mut self, addr: SocketAddr, payload: &[u8]) {
        let (header, trailing) = match crate::peer::protocol::split_metadata_payload(payload) {
            Ok(parts) => parts,
            Err(e) => {
                let reason = format!("malformed ut_metadata message: {}", e);
                self.close_peer(addr, &reason);
                return;
            }
        };
        match header.msg_type {
            METADATA_MSG_REQUEST => self.on_metadata_request(addr, header.piece),
            METADATA_MSG_DATA => self.on_metadata_data(addr, header.piece, trailing),
            METADATA_MSG_REJECT => {
                if self.info_downloader.as_ref().map(|dl| dl.peer()) == Some(addr) {
                    self.info_downloader = None;
                    self.metadata_failed.insert(addr);
                }
            }
            other => {
                event!(Level::TRACE, peer = %addr, msg_type = other, "Unknown ut_metadata type");
            }
        }
    }

    fn on_metadata_request(&mut self, addr: SocketAddr, piece: u32) {
        let Some(remote_id) = self
            .peers
            .get(&addr)
            .and_then(|p| p.ext.as_ref())
            .and_then(|e| e.ut_metadata)
        else {
            return;
        };
        let reply = match &self.info_bytes {
            Some(bytes) if (piece as u64 * BLOCK_SIZE as u64) < bytes.len() as u64 => {
                let begin = (piece * BLOCK_SIZE) as usize;
                let end = std::cmp::min(begin + BLOCK_SIZE as usize, bytes.len());
                let header = MetadataMessage {
                    msg_type: METADATA_MSG_DATA,
                    piece,
                    total_size: Some(bytes.len() as i64),
                };
                match serde_bencode::to_bytes(&header) {
                    Ok(mut payload) => {
                        payload.extend_from_slice(&bytes[begin..end]);
                        Some(payload)
                    }
                    Err(_) => None,
                }
            }
            _ => {
                let header = MetadataMessage {
                    msg_type: METADATA_MSG_REJECT,
                    piece,
                    total_size: None,
                };
                serde_bencode::to_bytes(&header).ok()
            }
        };
        if let (Some(payload), Some(peer)) = (reply, self.peers.get(&addr)) {
            let _ = peer
                .tx
                .try_send(SessionCommand::Send(Message::Extended(remote_id, payload)));
        }
    }

    fn on_metadata_data(&mut self, addr: SocketAddr, piece: u32, trailing: &[u8]) {
        let Some(mut dl) = self.info_downloader.take() else {
            return;
        };
        if dl.peer() != addr {
            self.info_downloader = Some(dl);
            return;
        }
        if let Err(violation) = dl.on_block(piece, trailing) {
            self.metadata_failed.insert(addr);
            let reason = violation.to_string();
            self.close_peer(addr, &reason);
            return;
        }
        if !dl.done() {
            let remote_id = dl.ut_metadata_id();
            let indices = dl.request_blocks(METADATA_QUEUE_LENGTH);
            self.info_downloader = Some(dl);
            self.send_metadata_requests(addr, remote_id, indices);
            return;
        }

        let bytes = dl.into_bytes();
        if InfoHash::of_info_dict(&bytes) != self.info_hash {
            self.metadata_failed.insert(addr);
            self.close_peer(addr, "downloaded metadata does not hash to the info-hash");
            return;
        }
        match metainfo::info_from_bytes(&bytes) {
            Ok(info) => self.resolve_metadata(bytes, info),
            Err(e) => {
                self.metadata_failed.insert(addr);
                let reason = format!("metadata does not parse: {}", e);
                self.close_peer(addr, &reason);
            }
        }
    }

    fn on_ut_pex(&mut self, addr: SocketAddr, payload: &[u8]) {
        if !self.cfg.pex_enabled || self.info.as_ref().map(Info::is_private).unwrap_or(false) {
            return;
        }
        let Ok(pex) = serde_bencode::from_bytes::<PexMessage>(payload) else {
            event!(Level::DEBUG, peer = %addr, "Malformed ut_pex message");
            return;
        };
        let addrs: Vec<SocketAddr> = compact_to_addrs(&pex.added)
            .into_iter()
            .map(SocketAddr::V4)
            .collect();
        if !addrs.is_empty() {
            self.addrs.push_batch(PeerSource::Pex, addrs);
        }
    }

    fn send_metadata_requests(&mut self, addr: SocketAddr, remote_id: u8, indices: Vec<u32>) {
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        for index in indices {
            let header = MetadataMessage {
                msg_type: METADATA_MSG_REQUEST,
                piece: index,
                total_size: None,
            };
            if let Ok(payload) = serde_bencode::to_bytes(&header) {
                let _ = peer
                    .tx
                    .try_send(SessionCommand::Send(Message::Extended(remote_id, payload)));
            }
        }
    }

    // -----------------------------------------------------------------
    // Peer admission and teardown
    // -----------------------------------------------------------------

    fn accept_incoming(&mut self, stream: TcpStream) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        let Ok(remote) = stream.peer_addr() else {
            return;
        };
        let incoming_count = self.peers.values().filter(|p| p.incoming).count();
        if incoming_count >= self.cfg.max_peer_accept {
            event!(Level::DEBUG, peer = %remote, "Over incoming peer budget, dropping");
            return;
        }
        if let Some(blocklist) = &self.blocklist {
            if blocklist.contains(&remote.ip()) {
                event!(Level::DEBUG, peer = %remote, "Blocklisted, dropping");
                return;
            }
        }
        if self.connected_ips.contains(&remote.ip()) {
            event!(Level::DEBUG, peer = %remote, "Duplicate IP, dropping");
            return;
        }
        handshake::spawn_incoming(stream, self.handshaker_params());
    }

    fn handshaker_params(&self) -> HandshakerParams {
        HandshakerParams {
            info_hash: self.info_hash,
            local_peer_id: self.local_peer_id,
            local_extensions: Extensions {
                fast: true,
                ltep: true,
                dht: self.cfg.dht_enabled,
            },
            connect_timeout: self.cfg.peer_connect_timeout(),
            handshake_timeout: self.cfg.peer_handshake_timeout(),
            engine_tx: self.msg_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        }
    }

    fn on_handshaked(&mut self, outcome: HandshakeOutcome) {
        if !outcome.incoming {
            self.dialing = self.dialing.saturating_sub(1);
            self.dial_backoff.remove(&outcome.addr);
        }
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        if outcome.peer_id == self.local_peer_id {
            event!(Level::DEBUG, peer = %outcome.addr, "Connected to ourselves, dropping");
            return;
        }
        if self.peer_ids.contains(&outcome.peer_id) || self.connected_ips.contains(&outcome.addr.ip())
        {
            event!(Level::DEBUG, peer = %outcome.addr, "Already connected, dropping");
            return;
        }

        let piece_count = self.info.as_ref().map(|i| i.piece_count() as usize).unwrap_or(0);
        let (command_tx, command_rx) = mpsc::channel::<SessionCommand>(PEER_COMMAND_QUEUE);
        let peer = PeerState::new(
            outcome.addr,
            outcome.peer_id,
            command_tx,
            outcome.incoming,
            outcome.extensions,
            piece_count,
        );
        self.peers.insert(outcome.addr, peer);
        self.peer_ids.insert(outcome.peer_id);
        self.connected_ips.insert(outcome.addr.ip());

        let session = PeerSession::new(PeerSessionParams {
            addr: outcome.addr,
            engine_tx: self.msg_tx.clone(),
            command_rx,
            piece_timeout: self.cfg.piece_timeout(),
            request_ttl: self.cfg.request_timeout(),
            read_buffer_size: self.cfg.peer_read_buffer_size,
            shutdown_tx: self.shutdown_tx.clone(),
        });
        tokio::spawn(session.run(outcome.stream));

        self.send_initial_messages(outcome.addr, outcome.extensions);
        event!(
            Level::DEBUG,
            peer = %outcome.addr,
            incoming = outcome.incoming,
            fast = outcome.extensions.fast,
            ltep = outcome.extensions.ltep,
            "Peer registered"
        );
    }

    fn send_initial_messages(&mut self, addr: SocketAddr, extensions: Extensions) {
        if extensions.ltep {
            let metadata_size = self.info_bytes.as_ref().map(|b| b.len() as i64);
            if let Ok(payload) = extended_handshake_payload(metadata_size) {
                if let Some(peer) = self.peers.get(&addr) {
                    let _ = peer.tx.try_send(SessionCommand::Send(Message::Extended(
                        LocalExtensionId::Handshake.id(),
                        payload,
                    )));
                }
            }
        }

        match &self.info {
            Some(info) if !self.bitfield.is_empty() => {
                let ones = self.bitfield.count_ones();
                let initial = if extensions.fast && ones == self.bitfield.len() {
                    Some(Message::HaveAll)
                } else if extensions.fast && ones == 0 {
                    Some(Message::HaveNone)
                } else if ones > 0 {
                    Some(Message::Bitfield(self.bitfield.to_vec()))
                } else {
                    None
                };
                if let (Some(message), Some(peer)) = (initial, self.peers.get(&addr)) {
                    let _ = peer.tx.try_send(SessionCommand::Send(message));
                }
                if extensions.fast {
                    let piece_count = info.piece_count();
                    let grants = self.grant_allowed_fast(addr, piece_count);
                    if let Some(peer) = self.peers.get(&addr) {
                        for index in grants {
                            let _ = peer
                                .tx
                                .try_send(SessionCommand::Send(Message::AllowedFast(index)));
                        }
                    }
                }
            }
            _ => {
                // No metadata yet (magnet): nothing to advertise.
                if extensions.fast {
                    if let Some(peer) = self.peers.get(&addr) {
                        let _ = peer.tx.try_send(SessionCommand::Send(Message::HaveNone));
                    }
                }
            }
        }
    }

    /// Computes, records and returns the peer's allowed-fast grant.
    fn grant_allowed_fast(&mut self, addr: SocketAddr, piece_count: u32) -> Vec<u32> {
        let IpAddr::V4(ip) = addr.ip() else {
            return Vec::new();
        };
        let grants = allowed_fast_set(ip, &self.info_hash, piece_count, ALLOWED_FAST_GRANTS);
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.allowed_fast_sent = grants.iter().copied().collect();
        }
        grants
    }

    fn cleanup_peer(&mut self, addr: SocketAddr) {
        let Some(peer) = self.peers.remove(&addr) else {
            return;
        };
        self.peer_ids.remove(&peer.peer_id);
        self.connected_ips.remove(&addr.ip());
        self.picker.peer_disconnected(addr, &peer.bitfield);
        self.downloaders.remove(&addr);
        if self.info_downloader.as_ref().map(|dl| dl.peer()) == Some(addr) {
            self.info_downloader = None;
        }
        event!(Level::DEBUG, peer = %addr, "Peer removed");
    }

    /// Protocol violations and hash failures end the connection; cleanup
    /// happens when the session reports back `Disconnected`.
    fn close_peer(&mut self, addr: SocketAddr, reason: &str) {
        event!(Level::WARN, peer = %addr, reason, "Closing peer");
        if let Some(peer) = self.peers.get(&addr) {
            let _ = peer.tx.try_send(SessionCommand::Disconnect);
        }
    }

    fn record_dial_failure(&mut self, addr: SocketAddr) {
        let failures = self.dial_backoff.get(&addr).map(|(n, _)| *n).unwrap_or(0) + 1;
        let cooldown = (DIAL_BASE_COOLDOWN_SECS * 2u64.pow(failures.min(DIAL_MAX_FAILURES) - 1))
            .min(DIAL_MAX_COOLDOWN_SECS);
        self.dial_backoff
            .insert(addr, (failures, Instant::now() + Duration::from_secs(cooldown)));
        event!(Level::DEBUG, peer = %addr, failures, cooldown_secs = cooldown, "Dial backoff");
    }

    // -----------------------------------------------------------------
    // Maintenance passes
    // -----------------------------------------------------------------

    fn maintenance(&mut self) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        self.dial_addresses();
        self.start_info_downloader();
        self.start_piece_downloaders();
        self.check_completion();
    }

    fn dial_addresses(&mut self) {
        if self.completed {
            return;
        }
        let outgoing = self.peers.values().filter(|p| !p.incoming).count();
        let mut budget = self
            .cfg
            .max_peer_dial
            .saturating_sub(outgoing + self.dialing);
        while budget > 0 {
            let Some(addr) = self.addrs.pop() else {
                break;
            };
            if self.connected_ips.contains(&addr.ip()) || self.peers.contains_key(&addr) {
                continue;
            }
            if let Some((_, until)) = self.dial_backoff.get(&addr) {
                if Instant::now() < *until {
                    continue;
                }
            }
            if let Some(blocklist) = &self.blocklist {
                if blocklist.contains(&addr.ip()) {
                    continue;
                }
            }
            self.dialing += 1;
            budget -= 1;
            handshake::spawn_outgoing(addr, self.handshaker_params());
        }
    }

    fn start_info_downloader(&mut self) {
        if self.info.is_some() || self.info_downloader.is_some() {
            return;
        }
        let candidate = self.peers.values().find_map(|peer| {
            if self.metadata_failed.contains(&peer.addr) {
                return None;
            }
            let ext = peer.ext.as_ref()?;
            let remote_id = ext.ut_metadata?;
            let size = ext.metadata_size?;
            Some((peer.addr, remote_id, size))
        });
        let Some((addr, remote_id, size)) = candidate else {
            return;
        };
        match InfoDownloader::new(addr, remote_id, size) {
            Ok(mut dl) => {
                let indices = dl.request_blocks(METADATA_QUEUE_LENGTH);
                self.info_downloader = Some(dl);
                self.send_metadata_requests(addr, remote_id, indices);
                event!(Level::DEBUG, peer = %addr, size, "Fetching metadata");
            }
            Err(violation) => {
                self.metadata_failed.insert(addr);
                let reason = violation.to_string();
                self.close_peer(addr, &reason);
            }
        }
    }

    fn start_piece_downloaders(&mut self) {
        if self.info.is_none() || self.completed || self.bitfield.is_empty() {
            return;
        }
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            if self.downloaders.contains_key(&addr) {
                continue;
            }
            let picked = {
                let Some(peer) = self.peers.get(&addr) else {
                    continue;
                };
                let ctx = PickContext {
                    addr,
                    bitfield: &peer.bitfield,
                    peer_choking: peer.peer_choking,
                    allowed_fast: &peer.allowed_fast_in,
                };
                self.picker.pick(&self.bitfield, &ctx)
            };
            let Some(piece_index) = picked else {
                continue;
            };
            let Some(info) = &self.info else {
                return;
            };
            let piece_size = info.piece_size(piece_index);
            let Some(peer) = self.peers.get_mut(&addr) else {
                continue;
            };
            let allowed_fast = peer.allowed_fast_in.contains(&piece_index);
            let dl = PieceDownloader::new(piece_index, piece_size, allowed_fast, peer.peer_choking);
            peer.tolerated_rejects.clear();
            if !peer.am_interested {
                peer.am_interested = true;
                let _ = peer.tx.try_send(SessionCommand::Send(Message::Interested));
            }
            self.picker.claim(piece_index, addr);
            self.downloaders.insert(addr, dl);
            self.send_requests(addr);
        }
    }

    fn send_requests(&mut self, addr: SocketAddr) {
        let Some(dl) = self.downloaders.get_mut(&addr) else {
            return;
        };
        let requests = dl.next_requests();
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        for block in requests {
            let _ = peer.tx.try_send(SessionCommand::Send(Message::Request(
                block.piece_index,
                block.offset,
                block.length,
            )));
        }
    }

    fn update_interest(&mut self, addr: SocketAddr) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        let wanted = !self.completed
            && self.info.is_some()
            && self.bitfield.peer_has_missing(&peer.bitfield);
        if wanted != peer.am_interested {
            peer.am_interested = wanted;
            let message = if wanted {
                Message::Interested
            } else {
                Message::NotInterested
            };
            let _ = peer.tx.try_send(SessionCommand::Send(message));
        }
    }

    // -----------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------

    fn on_speed_tick(&mut self) {
        self.stats.tick(SPEED_TICK.as_millis() as u64);
        for peer in self.peers.values_mut() {
            peer.tick(SPEED_TICK.as_millis() as u64);
        }
        if self.completed && self.lifecycle == Lifecycle::Running {
            self.stats.seeded_for += SPEED_TICK;
            self.resume_dirty = true;
        }
        let now = Instant::now();
        self.dial_backoff
            .retain(|_, (failures, until)| *failures < DIAL_MAX_FAILURES || now < *until);
        self.publish_announce(self.last_announce_event);
    }

    fn on_regular_unchoke(&mut self) {
        let changes = self.choker.regular(&mut self.peers, self.completed);
        for change in changes {
            if let Some(peer) = self.peers.get(&change.addr) {
                let message = if change.unchoke { Message::Unchoke } else { Message::Choke };
                let _ = peer.tx.try_send(SessionCommand::Send(message));
            }
        }
    }

    fn on_optimistic_unchoke(&mut self) {
        let changes = self.choker.optimistic(&mut self.peers);
        for change in changes {
            if let Some(peer) = self.peers.get(&change.addr) {
                let message = if change.unchoke { Message::Unchoke } else { Message::Choke };
                let _ = peer.tx.try_send(SessionCommand::Send(message));
            }
        }
    }

    fn on_pex_tick(&mut self) {
        if !self.cfg.pex_enabled
            || self.info.as_ref().map(Info::is_private).unwrap_or(false)
            || self.peers.len() < 2
        {
            return;
        }
        let connected: Vec<std::net::SocketAddrV4> = self
            .peers
            .keys()
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(*v4),
                SocketAddr::V6(_) => None,
            })
            .collect();

        for peer in self.peers.values() {
            let Some(pex_id) = peer.ext.as_ref().and_then(|e| e.ut_pex) else {
                continue;
            };
            let compact = addrs_to_compact(
                connected
                    .iter()
                    .filter(|v4| SocketAddr::V4(**v4) != peer.addr),
            );
            if compact.is_empty() {
                continue;
            }
            let pex = PexMessage {
                added: compact,
                ..Default::default()
            };
            if let Ok(payload) = serde_bencode::to_bytes(&pex) {
                let _ = peer
                    .tx
                    .try_send(SessionCommand::Send(Message::Extended(pex_id, payload)));
            }
        }
    }

    // -----------------------------------------------------------------
    // Resume and announce
    // -----------------------------------------------------------------

    fn flush_resume(&mut self, immediate: bool) {
        let Some(resumer) = self.resumer.clone() else {
            return;
        };
        if !self.resume_dirty && !immediate {
            return;
        }
        self.resume_dirty = false;

        let spec = ResumeSpec {
            info_hash: ByteBuf::from(self.info_hash.as_bytes().to_vec()),
            dest: self.download_dir.to_string_lossy().into_owned(),
            port: self.cfg.port,
            name: self.info.as_ref().map(|i| i.name.clone()).unwrap_or_default(),
            trackers: self.trackers.clone(),
            info: self.info_bytes.as_ref().map(|b| ByteBuf::from(b.clone())),
            bitfield: ByteBuf::from(self.bitfield.to_vec()),
            bytes_downloaded: self.stats.downloaded,
            bytes_uploaded: self.stats.uploaded,
            bytes_wasted: self.stats.wasted,
            seeded_for_secs: self.stats.seeded_for.as_secs(),
            created_at: self.created_at,
            started: self.lifecycle != Lifecycle::Stopped,
        };
        tokio::task::spawn_blocking(move || {
            if let Err(e) = resumer.write(&spec) {
                event!(Level::WARN, error = %e, "Resume write failed");
            }
        });
    }

    fn publish_announce(&mut self, announce_event: AnnounceEvent) {
        let left = self
            .info
            .as_ref()
            .map(|i| i.total_length().saturating_sub(self.have_bytes))
            .unwrap_or(0);
        self.announce_tx.send_replace(AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.local_peer_id,
            port: self.cfg.port,
            uploaded: self.stats.uploaded,
            downloaded: self.stats.downloaded,
            left,
            event: announce_event,
        });
        // Lifecycle events announce once; later snapshots go back to None.
        self.last_announce_event = AnnounceEvent::None;
    }
}
