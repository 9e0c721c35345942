// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub(crate) mod addr_list;
pub(crate) mod choker;
#[allow(clippy::module_inception)]
mod engine;
pub(crate) mod info_downloader;
pub(crate) mod picker;
pub(crate) mod piece_downloader;
pub(crate) mod state;

pub use engine::Engine;

use crate::announce::{AnnounceRequest, PeerSource};
use crate::bitfield::Bitfield;
use crate::command::SessionEvent;
use crate::config::Settings;
use crate::errors::{StorageError, TorrentError};
use crate::metainfo::{InfoHash, Metainfo};
use crate::resume::Resumer;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

/// Everything the engine's event loop multiplexes over, fanned into one
/// channel: peer session events, handshaker results and disk pipeline
/// results.
#[derive(Debug)]
pub enum EngineMessage {
    Peer(SocketAddr, SessionEvent),
    Handshaked(crate::peer::handshake::HandshakeOutcome),
    HandshakeFailed { addr: SocketAddr, outgoing: bool },
    AllocationProgress { allocated: u64 },
    Allocated { result: Result<u64, StorageError> },
    VerifyProgress { checked: u32 },
    Verified { result: Result<Bitfield, StorageError> },
    /// An assembled piece finished hashing. `data` is `None` on mismatch.
    PieceHashed {
        addr: SocketAddr,
        piece_index: u32,
        data: Option<Vec<u8>>,
    },
    PieceWritten {
        piece_index: u32,
        result: Result<(), StorageError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Start,
    Stop,
    Shutdown,
}

#[derive(Debug)]
pub enum TorrentEvent {
    Allocating,
    AllocationProgress { allocated: u64 },
    Verifying,
    VerifyProgress { checked: u32 },
    Running,
    /// Magnet start: the info dictionary arrived and validated.
    MetadataResolved,
    PieceCompleted { piece_index: u32 },
    Completed,
    Stopped,
    Error(TorrentError),
}

pub struct TorrentParameters {
    pub info_hash: InfoHash,
    /// `None` starts from a magnet: metadata is fetched from peers first.
    pub metainfo: Option<Metainfo>,
    pub download_dir: PathBuf,
    pub local_peer_id: [u8; 20],
    pub settings: Arc<Settings>,
    pub resumer: Option<Arc<dyn Resumer>>,
    /// A trusted bitfield from the resume record skips re-hashing.
    pub preverified_bitfield: Option<Bitfield>,
    pub trackers: Vec<String>,
    pub blocklist: Option<HashSet<IpAddr>>,
}

/// The caller's side of a running engine: lifecycle commands, peer address
/// feeds, the acceptor's connection feed, the announce snapshot, and the
/// event stream.
pub struct EngineHandle {
    pub commands: mpsc::Sender<EngineCommand>,
    pub peers: mpsc::Sender<(PeerSource, Vec<SocketAddr>)>,
    pub incoming: mpsc::Sender<TcpStream>,
    pub announce: watch::Receiver<AnnounceRequest>,
    pub events: mpsc::Receiver<TorrentEvent>,
}
