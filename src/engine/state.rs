// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::bitfield::Bitfield;
use crate::command::SessionCommand;
use crate::peer::handshake::Extensions;

use tokio::sync::mpsc::Sender;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

const SPEED_EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Stopped,
    Allocating,
    Verifying,
    Running,
    Stopping,
}

#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub wasted: u64,
    pub seeded_for: Duration,

    pub downloaded_tick: u64,
    pub uploaded_tick: u64,
    pub download_ema: f64,
    pub upload_ema: f64,
}

impl Stats {
    /// Folds the per-tick byte counters into smoothed rates.
    pub fn tick(&mut self, dt_ms: u64) {
        if dt_ms == 0 {
            return;
        }
        let dt = dt_ms as f64 / 1000.0;
        let dl_rate = self.downloaded_tick as f64 / dt;
        let ul_rate = self.uploaded_tick as f64 / dt;
        self.download_ema = SPEED_EMA_ALPHA * dl_rate + (1.0 - SPEED_EMA_ALPHA) * self.download_ema;
        self.upload_ema = SPEED_EMA_ALPHA * ul_rate + (1.0 - SPEED_EMA_ALPHA) * self.upload_ema;
        self.downloaded_tick = 0;
        self.uploaded_tick = 0;
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct PeerExtendedState {
    pub ut_metadata: Option<u8>,
    pub ut_pex: Option<u8>,
    pub metadata_size: Option<i64>,
}

/// Per-peer state, owned by the engine and mutated only inside its event
/// loop. The session behind `tx` holds none of this.
#[derive(Debug)]
pub(crate) struct PeerState {
    pub addr: SocketAddr,
    pub peer_id: [u8; 20],
    pub tx: Sender<SessionCommand>,
    pub incoming: bool,
    pub extensions: Extensions,

    pub bitfield: Bitfield,
    // Bitfield traffic that arrived before we knew the piece count
    // (magnet start); materialized once the info dictionary lands.
    pub pending_bitfield: Option<Vec<u8>>,
    pub pending_have_all: bool,
    pub pending_haves: Vec<u32>,

    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    pub optimistic: bool,
    pub snubbed: bool,

    pub bytes_downloaded_in_period: u64,
    pub bytes_uploaded_in_period: u64,
    pub downloaded_tick: u64,
    pub uploaded_tick: u64,
    pub download_ema: f64,
    pub upload_ema: f64,

    /// Pieces we granted the peer (sent as AllowedFast).
    pub allowed_fast_sent: HashSet<u32>,
    /// Pieces the peer granted us; requestable while it chokes us.
    pub allowed_fast_in: HashSet<u32>,

    /// Set by the first extended handshake, never replaced by later ones.
    pub ext: Option<PeerExtendedState>,

    /// Blocks we cancelled at this peer; a crossing Reject for one of
    /// these is a race, not a violation.
    pub tolerated_rejects: HashSet<(u32, u32)>,
}

impl PeerState {
    pub fn new(
        addr: SocketAddr,
        peer_id: [u8; 20],
        tx: Sender<SessionCommand>,
        incoming: bool,
        extensions: Extensions,
        piece_count: usize,
    ) -> Self {
        Self {
            addr,
            peer_id,
            tx,
            incoming,
            extensions,
            bitfield: Bitfield::new(piece_count),
            pending_bitfield: None,
            pending_have_all: false,
            pending_haves: Vec::new(),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            optimistic: false,
            snubbed: false,
            bytes_downloaded_in_period: 0,
            bytes_uploaded_in_period: 0,
            downloaded_tick: 0,
            uploaded_tick: 0,
            download_ema: 0.0,
            upload_ema: 0.0,
            allowed_fast_sent: HashSet::new(),
            allowed_fast_in: HashSet::new(),
            ext: None,
            tolerated_rejects: HashSet::new(),
        }
    }

    pub fn tick(&mut self, dt_ms: u64) {
        if dt_ms == 0 {
            return;
        }
        let dt = dt_ms as f64 / 1000.0;
        let dl_rate = self.downloaded_tick as f64 / dt;
        let ul_rate = self.uploaded_tick as f64 / dt;
        self.download_ema = SPEED_EMA_ALPHA * dl_rate + (1.0 - SPEED_EMA_ALPHA) * self.download_ema;
        self.upload_ema = SPEED_EMA_ALPHA * ul_rate + (1.0 - SPEED_EMA_ALPHA) * self.upload_ema;
        self.downloaded_tick = 0;
        self.uploaded_tick = 0;
    }
}
