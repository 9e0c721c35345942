// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::metainfo::InfoHash;

/// Where a peer address came from. Higher-priority sources are dialed
/// first when the address list is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerSource {
    Manual,
    Tracker,
    Dht,
    Pex,
}

impl PeerSource {
    pub(crate) fn priority(self) -> usize {
        match self {
            PeerSource::Manual => 3,
            PeerSource::Tracker => 2,
            PeerSource::Dht => 1,
            PeerSource::Pex => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Started,
    Completed,
    Stopped,
}

/// Snapshot handed to tracker adapters. The engine publishes a fresh value
/// on a watch channel whenever the stats or lifecycle change; announcers
/// read whatever is current at announce time.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}
