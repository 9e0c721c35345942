// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::engine::state::PeerState;

use rand::prelude::IndexedRandom;

use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ChokeChange {
    pub addr: SocketAddr,
    pub unchoke: bool,
}

/// Rate-ranked regular unchoke plus random optimistic rotation. Both
/// passes mutate the per-peer choke flags and return only the effective
/// transitions; Choke/Unchoke messages go out exactly when state changes.
#[derive(Debug)]
pub(crate) struct Choker {
    unchoked_peers: usize,
    optimistic_unchoked_peers: usize,
}

impl Choker {
    pub fn new(unchoked_peers: usize, optimistic_unchoked_peers: usize) -> Self {
        Self {
            unchoked_peers,
            optimistic_unchoked_peers,
        }
    }

    /// Every 10 s: unchoke the top interested peers by bytes moved in the
    /// period (download rate while leeching, upload rate while seeding),
    /// choke the rest, and reset every peer's period counters. A ranked
    /// peer keeps its slot even if it was the optimistic pick; its
    /// optimistic flag clears so the next rotation does not re-choke it.
    pub fn regular(
        &self,
        peers: &mut HashMap<SocketAddr, PeerState>,
        seeding: bool,
    ) -> Vec<ChokeChange> {
        let mut ranked: Vec<(u64, SocketAddr)> = peers
            .values()
            .filter(|p| p.peer_interested)
            .map(|p| {
                let score = if seeding {
                    p.bytes_uploaded_in_period
                } else {
                    p.bytes_downloaded_in_period
                };
                (score, p.addr)
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let winners: Vec<SocketAddr> = ranked
            .iter()
            .take(self.unchoked_peers)
            .map(|(_, addr)| *addr)
            .collect();

        let mut changes = Vec::new();
        for peer in peers.values_mut() {
            if winners.contains(&peer.addr) {
                peer.optimistic = false;
                if peer.am_choking {
                    peer.am_choking = false;
                    changes.push(ChokeChange { addr: peer.addr, unchoke: true });
                }
            } else if !peer.optimistic && !peer.am_choking {
                peer.am_choking = true;
                changes.push(ChokeChange { addr: peer.addr, unchoke: false });
            }
            peer.bytes_downloaded_in_period = 0;
            peer.bytes_uploaded_in_period = 0;
        }
        changes
    }

    /// Every 30 s: re-choke the previous optimistic picks, then unchoke up
    /// to `optimistic_unchoked_peers` uniformly random choked interested
    /// peers and flag them optimistic.
    pub fn optimistic(&self, peers: &mut HashMap<SocketAddr, PeerState>) -> Vec<ChokeChange> {
        let mut changes = Vec::new();

        for peer in peers.values_mut() {
            if peer.optimistic {
                peer.optimistic = false;
                if !peer.am_choking {
                    peer.am_choking = true;
                    changes.push(ChokeChange { addr: peer.addr, unchoke: false });
                }
            }
        }

        let candidates: Vec<SocketAddr> = peers
            .values()
            .filter(|p| p.am_choking && p.peer_interested)
            .map(|p| p.addr)
            .collect();

        let mut rng = rand::rng();
        for _ in 0..self.optimistic_unchoked_peers {
            let remaining: Vec<SocketAddr> = candidates
                .iter()
                .filter(|addr| peers.get(addr).map(|p| p.am_choking).unwrap_or(false))
                .copied()
                .collect();
            let Some(pick) = remaining.choose(&mut rng).copied() else {
                break;
            };
            if let Some(peer) = peers.get_mut(&pick) {
                peer.am_choking = false;
                peer.optimistic = true;
                changes.push(ChokeChange { addr: pick, unchoke: true });
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::handshake::Extensions;

    use tokio::sync::mpsc;

    fn peer(host: u8, interested: bool, down: u64, up: u64) -> PeerState {
        let addr: SocketAddr = format!("10.0.0.{}:6881", host).parse().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let mut p = PeerState::new(addr, [host; 20], tx, false, Extensions::default(), 8);
        p.peer_interested = interested;
        p.bytes_downloaded_in_period = down;
        p.bytes_uploaded_in_period = up;
        p
    }

    fn addr(host: u8) -> SocketAddr {
        format!("10.0.0.{}:6881", host).parse().unwrap()
    }

    fn unchoked(peers: &HashMap<SocketAddr, PeerState>) -> Vec<SocketAddr> {
        let mut list: Vec<SocketAddr> = peers
            .values()
            .filter(|p| !p.am_choking)
            .map(|p| p.addr)
            .collect();
        list.sort();
        list
    }

    #[test]
    fn test_regular_unchoke_ranks_by_download_while_leeching() {
        let mut peers = HashMap::new();
        for (host, down) in [(1u8, 3000u64), (2, 1000), (3, 4000), (4, 2000)] {
            peers.insert(addr(host), peer(host, true, down, 0));
        }

        let choker = Choker::new(2, 1);
        let changes = choker.regular(&mut peers, false);

        assert_eq!(unchoked(&peers), vec![addr(1), addr(3)]);
        assert_eq!(changes.iter().filter(|c| c.unchoke).count(), 2);
        // Period counters reset across all peers
        assert!(peers.values().all(|p| p.bytes_downloaded_in_period == 0));
        assert!(peers.values().all(|p| p.bytes_uploaded_in_period == 0));
    }

    #[test]
    fn test_regular_unchoke_ranks_by_upload_while_seeding() {
        let mut peers = HashMap::new();
        for (host, up) in [(1u8, 10u64), (2, 500), (3, 300)] {
            peers.insert(addr(host), peer(host, true, 0, up));
        }

        let choker = Choker::new(1, 1);
        choker.regular(&mut peers, true);
        assert_eq!(unchoked(&peers), vec![addr(2)]);
    }

    #[test]
    fn test_uninterested_peers_never_unchoke() {
        let mut peers = HashMap::new();
        peers.insert(addr(1), peer(1, false, 9999, 9999));
        peers.insert(addr(2), peer(2, true, 1, 1));

        let choker = Choker::new(4, 1);
        choker.regular(&mut peers, false);
        assert_eq!(unchoked(&peers), vec![addr(2)]);
    }

    #[test]
    fn test_no_redundant_transitions() {
        let mut peers = HashMap::new();
        peers.insert(addr(1), peer(1, true, 100, 0));

        let choker = Choker::new(1, 1);
        let first = choker.regular(&mut peers, false);
        assert_eq!(first.len(), 1);
        // Same ranking again: no state change, no messages
        peers.get_mut(&addr(1)).unwrap().bytes_downloaded_in_period = 100;
        let second = choker.regular(&mut peers, false);
        assert!(second.is_empty());
    }

    #[test]
    fn test_optimistic_rotation_chokes_previous_and_picks_new() {
        let mut peers = HashMap::new();
        for host in 1..=4u8 {
            peers.insert(addr(host), peer(host, true, 0, 0));
        }
        let choker = Choker::new(0, 1);

        let first = choker.optimistic(&mut peers);
        assert_eq!(first.iter().filter(|c| c.unchoke).count(), 1);
        let optimistic_count = peers.values().filter(|p| p.optimistic).count();
        assert_eq!(optimistic_count, 1);

        let second = choker.optimistic(&mut peers);
        // Previous optimistic peer choked (unless re-picked), one new pick
        assert_eq!(peers.values().filter(|p| p.optimistic).count(), 1);
        assert!(second.iter().any(|c| c.unchoke));
    }

    #[test]
    fn test_regular_winner_keeps_slot_and_loses_optimistic_flag() {
        let mut peers = HashMap::new();
        let mut fast = peer(1, true, 5000, 0);
        fast.am_choking = false;
        fast.optimistic = true;
        peers.insert(addr(1), fast);

        let choker = Choker::new(1, 1);
        let changes = choker.regular(&mut peers, false);

        let p = peers.get(&addr(1)).unwrap();
        assert!(!p.am_choking);
        assert!(!p.optimistic);
        // Already unchoked: no message
        assert!(changes.is_empty());
    }

    #[test]
    fn test_at_most_n_nonoptimistic_unchoked_after_regular_tick() {
        let mut peers = HashMap::new();
        for host in 1..=10u8 {
            let mut p = peer(host, true, host as u64 * 100, 0);
            p.am_choking = false; // pretend everything was unchoked before
            peers.insert(addr(host), p);
        }
        let choker = Choker::new(4, 1);
        choker.regular(&mut peers, false);
        let nonoptimistic_unchoked = peers
            .values()
            .filter(|p| !p.am_choking && !p.optimistic)
            .count();
        assert!(nonoptimistic_unchoked <= 4);
    }
}
