// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::bitfield::Bitfield;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

/// Chooses which (peer, piece) pair to start next: rarest first with
/// lowest-index tie-break, restricted to the allowed-fast grant while the
/// peer chokes us, skipping snubbed pairs, and allowing duplicate
/// downloaders for the final pieces (endgame).
#[derive(Debug)]
pub(crate) struct PiecePicker {
    availability: Vec<u32>,
    missing: usize,
    claims: HashMap<u32, Vec<SocketAddr>>,
    snubbed: HashSet<(SocketAddr, u32)>,
    endgame_threshold: usize,
}

pub(crate) struct PickContext<'a> {
    pub addr: SocketAddr,
    pub bitfield: &'a Bitfield,
    pub peer_choking: bool,
    pub allowed_fast: &'a HashSet<u32>,
}

impl PiecePicker {
    pub fn new(have: &Bitfield, endgame_threshold: usize) -> Self {
        Self {
            availability: vec![0; have.len()],
            missing: have.len() - have.count_ones(),
            claims: HashMap::new(),
            snubbed: HashSet::new(),
            endgame_threshold,
        }
    }

    pub fn missing(&self) -> usize {
        self.missing
    }

    pub fn endgame_active(&self) -> bool {
        self.missing > 0 && self.missing <= self.endgame_threshold
    }

    pub fn add_bitfield(&mut self, bitfield: &Bitfield) {
        for (index, slot) in self.availability.iter_mut().enumerate() {
            if bitfield.test(index) {
                *slot += 1;
            }
        }
    }

    pub fn remove_bitfield(&mut self, bitfield: &Bitfield) {
        for (index, slot) in self.availability.iter_mut().enumerate() {
            if bitfield.test(index) {
                *slot = slot.saturating_sub(1);
            }
        }
    }

    pub fn add_have(&mut self, index: u32) {
        if let Some(slot) = self.availability.get_mut(index as usize) {
            *slot += 1;
        }
    }

    #[cfg(test)]
    pub fn availability(&self, index: u32) -> u32 {
        self.availability[index as usize]
    }

    /// A piece of ours reached disk; it no longer counts as missing and
    /// its claims are gone.
    pub fn mark_have(&mut self, index: u32) {
        self.missing = self.missing.saturating_sub(1);
        self.claims.remove(&index);
    }

    pub fn claim(&mut self, index: u32, addr: SocketAddr) {
        self.claims.entry(index).or_default().push(addr);
    }

    pub fn release(&mut self, index: u32, addr: SocketAddr) {
        if let Some(claimants) = self.claims.get_mut(&index) {
            claimants.retain(|a| *a != addr);
            if claimants.is_empty() {
                self.claims.remove(&index);
            }
        }
    }

    pub fn claimants(&self, index: u32) -> Vec<SocketAddr> {
        self.claims.get(&index).cloned().unwrap_or_default()
    }

    pub fn set_snubbed(&mut self, addr: SocketAddr, index: u32) {
        self.snubbed.insert((addr, index));
    }

    /// Drops every trace of a departing peer and returns the pieces whose
    /// claims it held.
    pub fn peer_disconnected(&mut self, addr: SocketAddr, bitfield: &Bitfield) -> Vec<u32> {
        self.remove_bitfield(bitfield);
        self.snubbed.retain(|(a, _)| *a != addr);
        let held: Vec<u32> = self
            .claims
            .iter()
            .filter(|(_, claimants)| claimants.contains(&addr))
            .map(|(&index, _)| index)
            .collect();
        for index in &held {
            self.release(*index, addr);
        }
        held
    }

    fn eligible(&self, index: usize, have: &Bitfield, ctx: &PickContext<'_>) -> bool {
        if have.test(index) || !ctx.bitfield.test(index) {
            return false;
        }
        let index = index as u32;
        if self.snubbed.contains(&(ctx.addr, index)) {
            return false;
        }
        if ctx.peer_choking && !ctx.allowed_fast.contains(&index) {
            return false;
        }
        true
    }

    pub fn pick(&self, have: &Bitfield, ctx: &PickContext<'_>) -> Option<u32> {
        // Normal pass: unclaimed pieces, rarest first, lowest index wins ties.
        let mut best: Option<(u32, u32)> = None;
        for index in 0..self.availability.len() {
            if !self.eligible(index, have, ctx) || self.claims.contains_key(&(index as u32)) {
                continue;
            }
            let key = (self.availability[index], index as u32);
            if best.map_or(true, |b| key < b) {
                best = Some(key);
            }
        }
        if let Some((_, index)) = best {
            return Some(index);
        }

        if !self.endgame_active() {
            return None;
        }

        // Endgame pass: duplicate an existing download, preferring pieces
        // with the fewest active downloaders, never doubling up on the
        // same peer.
        let mut best: Option<(usize, u32, u32)> = None;
        for index in 0..self.availability.len() {
            if !self.eligible(index, have, ctx) {
                continue;
            }
            let index_u32 = index as u32;
            let claimants = self.claims.get(&index_u32);
            if claimants.map_or(false, |c| c.contains(&ctx.addr)) {
                continue;
            }
            let key = (
                claimants.map_or(0, |c| c.len()),
                self.availability[index],
                index_u32,
            );
            if best.map_or(true, |b| key < b) {
                best = Some(key);
            }
        }
        best.map(|(_, _, index)| index)
    }
}
