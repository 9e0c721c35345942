// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::ProtocolViolation;
use crate::peer::protocol::{calculate_blocks, BlockInfo};

use std::collections::HashSet;

/// Outstanding block requests per peer per piece.
pub(crate) const MAX_PIPELINE_DEPTH: usize = 10;

#[derive(Debug)]
struct Block {
    info: BlockInfo,
    requested: bool,
    data: Option<Vec<u8>>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum BlockOutcome {
    /// Accepted; more blocks are still missing.
    Progress,
    /// Block already had data; caller accounts it as wasted.
    Duplicate,
    /// All blocks received; the assembled piece buffer.
    Completed(Vec<u8>),
}

/// Drives the blocks of one piece against one peer. Owned and advanced by
/// the engine; the peer session only carries the resulting Request/Cancel
/// messages.
#[derive(Debug)]
pub(crate) struct PieceDownloader {
    piece_index: u32,
    blocks: Vec<Block>,
    choked: bool,
    /// Piece is in the peer's allowed-fast grant: requests survive choking
    /// and may be issued while choked.
    allowed_fast: bool,
    /// Blocks whose requests were dropped by a choke; a late Reject for
    /// these is redundant, not a violation.
    dropped: HashSet<u32>,
}

impl PieceDownloader {
    pub fn new(piece_index: u32, piece_size: u32, allowed_fast: bool, choked: bool) -> Self {
        let blocks = calculate_blocks(piece_index, piece_size)
            .into_iter()
            .map(|info| Block {
                info,
                requested: false,
                data: None,
            })
            .collect();
        Self {
            piece_index,
            blocks,
            choked,
            allowed_fast,
            dropped: HashSet::new(),
        }
    }

    pub fn piece_index(&self) -> u32 {
        self.piece_index
    }

    fn in_flight(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.requested && b.data.is_none())
            .count()
    }

    fn can_request(&self) -> bool {
        !self.choked || self.allowed_fast
    }

    /// Requests to issue now, in ascending block order, keeping at most
    /// `MAX_PIPELINE_DEPTH` in flight.
    pub fn next_requests(&mut self) -> Vec<BlockInfo> {
        if !self.can_request() {
            return Vec::new();
        }
        let mut budget = MAX_PIPELINE_DEPTH.saturating_sub(self.in_flight());
        let mut requests = Vec::new();
        for block in &mut self.blocks {
            if budget == 0 {
                break;
            }
            if !block.requested && block.data.is_none() {
                block.requested = true;
                self.dropped.remove(&block.info.offset);
                requests.push(block.info);
                budget -= 1;
            }
        }
        requests
    }

    pub fn on_block(&mut self, offset: u32, data: Vec<u8>) -> Result<BlockOutcome, ProtocolViolation> {
        let piece_index = self.piece_index;
        let block = self
            .blocks
            .iter_mut()
            .find(|b| b.info.offset == offset)
            .ok_or(ProtocolViolation::UnknownBlockOffset { piece_index, offset })?;

        if data.len() as u32 != block.info.length {
            return Err(ProtocolViolation::BlockLengthMismatch {
                expected: block.info.length,
                got: data.len() as u32,
            });
        }
        if block.data.is_some() {
            return Ok(BlockOutcome::Duplicate);
        }
        block.data = Some(data);

        if self.blocks.iter().all(|b| b.data.is_some()) {
            let mut buffer = Vec::with_capacity(
                self.blocks.iter().map(|b| b.info.length as usize).sum(),
            );
            for block in &mut self.blocks {
                buffer.extend_from_slice(block.data.as_ref().unwrap());
            }
            return Ok(BlockOutcome::Completed(buffer));
        }
        Ok(BlockOutcome::Progress)
    }

    /// A Reject clears the block for retry. Rejects for blocks that were
    /// never requested close the peer, except redundant rejects for
    /// requests a choke already dropped.
    pub fn on_reject(&mut self, offset: u32) -> Result<(), ProtocolViolation> {
        let piece_index = self.piece_index;
        let block = self
            .blocks
            .iter_mut()
            .find(|b| b.info.offset == offset)
            .ok_or(ProtocolViolation::UnknownBlockOffset { piece_index, offset })?;

        if block.requested {
            block.requested = false;
            return Ok(());
        }
        if self.dropped.remove(&offset) {
            return Ok(());
        }
        Err(ProtocolViolation::RejectForUnrequestedBlock { piece_index, offset })
    }

    pub fn on_choke(&mut self) {
        self.choked = true;
        if self.allowed_fast {
            return;
        }
        for block in &mut self.blocks {
            if block.requested && block.data.is_none() {
                block.requested = false;
                self.dropped.insert(block.info.offset);
            }
        }
    }

    pub fn on_unchoke(&mut self) {
        self.choked = false;
    }

    /// Requests currently on the wire, for Cancels when this downloader
    /// loses an endgame race or the torrent stops.
    pub fn outstanding(&self) -> Vec<BlockInfo> {
        self.blocks
            .iter()
            .filter(|b| b.requested && b.data.is_none())
            .map(|b| b.info)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::protocol::BLOCK_SIZE;

    #[test]
    fn test_pipeline_is_capped_and_ascending() {
        // 20 blocks, pipeline must stop at 10
        let mut dl = PieceDownloader::new(0, BLOCK_SIZE * 20, false, false);
        let reqs = dl.next_requests();
        assert_eq!(reqs.len(), MAX_PIPELINE_DEPTH);
        for (i, req) in reqs.iter().enumerate() {
            assert_eq!(req.offset, i as u32 * BLOCK_SIZE);
        }
        // No slots free until a block arrives
        assert!(dl.next_requests().is_empty());

        let outcome = dl.on_block(0, vec![0u8; BLOCK_SIZE as usize]).unwrap();
        assert_eq!(outcome, BlockOutcome::Progress);
        let next = dl.next_requests();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].offset, 10 * BLOCK_SIZE);
    }

    #[test]
    fn test_completion_assembles_in_order() {
        let mut dl = PieceDownloader::new(3, BLOCK_SIZE + 5, false, false);
        let reqs = dl.next_requests();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[1].length, 5);

        // Deliver out of order
        assert_eq!(dl.on_block(BLOCK_SIZE, vec![2u8; 5]).unwrap(), BlockOutcome::Progress);
        match dl.on_block(0, vec![1u8; BLOCK_SIZE as usize]).unwrap() {
            BlockOutcome::Completed(buf) => {
                assert_eq!(buf.len(), BLOCK_SIZE as usize + 5);
                assert_eq!(buf[0], 1);
                assert_eq!(buf[BLOCK_SIZE as usize], 2);
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_length_is_violation() {
        let mut dl = PieceDownloader::new(0, BLOCK_SIZE * 2, false, false);
        dl.next_requests();
        assert!(matches!(
            dl.on_block(0, vec![0u8; 10]),
            Err(ProtocolViolation::BlockLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_duplicate_block_is_flagged() {
        let mut dl = PieceDownloader::new(0, BLOCK_SIZE * 2, false, false);
        dl.next_requests();
        dl.on_block(0, vec![0u8; BLOCK_SIZE as usize]).unwrap();
        assert_eq!(
            dl.on_block(0, vec![0u8; BLOCK_SIZE as usize]).unwrap(),
            BlockOutcome::Duplicate
        );
    }

    #[test]
    fn test_reject_requeues_block() {
        let mut dl = PieceDownloader::new(0, BLOCK_SIZE * 2, false, false);
        let first = dl.next_requests();
        assert_eq!(first.len(), 2);
        dl.on_reject(0).unwrap();
        let retry = dl.next_requests();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].offset, 0);
    }

    #[test]
    fn test_reject_for_unrequested_is_violation() {
        let mut dl = PieceDownloader::new(0, BLOCK_SIZE, false, false);
        assert!(matches!(
            dl.on_reject(0),
            Err(ProtocolViolation::RejectForUnrequestedBlock { .. })
        ));
    }

    #[test]
    fn test_choke_drops_requests_and_unchoke_resumes() {
        let mut dl = PieceDownloader::new(0, BLOCK_SIZE * 3, false, false);
        dl.next_requests();
        dl.on_block(0, vec![0u8; BLOCK_SIZE as usize]).unwrap();

        dl.on_choke();
        assert!(dl.next_requests().is_empty());
        assert!(dl.outstanding().is_empty());

        // A late reject for a choke-dropped request is tolerated once.
        dl.on_reject(BLOCK_SIZE).unwrap();
        assert!(matches!(
            dl.on_reject(BLOCK_SIZE),
            Err(ProtocolViolation::RejectForUnrequestedBlock { .. })
        ));

        dl.on_unchoke();
        let retry = dl.next_requests();
        // Both unreceived blocks get re-requested
        assert_eq!(retry.len(), 2);
    }

    #[test]
    fn test_allowed_fast_survives_choke_and_requests_while_choked() {
        let mut dl = PieceDownloader::new(0, BLOCK_SIZE * 2, true, true);
        // Choked from the start, but the piece is allowed-fast
        let reqs = dl.next_requests();
        assert_eq!(reqs.len(), 2);

        dl.on_choke();
        assert_eq!(dl.outstanding().len(), 2);

        dl.on_block(0, vec![0u8; BLOCK_SIZE as usize]).unwrap();
        match dl.on_block(BLOCK_SIZE, vec![0u8; BLOCK_SIZE as usize]).unwrap() {
            BlockOutcome::Completed(buf) => assert_eq!(buf.len(), 2 * BLOCK_SIZE as usize),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_done_fires_exactly_once() {
        let mut dl = PieceDownloader::new(0, BLOCK_SIZE, false, false);
        dl.next_requests();
        assert!(matches!(
            dl.on_block(0, vec![9u8; BLOCK_SIZE as usize]).unwrap(),
            BlockOutcome::Completed(_)
        ));
        // Another copy of the same block is a duplicate, not a second completion.
        assert_eq!(
            dl.on_block(0, vec![9u8; BLOCK_SIZE as usize]).unwrap(),
            BlockOutcome::Duplicate
        );
    }
}
