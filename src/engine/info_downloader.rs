// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::ProtocolViolation;
use crate::peer::protocol::BLOCK_SIZE;

use std::collections::HashSet;
use std::net::SocketAddr;

/// Refuse absurd metadata sizes before allocating a buffer for them.
const MAX_METADATA_SIZE: i64 = 8 * 1024 * 1024;

/// While fetching metadata we keep one request in flight per peer.
pub(crate) const METADATA_QUEUE_LENGTH: usize = 1;

/// Fetches the raw info dictionary from one LTEP peer via ut_metadata.
/// Blocks are requested in strict ascending order; the engine verifies the
/// finished buffer against the info-hash.
#[derive(Debug)]
pub(crate) struct InfoDownloader {
    peer: SocketAddr,
    /// The peer's message id for ut_metadata, from its extended handshake.
    ut_metadata_id: u8,
    buffer: Vec<u8>,
    block_sizes: Vec<u32>,
    requested: HashSet<u32>,
    next_index: u32,
}

impl InfoDownloader {
    pub fn new(
        peer: SocketAddr,
        ut_metadata_id: u8,
        metadata_size: i64,
    ) -> Result<Self, ProtocolViolation> {
        if metadata_size <= 0 || metadata_size > MAX_METADATA_SIZE {
            return Err(ProtocolViolation::BadMetadataSize { size: metadata_size });
        }
        let size = metadata_size as u32;
        let mut block_sizes = vec![BLOCK_SIZE; (size / BLOCK_SIZE) as usize];
        if size % BLOCK_SIZE != 0 {
            block_sizes.push(size % BLOCK_SIZE);
        }
        Ok(Self {
            peer,
            ut_metadata_id,
            buffer: vec![0u8; size as usize],
            block_sizes,
            requested: HashSet::new(),
            next_index: 0,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn ut_metadata_id(&self) -> u8 {
        self.ut_metadata_id
    }

    /// Block indices to request now, topping the queue up to `queue_length`.
    pub fn request_blocks(&mut self, queue_length: usize) -> Vec<u32> {
        let mut indices = Vec::new();
        while self.next_index < self.block_sizes.len() as u32
            && self.requested.len() < queue_length
        {
            self.requested.insert(self.next_index);
            indices.push(self.next_index);
            self.next_index += 1;
        }
        indices
    }

    pub fn on_block(&mut self, index: u32, data: &[u8]) -> Result<(), ProtocolViolation> {
        if !self.requested.remove(&index) {
            return Err(ProtocolViolation::UnrequestedMetadataBlock { index });
        }
        let expected = self.block_sizes[index as usize];
        if data.len() as u32 != expected {
            return Err(ProtocolViolation::MetadataBlockSizeMismatch {
                expected,
                got: data.len() as u32,
            });
        }
        let begin = (index * BLOCK_SIZE) as usize;
        self.buffer[begin..begin + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn done(&self) -> bool {
        self.next_index == self.block_sizes.len() as u32 && self.requested.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn test_blocks_cover_size_with_short_tail() {
        let dl = InfoDownloader::new(peer(), 2, (BLOCK_SIZE * 2 + 37) as i64).unwrap();
        assert_eq!(dl.block_sizes, vec![BLOCK_SIZE, BLOCK_SIZE, 37]);
    }

    #[test]
    fn test_requests_ascend_within_queue_budget() {
        let mut dl = InfoDownloader::new(peer(), 2, (BLOCK_SIZE * 3) as i64).unwrap();
        assert_eq!(dl.request_blocks(METADATA_QUEUE_LENGTH), vec![0]);
        assert_eq!(dl.request_blocks(METADATA_QUEUE_LENGTH), Vec::<u32>::new());

        dl.on_block(0, &vec![0u8; BLOCK_SIZE as usize]).unwrap();
        assert_eq!(dl.request_blocks(METADATA_QUEUE_LENGTH), vec![1]);
    }

    #[test]
    fn test_single_block_metadata_completes() {
        let mut dl = InfoDownloader::new(peer(), 3, 37).unwrap();
        assert_eq!(dl.request_blocks(METADATA_QUEUE_LENGTH), vec![0]);
        dl.on_block(0, &[7u8; 37]).unwrap();
        assert!(dl.done());
        assert_eq!(dl.into_bytes(), vec![7u8; 37]);
    }

    #[test]
    fn test_unrequested_block_is_violation() {
        let mut dl = InfoDownloader::new(peer(), 2, 100).unwrap();
        assert!(matches!(
            dl.on_block(0, &[0u8; 100]),
            Err(ProtocolViolation::UnrequestedMetadataBlock { .. })
        ));
    }

    #[test]
    fn test_wrong_block_size_is_violation() {
        let mut dl = InfoDownloader::new(peer(), 2, 100).unwrap();
        dl.request_blocks(METADATA_QUEUE_LENGTH);
        assert!(matches!(
            dl.on_block(0, &[0u8; 99]),
            Err(ProtocolViolation::MetadataBlockSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_nonsense_sizes_are_rejected() {
        assert!(InfoDownloader::new(peer(), 2, 0).is_err());
        assert!(InfoDownloader::new(peer(), 2, -4).is_err());
        assert!(InfoDownloader::new(peer(), 2, MAX_METADATA_SIZE + 1).is_err());
    }
}
