// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;
use std::io;

/// A peer broke the wire protocol. Always resolved by closing that peer;
/// never touches torrent-global state.
#[derive(Debug)]
pub enum ProtocolViolation {
    RejectForUnrequestedBlock { piece_index: u32, offset: u32 },
    BlockLengthMismatch { expected: u32, got: u32 },
    UnknownBlockOffset { piece_index: u32, offset: u32 },
    OversizedRequest { length: u32 },
    BadBitfieldLength { expected: usize, got: usize },
    SpareBitsSet,
    UnrequestedMetadataBlock { index: u32 },
    MetadataBlockSizeMismatch { expected: u32, got: u32 },
    MetadataHashMismatch,
    BadMetadataSize { size: i64 },
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolation::RejectForUnrequestedBlock { piece_index, offset } => {
                write!(f, "reject for block we never requested ({}, {})", piece_index, offset)
            }
            ProtocolViolation::BlockLengthMismatch { expected, got } => {
                write!(f, "block length mismatch: expected {}, got {}", expected, got)
            }
            ProtocolViolation::UnknownBlockOffset { piece_index, offset } => {
                write!(f, "block offset {} is not a block of piece {}", offset, piece_index)
            }
            ProtocolViolation::OversizedRequest { length } => {
                write!(f, "request length {} exceeds allowed maximum", length)
            }
            ProtocolViolation::BadBitfieldLength { expected, got } => {
                write!(f, "bitfield length mismatch: expected {} bytes, got {}", expected, got)
            }
            ProtocolViolation::SpareBitsSet => write!(f, "bitfield has spare bits set"),
            ProtocolViolation::UnrequestedMetadataBlock { index } => {
                write!(f, "metadata block {} was never requested", index)
            }
            ProtocolViolation::MetadataBlockSizeMismatch { expected, got } => {
                write!(f, "metadata block size mismatch: expected {}, got {}", expected, got)
            }
            ProtocolViolation::MetadataHashMismatch => {
                write!(f, "downloaded metadata does not hash to the info-hash")
            }
            ProtocolViolation::BadMetadataSize { size } => {
                write!(f, "peer advertised unusable metadata size {}", size)
            }
        }
    }
}

impl std::error::Error for ProtocolViolation {}

#[derive(Debug)]
pub enum StorageError {
    Io(io::Error),
    OutOfBounds { offset: u64, length: usize },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "storage I/O error: {}", e),
            StorageError::OutOfBounds { offset, length } => {
                write!(f, "range {}+{} is outside the torrent data", offset, length)
            }
        }
    }
}

impl std::error::Error for StorageError {}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e)
    }
}

/// Torrent-fatal failures, surfaced to the caller exactly once on the
/// event channel.
#[derive(Debug)]
pub enum TorrentError {
    AllocationFailed(StorageError),
    VerificationFailed(StorageError),
    WriteFailed(StorageError),
    InvalidTorrent(String),
    TorrentClosed,
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::AllocationFailed(e) => write!(f, "file allocation failed: {}", e),
            TorrentError::VerificationFailed(e) => write!(f, "data verification failed: {}", e),
            TorrentError::WriteFailed(e) => write!(f, "piece write failed: {}", e),
            TorrentError::InvalidTorrent(msg) => write!(f, "invalid torrent: {}", msg),
            TorrentError::TorrentClosed => write!(f, "torrent closed"),
        }
    }
}

impl std::error::Error for TorrentError {}
