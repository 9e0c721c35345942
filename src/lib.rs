// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-torrent BitTorrent swarm engine. One [`Engine`] drives one torrent
//! from an info-hash (with or without metadata) to a verified on-disk file
//! set while seeding what it has. Trackers, DHT, acceptors and persistence
//! plug in through the [`EngineHandle`] and the [`resume::Resumer`] seam.

pub mod announce;
pub mod bitfield;
pub mod command;
pub mod config;
pub mod disk;
pub mod engine;
pub mod errors;
pub mod metainfo;
pub mod peer;
pub mod resume;

pub use announce::{AnnounceEvent, AnnounceRequest, PeerSource};
pub use bitfield::Bitfield;
pub use config::{load_settings, Settings};
pub use engine::{Engine, EngineCommand, EngineHandle, TorrentEvent, TorrentParameters};
pub use errors::{ProtocolViolation, StorageError, TorrentError};
pub use metainfo::{InfoHash, Metainfo};
pub use resume::{FileResumer, ResumeSpec, Resumer};
