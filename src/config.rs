// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use figment::providers::{Env, Format, Toml};
use figment::Figment;

use serde::{Deserialize, Serialize};

use tracing::{event, Level};

use std::path::Path;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub port: u16,

    // Choking
    pub unchoked_peers: usize,
    pub optimistic_unchoked_peers: usize,

    // Peer budget
    pub max_peer_dial: usize,
    pub max_peer_accept: usize,
    pub max_peer_addresses: usize,

    // Timings
    pub peer_connect_timeout_secs: u64,
    pub peer_handshake_timeout_secs: u64,
    pub piece_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub bitfield_write_interval_secs: u64,

    // Download
    pub endgame_threshold: usize,
    pub peer_read_buffer_size: usize,

    // Seeding
    pub piece_cache_pieces: usize,

    // Extensions
    pub pex_enabled: bool,
    pub dht_enabled: bool,

    // Passed through to the handshaker seam; negotiation itself lives there.
    pub disable_outgoing_encryption: bool,
    pub force_outgoing_encryption: bool,
    pub force_incoming_encryption: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 6881,
            unchoked_peers: 4,
            optimistic_unchoked_peers: 1,
            max_peer_dial: 40,
            max_peer_accept: 40,
            max_peer_addresses: 2000,
            peer_connect_timeout_secs: 5,
            peer_handshake_timeout_secs: 10,
            piece_timeout_secs: 20,
            request_timeout_secs: 20,
            bitfield_write_interval_secs: 30,
            endgame_threshold: 20,
            peer_read_buffer_size: 16 * 1024 + 1024,
            piece_cache_pieces: 64,
            pex_enabled: true,
            dht_enabled: true,
            disable_outgoing_encryption: false,
            force_outgoing_encryption: false,
            force_incoming_encryption: false,
        }
    }
}

impl Settings {
    pub fn peer_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_connect_timeout_secs)
    }

    pub fn peer_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_handshake_timeout_secs)
    }

    pub fn piece_timeout(&self) -> Duration {
        Duration::from_secs(self.piece_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn bitfield_write_interval(&self) -> Duration {
        Duration::from_secs(self.bitfield_write_interval_secs)
    }
}

/// TOML file merged with `UNDERCURRENT_`-prefixed environment variables.
/// Falls back to defaults on any error; a torrent engine should not refuse
/// to start over a malformed config line.
pub fn load_settings(config_file: &Path) -> Settings {
    match Figment::new()
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("UNDERCURRENT_"))
        .extract::<Settings>()
    {
        Ok(s) => s,
        Err(e) => {
            event!(
                Level::ERROR,
                "Failed to load settings at {:?}: {}",
                config_file,
                e
            );
            Settings::default()
        }
    }
}
