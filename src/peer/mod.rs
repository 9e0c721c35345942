// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod handshake;
pub mod protocol;
pub mod session;

pub use handshake::{Extensions, HandshakeOutcome};
pub use protocol::{BlockInfo, Message, BLOCK_SIZE};
pub use session::{PeerSession, PeerSessionParams};
