// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::disk::cache::PieceReader;
use crate::peer::protocol::{BlockInfo, Message, MessageSummary};

use std::fmt;
use std::sync::Arc;

/// Session -> engine. Each event is tagged with the peer address at the
/// engine-message layer, so sessions stay address-agnostic inside.
#[derive(Debug)]
pub enum SessionEvent {
    /// A decoded wire message, in arrival order.
    Message(Message),
    /// No piece block arrived within the piece timeout while requests were
    /// outstanding.
    Snubbed,
    /// The writer flushed an upload of this many bytes to the peer.
    BlockSent { length: u32 },
    /// The session ended; the engine performs all map cleanup.
    Disconnected,
}

pub struct SessionEventSummary<'a>(pub &'a SessionEvent);
impl fmt::Debug for SessionEventSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            SessionEvent::Message(m) => write!(f, "{:?}", MessageSummary(m)),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Engine -> session.
pub enum SessionCommand {
    /// Enqueue a wire message. Interested/NotInterested transitions are
    /// coalesced by the session; everything else is sent verbatim.
    Send(Message),
    /// Serve an upload: the writer reads the block through the piece cache
    /// right before it goes out, and drops it if a matching Cancel arrived
    /// first or the request went stale.
    ServeBlock {
        block: BlockInfo,
        reader: Arc<PieceReader>,
    },
    /// The peer cancelled a not-yet-served request.
    CancelServe { block: BlockInfo },
    /// Close the connection. Idempotent.
    Disconnect,
}

impl fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionCommand::Send(m) => write!(f, "Send({:?})", MessageSummary(m)),
            SessionCommand::ServeBlock { block, .. } => write!(f, "ServeBlock({:?})", block),
            SessionCommand::CancelServe { block } => write!(f, "CancelServe({:?})", block),
            SessionCommand::Disconnect => write!(f, "Disconnect"),
        }
    }
}
