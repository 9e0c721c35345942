// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::command::{SessionCommand, SessionEvent};
use crate::disk::cache::PieceReader;
use crate::engine::EngineMessage;
use crate::peer::protocol::{encode_message, read_message, BlockInfo, Message, MessageSummary};

use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

use tracing::{event, Level};

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

/// Keep-alive after this much writer inactivity.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Drop the peer after this long without any incoming bytes.
const IDLE_LIMIT: Duration = Duration::from_secs(150);

/// Upper bound on remembered Cancels; older entries age out.
const CANCEL_BUFFER_LIMIT: usize = 64;

/// How many queued writer items to fold into one socket write.
const WRITE_BATCH_ITEMS: usize = 16;

struct DisconnectGuard {
    addr: SocketAddr,
    engine_tx: Sender<EngineMessage>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let _ = self
            .engine_tx
            .try_send(EngineMessage::Peer(self.addr, SessionEvent::Disconnected));
    }
}

struct AbortOnDrop(JoinHandle<()>);
impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum WriterItem {
    Wire(Message),
    Upload {
        block: BlockInfo,
        reader: Arc<PieceReader>,
        queued: Instant,
    },
}

pub struct PeerSessionParams {
    pub addr: SocketAddr,
    pub engine_tx: Sender<EngineMessage>,
    pub command_rx: Receiver<SessionCommand>,
    pub piece_timeout: Duration,
    pub request_ttl: Duration,
    pub read_buffer_size: usize,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// One connected peer after the handshake: a read loop that forwards
/// decoded messages to the engine in wire order, and a writer task that
/// batches outbound messages and serves uploads lazily through the piece
/// cache. All torrent-level decisions stay in the engine.
pub struct PeerSession {
    addr: SocketAddr,
    engine_tx: Sender<EngineMessage>,
    command_rx: Receiver<SessionCommand>,
    piece_timeout: Duration,
    request_ttl: Duration,
    read_buffer_size: usize,
    shutdown_tx: broadcast::Sender<()>,

    writer_tx: Sender<WriterItem>,
    writer_rx: Option<Receiver<WriterItem>>,

    // Blocks requested from the peer and not yet answered; drives the
    // snubbed-peer timer.
    outstanding: usize,

    // Last interest state actually sent, for coalescing.
    last_interest: Option<bool>,

    cancels: Arc<Mutex<VecDeque<(u32, u32)>>>,
}

impl PeerSession {
    pub fn new(params: PeerSessionParams) -> Self {
        let (writer_tx, writer_rx) = mpsc::channel::<WriterItem>(1000);
        Self {
            addr: params.addr,
            engine_tx: params.engine_tx,
            command_rx: params.command_rx,
            piece_timeout: params.piece_timeout,
            request_ttl: params.request_ttl,
            read_buffer_size: params.read_buffer_size,
            shutdown_tx: params.shutdown_tx,
            writer_tx,
            writer_rx: Some(writer_rx),
            outstanding: 0,
            last_interest: None,
            cancels: Arc::new(Mutex::new(VecDeque::with_capacity(CANCEL_BUFFER_LIMIT))),
        }
    }

    pub async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let _guard = DisconnectGuard {
            addr: self.addr,
            engine_tx: self.engine_tx.clone(),
        };

        let (read_half, write_half) = split(stream);
        let (error_tx, mut error_rx) = oneshot::channel();

        let Some(writer_rx) = self.writer_rx.take() else {
            return;
        };
        let mut writer_handle = tokio::spawn(writer_task(
            write_half,
            writer_rx,
            self.addr,
            self.engine_tx.clone(),
            self.cancels.clone(),
            self.request_ttl,
            error_tx,
            self.shutdown_tx.subscribe(),
        ));

        // Frames must never be half-read and dropped by select, so the
        // socket is drained by its own task and handed over on a channel.
        let (read_tx, mut read_rx) = mpsc::channel::<Message>(64);
        let buffered = tokio::io::BufReader::with_capacity(self.read_buffer_size, read_half);
        let reader_handle = tokio::spawn(reader_task(
            buffered,
            self.addr,
            read_tx,
            self.shutdown_tx.subscribe(),
        ));
        let _reader_abort_guard = AbortOnDrop(reader_handle);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let mut keep_alive =
            tokio::time::interval_at(Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL);

        let idle_deadline = sleep(IDLE_LIMIT);
        tokio::pin!(idle_deadline);

        let snub_deadline = sleep(self.piece_timeout);
        tokio::pin!(snub_deadline);
        let mut snub_armed = false;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    event!(Level::TRACE, peer = %self.addr, "Session shutting down");
                    break;
                }

                _ = &mut idle_deadline => {
                    event!(Level::DEBUG, peer = %self.addr, "Peer idle too long, disconnecting");
                    break;
                }

                _ = &mut snub_deadline, if snub_armed => {
                    snub_armed = false;
                    if self
                        .engine_tx
                        .send(EngineMessage::Peer(self.addr, SessionEvent::Snubbed))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }

                _ = keep_alive.tick() => {
                    let _ = self.writer_tx.try_send(WriterItem::Wire(Message::KeepAlive));
                    event!(Level::TRACE, peer = %self.addr, "Sent periodic keep-alive");
                }

                incoming = read_rx.recv() => {
                    match incoming {
                        Some(message) => {
                            idle_deadline.as_mut().reset(Instant::now() + IDLE_LIMIT);
                            self.track_incoming(&message, snub_deadline.as_mut(), &mut snub_armed);
                            event!(Level::TRACE, peer = %self.addr, message = ?MessageSummary(&message));
                            if matches!(message, Message::KeepAlive) {
                                continue;
                            }
                            if self
                                .engine_tx
                                .send(EngineMessage::Peer(self.addr, SessionEvent::Message(message)))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(cmd) => {
                            event!(Level::TRACE, peer = %self.addr, ?cmd);
                            if !self.handle_command(cmd, snub_deadline.as_mut(), &mut snub_armed).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                writer_error = &mut error_rx => {
                    match writer_error {
                        Ok(e) => event!(Level::DEBUG, peer = %self.addr, error = %e, "Writer failed"),
                        Err(_) => event!(Level::DEBUG, peer = %self.addr, "Writer gone"),
                    }
                    break;
                }
            }
        }

        // Let the writer drain what is already queued (Haves, Cancels)
        // before the connection goes away for good.
        drop(self.writer_tx);
        if tokio::time::timeout(Duration::from_secs(5), &mut writer_handle)
            .await
            .is_err()
        {
            writer_handle.abort();
        }
    }

    fn track_incoming(
        &mut self,
        message: &Message,
        snub_deadline: std::pin::Pin<&mut tokio::time::Sleep>,
        snub_armed: &mut bool,
    ) {
        match message {
            Message::Piece(..) | Message::RejectRequest(..) => {
                self.outstanding = self.outstanding.saturating_sub(1);
                if self.outstanding > 0 {
                    snub_deadline.reset(Instant::now() + self.piece_timeout);
                } else {
                    *snub_armed = false;
                }
            }
            // Dropped requests will be re-issued after unchoke; the snub
            // timer must not fire for a peer that is merely choking us.
            Message::Choke => {
                self.outstanding = 0;
                *snub_armed = false;
            }
            _ => {}
        }
    }

    /// Returns false when the session should end.
    async fn handle_command(
        &mut self,
        command: SessionCommand,
        snub_deadline: std::pin::Pin<&mut tokio::time::Sleep>,
        snub_armed: &mut bool,
    ) -> bool {
        match command {
            SessionCommand::Send(message) => {
                match &message {
                    Message::Interested => {
                        if self.last_interest == Some(true) {
                            return true;
                        }
                        self.last_interest = Some(true);
                    }
                    Message::NotInterested => {
                        if self.last_interest == Some(false) {
                            return true;
                        }
                        self.last_interest = Some(false);
                    }
                    Message::Request(..) => {
                        self.outstanding += 1;
                        if !*snub_armed {
                            snub_deadline.reset(Instant::now() + self.piece_timeout);
                            *snub_armed = true;
                        }
                    }
                    Message::Cancel(..) => {
                        self.outstanding = self.outstanding.saturating_sub(1);
                        if self.outstanding == 0 {
                            *snub_armed = false;
                        }
                    }
                    _ => {}
                }
                if self.writer_tx.try_send(WriterItem::Wire(message)).is_err() {
                    event!(Level::DEBUG, peer = %self.addr, "Writer queue unavailable");
                    return false;
                }
                true
            }
            SessionCommand::ServeBlock { block, reader } => {
                let item = WriterItem::Upload {
                    block,
                    reader,
                    queued: Instant::now(),
                };
                if self.writer_tx.try_send(item).is_err() {
                    event!(Level::DEBUG, peer = %self.addr, "Writer queue unavailable");
                    return false;
                }
                true
            }
            SessionCommand::CancelServe { block } => {
                let mut cancels = self.cancels.lock().await;
                if cancels.len() >= CANCEL_BUFFER_LIMIT {
                    cancels.pop_front();
                }
                cancels.push_back((block.piece_index, block.offset));
                true
            }
            SessionCommand::Disconnect => false,
        }
    }
}

async fn reader_task<R>(
    mut read_half: R,
    addr: SocketAddr,
    tx: Sender<Message>,
    mut shutdown_rx: broadcast::Receiver<()>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            incoming = read_message(&mut read_half) => {
                match incoming {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        event!(Level::DEBUG, peer = %addr, error = %e, "Read loop ended");
                        break;
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn writer_task<W>(
    mut write_half: W,
    mut rx: Receiver<WriterItem>,
    addr: SocketAddr,
    engine_tx: Sender<EngineMessage>,
    cancels: Arc<Mutex<VecDeque<(u32, u32)>>>,
    request_ttl: Duration,
    error_tx: oneshot::Sender<std::io::Error>,
    mut shutdown_rx: broadcast::Receiver<()>,
) where
    W: AsyncWriteExt + Unpin + Send + 'static,
{
    // Reusable aggregation buffer; one block plus headers in the common case.
    let mut batch = Vec::with_capacity(16 * 1024 + 1024);
    let mut error_tx = Some(error_tx);

    'writer: loop {
        batch.clear();
        let mut served: Vec<u32> = Vec::new();

        let first = tokio::select! {
            _ = shutdown_rx.recv() => {
                event!(Level::TRACE, peer = %addr, "Writer task shutting down");
                break;
            }
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        // Greedy batching: fold immediately available items into one
        // socket write to cut syscalls.
        let mut items = Vec::with_capacity(WRITE_BATCH_ITEMS);
        items.push(first);
        while items.len() < WRITE_BATCH_ITEMS {
            match rx.try_recv() {
                Ok(item) => items.push(item),
                Err(_) => break,
            }
        }

        for item in items {
            match item {
                WriterItem::Wire(message) => match encode_message(&message) {
                    Ok(bytes) => batch.extend_from_slice(&bytes),
                    Err(e) => {
                        event!(Level::ERROR, peer = %addr, "Failed to encode message: {}", e);
                        break 'writer;
                    }
                },
                WriterItem::Upload { block, reader, queued } => {
                    if queued.elapsed() > request_ttl {
                        event!(Level::TRACE, peer = %addr, ?block, "Dropping stale request");
                        continue;
                    }
                    if cancels
                        .lock()
                        .await
                        .contains(&(block.piece_index, block.offset))
                    {
                        event!(Level::TRACE, peer = %addr, ?block, "Dropping cancelled request");
                        continue;
                    }
                    match reader.read_block(block).await {
                        Ok(data) => {
                            let message = Message::Piece(block.piece_index, block.offset, data);
                            match encode_message(&message) {
                                Ok(bytes) => {
                                    batch.extend_from_slice(&bytes);
                                    served.push(block.length);
                                }
                                Err(e) => {
                                    event!(Level::ERROR, peer = %addr, "Failed to encode piece: {}", e);
                                    break 'writer;
                                }
                            }
                        }
                        Err(e) => {
                            event!(Level::WARN, peer = %addr, ?block, error = %e, "Upload read failed");
                        }
                    }
                }
            }
        }

        if batch.is_empty() {
            continue;
        }
        if let Err(e) = write_half.write_all(&batch).await {
            if let Some(tx) = error_tx.take() {
                let _ = tx.send(e);
            }
            break;
        }
        for length in served {
            let _ = engine_tx.try_send(EngineMessage::Peer(
                addr,
                SessionEvent::BlockSent { length },
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::storage::FileMap;
    use crate::peer::protocol::decode_frame;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    async fn read_wire_message(network: &mut DuplexStream) -> Message {
        let mut len_buf = [0u8; 4];
        network.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf);
        if len == 0 {
            return Message::KeepAlive;
        }
        let mut frame = vec![0u8; len as usize];
        network.read_exact(&mut frame).await.unwrap();
        decode_frame(&frame).unwrap()
    }

    fn spawn_test_session(
        piece_timeout: Duration,
    ) -> (
        DuplexStream,
        mpsc::Sender<SessionCommand>,
        mpsc::Receiver<EngineMessage>,
    ) {
        let (session_socket, peer_socket) = tokio::io::duplex(64 * 1024);
        let (engine_tx, engine_rx) = mpsc::channel(100);
        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let (shutdown_tx, _) = broadcast::channel(1);

        let addr: SocketAddr = "127.0.0.1:51413".parse().unwrap();
        let session = PeerSession::new(PeerSessionParams {
            addr,
            engine_tx,
            command_rx: cmd_rx,
            piece_timeout,
            request_ttl: Duration::from_secs(20),
            read_buffer_size: 16 * 1024 + 1024,
            shutdown_tx,
        });
        tokio::spawn(session.run(session_socket));

        (peer_socket, cmd_tx, engine_rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<EngineMessage>) -> SessionEvent {
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(EngineMessage::Peer(_, event))) => event,
            _ => panic!("expected a session event"),
        }
    }

    #[tokio::test]
    async fn test_commands_reach_the_wire_and_messages_reach_the_engine() {
        let (mut network, cmd_tx, mut engine_rx) = spawn_test_session(Duration::from_secs(20));

        cmd_tx
            .send(SessionCommand::Send(Message::Request(0, 0, 16384)))
            .await
            .unwrap();
        assert_eq!(read_wire_message(&mut network).await, Message::Request(0, 0, 16384));

        let piece = encode_message(&Message::Piece(0, 0, vec![7u8; 16])).unwrap();
        network.write_all(&piece).await.unwrap();

        match next_event(&mut engine_rx).await {
            SessionEvent::Message(Message::Piece(0, 0, data)) => assert_eq!(data, vec![7u8; 16]),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_interested_transitions_are_coalesced() {
        let (mut network, cmd_tx, _engine_rx) = spawn_test_session(Duration::from_secs(20));

        for _ in 0..3 {
            cmd_tx
                .send(SessionCommand::Send(Message::Interested))
                .await
                .unwrap();
        }
        cmd_tx
            .send(SessionCommand::Send(Message::NotInterested))
            .await
            .unwrap();
        cmd_tx
            .send(SessionCommand::Send(Message::NotInterested))
            .await
            .unwrap();
        // A distinct marker proves nothing else was queued in between.
        cmd_tx
            .send(SessionCommand::Send(Message::Have(42)))
            .await
            .unwrap();

        assert_eq!(read_wire_message(&mut network).await, Message::Interested);
        assert_eq!(read_wire_message(&mut network).await, Message::NotInterested);
        assert_eq!(read_wire_message(&mut network).await, Message::Have(42));
    }

    #[tokio::test]
    async fn test_snub_timer_fires_without_piece_traffic() {
        let (_network, cmd_tx, mut engine_rx) = spawn_test_session(Duration::from_millis(50));

        cmd_tx
            .send(SessionCommand::Send(Message::Request(0, 0, 16384)))
            .await
            .unwrap();

        loop {
            match next_event(&mut engine_rx).await {
                SessionEvent::Snubbed => break,
                SessionEvent::Message(_) => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_cancelled_upload_is_dropped_before_send() {
        let (mut network, cmd_tx, _engine_rx) = spawn_test_session(Duration::from_secs(20));

        let dir = tempfile::tempdir().unwrap();
        let info = crate::metainfo::Info {
            piece_length: 8,
            pieces: vec![0; 20],
            private: None,
            files: Vec::new(),
            name: "upload.bin".to_string(),
            length: 8,
            md5sum: None,
        };
        let files = Arc::new(FileMap::from_info(dir.path(), &info));
        let reader = Arc::new(PieceReader::new(files, 8, 4));
        reader.insert(0, Arc::new(vec![5u8; 8])).await;

        let cancelled = BlockInfo { piece_index: 0, offset: 0, length: 8 };
        cmd_tx
            .send(SessionCommand::CancelServe { block: cancelled })
            .await
            .unwrap();
        cmd_tx
            .send(SessionCommand::ServeBlock { block: cancelled, reader: reader.clone() })
            .await
            .unwrap();
        // A second, uncancelled request proves the first was skipped.
        let wanted = BlockInfo { piece_index: 0, offset: 4, length: 4 };
        cmd_tx
            .send(SessionCommand::ServeBlock { block: wanted, reader })
            .await
            .unwrap();

        match read_wire_message(&mut network).await {
            Message::Piece(0, 4, data) => assert_eq!(data, vec![5u8; 4]),
            other => panic!("unexpected wire message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_served_blocks_are_reported() {
        let (mut network, cmd_tx, mut engine_rx) = spawn_test_session(Duration::from_secs(20));

        let dir = tempfile::tempdir().unwrap();
        let info = crate::metainfo::Info {
            piece_length: 8,
            pieces: vec![0; 20],
            private: None,
            files: Vec::new(),
            name: "upload.bin".to_string(),
            length: 8,
            md5sum: None,
        };
        let files = Arc::new(FileMap::from_info(dir.path(), &info));
        let reader = Arc::new(PieceReader::new(files, 8, 4));
        reader.insert(0, Arc::new(vec![1u8; 8])).await;

        cmd_tx
            .send(SessionCommand::ServeBlock {
                block: BlockInfo { piece_index: 0, offset: 0, length: 8 },
                reader,
            })
            .await
            .unwrap();

        assert!(matches!(
            read_wire_message(&mut network).await,
            Message::Piece(0, 0, _)
        ));
        loop {
            match next_event(&mut engine_rx).await {
                SessionEvent::BlockSent { length } => {
                    assert_eq!(length, 8);
                    break;
                }
                SessionEvent::Message(_) => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }
}
