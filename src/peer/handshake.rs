// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::engine::EngineMessage;
use crate::metainfo::InfoHash;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Duration};

use tracing::{event, Level};

use std::error::Error as StdError;
use std::fmt;
use std::net::SocketAddr;

pub const HANDSHAKE_LEN: usize = 68;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

// Reserved-bit positions, counted from bit 0 = MSB of byte 0.
const LTEP_BYTE: usize = 5; // bit 43
const LTEP_MASK: u8 = 0x10;
const FAST_BYTE: usize = 7; // bit 61
const FAST_MASK: u8 = 0x04;
const DHT_BYTE: usize = 7; // bit 63
const DHT_MASK: u8 = 0x01;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extensions {
    pub fast: bool,
    pub ltep: bool,
    pub dht: bool,
}

#[derive(Debug)]
pub enum HandshakeError {
    BadProtocol,
    InfoHashMismatch,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::BadProtocol => write!(f, "peer does not speak BitTorrent protocol"),
            HandshakeError::InfoHashMismatch => write!(f, "info hash mismatch with peer"),
        }
    }
}

impl StdError for HandshakeError {}

pub fn encode_handshake(
    info_hash: &InfoHash,
    peer_id: &[u8; 20],
    extensions: Extensions,
) -> [u8; HANDSHAKE_LEN] {
    let mut buf = [0u8; HANDSHAKE_LEN];
    buf[0] = PROTOCOL.len() as u8;
    buf[1..20].copy_from_slice(PROTOCOL);
    if extensions.ltep {
        buf[20 + LTEP_BYTE] |= LTEP_MASK;
    }
    if extensions.fast {
        buf[20 + FAST_BYTE] |= FAST_MASK;
    }
    if extensions.dht {
        buf[20 + DHT_BYTE] |= DHT_MASK;
    }
    buf[28..48].copy_from_slice(info_hash.as_bytes());
    buf[48..68].copy_from_slice(peer_id);
    buf
}

pub fn parse_handshake(
    buf: &[u8; HANDSHAKE_LEN],
) -> Result<(InfoHash, [u8; 20], Extensions), HandshakeError> {
    if buf[0] as usize != PROTOCOL.len() || &buf[1..20] != PROTOCOL {
        return Err(HandshakeError::BadProtocol);
    }
    let reserved = &buf[20..28];
    let extensions = Extensions {
        ltep: reserved[LTEP_BYTE] & LTEP_MASK != 0,
        fast: reserved[FAST_BYTE] & FAST_MASK != 0,
        dht: reserved[DHT_BYTE] & DHT_MASK != 0,
    };
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&buf[28..48]);
    let mut peer_id = [0u8; 20];
    peer_id.copy_from_slice(&buf[48..68]);
    Ok((InfoHash(info_hash), peer_id, extensions))
}

/// An authenticated connection, ready to hand to a peer session.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub stream: TcpStream,
    pub addr: SocketAddr,
    pub peer_id: [u8; 20],
    pub extensions: Extensions,
    pub incoming: bool,
}

pub(crate) struct HandshakerParams {
    pub info_hash: InfoHash,
    pub local_peer_id: [u8; 20],
    pub local_extensions: Extensions,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub engine_tx: mpsc::Sender<EngineMessage>,
    pub shutdown_rx: broadcast::Receiver<()>,
}

#[derive(Clone, Copy)]
struct HandshakeConfig {
    info_hash: InfoHash,
    local_peer_id: [u8; 20],
    local_extensions: Extensions,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

async fn outgoing_handshake(
    addr: SocketAddr,
    config: HandshakeConfig,
) -> Result<HandshakeOutcome, Box<dyn StdError + Send + Sync>> {
    let mut stream = timeout(config.connect_timeout, TcpStream::connect(addr)).await??;
    let ours = encode_handshake(&config.info_hash, &config.local_peer_id, config.local_extensions);
    stream.write_all(&ours).await?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    timeout(config.handshake_timeout, stream.read_exact(&mut buf)).await??;
    let (info_hash, peer_id, extensions) = parse_handshake(&buf)?;
    if info_hash != config.info_hash {
        return Err(HandshakeError::InfoHashMismatch.into());
    }
    Ok(HandshakeOutcome {
        stream,
        addr,
        peer_id,
        extensions,
        incoming: false,
    })
}

async fn incoming_handshake(
    mut stream: TcpStream,
    addr: SocketAddr,
    config: HandshakeConfig,
) -> Result<HandshakeOutcome, Box<dyn StdError + Send + Sync>> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    timeout(config.handshake_timeout, stream.read_exact(&mut buf)).await??;
    let (info_hash, peer_id, extensions) = parse_handshake(&buf)?;
    if info_hash != config.info_hash {
        return Err(HandshakeError::InfoHashMismatch.into());
    }
    let ours = encode_handshake(&config.info_hash, &config.local_peer_id, config.local_extensions);
    stream.write_all(&ours).await?;
    Ok(HandshakeOutcome {
        stream,
        addr,
        peer_id,
        extensions,
        incoming: true,
    })
}

impl HandshakerParams {
    fn split(self) -> (HandshakeConfig, mpsc::Sender<EngineMessage>, broadcast::Receiver<()>) {
        let config = HandshakeConfig {
            info_hash: self.info_hash,
            local_peer_id: self.local_peer_id,
            local_extensions: self.local_extensions,
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
        };
        (config, self.engine_tx, self.shutdown_rx)
    }
}

pub(crate) fn spawn_outgoing(addr: SocketAddr, params: HandshakerParams) {
    let (config, engine_tx, mut shutdown_rx) = params.split();
    tokio::spawn(async move {
        let result = tokio::select! {
            res = outgoing_handshake(addr, config) => res,
            _ = shutdown_rx.recv() => return,
        };
        let msg = match result {
            Ok(outcome) => EngineMessage::Handshaked(outcome),
            Err(e) => {
                event!(Level::DEBUG, peer = %addr, error = %e, "Outgoing handshake failed");
                EngineMessage::HandshakeFailed { addr, outgoing: true }
            }
        };
        let _ = engine_tx.send(msg).await;
    });
}

pub(crate) fn spawn_incoming(stream: TcpStream, params: HandshakerParams) {
    let (config, engine_tx, mut shutdown_rx) = params.split();
    tokio::spawn(async move {
        let addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                event!(Level::DEBUG, error = %e, "Incoming connection has no peer address");
                return;
            }
        };
        let result = tokio::select! {
            res = incoming_handshake(stream, addr, config) => res,
            _ = shutdown_rx.recv() => return,
        };
        let msg = match result {
            Ok(outcome) => EngineMessage::Handshaked(outcome),
            Err(e) => {
                event!(Level::DEBUG, peer = %addr, error = %e, "Incoming handshake failed");
                EngineMessage::HandshakeFailed { addr, outgoing: false }
            }
        };
        let _ = engine_tx.send(msg).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sets_reserved_bits() {
        let info_hash = InfoHash([7u8; 20]);
        let peer_id = *b"-UC0100-abcdefghijkl";
        let buf = encode_handshake(
            &info_hash,
            &peer_id,
            Extensions { fast: true, ltep: true, dht: true },
        );

        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(buf[25] & 0x10, 0x10); // bit 43, LTEP
        assert_eq!(buf[27] & 0x04, 0x04); // bit 61, Fast
        assert_eq!(buf[27] & 0x01, 0x01); // bit 63, DHT
        assert_eq!(&buf[28..48], &[7u8; 20]);
        assert_eq!(&buf[48..68], &peer_id);
    }

    #[test]
    fn test_parse_roundtrip() {
        let info_hash = InfoHash([1u8; 20]);
        let peer_id = *b"-UC0100-000000000000";
        let ext = Extensions { fast: true, ltep: false, dht: false };
        let buf = encode_handshake(&info_hash, &peer_id, ext);
        let (hash, id, parsed_ext) = parse_handshake(&buf).unwrap();
        assert_eq!(hash, info_hash);
        assert_eq!(id, peer_id);
        assert_eq!(parsed_ext, ext);
    }

    #[test]
    fn test_parse_rejects_wrong_protocol() {
        let mut buf = encode_handshake(
            &InfoHash([0u8; 20]),
            b"-UC0100-000000000000",
            Extensions::default(),
        );
        buf[1] = b'X';
        assert!(matches!(parse_handshake(&buf), Err(HandshakeError::BadProtocol)));
    }

    #[tokio::test]
    async fn test_outgoing_handshake_against_mock_seed() {
        use tokio::net::TcpListener;
        use tokio::sync::broadcast;

        let info_hash = InfoHash([9u8; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let remote_id = *b"-XX0001-remoteremote";
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; HANDSHAKE_LEN];
            socket.read_exact(&mut buf).await.unwrap();
            let reply = encode_handshake(
                &InfoHash([9u8; 20]),
                &remote_id,
                Extensions { fast: true, ltep: true, dht: false },
            );
            socket.write_all(&reply).await.unwrap();
            // Hold the socket open until the client is done with it.
            let _ = socket.read(&mut [0u8; 1]).await;
        });

        let (engine_tx, mut engine_rx) = mpsc::channel(4);
        let (shutdown_tx, _) = broadcast::channel(1);
        spawn_outgoing(
            addr,
            HandshakerParams {
                info_hash,
                local_peer_id: *b"-UC0100-locallocallo",
                local_extensions: Extensions { fast: true, ltep: true, dht: false },
                connect_timeout: Duration::from_secs(2),
                handshake_timeout: Duration::from_secs(2),
                engine_tx,
                shutdown_rx: shutdown_tx.subscribe(),
            },
        );

        match engine_rx.recv().await.unwrap() {
            EngineMessage::Handshaked(outcome) => {
                assert_eq!(outcome.addr, addr);
                assert_eq!(outcome.peer_id, remote_id);
                assert!(outcome.extensions.fast);
                assert!(outcome.extensions.ltep);
                assert!(!outcome.incoming);
            }
            other => panic!("unexpected engine message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_outgoing_handshake_rejects_wrong_hash() {
        use tokio::net::TcpListener;
        use tokio::sync::broadcast;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; HANDSHAKE_LEN];
            socket.read_exact(&mut buf).await.unwrap();
            let reply = encode_handshake(
                &InfoHash([1u8; 20]),
                b"-XX0001-remoteremote",
                Extensions::default(),
            );
            socket.write_all(&reply).await.unwrap();
        });

        let (engine_tx, mut engine_rx) = mpsc::channel(4);
        let (shutdown_tx, _) = broadcast::channel(1);
        spawn_outgoing(
            addr,
            HandshakerParams {
                info_hash: InfoHash([2u8; 20]),
                local_peer_id: *b"-UC0100-locallocallo",
                local_extensions: Extensions::default(),
                connect_timeout: Duration::from_secs(2),
                handshake_timeout: Duration::from_secs(2),
                engine_tx,
                shutdown_rx: shutdown_tx.subscribe(),
            },
        );

        assert!(matches!(
            engine_rx.recv().await.unwrap(),
            EngineMessage::HandshakeFailed { outgoing: true, .. }
        ));
    }
}
