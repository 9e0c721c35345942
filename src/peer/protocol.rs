// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::metainfo::InfoHash;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use strum::IntoEnumIterator;
use strum_macros::EnumIter;

use tokio::io::AsyncReadExt;

use std::collections::HashMap;
use std::fmt;
use std::io::{Error, ErrorKind};
use std::net::SocketAddrV4;

/// Transfer unit. Pieces are requested in blocks of this size; the last
/// block of a piece may be shorter.
pub const BLOCK_SIZE: u32 = 16_384;

/// Frame cap: one block plus headroom for headers and bencoded extension
/// dictionaries. Anything longer is a corrupt or hostile stream.
pub const MAX_MESSAGE_LEN: u32 = BLOCK_SIZE + 1024;

/// Peers asking for more than this per request get disconnected.
pub const MAX_REQUEST_LENGTH: u32 = 131_072;

#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub offset: u32,
    pub length: u32,
}

/// Blocks of a piece in ascending offset order.
pub fn calculate_blocks(piece_index: u32, piece_size: u32) -> Vec<BlockInfo> {
    let mut blocks = Vec::with_capacity(piece_size.div_ceil(BLOCK_SIZE) as usize);
    let mut offset = 0;
    while offset < piece_size {
        let length = std::cmp::min(BLOCK_SIZE, piece_size - offset);
        blocks.push(BlockInfo {
            piece_index,
            offset,
            length,
        });
        offset += length;
    }
    blocks
}

#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    Port(u16),

    // BEP 6 (Fast extension)
    SuggestPiece(u32),
    HaveAll,
    HaveNone,
    RejectRequest(u32, u32, u32),
    AllowedFast(u32),

    // BEP 10
    Extended(u8, Vec<u8>),
}

pub struct MessageSummary<'a>(pub &'a Message);
impl fmt::Debug for MessageSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Message::Bitfield(bitfield) => {
                write!(f, "BITFIELD(len: {})", bitfield.len())
            }
            Message::Piece(index, begin, data) => {
                write!(
                    f,
                    "PIECE(index: {}, begin: {}, len: {})",
                    index,
                    begin,
                    data.len()
                )
            }
            Message::Extended(id, payload) => {
                write!(f, "EXTENDED(id: {}, len: {})", id, payload.len())
            }
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug)]
pub enum MessageEncodeError {
    PayloadTooLarge(String),
}

impl fmt::Display for MessageEncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageEncodeError::PayloadTooLarge(s) => write!(f, "Payload too large: {}", s),
        }
    }
}

impl std::error::Error for MessageEncodeError {}

fn fixed(id: u8, fields: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(5 + fields.len() * 4);
    bytes.extend((1 + fields.len() as u32 * 4).to_be_bytes());
    bytes.push(id);
    for field in fields {
        bytes.extend(field.to_be_bytes());
    }
    bytes
}

pub fn encode_message(message: &Message) -> Result<Vec<u8>, MessageEncodeError> {
    match message {
        Message::KeepAlive => Ok([0, 0, 0, 0].to_vec()),
        Message::Choke => Ok(fixed(0, &[])),
        Message::Unchoke => Ok(fixed(1, &[])),
        Message::Interested => Ok(fixed(2, &[])),
        Message::NotInterested => Ok(fixed(3, &[])),
        Message::Have(index) => Ok(fixed(4, &[*index])),
        Message::Bitfield(bitfield) => {
            let message_len: u32 = (1 + bitfield.len())
                .try_into()
                .map_err(|_| MessageEncodeError::PayloadTooLarge("Bitfield".to_string()))?;
            let mut bytes = Vec::with_capacity(4 + message_len as usize);
            bytes.extend(message_len.to_be_bytes());
            bytes.push(5);
            bytes.extend_from_slice(bitfield);
            Ok(bytes)
        }
        Message::Request(index, begin, length) => Ok(fixed(6, &[*index, *begin, *length])),
        Message::Piece(index, begin, block) => {
            let message_len: u32 = (9 + block.len())
                .try_into()
                .map_err(|_| MessageEncodeError::PayloadTooLarge("Piece".to_string()))?;
            let mut bytes = Vec::with_capacity(4 + message_len as usize);
            bytes.extend(message_len.to_be_bytes());
            bytes.push(7);
            bytes.extend(index.to_be_bytes());
            bytes.extend(begin.to_be_bytes());
            bytes.extend_from_slice(block);
            Ok(bytes)
        }
        Message::Cancel(index, begin, length) => Ok(fixed(8, &[*index, *begin, *length])),
        Message::Port(port) => {
            let mut bytes = vec![0, 0, 0, 3, 9];
            bytes.extend(port.to_be_bytes());
            Ok(bytes)
        }
        Message::SuggestPiece(index) => Ok(fixed(0x0D, &[*index])),
        Message::HaveAll => Ok(fixed(0x0E, &[])),
        Message::HaveNone => Ok(fixed(0x0F, &[])),
        Message::RejectRequest(index, begin, length) => {
            Ok(fixed(0x10, &[*index, *begin, *length]))
        }
        Message::AllowedFast(index) => Ok(fixed(0x11, &[*index])),
        Message::Extended(extended_id, payload) => {
            let message_len: u32 = (2 + payload.len())
                .try_into()
                .map_err(|_| MessageEncodeError::PayloadTooLarge("Extended".to_string()))?;
            let mut bytes = Vec::with_capacity(4 + message_len as usize);
            bytes.extend(message_len.to_be_bytes());
            bytes.push(20);
            bytes.push(*extended_id);
            bytes.extend_from_slice(payload);
            Ok(bytes)
        }
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes(bytes.try_into().unwrap())
}

fn index_payload(payload: &[u8], name: &str) -> std::io::Result<u32> {
    if payload.len() != 4 {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid payload size for {}", name),
        ));
    }
    Ok(be_u32(payload))
}

fn triple_payload(payload: &[u8], name: &str) -> std::io::Result<(u32, u32, u32)> {
    if payload.len() != 12 {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid payload size for {}", name),
        ));
    }
    Ok((be_u32(&payload[0..4]), be_u32(&payload[4..8]), be_u32(&payload[8..12])))
}

fn empty_payload(payload: &[u8], name: &str) -> std::io::Result<()> {
    if !payload.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Unexpected payload for {}", name),
        ));
    }
    Ok(())
}

/// Decodes one complete frame (message id + payload, the bytes after a
/// nonzero length prefix).
pub fn decode_frame(frame: &[u8]) -> std::io::Result<Message> {
    let (message_id, payload) = frame
        .split_first()
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "Empty frame"))?;

    match message_id {
        0 => empty_payload(payload, "Choke").map(|_| Message::Choke),
        1 => empty_payload(payload, "Unchoke").map(|_| Message::Unchoke),
        2 => empty_payload(payload, "Interested").map(|_| Message::Interested),
        3 => empty_payload(payload, "NotInterested").map(|_| Message::NotInterested),
        4 => index_payload(payload, "Have").map(Message::Have),
        5 => Ok(Message::Bitfield(payload.to_vec())),
        6 => triple_payload(payload, "Request").map(|(i, b, l)| Message::Request(i, b, l)),
        7 => {
            if payload.len() < 8 {
                return Err(Error::new(ErrorKind::InvalidData, "Invalid payload size for Piece"));
            }
            let data = &payload[8..];
            if data.len() as u32 > BLOCK_SIZE {
                return Err(Error::new(ErrorKind::InvalidData, "Piece block exceeds block size"));
            }
            Ok(Message::Piece(
                be_u32(&payload[0..4]),
                be_u32(&payload[4..8]),
                data.to_vec(),
            ))
        }
        8 => triple_payload(payload, "Cancel").map(|(i, b, l)| Message::Cancel(i, b, l)),
        9 => {
            if payload.len() != 2 {
                return Err(Error::new(ErrorKind::InvalidData, "Invalid payload size for Port"));
            }
            Ok(Message::Port(u16::from_be_bytes(payload.try_into().unwrap())))
        }
        0x0D => index_payload(payload, "SuggestPiece").map(Message::SuggestPiece),
        0x0E => empty_payload(payload, "HaveAll").map(|_| Message::HaveAll),
        0x0F => empty_payload(payload, "HaveNone").map(|_| Message::HaveNone),
        0x10 => {
            triple_payload(payload, "RejectRequest").map(|(i, b, l)| Message::RejectRequest(i, b, l))
        }
        0x11 => index_payload(payload, "AllowedFast").map(Message::AllowedFast),
        20 => {
            let (extended_id, extended_payload) = payload.split_first().ok_or_else(|| {
                Error::new(ErrorKind::InvalidData, "Empty payload for Extended message")
            })?;
            Ok(Message::Extended(*extended_id, extended_payload.to_vec()))
        }
        other => Err(Error::new(
            ErrorKind::InvalidData,
            format!("Unknown message ID: {}", other),
        )),
    }
}

/// Reads one length-prefixed message off the wire. `UnexpectedEof` means
/// the peer hung up between messages.
pub async fn read_message<R>(stream: &mut R) -> std::io::Result<Message>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let message_len = u32::from_be_bytes(len_buf);

    if message_len == 0 {
        return Ok(Message::KeepAlive);
    }
    if message_len > MAX_MESSAGE_LEN {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Frame length {} exceeds maximum", message_len),
        ));
    }

    let mut frame = vec![0u8; message_len as usize];
    stream.read_exact(&mut frame).await?;
    decode_frame(&frame)
}

// ---------------------------------------------------------------------------
// BEP 10 / BEP 9 / BEP 11 payloads
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, EnumIter)]
pub enum LocalExtensionId {
    Handshake = 0,
    UtPex = 1,
    UtMetadata = 2,
}

impl LocalExtensionId {
    pub fn id(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LocalExtensionId::Handshake => "handshake",
            LocalExtensionId::UtPex => "ut_pex",
            LocalExtensionId::UtMetadata => "ut_metadata",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExtendedHandshake {
    pub m: HashMap<String, u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<i64>,
}

impl ExtendedHandshake {
    pub fn ut_metadata(&self) -> Option<u8> {
        self.m.get(LocalExtensionId::UtMetadata.as_str()).copied().filter(|&id| id != 0)
    }

    pub fn ut_pex(&self) -> Option<u8> {
        self.m.get(LocalExtensionId::UtPex.as_str()).copied().filter(|&id| id != 0)
    }
}

/// Our side of the extended handshake, advertising ut_pex and ut_metadata
/// plus the metadata size when we already hold the info dictionary.
pub fn extended_handshake_payload(
    metadata_size: Option<i64>,
) -> Result<Vec<u8>, serde_bencode::Error> {
    let m: HashMap<String, u8> = LocalExtensionId::iter()
        .filter(|&variant| variant != LocalExtensionId::Handshake)
        .map(|variant| (variant.as_str().to_string(), variant.id()))
        .collect();
    serde_bencode::to_bytes(&ExtendedHandshake { m, metadata_size })
}

pub const METADATA_MSG_REQUEST: u8 = 0;
pub const METADATA_MSG_DATA: u8 = 1;
pub const METADATA_MSG_REJECT: u8 = 2;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct MetadataMessage {
    /// 0 for request, 1 for data, 2 for reject.
    pub msg_type: u8,

    pub piece: u32,

    /// Only present in 'data' messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<i64>,
}

/// Byte offset just past the bencoded dictionary starting at `buf[0]`.
/// ut_metadata data messages append the raw block right after the
/// dictionary, so the decoder has to find where it ends.
fn bencode_dict_end(buf: &[u8]) -> Option<usize> {
    if buf.first() != Some(&b'd') {
        return None;
    }
    let mut i = 1;
    let mut depth = 1usize;
    while depth > 0 {
        match *buf.get(i)? {
            b'd' | b'l' => {
                depth += 1;
                i += 1;
            }
            b'e' => {
                depth -= 1;
                i += 1;
            }
            b'i' => {
                let end = buf[i + 1..].iter().position(|&c| c == b'e')?;
                i += end + 2;
            }
            b'0'..=b'9' => {
                let colon = buf[i..].iter().position(|&c| c == b':')?;
                let len: usize = std::str::from_utf8(&buf[i..i + colon]).ok()?.parse().ok()?;
                i += colon + 1 + len;
                if i > buf.len() {
                    return None;
                }
            }
            _ => return None,
        }
    }
    Some(i)
}

/// Splits a ut_metadata payload into its header dictionary and the
/// trailing block bytes (empty for request/reject messages).
pub fn split_metadata_payload(payload: &[u8]) -> std::io::Result<(MetadataMessage, &[u8])> {
    let end = bencode_dict_end(payload)
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "Malformed ut_metadata header"))?;
    let header: MetadataMessage = serde_bencode::from_bytes(&payload[..end])
        .map_err(|e| Error::new(ErrorKind::InvalidData, format!("ut_metadata header: {}", e)))?;
    Ok((header, &payload[end..]))
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct PexMessage {
    #[serde(with = "serde_bytes", default)]
    pub added: Vec<u8>,
    #[serde(rename = "added.f", with = "serde_bytes", default)]
    pub added_f: Vec<u8>,
    #[serde(with = "serde_bytes", default)]
    pub dropped: Vec<u8>,
}

pub fn compact_to_addrs(bytes: &[u8]) -> Vec<SocketAddrV4> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect()
}

pub fn addrs_to_compact<'a, I>(addrs: I) -> Vec<u8>
where
    I: Iterator<Item = &'a SocketAddrV4>,
{
    let mut bytes = Vec::new();
    for addr in addrs {
        bytes.extend_from_slice(&addr.ip().octets());
        bytes.extend_from_slice(&addr.port().to_be_bytes());
    }
    bytes
}

// ---------------------------------------------------------------------------
// BEP 6 allowed-fast generation
// ---------------------------------------------------------------------------

/// The canonical allowed-fast set for a peer: the peer's /24 network
/// concatenated with the info-hash, hashed repeatedly, each digest yielding
/// up to five piece indices. Stable for the lifetime of the connection.
pub fn allowed_fast_set(
    ip: std::net::Ipv4Addr,
    info_hash: &InfoHash,
    num_pieces: u32,
    count: usize,
) -> Vec<u32> {
    if num_pieces == 0 || count == 0 {
        return Vec::new();
    }
    let count = std::cmp::min(count, num_pieces as usize);

    let mut x = Vec::with_capacity(24);
    let masked = u32::from(ip) & 0xFFFF_FF00;
    x.extend_from_slice(&masked.to_be_bytes());
    x.extend_from_slice(info_hash.as_bytes());

    let mut pieces = Vec::with_capacity(count);
    while pieces.len() < count {
        x = Sha1::digest(&x).to_vec();
        for chunk in x.chunks_exact(4) {
            if pieces.len() >= count {
                break;
            }
            let index = be_u32(chunk) % num_pieces;
            if !pieces.contains(&index) {
                pieces.push(index);
            }
        }
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection;
    use proptest::prelude::*;

    fn roundtrip(msg: Message) {
        let bytes = encode_message(&msg).unwrap();
        let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        if len == 0 {
            assert_eq!(msg, Message::KeepAlive);
            return;
        }
        let parsed = decode_frame(&bytes[4..]).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn test_all_message_roundtrips() {
        roundtrip(Message::KeepAlive);
        roundtrip(Message::Choke);
        roundtrip(Message::Unchoke);
        roundtrip(Message::Interested);
        roundtrip(Message::NotInterested);
        roundtrip(Message::Have(123));
        roundtrip(Message::Bitfield(vec![0b10101010, 0b01010101]));
        roundtrip(Message::Request(1, 16384, 16384));
        roundtrip(Message::Piece(1, 16384, vec![1, 2, 3, 4, 5]));
        roundtrip(Message::Cancel(1, 16384, 16384));
        roundtrip(Message::Port(6881));
        roundtrip(Message::SuggestPiece(9));
        roundtrip(Message::HaveAll);
        roundtrip(Message::HaveNone);
        roundtrip(Message::RejectRequest(0, 0, 16384));
        roundtrip(Message::AllowedFast(7));
        roundtrip(Message::Extended(1, vec![10, 20, 30]));
    }

    #[tokio::test]
    async fn test_read_message_from_stream() {
        let bytes = encode_message(&Message::Request(3, 0, 16384)).unwrap();
        let mut reader = &bytes[..];
        let parsed = read_message(&mut reader).await.unwrap();
        assert_eq!(parsed, Message::Request(3, 0, 16384));
    }

    #[tokio::test]
    async fn test_read_message_rejects_oversized_frame() {
        let mut bytes = (MAX_MESSAGE_LEN + 1).to_be_bytes().to_vec();
        bytes.extend([7u8; 32]);
        let mut reader = &bytes[..];
        let err = read_message(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_unknown_id_is_rejected() {
        let err = decode_frame(&[42u8, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_oversized_block_is_rejected() {
        let mut frame = vec![7u8];
        frame.extend(0u32.to_be_bytes());
        frame.extend(0u32.to_be_bytes());
        frame.extend(vec![0u8; BLOCK_SIZE as usize + 1]);
        let err = decode_frame(&frame).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_calculate_blocks_ascending_with_short_tail() {
        let blocks = calculate_blocks(2, BLOCK_SIZE * 2 + 100);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].offset, BLOCK_SIZE);
        assert_eq!(blocks[2].offset, BLOCK_SIZE * 2);
        assert_eq!(blocks[2].length, 100);
        assert!(blocks.iter().all(|b| b.piece_index == 2));
    }

    #[test]
    fn test_extended_handshake_payload_parses_back() {
        let payload = extended_handshake_payload(Some(12345)).unwrap();
        let parsed: ExtendedHandshake = serde_bencode::from_bytes(&payload).unwrap();
        assert_eq!(parsed.metadata_size, Some(12345));
        assert_eq!(parsed.ut_pex(), Some(LocalExtensionId::UtPex.id()));
        assert_eq!(parsed.ut_metadata(), Some(LocalExtensionId::UtMetadata.id()));
    }

    #[test]
    fn test_split_metadata_data_message() {
        let header = MetadataMessage {
            msg_type: METADATA_MSG_DATA,
            piece: 0,
            total_size: Some(20),
        };
        let mut payload = serde_bencode::to_bytes(&header).unwrap();
        payload.extend_from_slice(b"raw metadata payload");

        let (parsed, rest) = split_metadata_payload(&payload).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(rest, b"raw metadata payload");
    }

    #[test]
    fn test_split_metadata_request_has_no_trailer() {
        let header = MetadataMessage {
            msg_type: METADATA_MSG_REQUEST,
            piece: 3,
            total_size: None,
        };
        let payload = serde_bencode::to_bytes(&header).unwrap();
        let (parsed, rest) = split_metadata_payload(&payload).unwrap();
        assert_eq!(parsed.piece, 3);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_compact_pex_roundtrip() {
        let addrs = vec![
            SocketAddrV4::new(std::net::Ipv4Addr::new(10, 1, 2, 3), 6881),
            SocketAddrV4::new(std::net::Ipv4Addr::new(192, 168, 0, 9), 51413),
        ];
        let compact = addrs_to_compact(addrs.iter());
        assert_eq!(compact.len(), 12);
        assert_eq!(compact_to_addrs(&compact), addrs);
    }

    #[test]
    fn test_allowed_fast_is_stable_and_bounded() {
        let ip = std::net::Ipv4Addr::new(80, 4, 4, 200);
        let hash = InfoHash([0xAA; 20]);
        let a = allowed_fast_set(ip, &hash, 1313, 7);
        let b = allowed_fast_set(ip, &hash, 1313, 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 7);
        assert!(a.iter().all(|&p| p < 1313));
        let unique: std::collections::HashSet<_> = a.iter().collect();
        assert_eq!(unique.len(), a.len());

        // Same /24, different host byte: identical set.
        let c = allowed_fast_set(std::net::Ipv4Addr::new(80, 4, 4, 1), &hash, 1313, 7);
        assert_eq!(a, c);
    }

    #[test]
    fn test_allowed_fast_small_torrent_caps_at_piece_count() {
        let ip = std::net::Ipv4Addr::new(10, 0, 0, 1);
        let hash = InfoHash([3; 20]);
        let set = allowed_fast_set(ip, &hash, 4, 10);
        assert_eq!(set.len(), 4);
    }

    proptest! {
        #[test]
        fn fuzz_decode_frame_never_panics(frame in collection::vec(any::<u8>(), 0..2048)) {
            let _ = decode_frame(&frame);
        }

        #[test]
        fn fuzz_encode_decode_identity(
            index in any::<u32>(),
            begin in any::<u32>(),
            data in collection::vec(any::<u8>(), 0..BLOCK_SIZE as usize)
        ) {
            let msg = Message::Piece(index, begin, data);
            let bytes = encode_message(&msg).unwrap();
            let parsed = decode_frame(&bytes[4..]).unwrap();
            prop_assert_eq!(msg, parsed);
        }

        #[test]
        fn fuzz_bencode_dict_end_never_panics(buf in collection::vec(any::<u8>(), 0..256)) {
            let _ = bencode_dict_end(&buf);
        }
    }
}
