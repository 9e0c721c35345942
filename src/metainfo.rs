// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use serde::{Deserialize, Serialize};
use serde_bencode::de;
use serde_bencode::value::Value;
use sha1::{Digest, Sha1};

use std::fmt;

pub const HASH_LEN: usize = 20;

/// SHA-1 of the bencoded info dictionary; the torrent's identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; HASH_LEN]);

impl InfoHash {
    pub fn of_info_dict(bencoded: &[u8]) -> Self {
        let digest = Sha1::digest(bencoded);
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(&digest);
        InfoHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// Debug prints the hex form; the raw array is noise in logs.
impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metainfo {
    /// Exact bencoding of the info dictionary; populated after parsing,
    /// never read from the source dictionary itself.
    #[serde(skip)]
    pub info_bencode: Vec<u8>,

    pub info: Info,
    pub announce: Option<String>,

    #[serde(rename = "announce-list", default)]
    pub announce_list: Option<Vec<Vec<String>>>,

    #[serde(rename = "creation date", default)]
    pub creation_date: Option<i64>,

    #[serde(default)]
    pub comment: Option<String>,

    #[serde(rename = "created by", default)]
    pub created_by: Option<String>,

    #[serde(default)]
    pub encoding: Option<String>,
}

impl Metainfo {
    pub fn info_hash(&self) -> InfoHash {
        InfoHash::of_info_dict(&self.info_bencode)
    }

    pub fn trackers(&self) -> Vec<String> {
        if let Some(tiers) = &self.announce_list {
            return tiers.iter().flatten().cloned().collect();
        }
        self.announce.clone().into_iter().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Info {
    #[serde(rename = "piece length")]
    pub piece_length: i64,

    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    #[serde(default)]
    pub private: Option<i64>,

    // Empty for single-file torrents.
    #[serde(default)]
    pub files: Vec<FileEntry>,

    pub name: String,

    // Zero for multi-file torrents.
    #[serde(default)]
    pub length: i64,

    #[serde(default)]
    pub md5sum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileEntry {
    pub length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
    pub path: Vec<String>,
    #[serde(default)]
    pub attr: Option<String>,
}

impl Info {
    pub fn piece_count(&self) -> u32 {
        (self.pieces.len() / HASH_LEN) as u32
    }

    pub fn total_length(&self) -> u64 {
        if self.files.is_empty() {
            self.length as u64
        } else {
            self.files.iter().map(|f| f.length as u64).sum()
        }
    }

    /// All pieces are `piece length` bytes except possibly the last.
    pub fn piece_size(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length as u64;
        let remaining = self.total_length().saturating_sub(start);
        std::cmp::min(self.piece_length as u64, remaining) as u32
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8]> {
        let start = index as usize * HASH_LEN;
        self.pieces.get(start..start + HASH_LEN)
    }

    pub fn is_private(&self) -> bool {
        self.private == Some(1)
    }
}

#[derive(Debug)]
pub enum ParseError {
    Bencode(serde_bencode::Error),
    MissingInfoDict,
    NoPieces,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Bencode(e) => write!(f, "bencode parsing error: {}", e),
            ParseError::MissingInfoDict => write!(f, "missing 'info' dictionary"),
            ParseError::NoPieces => write!(f, "info dictionary declares no pieces"),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<serde_bencode::Error> for ParseError {
    fn from(e: serde_bencode::Error) -> Self {
        ParseError::Bencode(e)
    }
}

/// Parses a whole .torrent file. Deserializes twice: once generically to
/// recover the exact info-dict bytes for hashing, once into the typed
/// struct.
pub fn from_bytes(bencode_data: &[u8]) -> Result<Metainfo, ParseError> {
    let generic: Value = de::from_bytes(bencode_data)?;

    let info_dict_value = if let Value::Dict(mut top) = generic {
        top.remove("info".as_bytes()).ok_or(ParseError::MissingInfoDict)?
    } else {
        return Err(ParseError::MissingInfoDict);
    };
    let info_bencode = serde_bencode::to_bytes(&info_dict_value)?;

    let mut metainfo: Metainfo = de::from_bytes(bencode_data)?;
    if metainfo.info.pieces.is_empty() || metainfo.info.pieces.len() % HASH_LEN != 0 {
        return Err(ParseError::NoPieces);
    }
    metainfo.info_bencode = info_bencode;
    Ok(metainfo)
}

/// Parses a bare info dictionary, as delivered over ut_metadata.
pub fn info_from_bytes(bencode_data: &[u8]) -> Result<Info, ParseError> {
    let info: Info = de::from_bytes(bencode_data)?;
    if info.pieces.is_empty() || info.pieces.len() % HASH_LEN != 0 {
        return Err(ParseError::NoPieces);
    }
    Ok(info)
}
