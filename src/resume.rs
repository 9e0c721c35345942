// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::StorageError;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use std::fs;
use std::io::{Error, ErrorKind};
use std::path::PathBuf;

/// Everything needed to restart a torrent without re-hashing: identity,
/// layout, the verified bitfield and transfer statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumeSpec {
    pub info_hash: ByteBuf,
    pub dest: String,
    pub port: u16,
    pub name: String,
    pub trackers: Vec<String>,

    /// Bencoded info dictionary; absent for magnet starts that never
    /// finished fetching metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ByteBuf>,

    /// Wire byte order: bit 0 is the MSB of byte 0.
    pub bitfield: ByteBuf,

    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub bytes_wasted: u64,
    pub seeded_for_secs: u64,

    pub created_at: i64,
    #[serde(with = "bool_as_int")]
    pub started: bool,
}

/// serde_bencode has no boolean wire type; deserialize_bool forwards to
/// deserialize_any, which never calls visit_bool, so a plain `bool` field
/// fails to round-trip. Encode it as an integer instead.
mod bool_as_int {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(if *value { 1 } else { 0 })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(u8::deserialize(deserializer)? != 0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResumeStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub wasted: u64,
    pub seeded_for_secs: u64,
}

/// Persistence seam. The engine coalesces bitfield writes behind
/// `bitfield_write_interval` and flushes immediately on completion.
pub trait Resumer: Send + Sync {
    fn read(&self) -> Result<Option<ResumeSpec>, StorageError>;
    fn write(&self, spec: &ResumeSpec) -> Result<(), StorageError>;
    fn write_bitfield(&self, bitfield: &[u8]) -> Result<(), StorageError>;
    fn write_stats(&self, stats: &ResumeStats) -> Result<(), StorageError>;
}

/// Single-file resumer: one bencoded record per torrent, written through a
/// temp file and renamed so a crash never leaves a torn record.
#[derive(Debug, Clone)]
pub struct FileResumer {
    path: PathBuf,
}

impl FileResumer {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn update<F>(&self, mutate: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut ResumeSpec),
    {
        let Some(mut spec) = self.read()? else {
            // Nothing persisted yet; the first full write will capture it.
            return Ok(());
        };
        mutate(&mut spec);
        self.write(&spec)
    }
}

impl Resumer for FileResumer {
    fn read(&self) -> Result<Option<ResumeSpec>, StorageError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let spec = serde_bencode::from_bytes(&bytes)
            .map_err(|e| Error::new(ErrorKind::InvalidData, e.to_string()))?;
        Ok(Some(spec))
    }

    fn write(&self, spec: &ResumeSpec) -> Result<(), StorageError> {
        let bytes = serde_bencode::to_bytes(spec)
            .map_err(|e| Error::new(ErrorKind::InvalidData, e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn write_bitfield(&self, bitfield: &[u8]) -> Result<(), StorageError> {
        self.update(|spec| spec.bitfield = ByteBuf::from(bitfield.to_vec()))
    }

    fn write_stats(&self, stats: &ResumeStats) -> Result<(), StorageError> {
        self.update(|spec| {
            spec.bytes_downloaded = stats.downloaded;
            spec.bytes_uploaded = stats.uploaded;
            spec.bytes_wasted = stats.wasted;
            spec.seeded_for_secs = stats.seeded_for_secs;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_spec() -> ResumeSpec {
        ResumeSpec {
            info_hash: ByteBuf::from(vec![0xAB; 20]),
            dest: "/downloads".to_string(),
            port: 6881,
            name: "sample.bin".to_string(),
            trackers: vec![
                "http://tracker.one/announce".to_string(),
                "udp://tracker.two:8080".to_string(),
            ],
            info: Some(ByteBuf::from(b"d4:name6:samplee".to_vec())),
            bitfield: ByteBuf::from(vec![0b1010_0000]),
            bytes_downloaded: 12345,
            bytes_uploaded: 678,
            bytes_wasted: 90,
            seeded_for_secs: 3600,
            created_at: 1_750_000_000,
            started: true,
        }
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let resumer = FileResumer::new(dir.path().join("resume.bencode"));
        let spec = sample_spec();

        resumer.write(&spec).unwrap();
        let back = resumer.read().unwrap().unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_missing_file_reads_none() {
        let dir = tempdir().unwrap();
        let resumer = FileResumer::new(dir.path().join("missing.bencode"));
        assert!(resumer.read().unwrap().is_none());
    }

    #[test]
    fn test_write_bitfield_touches_only_bitfield() {
        let dir = tempdir().unwrap();
        let resumer = FileResumer::new(dir.path().join("resume.bencode"));
        let spec = sample_spec();
        resumer.write(&spec).unwrap();

        resumer.write_bitfield(&[0xFF, 0x80]).unwrap();
        let back = resumer.read().unwrap().unwrap();
        assert_eq!(back.bitfield.as_ref(), &[0xFF, 0x80]);
        assert_eq!(back.bytes_downloaded, spec.bytes_downloaded);
        assert_eq!(back.trackers, spec.trackers);
        assert_eq!(back.info, spec.info);
    }

    #[test]
    fn test_write_stats_updates_counters() {
        let dir = tempdir().unwrap();
        let resumer = FileResumer::new(dir.path().join("resume.bencode"));
        resumer.write(&sample_spec()).unwrap();

        resumer
            .write_stats(&ResumeStats {
                downloaded: 1,
                uploaded: 2,
                wasted: 3,
                seeded_for_secs: 4,
            })
            .unwrap();
        let back = resumer.read().unwrap().unwrap();
        assert_eq!(back.bytes_downloaded, 1);
        assert_eq!(back.bytes_uploaded, 2);
        assert_eq!(back.bytes_wasted, 3);
        assert_eq!(back.seeded_for_secs, 4);
    }

    #[test]
    fn test_bitfield_update_without_record_is_a_noop() {
        let dir = tempdir().unwrap();
        let resumer = FileResumer::new(dir.path().join("resume.bencode"));
        resumer.write_bitfield(&[0x01]).unwrap();
        assert!(resumer.read().unwrap().is_none());
    }
}
