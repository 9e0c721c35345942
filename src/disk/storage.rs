// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::StorageError;
use crate::metainfo::Info;

use tokio::fs::{self, try_exists, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FileSpan {
    pub path: PathBuf,
    pub length: u64,
    /// Offset of this file within the torrent's flat data stream.
    pub global_offset: u64,
    /// BEP 47 padding: occupies stream offsets but never touches disk.
    pub is_padding: bool,
}

/// Flat view over the torrent's files: piece-range reads and writes are
/// addressed by global stream offset, whether the torrent is single- or
/// multi-file.
#[derive(Debug, Clone)]
pub struct FileMap {
    pub files: Vec<FileSpan>,
    pub total_size: u64,
}

impl FileMap {
    pub fn from_info(root_dir: &Path, info: &Info) -> Self {
        if info.files.is_empty() {
            let length = info.length as u64;
            return Self {
                files: vec![FileSpan {
                    path: root_dir.join(&info.name),
                    length,
                    global_offset: 0,
                    is_padding: false,
                }],
                total_size: length,
            };
        }

        let content_dir = root_dir.join(&info.name);
        let mut files = Vec::with_capacity(info.files.len());
        let mut offset = 0u64;
        for entry in &info.files {
            let mut path = content_dir.clone();
            for component in &entry.path {
                path.push(component);
            }
            let is_padding = entry.attr.as_deref().map(|s| s.contains('p')).unwrap_or(false);
            files.push(FileSpan {
                path,
                length: entry.length as u64,
                global_offset: offset,
                is_padding,
            });
            offset += entry.length as u64;
        }
        Self {
            files,
            total_size: offset,
        }
    }
}

/// Creates directories and extends every file to its declared length.
/// `set_len` gives sparse allocation where the filesystem supports it.
/// `progress` is called with cumulative bytes after each file.
pub async fn allocate_files<F>(map: &FileMap, mut progress: F) -> Result<u64, StorageError>
where
    F: FnMut(u64),
{
    let mut allocated = 0u64;
    for span in &map.files {
        if span.is_padding {
            allocated += span.length;
            progress(allocated);
            continue;
        }

        if let Some(parent) = span.path.parent() {
            if !try_exists(parent).await? {
                fs::create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&span.path)
            .await?;
        let current = file.metadata().await?.len();
        if current < span.length {
            file.set_len(span.length).await?;
        }

        allocated += span.length;
        progress(allocated);
    }
    Ok(allocated)
}

pub async fn read_range(
    map: &FileMap,
    global_offset: u64,
    length: usize,
) -> Result<Vec<u8>, StorageError> {
    if global_offset + length as u64 > map.total_size {
        return Err(StorageError::OutOfBounds { offset: global_offset, length });
    }

    let mut buffer = Vec::with_capacity(length);
    let mut done = 0usize;

    for span in &map.files {
        let span_end = span.global_offset + span.length;
        let read_start = global_offset + done as u64;
        if read_start >= span_end || read_start < span.global_offset {
            continue;
        }

        let local_offset = read_start - span.global_offset;
        let take = std::cmp::min((length - done) as u64, span.length - local_offset) as usize;
        if take == 0 {
            continue;
        }

        if span.is_padding {
            buffer.resize(buffer.len() + take, 0);
        } else {
            let mut file = File::open(&span.path).await?;
            file.seek(SeekFrom::Start(local_offset)).await?;
            let mut chunk = vec![0u8; take];
            file.read_exact(&mut chunk).await?;
            buffer.extend_from_slice(&chunk);
        }

        done += take;
        if done == length {
            return Ok(buffer);
        }
    }

    Err(StorageError::OutOfBounds { offset: global_offset, length })
}

pub async fn write_range(
    map: &FileMap,
    global_offset: u64,
    data: &[u8],
) -> Result<(), StorageError> {
    if global_offset + data.len() as u64 > map.total_size {
        return Err(StorageError::OutOfBounds { offset: global_offset, length: data.len() });
    }

    let mut done = 0usize;

    for span in &map.files {
        let span_end = span.global_offset + span.length;
        let write_start = global_offset + done as u64;
        if write_start >= span_end || write_start < span.global_offset {
            continue;
        }

        let local_offset = write_start - span.global_offset;
        let take = std::cmp::min((data.len() - done) as u64, span.length - local_offset) as usize;
        if take == 0 {
            continue;
        }

        if !span.is_padding {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&span.path)
                .await?;
            file.seek(SeekFrom::Start(local_offset)).await?;
            file.write_all(&data[done..done + take]).await?;
            file.flush().await?;
        }

        done += take;
        if done == data.len() {
            return Ok(());
        }
    }

    Err(StorageError::OutOfBounds { offset: global_offset, length: data.len() })
}
