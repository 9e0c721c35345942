// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::bitfield::Bitfield;
use crate::disk::storage::{allocate_files, read_range, FileMap};
use crate::engine::EngineMessage;
use crate::errors::StorageError;
use crate::metainfo::Info;

use sha1::{Digest, Sha1};
use tokio::sync::{broadcast, mpsc};

use tracing::{event, Level};

use std::sync::Arc;

const VERIFY_PROGRESS_EVERY: u32 = 16;

/// Allocator task: brings every file up to its declared length, reporting
/// cumulative progress. Runs once per torrent start.
pub(crate) fn spawn_allocator(
    map: Arc<FileMap>,
    engine_tx: mpsc::Sender<EngineMessage>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let fut = allocate_files(&map, |allocated| {
            let _ = engine_tx.try_send(EngineMessage::AllocationProgress { allocated });
        });
        let result = tokio::select! {
            _ = shutdown_rx.recv() => return,
            res = fut => res,
        };
        let _ = engine_tx.send(EngineMessage::Allocated { result }).await;
    });
}

/// Verifier task: hashes every piece of the existing data and reports the
/// initial bitfield. Files are preallocated, so reads of never-written
/// ranges return zeros and simply fail the hash.
pub(crate) fn spawn_verifier(
    map: Arc<FileMap>,
    info: Info,
    engine_tx: mpsc::Sender<EngineMessage>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let fut = verify_existing(&map, &info, &engine_tx);
        let result = tokio::select! {
            _ = shutdown_rx.recv() => return,
            res = fut => res,
        };
        let _ = engine_tx.send(EngineMessage::Verified { result }).await;
    });
}

async fn verify_existing(
    map: &FileMap,
    info: &Info,
    engine_tx: &mpsc::Sender<EngineMessage>,
) -> Result<Bitfield, StorageError> {
    let piece_count = info.piece_count();
    let mut bitfield = Bitfield::new(piece_count as usize);

    for index in 0..piece_count {
        let size = info.piece_size(index) as usize;
        if size == 0 {
            continue;
        }
        let offset = index as u64 * info.piece_length as u64;
        let data = read_range(map, offset, size).await?;

        let expected = match info.piece_hash(index) {
            Some(hash) => hash.to_vec(),
            None => continue,
        };
        let matched = tokio::task::spawn_blocking(move || {
            Sha1::digest(&data).as_slice() == expected.as_slice()
        })
        .await
        .unwrap_or(false);

        if matched {
            bitfield.set(index as usize);
        }

        if index % VERIFY_PROGRESS_EVERY == 0 {
            let _ = engine_tx.try_send(EngineMessage::VerifyProgress { checked: index + 1 });
        }
    }

    event!(
        Level::DEBUG,
        present = bitfield.count_ones(),
        total = piece_count,
        "Initial verification finished"
    );
    Ok(bitfield)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::storage::write_range;

    use tempfile::tempdir;

    fn info_for(data: &[u8], piece_length: i64) -> Info {
        let mut pieces = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = std::cmp::min(offset + piece_length as usize, data.len());
            pieces.extend_from_slice(&Sha1::digest(&data[offset..end]));
            offset = end;
        }
        Info {
            piece_length,
            pieces,
            private: None,
            files: Vec::new(),
            name: "verify.bin".to_string(),
            length: data.len() as i64,
            md5sum: None,
        }
    }

    #[tokio::test]
    async fn test_verifier_finds_written_pieces() {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (0..40u8).collect(); // 5 pieces of 8
        let info = info_for(&data, 8);
        let map = Arc::new(FileMap::from_info(dir.path(), &info));
        allocate_files(&map, |_| {}).await.unwrap();

        // Write pieces 0, 2 and 4 only.
        write_range(&map, 0, &data[0..8]).await.unwrap();
        write_range(&map, 16, &data[16..24]).await.unwrap();
        write_range(&map, 32, &data[32..40]).await.unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let (shutdown_tx, _) = broadcast::channel(1);
        spawn_verifier(map, info, tx, shutdown_tx.subscribe());

        loop {
            match rx.recv().await.unwrap() {
                EngineMessage::VerifyProgress { .. } => continue,
                EngineMessage::Verified { result } => {
                    let bf = result.unwrap();
                    assert!(bf.test(0));
                    assert!(!bf.test(1));
                    assert!(bf.test(2));
                    assert!(!bf.test(3));
                    assert!(bf.test(4));
                    break;
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_allocator_reports_progress_and_total() {
        let dir = tempdir().unwrap();
        let info = info_for(&[0u8; 32], 8);
        let map = Arc::new(FileMap::from_info(dir.path(), &info));

        let (tx, mut rx) = mpsc::channel(64);
        let (shutdown_tx, _) = broadcast::channel(1);
        spawn_allocator(map, tx, shutdown_tx.subscribe());

        loop {
            match rx.recv().await.unwrap() {
                EngineMessage::AllocationProgress { .. } => continue,
                EngineMessage::Allocated { result } => {
                    assert_eq!(result.unwrap(), 32);
                    break;
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }
}
