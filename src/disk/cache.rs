// SPDX-FileCopyrightText: 2026 The undercurrent Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::disk::storage::{read_range, FileMap};
use crate::errors::StorageError;
use crate::peer::protocol::BlockInfo;

use lru::LruCache;
use tokio::sync::Mutex;

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Read side of the upload path. Whole pieces are cached in a bounded LRU;
/// cache misses load the full piece from storage behind a single read lock
/// so concurrent uploads never stampede the disk. Buffers are shared via
/// `Arc`, so an entry being evicted while a writer still slices from it is
/// harmless. The piece writer inserts freshly written pieces directly.
pub struct PieceReader {
    files: Arc<FileMap>,
    piece_length: u64,
    cache: Mutex<LruCache<u32, Arc<Vec<u8>>>>,
    read_lock: Mutex<()>,
}

impl fmt::Debug for PieceReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceReader(piece_length: {})", self.piece_length)
    }
}

impl PieceReader {
    pub fn new(files: Arc<FileMap>, piece_length: u64, capacity_pieces: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity_pieces.max(1)).unwrap();
        Self {
            files,
            piece_length,
            cache: Mutex::new(LruCache::new(capacity)),
            read_lock: Mutex::new(()),
        }
    }

    fn piece_size(&self, index: u32) -> u64 {
        let start = index as u64 * self.piece_length;
        std::cmp::min(self.piece_length, self.files.total_size.saturating_sub(start))
    }

    pub async fn read_block(&self, block: BlockInfo) -> Result<Vec<u8>, StorageError> {
        let piece_size = self.piece_size(block.piece_index);
        let end = block.offset as u64 + block.length as u64;
        if end > piece_size {
            return Err(StorageError::OutOfBounds {
                offset: block.piece_index as u64 * self.piece_length + block.offset as u64,
                length: block.length as usize,
            });
        }

        let piece = self.piece(block.piece_index, piece_size as usize).await?;
        let start = block.offset as usize;
        Ok(piece[start..start + block.length as usize].to_vec())
    }

    async fn piece(&self, index: u32, size: usize) -> Result<Arc<Vec<u8>>, StorageError> {
        if let Some(piece) = self.cache.lock().await.get(&index) {
            return Ok(piece.clone());
        }

        let _serialized = self.read_lock.lock().await;
        // Another upload may have loaded it while we waited.
        if let Some(piece) = self.cache.lock().await.get(&index) {
            return Ok(piece.clone());
        }

        let offset = index as u64 * self.piece_length;
        let data = Arc::new(read_range(&self.files, offset, size).await?);
        self.cache.lock().await.put(index, data.clone());
        Ok(data)
    }

    /// Write-through insert from the piece writer.
    pub async fn insert(&self, index: u32, data: Arc<Vec<u8>>) {
        self.cache.lock().await.put(index, data);
    }

    #[cfg(test)]
    async fn cached_pieces(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::storage::{allocate_files, write_range};
    use crate::metainfo::Info;

    use tempfile::tempdir;

    async fn reader_with_data(capacity: usize) -> (tempfile::TempDir, PieceReader) {
        let dir = tempdir().unwrap();
        let info = Info {
            piece_length: 8,
            pieces: vec![0; 60],
            private: None,
            files: Vec::new(),
            name: "cached.bin".to_string(),
            length: 20, // pieces: 8, 8, 4
            md5sum: None,
        };
        let files = Arc::new(FileMap::from_info(dir.path(), &info));
        allocate_files(&files, |_| {}).await.unwrap();
        let data: Vec<u8> = (0..20).collect();
        write_range(&files, 0, &data).await.unwrap();
        (dir, PieceReader::new(files, 8, capacity))
    }

    #[tokio::test]
    async fn test_read_block_slices_piece() {
        let (_dir, reader) = reader_with_data(4).await;
        let block = reader
            .read_block(BlockInfo { piece_index: 1, offset: 2, length: 4 })
            .await
            .unwrap();
        assert_eq!(block, vec![10, 11, 12, 13]);
    }

    #[tokio::test]
    async fn test_short_last_piece() {
        let (_dir, reader) = reader_with_data(4).await;
        let block = reader
            .read_block(BlockInfo { piece_index: 2, offset: 0, length: 4 })
            .await
            .unwrap();
        assert_eq!(block, vec![16, 17, 18, 19]);

        let err = reader
            .read_block(BlockInfo { piece_index: 2, offset: 0, length: 5 })
            .await;
        assert!(matches!(err, Err(StorageError::OutOfBounds { .. })));
    }

    #[tokio::test]
    async fn test_lru_eviction_is_bounded() {
        let (_dir, reader) = reader_with_data(2).await;
        for index in 0..3u32 {
            reader
                .read_block(BlockInfo { piece_index: index, offset: 0, length: 1 })
                .await
                .unwrap();
        }
        assert_eq!(reader.cached_pieces().await, 2);
    }

    #[tokio::test]
    async fn test_insert_serves_without_disk() {
        let (dir, reader) = reader_with_data(4).await;
        // Shadow the on-disk content for piece 0 with a cache insert.
        reader.insert(0, Arc::new(vec![9u8; 8])).await;
        drop(dir); // even with the files gone the cached piece serves
        let block = reader
            .read_block(BlockInfo { piece_index: 0, offset: 0, length: 8 })
            .await
            .unwrap();
        assert_eq!(block, vec![9u8; 8]);
    }
}
