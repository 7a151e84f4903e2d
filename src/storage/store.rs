//! On-disk piece store
//!
//! Presents the torrent's file set as one contiguous logical byte vector.
//! Reads and writes are translated into per-file ranges, block writes are
//! tracked in the [`PieceTable`], and every completed piece is SHA-1
//! verified against the descriptor before it counts as downloaded.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use sha1::{Digest, Sha1};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;
use crate::event::{Event, EventSender};
use crate::storage::piece::PieceTable;
use crate::torrent::{FileEntry, Metainfo};

/// One file's intersection with a logical byte range
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileSlice {
    /// Index into the descriptor's file table
    file: usize,
    /// Offset inside the file
    file_offset: u64,
    /// Offset inside the caller's buffer
    buf_offset: usize,
    /// Bytes to transfer
    len: usize,
}

/// Verifying multi-file piece store
pub struct PieceStore {
    meta: Arc<Metainfo>,
    root: PathBuf,
    /// One write lock per file; writes to the same file are serialized,
    /// writes to disjoint files proceed in parallel
    file_locks: Vec<Arc<tokio::sync::Mutex<()>>>,
    table: Mutex<PieceTable>,
    uploaded: AtomicU64,
    events: EventSender,
}

impl PieceStore {
    /// Create a store rooted at the download directory
    pub fn new(meta: Arc<Metainfo>, download_dir: impl Into<PathBuf>, events: EventSender) -> Self {
        let root = download_dir.into();
        debug!(
            "Piece store for '{}' at {} ({} files, {} pieces)",
            meta.name,
            root.display(),
            meta.files.len(),
            meta.piece_count()
        );
        let file_locks = meta
            .files
            .iter()
            .map(|_| Arc::new(tokio::sync::Mutex::new(())))
            .collect();
        let table = Mutex::new(PieceTable::new(&meta));
        Self {
            meta,
            root,
            file_locks,
            table,
            uploaded: AtomicU64::new(0),
            events,
        }
    }

    /// On-disk path for a file entry: `<root>/[<name>/]<relative_path>`
    fn file_path(&self, entry: &FileEntry) -> PathBuf {
        if self.meta.is_multi_file() {
            self.root.join(&self.meta.name).join(&entry.path)
        } else {
            self.root.join(&entry.path)
        }
    }

    /// Translate a logical range `[start, end)` into per-file slices
    fn locate(&self, start: u64, end: u64) -> Vec<FileSlice> {
        let mut slices = Vec::new();
        for (index, file) in self.meta.files.iter().enumerate() {
            let file_end = file.offset + file.length;
            if file_end <= start {
                continue;
            }
            if file.offset >= end {
                break;
            }
            let f_start = start.saturating_sub(file.offset);
            let f_end = std::cmp::min(end - file.offset, file.length);
            let b_start = file.offset.saturating_sub(start) as usize;
            slices.push(FileSlice {
                file: index,
                file_offset: f_start,
                buf_offset: b_start,
                len: (f_end - f_start) as usize,
            });
        }
        slices
    }

    /// Write bytes at a logical offset, creating files and directories as
    /// needed. Each touched file is locked for the duration of its slice.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        if end > self.meta.total_size() {
            return Err(TorrentError::io_failure(format!(
                "Write past end of torrent: {}..{} of {}",
                offset,
                end,
                self.meta.total_size()
            ))
            .into());
        }
        for slice in self.locate(offset, end) {
            let path = self.file_path(&self.meta.files[slice.file]);
            let _guard = self.file_locks[slice.file].lock().await;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    TorrentError::io_failure_full(
                        "Failed to create directory",
                        parent.display().to_string(),
                        e.to_string(),
                    )
                })?;
            }
            let mut handle = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .open(&path)
                .await
                .map_err(|e| {
                    TorrentError::io_failure_full(
                        "Failed to open file for writing",
                        path.display().to_string(),
                        e.to_string(),
                    )
                })?;
            handle
                .seek(std::io::SeekFrom::Start(slice.file_offset))
                .await?;
            handle
                .write_all(&data[slice.buf_offset..slice.buf_offset + slice.len])
                .await
                .map_err(|e| {
                    TorrentError::io_failure_full(
                        "Failed to write to file",
                        path.display().to_string(),
                        e.to_string(),
                    )
                })?;
            handle.flush().await?;
            trace!(
                "Wrote {} bytes to {} at offset {}",
                slice.len,
                path.display(),
                slice.file_offset
            );
        }
        Ok(())
    }

    /// Read bytes at a logical offset
    pub async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.read_at_io(offset, length).await.map_err(|e| {
            TorrentError::io_failure_full(
                "Failed to read logical range",
                format!("{}..{}", offset, offset + length as u64),
                e.to_string(),
            )
            .into()
        })
    }

    async fn read_at_io(&self, offset: u64, length: usize) -> std::io::Result<Vec<u8>> {
        let end = offset + length as u64;
        let mut buffer = vec![0u8; length];
        for slice in self.locate(offset, end) {
            let path = self.file_path(&self.meta.files[slice.file]);
            let mut handle = fs::File::open(&path).await?;
            handle.seek(std::io::SeekFrom::Start(slice.file_offset)).await?;
            handle
                .read_exact(&mut buffer[slice.buf_offset..slice.buf_offset + slice.len])
                .await?;
        }
        Ok(buffer)
    }

    /// Write one block, mark it acquired, then verify the piece
    pub async fn write_block(&self, piece: u32, block: usize, data: &[u8]) -> Result<()> {
        if piece as usize >= self.meta.piece_count() {
            return Err(TorrentError::protocol_violation(format!(
                "Block write for unknown piece {}",
                piece
            ))
            .into());
        }
        let expected = self.meta.block_size_in(piece, block);
        if block >= self.meta.block_count(piece) || data.len() as u64 != expected {
            return Err(TorrentError::protocol_violation(format!(
                "Block {} of piece {} expects {} bytes, got {}",
                block,
                piece,
                expected,
                data.len()
            ))
            .into());
        }

        let (piece_start, _) = self.meta.piece_range(piece);
        let offset = piece_start + block as u64 * crate::torrent::BLOCK_SIZE as u64;
        self.write_at(offset, data).await?;

        self.table.lock().unwrap().acquire_block(piece, block);
        trace!("Acquired block {} of piece {}", block, piece);

        self.verify(piece).await?;
        Ok(())
    }

    /// Read one block for serving an upload
    pub async fn read_block(&self, piece: u32, begin: u32, length: u32) -> Result<Vec<u8>> {
        let (piece_start, piece_end) = self.meta.piece_range(piece);
        let offset = piece_start + begin as u64;
        if piece as usize >= self.meta.piece_count() || offset + length as u64 > piece_end {
            return Err(TorrentError::protocol_violation(format!(
                "Block read outside piece {}: begin {} length {}",
                piece, begin, length
            ))
            .into());
        }
        self.read_at(offset, length as usize).await
    }

    /// Hash-check one piece against the descriptor
    ///
    /// Returns `Ok(true)` once the piece is verified. A piece whose backing
    /// files are absent or short is simply unverifiable, not an error. On a
    /// mismatch after every block was acquired the whole piece is reset;
    /// a mid-piece mismatch leaves the block bits alone.
    pub async fn verify(&self, piece: u32) -> Result<bool> {
        let expected = self.meta.piece_hash(piece).ok_or_else(|| {
            TorrentError::protocol_violation(format!("Verify of unknown piece {}", piece))
        })?;
        let (start, end) = self.meta.piece_range(piece);
        let data = match self.read_at_io(start, (end - start) as usize).await {
            Ok(data) => data,
            Err(e)
                if e.kind() == std::io::ErrorKind::NotFound
                    || e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                trace!("Piece {} unverifiable: {}", piece, e);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let mut hasher = Sha1::new();
        hasher.update(&data);
        let digest: [u8; 20] = hasher.finalize().into();

        let mut table = self.table.lock().unwrap();
        if digest == expected {
            if table.set_verified(piece) {
                debug!("Piece {} verified", piece);
                let _ = self.events.send(Event::PieceVerified(piece));
            }
            Ok(true)
        } else {
            if table.all_blocks_acquired(piece) {
                warn!("Piece {} failed verification, discarding all blocks", piece);
                table.clear_piece(piece);
            }
            Ok(false)
        }
    }

    /// Startup sweep: verify every piece to reify prior progress
    pub async fn check_existing(&self) -> Result<usize> {
        for piece in 0..self.meta.piece_count() as u32 {
            if let Err(e) = self.verify(piece).await {
                warn!("Startup check of piece {} failed: {}", piece, e);
            }
        }
        let verified = self.verified_count();
        info!(
            "Startup check: {}/{} pieces already on disk",
            verified,
            self.meta.piece_count()
        );
        Ok(verified)
    }

    /// Snapshot of the verified-piece bitfield, MSB-first
    pub fn bitfield(&self) -> Vec<u8> {
        self.table.lock().unwrap().bitfield()
    }

    pub fn is_verified(&self, piece: u32) -> bool {
        self.table.lock().unwrap().is_verified(piece)
    }

    pub fn block_acquired(&self, piece: u32, block: usize) -> bool {
        self.table.lock().unwrap().block_acquired(piece, block)
    }

    pub fn verified_count(&self) -> usize {
        self.table.lock().unwrap().verified_count()
    }

    pub fn is_complete(&self) -> bool {
        self.table.lock().unwrap().is_complete()
    }

    /// Descriptor this store was built from
    pub fn metainfo(&self) -> &Arc<Metainfo> {
        &self.meta
    }

    /// Wire-observed upload bytes
    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes downloaded, as the sum of the actual sizes of verified pieces
    pub fn downloaded(&self) -> u64 {
        let table = self.table.lock().unwrap();
        (0..self.meta.piece_count() as u32)
            .filter(|&p| table.is_verified(p))
            .map(|p| self.meta.piece_size(p))
            .sum()
    }

    /// Bytes still missing
    pub fn left(&self) -> u64 {
        self.meta.total_size() - self.downloaded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;
    use crate::torrent::BLOCK_SIZE;

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ebbtide_{}_{}", tag, rand::random::<u32>()))
    }

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn single_meta(data: &[u8], piece_length: u64) -> Metainfo {
        let piece_hashes = data
            .chunks(piece_length as usize)
            .map(sha1)
            .collect::<Vec<_>>();
        Metainfo {
            name: "payload.bin".to_string(),
            files: vec![FileEntry {
                path: PathBuf::from("payload.bin"),
                length: data.len() as u64,
                offset: 0,
            }],
            piece_length,
            piece_hashes,
            info_hash: [7u8; 20],
            trackers: vec![],
            private: None,
            multi_file: false,
        }
    }

    fn multi_meta() -> Metainfo {
        Metainfo {
            name: "pair".to_string(),
            files: vec![
                FileEntry { path: PathBuf::from("a"), length: 1000, offset: 0 },
                FileEntry { path: PathBuf::from("b"), length: 2000, offset: 1000 },
            ],
            piece_length: 1500,
            piece_hashes: vec![[0u8; 20]; 2],
            info_hash: [7u8; 20],
            trackers: vec![],
            private: None,
            multi_file: true,
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn write_all_blocks(store: &PieceStore, data: &[u8]) {
        let meta = store.metainfo().clone();
        for piece in 0..meta.piece_count() as u32 {
            let (start, _) = meta.piece_range(piece);
            for block in 0..meta.block_count(piece) {
                let begin = start as usize + block * BLOCK_SIZE as usize;
                let len = meta.block_size_in(piece, block) as usize;
                store
                    .write_block(piece, block, &data[begin..begin + len])
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_single_file_round_trip() {
        // 65537 bytes in 32768-byte pieces: two full pieces and a 1-byte tail
        let data = pattern(65_537);
        let meta = single_meta(&data, 32_768);
        assert_eq!(meta.piece_count(), 3);
        assert_eq!(meta.piece_size(2), 1);

        let root = temp_root("single");
        let (tx, mut rx) = event::channel();
        let store = PieceStore::new(Arc::new(meta), &root, tx);

        write_all_blocks(&store, &data).await;

        assert_eq!(store.bitfield(), vec![0b11100000]);
        assert!(store.is_complete());
        assert_eq!(store.downloaded(), 65_537);
        assert_eq!(store.left(), 0);

        let mut verified = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::PieceVerified(p) = event {
                verified.push(p);
            }
        }
        verified.sort_unstable();
        assert_eq!(verified, vec![0, 1, 2]);

        let readback = store.read_at(0, data.len()).await.unwrap();
        assert_eq!(readback, data);

        fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn test_multi_file_range_translation() {
        // files a (1000 bytes) and b (2000 bytes); a 500-byte write at
        // offset 800 must land in a[800..1000] and b[0..300]
        let root = temp_root("multi");
        let (tx, _rx) = event::channel();
        let store = PieceStore::new(Arc::new(multi_meta()), &root, tx);

        let payload = pattern(500);
        store.write_at(800, &payload).await.unwrap();

        let readback = store.read_at(800, 500).await.unwrap();
        assert_eq!(readback, payload);

        let a = std::fs::read(root.join("pair").join("a")).unwrap();
        assert_eq!(a.len(), 1000);
        assert_eq!(&a[800..1000], &payload[..200]);
        let b = std::fs::read(root.join("pair").join("b")).unwrap();
        assert_eq!(b.len(), 300);
        assert_eq!(&b[..300], &payload[200..]);

        fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn test_corrupt_block_clears_whole_piece() {
        // one piece of two blocks; the second block arrives corrupted
        let data = pattern(32_768);
        let meta = single_meta(&data, 32_768);
        let root = temp_root("corrupt");
        let (tx, mut rx) = event::channel();
        let store = PieceStore::new(Arc::new(meta), &root, tx);

        store.write_block(0, 0, &data[..16_384]).await.unwrap();
        assert!(store.block_acquired(0, 0));
        assert!(!store.is_verified(0));

        let mut bad = data[16_384..].to_vec();
        bad[0] ^= 0xff;
        store.write_block(0, 1, &bad).await.unwrap();

        assert!(!store.is_verified(0));
        assert!(!store.block_acquired(0, 0));
        assert!(!store.block_acquired(0, 1));
        assert!(rx.try_recv().is_err());

        fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn test_on_disk_corruption_resets_piece() {
        let data = pattern(32_768);
        let meta = single_meta(&data, 32_768);
        let root = temp_root("flip");
        let (tx, mut rx) = event::channel();
        let store = PieceStore::new(Arc::new(meta), &root, tx);

        write_all_blocks(&store, &data).await;
        assert!(store.is_verified(0));
        assert_eq!(rx.try_recv().unwrap(), Event::PieceVerified(0));

        // flip one byte on disk and re-verify
        let path = root.join("payload.bin");
        let mut on_disk = std::fs::read(&path).unwrap();
        on_disk[100] ^= 0x01;
        std::fs::write(&path, &on_disk).unwrap();

        assert!(!store.verify(0).await.unwrap());
        assert!(!store.is_verified(0));
        assert!(!store.block_acquired(0, 0));
        assert!(!store.block_acquired(0, 1));
        assert!(rx.try_recv().is_err());

        fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn test_startup_check_reifies_prior_progress() {
        let data = pattern(40_000);
        let meta = single_meta(&data, 32_768);
        let root = temp_root("startup");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("payload.bin"), &data).unwrap();

        let (tx, mut rx) = event::channel();
        let store = PieceStore::new(Arc::new(meta), &root, tx);
        let verified = store.check_existing().await.unwrap();

        assert_eq!(verified, 2);
        assert!(store.is_complete());
        assert_eq!(store.downloaded(), 40_000);
        let mut events = 0;
        while rx.try_recv().is_ok() {
            events += 1;
        }
        assert_eq!(events, 2);

        fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn test_verify_with_absent_files_is_unverifiable() {
        let data = pattern(1024);
        let meta = single_meta(&data, 512);
        let (tx, _rx) = event::channel();
        let store = PieceStore::new(Arc::new(meta), temp_root("absent"), tx);
        assert!(!store.verify(0).await.unwrap());
        assert_eq!(store.verified_count(), 0);
    }

    #[tokio::test]
    async fn test_read_block_bounds() {
        let data = pattern(1024);
        let meta = single_meta(&data, 512);
        let root = temp_root("bounds");
        let (tx, _rx) = event::channel();
        let store = PieceStore::new(Arc::new(meta), &root, tx);

        store.write_at(0, &data).await.unwrap();
        let block = store.read_block(1, 0, 512).await.unwrap();
        assert_eq!(block, &data[512..]);
        // spans past the end of the piece
        assert!(store.read_block(1, 500, 100).await.is_err());
        assert!(store.read_block(2, 0, 1).await.is_err());

        fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn test_wrong_block_size_rejected() {
        let data = pattern(32_768);
        let meta = single_meta(&data, 32_768);
        let (tx, _rx) = event::channel();
        let store = PieceStore::new(Arc::new(meta), temp_root("size"), tx);
        assert!(store.write_block(0, 0, &data[..100]).await.is_err());
        assert!(store.write_block(5, 0, &data[..16_384]).await.is_err());
    }
}
