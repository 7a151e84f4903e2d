//! Torrent descriptor
//!
//! The immutable description of a torrent: file table with logical
//! offsets, piece geometry, hashes, infohash, and tracker URLs.

use std::path::PathBuf;

/// Request granularity on the wire, in bytes
pub const BLOCK_SIZE: u32 = 16_384;

/// One file of the torrent, positioned in the logical byte vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the torrent root (for multi-file torrents the
    /// `name` directory component is added at storage time)
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
    /// Offset of the file's first byte in the logical byte vector
    pub offset: u64,
}

/// Immutable torrent descriptor
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Display name
    pub name: String,
    /// Ordered file table; single-file torrents hold one entry named `name`
    pub files: Vec<FileEntry>,
    /// Piece size in bytes
    pub piece_length: u64,
    /// 20-byte SHA-1 digest per piece
    pub piece_hashes: Vec<[u8; 20]>,
    /// SHA-1 of the bencoded `info` dictionary, byte-exact from the source
    pub info_hash: [u8; 20],
    /// Announce URLs, announce-list order first
    pub trackers: Vec<String>,
    /// BEP-27 private flag: absent, false, or true
    pub private: Option<bool>,
    /// Whether the torrent carried a `files` list
    pub multi_file: bool,
}

impl Metainfo {
    /// Total size of all files in bytes
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// Number of pieces
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Actual size of a piece; the last piece may be short
    pub fn piece_size(&self, index: u32) -> u64 {
        let start = index as u64 * self.piece_length;
        let total = self.total_size();
        std::cmp::min(self.piece_length, total.saturating_sub(start))
    }

    /// Number of blocks in a piece
    pub fn block_count(&self, index: u32) -> usize {
        let piece = self.piece_size(index);
        ((piece + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64) as usize
    }

    /// Actual size of a block; the last block of the last piece may be short
    pub fn block_size_in(&self, index: u32, block: usize) -> u64 {
        let piece = self.piece_size(index);
        let begin = block as u64 * BLOCK_SIZE as u64;
        std::cmp::min(BLOCK_SIZE as u64, piece.saturating_sub(begin))
    }

    /// Byte range `[start, end)` of a piece in the logical vector
    pub fn piece_range(&self, index: u32) -> (u64, u64) {
        let start = index as u64 * self.piece_length;
        (start, start + self.piece_size(index))
    }

    /// Expected hash for a piece
    pub fn piece_hash(&self, index: u32) -> Option<[u8; 20]> {
        self.piece_hashes.get(index as usize).copied()
    }

    /// Infohash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Whether this torrent carries multiple files
    pub fn is_multi_file(&self) -> bool {
        self.multi_file
    }
}
