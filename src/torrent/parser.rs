//! Torrent file parser
//!
//! Decodes a .torrent file and builds the [`Metainfo`] descriptor. The
//! infohash is computed over the original `info` bytes, located by cursor
//! position during a second decoder walk, never over a re-encoding.

use std::ops::Range;
use std::path::PathBuf;

use anyhow::Result;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::bencode::{self, Decoder, Value};
use crate::error::TorrentError;
use crate::torrent::info::{FileEntry, Metainfo};

/// Parse a .torrent file from a path
pub fn parse_file(path: &std::path::Path) -> Result<Metainfo> {
    debug!("Loading torrent file from: {}", path.display());
    let data = std::fs::read(path).map_err(|e| {
        TorrentError::io_failure_full(
            "Failed to read torrent file",
            path.display().to_string(),
            e.to_string(),
        )
    })?;
    parse_bytes(&data)
}

/// Parse a .torrent file from bytes
pub fn parse_bytes(data: &[u8]) -> Result<Metainfo> {
    debug!("Parsing torrent file from {} bytes", data.len());

    let root = bencode::decode(data)?;
    let root_dict = root
        .as_dict()
        .ok_or_else(|| TorrentError::invalid_metainfo("Root is not a dictionary"))?;

    let info_dict = root_dict
        .get(b"info".as_ref())
        .and_then(|v| v.as_dict())
        .ok_or_else(|| TorrentError::invalid_metainfo_field("Missing dictionary", "info"))?;

    let name = info_dict
        .get(b"name".as_ref())
        .and_then(|v| v.as_str_lossy())
        .ok_or_else(|| TorrentError::invalid_metainfo_field("Missing field", "name"))?;

    let piece_length = info_dict
        .get(b"piece length".as_ref())
        .and_then(|v| v.as_int())
        .ok_or_else(|| TorrentError::invalid_metainfo_field("Missing field", "piece length"))?;
    if piece_length <= 0 {
        return Err(
            TorrentError::invalid_metainfo_field("Non-positive piece length", "piece length")
                .into(),
        );
    }
    let piece_length = piece_length as u64;

    let pieces_bytes = info_dict
        .get(b"pieces".as_ref())
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| TorrentError::invalid_metainfo_field("Missing field", "pieces"))?;
    let piece_hashes = parse_piece_hashes(pieces_bytes)?;

    let (files, multi_file) = parse_file_table(info_dict, &name)?;
    let total_size: u64 = files.iter().map(|f| f.length).sum();

    let expected_pieces = ((total_size + piece_length - 1) / piece_length) as usize;
    if piece_hashes.len() != expected_pieces {
        return Err(TorrentError::invalid_metainfo_field(
            format!(
                "Piece count mismatch: {} hashes for {} bytes of {}-byte pieces",
                piece_hashes.len(),
                total_size,
                piece_length
            ),
            "pieces",
        )
        .into());
    }

    let private = info_dict
        .get(b"private".as_ref())
        .and_then(|v| v.as_int())
        .map(|i| i != 0);

    let trackers = parse_trackers(root_dict);
    if trackers.is_empty() {
        warn!("Torrent '{}' carries no tracker URLs", name);
    }

    let span = info_span(data)?;
    let mut hasher = Sha1::new();
    hasher.update(&data[span]);
    let info_hash: [u8; 20] = hasher.finalize().into();

    info!(
        "Parsed torrent '{}': {} bytes, {} pieces, infohash {}",
        name,
        total_size,
        piece_hashes.len(),
        hex::encode(info_hash)
    );

    Ok(Metainfo {
        name,
        files,
        piece_length,
        piece_hashes,
        info_hash,
        trackers,
        private,
        multi_file,
    })
}

/// Split the concatenated `pieces` field into 20-byte digests
fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::invalid_metainfo_field(
            format!("Length {} is not a multiple of 20", pieces_bytes.len()),
            "pieces",
        )
        .into());
    }
    Ok(pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

/// Build the ordered file table with logical offsets
fn parse_file_table(
    info_dict: &std::collections::BTreeMap<Vec<u8>, Value>,
    name: &str,
) -> Result<(Vec<FileEntry>, bool)> {
    if let Some(length) = info_dict.get(b"length".as_ref()).and_then(|v| v.as_int()) {
        if length < 0 {
            return Err(TorrentError::invalid_metainfo_field("Negative length", "length").into());
        }
        return Ok((
            vec![FileEntry {
                path: PathBuf::from(name),
                length: length as u64,
                offset: 0,
            }],
            false,
        ));
    }

    let file_list = info_dict
        .get(b"files".as_ref())
        .and_then(|v| v.as_list())
        .ok_or_else(|| {
            TorrentError::invalid_metainfo_field("Neither length nor files present", "info")
        })?;

    let mut files = Vec::with_capacity(file_list.len());
    let mut offset = 0u64;
    for entry in file_list {
        let file_dict = entry
            .as_dict()
            .ok_or_else(|| TorrentError::invalid_metainfo_field("File entry is not a dictionary", "files"))?;
        let length = file_dict
            .get(b"length".as_ref())
            .and_then(|v| v.as_int())
            .ok_or_else(|| TorrentError::invalid_metainfo_field("Missing file length", "files"))?;
        if length < 0 {
            return Err(TorrentError::invalid_metainfo_field("Negative file length", "files").into());
        }
        let components = file_dict
            .get(b"path".as_ref())
            .and_then(|v| v.as_list())
            .ok_or_else(|| TorrentError::invalid_metainfo_field("Missing file path", "files"))?;
        let mut path = PathBuf::new();
        for component in components {
            let part = component.as_str_lossy().ok_or_else(|| {
                TorrentError::invalid_metainfo_field("Path component is not a string", "files")
            })?;
            if !part.is_empty() {
                path.push(part);
            }
        }
        if path.as_os_str().is_empty() {
            return Err(TorrentError::invalid_metainfo_field("Empty file path", "files").into());
        }
        files.push(FileEntry {
            path,
            length: length as u64,
            offset,
        });
        offset += length as u64;
    }
    Ok((files, true))
}

/// Collect announce URLs, announce-list (BEP-12) tiers first, deduplicated
fn parse_trackers(root_dict: &std::collections::BTreeMap<Vec<u8>, Value>) -> Vec<String> {
    let mut trackers = Vec::new();
    if let Some(tiers) = root_dict.get(b"announce-list".as_ref()).and_then(|v| v.as_list()) {
        for tier in tiers {
            if let Some(urls) = tier.as_list() {
                for url in urls {
                    if let Some(url) = url.as_str_lossy() {
                        if !trackers.contains(&url) {
                            trackers.push(url);
                        }
                    }
                }
            }
        }
    }
    if let Some(announce) = root_dict.get(b"announce".as_ref()).and_then(|v| v.as_str_lossy()) {
        if !trackers.contains(&announce) {
            trackers.push(announce);
        }
    }
    trackers
}

/// Locate the byte range of the `info` value in the original input
fn info_span(data: &[u8]) -> Result<Range<usize>> {
    if data.first() != Some(&b'd') {
        return Err(TorrentError::invalid_metainfo("Root is not a dictionary").into());
    }
    let body = &data[1..];
    let mut decoder = Decoder::new(body);
    while body.get(decoder.position()) != Some(&b'e') {
        let key = decoder.decode()?;
        let start = 1 + decoder.position();
        decoder.decode()?;
        let end = 1 + decoder.position();
        if key.as_bytes() == Some(b"info".as_ref()) {
            return Ok(start..end);
        }
    }
    Err(TorrentError::invalid_metainfo_field("Missing dictionary", "info").into())
}
