//! BitTorrent handshake
//!
//! Fixed 68-byte exchange that opens every peer connection: protocol tag,
//! eight reserved bytes (sent as zero, ignored on receive), the infohash,
//! and the sender's peer id.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tracing::{trace, warn};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total handshake size in bytes
pub const HANDSHAKE_LEN: usize = 68;

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Torrent infohash
    pub info_hash: [u8; 20],
    /// Sender's peer id
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Generate a random peer id with the "-EB0001-" client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[0..8].copy_from_slice(b"-EB0001-");
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        peer_id
    }

    /// Serialize the handshake to its 68-byte wire form
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&[0u8; 8]); // reserved
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        trace!("Handshake serialized: {} bytes", buf.len());
        buf.to_vec()
    }

    /// Deserialize a handshake from its 68-byte wire form
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() != HANDSHAKE_LEN {
            return Err(TorrentError::malformed_with_source(
                "Handshake has wrong length",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            )
            .into());
        }
        if data[0] != PROTOCOL_LENGTH || &data[1..20] != PROTOCOL_STRING.as_bytes() {
            return Err(TorrentError::malformed("Handshake protocol tag mismatch").into());
        }
        // reserved bytes data[20..28] are ignored
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);
        Ok(Self { info_hash, peer_id })
    }

    /// Check the remote handshake against the torrent we serve
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake infohash mismatch: expected {}, got {}",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_layout() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = handshake.serialize();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL_STRING.as_bytes());
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[test]
    fn test_round_trip() {
        let handshake = Handshake::new([3u8; 20], [4u8; 20]);
        let decoded = Handshake::deserialize(&handshake.serialize()).unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn test_rejects_bad_protocol_tag() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[5] = b'X';
        assert!(Handshake::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_rejects_short_input() {
        assert!(Handshake::deserialize(&[19u8; 40]).is_err());
    }

    #[test]
    fn test_validate() {
        let handshake = Handshake::new([5u8; 20], [6u8; 20]);
        assert!(handshake.validate(&[5u8; 20]));
        assert!(!handshake.validate(&[9u8; 20]));
    }

    #[test]
    fn test_generate_peer_id_prefix() {
        let peer_id = Handshake::generate_peer_id();
        assert_eq!(&peer_id[0..8], b"-EB0001-");
        assert_ne!(Handshake::generate_peer_id()[8..], peer_id[8..]);
    }
}
