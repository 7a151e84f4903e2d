//! Per-peer protocol state
//!
//! The four-quadrant choke/interest flags, the remote availability
//! bitfield, outstanding block requests, and liveness stamps for one
//! connection. Both sides start choked and not interested.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::TorrentError;
use crate::torrent::Metainfo;

/// Minimum gap between keep-alives we send
pub const KEEPALIVE_MIN_GAP: Duration = Duration::from_secs(30);

/// Send silence after which a keep-alive is due
pub const KEEPALIVE_SEND_IDLE: Duration = Duration::from_secs(90);

/// Connection lifecycle; closure is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    New,
    Handshaking,
    Active,
    Closed,
}

/// Mutable state of one peer connection
#[derive(Debug)]
pub struct PeerState {
    pub addr: SocketAddr,
    pub phase: SessionPhase,
    /// We are choking the remote
    pub we_choke_them: bool,
    /// The remote is choking us
    pub they_choke_us: bool,
    /// We want the remote's pieces
    pub we_interested: bool,
    /// The remote wants our pieces
    pub they_interested: bool,
    pub handshake_sent: bool,
    pub handshake_received: bool,
    /// Pieces the remote advertises
    remote_has: Vec<bool>,
    /// Outstanding block requests, ragged per piece
    block_requested: Vec<Vec<bool>>,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub last_active: Instant,
    pub last_keepalive_sent: Option<Instant>,
    pub last_message_sent: Instant,
}

impl PeerState {
    /// Fresh state for a connection to `addr`
    pub fn new(addr: SocketAddr, meta: &Metainfo) -> Self {
        let now = Instant::now();
        let piece_count = meta.piece_count();
        Self {
            addr,
            phase: SessionPhase::New,
            we_choke_them: true,
            they_choke_us: true,
            we_interested: false,
            they_interested: false,
            handshake_sent: false,
            handshake_received: false,
            remote_has: vec![false; piece_count],
            block_requested: (0..piece_count as u32)
                .map(|p| vec![false; meta.block_count(p)])
                .collect(),
            bytes_up: 0,
            bytes_down: 0,
            last_active: now,
            last_keepalive_sent: None,
            last_message_sent: now,
        }
    }

    /// Record inbound traffic for the idle timer
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Mark one remote piece available
    pub fn set_remote_has(&mut self, piece: u32) -> Result<(), TorrentError> {
        match self.remote_has.get_mut(piece as usize) {
            Some(bit) => {
                *bit = true;
                Ok(())
            }
            None => Err(TorrentError::protocol_violation_with_peer(
                format!("Have for unknown piece {}", piece),
                self.addr.to_string(),
            )),
        }
    }

    /// OR a received bitfield into the availability map
    ///
    /// The byte length must be exactly `ceil(piece_count / 8)`; spurious
    /// set bits past the last piece are tolerated and ignored.
    pub fn merge_bitfield(&mut self, bitfield: &[u8]) -> Result<(), TorrentError> {
        let expected = (self.remote_has.len() + 7) / 8;
        if bitfield.len() != expected {
            return Err(TorrentError::protocol_violation_with_peer(
                format!("Bitfield of {} bytes, expected {}", bitfield.len(), expected),
                self.addr.to_string(),
            ));
        }
        for piece in 0..self.remote_has.len() {
            if bitfield[piece / 8] >> (7 - (piece % 8)) & 1 != 0 {
                self.remote_has[piece] = true;
            }
        }
        Ok(())
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.remote_has.get(piece as usize).copied().unwrap_or(false)
    }

    /// Number of pieces the remote advertises
    pub fn remote_piece_count(&self) -> usize {
        self.remote_has.iter().filter(|&&b| b).count()
    }

    /// Whether we may request blocks right now
    pub fn can_request(&self) -> bool {
        !self.they_choke_us && self.we_interested && self.phase == SessionPhase::Active
    }

    pub fn mark_requested(&mut self, piece: u32, block: usize) {
        if let Some(bits) = self.block_requested.get_mut(piece as usize) {
            if let Some(bit) = bits.get_mut(block) {
                *bit = true;
            }
        }
    }

    pub fn clear_requested(&mut self, piece: u32, block: usize) {
        if let Some(bits) = self.block_requested.get_mut(piece as usize) {
            if let Some(bit) = bits.get_mut(block) {
                *bit = false;
            }
        }
    }

    pub fn is_requested(&self, piece: u32, block: usize) -> bool {
        self.block_requested
            .get(piece as usize)
            .and_then(|bits| bits.get(block))
            .copied()
            .unwrap_or(false)
    }

    /// Whether a keep-alive should go out now: at most one per 30 s, and
    /// only after 90 s without any outbound message
    pub fn keepalive_due(&self, now: Instant) -> bool {
        if now.duration_since(self.last_message_sent) < KEEPALIVE_SEND_IDLE {
            return false;
        }
        match self.last_keepalive_sent {
            Some(sent) => now.duration_since(sent) >= KEEPALIVE_MIN_GAP,
            None => true,
        }
    }

    /// Record an outbound message for the keep-alive timers
    pub fn note_sent(&mut self) {
        self.last_message_sent = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::FileEntry;
    use std::path::PathBuf;

    fn meta(total: u64, piece_length: u64) -> Metainfo {
        let pieces = ((total + piece_length - 1) / piece_length) as usize;
        Metainfo {
            name: "t".to_string(),
            files: vec![FileEntry { path: PathBuf::from("t"), length: total, offset: 0 }],
            piece_length,
            piece_hashes: vec![[0u8; 20]; pieces],
            info_hash: [0u8; 20],
            trackers: vec![],
            private: None,
            multi_file: false,
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn test_initial_quadrant() {
        let state = PeerState::new(addr(), &meta(1024, 512));
        assert!(state.we_choke_them);
        assert!(state.they_choke_us);
        assert!(!state.we_interested);
        assert!(!state.they_interested);
        assert_eq!(state.phase, SessionPhase::New);
    }

    #[test]
    fn test_merge_bitfield_msb_first() {
        let mut state = PeerState::new(addr(), &meta(5 * 512, 512));
        state.merge_bitfield(&[0b10100000]).unwrap();
        assert!(state.has_piece(0));
        assert!(!state.has_piece(1));
        assert!(state.has_piece(2));
        assert_eq!(state.remote_piece_count(), 2);
    }

    #[test]
    fn test_merge_bitfield_tolerates_trailing_bits() {
        let mut state = PeerState::new(addr(), &meta(5 * 512, 512));
        state.merge_bitfield(&[0b00000111]).unwrap();
        assert!(state.has_piece(5 - 1));
        assert_eq!(state.remote_piece_count(), 1);
    }

    #[test]
    fn test_merge_bitfield_wrong_length_rejected() {
        let mut state = PeerState::new(addr(), &meta(5 * 512, 512));
        assert!(state.merge_bitfield(&[0, 0]).is_err());
        assert!(state.merge_bitfield(&[]).is_err());
    }

    #[test]
    fn test_merge_bitfield_keeps_earlier_have() {
        let mut state = PeerState::new(addr(), &meta(5 * 512, 512));
        state.set_remote_has(1).unwrap();
        state.merge_bitfield(&[0b10000000]).unwrap();
        assert!(state.has_piece(0));
        assert!(state.has_piece(1));
    }

    #[test]
    fn test_have_out_of_range_rejected() {
        let mut state = PeerState::new(addr(), &meta(1024, 512));
        assert!(state.set_remote_has(2).is_err());
    }

    #[test]
    fn test_can_request_needs_unchoked_and_interested() {
        let mut state = PeerState::new(addr(), &meta(1024, 512));
        state.phase = SessionPhase::Active;
        assert!(!state.can_request());
        state.they_choke_us = false;
        assert!(!state.can_request());
        state.we_interested = true;
        assert!(state.can_request());
    }

    #[test]
    fn test_request_bitmap() {
        let mut state = PeerState::new(addr(), &meta(65_537, 32_768));
        assert!(!state.is_requested(1, 1));
        state.mark_requested(1, 1);
        assert!(state.is_requested(1, 1));
        state.clear_requested(1, 1);
        assert!(!state.is_requested(1, 1));
    }

    #[test]
    fn test_keepalive_schedule() {
        let mut state = PeerState::new(addr(), &meta(1024, 512));
        let start = Instant::now();
        // quiet for 90 s with none sent yet
        state.last_message_sent = start - Duration::from_secs(91);
        assert!(state.keepalive_due(start));
        // one just went out
        state.last_keepalive_sent = Some(start - Duration::from_secs(10));
        assert!(!state.keepalive_due(start));
        // gap elapsed again
        state.last_keepalive_sent = Some(start - Duration::from_secs(31));
        assert!(state.keepalive_due(start));
        // recent outbound traffic resets the idle requirement
        state.note_sent();
        assert!(!state.keepalive_due(Instant::now()));
    }
}
