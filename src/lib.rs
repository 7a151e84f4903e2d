//! ebbtide
//!
//! A BitTorrent client core: metainfo parsing with byte-exact infohash
//! computation, HTTP tracker announces, the TCP peer-wire protocol, and a
//! verifying multi-file piece store.

pub mod bencode;
pub mod cli;
pub mod client;
pub mod error;
pub mod event;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use client::Client;
pub use error::TorrentError;
pub use event::Event;
pub use peer::{PeerSession, PeerState, SessionCommand, SessionHandle};
pub use protocol::{Handshake, Message, MessageId};
pub use storage::PieceStore;
pub use torrent::{FileEntry, Metainfo, BLOCK_SIZE};
pub use tracker::{AnnounceEvent, AnnounceStats, Tracker};
