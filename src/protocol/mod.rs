//! BitTorrent peer-wire protocol
//!
//! The 68-byte handshake and the length-prefixed message framing.

pub mod handshake;
pub mod message;
pub mod wire;

pub use handshake::{Handshake, HANDSHAKE_LEN, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{read_frame, read_handshake, write_frame, write_handshake};
