//! Cross-component events
//!
//! The store, trackers, and peer sessions all push into one channel owned
//! by the client orchestrator, which routes each event to its consumers.

use std::net::SocketAddr;

use tokio::sync::mpsc;

/// Events routed to the client orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A piece hash-checked successfully (emitted once per false→true transition)
    PieceVerified(u32),
    /// A tracker returned a complete peer endpoint list
    PeerListUpdated(Vec<SocketAddr>),
    /// A peer session's choke/interest/availability state changed
    StateChanged { peer: SocketAddr },
    /// A non-choked peer asked us for a block
    BlockRequested {
        peer: SocketAddr,
        piece: u32,
        begin: u32,
        length: u32,
    },
    /// A peer withdrew an earlier block request
    BlockCancelled {
        peer: SocketAddr,
        piece: u32,
        begin: u32,
        length: u32,
    },
    /// A peer session closed and removed itself
    Disconnected { peer: SocketAddr },
}

/// Sender half shared by every event-producing component
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Receiver half owned by the orchestrator
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Create the event channel
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
