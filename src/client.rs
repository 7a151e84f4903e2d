//! Client orchestrator
//!
//! Owns the descriptor, the piece store, the tracker tasks, and the peer
//! session map. Routes events: tracker peer lists become outbound dials,
//! verified pieces become have broadcasts, block requests are answered
//! from the store. Peer and tracker failures never unwind the supervisor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;
use crate::event::{self, Event, EventReceiver, EventSender};
use crate::peer::{PeerSession, SessionCommand, SessionHandle};
use crate::protocol::Handshake;
use crate::storage::PieceStore;
use crate::torrent::Metainfo;
use crate::tracker::Tracker;

/// Sessions keyed by remote endpoint string
type SessionMap = Arc<Mutex<HashMap<String, SessionHandle>>>;

/// The torrent client: one descriptor, one store, many peers
pub struct Client {
    meta: Arc<Metainfo>,
    store: Arc<PieceStore>,
    port: u16,
    peer_id: [u8; 20],
    sessions: SessionMap,
    events_tx: EventSender,
    events_rx: Option<EventReceiver>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Client {
    /// Build a client for one torrent, downloading into `download_dir`
    pub fn new(meta: Arc<Metainfo>, download_dir: impl Into<PathBuf>, port: u16) -> Self {
        let (events_tx, events_rx) = event::channel();
        let store = Arc::new(PieceStore::new(meta.clone(), download_dir, events_tx.clone()));
        let (shutdown, _) = watch::channel(false);
        let peer_id = Handshake::generate_peer_id();
        info!("Local peer id {}", String::from_utf8_lossy(&peer_id[..8]));
        Self {
            meta,
            store,
            port,
            peer_id,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            events_rx: Some(events_rx),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn store(&self) -> Arc<PieceStore> {
        self.store.clone()
    }

    /// Signal every task to wind down; `run` then returns
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Handle that can stop the client from another task
    pub fn stop_handle(&self) -> Arc<watch::Sender<bool>> {
        self.shutdown.clone()
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Run the client until stopped: startup verification, listener,
    /// tracker announce loops, then event supervision
    pub async fn run(&mut self) -> Result<()> {
        self.store.check_existing().await?;

        let listener = TcpListener::bind(("0.0.0.0", self.port)).await.map_err(|e| {
            TorrentError::io_failure_full(
                "Failed to bind listen port",
                format!("0.0.0.0:{}", self.port),
                e.to_string(),
            )
        })?;
        info!(
            "Listening on {} for '{}' ({})",
            listener.local_addr()?,
            self.meta.name,
            self.meta.info_hash_hex()
        );

        for url in &self.meta.trackers {
            match Tracker::new(
                url.as_str(),
                self.meta.info_hash,
                self.peer_id,
                self.port,
                self.events_tx.clone(),
            ) {
                Ok(tracker) => {
                    tokio::spawn(tracker.run(self.store.clone(), self.shutdown_rx()));
                }
                Err(e) => warn!("Skipping tracker {}: {}", url, e),
            }
        }

        let mut events = self
            .events_rx
            .take()
            .ok_or_else(|| TorrentError::io_failure("Client already ran"))?;
        let mut shutdown = self.shutdown_rx();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_inbound(stream, addr),
                    Err(e) => warn!("Accept failed: {}", e),
                },
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        self.close_all_sessions();
        info!("Client for '{}' stopped", self.meta.name);
        Ok(())
    }

    async fn handle_event(&self, event: Event) {
        match event {
            Event::PeerListUpdated(endpoints) => {
                debug!("Tracker update with {} endpoints", endpoints.len());
                for addr in endpoints {
                    self.spawn_outbound(addr);
                }
            }
            Event::PieceVerified(piece) => {
                self.broadcast_have(piece);
            }
            Event::BlockRequested { peer, piece, begin, length } => {
                self.serve_block(peer, piece, begin, length);
            }
            Event::BlockCancelled { peer, piece, begin, .. } => {
                // nothing queued per-block to withdraw; policy hook
                trace!("{} cancelled piece {} begin {}", peer, piece, begin);
            }
            Event::StateChanged { peer } => {
                // piece selection policy would react here
                trace!("State changed for {}", peer);
            }
            Event::Disconnected { peer } => {
                let removed = self.sessions.lock().unwrap().remove(&peer.to_string());
                if removed.is_some() {
                    debug!("Session {} removed ({} left)", peer, self.session_count());
                }
            }
        }
    }

    /// Dial an endpoint unless a session for it is already mapped
    fn spawn_outbound(&self, addr: SocketAddr) {
        let key = addr.to_string();
        if self.sessions.lock().unwrap().contains_key(&key) {
            trace!("Already connected to {}", addr);
            return;
        }
        let store = self.store.clone();
        let events = self.events_tx.clone();
        let shutdown = self.shutdown_rx();
        let peer_id = self.peer_id;
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            match PeerSession::connect(addr, store, events, shutdown, peer_id).await {
                Ok(mut session) => {
                    let handle = session.handle();
                    sessions.lock().unwrap().insert(key, handle);
                    let _ = session.run().await;
                }
                Err(e) => debug!("Dial {} failed: {}", addr, e),
            }
        });
    }

    fn spawn_inbound(&self, stream: TcpStream, addr: SocketAddr) {
        let mut session = PeerSession::accept(
            stream,
            addr,
            self.store.clone(),
            self.events_tx.clone(),
            self.shutdown_rx(),
            self.peer_id,
        );
        let handle = session.handle();
        self.sessions.lock().unwrap().insert(addr.to_string(), handle);
        tokio::spawn(async move {
            let _ = session.run().await;
        });
    }

    /// Tell every active session about a fresh piece, once each
    fn broadcast_have(&self, piece: u32) {
        let handles: Vec<SessionHandle> =
            self.sessions.lock().unwrap().values().cloned().collect();
        debug!("Broadcasting have({}) to {} sessions", piece, handles.len());
        for handle in handles {
            let _ = handle.commands.send(SessionCommand::SendHave(piece));
        }
    }

    /// Answer a block request from the store on a side task
    fn serve_block(&self, peer: SocketAddr, piece: u32, begin: u32, length: u32) {
        let Some(handle) = self.sessions.lock().unwrap().get(&peer.to_string()).cloned() else {
            return;
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            match store.read_block(piece, begin, length).await {
                Ok(data) => {
                    let _ = handle.commands.send(SessionCommand::SendPiece { piece, begin, data });
                }
                Err(e) => warn!("Cannot serve piece {} to {}: {}", piece, peer, e),
            }
        });
    }

    fn close_all_sessions(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        for (_, handle) in sessions.iter() {
            let _ = handle.commands.send(SessionCommand::Close);
        }
        sessions.clear();
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
