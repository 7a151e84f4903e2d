//! Peer session task
//!
//! Drives one remote peer over TCP: handshake, bitfield exchange, then a
//! read loop dispatching wire messages into the store and the event
//! channel. Outbound traffic (have broadcasts, served blocks, choke and
//! interest toggles, keep-alives) runs on a companion writer task fed by a
//! command channel.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::TorrentError;
use crate::event::{Event, EventSender};
use crate::peer::state::{PeerState, SessionPhase};
use crate::protocol::{wire, Handshake, Message};
use crate::storage::PieceStore;
use crate::torrent::BLOCK_SIZE;

/// Outbound TCP connect budget
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The whole handshake must complete within this budget
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A session with nothing read for this long is closed
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Largest block a peer may request
pub const MAX_REQUEST_LENGTH: u32 = 131_072;

const KEEPALIVE_TICK: Duration = Duration::from_secs(15);

/// Outbound work for the session's writer task
#[derive(Debug, Clone)]
pub enum SessionCommand {
    SendHave(u32),
    SendPiece { piece: u32, begin: u32, data: Vec<u8> },
    SendRequest { piece: u32, begin: u32, length: u32 },
    /// Desired interest state; a no-op when already there
    SendInterested(bool),
    /// Desired choke state (true = choke); a no-op when already there
    SendChoke(bool),
    Close,
}

/// The orchestrator's grip on a running session
#[derive(Clone)]
pub struct SessionHandle {
    pub addr: SocketAddr,
    pub commands: mpsc::UnboundedSender<SessionCommand>,
    pub state: Arc<Mutex<PeerState>>,
}

/// One peer connection, run as an independent task
pub struct PeerSession {
    stream: Option<TcpStream>,
    addr: SocketAddr,
    inbound: bool,
    peer_id: [u8; 20],
    store: Arc<PieceStore>,
    state: Arc<Mutex<PeerState>>,
    events: EventSender,
    commands: Option<mpsc::UnboundedReceiver<SessionCommand>>,
    shutdown: watch::Receiver<bool>,
}

impl PeerSession {
    /// Dial a peer and prepare an outbound session
    pub async fn connect(
        addr: SocketAddr,
        store: Arc<PieceStore>,
        events: EventSender,
        shutdown: watch::Receiver<bool>,
        peer_id: [u8; 20],
    ) -> Result<Self> {
        debug!("Connecting to peer {}", addr);
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                TorrentError::timeout_with_resource("Connection attempt timed out", addr.to_string())
            })?
            .map_err(|e| {
                TorrentError::io_failure_full("Failed to connect", addr.to_string(), e.to_string())
            })?;
        Ok(Self::from_stream(stream, addr, false, store, events, shutdown, peer_id))
    }

    /// Wrap an accepted inbound connection
    pub fn accept(
        stream: TcpStream,
        addr: SocketAddr,
        store: Arc<PieceStore>,
        events: EventSender,
        shutdown: watch::Receiver<bool>,
        peer_id: [u8; 20],
    ) -> Self {
        debug!("Accepted peer {}", addr);
        Self::from_stream(stream, addr, true, store, events, shutdown, peer_id)
    }

    fn from_stream(
        stream: TcpStream,
        addr: SocketAddr,
        inbound: bool,
        store: Arc<PieceStore>,
        events: EventSender,
        shutdown: watch::Receiver<bool>,
        peer_id: [u8; 20],
    ) -> Self {
        let state = Arc::new(Mutex::new(PeerState::new(addr, store.metainfo())));
        Self {
            stream: Some(stream),
            addr,
            inbound,
            peer_id,
            store,
            state,
            events,
            commands: None,
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Handle for the orchestrator; creates the command channel
    pub fn handle(&mut self) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.commands = Some(rx);
        SessionHandle {
            addr: self.addr,
            commands: tx,
            state: self.state.clone(),
        }
    }

    /// Run the session to completion; always emits `Disconnected` on exit
    pub async fn run(mut self) -> Result<()> {
        if self.commands.is_none() {
            let _ = self.handle();
        }
        let result = self.drive().await;
        self.state.lock().unwrap().phase = SessionPhase::Closed;
        if let Err(e) = &result {
            debug!("Session {} closed: {}", self.addr, e);
        }
        let _ = self.events.send(Event::Disconnected { peer: self.addr });
        result
    }

    async fn drive(&mut self) -> Result<()> {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| TorrentError::io_failure("Session stream already consumed"))?;

        self.exchange_handshake(&mut stream).await?;

        // advertise what we already have
        let bitfield = self.store.bitfield();
        wire::write_frame(&mut stream, &Message::Bitfield { bitfield }).await?;
        self.state.lock().unwrap().note_sent();

        let (mut reader, writer) = stream.into_split();
        let closed = Arc::new(Notify::new());
        let commands = self
            .commands
            .take()
            .ok_or_else(|| TorrentError::io_failure("Session command channel already consumed"))?;
        let writer_task = tokio::spawn(Self::write_loop(
            writer,
            commands,
            self.state.clone(),
            self.store.clone(),
            self.shutdown.clone(),
            closed.clone(),
        ));

        let result = loop {
            tokio::select! {
                frame = timeout(IDLE_TIMEOUT, wire::read_frame(&mut reader)) => {
                    let message = match frame {
                        Ok(Ok(message)) => message,
                        Ok(Err(e)) => break Err(e),
                        Err(_) => break Err(TorrentError::timeout_with_resource(
                            "Peer idle past limit",
                            self.addr.to_string(),
                        ).into()),
                    };
                    self.state.lock().unwrap().touch();
                    if let Err(e) = self.handle_frame(message).await {
                        break Err(e);
                    }
                }
                _ = closed.notified() => break Ok(()),
                _ = self.shutdown.changed() => break Ok(()),
            }
        };

        writer_task.abort();
        result
    }

    async fn exchange_handshake(&self, stream: &mut TcpStream) -> Result<()> {
        self.state.lock().unwrap().phase = SessionPhase::Handshaking;
        let meta = self.store.metainfo().clone();
        let ours = Handshake::new(meta.info_hash, self.peer_id);

        let theirs = timeout(HANDSHAKE_TIMEOUT, async {
            if self.inbound {
                let theirs = wire::read_handshake(stream).await?;
                wire::write_handshake(stream, &ours).await?;
                Ok::<_, anyhow::Error>(theirs)
            } else {
                wire::write_handshake(stream, &ours).await?;
                let theirs = wire::read_handshake(stream).await?;
                Ok(theirs)
            }
        })
        .await
        .map_err(|_| {
            TorrentError::timeout_with_resource("Handshake timed out", self.addr.to_string())
        })??;

        if !theirs.validate(&meta.info_hash) {
            return Err(TorrentError::protocol_violation_with_peer(
                "Handshake infohash mismatch",
                self.addr.to_string(),
            )
            .into());
        }

        let mut state = self.state.lock().unwrap();
        state.handshake_sent = true;
        state.handshake_received = true;
        state.phase = SessionPhase::Active;
        debug!("Handshake complete with {}", self.addr);
        Ok(())
    }

    fn emit_state_changed(&self) {
        let _ = self.events.send(Event::StateChanged { peer: self.addr });
    }

    async fn handle_frame(&self, message: Message) -> Result<()> {
        trace!("{} sent {:?}", self.addr, message.message_id());
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.state.lock().unwrap().they_choke_us = true;
                self.emit_state_changed();
            }
            Message::Unchoke => {
                self.state.lock().unwrap().they_choke_us = false;
                self.emit_state_changed();
            }
            Message::Interested => {
                self.state.lock().unwrap().they_interested = true;
                self.emit_state_changed();
            }
            Message::NotInterested => {
                self.state.lock().unwrap().they_interested = false;
                self.emit_state_changed();
            }
            Message::Have { piece } => {
                self.state.lock().unwrap().set_remote_has(piece)?;
                self.emit_state_changed();
            }
            Message::Bitfield { bitfield } => {
                self.state.lock().unwrap().merge_bitfield(&bitfield)?;
                self.emit_state_changed();
            }
            Message::Request { piece, begin, length } => {
                self.validate_request(piece, begin, length)?;
                let choking = self.state.lock().unwrap().we_choke_them;
                if choking {
                    trace!("Dropping request from {} while choked", self.addr);
                } else {
                    let _ = self.events.send(Event::BlockRequested {
                        peer: self.addr,
                        piece,
                        begin,
                        length,
                    });
                }
            }
            Message::Piece { piece, begin, data } => {
                if begin % BLOCK_SIZE != 0 {
                    return Err(TorrentError::protocol_violation_with_peer(
                        format!("Unaligned block offset {} in piece {}", begin, piece),
                        self.addr.to_string(),
                    )
                    .into());
                }
                let block = (begin / BLOCK_SIZE) as usize;
                let received = data.len() as u64;
                self.store.write_block(piece, block, &data).await?;
                let mut state = self.state.lock().unwrap();
                state.bytes_down += received;
                state.clear_requested(piece, block);
            }
            Message::Cancel { piece, begin, length } => {
                let _ = self.events.send(Event::BlockCancelled {
                    peer: self.addr,
                    piece,
                    begin,
                    length,
                });
            }
            Message::Port { .. } | Message::Unknown { .. } => {
                trace!("Ignoring message from {}", self.addr);
            }
        }
        Ok(())
    }

    fn validate_request(&self, piece: u32, begin: u32, length: u32) -> Result<()> {
        let meta = self.store.metainfo();
        if piece as usize >= meta.piece_count() {
            return Err(TorrentError::protocol_violation_with_peer(
                format!("Request for unknown piece {}", piece),
                self.addr.to_string(),
            )
            .into());
        }
        if length > MAX_REQUEST_LENGTH {
            return Err(TorrentError::protocol_violation_with_peer(
                format!("Request of {} bytes exceeds limit", length),
                self.addr.to_string(),
            )
            .into());
        }
        if begin as u64 + length as u64 > meta.piece_size(piece) {
            return Err(TorrentError::protocol_violation_with_peer(
                format!(
                    "Request spans piece boundary: piece {} begin {} length {}",
                    piece, begin, length
                ),
                self.addr.to_string(),
            )
            .into());
        }
        Ok(())
    }

    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        state: Arc<Mutex<PeerState>>,
        store: Arc<PieceStore>,
        mut shutdown: watch::Receiver<bool>,
        closed: Arc<Notify>,
    ) {
        let mut keepalive = tokio::time::interval(KEEPALIVE_TICK);
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        None | Some(SessionCommand::Close) => break,
                        Some(command) => {
                            if let Err(e) =
                                Self::apply_command(&mut writer, &state, &store, command).await
                            {
                                warn!("Send failed: {}", e);
                                break;
                            }
                        }
                    }
                }
                _ = keepalive.tick() => {
                    let due = state.lock().unwrap().keepalive_due(Instant::now());
                    if due {
                        if wire::write_frame(&mut writer, &Message::KeepAlive).await.is_err() {
                            break;
                        }
                        let mut state = state.lock().unwrap();
                        state.last_keepalive_sent = Some(Instant::now());
                        state.note_sent();
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        closed.notify_one();
    }

    async fn apply_command(
        writer: &mut OwnedWriteHalf,
        state: &Arc<Mutex<PeerState>>,
        store: &Arc<PieceStore>,
        command: SessionCommand,
    ) -> Result<()> {
        match command {
            SessionCommand::SendHave(piece) => {
                wire::write_frame(writer, &Message::Have { piece }).await?;
                state.lock().unwrap().note_sent();
            }
            SessionCommand::SendPiece { piece, begin, data } => {
                let sent = data.len() as u64;
                wire::write_frame(writer, &Message::Piece { piece, begin, data }).await?;
                store.add_uploaded(sent);
                let mut state = state.lock().unwrap();
                state.bytes_up += sent;
                state.note_sent();
            }
            SessionCommand::SendRequest { piece, begin, length } => {
                wire::write_frame(writer, &Message::Request { piece, begin, length }).await?;
                let mut state = state.lock().unwrap();
                state.mark_requested(piece, (begin / BLOCK_SIZE) as usize);
                state.note_sent();
            }
            SessionCommand::SendInterested(want) => {
                let already = state.lock().unwrap().we_interested == want;
                if !already {
                    let message = if want { Message::Interested } else { Message::NotInterested };
                    wire::write_frame(writer, &message).await?;
                    let mut state = state.lock().unwrap();
                    state.we_interested = want;
                    state.note_sent();
                }
            }
            SessionCommand::SendChoke(want) => {
                let already = state.lock().unwrap().we_choke_them == want;
                if !already {
                    let message = if want { Message::Choke } else { Message::Unchoke };
                    wire::write_frame(writer, &message).await?;
                    let mut state = state.lock().unwrap();
                    state.we_choke_them = want;
                    state.note_sent();
                }
            }
            SessionCommand::Close => unreachable!("handled by the writer loop"),
        }
        Ok(())
    }
}
