//! Transfer state machine.
//!
//! One tokio task owns each [`TransferSession`] and is the only mutator of
//! its state. It consumes commands from the caller, events from the relay
//! and the direct channel, and progress from the sender's chunk pump, and
//! publishes status as plain data through a watch channel. Sessions never
//! share memory; a process running several sessions runs several tasks.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use peerdrop_crypto::{ChunkCipher, KeyExchange, import_public_key};
use peerdrop_proto::{
    ChannelFrame, ChunkFrame, DescriptionKind, SessionDescription, SignalPayload, TransferManifest,
};

use crate::channel::{self, ChannelEvent, ChannelHandle};
use crate::codec::{ChunkAssembler, ChunkReport, FileChunker, encrypt_chunk};
use crate::error::{ErrorKind, Result, TransferError};
use crate::identity::SessionId;
use crate::relay::{RelayEvent, RelayHandle};

/// Role of this session in the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// Phases of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Idle,
    KeyExchangePending,
    ChannelConnecting,
    Ready,
    Transferring,
    Completed,
    Failed,
}

impl TransferPhase {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Monotone progress counter with an optional known total.
///
/// Senders know the total up front; receivers learn it from the manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Progress {
    pub bytes_processed: u64,
    pub total_bytes: Option<u64>,
}

impl Progress {
    /// Fraction of bytes processed, when the total is known.
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> Option<f64> {
        self.total_bytes.map(|total| {
            if total == 0 {
                1.0
            } else {
                self.bytes_processed as f64 / total as f64
            }
        })
    }
}

/// Snapshot of session state published to the presentation layer.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub phase: TransferPhase,
    /// Human-readable status text.
    pub message: String,
    /// Set once the relay acknowledges registration.
    pub registered: bool,
    /// Set if the relay refused our registration; the session stays
    /// unregistered and the caller decides what to do.
    pub registration_refused: bool,
    pub progress: Progress,
    /// Record of the most recent chunk processed.
    pub last_chunk: Option<ChunkReport>,
    /// Error classification when `phase` is `Failed`.
    pub error: Option<ErrorKind>,
    /// True once the peer has closed the direct channel.
    pub channel_closed: bool,
}

impl SessionStatus {
    fn initial() -> Self {
        Self {
            phase: TransferPhase::Idle,
            message: "Idle".into(),
            registered: false,
            registration_refused: false,
            progress: Progress::default(),
            last_chunk: None,
            error: None,
            channel_closed: false,
        }
    }
}

/// Commands from the surrounding application.
#[derive(Debug)]
pub enum SessionCommand {
    /// Bind the peer identifier and start the handshake.
    Connect { peer: SessionId },
    /// Sender only: begin transferring the file at `path`.
    SendFile { path: PathBuf },
}

/// A fully reassembled incoming file. The core hands this to the caller;
/// persistence is the caller's decision.
#[derive(Debug)]
pub struct ReceivedFile {
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Configuration for spawning a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub id: SessionId,
    pub role: Role,
    /// IP advertised in channel offers, normally the relay socket's local
    /// IP (the interface the peer network can reach us on).
    pub advertise_ip: IpAddr,
}

/// Caller-side handle to a running session task.
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    pub status: watch::Receiver<SessionStatus>,
    pub received: mpsc::Receiver<ReceivedFile>,
}

impl SessionHandle {
    /// Bind the peer identifier and start the handshake.
    pub async fn connect(&self, peer: SessionId) -> Result<()> {
        self.command(SessionCommand::Connect { peer }).await
    }

    /// Begin sending the file at `path` (sender role, `Ready` phase).
    pub async fn send_file(&self, path: PathBuf) -> Result<()> {
        self.command(SessionCommand::SendFile { path }).await
    }

    async fn command(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransferError::Channel("session task ended".into()))
    }

    /// Wait until the session reaches a terminal phase and return it.
    pub async fn wait_terminal(&mut self) -> TransferPhase {
        loop {
            let phase = self.status.borrow().phase;
            if phase.is_terminal() {
                return phase;
            }
            if self.status.changed().await.is_err() {
                return self.status.borrow().phase;
            }
        }
    }
}

/// Events from the sender's chunk pump.
#[derive(Debug)]
enum PumpEvent {
    Progress { bytes_sent: u64, report: ChunkReport },
    Done { chunks: u64 },
    Failed(TransferError),
}

/// Events merged into the session loop from spawned tasks.
#[derive(Debug)]
enum InternalEvent {
    Channel(ChannelEvent),
    Pump(PumpEvent),
    Dialed(Result<(ChannelHandle, mpsc::Receiver<ChannelEvent>)>),
}

/// Spawn a session task and return the caller handle.
///
/// `relay` carries outbound signals; `relay_rx` delivers relay events.
/// Both normally come from [`crate::relay::connect`].
pub fn spawn(
    config: SessionConfig,
    relay: RelayHandle,
    relay_rx: mpsc::Receiver<RelayEvent>,
) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (status_tx, status_rx) = watch::channel(SessionStatus::initial());
    let (received_tx, received_rx) = mpsc::channel(1);
    let (internal_tx, internal_rx) = mpsc::channel(64);

    let session = TransferSession {
        id: config.id,
        role: config.role,
        advertise_ip: config.advertise_ip,
        relay,
        phase: TransferPhase::Idle,
        peer: None,
        exchange: None,
        cipher: None,
        chan: None,
        assembler: ChunkAssembler::new(),
        pending_offer: None,
        pending_candidates: Vec::new(),
        dialing: false,
        bytes_processed: 0,
        status_tx,
        received_tx,
        internal_tx,
    };
    tokio::spawn(session.run(cmd_rx, relay_rx, internal_rx));

    SessionHandle {
        commands: cmd_tx,
        status: status_rx,
        received: received_rx,
    }
}

/// Per-session state, exclusively owned by its task.
struct TransferSession {
    id: SessionId,
    role: Role,
    advertise_ip: IpAddr,
    relay: RelayHandle,
    phase: TransferPhase,
    /// Peer identifier bound at `Connect`; signals from anyone else are
    /// ignored.
    peer: Option<SessionId>,
    exchange: Option<KeyExchange>,
    cipher: Option<ChunkCipher>,
    chan: Option<ChannelHandle>,
    assembler: ChunkAssembler,
    /// Offer that arrived before the shared key was derived.
    pending_offer: Option<SessionDescription>,
    /// Candidates collected before dialing started.
    pending_candidates: Vec<SocketAddr>,
    dialing: bool,
    /// Plaintext bytes processed so far (monotone).
    bytes_processed: u64,
    status_tx: watch::Sender<SessionStatus>,
    received_tx: mpsc::Sender<ReceivedFile>,
    internal_tx: mpsc::Sender<InternalEvent>,
}

impl TransferSession {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut relay_rx: mpsc::Receiver<RelayEvent>,
        mut internal: mpsc::Receiver<InternalEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.on_command(command).await {
                            self.fail(e);
                        }
                    }
                    None => {
                        debug!(id = %self.id, "Session handle dropped; shutting down");
                        return;
                    }
                },
                Some(event) = relay_rx.recv() => {
                    if let Err(e) = self.on_relay(event).await {
                        self.fail(e);
                    }
                }
                Some(event) = internal.recv() => {
                    if let Err(e) = self.on_internal(event).await {
                        self.fail(e);
                    }
                }
                else => return,
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────

    async fn on_command(&mut self, command: SessionCommand) -> Result<()> {
        match command {
            SessionCommand::Connect { peer } => self.on_connect(peer).await,
            SessionCommand::SendFile { path } => self.on_send_file(path).await,
        }
    }

    async fn on_connect(&mut self, peer: SessionId) -> Result<()> {
        if self.phase != TransferPhase::Idle {
            return Err(TransferError::Sequence {
                phase: "connect",
                message: "session already connected".into(),
            });
        }
        info!(id = %self.id, peer = %peer, role = ?self.role, "Binding peer");
        self.peer = Some(peer.clone());
        let exchange = KeyExchange::new();

        match self.role {
            Role::Sender => {
                // First public-key signal starts the handshake; the
                // receiver replies with its own key.
                let jwk = exchange.export_public_key()?;
                self.exchange = Some(exchange);
                self.relay
                    .signal(&peer, SignalPayload::PublicKey { public_key: jwk })
                    .await?;
                self.set_phase(TransferPhase::KeyExchangePending, "Key exchange in progress");
            }
            Role::Receiver => {
                self.exchange = Some(exchange);
                self.set_phase(
                    TransferPhase::KeyExchangePending,
                    format!("Waiting for sender {peer}"),
                );
            }
        }
        Ok(())
    }

    async fn on_send_file(&mut self, path: PathBuf) -> Result<()> {
        if self.role != Role::Sender || self.phase != TransferPhase::Ready {
            return Err(TransferError::Sequence {
                phase: "send-file",
                message: "sendFile requires a sender session in Ready".into(),
            });
        }
        let cipher = self.cipher.clone().ok_or(TransferError::Sequence {
            phase: "send-file",
            message: "no shared key derived".into(),
        })?;
        let chan = self.chan.clone().ok_or(TransferError::Sequence {
            phase: "send-file",
            message: "no open channel".into(),
        })?;

        let (chunker, total_size) = FileChunker::open(&path).await?;
        let file_name = path
            .file_name()
            .map_or_else(|| "file".to_owned(), |n| n.to_string_lossy().into_owned());

        info!(id = %self.id, file = %file_name, total_size, "Starting transfer");
        self.update_status(|status| {
            status.progress.total_bytes = Some(total_size);
        });
        self.set_phase(TransferPhase::Transferring, "Sending: 0.0%");

        tokio::spawn(pump_file(
            chunker,
            total_size,
            file_name,
            cipher,
            chan,
            self.internal_tx.clone(),
        ));
        Ok(())
    }

    // ── Relay events ─────────────────────────────────────────────────────

    async fn on_relay(&mut self, event: RelayEvent) -> Result<()> {
        if self.phase.is_terminal() {
            trace!(id = %self.id, ?event, "Relay event after terminal phase; ignored");
            return Ok(());
        }
        match event {
            RelayEvent::Registered(id) => {
                self.update_status(|status| {
                    status.registered = true;
                    status.message = format!("Registered as {id}");
                });
                Ok(())
            }
            RelayEvent::Refused(message) => {
                warn!(id = %self.id, message, "Relay refused request");
                self.update_status(|status| {
                    if !status.registered {
                        status.registration_refused = true;
                    }
                    status.message = format!("Registration failed: {message}");
                });
                Ok(())
            }
            RelayEvent::Malformed(message) => Err(TransferError::Signaling(message)),
            RelayEvent::Closed(reason) => Err(TransferError::Relay(
                reason.unwrap_or_else(|| "relay connection closed".into()),
            )),
            RelayEvent::Signal { from, payload } => self.on_signal(&from, payload).await,
        }
    }

    async fn on_signal(&mut self, from: &str, payload: SignalPayload) -> Result<()> {
        let Some(peer) = self.peer.clone() else {
            trace!(id = %self.id, from, "Signal before peer bound; ignored");
            return Ok(());
        };
        // Cross-talk guard: the relay is shared by many sessions, so a
        // signal from anyone but the bound peer is ignored, not an error.
        if from != peer.as_str() {
            trace!(id = %self.id, from, peer = %peer, "Ignoring signal from unbound peer");
            return Ok(());
        }
        match payload {
            SignalPayload::PublicKey { public_key } => self.on_peer_key(&peer, &public_key).await,
            SignalPayload::Description { session_description } => {
                self.on_description(&peer, session_description).await
            }
            SignalPayload::Candidate { candidate } => {
                self.on_candidate(candidate);
                Ok(())
            }
        }
    }

    /// Peer public key received: derive the shared key first, then start
    /// the channel negotiation (derive-then-connect).
    async fn on_peer_key(&mut self, peer: &SessionId, jwk: &str) -> Result<()> {
        if self.cipher.is_some() {
            warn!(id = %self.id, "Duplicate public key signal; ignored");
            return Ok(());
        }
        let Some(exchange) = self.exchange.take() else {
            return Err(TransferError::Sequence {
                phase: "key-exchange",
                message: "public key before key pair generation".into(),
            });
        };

        // Receiver replies with its own public key, as the original
        // handshake does, before deriving.
        let reply = match self.role {
            Role::Receiver => Some(exchange.export_public_key()?),
            Role::Sender => None,
        };

        let peer_key = import_public_key(jwk)?;
        let shared = exchange.derive(&peer_key)?;
        self.cipher = Some(ChunkCipher::new(&shared));
        info!(id = %self.id, "Shared key derived");

        if let Some(jwk) = reply {
            self.relay
                .signal(peer, SignalPayload::PublicKey { public_key: jwk })
                .await?;
        }
        self.set_phase(TransferPhase::ChannelConnecting, "Establishing direct channel");

        match self.role {
            Role::Sender => self.start_listener(peer).await,
            Role::Receiver => {
                // An offer may have arrived before the key did.
                if let Some(offer) = self.pending_offer.take() {
                    self.answer_and_dial(peer.clone(), offer).await?;
                }
                Ok(())
            }
        }
    }

    /// Sender side: bind the channel listener and advertise endpoints.
    async fn start_listener(&mut self, peer: &SessionId) -> Result<()> {
        let (port, handle, events) = channel::serve().await?;
        self.chan = Some(handle);
        self.spawn_channel_forwarder(events);

        let endpoint = SocketAddr::new(self.advertise_ip, port);
        self.relay
            .signal(
                peer,
                SignalPayload::Description {
                    session_description: SessionDescription {
                        kind: DescriptionKind::Offer,
                        endpoint,
                    },
                },
            )
            .await?;
        if !self.advertise_ip.is_loopback() {
            // Same-host fallback candidate.
            self.relay
                .signal(
                    peer,
                    SignalPayload::Candidate {
                        candidate: SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port),
                    },
                )
                .await?;
        }
        debug!(id = %self.id, %endpoint, "Offer sent");
        Ok(())
    }

    async fn on_description(
        &mut self,
        peer: &SessionId,
        description: SessionDescription,
    ) -> Result<()> {
        match (self.role, description.kind) {
            (Role::Sender, DescriptionKind::Answer) => {
                debug!(id = %self.id, endpoint = %description.endpoint, "Answer received");
                self.update_status(|status| {
                    status.message = "Answer received; waiting for peer connection".into();
                });
                Ok(())
            }
            (Role::Receiver, DescriptionKind::Offer) => {
                if self.dialing || self.chan.is_some() {
                    trace!(id = %self.id, "Duplicate offer; ignored");
                    return Ok(());
                }
                if self.cipher.is_none() {
                    // Derive-then-connect: hold the offer until the key
                    // exchange dependency is satisfied.
                    debug!(id = %self.id, "Offer buffered until key derivation");
                    self.pending_offer = Some(description);
                    return Ok(());
                }
                self.answer_and_dial(peer.clone(), description).await
            }
            (role, kind) => {
                trace!(id = %self.id, ?role, ?kind, "Irrelevant description; ignored");
                Ok(())
            }
        }
    }

    fn on_candidate(&mut self, candidate: SocketAddr) {
        if self.role == Role::Sender || self.dialing || self.chan.is_some() {
            trace!(id = %self.id, %candidate, "Candidate ignored");
            return;
        }
        debug!(id = %self.id, %candidate, "Candidate collected");
        self.pending_candidates.push(candidate);
    }

    /// Receiver side: acknowledge the offer and dial the known endpoints.
    async fn answer_and_dial(&mut self, peer: SessionId, offer: SessionDescription) -> Result<()> {
        self.relay
            .signal(
                &peer,
                SignalPayload::Description {
                    session_description: SessionDescription {
                        kind: DescriptionKind::Answer,
                        endpoint: offer.endpoint,
                    },
                },
            )
            .await?;

        let mut endpoints = vec![offer.endpoint];
        for candidate in self.pending_candidates.drain(..) {
            if !endpoints.contains(&candidate) {
                endpoints.push(candidate);
            }
        }
        debug!(id = %self.id, ?endpoints, "Dialing peer");
        self.dialing = true;

        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = channel::dial(&endpoints).await;
            let _ = internal.send(InternalEvent::Dialed(result)).await;
        });
        Ok(())
    }

    // ── Internal events ──────────────────────────────────────────────────

    async fn on_internal(&mut self, event: InternalEvent) -> Result<()> {
        if self.phase.is_terminal() {
            // After completion the only thing still worth tracking is the
            // peer tearing the channel down.
            if let InternalEvent::Channel(ChannelEvent::Closed | ChannelEvent::Error(_)) = event {
                self.update_status(|status| status.channel_closed = true);
            }
            return Ok(());
        }
        match event {
            InternalEvent::Dialed(Ok((handle, events))) => {
                self.chan = Some(handle);
                self.spawn_channel_forwarder(events);
                Ok(())
            }
            InternalEvent::Dialed(Err(e)) => Err(e),
            InternalEvent::Channel(event) => self.on_channel(event).await,
            InternalEvent::Pump(event) => self.on_pump(event),
        }
    }

    async fn on_channel(&mut self, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::Open => {
                if self.phase != TransferPhase::ChannelConnecting {
                    return Err(TransferError::Sequence {
                        phase: "channel-open",
                        message: format!("channel opened during {:?}", self.phase),
                    });
                }
                let message = match self.role {
                    Role::Sender => "Connected. Ready to send files.",
                    Role::Receiver => "Connection secure. Ready to receive files.",
                };
                self.set_phase(TransferPhase::Ready, message);
                Ok(())
            }
            ChannelEvent::Message(ChannelFrame::Data(bytes)) => self.on_chunk(&bytes),
            ChannelEvent::Message(ChannelFrame::Control(text)) => self.on_control(&text).await,
            ChannelEvent::Closed => Err(TransferError::Channel(
                "channel closed before completion".into(),
            )),
            ChannelEvent::Error(message) => Err(TransferError::Channel(message)),
        }
    }

    /// Receiver side: queue one encrypted chunk frame.
    fn on_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        if self.role != Role::Receiver {
            return Err(TransferError::Sequence {
                phase: "transfer",
                message: "sender received a chunk frame".into(),
            });
        }
        if self.cipher.is_none()
            || !matches!(self.phase, TransferPhase::Ready | TransferPhase::Transferring)
        {
            return Err(TransferError::Sequence {
                phase: "transfer",
                message: "chunk frame before session was ready".into(),
            });
        }
        if self.phase == TransferPhase::Ready {
            self.set_phase(TransferPhase::Transferring, "Receiving");
        }

        let frame = ChunkFrame::decode(bytes)?;
        let report = self.assembler.push(frame);
        self.bytes_processed += report.original_size as u64;
        let count = self.assembler.frame_count();
        let bytes_processed = self.bytes_processed;
        self.update_status(|status| {
            status.progress.bytes_processed = bytes_processed;
            status.message = format!("Receiving: Chunk {count}");
            status.last_chunk = Some(report);
        });
        Ok(())
    }

    /// Receiver side: the manifest ends the transfer and triggers final
    /// assembly.
    async fn on_control(&mut self, text: &str) -> Result<()> {
        if self.role != Role::Receiver {
            return Err(TransferError::Sequence {
                phase: "transfer",
                message: "sender received a control payload".into(),
            });
        }
        let manifest = TransferManifest::from_control(text)
            .map_err(|e| TransferError::Signaling(format!("bad control payload: {e}")))?;
        if !manifest.done {
            trace!(id = %self.id, "Non-final manifest; ignored");
            return Ok(());
        }
        if !matches!(self.phase, TransferPhase::Ready | TransferPhase::Transferring) {
            return Err(TransferError::Sequence {
                phase: "transfer",
                message: "manifest before session was ready".into(),
            });
        }
        let cipher = self.cipher.clone().ok_or(TransferError::Sequence {
            phase: "transfer",
            message: "manifest before key derivation".into(),
        })?;

        info!(
            id = %self.id,
            file = %manifest.file_name,
            total_size = manifest.total_size,
            chunks = self.assembler.frame_count(),
            "Finalizing transfer"
        );
        self.update_status(|status| {
            status.message = "Decrypting file...".into();
        });

        // Bulk decryption is CPU work; run it on the blocking pool so the
        // runtime keeps servicing other sessions.
        let assembler = std::mem::take(&mut self.assembler);
        let finalize_manifest = manifest.clone();
        let data = tokio::task::spawn_blocking(move || {
            assembler.finalize(&cipher, &finalize_manifest)
        })
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;

        let total = manifest.total_size;
        self.bytes_processed = total;
        self.update_status(|status| {
            status.progress.bytes_processed = total;
            status.progress.total_bytes = Some(total);
        });
        let _ = self
            .received_tx
            .send(ReceivedFile {
                file_name: manifest.file_name,
                data,
            })
            .await;
        self.set_phase(TransferPhase::Completed, "File received successfully");
        Ok(())
    }

    fn on_pump(&mut self, event: PumpEvent) -> Result<()> {
        match event {
            PumpEvent::Progress { bytes_sent, report } => {
                self.bytes_processed = bytes_sent;
                self.update_status(|status| {
                    status.progress.bytes_processed = bytes_sent;
                    let percent = status.progress.fraction().unwrap_or(0.0) * 100.0;
                    status.message = format!("Sending: {percent:.1}%");
                    status.last_chunk = Some(report);
                });
                Ok(())
            }
            PumpEvent::Done { chunks } => {
                info!(id = %self.id, chunks, "All chunks and manifest transmitted");
                self.set_phase(TransferPhase::Completed, "File sent successfully");
                Ok(())
            }
            PumpEvent::Failed(error) => Err(error),
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn spawn_channel_forwarder(&self, mut events: mpsc::Receiver<ChannelEvent>) {
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if internal.send(InternalEvent::Channel(event)).await.is_err() {
                    return;
                }
            }
        });
    }

    fn set_phase(&mut self, phase: TransferPhase, message: impl Into<String>) {
        self.phase = phase;
        let message = message.into();
        debug!(id = %self.id, ?phase, %message, "Phase transition");
        self.status_tx.send_modify(|status| {
            status.phase = phase;
            status.message = message;
        });
    }

    fn update_status(&self, apply: impl FnOnce(&mut SessionStatus)) {
        self.status_tx.send_modify(apply);
    }

    /// Move to the absorbing `Failed` state. Partially received chunks are
    /// discarded, never assembled into a truncated file.
    fn fail(&mut self, error: TransferError) {
        if self.phase.is_terminal() {
            warn!(id = %self.id, error = %error, "Error after terminal phase; ignored");
            return;
        }
        warn!(id = %self.id, error = %error, kind = %error.kind(), "Transfer failed");
        self.assembler = ChunkAssembler::new();
        self.phase = TransferPhase::Failed;
        self.status_tx.send_modify(|status| {
            status.phase = TransferPhase::Failed;
            status.error = Some(error.kind());
            status.message = error.to_string();
        });
    }
}

/// Read, encrypt, and transmit every chunk, then the manifest.
///
/// `ChannelHandle::send` awaits queue capacity, so this task is throttled
/// by the socket without reordering or re-encrypting anything.
async fn pump_file(
    mut chunker: FileChunker,
    total_size: u64,
    file_name: String,
    cipher: ChunkCipher,
    chan: ChannelHandle,
    events: mpsc::Sender<InternalEvent>,
) {
    let mut bytes_sent: u64 = 0;
    let mut index: u64 = 0;

    loop {
        let chunk = match chunker.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                let _ = events.send(InternalEvent::Pump(PumpEvent::Failed(e))).await;
                return;
            }
        };
        let (frame, report) = match encrypt_chunk(&cipher, &chunk, index) {
            Ok(sealed) => sealed,
            Err(e) => {
                let _ = events.send(InternalEvent::Pump(PumpEvent::Failed(e))).await;
                return;
            }
        };
        if let Err(e) = chan.send(ChannelFrame::Data(frame.encode())).await {
            let _ = events.send(InternalEvent::Pump(PumpEvent::Failed(e))).await;
            return;
        }
        bytes_sent += chunk.len() as u64;
        index += 1;
        let _ = events
            .send(InternalEvent::Pump(PumpEvent::Progress { bytes_sent, report }))
            .await;
    }

    let manifest = TransferManifest {
        done: true,
        file_name,
        total_size,
    };
    let control = match manifest.to_control() {
        Ok(control) => control,
        Err(e) => {
            let _ = events
                .send(InternalEvent::Pump(PumpEvent::Failed(
                    TransferError::Signaling(e.to_string()),
                )))
                .await;
            return;
        }
    };
    if let Err(e) = chan.send(ChannelFrame::Control(control)).await {
        let _ = events.send(InternalEvent::Pump(PumpEvent::Failed(e))).await;
        return;
    }
    let _ = events
        .send(InternalEvent::Pump(PumpEvent::Done { chunks: index }))
        .await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    use peerdrop_proto::ClientFrame;

    /// Spawn a session wired to in-test channels instead of sockets.
    fn test_session(
        role: Role,
    ) -> (
        SessionHandle,
        mpsc::Receiver<ClientFrame>,
        mpsc::Sender<RelayEvent>,
        SessionId,
    ) {
        let id = SessionId::generate();
        let (out_tx, out_rx) = mpsc::channel(32);
        let (relay_tx, relay_rx) = mpsc::channel(64);
        let relay = RelayHandle::from_parts(out_tx, IpAddr::from([127, 0, 0, 1]));
        let handle = spawn(
            SessionConfig {
                id: id.clone(),
                role,
                advertise_ip: IpAddr::from([127, 0, 0, 1]),
            },
            relay,
            relay_rx,
        );
        (handle, out_rx, relay_tx, id)
    }

    async fn wait_phase(handle: &mut SessionHandle, phase: TransferPhase) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if handle.status.borrow().phase == phase {
                    return;
                }
                handle.status.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "timed out waiting for {phase:?}, stuck in {:?}",
                handle.status.borrow().phase
            )
        });
    }

    fn peer_id() -> SessionId {
        "PEER42".parse().unwrap()
    }

    #[tokio::test]
    async fn registration_ack_is_observable() {
        let (mut handle, _out, relay_tx, id) = test_session(Role::Receiver);
        assert!(!handle.status.borrow().registered);

        relay_tx
            .send(RelayEvent::Registered(id.clone()))
            .await
            .unwrap();
        handle.status.changed().await.unwrap();
        let status = handle.status.borrow().clone();
        assert!(status.registered);
        assert_eq!(status.message, format!("Registered as {id}"));
    }

    #[tokio::test]
    async fn registration_refusal_is_observable_without_failing() {
        let (mut handle, _out, relay_tx, _id) = test_session(Role::Sender);

        relay_tx
            .send(RelayEvent::Refused("identifier already registered".into()))
            .await
            .unwrap();
        handle.status.changed().await.unwrap();
        let status = handle.status.borrow().clone();
        assert!(!status.registered);
        assert!(status.registration_refused);
        // Not a protocol failure: the caller decides whether to retry.
        assert_eq!(status.phase, TransferPhase::Idle);
    }

    #[tokio::test]
    async fn sender_connect_emits_public_key_signal() {
        let (mut handle, mut out, _relay_tx, _id) = test_session(Role::Sender);
        handle.connect(peer_id()).await.unwrap();
        wait_phase(&mut handle, TransferPhase::KeyExchangePending).await;

        match out.recv().await.unwrap() {
            ClientFrame::Signal {
                target,
                signal: SignalPayload::PublicKey { public_key },
            } => {
                assert_eq!(target, "PEER42");
                assert!(peerdrop_crypto::import_public_key(&public_key).is_ok());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn crosstalk_from_unbound_peer_is_ignored() {
        let (mut handle, mut out, relay_tx, _id) = test_session(Role::Receiver);
        handle.connect(peer_id()).await.unwrap();
        wait_phase(&mut handle, TransferPhase::KeyExchangePending).await;

        let stranger = KeyExchange::new();
        relay_tx
            .send(RelayEvent::Signal {
                from: "STRANG".into(),
                payload: SignalPayload::PublicKey {
                    public_key: stranger.export_public_key().unwrap(),
                },
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            handle.status.borrow().phase,
            TransferPhase::KeyExchangePending
        );
        assert!(out.try_recv().is_err(), "no reply should have been sent");
    }

    #[tokio::test]
    async fn receiver_replies_and_derives_on_peer_key() {
        let (mut handle, mut out, relay_tx, _id) = test_session(Role::Receiver);
        handle.connect(peer_id()).await.unwrap();

        let sender_exchange = KeyExchange::new();
        relay_tx
            .send(RelayEvent::Signal {
                from: "PEER42".into(),
                payload: SignalPayload::PublicKey {
                    public_key: sender_exchange.export_public_key().unwrap(),
                },
            })
            .await
            .unwrap();

        wait_phase(&mut handle, TransferPhase::ChannelConnecting).await;
        match out.recv().await.unwrap() {
            ClientFrame::Signal {
                target,
                signal: SignalPayload::PublicKey { public_key },
            } => {
                assert_eq!(target, "PEER42");
                assert!(peerdrop_crypto::import_public_key(&public_key).is_ok());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn early_offer_is_buffered_until_key_derivation() {
        let (mut handle, mut out, relay_tx, _id) = test_session(Role::Receiver);
        handle.connect(peer_id()).await.unwrap();
        wait_phase(&mut handle, TransferPhase::KeyExchangePending).await;

        // Offer arrives before the sender's public key.
        let endpoint: SocketAddr = "127.0.0.1:9".parse().unwrap();
        relay_tx
            .send(RelayEvent::Signal {
                from: "PEER42".into(),
                payload: SignalPayload::Description {
                    session_description: SessionDescription {
                        kind: DescriptionKind::Offer,
                        endpoint,
                    },
                },
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            handle.status.borrow().phase,
            TransferPhase::KeyExchangePending
        );
        assert!(out.try_recv().is_err());

        // Key arrives; the buffered offer is answered.
        let sender_exchange = KeyExchange::new();
        relay_tx
            .send(RelayEvent::Signal {
                from: "PEER42".into(),
                payload: SignalPayload::PublicKey {
                    public_key: sender_exchange.export_public_key().unwrap(),
                },
            })
            .await
            .unwrap();
        wait_phase(&mut handle, TransferPhase::ChannelConnecting).await;

        // First the public-key reply, then the answer echoing the endpoint.
        assert!(matches!(
            out.recv().await.unwrap(),
            ClientFrame::Signal {
                signal: SignalPayload::PublicKey { .. },
                ..
            }
        ));
        match out.recv().await.unwrap() {
            ClientFrame::Signal {
                signal:
                    SignalPayload::Description {
                        session_description:
                            SessionDescription {
                                kind: DescriptionKind::Answer,
                                endpoint: answered,
                            },
                    },
                ..
            } => assert_eq!(answered, endpoint),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_key_fails_the_session() {
        let (mut handle, _out, relay_tx, _id) = test_session(Role::Receiver);
        handle.connect(peer_id()).await.unwrap();

        relay_tx
            .send(RelayEvent::Signal {
                from: "PEER42".into(),
                payload: SignalPayload::PublicKey {
                    public_key: "not a jwk".into(),
                },
            })
            .await
            .unwrap();

        wait_phase(&mut handle, TransferPhase::Failed).await;
        assert_eq!(handle.status.borrow().error, Some(ErrorKind::KeyFormat));
    }

    #[tokio::test]
    async fn relay_close_fails_a_pending_session() {
        let (mut handle, _out, relay_tx, _id) = test_session(Role::Sender);
        handle.connect(peer_id()).await.unwrap();

        relay_tx.send(RelayEvent::Closed(None)).await.unwrap();
        wait_phase(&mut handle, TransferPhase::Failed).await;
        assert_eq!(handle.status.borrow().error, Some(ErrorKind::Relay));
    }

    #[tokio::test]
    async fn duplicate_connect_fails_with_sequence_error() {
        let (mut handle, _out, _relay_tx, _id) = test_session(Role::Sender);
        handle.connect(peer_id()).await.unwrap();
        handle.connect(peer_id()).await.unwrap();

        wait_phase(&mut handle, TransferPhase::Failed).await;
        assert_eq!(handle.status.borrow().error, Some(ErrorKind::Sequence));
    }

    #[test]
    fn progress_fraction_handles_empty_total() {
        let progress = Progress {
            bytes_processed: 0,
            total_bytes: Some(0),
        };
        assert_eq!(progress.fraction(), Some(1.0));

        let unknown = Progress {
            bytes_processed: 10,
            total_bytes: None,
        };
        assert_eq!(unknown.fraction(), None);
    }
}
