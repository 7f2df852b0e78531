//! Session controller.
//!
//! Owns the session table and the swarm membership. Each connection runs on
//! its own task that exclusively owns that peer's ratchet and frame reader,
//! so encrypt and decrypt stay strictly serial per session; the controller
//! is the only writer to the table itself.
//!
//! Lifecycle: `start` derives the room keys and joins the swarm, `send`
//! fans out to every verified peer, `cleanup` tears everything down and
//! wipes key material. Losing the last peer schedules a single reconnect;
//! a join that never produces a verified peer flips the transport mode and
//! tries again.

use crate::config::ControllerConfig;
use crate::crypto::{random_bytes, RoomKeys};
use crate::error::{Error, Result};
use crate::protocol::{
    encode, jittered_now, now_ms, parse_frame, ControlFrame, Envelope, InboundFrame, MessageBody,
};
use crate::session::peer::PeerSession;
use crate::session::transfer::{FileMetadata, FileTransferManager, TransferEvent, TransferId};
use crate::swarm::{PeerId, Swarm, SwarmConn, SwarmKey, TransportMode};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Identifier attached to an outbound message for delivery tracking.
pub type MessageId = [u8; 16];

/// Coarse connection state reported upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Joined the swarm, no verified peer yet.
    Connecting,
    /// At least one peer passed verification.
    Connected,
    /// No peers remain.
    Disconnected,
}

/// Events the controller reports upward.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A decrypted application message.
    Message {
        /// Which peer sent it.
        peer: PeerId,
        /// Message text.
        content: String,
        /// Sender timestamp (already jittered).
        timestamp: i64,
    },
    /// Connection state change.
    ConnectionStatus(ConnectionStatus),
    /// A non-fatal fault the host may want to surface.
    BackendError {
        /// Stable error kind tag.
        kind: &'static str,
        /// Human-readable context, free of key material.
        message: String,
    },
    /// Outcome of one peer's copy of an outbound message.
    PeerDelivery {
        /// The message in question.
        message_id: MessageId,
        /// Which peer.
        peer: PeerId,
        /// Whether the write went through.
        success: bool,
    },
    /// File-transfer progress.
    Transfer(TransferEvent),
}

#[derive(Debug, Clone)]
struct Outbound {
    body: MessageBody,
    message_id: Option<MessageId>,
}

struct PeerHandle {
    outbound: mpsc::Sender<Outbound>,
    verified: Arc<AtomicBool>,
}

struct Shared {
    config: ControllerConfig,
    room: RoomKeys,
    swarm: Arc<dyn Swarm>,
    peers: RwLock<HashMap<PeerId, PeerHandle>>,
    event_tx: broadcast::Sender<ChatEvent>,
    running: AtomicBool,
    mode: RwLock<TransportMode>,
    transfers: FileTransferManager,
    body_tx: mpsc::Sender<MessageBody>,
    reconnect_armed: AtomicBool,
}

impl Shared {
    fn emit(&self, event: ChatEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn verified_count(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|h| h.verified.load(Ordering::Relaxed))
            .count()
    }
}

/// The process-scoped owner of all sessions for one room.
pub struct SessionController {
    shared: Arc<Shared>,
    body_rx: Mutex<Option<mpsc::Receiver<MessageBody>>>,
    transfer_rx: Mutex<Option<mpsc::Receiver<TransferEvent>>>,
}

impl SessionController {
    /// Build a controller for `config` on top of `swarm`.
    pub fn new(config: ControllerConfig, swarm: Arc<dyn Swarm>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (body_tx, body_rx) = mpsc::channel(32);
        let (transfer_tx, transfer_rx) = mpsc::channel(64);

        let room = RoomKeys::derive(&config.room, &config.identity.bundle(), &config.peer_bundle);
        let transfers = FileTransferManager::new(
            transfer_tx,
            config.transfer_ack_timeout,
            config.download_dir.clone(),
        );
        let mode = config.mode;

        Self {
            shared: Arc::new(Shared {
                config,
                room,
                swarm,
                peers: RwLock::new(HashMap::new()),
                event_tx,
                running: AtomicBool::new(false),
                mode: RwLock::new(mode),
                transfers,
                body_tx,
                reconnect_armed: AtomicBool::new(false),
            }),
            body_rx: Mutex::new(Some(body_rx)),
            transfer_rx: Mutex::new(Some(transfer_rx)),
        }
    }

    /// Subscribe to upward events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Join the room and start accepting peers.
    pub async fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Usage("controller already running".into()));
        }

        info!(room = ?self.shared.config.room, "starting session controller");
        self.shared
            .emit(ChatEvent::ConnectionStatus(ConnectionStatus::Connecting));

        join_swarm(self.shared.clone()).await?;

        // Pump transfer events upward.
        if let Some(mut transfer_rx) = self.transfer_rx.lock().await.take() {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                while let Some(event) = transfer_rx.recv().await {
                    shared.emit(ChatEvent::Transfer(event));
                }
            });
        }

        // Pump file chunk bodies into the fan-out path.
        if let Some(mut body_rx) = self.body_rx.lock().await.take() {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                while let Some(body) = body_rx.recv().await {
                    fan_out(&shared, body, None).await;
                }
            });
        }

        // If nobody verifies in time, flip the transport mode and retry.
        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(shared.config.connect_timeout).await;
            if !shared.running.load(Ordering::SeqCst) || shared.verified_count().await > 0 {
                return;
            }
            let flipped = {
                let mut mode = shared.mode.write().await;
                *mode = mode.flipped();
                *mode
            };
            warn!(?flipped, "no verified peer before timeout, flipping transport");
            let _ = shared.swarm.leave().await;
            if let Err(e) = join_swarm(shared.clone()).await {
                shared.emit(ChatEvent::BackendError {
                    kind: e.kind(),
                    message: "rejoin after transport flip failed".into(),
                });
            }
        });

        Ok(())
    }

    /// Encrypt and send a text message to every verified peer.
    ///
    /// Fan-out is best effort: a failing peer is evicted by its own task
    /// and does not stall the others.
    pub async fn send(&self, content: &str) -> Result<MessageId> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(Error::Usage("controller not started".into()));
        }
        if self.shared.verified_count().await == 0 {
            return Err(Error::Usage("no verified peers".into()));
        }

        let message_id: MessageId = random_bytes();
        fan_out(
            &self.shared,
            MessageBody::Text(content.to_string()),
            Some(message_id),
        )
        .await;
        Ok(message_id)
    }

    /// Start a file upload to the room.
    pub async fn send_file(&self, path: PathBuf) -> Result<FileMetadata> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(Error::Usage("controller not started".into()));
        }
        if self.shared.verified_count().await == 0 {
            return Err(Error::Usage("no verified peers".into()));
        }
        self.shared
            .transfers
            .upload(path, self.shared.body_tx.clone())
            .await
    }

    /// Cancel a transfer.
    pub async fn cancel_transfer(&self, id: &TransferId) -> Result<()> {
        self.shared.transfers.cancel(id).await
    }

    /// Resume a failed upload.
    pub async fn resume_transfer(&self, id: &TransferId) -> Result<()> {
        self.shared.transfers.resume(id).await
    }

    /// Select the transport mode used by the next join.
    pub async fn set_transport(&self, mode: TransportMode) -> Result<()> {
        *self.shared.mode.write().await = mode;
        Ok(())
    }

    /// Stop timers, close sockets, leave the swarm, and wipe key material.
    pub async fn cleanup(&self) -> Result<()> {
        cleanup_shared(&self.shared).await;
        Ok(())
    }
}

async fn cleanup_shared(shared: &Arc<Shared>) {
    if !shared.running.swap(false, Ordering::SeqCst) {
        return;
    }
    info!("session controller shutting down");
    let _ = shared.swarm.leave().await;
    // Dropping the handles closes each peer task's outbound channel; the
    // tasks exit and wipe their ratchets on the way out.
    shared.peers.write().await.clear();
    shared.emit(ChatEvent::ConnectionStatus(ConnectionStatus::Disconnected));
}

/// Join under the room's swarm key and pump the resulting connections.
async fn join_swarm(shared: Arc<Shared>) -> Result<()> {
    let key = SwarmKey(shared.room.swarm_key);
    let mode = *shared.mode.read().await;
    let mut conn_rx = shared.swarm.join(&key, mode).await?;

    tokio::spawn(async move {
        while let Some(conn) = conn_rx.recv().await {
            if !shared.running.load(Ordering::SeqCst) {
                break;
            }
            let shared = shared.clone();
            tokio::spawn(async move {
                run_peer(shared, conn).await;
            });
        }
    });
    Ok(())
}

/// Queue a body for every verified peer. Returns how many were reached.
async fn fan_out(shared: &Arc<Shared>, body: MessageBody, message_id: Option<MessageId>) -> usize {
    let peers = shared.peers.read().await;
    let mut reached = 0;
    for (id, handle) in peers.iter() {
        if !handle.verified.load(Ordering::Relaxed) {
            continue;
        }
        let outbound = Outbound {
            body: body.clone(),
            message_id,
        };
        match handle.outbound.try_send(outbound) {
            Ok(()) => reached += 1,
            Err(_) => {
                // Full or closed; its task will evict itself if dead.
                if let Some(message_id) = message_id {
                    shared.emit(ChatEvent::PeerDelivery {
                        message_id,
                        peer: id.clone(),
                        success: false,
                    });
                }
            }
        }
    }
    reached
}

/// Arm the single reconnect after the last peer is lost.
fn schedule_reconnect(shared: &Arc<Shared>) {
    if shared.reconnect_armed.swap(true, Ordering::SeqCst) {
        return;
    }
    let shared = shared.clone();
    tokio::spawn(async move {
        tokio::time::sleep(shared.config.reconnect_delay).await;
        shared.reconnect_armed.store(false, Ordering::SeqCst);
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }
        info!("reconnecting to swarm");
        let _ = shared.swarm.leave().await;
        if let Err(e) = join_swarm(shared.clone()).await {
            shared.emit(ChatEvent::BackendError {
                kind: e.kind(),
                message: "reconnect failed".into(),
            });
        }
    });
}

/// Everything that happens on one peer's connection.
async fn run_peer(shared: Arc<Shared>, conn: SwarmConn) {
    let peer_id = conn.peer.clone();
    debug!(peer = %peer_id, "peer connected");

    let mut session = match PeerSession::new(peer_id.clone(), &shared.config) {
        Ok(session) => session,
        Err(e) => {
            shared.emit(ChatEvent::BackendError {
                kind: e.kind(),
                message: "session setup failed".into(),
            });
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(32);
    let verified_flag = Arc::new(AtomicBool::new(false));
    shared.peers.write().await.insert(
        peer_id.clone(),
        PeerHandle {
            outbound: outbound_tx,
            verified: verified_flag.clone(),
        },
    );

    let (mut read_half, mut write_half) = tokio::io::split(conn.stream);

    // Open the gate: challenge first, everything else waits.
    if write_control(&mut write_half, &session.verifier.initial_challenge())
        .await
        .is_err()
    {
        finish_peer(&shared, &peer_id, &mut session).await;
        return;
    }

    let mut keepalive = tokio::time::interval(shared.config.keepalive_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let verify_deadline = session.verifier.deadline();
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(verify_deadline), if !session.is_verified() => {
                let err = session.verifier.expire();
                shared.emit(ChatEvent::BackendError {
                    kind: err.kind(),
                    message: format!("peer {peer_id} failed verification in time"),
                });
                break;
            }

            _ = keepalive.tick(), if session.is_verified() => {
                match session.ratchet.encrypt_keepalive(jittered_now()) {
                    Ok(envelope) => {
                        if write_envelope(&mut write_half, &envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if handle_fault(&shared, &mut session, e).await {
                            break;
                        }
                    }
                }
            }

            maybe_out = outbound_rx.recv() => {
                let Some(out) = maybe_out else { break };
                if !session.is_verified() {
                    continue;
                }
                let result = match session.ratchet.encrypt(out.body, jittered_now()) {
                    Ok(envelope) => write_envelope(&mut write_half, &envelope).await,
                    Err(e) => Err(e),
                };
                let success = result.is_ok();
                if let Some(message_id) = out.message_id {
                    shared.emit(ChatEvent::PeerDelivery {
                        message_id,
                        peer: peer_id.clone(),
                        success,
                    });
                }
                if let Err(e) = result {
                    if handle_fault(&shared, &mut session, e).await {
                        break;
                    }
                    break; // write failed: evict this peer only
                }
            }

            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!(peer = %peer_id, "peer closed connection");
                        break;
                    }
                    Ok(n) => {
                        session.reader.push(&buf[..n]);
                        if !drain_frames(&shared, &mut session, &mut write_half, &verified_flag).await {
                            break;
                        }
                    }
                    Err(e) => {
                        shared.emit(ChatEvent::BackendError {
                            kind: "transport",
                            message: e.to_string(),
                        });
                        break;
                    }
                }
            }
        }
    }

    finish_peer(&shared, &peer_id, &mut session).await;
}

/// Wipe, deregister, and drive the disconnect/reconnect policy.
async fn finish_peer(shared: &Arc<Shared>, peer_id: &PeerId, session: &mut PeerSession) {
    session.destroy();
    let now_empty = {
        let mut peers = shared.peers.write().await;
        peers.remove(peer_id);
        peers.is_empty()
    };
    debug!(peer = %peer_id, "peer session destroyed");

    if now_empty && shared.running.load(Ordering::SeqCst) {
        shared.emit(ChatEvent::ConnectionStatus(ConnectionStatus::Disconnected));
        schedule_reconnect(shared);
    }
}

/// Process every complete frame in the reader. Returns false to drop the
/// connection.
async fn drain_frames<W: AsyncWrite + Unpin>(
    shared: &Arc<Shared>,
    session: &mut PeerSession,
    write: &mut W,
    verified_flag: &Arc<AtomicBool>,
) -> bool {
    loop {
        let payload = match session.reader.try_next() {
            Ok(Some(payload)) => payload,
            Ok(None) => return true,
            Err(e) => {
                shared.emit(ChatEvent::BackendError {
                    kind: e.kind(),
                    message: "malformed frame, dropping connection".into(),
                });
                return false;
            }
        };
        session.touch();

        let frame = match parse_frame(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                shared.emit(ChatEvent::BackendError {
                    kind: e.kind(),
                    message: "undecodable payload discarded".into(),
                });
                continue;
            }
        };

        if !session.is_verified() {
            // Only the verification exchange may pass the gate.
            let InboundFrame::Control(control) = frame else {
                debug!("dropping pre-verification envelope");
                continue;
            };
            match session.verifier.handle(&shared.room.psk, &control) {
                Ok(replies) => {
                    for reply in &replies {
                        if write_control(write, reply).await.is_err() {
                            return false;
                        }
                    }
                    if session.is_verified() {
                        verified_flag.store(true, Ordering::SeqCst);
                        info!(peer = %session.id, "peer verified");
                        shared.emit(ChatEvent::ConnectionStatus(ConnectionStatus::Connected));
                    }
                }
                Err(e) => {
                    shared.emit(ChatEvent::BackendError {
                        kind: e.kind(),
                        message: format!("peer {} failed verification", session.id),
                    });
                    return false;
                }
            }
            continue;
        }

        // Verified: everything must arrive sealed.
        let InboundFrame::Envelope(envelope) = frame else {
            debug!("dropping plaintext control frame on verified session");
            continue;
        };

        match session.ratchet.decrypt(&envelope) {
            Ok(message) => {
                if !dispatch_body(shared, session, write, message.content, message.timestamp).await
                {
                    return false;
                }
            }
            Err(Error::Replay) => {
                shared.emit(ChatEvent::BackendError {
                    kind: "replay",
                    message: format!("replayed envelope from {} discarded", session.id),
                });
            }
            Err(e @ Error::Auth(_)) => {
                shared.emit(ChatEvent::BackendError {
                    kind: e.kind(),
                    message: format!("unauthentic envelope from {} discarded", session.id),
                });
                if session.note_auth_failure() {
                    warn!(peer = %session.id, "too many auth failures, dropping peer");
                    return false;
                }
            }
            Err(e) => {
                if handle_fault(shared, session, e).await {
                    return false;
                }
            }
        }
    }
}

/// Route one decrypted body. Returns false to drop the connection.
async fn dispatch_body<W: AsyncWrite + Unpin>(
    shared: &Arc<Shared>,
    session: &mut PeerSession,
    write: &mut W,
    body: MessageBody,
    timestamp: i64,
) -> bool {
    match body {
        MessageBody::Text(content) => {
            shared.emit(ChatEvent::Message {
                peer: session.id.clone(),
                content,
                timestamp,
            });
            true
        }
        MessageBody::Control(ControlFrame::Keepalive { .. }) => {
            match session.ratchet.encrypt_keepalive_ack(now_ms()) {
                Ok(envelope) => write_envelope(write, &envelope).await.is_ok(),
                Err(e) => !handle_fault(shared, session, e).await,
            }
        }
        MessageBody::Control(ControlFrame::KeepaliveAck { .. }) => true,
        MessageBody::Control(_) => {
            // Verification chatter after the gate opened; ignore.
            true
        }
        MessageBody::FileChunk(chunk) => {
            match shared.transfers.handle_chunk(chunk).await {
                Ok(Some(ack)) => {
                    let body = MessageBody::FileAck(ack);
                    match session.ratchet.encrypt(body, jittered_now()) {
                        Ok(envelope) => write_envelope(write, &envelope).await.is_ok(),
                        Err(e) => !handle_fault(shared, session, e).await,
                    }
                }
                Ok(None) => true,
                Err(e) => {
                    shared.emit(ChatEvent::BackendError {
                        kind: e.kind(),
                        message: "bad file chunk discarded".into(),
                    });
                    true
                }
            }
        }
        MessageBody::FileAck(ack) => {
            if let Err(e) = shared.transfers.handle_ack(ack).await {
                shared.emit(ChatEvent::BackendError {
                    kind: e.kind(),
                    message: "file receipt failed".into(),
                });
            }
            true
        }
    }
}

/// Report a fault; a fatal one tears the whole controller down.
/// Returns true when the peer task must stop.
async fn handle_fault(shared: &Arc<Shared>, session: &mut PeerSession, e: Error) -> bool {
    shared.emit(ChatEvent::BackendError {
        kind: e.kind(),
        message: format!("fault on session with {}", session.id),
    });
    if e.is_fatal() {
        cleanup_shared(shared).await;
        return true;
    }
    false
}

async fn write_frame<W: AsyncWrite + Unpin>(write: &mut W, payload: &[u8]) -> Result<()> {
    let frame = encode(payload)?;
    write.write_all(&frame).await?;
    Ok(())
}

async fn write_control<W: AsyncWrite + Unpin>(write: &mut W, frame: &ControlFrame) -> Result<()> {
    let payload = serde_json::to_vec(frame)?;
    write_frame(write, &payload).await
}

async fn write_envelope<W: AsyncWrite + Unpin>(write: &mut W, envelope: &Envelope) -> Result<()> {
    write_frame(write, &envelope.to_bytes()?).await
}
