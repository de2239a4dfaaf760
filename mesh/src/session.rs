//! Replication session: the components of one peer wired together.
//!
//! The session owns the tracker, sequencer slot, election controller and
//! outbound buffer, and routes every inbound frame to the right one. It is
//! the [`FrameHandler`] given to the transport.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing as log;

use crate::{
    config::MeshConfig,
    election::{ElectionController, ElectionPhase},
    error::{MeshError, MeshResult},
    metrics::{MeshMetrics, MetricsSnapshot},
    outbound::{LocalEdit, OutboundBuffer},
    packet::SequencedPacket,
    peers::{PeerDirectory, PeerInfo, PermissionLevel},
    sequencer::SequencerSlot,
    tracker::SequenceTracker,
    transport::{broadcast, FrameHandler, Transport},
    wire::{encode_chat, encode_copy_request, ControlMessage, InboundFrame, PermissionChange},
};

/// A chat line received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub from: String,
    pub text: String,
}

/// Receivers for everything the session surfaces to the drawing surface.
pub struct SessionOutputs {
    /// Remote application packets in delivery order.
    pub deliveries: mpsc::UnboundedReceiver<SequencedPacket>,
    pub chat: mpsc::UnboundedReceiver<ChatMessage>,
}

struct Inner {
    self_name: String,
    directory: Arc<PeerDirectory>,
    transport: Arc<dyn Transport>,
    metrics: Arc<MeshMetrics>,
    sequencers: Arc<SequencerSlot>,
    tracker: SequenceTracker,
    election: ElectionController,
    outbound: OutboundBuffer,
    chat: mpsc::UnboundedSender<ChatMessage>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct ReplicationSession {
    inner: Arc<Inner>,
}

impl ReplicationSession {
    /// Build a session for `self_name`, which must be listed in `directory`.
    /// `sequencer_listener` is where this peer serves sequence numbers while it
    /// is head.
    pub fn new(
        self_name: &str,
        directory: Arc<PeerDirectory>,
        transport: Arc<dyn Transport>,
        config: MeshConfig,
        sequencer_listener: Option<Arc<TcpListener>>,
    ) -> MeshResult<(Self, SessionOutputs)> {
        config.validate()?;
        if !directory.contains(self_name) {
            return Err(MeshError::UnknownPeer(self_name.to_string()));
        }

        let shutdown = CancellationToken::new();
        let metrics = Arc::new(MeshMetrics::new());
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let (chat_tx, chat_rx) = mpsc::unbounded_channel();

        let sequencers = Arc::new(SequencerSlot::new(
            self_name,
            sequencer_listener,
            config.clone(),
            shutdown.clone(),
        ));
        let tracker = SequenceTracker::new(
            self_name,
            transport.clone(),
            directory.clone(),
            config.recovery.clone(),
            metrics.clone(),
            delivery_tx,
            shutdown.clone(),
        );
        let election = ElectionController::new(
            self_name,
            directory.clone(),
            transport.clone(),
            sequencers.clone(),
            tracker.clone(),
            metrics.clone(),
            config.election.clone(),
            shutdown.clone(),
        );
        let outbound = OutboundBuffer::new(
            sequencers.clone(),
            tracker.clone(),
            transport.clone(),
            metrics.clone(),
            config.outbound.clone(),
            shutdown.clone(),
        );

        let session = Self {
            inner: Arc::new(Inner {
                self_name: self_name.to_string(),
                directory,
                transport,
                metrics,
                sequencers,
                tracker,
                election,
                outbound,
                chat: chat_tx,
                shutdown,
                closed: AtomicBool::new(false),
            }),
        };
        let outputs = SessionOutputs {
            deliveries: delivery_rx,
            chat: chat_rx,
        };
        Ok((session, outputs))
    }

    pub fn name(&self) -> &str {
        &self.inner.self_name
    }

    /// Start stamping and pick a sequencer from the directory head, electing
    /// one when no owner is listed.
    pub async fn start(&self) {
        log::info!(
            name = %self.inner.self_name,
            peers = self.inner.directory.len(),
            "Session starting"
        );
        self.inner.outbound.start(&self.inner.self_name);
        self.inner.election.bootstrap().await;
    }

    pub fn submit(&self, edit: LocalEdit) -> MeshResult<()> {
        self.inner.outbound.submit(edit)
    }

    /// Broadcast a chat line. Returns how many peers it reached.
    pub async fn send_chat(&self, text: &str) -> usize {
        broadcast(self.inner.transport.as_ref(), &encode_chat(text.as_bytes())).await
    }

    /// Ask `peer` to replay its full history to us.
    pub async fn request_history(&self, peer: &str) -> MeshResult<()> {
        log::info!(peer = %peer, "Requesting history");
        self.inner.transport.send(peer, encode_copy_request()).await
    }

    /// Route one inbound frame.
    pub async fn handle_frame(&self, from: &str, body: Bytes) {
        if self.is_closed() {
            return;
        }
        self.inner.metrics.record_frame_from(from);
        let frame = match InboundFrame::classify(body) {
            Ok(frame) => frame,
            Err(e) => {
                self.inner.metrics.record_malformed();
                log::warn!(peer = %from, error = %e, "Dropping unparseable frame");
                return;
            }
        };

        match frame {
            InboundFrame::Control(ControlMessage::Elect) => {
                self.inner.election.on_elect(from).await
            }
            InboundFrame::Control(ControlMessage::Answer) => self.inner.election.on_answer(from),
            InboundFrame::Control(ControlMessage::Coord { head, epoch }) => {
                self.inner.election.on_coord(&head, epoch)
            }
            InboundFrame::Control(ControlMessage::Kick { peer }) => {
                self.on_kick(from, &peer).await
            }
            InboundFrame::Chat(text) => {
                let message = ChatMessage {
                    from: from.to_string(),
                    text: String::from_utf8_lossy(&text).into_owned(),
                };
                let _ = self.inner.chat.send(message);
            }
            InboundFrame::PermissionChange(change) => {
                self.on_permission_change(from, change).await
            }
            InboundFrame::CopyRequest => self.replay_history(from).await,
            InboundFrame::Sequenced(raw) => match SequencedPacket::decode(raw) {
                Ok(packet) => {
                    self.inner.tracker.ingest(packet).await;
                }
                Err(e) => {
                    self.inner.metrics.record_malformed();
                    log::warn!(peer = %from, error = %e, "Dropping malformed packet");
                }
            },
        }
    }

    fn sent_by_head(&self, from: &str) -> bool {
        self.inner
            .directory
            .head()
            .is_some_and(|head| head.name == from)
    }

    async fn on_kick(&self, from: &str, peer: &str) {
        if !self.sent_by_head(from) {
            log::warn!(from = %from, peer = %peer, "KICK from a peer that is not head ignored");
            return;
        }
        if peer == self.inner.self_name {
            log::warn!(by = %from, "Kicked from session");
            self.close_links().await;
            self.shutdown().await;
            return;
        }
        self.drop_peer(peer).await;
    }

    async fn on_permission_change(&self, from: &str, change: PermissionChange) {
        // A handover's COORD arrives first and already promoted the new owner.
        let applied = self
            .inner
            .directory
            .get(&change.peer)
            .is_some_and(|peer| peer.level == change.level);
        if applied {
            log::trace!(peer = %change.peer, level = ?change.level, "Permission already in effect");
            return;
        }
        if !self.sent_by_head(from) {
            log::warn!(
                from = %from,
                peer = %change.peer,
                "Permission change from a peer that is not head ignored"
            );
            return;
        }
        self.apply_permission(&change.peer, change.level);
        self.inner.election.check_head().await;
    }

    fn apply_permission(&self, peer: &str, level: PermissionLevel) {
        let directory = &self.inner.directory;
        if level == PermissionLevel::Owner {
            if !directory.contains(peer) {
                directory.upsert(PeerInfo::new(peer, PermissionLevel::Editor));
            }
            directory.promote_owner(peer);
        } else if !directory.set_level(peer, level) {
            directory.upsert(PeerInfo::new(peer, level));
        }
        log::info!(peer = %peer, ?level, "Permission changed");
    }

    async fn replay_history(&self, to: &str) {
        let history = self.inner.tracker.history();
        log::info!(peer = %to, packets = history.len(), "Replaying history");
        for raw in history {
            if let Err(e) = self.inner.transport.send(to, raw).await {
                log::warn!(peer = %to, error = %e, "History replay aborted");
                return;
            }
        }
    }

    async fn drop_peer(&self, peer: &str) {
        if self.inner.directory.remove(peer).is_some() {
            log::info!(peer = %peer, "Peer removed from directory");
        }
        self.inner.transport.disconnect(peer).await;
        self.inner.election.check_head().await;
    }

    async fn close_links(&self) {
        for peer in self.inner.transport.connected_peers() {
            self.inner.transport.disconnect(&peer).await;
        }
    }

    fn ensure_head(&self) -> MeshResult<()> {
        if self.sent_by_head(&self.inner.self_name) {
            Ok(())
        } else {
            Err(MeshError::Protocol(
                "only the head can change membership".to_string(),
            ))
        }
    }

    /// Remove `peer` from the session everywhere.
    pub async fn kick(&self, peer: &str) -> MeshResult<()> {
        self.ensure_head()?;
        if peer == self.inner.self_name {
            return Err(MeshError::Protocol("the head cannot kick itself".to_string()));
        }
        let kick = ControlMessage::Kick {
            peer: peer.to_string(),
        }
        .encode();
        broadcast(self.inner.transport.as_ref(), &kick).await;
        self.drop_peer(peer).await;
        Ok(())
    }

    /// Change a peer's permission level on every peer. Granting owner to
    /// another peer hands headship to it in a new epoch.
    pub async fn set_permission(&self, peer: &str, level: PermissionLevel) -> MeshResult<()> {
        self.ensure_head()?;
        if level == PermissionLevel::Owner && peer != self.inner.self_name {
            if !self.inner.directory.contains(peer) {
                return Err(MeshError::UnknownPeer(peer.to_string()));
            }
            self.inner.election.hand_over(peer).await?;
        }
        let change = PermissionChange {
            peer: peer.to_string(),
            level,
        };
        broadcast(self.inner.transport.as_ref(), &change.encode()).await;
        self.apply_permission(peer, level);
        self.inner.election.check_head().await;
        Ok(())
    }

    /// A link to `peer` went away: forget the peer and elect if it led.
    pub async fn peer_disconnected(&self, peer: &str) {
        if self.is_closed() {
            return;
        }
        log::info!(peer = %peer, "Peer disconnected");
        self.inner.directory.remove(peer);
        self.inner.election.check_head().await;
    }

    pub fn history(&self) -> Vec<Bytes> {
        self.inner.tracker.history()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn peer_frames(&self) -> Vec<(String, u64)> {
        self.inner.metrics.peer_frames()
    }

    pub fn current_epoch(&self) -> i32 {
        self.inner.sequencers.current_epoch()
    }

    pub fn is_head(&self) -> bool {
        self.inner.sequencers.is_authoritative()
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.inner.directory
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.inner.tracker
    }

    pub fn election_phase(&self) -> ElectionPhase {
        self.inner.election.phase()
    }

    pub fn pending_edits(&self) -> usize {
        self.inner.outbound.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the session has shut down.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// Stop gap workers, election timers, the outbound loop and the active
    /// sequencer. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(name = %self.inner.self_name, "Session shutting down");
        self.inner.election.shutdown();
        self.inner.tracker.shutdown();
        self.inner.outbound.shutdown().await;
        self.inner.sequencers.set_unavailable();
        self.inner.shutdown.cancel();
    }
}

#[async_trait]
impl FrameHandler for ReplicationSession {
    async fn on_frame(&self, from: &str, body: Bytes) {
        self.handle_frame(from, body).await;
    }

    async fn on_disconnect(&self, peer: &str) {
        self.peer_disconnected(peer).await;
    }
}
