//! Outbound buffer for locally authored edits.
//!
//! Edits are stamped strictly in submission order. While the sequencer is
//! unavailable the head of the queue stays put and the loop sleeps, waking
//! early when a new edit arrives or a new sequencer is installed.

use std::{collections::VecDeque, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing as log;
use tracing::Instrument;

use crate::{
    config::OutboundConfig,
    error::{MeshError, MeshResult},
    metrics::MeshMetrics,
    packet::{PacketKind, SequencedPacket, SlotId},
    sequencer::SequencerSlot,
    tracker::SequenceTracker,
    transport::{broadcast, Transport},
};

/// An edit authored on this peer, not yet stamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEdit {
    pub kind: PacketKind,
    pub object_reference: i32,
    pub body: Bytes,
}

impl LocalEdit {
    pub fn new(kind: PacketKind, object_reference: i32, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            object_reference,
            body: body.into(),
        }
    }

    pub fn creation(object_reference: i32, body: impl Into<Bytes>) -> Self {
        Self::new(PacketKind::Creation, object_reference, body)
    }

    pub fn geometry(object_reference: i32, body: impl Into<Bytes>) -> Self {
        Self::new(PacketKind::GeometryModification, object_reference, body)
    }

    pub fn attribute(object_reference: i32, body: impl Into<Bytes>) -> Self {
        Self::new(PacketKind::AttributeModification, object_reference, body)
    }

    pub fn attribute_deletion(object_reference: i32, body: impl Into<Bytes>) -> Self {
        Self::new(PacketKind::AttributeDeletion, object_reference, body)
    }

    pub fn deletion(object_reference: i32) -> Self {
        Self::new(PacketKind::Deletion, object_reference, Bytes::new())
    }
}

enum Dependency {
    OnItself,
    On(SlotId),
    Unknown,
}

struct Inner {
    queue: Mutex<VecDeque<LocalEdit>>,
    wake: Notify,
    sequencers: Arc<SequencerSlot>,
    tracker: SequenceTracker,
    transport: Arc<dyn Transport>,
    metrics: Arc<MeshMetrics>,
    config: OutboundConfig,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct OutboundBuffer {
    inner: Arc<Inner>,
}

impl OutboundBuffer {
    pub fn new(
        sequencers: Arc<SequencerSlot>,
        tracker: SequenceTracker,
        transport: Arc<dyn Transport>,
        metrics: Arc<MeshMetrics>,
        config: OutboundConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                sequencers,
                tracker,
                transport,
                metrics,
                config,
                shutdown,
                task: Mutex::new(None),
            }),
        }
    }

    /// Spawn the stamping loop. Calling it twice has no effect.
    pub fn start(&self, name: &str) {
        let mut task = self.inner.task.lock();
        if task.is_some() {
            return;
        }
        let buffer = self.clone();
        let span = log::info_span!("outbound", name = %name);
        *task = Some(tokio::spawn(async move { buffer.run().await }.instrument(span)));
    }

    pub fn submit(&self, edit: LocalEdit) -> MeshResult<()> {
        if !edit.kind.is_application() {
            return Err(MeshError::Protocol(format!(
                "{} packets cannot be submitted as edits",
                edit.kind
            )));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(MeshError::Closed);
        }
        self.inner.queue.lock().push_back(edit);
        self.inner.wake.notify_one();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }

    /// Stop the loop. A packet already stamped is still sent.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let dropped = self.len();
        if dropped > 0 {
            log::info!(dropped, "Outbound buffer closed with unstamped edits");
        }
    }

    fn front(&self) -> Option<LocalEdit> {
        self.inner.queue.lock().front().cloned()
    }

    async fn run(&self) {
        let inner = &self.inner;
        loop {
            let Some(edit) = self.front() else {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.wake.notified() => {}
                }
                continue;
            };

            let creation = match self.resolve_creation(&edit) {
                Dependency::OnItself => None,
                Dependency::On(slot) => Some(slot),
                Dependency::Unknown => {
                    inner.queue.lock().pop_front();
                    continue;
                }
            };

            let stamp = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                stamp = inner.sequencers.next_sequence() => stamp,
            };
            let Some(stamp) = stamp else {
                inner.metrics.record_sequencer_unavailable();
                log::trace!("Sequencer unavailable, holding outbound edits");
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.wake.notified() => {}
                    _ = inner.sequencers.changed() => {}
                    _ = tokio::time::sleep(inner.config.retry_wait()) => {}
                }
                continue;
            };

            let packet = SequencedPacket::new(
                edit.kind,
                stamp,
                creation.unwrap_or(stamp),
                edit.object_reference,
                edit.body,
            );
            inner.tracker.record_local(packet.clone());
            inner.queue.lock().pop_front();
            inner.metrics.record_stamped();

            let sent = broadcast(inner.transport.as_ref(), packet.raw()).await;
            log::debug!(
                kind = %packet.kind(),
                epoch = stamp.epoch,
                sequence = stamp.sequence,
                peers = sent,
                "Stamped local edit"
            );
        }
        log::debug!("Outbound loop stopped");
    }

    /// An edit of an object with no known creation is dropped.
    fn resolve_creation(&self, edit: &LocalEdit) -> Dependency {
        if edit.kind == PacketKind::Creation {
            return Dependency::OnItself;
        }
        match self.inner.tracker.creation_of(edit.object_reference) {
            Some(slot) => Dependency::On(slot),
            None => {
                log::warn!(
                    kind = %edit.kind,
                    object = edit.object_reference,
                    "Dropping edit of an object with no known creation"
                );
                Dependency::Unknown
            }
        }
    }
}
