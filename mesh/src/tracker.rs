//! Reordering and delivery engine.
//!
//! Packets arrive in any order from any peer. The tracker buffers them per
//! epoch, delivers each epoch strictly in sequence order, holds back edits
//! until the creation they depend on is delivered, and launches one gap
//! recovery worker per missing slot.
//!
//! Epochs are ordered independently of each other. The only cross-epoch
//! constraint is causal: an edit whose creation lives in another epoch waits
//! for that creation, and each delivery re-examines every epoch so such waits
//! are released as soon as the dependency lands.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    config::RecoveryConfig,
    epoch::Epoch,
    metrics::MeshMetrics,
    packet::{PacketKind, SequencedPacket, SlotId},
    peers::PeerDirectory,
    recovery::GapRecoveryWorker,
    transport::{broadcast, Transport},
};

/// Result of handing one packet to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The packet and this many packets in total were delivered.
    Delivered(usize),
    Buffered,
    Duplicate,
    /// A retransmission request was answered with a rebroadcast.
    Retransmitted,
    /// Nothing to do: an unanswerable request or an impossible packet.
    Ignored,
}

#[derive(Default)]
struct TrackerState {
    epochs: BTreeMap<i32, Epoch>,
    gaps: HashMap<SlotId, CancellationToken>,
}

impl TrackerState {
    fn is_delivered(&self, slot: SlotId) -> bool {
        self.epochs
            .get(&slot.epoch)
            .is_some_and(|epoch| epoch.is_delivered(slot.sequence))
    }

    fn dependency_met(&self, packet: &SequencedPacket) -> bool {
        !packet.has_foreign_dependency() || self.is_delivered(packet.creation())
    }

    fn epoch_mut(&mut self, number: i32) -> &mut Epoch {
        self.epochs
            .entry(number)
            .or_insert_with(|| Epoch::new(number))
    }
}

pub(crate) struct TrackerInner {
    pub(crate) self_name: String,
    state: Mutex<TrackerState>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) directory: Arc<PeerDirectory>,
    pub(crate) config: RecoveryConfig,
    pub(crate) metrics: Arc<MeshMetrics>,
    deliveries: mpsc::UnboundedSender<SequencedPacket>,
    shutdown: CancellationToken,
}

/// Shared handle; clones refer to the same state.
#[derive(Clone)]
pub struct SequenceTracker {
    pub(crate) inner: Arc<TrackerInner>,
}

impl SequenceTracker {
    pub fn new(
        self_name: &str,
        transport: Arc<dyn Transport>,
        directory: Arc<PeerDirectory>,
        config: RecoveryConfig,
        metrics: Arc<MeshMetrics>,
        deliveries: mpsc::UnboundedSender<SequencedPacket>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                self_name: self_name.to_string(),
                state: Mutex::new(TrackerState::default()),
                transport,
                directory,
                config,
                metrics,
                deliveries,
                shutdown,
            }),
        }
    }

    /// Accept one inbound packet. Retransmission requests are answered by
    /// rebroadcasting the requested packet's original bytes.
    pub async fn ingest(&self, packet: SequencedPacket) -> IngestOutcome {
        if packet.kind() == PacketKind::SequenceRequest {
            return self.answer_request(packet.slot()).await;
        }
        self.accept(packet)
    }

    /// Record a packet this peer authored and has already stamped.
    pub fn record_local(&self, packet: SequencedPacket) -> IngestOutcome {
        self.accept(packet.into_local())
    }

    fn accept(&self, packet: SequencedPacket) -> IngestOutcome {
        let kind = packet.kind();
        let slot = packet.slot();
        if !kind.is_sequenced() {
            debug!(%kind, %slot, "Dropping unsequenced packet kind");
            return IngestOutcome::Ignored;
        }
        if slot.sequence < 0 || slot.epoch < 0 {
            warn!(%kind, %slot, "Dropping packet with negative slot");
            return IngestOutcome::Ignored;
        }
        if packet.has_foreign_dependency() && packet.creation() >= slot {
            warn!(
                %kind,
                %slot,
                creation = %packet.creation(),
                "Dropping packet depending on a later slot"
            );
            return IngestOutcome::Ignored;
        }
        let dependency = packet.has_foreign_dependency().then(|| packet.creation());

        let mut state = self.inner.state.lock();
        if !state.epoch_mut(slot.epoch).insert_pending(packet) {
            trace!(%slot, "Duplicate packet");
            self.inner.metrics.record_duplicate();
            return IngestOutcome::Duplicate;
        }
        self.cancel_gap(&mut state, slot);

        let delivered = self.drain(&mut state);
        if state.is_delivered(slot) {
            self.seek_missing(&mut state, None);
            IngestOutcome::Delivered(delivered)
        } else {
            trace!(%slot, "Packet buffered");
            self.inner.metrics.record_buffered();
            self.seek_missing(&mut state, dependency);
            IngestOutcome::Buffered
        }
    }

    /// Deliver everything that has become deliverable, across all epochs,
    /// until a full pass makes no progress.
    fn drain(&self, state: &mut TrackerState) -> usize {
        let mut total = 0;
        loop {
            let mut progressed = false;
            let numbers: Vec<i32> = state.epochs.keys().copied().collect();
            for number in numbers {
                loop {
                    let ready = state
                        .epochs
                        .get(&number)
                        .and_then(Epoch::next_pending)
                        .is_some_and(|packet| state.dependency_met(packet));
                    if !ready {
                        break;
                    }
                    let Some(packet) = state.epoch_mut(number).deliver_next().cloned() else {
                        break;
                    };
                    self.on_delivered(state, packet);
                    progressed = true;
                    total += 1;
                }
            }
            if !progressed {
                return total;
            }
        }
    }

    fn on_delivered(&self, state: &mut TrackerState, packet: SequencedPacket) {
        self.cancel_gap(state, packet.slot());
        self.inner.metrics.record_delivered();
        debug!(
            kind = %packet.kind(),
            epoch = packet.epoch(),
            sequence = packet.sequence(),
            local = packet.originated_locally(),
            "Delivered packet"
        );
        if packet.kind().is_application() && !packet.originated_locally() {
            // A closed receiver only means nobody is watching any more.
            let _ = self.inner.deliveries.send(packet);
        }
    }

    fn cancel_gap(&self, state: &mut TrackerState, slot: SlotId) {
        if let Some(token) = state.gaps.remove(&slot) {
            token.cancel();
            self.inner.metrics.record_gap_worker_cancelled();
            trace!(%slot, "Gap recovery cancelled");
        }
    }

    /// Start recovery for whatever blocks each epoch's next delivery, plus the
    /// missing creation of a packet that was just buffered.
    fn seek_missing(&self, state: &mut TrackerState, dependency: Option<SlotId>) {
        let mut wanted: Vec<(i32, i32, i32)> = Vec::new();
        for (number, epoch) in &state.epochs {
            let Some(first) = epoch.first_pending() else {
                continue;
            };
            let next = epoch.next_expected();
            if first > next {
                wanted.push((*number, next, first - 1));
            } else if let Some(creation) = epoch
                .next_pending()
                .filter(|packet| !state.dependency_met(packet))
                .map(SequencedPacket::creation)
            {
                wanted.push(Self::dependency_range(state, creation));
            }
        }
        if let Some(creation) = dependency.filter(|slot| !state.is_delivered(*slot)) {
            wanted.push(Self::dependency_range(state, creation));
        }
        for (epoch, from, to) in wanted {
            self.seek_range(state, epoch, from, to);
        }
    }

    /// Everything from the creation epoch's next expected sequence up to and
    /// including the creation itself.
    fn dependency_range(state: &TrackerState, creation: SlotId) -> (i32, i32, i32) {
        let from = state
            .epochs
            .get(&creation.epoch)
            .map_or(0, Epoch::next_expected);
        (creation.epoch, from, creation.sequence)
    }

    fn seek_range(&self, state: &mut TrackerState, epoch: i32, from: i32, to: i32) {
        for sequence in from..=to {
            if state.gaps.len() >= self.inner.config.max_outstanding {
                debug!(epoch, sequence, "Gap recovery limit reached, deferring");
                return;
            }
            let slot = SlotId::new(epoch, sequence);
            let held = state
                .epochs
                .get(&epoch)
                .is_some_and(|e| e.holds(sequence));
            if held || state.gaps.contains_key(&slot) {
                continue;
            }
            let token = self.inner.shutdown.child_token();
            state.gaps.insert(slot, token.clone());
            self.inner.metrics.record_gap_worker_started();
            GapRecoveryWorker::new(slot, token, self.clone()).spawn();
        }
    }

    /// Called by a worker that exhausted its attempts. Inserts a tombstone
    /// unless the worker was cancelled first.
    pub(crate) fn give_up(&self, slot: SlotId, token: &CancellationToken) {
        let mut state = self.inner.state.lock();
        if token.is_cancelled() {
            return;
        }
        state.gaps.remove(&slot);
        if !state.epoch_mut(slot.epoch).insert_pending(SequencedPacket::tombstone(slot)) {
            return;
        }
        warn!(%slot, "Slot unrecoverable, recorded as tombstone");
        self.inner.metrics.record_tombstone();
        self.drain(&mut state);
        self.seek_missing(&mut state, None);
    }

    async fn answer_request(&self, slot: SlotId) -> IngestOutcome {
        let raw: Option<Bytes> = {
            let state = self.inner.state.lock();
            state
                .epochs
                .get(&slot.epoch)
                .and_then(|epoch| epoch.get(slot.sequence))
                .filter(|packet| packet.kind() != PacketKind::Tombstone)
                .map(|packet| packet.raw().clone())
        };
        let Some(raw) = raw else {
            trace!(%slot, "Retransmission request for unknown slot");
            return IngestOutcome::Ignored;
        };
        let sent = broadcast(self.inner.transport.as_ref(), &raw).await;
        debug!(%slot, peers = sent, "Answered retransmission request");
        self.inner.metrics.record_retransmit_reply();
        IngestOutcome::Retransmitted
    }

    /// Raw bytes of every held packet: epochs ascending, delivered before
    /// pending within each epoch.
    pub fn history(&self) -> Vec<Bytes> {
        let state = self.inner.state.lock();
        state
            .epochs
            .values()
            .flat_map(Epoch::history)
            .map(|packet| packet.raw().clone())
            .collect()
    }

    /// Slot of the most recent creation packet for `object_reference`.
    pub fn creation_of(&self, object_reference: i32) -> Option<SlotId> {
        let state = self.inner.state.lock();
        state
            .epochs
            .values()
            .rev()
            .flat_map(|epoch| epoch.history().collect::<Vec<_>>().into_iter().rev())
            .find(|packet| {
                packet.kind() == PacketKind::Creation
                    && packet.object_reference() == object_reference
            })
            .map(SequencedPacket::slot)
    }

    pub fn max_epoch(&self) -> Option<i32> {
        self.inner.state.lock().epochs.keys().next_back().copied()
    }

    /// Delivered sequence numbers of one epoch, in delivery order.
    pub fn delivered_sequences(&self, epoch: i32) -> Vec<i32> {
        let state = self.inner.state.lock();
        state
            .epochs
            .get(&epoch)
            .map(|e| e.delivered().iter().map(SequencedPacket::sequence).collect())
            .unwrap_or_default()
    }

    /// Kind of the delivered packet at `slot`.
    pub fn delivered_kind(&self, slot: SlotId) -> Option<PacketKind> {
        let state = self.inner.state.lock();
        state
            .epochs
            .get(&slot.epoch)
            .filter(|e| e.is_delivered(slot.sequence))
            .and_then(|e| e.get(slot.sequence))
            .map(SequencedPacket::kind)
    }

    pub fn pending_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.epochs.values().map(Epoch::pending_len).sum()
    }

    pub fn active_gaps(&self) -> Vec<SlotId> {
        let mut gaps: Vec<SlotId> = self.inner.state.lock().gaps.keys().copied().collect();
        gaps.sort();
        gaps
    }

    /// Cancel every outstanding gap worker.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        for (_, token) in state.gaps.drain() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        peers::{PeerInfo, PermissionLevel},
        test_utils::{creation, edit, init_test_logging, MockTransport},
    };

    struct Harness {
        tracker: SequenceTracker,
        transport: Arc<MockTransport>,
        deliveries: mpsc::UnboundedReceiver<SequencedPacket>,
        metrics: Arc<MeshMetrics>,
    }

    fn harness(peers: &[&str]) -> Harness {
        init_test_logging();
        let transport = MockTransport::new("me");
        for peer in peers {
            transport.connect(peer);
        }
        let directory = Arc::new(PeerDirectory::new(
            std::iter::once("me")
                .chain(peers.iter().copied())
                .map(|name| PeerInfo::new(name, PermissionLevel::Editor)),
        ));
        let metrics = Arc::new(MeshMetrics::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = SequenceTracker::new(
            "me",
            transport.clone(),
            directory,
            RecoveryConfig::default(),
            metrics.clone(),
            tx,
            CancellationToken::new(),
        );
        Harness {
            tracker,
            transport,
            deliveries: rx,
            metrics,
        }
    }

    fn drain_deliveries(rx: &mut mpsc::UnboundedReceiver<SequencedPacket>) -> Vec<SlotId> {
        let mut slots = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            slots.push(packet.slot());
        }
        slots
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_order_delivery() {
        let mut h = harness(&[]);
        assert_eq!(
            h.tracker.ingest(creation(0, 0, 10)).await,
            IngestOutcome::Delivered(1)
        );
        assert_eq!(
            h.tracker.ingest(edit(0, 1, (0, 0), 10)).await,
            IngestOutcome::Delivered(1)
        );
        assert_eq!(
            drain_deliveries(&mut h.deliveries),
            vec![SlotId::new(0, 0), SlotId::new(0, 1)]
        );
        assert!(h.tracker.active_gaps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_delivered_once() {
        let mut h = harness(&[]);
        h.tracker.ingest(creation(0, 0, 1)).await;
        assert_eq!(
            h.tracker.ingest(creation(0, 0, 1)).await,
            IngestOutcome::Duplicate
        );
        h.tracker.ingest(creation(0, 2, 3)).await;
        assert_eq!(
            h.tracker.ingest(creation(0, 2, 3)).await,
            IngestOutcome::Duplicate
        );
        assert_eq!(drain_deliveries(&mut h.deliveries).len(), 1);
        assert_eq!(h.metrics.snapshot().duplicates, 2);
        h.tracker.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_packet_not_zero_starts_recovery_from_zero() {
        let h = harness(&["peer"]);
        assert_eq!(
            h.tracker.ingest(creation(0, 3, 1)).await,
            IngestOutcome::Buffered
        );
        assert_eq!(
            h.tracker.active_gaps(),
            vec![SlotId::new(0, 0), SlotId::new(0, 1), SlotId::new(0, 2)]
        );
        h.tracker.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_waits_for_creation() {
        let mut h = harness(&["peer"]);
        h.tracker.ingest(creation(0, 0, 1)).await;
        // Edit of an object created at 0:1, which has not arrived yet.
        assert_eq!(
            h.tracker.ingest(edit(0, 2, (0, 1), 2)).await,
            IngestOutcome::Buffered
        );
        assert_eq!(h.tracker.active_gaps(), vec![SlotId::new(0, 1)]);

        assert_eq!(
            h.tracker.ingest(creation(0, 1, 2)).await,
            IngestOutcome::Delivered(2)
        );
        assert_eq!(
            drain_deliveries(&mut h.deliveries),
            vec![SlotId::new(0, 0), SlotId::new(0, 1), SlotId::new(0, 2)]
        );
        assert!(h.tracker.active_gaps().is_empty());
        assert_eq!(h.metrics.snapshot().gap_workers_cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cross_epoch_dependency_released_on_delivery() {
        let mut h = harness(&["peer"]);
        // Epoch 1 edit depends on a creation in epoch 0.
        assert_eq!(
            h.tracker.ingest(edit(1, 0, (0, 0), 5)).await,
            IngestOutcome::Buffered
        );
        assert_eq!(h.tracker.active_gaps(), vec![SlotId::new(0, 0)]);

        assert_eq!(
            h.tracker.ingest(creation(0, 0, 5)).await,
            IngestOutcome::Delivered(2)
        );
        assert_eq!(
            drain_deliveries(&mut h.deliveries),
            vec![SlotId::new(0, 0), SlotId::new(1, 0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_impossible_dependency_ignored() {
        let h = harness(&[]);
        assert_eq!(
            h.tracker.ingest(edit(0, 1, (0, 4), 5)).await,
            IngestOutcome::Ignored
        );
        assert_eq!(h.tracker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_packets_recorded_but_not_surfaced() {
        let mut h = harness(&[]);
        assert_eq!(
            h.tracker.record_local(creation(0, 0, 9)),
            IngestOutcome::Delivered(1)
        );
        assert!(drain_deliveries(&mut h.deliveries).is_empty());
        assert_eq!(h.tracker.history().len(), 1);
        assert_eq!(h.tracker.creation_of(9), Some(SlotId::new(0, 0)));
        assert_eq!(h.tracker.creation_of(10), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmission_reply_for_known_slot_only() {
        let h = harness(&["peer"]);
        let original = creation(0, 0, 1);
        h.tracker.ingest(original.clone()).await;

        let request = SequencedPacket::sequence_request(SlotId::new(0, 0));
        assert_eq!(
            h.tracker.ingest(request).await,
            IngestOutcome::Retransmitted
        );
        assert_eq!(
            h.transport.sent_to("peer"),
            vec![original.raw().clone()]
        );

        let unknown = SequencedPacket::sequence_request(SlotId::new(0, 7));
        assert_eq!(h.tracker.ingest(unknown).await, IngestOutcome::Ignored);
        let other_epoch = SequencedPacket::sequence_request(SlotId::new(3, 0));
        assert_eq!(h.tracker.ingest(other_epoch).await, IngestOutcome::Ignored);
        assert_eq!(h.transport.sent_to("peer").len(), 1);
        assert_eq!(h.tracker.max_epoch(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_orders_epochs_then_delivered_then_pending() {
        let h = harness(&["peer"]);
        let first = creation(0, 0, 1);
        let second = edit(0, 1, (0, 0), 1);
        let stranded = creation(0, 3, 3);
        let next_epoch = creation(1, 0, 4);
        for packet in [&next_epoch, &stranded, &first, &second] {
            h.tracker.ingest(packet.clone()).await;
        }
        assert_eq!(h.tracker.delivered_sequences(0), vec![0, 1]);
        assert_eq!(h.tracker.delivered_sequences(1), vec![0]);
        assert_eq!(h.tracker.pending_count(), 1);

        assert_eq!(
            h.tracker.history(),
            vec![
                first.raw().clone(),
                second.raw().clone(),
                stranded.raw().clone(),
                next_epoch.raw().clone(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_closed_by_late_arrival() {
        let mut h = harness(&["peer"]);
        for seq in [0, 1, 3, 4] {
            h.tracker.ingest(creation(0, seq, seq)).await;
        }
        assert_eq!(
            drain_deliveries(&mut h.deliveries),
            vec![SlotId::new(0, 0), SlotId::new(0, 1)]
        );
        assert_eq!(h.tracker.active_gaps(), vec![SlotId::new(0, 2)]);

        assert_eq!(
            h.tracker.ingest(creation(0, 2, 2)).await,
            IngestOutcome::Delivered(3)
        );
        assert_eq!(h.tracker.delivered_sequences(0), vec![0, 1, 2, 3, 4]);
        assert!(h.tracker.active_gaps().is_empty());

        // The cancelled worker must not tombstone anything later.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.metrics.snapshot().tombstones, 0);
        assert!(h.transport.sent_to("peer").is_empty());
    }
}
