//! Bully-style head election.
//!
//! The head is the first peer in the directory and must hold owner rank. When
//! it is lost, or an ELECT arrives, a peer sends ELECT to everyone ranked
//! above it and waits. An ANSWER means a higher peer will coordinate; silence
//! until the timer fires means this peer declares itself head of a new epoch
//! and broadcasts COORD.
//!
//! All state transitions happen under one mutex, and every timer carries the
//! generation it was armed in, so a timer that fires after an ANSWER or COORD
//! was processed finds a newer generation and does nothing.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing as log;
use tracing::Instrument;

use crate::{
    config::ElectionConfig,
    error::{MeshError, MeshResult},
    metrics::MeshMetrics,
    peers::{PeerDirectory, PeerInfo, PermissionLevel},
    sequencer::{SequencerSlot, UNAVAILABLE},
    tracker::SequenceTracker,
    transport::{broadcast, Transport},
    wire::ControlMessage,
};

#[derive(Debug)]
enum ElectionState {
    Idle,
    /// ELECT sent to higher-ranked peers; the timer declares this peer head.
    Electing {
        timer: CancellationToken,
        generation: u64,
    },
    /// A higher peer answered; the timer restarts the election if no COORD
    /// follows.
    AwaitingCoordinator {
        timer: CancellationToken,
        generation: u64,
    },
    Resolved {
        head: String,
        epoch: i32,
    },
}

impl ElectionState {
    fn cancel_timer(&self) {
        match self {
            ElectionState::Electing { timer, .. }
            | ElectionState::AwaitingCoordinator { timer, .. } => timer.cancel(),
            ElectionState::Idle | ElectionState::Resolved { .. } => {}
        }
    }
}

/// Externally visible election state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionPhase {
    Idle,
    Electing,
    AwaitingCoordinator,
    Resolved { head: String, epoch: i32 },
}

struct Inner {
    self_name: String,
    directory: Arc<PeerDirectory>,
    transport: Arc<dyn Transport>,
    sequencers: Arc<SequencerSlot>,
    tracker: SequenceTracker,
    metrics: Arc<MeshMetrics>,
    config: ElectionConfig,
    state: Mutex<ElectionState>,
    generation: Mutex<u64>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct ElectionController {
    inner: Arc<Inner>,
}

enum Start {
    Declared(i32),
    Electing(Vec<String>),
}

enum Expiry {
    Declared(i32),
    Restart,
}

impl ElectionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_name: &str,
        directory: Arc<PeerDirectory>,
        transport: Arc<dyn Transport>,
        sequencers: Arc<SequencerSlot>,
        tracker: SequenceTracker,
        metrics: Arc<MeshMetrics>,
        config: ElectionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                self_name: self_name.to_string(),
                directory,
                transport,
                sequencers,
                tracker,
                metrics,
                config,
                state: Mutex::new(ElectionState::Idle),
                generation: Mutex::new(0),
                shutdown,
            }),
        }
    }

    pub fn phase(&self) -> ElectionPhase {
        match &*self.inner.state.lock() {
            ElectionState::Idle => ElectionPhase::Idle,
            ElectionState::Electing { .. } => ElectionPhase::Electing,
            ElectionState::AwaitingCoordinator { .. } => ElectionPhase::AwaitingCoordinator,
            ElectionState::Resolved { head, epoch } => ElectionPhase::Resolved {
                head: head.clone(),
                epoch: *epoch,
            },
        }
    }

    fn next_generation(&self) -> u64 {
        let mut generation = self.inner.generation.lock();
        *generation += 1;
        *generation
    }

    fn self_info(&self) -> PeerInfo {
        self.inner
            .directory
            .get(&self.inner.self_name)
            .unwrap_or_else(|| PeerInfo::new(&self.inner.self_name, PermissionLevel::Owner))
    }

    fn is_head(&self) -> bool {
        self.inner
            .directory
            .head()
            .is_some_and(|head| head.name == self.inner.self_name)
            && self.inner.sequencers.is_authoritative()
    }

    /// One past the highest epoch this peer has seen in any form, or `None`
    /// once epoch numbers are exhausted.
    fn next_epoch(&self) -> Option<i32> {
        let seen = self
            .inner
            .sequencers
            .highest_epoch()
            .max(self.inner.tracker.max_epoch().unwrap_or(UNAVAILABLE));
        let next = seen.checked_add(1);
        if next.is_none() {
            log::error!(highest = seen, "Epoch numbers exhausted");
        }
        next
    }

    /// Pick the sequencer for the configured head, or elect one when the
    /// directory names no owner.
    pub async fn bootstrap(&self) {
        let Some(head) = self.inner.directory.head() else {
            log::info!("No head in directory, starting election");
            self.start().await;
            return;
        };
        let follower = head.name != self.inner.self_name;
        {
            let mut state = self.inner.state.lock();
            let epoch = if follower {
                self.inner.sequencers.install_for(&head, None);
                UNAVAILABLE
            } else {
                let Some(epoch) = self.next_epoch() else {
                    state.cancel_timer();
                    *state = ElectionState::Idle;
                    self.inner.sequencers.set_unavailable();
                    return;
                };
                self.inner.sequencers.install_for(&head, Some(epoch));
                epoch
            };
            state.cancel_timer();
            *state = ElectionState::Resolved {
                head: head.name.clone(),
                epoch,
            };
        }
        if follower {
            // Greet the head early so the current epoch is known before the
            // first local edit or the next election.
            let sequencers = self.inner.sequencers.clone();
            let span = log::debug_span!("epoch_probe", head = %head.name);
            tokio::spawn(
                async move {
                    if sequencers.load().peek_sequence().await.is_none() {
                        log::debug!("Head sequencer not reachable yet");
                    }
                }
                .instrument(span),
            );
        }
    }

    /// Bring the sequencer in line with the directory after a membership or
    /// permission change: elect when no owner heads it, declare when this
    /// peer was promoted, and follow another promoted peer.
    pub async fn check_head(&self) {
        let Some(head) = self.inner.directory.head() else {
            log::info!("Head lost, starting election");
            self.start().await;
            return;
        };
        if head.name == self.inner.self_name {
            if !self.inner.sequencers.is_authoritative() {
                log::info!("Promoted to head");
                self.start().await;
            }
            return;
        }

        let mut state = self.inner.state.lock();
        let following = match &*state {
            ElectionState::Resolved { head: current, .. } => *current == head.name,
            ElectionState::Idle => false,
            ElectionState::Electing { .. } | ElectionState::AwaitingCoordinator { .. } => return,
        };
        if !following {
            log::info!(head = %head.name, "Following head named by directory");
            self.inner.sequencers.install_for(&head, None);
            *state = ElectionState::Resolved {
                head: head.name.clone(),
                epoch: UNAVAILABLE,
            };
        }
    }

    /// Pass headship to `peer` in a fresh epoch. Stamping stops here, every
    /// peer is told to adopt `peer`, and then this peer adopts it too.
    pub async fn hand_over(&self, peer: &str) -> MeshResult<i32> {
        let epoch = self
            .next_epoch()
            .ok_or_else(|| MeshError::Protocol("epoch numbers exhausted".to_string()))?;
        self.inner.sequencers.set_unavailable();
        let coord = ControlMessage::Coord {
            head: peer.to_string(),
            epoch,
        }
        .encode();
        let sent = broadcast(self.inner.transport.as_ref(), &coord).await;
        self.on_coord(peer, epoch);
        log::info!(peer = %peer, epoch, peers = sent, "Head handed over");
        Ok(epoch)
    }

    /// Begin an election as initiator.
    pub async fn start(&self) {
        let step = {
            let mut state = self.inner.state.lock();
            if matches!(
                *state,
                ElectionState::Electing { .. } | ElectionState::AwaitingCoordinator { .. }
            ) {
                log::debug!("Election already in progress");
                return;
            }
            let Some(rank) = self.inner.directory.rank_of(&self.inner.self_name) else {
                log::warn!("Not listed in peer directory, cannot take part in election");
                return;
            };
            if rank == 0 {
                if self.is_head() {
                    log::debug!("Already head, nothing to elect");
                    return;
                }
                match self.declare(&mut state) {
                    Some(epoch) => Start::Declared(epoch),
                    None => return,
                }
            } else {
                self.inner.sequencers.set_unavailable();
                let generation = self.next_generation();
                let timer = self.inner.shutdown.child_token();
                state.cancel_timer();
                *state = ElectionState::Electing {
                    timer: timer.clone(),
                    generation,
                };
                self.arm_timer(timer, generation);
                Start::Electing(self.inner.directory.higher_ranked(&self.inner.self_name))
            }
        };

        let higher = match step {
            Start::Declared(epoch) => {
                self.announce(epoch).await;
                return;
            }
            Start::Electing(higher) => higher,
        };
        self.inner.metrics.record_election_started();
        log::info!(candidates = ?higher, "Election started");

        let elect = ControlMessage::Elect.encode();
        for peer in higher {
            if let Err(e) = self.inner.transport.send(&peer, elect.clone()).await {
                log::debug!(peer = %peer, error = %e, "ELECT not delivered");
            }
        }
    }

    fn arm_timer(&self, timer: CancellationToken, generation: u64) {
        let controller = self.clone();
        let timeout = self.inner.config.timeout();
        let span = log::debug_span!("election_timer", name = %self.inner.self_name, generation);
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = timer.cancelled() => return,
                    _ = tokio::time::sleep(timeout) => {}
                }
                controller.on_timer_expired(generation).await;
            }
            .instrument(span),
        );
    }

    async fn on_timer_expired(&self, generation: u64) {
        let expiry = {
            let mut state = self.inner.state.lock();
            match &*state {
                ElectionState::Electing {
                    generation: current,
                    ..
                } if *current == generation => {
                    log::info!("No answer from higher-ranked peers");
                    self.declare(&mut state).map(Expiry::Declared)
                }
                ElectionState::AwaitingCoordinator {
                    generation: current,
                    ..
                } if *current == generation => {
                    *state = ElectionState::Idle;
                    Some(Expiry::Restart)
                }
                _ => None,
            }
        };
        match expiry {
            Some(Expiry::Declared(epoch)) => self.announce(epoch).await,
            Some(Expiry::Restart) => {
                log::warn!("Coordinator never announced itself, restarting election");
                self.start().await;
            }
            None => log::trace!(generation, "Stale election timer ignored"),
        }
    }

    /// Become head of a fresh epoch. Runs under the state lock so it cannot
    /// interleave with an ANSWER or COORD. Without a fresh epoch number this
    /// peer stays idle and unavailable.
    fn declare(&self, state: &mut ElectionState) -> Option<i32> {
        state.cancel_timer();
        let Some(epoch) = self.next_epoch() else {
            *state = ElectionState::Idle;
            self.inner.sequencers.set_unavailable();
            return None;
        };
        *state = ElectionState::Resolved {
            head: self.inner.self_name.clone(),
            epoch,
        };
        self.inner.directory.promote_owner(&self.inner.self_name);
        self.inner.sequencers.install_for(&self.self_info(), Some(epoch));
        self.inner.metrics.record_coordinator_adopted();
        log::info!(epoch, "Declared self head");
        Some(epoch)
    }

    async fn announce(&self, epoch: i32) {
        let coord = ControlMessage::Coord {
            head: self.inner.self_name.clone(),
            epoch,
        }
        .encode();
        let sent = broadcast(self.inner.transport.as_ref(), &coord).await;
        log::debug!(epoch, peers = sent, "COORD broadcast");
    }

    pub async fn on_elect(&self, from: &str) {
        log::debug!(from = %from, "ELECT received");
        if let Err(e) = self
            .inner
            .transport
            .send(from, ControlMessage::Answer.encode())
            .await
        {
            log::debug!(peer = %from, error = %e, "ANSWER not delivered");
        }
        if self.is_head() {
            // The sender lost sight of us; remind everyone who leads.
            self.announce(self.inner.sequencers.current_epoch()).await;
            return;
        }
        self.start().await;
    }

    pub fn on_answer(&self, from: &str) {
        let mut state = self.inner.state.lock();
        let ElectionState::Electing { timer, .. } = &*state else {
            log::trace!(from = %from, "ANSWER outside an election ignored");
            return;
        };
        timer.cancel();
        let generation = self.next_generation();
        let timer = self.inner.shutdown.child_token();
        *state = ElectionState::AwaitingCoordinator {
            timer: timer.clone(),
            generation,
        };
        self.arm_timer(timer, generation);
        log::debug!(from = %from, "Higher-ranked peer answered, awaiting COORD");
    }

    /// Adopt `head` for `epoch`. Older epochs are ignored and a repeat of the
    /// current head and epoch is a no-op.
    pub fn on_coord(&self, head: &str, epoch: i32) {
        let mut state = self.inner.state.lock();
        let highest = self.inner.sequencers.highest_epoch();
        if epoch < highest {
            log::warn!(head = %head, epoch, highest, "Stale COORD ignored");
            return;
        }
        if let ElectionState::Resolved {
            head: current,
            epoch: current_epoch,
        } = &*state
        {
            if current == head && *current_epoch == epoch {
                log::trace!(head = %head, epoch, "Repeated COORD ignored");
                return;
            }
        }

        state.cancel_timer();
        *state = ElectionState::Resolved {
            head: head.to_string(),
            epoch,
        };
        if !self.inner.directory.contains(head) {
            self.inner
                .directory
                .upsert(PeerInfo::new(head, PermissionLevel::Owner));
        }
        self.inner.directory.promote_owner(head);
        let info = self
            .inner
            .directory
            .get(head)
            .unwrap_or_else(|| PeerInfo::new(head, PermissionLevel::Owner));
        self.inner.sequencers.install_for(&info, Some(epoch));
        self.inner.metrics.record_coordinator_adopted();
        log::info!(head = %head, epoch, "Adopted new head");
    }

    /// Cancel any running timer.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.cancel_timer();
        if !matches!(*state, ElectionState::Resolved { .. }) {
            *state = ElectionState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        config::{MeshConfig, RecoveryConfig},
        test_utils::{creation, init_test_logging, MockTransport},
    };

    struct Harness {
        election: ElectionController,
        transport: Arc<MockTransport>,
        directory: Arc<PeerDirectory>,
        sequencers: Arc<SequencerSlot>,
        tracker: SequenceTracker,
        metrics: Arc<MeshMetrics>,
    }

    fn harness(peers: Vec<PeerInfo>) -> Harness {
        init_test_logging();
        let transport = MockTransport::new("me");
        for peer in &peers {
            if peer.name != "me" {
                transport.connect(&peer.name);
            }
        }
        let directory = Arc::new(PeerDirectory::new(peers));
        let shutdown = CancellationToken::new();
        let metrics = Arc::new(MeshMetrics::new());
        let sequencers = Arc::new(SequencerSlot::new(
            "me",
            None,
            MeshConfig::default(),
            shutdown.clone(),
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        let tracker = SequenceTracker::new(
            "me",
            transport.clone(),
            directory.clone(),
            RecoveryConfig::default(),
            metrics.clone(),
            tx,
            shutdown.clone(),
        );
        let election = ElectionController::new(
            "me",
            directory.clone(),
            transport.clone(),
            sequencers.clone(),
            tracker.clone(),
            metrics.clone(),
            ElectionConfig::default(),
            shutdown,
        );
        Harness {
            election,
            transport,
            directory,
            sequencers,
            tracker,
            metrics,
        }
    }

    fn editor(name: &str) -> PeerInfo {
        PeerInfo::new(name, PermissionLevel::Editor)
    }

    fn coord(head: &str, epoch: i32) -> Bytes {
        ControlMessage::Coord {
            head: head.to_string(),
            epoch,
        }
        .encode()
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_epochs_leave_peer_idle() {
        let h = harness(vec![editor("amy"), editor("me")]);
        h.election.on_coord("amy", i32::MAX);
        assert_eq!(h.sequencers.highest_epoch(), i32::MAX);

        h.directory.remove("amy");
        h.election.check_head().await;
        assert_eq!(h.election.phase(), ElectionPhase::Idle);
        assert!(!h.sequencers.is_authoritative());
        assert_eq!(h.sequencers.next_sequence().await, None);
        assert!(h.transport.sent_to("amy").is_empty());
        assert!(h.election.hand_over("amy").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rank_zero_declares_immediately() {
        let h = harness(vec![editor("me"), editor("zed")]);
        h.election.start().await;

        assert_eq!(
            h.election.phase(),
            ElectionPhase::Resolved {
                head: "me".to_string(),
                epoch: 0
            }
        );
        assert!(h.sequencers.is_authoritative());
        assert_eq!(h.directory.head().unwrap().name, "me");
        assert_eq!(h.transport.sent_to("zed"), vec![coord("me", 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_until_timeout_declares_next_epoch() {
        let h = harness(vec![editor("amy"), editor("me")]);
        // History from epoch 2 pushes the next epoch to 3.
        h.tracker.record_local(creation(2, 0, 1));

        h.election.start().await;
        assert_eq!(h.election.phase(), ElectionPhase::Electing);
        assert_eq!(h.transport.sent_to("amy"), vec![ControlMessage::Elect.encode()]);
        assert_eq!(h.sequencers.next_sequence().await, None);

        tokio::time::sleep(Duration::from_millis(9_999)).await;
        assert_eq!(h.election.phase(), ElectionPhase::Electing);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(
            h.election.phase(),
            ElectionPhase::Resolved {
                head: "me".to_string(),
                epoch: 3
            }
        );
        assert_eq!(
            h.transport.sent_to("amy"),
            vec![ControlMessage::Elect.encode(), coord("me", 3)]
        );
        assert_eq!(h.metrics.snapshot().elections_started, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_then_coord_adopts_higher_peer() {
        let h = harness(vec![editor("amy"), editor("me")]);
        h.election.start().await;
        h.election.on_answer("amy");
        assert_eq!(h.election.phase(), ElectionPhase::AwaitingCoordinator);

        // The election timer was cancelled by the answer.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.election.phase(), ElectionPhase::AwaitingCoordinator);

        h.election.on_coord("amy", 1);
        assert_eq!(
            h.election.phase(),
            ElectionPhase::Resolved {
                head: "amy".to_string(),
                epoch: 1
            }
        );
        assert_eq!(h.directory.head().unwrap().name, "amy");
        assert!(!h.sequencers.is_authoritative());
        assert_eq!(h.sequencers.current_epoch(), 1);

        // The coordinator wait timer must not fire after adoption.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.transport.sent_to("amy").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_coord_restarts_election() {
        let h = harness(vec![editor("amy"), editor("me")]);
        h.election.start().await;
        h.election.on_answer("amy");
        tokio::time::sleep(Duration::from_millis(10_001)).await;

        assert_eq!(h.election.phase(), ElectionPhase::Electing);
        assert_eq!(
            h.transport.sent_to("amy"),
            vec![
                ControlMessage::Elect.encode(),
                ControlMessage::Elect.encode()
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_coord_idempotent_and_stale_ignored() {
        let h = harness(vec![editor("amy"), editor("me"), editor("zed")]);
        h.election.on_coord("amy", 3);
        h.election.on_coord("amy", 3);
        assert_eq!(h.metrics.snapshot().coordinators_adopted, 1);

        h.election.on_coord("zed", 2);
        assert_eq!(h.directory.head().unwrap().name, "amy");

        // Same epoch from a different head: last one wins.
        h.election.on_coord("zed", 3);
        assert_eq!(h.directory.head().unwrap().name, "zed");
        assert_eq!(h.directory.get("amy").unwrap().level, PermissionLevel::Editor);
    }

    #[tokio::test(start_paused = true)]
    async fn test_head_answers_elect_with_coord() {
        let h = harness(vec![
            PeerInfo::new("me", PermissionLevel::Owner),
            editor("zed"),
        ]);
        h.election.bootstrap().await;
        assert!(h.sequencers.is_authoritative());

        h.election.on_elect("zed").await;
        assert_eq!(
            h.transport.sent_to("zed"),
            vec![ControlMessage::Answer.encode(), coord("me", 0)]
        );
        assert_eq!(
            h.election.phase(),
            ElectionPhase::Resolved {
                head: "me".to_string(),
                epoch: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_elect_from_lower_peer_answers_and_runs_own_election() {
        let h = harness(vec![editor("amy"), editor("me"), editor("zed")]);
        h.election.on_elect("zed").await;
        assert_eq!(
            h.transport.sent_to("zed"),
            vec![ControlMessage::Answer.encode()]
        );
        assert_eq!(h.transport.sent_to("amy"), vec![ControlMessage::Elect.encode()]);
        assert_eq!(h.election.phase(), ElectionPhase::Electing);

        // A second ELECT does not start a second timer.
        h.election.on_elect("zed").await;
        assert_eq!(h.transport.sent_to("amy").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_as_follower_installs_proxy() {
        let h = harness(vec![
            PeerInfo::new("amy", PermissionLevel::Owner),
            editor("me"),
        ]);
        h.election.bootstrap().await;
        assert!(!h.sequencers.is_authoritative());
        assert!(h.directory.head().is_some());
        h.election.check_head().await;
        assert_eq!(h.metrics.snapshot().elections_started, 0);

        h.directory.remove("amy");
        h.election.check_head().await;
        // Alone at rank zero: declares without waiting.
        assert_eq!(
            h.election.phase(),
            ElectionPhase::Resolved {
                head: "me".to_string(),
                epoch: 0
            }
        );
    }
}
