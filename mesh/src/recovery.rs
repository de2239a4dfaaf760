//! Gap recovery worker: one short-lived task per missing slot.

use std::time::Duration;

use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing as log;
use tracing::Instrument;

use crate::{
    packet::{SequencedPacket, SlotId},
    tracker::SequenceTracker,
};

pub(crate) struct GapRecoveryWorker {
    slot: SlotId,
    token: CancellationToken,
    tracker: SequenceTracker,
}

impl GapRecoveryWorker {
    pub(crate) fn new(slot: SlotId, token: CancellationToken, tracker: SequenceTracker) -> Self {
        Self {
            slot,
            token,
            tracker,
        }
    }

    pub(crate) fn spawn(self) {
        let span = log::debug_span!(
            "gap_recovery",
            name = %self.tracker.inner.self_name,
            slot = %self.slot
        );
        tokio::spawn(self.run().instrument(span));
    }

    /// Sleep for `wait`; false when cancelled first.
    async fn wait(&self, wait: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    async fn run(self) {
        let inner = &self.tracker.inner;
        let request = SequencedPacket::sequence_request(self.slot).raw().clone();
        log::debug!("Gap recovery started");

        if !self.wait(inner.config.random_wait()).await {
            return;
        }

        let mut attempts: u32 = 0;
        loop {
            let mut peers: Vec<String> = inner
                .directory
                .names()
                .into_iter()
                .filter(|name| *name != inner.self_name)
                .collect();
            peers.shuffle(&mut rand::rng());

            let mut sent_this_pass = 0;
            for peer in peers {
                if self.token.is_cancelled() {
                    return;
                }
                if !inner.transport.is_connected(&peer) {
                    continue;
                }
                if let Err(e) = inner.transport.send(&peer, request.clone()).await {
                    log::debug!(peer = %peer, error = %e, "Retransmission request failed");
                    continue;
                }
                attempts += 1;
                sent_this_pass += 1;
                inner.metrics.record_retransmit_request();
                log::trace!(peer = %peer, attempts, "Requested retransmission");
                if !self.wait(inner.config.random_wait()).await {
                    return;
                }
            }

            if attempts >= inner.config.min_attempts || sent_this_pass == 0 {
                break;
            }
        }

        log::debug!(attempts, "Gap recovery exhausted");
        self.tracker.give_up(self.slot, &self.token);
    }
}
