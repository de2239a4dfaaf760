//! Replication metrics for monitoring a session.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Counters shared by every component of a session.
pub struct MeshMetrics {
    // Delivery metrics
    delivered: AtomicU64,
    duplicates: AtomicU64,
    buffered: AtomicU64,
    malformed: AtomicU64,

    // Recovery metrics
    retransmit_replies: AtomicU64,
    retransmit_requests: AtomicU64,
    gap_workers_started: AtomicU64,
    gap_workers_cancelled: AtomicU64,
    tombstones: AtomicU64,

    // Election metrics
    elections_started: AtomicU64,
    coordinators_adopted: AtomicU64,

    // Outbound metrics
    stamped: AtomicU64,
    sequencer_unavailable: AtomicU64,

    // Inbound frames per peer
    frames_by_peer: DashMap<String, u64>,
}

impl MeshMetrics {
    pub fn new() -> Self {
        Self {
            delivered: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            buffered: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            retransmit_replies: AtomicU64::new(0),
            retransmit_requests: AtomicU64::new(0),
            gap_workers_started: AtomicU64::new(0),
            gap_workers_cancelled: AtomicU64::new(0),
            tombstones: AtomicU64::new(0),
            elections_started: AtomicU64::new(0),
            coordinators_adopted: AtomicU64::new(0),
            stamped: AtomicU64::new(0),
            sequencer_unavailable: AtomicU64::new(0),
            frames_by_peer: DashMap::new(),
        }
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffered(&self) {
        self.buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retransmit_reply(&self) {
        self.retransmit_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retransmit_request(&self) {
        self.retransmit_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gap_worker_started(&self) {
        self.gap_workers_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gap_worker_cancelled(&self) {
        self.gap_workers_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tombstone(&self) {
        self.tombstones.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_election_started(&self) {
        self.elections_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coordinator_adopted(&self) {
        self.coordinators_adopted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stamped(&self) {
        self.stamped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sequencer_unavailable(&self) {
        self.sequencer_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_from(&self, peer: &str) {
        *self.frames_by_peer.entry(peer.to_string()).or_insert(0) += 1;
    }

    /// Inbound frame counts, sorted by peer name.
    pub fn peer_frames(&self) -> Vec<(String, u64)> {
        let mut frames: Vec<(String, u64)> = self
            .frames_by_peer
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        frames.sort();
        frames
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            retransmit_replies: self.retransmit_replies.load(Ordering::Relaxed),
            retransmit_requests: self.retransmit_requests.load(Ordering::Relaxed),
            gap_workers_started: self.gap_workers_started.load(Ordering::Relaxed),
            gap_workers_cancelled: self.gap_workers_cancelled.load(Ordering::Relaxed),
            tombstones: self.tombstones.load(Ordering::Relaxed),
            elections_started: self.elections_started.load(Ordering::Relaxed),
            coordinators_adopted: self.coordinators_adopted.load(Ordering::Relaxed),
            stamped: self.stamped.load(Ordering::Relaxed),
            sequencer_unavailable: self.sequencer_unavailable.load(Ordering::Relaxed),
        }
    }
}

impl Default for MeshMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub delivered: u64,
    pub duplicates: u64,
    pub buffered: u64,
    pub malformed: u64,
    pub retransmit_replies: u64,
    pub retransmit_requests: u64,
    pub gap_workers_started: u64,
    pub gap_workers_cancelled: u64,
    pub tombstones: u64,
    pub elections_started: u64,
    pub coordinators_adopted: u64,
    pub stamped: u64,
    pub sequencer_unavailable: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = MeshMetrics::new();
        metrics.record_delivered();
        metrics.record_delivered();
        metrics.record_tombstone();
        metrics.record_sequencer_unavailable();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.delivered, 2);
        assert_eq!(snapshot.tombstones, 1);
        assert_eq!(snapshot.sequencer_unavailable, 1);
        assert_eq!(snapshot.duplicates, 0);
    }

    #[test]
    fn test_peer_frames_sorted() {
        let metrics = MeshMetrics::default();
        metrics.record_frame_from("carol");
        metrics.record_frame_from("alice");
        metrics.record_frame_from("carol");
        assert_eq!(
            metrics.peer_frames(),
            vec![("alice".to_string(), 1), ("carol".to_string(), 2)]
        );
    }
}
