//! Mesh configuration types.
//!
//! Every field has a default so a partial YAML/JSON document deserializes into a
//! usable configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MeshConfig {
    /// Gap recovery timing
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Head election timing
    #[serde(default)]
    pub election: ElectionConfig,

    /// Outbound buffer retry behaviour
    #[serde(default)]
    pub outbound: OutboundConfig,

    /// Sequencer proxy connection settings
    #[serde(default)]
    pub sequencer: SequencerConfig,

    /// Upper bound on a single envelope body
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            recovery: RecoveryConfig::default(),
            election: ElectionConfig::default(),
            outbound: OutboundConfig::default(),
            sequencer: SequencerConfig::default(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl MeshConfig {
    pub fn validate(&self) -> MeshResult<()> {
        if self.recovery.min_attempts == 0 {
            return Err(MeshError::Config(
                "recovery.min_attempts must be at least 1".to_string(),
            ));
        }
        if self.recovery.max_outstanding == 0 {
            return Err(MeshError::Config(
                "recovery.max_outstanding must be at least 1".to_string(),
            ));
        }
        if self.election.timeout_ms == 0 {
            return Err(MeshError::Config(
                "election.timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.max_frame_bytes < 64 {
            return Err(MeshError::Config(format!(
                "max_frame_bytes {} is too small",
                self.max_frame_bytes
            )));
        }
        Ok(())
    }
}

/// Randomized backoff used by gap recovery workers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_recovery_timeout_ms")]
    pub timeout_ms: u64,
    /// Each wait is `timeout_ms` plus or minus up to this much
    #[serde(default = "default_recovery_jitter_ms")]
    pub jitter_ms: u64,
    /// Requests sent before a missing sequence is tombstoned
    #[serde(default = "default_min_attempts")]
    pub min_attempts: u32,
    /// Cap on concurrently running gap workers; further gaps are sought as
    /// earlier ones resolve
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_recovery_timeout_ms(),
            jitter_ms: default_recovery_jitter_ms(),
            min_attempts: default_min_attempts(),
            max_outstanding: default_max_outstanding(),
        }
    }
}

impl RecoveryConfig {
    /// Draw one randomized wait: `timeout_ms ± jitter_ms`, never negative.
    pub fn random_wait(&self) -> Duration {
        use rand::Rng;

        let jitter = self.jitter_ms as i64;
        let offset = if jitter > 0 {
            rand::rng().random_range(-jitter..=jitter)
        } else {
            0
        };
        let millis = (self.timeout_ms as i64).saturating_add(offset).max(0);
        Duration::from_millis(millis as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ElectionConfig {
    /// How long an initiator waits for ANSWER, and then for COORD
    #[serde(default = "default_election_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_election_timeout_ms(),
        }
    }
}

impl ElectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OutboundConfig {
    /// Bounded sleep after the sequencer reports unavailable
    #[serde(default = "default_retry_wait_ms")]
    pub retry_wait_ms: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            retry_wait_ms: default_retry_wait_ms(),
        }
    }
}

impl OutboundConfig {
    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SequencerConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl SequencerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_recovery_timeout_ms() -> u64 {
    3000
}

fn default_recovery_jitter_ms() -> u64 {
    2000
}

fn default_min_attempts() -> u32 {
    5
}

fn default_max_outstanding() -> usize {
    256
}

fn default_election_timeout_ms() -> u64 {
    10_000
}

fn default_retry_wait_ms() -> u64 {
    500
}

fn default_request_timeout_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}
