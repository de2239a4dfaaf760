//! Epoch-Sequenced Canvas Replication
//!
//! This crate keeps a shared drawing canvas consistent across a small group of peers:
//! - Packet codec and stream envelope for edits and control messages
//! - Per-epoch reordering with causal (creation-before-edit) delivery
//! - Gap recovery by retransmission requests, falling back to tombstones
//! - A head-owned sequencer with proxies on every other peer
//! - Bully-style head election on head loss
//! - An outbound buffer that stamps local edits in submission order

pub mod config;
pub mod election;
pub mod epoch;
pub mod error;
pub mod metrics;
pub mod outbound;
pub mod packet;
pub mod peers;
mod recovery;
pub mod sequencer;
pub mod session;
pub mod tracker;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::{ElectionConfig, MeshConfig, OutboundConfig, RecoveryConfig, SequencerConfig};
pub use election::{ElectionController, ElectionPhase};
pub use error::{MalformedPacketError, MeshError, MeshResult};
pub use metrics::{MeshMetrics, MetricsSnapshot};
pub use outbound::{LocalEdit, OutboundBuffer};
pub use packet::{PacketKind, SequencedPacket, SlotId};
pub use peers::{PeerDirectory, PeerInfo, PermissionLevel};
pub use sequencer::{Sequencer, SequencerSlot};
pub use session::{ChatMessage, ReplicationSession, SessionOutputs};
pub use tracker::{IngestOutcome, SequenceTracker};
pub use transport::{FrameHandler, TcpTransport, Transport};
