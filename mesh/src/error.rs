//! Mesh error types.
//!
//! `MalformedPacketError` is raised only at the codec boundary; `MeshError`
//! covers transport, sequencer protocol and configuration failures.

use thiserror::Error;

pub type MeshResult<T> = Result<T, MeshError>;

/// Rejection of a byte slice that cannot be a sequenced packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedPacketError {
    #[error("empty packet")]
    Empty,

    #[error("unknown packet kind tag {0}")]
    UnknownKind(u8),

    #[error("packet of kind {kind} is {len} bytes, header needs at least {min}")]
    Truncated {
        kind: &'static str,
        len: usize,
        min: usize,
    },
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Malformed packet: {0}")]
    Malformed(#[from] MalformedPacketError),

    #[error("Peer not connected: {0}")]
    PeerNotConnected(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Handshake failed with {peer}: {reason}")]
    Handshake { peer: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Invalid frame tag")]
    InvalidFrameTag,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Errors after which the underlying connection must be dropped.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            MeshError::Io(_)
                | MeshError::InvalidFrameTag
                | MeshError::FrameTooLarge { .. }
                | MeshError::Timeout(_)
                | MeshError::Closed
        )
    }
}
