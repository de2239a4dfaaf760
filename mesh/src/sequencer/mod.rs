//! Sequence number issuing.
//!
//! The head runs an [`AuthoritativeSequencer`]; every other peer holds a
//! [`ProxySequencer`] pointed at the head. The active instance lives in a
//! [`SequencerSlot`] and is replaced wholesale after each election.

mod authoritative;
pub mod protocol;
mod proxy;

use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc,
};

use arc_swap::ArcSwap;
use tokio::{net::TcpListener, sync::Notify};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use authoritative::AuthoritativeSequencer;
pub use protocol::UNAVAILABLE;
pub use proxy::ProxySequencer;

use crate::{config::MeshConfig, packet::SlotId, peers::PeerInfo};

#[derive(Debug)]
pub enum Sequencer {
    /// No head is known, or an election is running.
    Unavailable,
    Authoritative(Arc<AuthoritativeSequencer>),
    Proxy(Arc<ProxySequencer>),
}

impl Sequencer {
    /// `None` tells the caller to wait and retry.
    pub async fn next_sequence(&self) -> Option<SlotId> {
        match self {
            Sequencer::Unavailable => None,
            Sequencer::Authoritative(sequencer) => Some(sequencer.next_sequence()),
            Sequencer::Proxy(proxy) => proxy.next_sequence().await,
        }
    }

    pub async fn peek_sequence(&self) -> Option<i32> {
        match self {
            Sequencer::Unavailable => None,
            Sequencer::Authoritative(sequencer) => Some(sequencer.peek_sequence()),
            Sequencer::Proxy(proxy) => proxy.peek_sequence().await,
        }
    }

    pub fn current_epoch(&self) -> i32 {
        match self {
            Sequencer::Unavailable => UNAVAILABLE,
            Sequencer::Authoritative(sequencer) => sequencer.epoch(),
            Sequencer::Proxy(proxy) => proxy.epoch(),
        }
    }

    pub fn is_authoritative(&self) -> bool {
        matches!(self, Sequencer::Authoritative(_))
    }

    pub fn close(&self) {
        match self {
            Sequencer::Unavailable => {}
            Sequencer::Authoritative(sequencer) => sequencer.close(),
            Sequencer::Proxy(proxy) => proxy.close(),
        }
    }
}

/// Holder of the active sequencer.
pub struct SequencerSlot {
    self_name: String,
    current: ArcSwap<Sequencer>,
    highest_epoch: Arc<AtomicI32>,
    listener: Option<Arc<TcpListener>>,
    config: MeshConfig,
    changed: Notify,
    shutdown: CancellationToken,
}

impl SequencerSlot {
    pub fn new(
        self_name: &str,
        listener: Option<Arc<TcpListener>>,
        config: MeshConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            self_name: self_name.to_string(),
            current: ArcSwap::from_pointee(Sequencer::Unavailable),
            highest_epoch: Arc::new(AtomicI32::new(UNAVAILABLE)),
            listener,
            config,
            changed: Notify::new(),
            shutdown,
        }
    }

    pub fn load(&self) -> Arc<Sequencer> {
        self.current.load_full()
    }

    pub async fn next_sequence(&self) -> Option<SlotId> {
        self.load().next_sequence().await
    }

    pub fn current_epoch(&self) -> i32 {
        self.load().current_epoch()
    }

    pub fn is_authoritative(&self) -> bool {
        self.load().is_authoritative()
    }

    /// Highest epoch any sequencer instance has announced to this peer.
    pub fn highest_epoch(&self) -> i32 {
        self.highest_epoch.load(Ordering::SeqCst)
    }

    /// Install a sequencer for `head` in `epoch`: authoritative when the head
    /// is this peer, otherwise a proxy. `epoch` of `None` lets a proxy learn it
    /// from the head's greeting.
    pub fn install_for(&self, head: &PeerInfo, epoch: Option<i32>) {
        let sequencer = if head.name == self.self_name {
            let epoch = epoch.unwrap_or_else(|| self.highest_epoch().max(0));
            let authoritative = AuthoritativeSequencer::new(epoch, &self.shutdown);
            if let Some(listener) = &self.listener {
                authoritative.serve(listener.clone(), self.config.max_frame_bytes);
            }
            Sequencer::Authoritative(authoritative)
        } else {
            Sequencer::Proxy(ProxySequencer::new(
                &head.name,
                head.sequencer_address,
                epoch,
                self.highest_epoch.clone(),
                self.config.sequencer.clone(),
                self.config.max_frame_bytes,
                &self.shutdown,
            ))
        };
        if let Some(epoch) = epoch {
            self.highest_epoch.fetch_max(epoch, Ordering::SeqCst);
        }
        info!(
            head = %head.name,
            epoch = sequencer.current_epoch(),
            authoritative = sequencer.is_authoritative(),
            "Sequencer installed"
        );
        self.replace(sequencer);
    }

    /// Close the active sequencer; stamping pauses until the next install.
    pub fn set_unavailable(&self) {
        self.replace(Sequencer::Unavailable);
    }

    fn replace(&self, sequencer: Sequencer) {
        let previous = self.current.swap(Arc::new(sequencer));
        previous.close();
        self.changed.notify_one();
    }

    /// Resolves after the next install or release.
    pub async fn changed(&self) {
        self.changed.notified().await
    }
}
