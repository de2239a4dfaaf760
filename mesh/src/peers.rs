//! Ranked peer directory.
//!
//! The directory holds every participant, self included, ordered by permission
//! level (owner first) and then case-insensitive name. The first entry is the
//! head whenever it holds owner rank.

use std::{cmp::Ordering, net::SocketAddr};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Viewer,
    #[default]
    Editor,
    Owner,
}

impl PermissionLevel {
    pub fn ordinal(self) -> u8 {
        match self {
            PermissionLevel::Viewer => 0,
            PermissionLevel::Editor => 1,
            PermissionLevel::Owner => 2,
        }
    }

    pub fn from_ordinal(value: u8) -> Option<Self> {
        match value {
            0 => Some(PermissionLevel::Viewer),
            1 => Some(PermissionLevel::Editor),
            2 => Some(PermissionLevel::Owner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PeerInfo {
    pub name: String,
    #[serde(default)]
    pub level: PermissionLevel,
    /// Address of the peer's mesh listener
    #[serde(default)]
    pub address: Option<SocketAddr>,
    /// Address of the peer's sequencer listener, used once it becomes head
    #[serde(default)]
    pub sequencer_address: Option<SocketAddr>,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>, level: PermissionLevel) -> Self {
        Self {
            name: name.into(),
            level,
            address: None,
            sequencer_address: None,
        }
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_sequencer_address(mut self, address: SocketAddr) -> Self {
        self.sequencer_address = Some(address);
        self
    }

    pub fn is_owner(&self) -> bool {
        self.level == PermissionLevel::Owner
    }
}

fn rank_order(a: &PeerInfo, b: &PeerInfo) -> Ordering {
    b.level
        .ordinal()
        .cmp(&a.level.ordinal())
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        .then_with(|| a.name.cmp(&b.name))
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: RwLock<Vec<PeerInfo>>,
}

impl PeerDirectory {
    pub fn new(peers: impl IntoIterator<Item = PeerInfo>) -> Self {
        let directory = Self::default();
        for peer in peers {
            directory.upsert(peer);
        }
        directory
    }

    /// Insert a peer or replace the entry with the same name. Returns true when
    /// the peer was not known before.
    pub fn upsert(&self, peer: PeerInfo) -> bool {
        let mut peers = self.peers.write();
        let added = match peers.iter_mut().find(|p| p.name == peer.name) {
            Some(existing) => {
                *existing = peer;
                false
            }
            None => {
                debug!(peer = %peer.name, level = ?peer.level, "Peer added to directory");
                peers.push(peer);
                true
            }
        };
        peers.sort_by(rank_order);
        added
    }

    pub fn remove(&self, name: &str) -> Option<PeerInfo> {
        let mut peers = self.peers.write();
        let index = peers.iter().position(|p| p.name == name)?;
        let removed = peers.remove(index);
        info!(peer = %name, level = ?removed.level, "Peer removed from directory");
        Some(removed)
    }

    pub fn set_level(&self, name: &str, level: PermissionLevel) -> bool {
        let mut peers = self.peers.write();
        let Some(peer) = peers.iter_mut().find(|p| p.name == name) else {
            return false;
        };
        peer.level = level;
        peers.sort_by(rank_order);
        true
    }

    /// Make `name` the only owner; a previous owner drops to editor.
    pub fn promote_owner(&self, name: &str) -> bool {
        let mut peers = self.peers.write();
        if !peers.iter().any(|p| p.name == name) {
            return false;
        }
        for peer in peers.iter_mut() {
            if peer.name == name {
                peer.level = PermissionLevel::Owner;
            } else if peer.level == PermissionLevel::Owner {
                peer.level = PermissionLevel::Editor;
            }
        }
        peers.sort_by(rank_order);
        true
    }

    /// Current head: the first entry, provided it holds owner rank.
    pub fn head(&self) -> Option<PeerInfo> {
        self.peers.read().first().filter(|p| p.is_owner()).cloned()
    }

    pub fn head_lost(&self) -> bool {
        self.head().is_none()
    }

    pub fn rank_of(&self, name: &str) -> Option<usize> {
        self.peers.read().iter().position(|p| p.name == name)
    }

    pub fn get(&self, name: &str) -> Option<PeerInfo> {
        self.peers.read().iter().find(|p| p.name == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.peers.read().iter().any(|p| p.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.peers.read().iter().map(|p| p.name.clone()).collect()
    }

    /// Names of peers ranked strictly above `name`.
    pub fn higher_ranked(&self, name: &str) -> Vec<String> {
        let peers = self.peers.read();
        peers
            .iter()
            .take_while(|p| p.name != name)
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
