//! Node configuration, loaded from YAML.

use std::{
    collections::HashSet,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use canvas_mesh::{MeshConfig, PeerDirectory, PeerInfo, PermissionLevel};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub level: PermissionLevel,
    /// Address peers dial for mesh links
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Address the sequencer is served on while this node is head
    #[serde(default = "default_sequencer_listen")]
    pub sequencer_listen: SocketAddr,
    /// Every other peer of the session
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl NodeConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> ConfigResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".to_string()));
        }
        if self.listen == self.sequencer_listen {
            return Err(ConfigError::Invalid(format!(
                "listen and sequencer_listen are both {}",
                self.listen
            )));
        }
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.name == self.name {
                return Err(ConfigError::Invalid(format!(
                    "peer list contains this node ({})",
                    self.name
                )));
            }
            if !seen.insert(peer.name.as_str()) {
                return Err(ConfigError::Invalid(format!("peer {} listed twice", peer.name)));
            }
        }
        let owners = self.peers.iter().filter(|p| p.is_owner()).count()
            + usize::from(self.level == PermissionLevel::Owner);
        if owners > 1 {
            return Err(ConfigError::Invalid(format!(
                "{} peers are configured as owner, at most one is allowed",
                owners
            )));
        }
        self.mesh
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// This node's own directory entry.
    pub fn self_info(&self) -> PeerInfo {
        PeerInfo::new(&self.name, self.level)
            .with_address(self.listen)
            .with_sequencer_address(self.sequencer_listen)
    }

    pub fn directory(&self) -> PeerDirectory {
        PeerDirectory::new(std::iter::once(self.self_info()).chain(self.peers.iter().cloned()))
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7400))
}

fn default_sequencer_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7401))
}
