use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

use crate::config::NodeConfig;

/// Command line arguments. Everything except the config path overrides the
/// corresponding YAML setting.
#[derive(Parser, Debug)]
#[command(name = "canvas-node")]
#[command(about = "Peer of a replicated drawing canvas", long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "CANVAS_NODE_CONFIG", value_name = "PATH")]
    pub config: PathBuf,

    /// Override the node name
    #[arg(long, env = "CANVAS_NODE_NAME")]
    pub name: Option<String>,

    /// Override the mesh listen address
    #[arg(long, env = "CANVAS_NODE_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Override the sequencer listen address
    #[arg(long, env = "CANVAS_NODE_SEQUENCER_LISTEN")]
    pub sequencer_listen: Option<SocketAddr>,

    /// Log filter (trace, debug, info, warn, error or a full directive)
    #[arg(short, long, env = "CANVAS_NODE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

impl Cli {
    pub fn apply_overrides(&self, config: &mut NodeConfig) {
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(sequencer_listen) = self.sequencer_listen {
            config.sequencer_listen = sequencer_listen;
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if self.log_json {
            config.log.json = true;
        }
    }
}
