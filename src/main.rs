use canvas_node::{cli::Cli, config::NodeConfig, logging::init_logging, node};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = NodeConfig::load(&cli.config)?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    init_logging(&config.log)?;
    tracing::info!(name = %config.name, peers = config.peers.len(), "Starting canvas node");

    node::run(config).await
}
