//! Node binary

use clap::Parser;
use minidb::common::ClusterConfig;
use minidb::NodeServer;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minidb-node")]
#[command(about = "minidb node: 2PC writes, Bully election, local reads")]
#[command(version)]
struct Cli {
    /// Cluster descriptor for this node (JSON or TOML)
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ClusterConfig::load(&cli.config)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.settings.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server = NodeServer::bind(config).await?;
    server.serve_until_ctrl_c().await?;

    Ok(())
}
