//! relaydb middleware node.
//!
//! Loads the static topology, starts the cluster runtime, and serves the
//! framed protocol for peers and clients on the configured port until
//! interrupted. The bundled in-memory backend holds this node's replica;
//! a production deployment plugs its relational engine in behind the
//! `Backend` trait instead.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use relaydb_cluster::{ClusterConfig, ClusterNode};
use relaydb_core::MemoryBackend;

#[derive(Parser, Debug)]
#[command(name = "relaydb-server")]
#[command(about = "Distributed SQL replication middleware node")]
struct Args {
    /// Path to the cluster topology JSON file.
    #[arg(long, default_value = "config/nodes.json")]
    config: PathBuf,

    /// This node's id in the topology.
    #[arg(long)]
    node_id: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = match ClusterConfig::load(&args.config, args.node_id) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    let backend = MemoryBackend::new(config.cluster_size() as u64, u64::from(args.node_id));
    let local = config.local().clone();
    let node = match ClusterNode::start(config, backend).await {
        Ok(node) => node,
        Err(e) => {
            error!("failed to start node {}: {e}", args.node_id);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "node {} serving peers and clients on port {}",
        args.node_id, local.port
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }
    node.shutdown().await;
    info!("node {} stopped", args.node_id);
    ExitCode::SUCCESS
}
