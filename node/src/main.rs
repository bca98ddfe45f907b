// Atlas Node Binary
// Entry point for the Atlas zonefile replication daemon

use clap::Parser;
use node::config::AtlasConfig;
use node::ledger::MemoryLedger;
use node::Node;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Atlas zonefile replication node", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Public host:port other peers reach this node at
    #[arg(long)]
    hostport: Option<String>,

    /// Bind address for the RPC server
    #[arg(long)]
    listen: Option<String>,

    /// Data directory (catalog database and zonefile store)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Seed peer (repeatable)
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let log_level = if args.debug { "debug" } else { "info" };
        EnvFilter::new(log_level)
    });
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    // Load configuration
    let mut config = AtlasConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::process::exit(1);
    });
    if let Some(hostport) = args.hostport {
        config.node.hostport = hostport;
    }
    if let Some(listen) = args.listen {
        config.node.rpc_bind = listen;
    }
    if let Some(data_dir) = args.data_dir {
        config.node.data_dir = data_dir;
    }
    config.peers.seeds.extend(args.seeds);

    // Load the ledger snapshot, if configured; an empty ledger still
    // serves and replicates whatever peers push to us once anchored.
    let ledger = match &config.node.ledger_snapshot {
        Some(path) => {
            info!(path = %path.display(), "Loading ledger snapshot");
            MemoryLedger::load(path)?
        }
        None => MemoryLedger::new(""),
    };

    let mut atlas = Node::new(config, Arc::new(ledger))?;
    atlas.start()?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to wait for shutdown signal");
    }
    info!("Shutdown signal received");
    atlas.stop().await;

    Ok(())
}
