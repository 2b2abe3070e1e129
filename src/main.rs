use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use consensus_node::node::Node;
use consensus_node::NodeConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "consensus-noded")]
#[command(version)]
#[command(about = "Peer-to-peer full node daemon")]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Network: main, test or regtest
    #[arg(long)]
    network: Option<String>,

    /// Listen address, e.g. 0.0.0.0:8333
    #[arg(long)]
    listen: Option<String>,

    /// Peer to dial; may be repeated
    #[arg(long)]
    connect: Vec<String>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    max_inbound: Option<usize>,

    #[arg(long)]
    max_outbound: Option<usize>,

    /// Do not query DNS seeds
    #[arg(long)]
    no_seeds: bool,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)
                .with_context(|| format!("cannot load config {}", path.display()))?,
            None => NodeConfig::default(),
        };
        if let Some(network) = self.network {
            config.network = network;
        }
        if self.listen.is_some() {
            config.listen = self.listen;
        }
        config.connect.extend(self.connect);
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(max_inbound) = self.max_inbound {
            config.max_inbound = max_inbound;
        }
        if let Some(max_outbound) = self.max_outbound {
            config.max_outbound = max_outbound;
        }
        if self.no_seeds {
            config.use_dns_seeds = false;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = args.into_config()?;
    info!(network = %config.network, workers = config.workers, "starting node");

    let _node = Node::start(config).context("node failed to start")?;

    // Runs until the process is terminated
    loop {
        thread::park();
    }
}
