//! Agora CLI
//!
//! Command-line interface for running Agora nodes.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use agora_consensus::StateEvent;
use agora_core::NetworkId;
use agora_crypto::PrivateKey;
use agora_node::config::LogFormat;
use agora_node::{
    init_logging, AgoraNode, ClusterConfig, GenesisGenerator, LocalCluster, LocalNetwork, LoggingConfig, MemoryDatabase,
    NodeConfig,
};

#[derive(Parser)]
#[command(name = "agora")]
#[command(version = "0.1.0")]
#[command(about = "Agora - BFT consensus node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until Ctrl-C
    Run {
        /// Configuration file path
        #[arg(short, long, default_value = "agora.toml")]
        config: PathBuf,
    },

    /// Run several nodes in this process and report their heights
    Cluster {
        /// Number of nodes
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        /// Seconds to run; 0 runs until Ctrl-C
        #[arg(short, long, default_value = "30")]
        duration: u64,

        /// Network id
        #[arg(long, default_value = "agora-local")]
        network_id: String,

        /// Rotate the proposer over the nodes
        #[arg(long)]
        roundrobin: bool,
    },

    /// Generate a new key pair
    Keygen,

    /// Print the default configuration
    InitConfig,
}

fn logging_config(verbose: bool) -> LoggingConfig {
    LoggingConfig {
        level: if verbose { "debug".into() } else { "info".into() },
        format: LogFormat::Text,
        color: true,
    }
}

/// Resolves on Ctrl-C, or after `duration` when it is not zero
async fn until_done(duration: Duration) -> anyhow::Result<()> {
    if duration.is_zero() {
        tokio::signal::ctrl_c().await?;
        return Ok(());
    }
    tokio::select! {
        r = tokio::signal::ctrl_c() => r?,
        _ = tokio::time::sleep(duration) => {}
    }
    Ok(())
}

async fn run(config: PathBuf, verbose: bool) -> anyhow::Result<()> {
    let config = NodeConfig::load(&config).with_context(|| format!("failed to load {:?}", config))?;
    let mut logging = config.logging.clone();
    if verbose {
        logging.level = "debug".into();
    }
    init_logging(&logging)?;

    let local = config.local_node()?;
    let policy = config.policy();
    let database = Arc::new(MemoryDatabase::new());
    GenesisGenerator::new(local.clone(), policy.network_id.clone())
        .generate()?
        .store(&database)
        .await?;

    let peers = config.peers()?;
    if !peers.is_empty() {
        tracing::warn!(
            peers = peers.len(),
            "suffrage members are reachable only inside this process; run `agora cluster` for a network"
        );
    }

    let network = LocalNetwork::new();
    let node = AgoraNode::from_config(&config, network, database)?;
    let mut events = node.subscribe();
    node.start().await?;

    tracing::info!(node = %node.address(), network_id = %policy.network_id, "node running; Ctrl-C to stop");
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            r = &mut ctrl_c => {
                r?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => report(&event),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "state events lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    node.stop().await?;
    Ok(())
}

fn report(event: &StateEvent) {
    match event {
        StateEvent::StateChanged { from, to } => tracing::info!(from = %from, to = %to, "state changed"),
        StateEvent::NewBlocks(blocks) => {
            for block in blocks {
                tracing::info!(
                    height = %block.manifest.height,
                    round = %block.manifest.round,
                    block = %block.hash(),
                    "new block"
                );
            }
        }
        StateEvent::ConsensusStuck => tracing::warn!("consensus stuck"),
        StateEvent::ConsensusReleased => tracing::info!("consensus released"),
    }
}

async fn cluster(nodes: usize, duration: u64, network_id: String, roundrobin: bool, verbose: bool) -> anyhow::Result<()> {
    init_logging(&logging_config(verbose))?;

    let network_id = NetworkId::new(network_id)?;
    let cluster = LocalCluster::new(ClusterConfig::new(nodes, network_id).with_roundrobin(roundrobin)).await?;
    cluster.start().await?;

    tracing::info!(nodes, duration, "cluster running");
    until_done(Duration::from_secs(duration)).await?;

    println!("node\tstate\theight");
    for node in cluster.nodes() {
        println!("{}\t{}\t{}", node.address(), node.state(), node.last_height());
    }
    cluster.stop().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config, cli.verbose).await?,

        Commands::Cluster {
            nodes,
            duration,
            network_id,
            roundrobin,
        } => cluster(nodes, duration, network_id, roundrobin, cli.verbose).await?,

        Commands::Keygen => {
            let key = PrivateKey::generate();
            println!("private key: {}", key);
            println!("public key:  {}", key.public_key());
        }

        Commands::InitConfig => {
            print!("{}", NodeConfig::default().to_toml()?);
        }
    }

    Ok(())
}
