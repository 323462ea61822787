//! Directory node binary

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vnetdir::transport::HttpTransport;
use vnetdir::{Config, DirectoryNode, MemoryDomainStore, NodeAddr};

#[derive(Parser)]
#[command(name = "vnetdir-node")]
#[command(about = "vnetdir directory node")]
#[command(version = vnetdir::BUILD_INFO)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a directory node
    Serve {
        /// Config file (defaults to ./vnetdir.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Address peers reach this node at; also its cluster identity
        #[arg(long)]
        address: Option<String>,

        /// Bind address for the peer and admin HTTP listener
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Bootstrap peers (comma-separated)
        #[arg(long, value_delimiter = ',')]
        peers: Vec<String>,

        /// Heavy-load threshold in percent
        #[arg(long)]
        heavy_load_threshold: Option<f64>,

        /// Timeout for peer sends, e.g. "2s"
        #[arg(long, default_value = "2s")]
        send_timeout: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            address,
            bind,
            peers,
            heavy_load_threshold,
            send_timeout,
        } => {
            // File and environment first, flags have priority
            let mut config = Config::load_from(config.as_deref())?;
            if let Some(address) = address {
                config.node.address = address;
            }
            if let Some(bind) = bind {
                config.node.bind_addr = bind;
            }
            if !peers.is_empty() {
                config.node.peers = peers;
            }
            if let Some(threshold) = heavy_load_threshold {
                config.placement.heavy_load_threshold = threshold;
            }
            config.validate()?;

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            let local: NodeAddr = config.node.address.parse()?;
            let timeout = vnetdir::common::parse_duration(&send_timeout)?;
            let transport = Arc::new(HttpTransport::new(local, timeout)?);
            let store = Arc::new(MemoryDomainStore::new());

            let node = DirectoryNode::new(config, store, transport)?;
            node.serve().await?;
        }
    }

    Ok(())
}
