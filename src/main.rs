use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use meshperf::config::{ProbeConfig, CONFIG_ENV};
use meshperf::dispatch::{DispatchClient, Node};
use meshperf::flood::{report, LoadGenerator, TierSelector};
use meshperf::net;

#[derive(Parser)]
#[command(
    name = "meshperf",
    about = "Cluster network probe: tiered throughput and latency flooding between peers",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $MESHPERF_CONFIG, then /etc/meshperf/meshperf.toml)
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the probe server (/perf, /dispatch, /health)
    Serve {
        /// Bind address (overrides network.bind_address)
        #[arg(long)]
        bind: Option<String>,

        /// Peer port (overrides network.peer_port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Flood one target from this node and print the sustained tier
    Flood {
        /// Target node as host:port
        target: String,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Ask a peer to flood a list of targets and print the results
    Dispatch {
        /// Peer node that runs the floods, as host:port
        peer: String,

        /// Target nodes as host:port
        #[arg(required = true)]
        targets: Vec<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<ProbeConfig> {
    match path {
        Some(path) => ProbeConfig::load(path),
        None => Ok(ProbeConfig::load_or_default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_ref())?;
    if let Commands::Serve { bind, port } = &cli.command {
        if let Some(bind) = bind {
            config.network.bind_address = bind.clone();
        }
        if let Some(port) = port {
            config.network.peer_port = *port;
        }
    }
    config.validate().context("invalid configuration")?;

    meshperf::init_tracing(&config.logging);
    let shutdown = meshperf::shutdown_token()?;

    match cli.command {
        Commands::Serve { .. } => {
            tracing::info!(
                bind = %config.network.bind_address,
                port = config.network.peer_port,
                "starting meshperf probe server"
            );
            meshperf::serve(config, shutdown).await?;
        }
        Commands::Flood { target, json } => {
            net::validate_host_port(&target)?;
            tracing::info!(%target, tiers = config.flood.tiers.len(), "flooding target");

            let generator = LoadGenerator::new(&config)?;
            let selector = TierSelector::new(generator, config.flood.tiers.clone());
            let perf = selector
                .probe(&shutdown, &target)
                .await
                .with_context(|| format!("flood against {} failed", target))?;

            if json {
                let mut node = Node::new(target.clone());
                node.perf.insert(target, perf);
                println!("{}", serde_json::to_string_pretty(&node)?);
            } else {
                println!("{}", report::format_summary(&target, &perf));
            }
        }
        Commands::Dispatch {
            peer,
            targets,
            json,
        } => {
            net::validate_host_port(&peer)?;
            for target in &targets {
                net::validate_host_port(target)?;
            }

            let client = DispatchClient::new(&config)?;
            let mut nodes: Vec<Node> = targets.into_iter().map(Node::new).collect();
            client.dispatch(&shutdown, &peer, &mut nodes).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&nodes)?);
            } else {
                println!("Results from {}:", peer);
                println!("{}", report::format_nodes(&nodes));
            }
        }
    }

    Ok(())
}
