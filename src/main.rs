use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use skadnode::{HandshakeKind, Node, NodeConfig, PuzzleParams};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum HandshakeArg {
    Puzzle,
    Noop,
}

impl From<HandshakeArg> for HandshakeKind {
    fn from(arg: HandshakeArg) -> Self {
        match arg {
            HandshakeArg::Puzzle => HandshakeKind::Puzzle,
            HandshakeArg::Noop => HandshakeKind::NoOp,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "skadnode")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: String,

    /// Address announced to peers, if different from the bound one.
    #[arg(long)]
    advertise: Option<String>,

    #[arg(short = 'B', long = "bootstrap", value_name = "HOST:PORT")]
    bootstrap: Vec<String>,

    #[arg(long, default_value_t = skadnode::DEFAULT_STATIC_DIFFICULTY)]
    static_difficulty: u32,

    #[arg(long, default_value_t = skadnode::DEFAULT_DYNAMIC_DIFFICULTY)]
    dynamic_difficulty: u32,

    #[arg(long, value_enum, default_value = "puzzle")]
    handshake: HandshakeArg,

    /// Seconds between stale-bucket refreshes; 0 disables.
    #[arg(long, default_value = "1800")]
    refresh_interval: u64,

    /// Seconds between routing table summaries.
    #[arg(short, long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = NodeConfig {
        bind_addr: args.bind,
        advertise_addr: args.advertise,
        puzzle: PuzzleParams::new(args.static_difficulty, args.dynamic_difficulty)
            .context("invalid puzzle difficulty")?,
        handshake: args.handshake.into(),
        refresh_interval_secs: args.refresh_interval,
        bootstrap: args.bootstrap,
        ..NodeConfig::default()
    };

    info!(
        static_difficulty = config.puzzle.static_difficulty,
        dynamic_difficulty = config.puzzle.dynamic_difficulty,
        "generating identity"
    );
    let node = Node::bind(config.clone()).await.context("failed to bind node")?;
    node.start().context("failed to start node")?;
    info!(id = %node.id(), addr = %node.local_addr(), "node running");

    if !config.bootstrap.is_empty() {
        match node.bootstrap(&config.bootstrap).await {
            Ok(connected) => info!(connected, "bootstrap complete"),
            Err(e) => warn!(error = %e, "bootstrap failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let peers = node.peers().await;
                info!(
                    peers = peers.len(),
                    pending_requests = node.pending_requests(),
                    "routing table snapshot"
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
