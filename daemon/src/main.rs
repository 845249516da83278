//! skald daemon: entry point for running a skald node.

use clap::Parser;
use std::path::PathBuf;

use skald_node::{Node, NodeConfig};

#[derive(Parser)]
#[command(name = "skald-daemon", about = "skald chain node daemon")]
struct Cli {
    /// Path to a TOML configuration file. If provided, file settings
    /// are used as the base; CLI flags and env vars override them.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for chain and state storage.
    #[arg(long, env = "SKALD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Node key file path (created on first start when missing).
    #[arg(long, env = "SKALD_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// Interface to listen on for P2P connections.
    #[arg(long, env = "SKALD_LISTEN_IP")]
    listen_ip: Option<String>,

    /// Port for P2P connections.
    #[arg(long, env = "SKALD_P2P_PORT")]
    port: Option<u16>,

    /// Maximum number of peer connections.
    #[arg(long, env = "SKALD_MAX_PEERS")]
    max_peers: Option<usize>,

    /// Designated peer multiaddrs
    /// (comma-separated: "/ip4/1.2.3.4/tcp/7846/p2p/<id>,...").
    #[arg(long, env = "SKALD_ADD_PEERS", value_delimiter = ',')]
    add_peers: Vec<String>,

    /// Enable block production on this node.
    #[arg(long, env = "SKALD_PRODUCER")]
    producer: bool,

    /// Production slot interval in milliseconds.
    #[arg(long, env = "SKALD_BLOCK_INTERVAL_MS")]
    block_interval_ms: Option<u64>,

    /// Log level: "trace", "debug", "info", "warn", "error".
    #[arg(long, default_value = "info", env = "SKALD_LOG_LEVEL")]
    log_level: String,
}

fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut config = match &cli.config {
        Some(path) => {
            let config = NodeConfig::from_toml_file(&path.display().to_string())
                .map_err(|e| anyhow::anyhow!("failed to load config {}: {e}", path.display()))?;
            tracing::info!(path = %path.display(), "loaded configuration file");
            config
        }
        None => NodeConfig::default(),
    };

    // CLI flags and env vars override the file
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(key_file) = cli.key_file {
        config.key_file = key_file;
    }
    if let Some(listen_ip) = cli.listen_ip {
        config.listen_ip = listen_ip;
    }
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    if let Some(max_peers) = cli.max_peers {
        config.max_peers = max_peers;
    }
    if !cli.add_peers.is_empty() {
        config.designated_peers = cli.add_peers;
    }
    if cli.producer {
        config.enable_producer = true;
    }
    if let Some(interval) = cli.block_interval_ms {
        config.block_interval_ms = interval;
    }

    let node = Node::start(config).await?;
    wait_for_termination().await;
    node.stop().await;

    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_termination() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
