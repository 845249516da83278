//! Node configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::NodeError;

/// Configuration for a skald node.
///
/// Can be loaded from a TOML file via [`NodeConfig::from_toml_file`] or
/// built programmatically (e.g. for tests). Every field has a default
/// so a partial file works.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory for state and block storage.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Node key file; created on first start when missing. Relative
    /// paths are resolved against `data_dir`.
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,

    /// Interface to listen on for P2P connections.
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,

    /// P2P listen port; 0 picks an ephemeral port.
    #[serde(default = "default_p2p_port")]
    pub listen_port: u16,

    /// Address advertised to peers (defaults to `listen_ip`).
    #[serde(default)]
    pub advertised_ip: Option<String>,

    /// Maximum number of peer connections.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Target size of the candidate peer-address pool.
    #[serde(default = "default_peer_pool_size")]
    pub peer_pool_size: usize,

    /// Designated peers, `/ip4/<ip>/tcp/<port>/p2p/<base58-id>`.
    #[serde(default)]
    pub designated_peers: Vec<String>,

    /// Whether this node produces blocks.
    #[serde(default)]
    pub enable_producer: bool,

    /// Production slot interval in milliseconds.
    #[serde(default = "default_block_interval_ms")]
    pub block_interval_ms: u64,

    /// Per-slot production deadline in milliseconds.
    #[serde(default = "default_bp_timeout_ms")]
    pub bp_timeout_ms: u64,

    /// Hard upper bound on serialized block body size in bytes.
    #[serde(default = "default_max_block_body_bytes")]
    pub max_block_body_bytes: usize,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_data_dir() -> PathBuf {
    PathBuf::from("./skald_data")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("node.key")
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_p2p_port() -> u16 {
    7846
}

fn default_max_peers() -> usize {
    20
}

fn default_peer_pool_size() -> usize {
    50
}

fn default_block_interval_ms() -> u64 {
    1000
}

fn default_bp_timeout_ms() -> u64 {
    500
}

fn default_max_block_body_bytes() -> usize {
    1 << 20
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self, NodeError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| NodeError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// The key file path, resolved against `data_dir` when relative.
    pub fn resolved_key_file(&self) -> PathBuf {
        if self.key_file.is_absolute() {
            self.key_file.clone()
        } else {
            self.data_dir.join(&self.key_file)
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            key_file: default_key_file(),
            listen_ip: default_listen_ip(),
            listen_port: default_p2p_port(),
            advertised_ip: None,
            max_peers: default_max_peers(),
            peer_pool_size: default_peer_pool_size(),
            designated_peers: Vec::new(),
            enable_producer: false,
            block_interval_ms: default_block_interval_ms(),
            bp_timeout_ms: default_bp_timeout_ms(),
            max_block_body_bytes: default_max_block_body_bytes(),
            log_level: default_log_level(),
        }
    }
}
