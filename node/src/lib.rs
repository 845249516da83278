//! Node wiring for skald.
//!
//! Hosts the chain and mempool services on the hub, owns the state
//! engine and block store, and ties the peer manager and block factory
//! into one start/stop lifecycle.

pub mod chain_service;
pub mod config;
pub mod error;
pub mod mempool;
pub mod node;

pub use chain_service::ChainService;
pub use config::NodeConfig;
pub use error::NodeError;
pub use mempool::spawn_mempool_service;
pub use node::Node;
