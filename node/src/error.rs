//! Node-level error type.

use thiserror::Error;

use skald_network::NetworkError;
use skald_state::StateError;
use skald_store::StoreError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("key error: {0}")]
    Key(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}
