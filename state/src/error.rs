//! State engine error type.

use thiserror::Error;

use skald_store::StoreError;
use skald_trie::TrieError;
use skald_types::{BlockId, BlockNo};

#[derive(Debug, Error)]
pub enum StateError {
    /// The reserved zero account id was passed to an accessor.
    #[error("invalid account id")]
    InvalidAccountId,

    #[error("no genesis block has been set")]
    NoGenesis,

    #[error("genesis block is already set")]
    GenesisAlreadySet,

    #[error("apply block no mismatch: latest={latest}, got={got}")]
    BlockNoMismatch { latest: BlockNo, got: BlockNo },

    #[error("apply previous hash mismatch: latest={latest}, got={got}")]
    PrevHashMismatch { latest: BlockId, got: BlockId },

    #[error("rollback target {target} is not below latest {latest}")]
    InvalidRollbackTarget { target: BlockNo, latest: BlockNo },

    #[error("missing block state record for {0}")]
    MissingBlockState(BlockId),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Trie(#[from] TrieError),
}
