//! Core data model shared by every skald crate.

pub mod account;
pub mod block;
pub mod error;
pub mod hash;
pub mod keys;
pub mod peer;
pub mod state;

pub use account::{AccountId, AccountState};
pub use block::{Block, BlockBody, BlockHeader, SignedTx};
pub use error::SkaldError;
pub use hash::{BlockId, TxHash};
pub use keys::{KeyPair, PrivateKey, PublicKey, Signature};
pub use peer::{PeerId, PeerMeta, PeerState};
pub use state::{BlockInfo, BlockState, StateEntry};

/// Block height. The genesis block is at height 0 and heights are
/// strictly monotonic along the canonical chain.
pub type BlockNo = u64;
