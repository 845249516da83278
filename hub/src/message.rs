//! The closed inter-component message catalogue.

use skald_types::{Block, BlockId, BlockNo, PeerId, SignedTx, TxHash};

/// Messages routed between hub services.
#[derive(Debug)]
pub enum ServiceMsg {
    // -- chain service ---------------------------------------------------
    /// Look up a block by hash.
    GetBlock { hash: BlockId },
    /// The current best (latest canonical) block.
    GetBestBlock,
    /// Connect a block to the chain: execute, apply state, advance best.
    AddBlock { block: Block },

    // -- mempool service -------------------------------------------------
    /// Take up to `limit` pending transactions for block assembly.
    GatherTxs { limit: usize },
    /// Drop transactions that were included in a connected block.
    RemoveTxs { hashes: Vec<TxHash> },
    /// Admit transactions received from peers.
    AddTxs { txs: Vec<SignedTx> },
    /// Fetch specific pending transactions by hash.
    GetTxs { hashes: Vec<TxHash> },

    // -- p2p service -----------------------------------------------------
    /// Broadcast a new-block notice to all running peers.
    NotifyNewBlock { no: BlockNo, hash: BlockId },
    /// Ask `to` for the given block bodies.
    GetBlockInfos { to: PeerId, hashes: Vec<BlockId> },
    /// Solicit a peer-address list from `to`.
    GetAddresses { to: PeerId, size: u32, offset: u32 },
}

/// Replies to `ServiceMsg` requests.
#[derive(Debug)]
pub enum ServiceReply {
    /// A block lookup result; `None` means not found.
    Block(Option<Block>),
    /// The current best block.
    BestBlock(Block),
    /// Pending transactions.
    Txs(Vec<SignedTx>),
    /// Generic success.
    Done,
    /// Generic failure with a reason.
    Failed(String),
}
