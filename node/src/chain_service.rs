//! The chain service.
//!
//! Hub-hosted owner of the state engine and the block store. Connects
//! blocks (validate → execute into a block state → apply → advance
//! best), answers block lookups, and announces new blocks to the
//! network.

use std::path::Path;
use std::sync::Arc;

use skald_crypto::verify_block_sign;
use skald_hub::{Delivery, Hub, Mailbox, ServiceMsg, ServiceReply, P2P_SVC};
use skald_state::ChainStateDb;
use skald_store::KvHandle;
use skald_store_lmdb::LmdbEnvironment;
use skald_types::{Block, BlockId, BlockState};

use crate::NodeError;

const NS_BLOCKS: &str = "chain.blocks";
const KEY_BEST: &[u8] = b"best";

/// Timestamp stamped into a freshly created genesis block.
const GENESIS_TIMESTAMP: i64 = 0;

pub struct ChainService {
    state: Arc<ChainStateDb>,
    blocks_kv: KvHandle,
    best: Block,
    hub: Hub,
}

impl ChainService {
    /// Open the block store and the state engine under `data_dir`,
    /// creating and persisting a genesis block on first start.
    pub fn init(data_dir: &Path, hub: Hub) -> Result<Self, NodeError> {
        let env = LmdbEnvironment::open(&data_dir.join("chain"), &[NS_BLOCKS])?;
        let blocks_kv = env.namespace(NS_BLOCKS)?;
        let state = Arc::new(ChainStateDb::init(data_dir)?);
        Self::with_stores(state, blocks_kv, hub)
    }

    /// Build the service over explicit stores (tests use in-memory ones).
    pub fn with_stores(
        state: Arc<ChainStateDb>,
        blocks_kv: KvHandle,
        hub: Hub,
    ) -> Result<Self, NodeError> {
        let best = match Self::load_best(&blocks_kv)? {
            Some(block) => block,
            None => {
                let genesis = Block::genesis(GENESIS_TIMESTAMP);
                let ghash = genesis.hash();
                if state.latest().is_none() {
                    state.set_genesis(ghash)?;
                }
                Self::store_block(&blocks_kv, &genesis)?;
                blocks_kv.set(KEY_BEST, ghash.as_bytes())?;
                tracing::info!(hash = %ghash, "initialized genesis block");
                genesis
            }
        };

        Ok(Self {
            state,
            blocks_kv,
            best,
            hub,
        })
    }

    /// Shared access to the state engine.
    pub fn state(&self) -> Arc<ChainStateDb> {
        Arc::clone(&self.state)
    }

    pub fn best_block(&self) -> &Block {
        &self.best
    }

    /// Drive the service until its mailbox closes. A failed handler
    /// drops the offending message and the loop resumes.
    pub async fn run(mut self, mut mailbox: Mailbox) {
        while let Some(Delivery { msg, reply }) = mailbox.recv().await {
            let response = match msg {
                ServiceMsg::GetBlock { hash } => match self.get_block(&hash) {
                    Ok(block) => ServiceReply::Block(block),
                    Err(e) => {
                        tracing::warn!(error = %e, "block lookup failed, resuming");
                        ServiceReply::Failed(e.to_string())
                    }
                },
                ServiceMsg::GetBestBlock => ServiceReply::BestBlock(self.best.clone()),
                ServiceMsg::AddBlock { block } => match self.connect_block(block).await {
                    Ok(()) => ServiceReply::Done,
                    Err(e) => {
                        tracing::warn!(error = %e, "block connect failed, resuming");
                        ServiceReply::Failed(e.to_string())
                    }
                },
                other => {
                    tracing::warn!(msg = ?other, "chain service received unexpected message");
                    ServiceReply::Failed("unexpected message".to_string())
                }
            };
            if let Some(tx) = reply {
                let _ = tx.send(response);
            }
        }
        tracing::info!("chain service mailbox closed");
    }

    fn get_block(&self, hash: &BlockId) -> Result<Option<Block>, NodeError> {
        match self.blocks_kv.get(hash.as_bytes())? {
            Some(raw) => {
                let block =
                    bincode::deserialize(&raw).map_err(|e| NodeError::Serialization(e.to_string()))?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    /// Validate, execute, and apply one block on top of the current
    /// best, then announce it.
    async fn connect_block(&mut self, block: Block) -> Result<(), NodeError> {
        let hash = block.hash();
        if self.get_block(&hash)?.is_some() {
            tracing::debug!(%hash, "block already connected");
            return Ok(());
        }

        if block.block_no() != self.best.block_no() + 1 {
            return Err(NodeError::InvalidBlock(format!(
                "height {} does not extend best {}",
                block.block_no(),
                self.best.block_no()
            )));
        }
        if block.header.prev_hash != self.best.hash() {
            return Err(NodeError::InvalidBlock(
                "previous hash does not match best block".to_string(),
            ));
        }
        if !verify_block_sign(&block) {
            return Err(NodeError::InvalidBlock(
                "producer signature missing or invalid".to_string(),
            ));
        }

        let bstate = self.execute(&block)?;
        self.state.apply(&bstate)?;

        Self::store_block(&self.blocks_kv, &block)?;
        self.blocks_kv.set(KEY_BEST, hash.as_bytes())?;
        self.best = block;

        tracing::info!(
            no = self.best.block_no(),
            %hash,
            txs = self.best.body.txs.len(),
            root = %hex(&self.state.get_hash()),
            "block connected"
        );

        let _ = self
            .hub
            .tell(
                P2P_SVC,
                ServiceMsg::NotifyNewBlock {
                    no: self.best.block_no(),
                    hash,
                },
            )
            .await;
        Ok(())
    }

    /// Execute the block's transactions into a block state. Contract
    /// execution proper lives outside the core; here every transaction
    /// advances its sender's nonce.
    fn execute(&self, block: &Block) -> Result<BlockState, NodeError> {
        let mut bstate = BlockState::new(
            block.block_no(),
            block.hash(),
            block.header.prev_hash,
        );
        for tx in &block.body.txs {
            if tx.account.is_zero() {
                return Err(NodeError::InvalidBlock(
                    "transaction from the reserved zero account".to_string(),
                ));
            }
            let pre = self.state.get_block_account_clone(&bstate, &tx.account)?;
            let mut post = pre.clone();
            post.nonce += 1;
            bstate.put_account(tx.account, pre, post);
        }
        Ok(bstate)
    }

    fn load_best(blocks_kv: &KvHandle) -> Result<Option<Block>, NodeError> {
        let Some(raw_hash) = blocks_kv.get(KEY_BEST)? else {
            return Ok(None);
        };
        let bytes: [u8; 32] = raw_hash
            .as_slice()
            .try_into()
            .map_err(|_| NodeError::Serialization("corrupt best pointer".to_string()))?;
        let Some(raw) = blocks_kv.get(&bytes)? else {
            return Ok(None);
        };
        let block =
            bincode::deserialize(&raw).map_err(|e| NodeError::Serialization(e.to_string()))?;
        Ok(Some(block))
    }

    fn store_block(blocks_kv: &KvHandle, block: &Block) -> Result<(), NodeError> {
        let raw =
            bincode::serialize(block).map_err(|e| NodeError::Serialization(e.to_string()))?;
        blocks_kv.set(block.hash().as_bytes(), &raw)?;
        Ok(())
    }
}

fn hex(bytes: &[u8; 32]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
