//! The block factory: controller and worker loops.
//!
//! The controller consumes slot jobs, enforces the slot deadline, and
//! arms the per-block production timeout. The worker assembles, signs,
//! and hands finished blocks to the chain service. A `watch`-based quit
//! signal terminates both loops; inside the tx pipeline it surfaces as
//! the [`FactoryError::Quit`] sentinel.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};

use skald_crypto::sign_block;
use skald_hub::{Hub, ServiceMsg, ServiceReply, CHAIN_SVC, DEFAULT_REQUEST_TIMEOUT, MEMPOOL_SVC};
use skald_types::{Block, KeyPair, TxHash};

use crate::slot::Slot;
use crate::txop::{check_bp_timeout, BlockLimitOp, BpTimeoutRx, CompositeTxOp, DeadlineProbe, TxOp};
use crate::FactoryError;

/// Capacity of the slot job queue.
const SLOT_QUEUE_MAX: usize = 100;

/// Upper bound on transactions gathered from the mempool per block.
const MAX_TXS_PER_BLOCK: usize = 1000;

/// A block production job: the slot to fill and the block to build on.
#[derive(Clone, Debug)]
pub struct BpInfo {
    pub slot: Slot,
    pub best_block: Block,
}

/// Handle to the running factory loops.
pub struct BlockFactory {
    job_tx: mpsc::Sender<BpInfo>,
    quit_tx: watch::Sender<bool>,
}

impl BlockFactory {
    /// Start the controller and worker with the default tx pipeline
    /// (body size limit + production deadline probe).
    pub fn start(hub: Hub, key_pair: Arc<KeyPair>, max_block_body_bytes: usize) -> Self {
        Self::start_with_op(hub, key_pair, max_block_body_bytes, None)
    }

    /// Start with an additional pipeline stage appended after the
    /// built-in guards (e.g. a gas meter or policy filter).
    pub fn start_with_op(
        hub: Hub,
        key_pair: Arc<KeyPair>,
        max_block_body_bytes: usize,
        extra_op: Option<Box<dyn TxOp>>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel(SLOT_QUEUE_MAX);
        let (worker_tx, worker_rx) = mpsc::channel(1);
        let (bp_timeout_tx, bp_timeout_rx) = mpsc::channel(1);
        let bp_timeout_rx: BpTimeoutRx = Arc::new(Mutex::new(bp_timeout_rx));
        let (quit_tx, quit_rx) = watch::channel(false);

        tokio::spawn(controller(
            job_rx,
            worker_tx,
            bp_timeout_tx,
            Arc::clone(&bp_timeout_rx),
            quit_rx.clone(),
        ));
        tokio::spawn(worker(
            hub,
            key_pair,
            max_block_body_bytes,
            extra_op,
            worker_rx,
            bp_timeout_rx,
            quit_rx,
        ));

        Self { job_tx, quit_tx }
    }

    /// The queue consensus pushes slot jobs into.
    pub fn job_queue(&self) -> mpsc::Sender<BpInfo> {
        self.job_tx.clone()
    }

    /// Submit one production job.
    pub async fn submit(&self, info: BpInfo) {
        let _ = self.job_tx.send(info).await;
    }

    /// Terminate both loops.
    pub fn stop(&self) {
        self.quit_tx.send_replace(true);
    }
}

async fn controller(
    mut job_rx: mpsc::Receiver<BpInfo>,
    worker_tx: mpsc::Sender<BpInfo>,
    bp_timeout_tx: mpsc::Sender<()>,
    bp_timeout_rx: BpTimeoutRx,
    mut quit_rx: watch::Receiver<bool>,
) {
    loop {
        let info = tokio::select! {
            _ = quit_rx.changed() => break,
            job = job_rx.recv() => match job {
                Some(info) => info,
                None => break,
            },
        };

        // drain a stale timeout signal left over from a block that was
        // generated within its deadline; without this an empty block
        // would be sealed immediately
        if let Err(FactoryError::Quit) = check_bp_timeout(&bp_timeout_rx, &quit_rx) {
            break;
        }

        let remaining = info.slot.remaining_time_ms();
        if remaining <= 0 {
            tracing::debug!(remaining, "skip block production: slot timeout");
            continue;
        }

        let bp_timeout = info.slot.bp_timeout();
        match worker_tx.try_send(info) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(info)) => {
                tracing::error!(
                    best = %info.best_block.hash(),
                    "skip block production for the slot due to a pending job"
                );
                continue;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }

        // arm the production deadline for the dispatched job
        tokio::select! {
            _ = quit_rx.changed() => break,
            _ = tokio::time::sleep(bp_timeout) => {
                tracing::debug!(timeout_ms = bp_timeout.as_millis() as u64, "block production timeout");
                let _ = bp_timeout_tx.try_send(());
            }
        }
    }
    tracing::info!("shutdown initiated, stop the block factory controller");
}

async fn worker(
    hub: Hub,
    key_pair: Arc<KeyPair>,
    max_block_body_bytes: usize,
    mut extra_op: Option<Box<dyn TxOp>>,
    mut worker_rx: mpsc::Receiver<BpInfo>,
    bp_timeout_rx: BpTimeoutRx,
    mut quit_rx: watch::Receiver<bool>,
) {
    loop {
        let info = tokio::select! {
            _ = quit_rx.changed() => break,
            job = worker_rx.recv() => match job {
                Some(info) => info,
                None => break,
            },
        };

        let generated = generate_block(
            &hub,
            &key_pair,
            max_block_body_bytes,
            extra_op.take(),
            &bp_timeout_rx,
            &quit_rx,
            &info,
        )
        .await;

        let (block, leftover_op) = match generated {
            Ok(done) => done,
            Err(FactoryError::Quit) => break,
            Err(e) => {
                tracing::info!(error = %e, "failed to produce block");
                continue;
            }
        };
        extra_op = leftover_op;

        connect_block(&hub, block).await;
    }
    tracing::info!("shutdown initiated, stop the block factory worker");
}

/// Assemble and sign one block on top of `info.best_block`.
///
/// Transaction inclusion runs through the pipeline; the production
/// deadline seals a partial body, the quit signal aborts with the
/// sentinel. The extra op is threaded back out so it survives across
/// blocks.
#[allow(clippy::type_complexity)]
async fn generate_block(
    hub: &Hub,
    key_pair: &KeyPair,
    max_block_body_bytes: usize,
    extra_op: Option<Box<dyn TxOp>>,
    bp_timeout_rx: &BpTimeoutRx,
    quit_rx: &watch::Receiver<bool>,
    info: &BpInfo,
) -> Result<(Block, Option<Box<dyn TxOp>>), FactoryError> {
    let candidates = match hub
        .request(
            MEMPOOL_SVC,
            ServiceMsg::GatherTxs {
                limit: MAX_TXS_PER_BLOCK,
            },
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
    {
        Ok(ServiceReply::Txs(txs)) => txs,
        Ok(_) => Vec::new(),
        Err(e) => {
            tracing::debug!(error = %e, "mempool unavailable, producing empty block");
            Vec::new()
        }
    };

    let mut ops: Vec<Box<dyn TxOp>> = vec![
        Box::new(BlockLimitOp::new(max_block_body_bytes)),
        Box::new(DeadlineProbe::new(
            Arc::clone(bp_timeout_rx),
            quit_rx.clone(),
        )),
    ];
    let had_extra = extra_op.is_some();
    if let Some(op) = extra_op {
        ops.push(op);
    }
    let mut pipeline = CompositeTxOp::new(ops);

    let mut included = Vec::with_capacity(candidates.len());
    for tx in candidates {
        match pipeline.apply(&tx) {
            Ok(()) => included.push(tx),
            Err(FactoryError::Quit) => return Err(FactoryError::Quit),
            Err(FactoryError::BlockTimeout) => {
                tracing::debug!(included = included.len(), "deadline hit, sealing partial block");
                break;
            }
            Err(FactoryError::BlockLimit) => {
                tracing::debug!(included = included.len(), "body size limit hit, sealing block");
                break;
            }
            Err(e) => return Err(e),
        }
    }

    let mut block = Block::new(
        info.best_block.block_no(),
        info.best_block.hash(),
        included,
        info.slot.unix_nanos(),
    );
    sign_block(&mut block, key_pair);

    tracing::info!(
        no = block.block_no(),
        hash = %block.hash(),
        txs = block.body.txs.len(),
        "block produced"
    );

    let leftover = if had_extra {
        pipeline.into_ops().pop()
    } else {
        None
    };
    Ok((block, leftover))
}

/// Hand a finished block to the chain layer and release its
/// transactions from the mempool.
async fn connect_block(hub: &Hub, block: Block) {
    let tx_hashes: Vec<TxHash> = block.body.txs.iter().map(|tx| tx.hash).collect();
    match hub
        .request(
            CHAIN_SVC,
            ServiceMsg::AddBlock { block },
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await
    {
        Ok(ServiceReply::Done) => {
            if !tx_hashes.is_empty() {
                let _ = hub
                    .tell(MEMPOOL_SVC, ServiceMsg::RemoveTxs { hashes: tx_hashes })
                    .await;
            }
        }
        Ok(ServiceReply::Failed(e)) => {
            tracing::warn!(error = %e, "chain service rejected produced block");
        }
        Ok(other) => {
            tracing::warn!(reply = ?other, "unexpected reply connecting block");
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to hand block to the chain service");
        }
    }
}
