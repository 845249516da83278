//! The transaction inclusion pipeline.
//!
//! Each candidate transaction passes through every stage before it is
//! included in the block under assembly. Stages abort inclusion by
//! returning an error: the size guard stops a too-large body, and the
//! deadline probe converts the controller's timeout signal (or the
//! quit signal) into an early seal.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};

use skald_types::SignedTx;

use crate::FactoryError;

/// One stage of the inclusion pipeline.
pub trait TxOp: Send {
    fn apply(&mut self, tx: &SignedTx) -> Result<(), FactoryError>;
}

/// Runs every stage in order, stopping at the first error.
pub struct CompositeTxOp {
    ops: Vec<Box<dyn TxOp>>,
}

impl CompositeTxOp {
    pub fn new(ops: Vec<Box<dyn TxOp>>) -> Self {
        Self { ops }
    }

    /// Dismantle the pipeline, returning its stages in order.
    pub fn into_ops(self) -> Vec<Box<dyn TxOp>> {
        self.ops
    }
}

impl TxOp for CompositeTxOp {
    fn apply(&mut self, tx: &SignedTx) -> Result<(), FactoryError> {
        for op in &mut self.ops {
            op.apply(tx)?;
        }
        Ok(())
    }
}

/// Hard upper bound on the serialized size of the block body.
pub struct BlockLimitOp {
    max_bytes: usize,
    accumulated: usize,
}

impl BlockLimitOp {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            accumulated: 0,
        }
    }
}

impl TxOp for BlockLimitOp {
    fn apply(&mut self, tx: &SignedTx) -> Result<(), FactoryError> {
        let size = bincode::serialized_size(tx)
            .map_err(|e| FactoryError::Serialization(e.to_string()))? as usize;
        if self.accumulated + size > self.max_bytes {
            return Err(FactoryError::BlockLimit);
        }
        self.accumulated += size;
        Ok(())
    }
}

/// Shared receiver for the controller's production-timeout signal.
pub type BpTimeoutRx = Arc<Mutex<mpsc::Receiver<()>>>;

/// Consults the production deadline and the quit signal between
/// transactions. Non-blocking on both.
pub struct DeadlineProbe {
    bp_timeout: BpTimeoutRx,
    quit: watch::Receiver<bool>,
}

impl DeadlineProbe {
    pub fn new(bp_timeout: BpTimeoutRx, quit: watch::Receiver<bool>) -> Self {
        Self { bp_timeout, quit }
    }
}

impl TxOp for DeadlineProbe {
    fn apply(&mut self, _tx: &SignedTx) -> Result<(), FactoryError> {
        check_bp_timeout(&self.bp_timeout, &self.quit)
    }
}

/// Non-blocking poll of the timeout and quit signals. A pending
/// timeout wins over quit being unset; quit produces the sentinel.
pub fn check_bp_timeout(
    bp_timeout: &BpTimeoutRx,
    quit: &watch::Receiver<bool>,
) -> Result<(), FactoryError> {
    if bp_timeout
        .lock()
        .expect("bp timeout receiver lock poisoned")
        .try_recv()
        .is_ok()
    {
        return Err(FactoryError::BlockTimeout);
    }
    if *quit.borrow() {
        return Err(FactoryError::Quit);
    }
    Ok(())
}
