//! Block factory error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FactoryError {
    /// The distinguished shutdown sentinel. Propagates from the quit
    /// signal through the tx pipeline to terminate both loops.
    #[error("quit")]
    Quit,

    /// The production slot expired before assembly started.
    #[error("slot timeout ({0}ms remaining)")]
    SlotTimeout(i64),

    /// The per-block production deadline fired; the partial block is
    /// sealed with whatever was collected.
    #[error("block production timeout")]
    BlockTimeout,

    /// Including the next transaction would exceed the block body
    /// size limit.
    #[error("block body size limit reached")]
    BlockLimit,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("chain rejected block: {0}")]
    Chain(String),
}
