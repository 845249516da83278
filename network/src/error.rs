//! Network error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("frame of {0} bytes exceeds the message size limit")]
    OversizedFrame(usize),

    #[error("invalid envelope signature")]
    InvalidSignature,

    #[error("envelope identity mismatch: pubkey derives {derived}, envelope claims {claimed}")]
    IdentityMismatch { derived: String, claimed: String },

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("peer send queue closed")]
    ChannelClosed,

    #[error("invalid listen address: {0}")]
    InvalidListenAddr(String),
}
