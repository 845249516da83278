//! Top-level error type shared across crates.

use thiserror::Error;

/// Common error type for cross-crate failures that do not belong to a
/// single subsystem.
#[derive(Debug, Error)]
pub enum SkaldError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SkaldError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
