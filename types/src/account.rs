//! Account identifiers and per-account state records.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte account identifier.
///
/// The all-zero value is reserved and denotes "invalid"; state engine
/// operations reject it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId([u8; 32]);

impl AccountId {
    /// The reserved invalid account id.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId(")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// The state of a single account.
///
/// `Clone` is the structural deep copy used across the state engine's
/// clone-only accessor boundary; no aliasing escapes the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub nonce: u64,
    pub balance: u128,
    pub code_hash: [u8; 32],
}

impl AccountState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this state is structurally empty (a never-touched account).
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance == 0 && self.code_hash == [0u8; 32]
    }

    /// SHA-256 over the canonical field encoding.
    ///
    /// The empty state hashes to the all-zero value, which the trie
    /// treats as leaf deletion.
    pub fn hash(&self) -> [u8; 32] {
        if self.is_empty() {
            return [0u8; 32];
        }
        let mut hasher = Sha256::new();
        hasher.update(self.nonce.to_be_bytes());
        hasher.update(self.balance.to_be_bytes());
        hasher.update(self.code_hash);
        hasher.finalize().into()
    }
}
