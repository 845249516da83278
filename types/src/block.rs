//! Block and transaction records.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::account::AccountId;
use crate::hash::{BlockId, TxHash};
use crate::keys::{PublicKey, Signature};
use crate::BlockNo;

/// A signed transaction as carried in a block body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTx {
    pub hash: TxHash,
    pub account: AccountId,
    pub nonce: u64,
    pub payload: Vec<u8>,
}

impl SignedTx {
    /// Derives the transaction hash from the canonical field encoding.
    pub fn compute_hash(account: AccountId, nonce: u64, payload: &[u8]) -> TxHash {
        let mut hasher = Sha256::new();
        hasher.update(account.as_bytes());
        hasher.update(nonce.to_be_bytes());
        hasher.update(payload);
        TxHash::new(hasher.finalize().into())
    }
}

/// Block header. The producer's public key and signature are attached
/// after assembly; the block hash covers everything but the signature.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockHeader {
    pub block_no: BlockNo,
    pub prev_hash: BlockId,
    /// Unix time in nanoseconds, taken from the production slot.
    pub timestamp: i64,
    pub txs_root: [u8; 32],
    pub pub_key: Option<PublicKey>,
    pub sign: Option<Signature>,
}

impl BlockHeader {
    /// Canonical byte encoding of the signed portion of the header.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 32 + 8 + 32 + 33);
        buf.extend_from_slice(&self.block_no.to_be_bytes());
        buf.extend_from_slice(self.prev_hash.as_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.txs_root);
        if let Some(pk) = &self.pub_key {
            buf.extend_from_slice(pk.as_bytes());
        }
        buf
    }
}

/// Block body: the transactions included by the producer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlockBody {
    pub txs: Vec<SignedTx>,
}

/// A full block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    /// Builds an unsigned block on top of `prev` with the given
    /// transactions and slot timestamp.
    pub fn new(prev_no: BlockNo, prev_hash: BlockId, txs: Vec<SignedTx>, timestamp: i64) -> Self {
        let txs_root = txs_root_hash(&txs);
        Self {
            header: BlockHeader {
                block_no: prev_no + 1,
                prev_hash,
                timestamp,
                txs_root,
                pub_key: None,
                sign: None,
            },
            body: BlockBody { txs },
        }
    }

    /// The genesis block at height 0.
    pub fn genesis(timestamp: i64) -> Self {
        Self {
            header: BlockHeader {
                block_no: 0,
                prev_hash: BlockId::ZERO,
                timestamp,
                txs_root: [0u8; 32],
                pub_key: None,
                sign: None,
            },
            body: BlockBody::default(),
        }
    }

    /// SHA-256 over the header's signable encoding.
    pub fn hash(&self) -> BlockId {
        let mut hasher = Sha256::new();
        hasher.update(self.header.signable_bytes());
        BlockId::new(hasher.finalize().into())
    }

    pub fn block_no(&self) -> BlockNo {
        self.header.block_no
    }
}

/// Merkle-less root over the transaction hashes, in body order.
pub fn txs_root_hash(txs: &[SignedTx]) -> [u8; 32] {
    if txs.is_empty() {
        return [0u8; 32];
    }
    let mut hasher = Sha256::new();
    for tx in txs {
        hasher.update(tx.hash.as_bytes());
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(nonce: u64) -> SignedTx {
        let account = AccountId::new([1u8; 32]);
        SignedTx {
            hash: SignedTx::compute_hash(account, nonce, b"payload"),
            account,
            nonce,
            payload: b"payload".to_vec(),
        }
    }

    #[test]
    fn block_hash_is_deterministic() {
        let a = Block::new(0, BlockId::new([0xAA; 32]), vec![tx(1)], 42);
        let b = Block::new(0, BlockId::new([0xAA; 32]), vec![tx(1)], 42);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn block_hash_changes_with_body() {
        let a = Block::new(0, BlockId::new([0xAA; 32]), vec![tx(1)], 42);
        let b = Block::new(0, BlockId::new([0xAA; 32]), vec![tx(2)], 42);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn genesis_links_to_zero() {
        let g = Block::genesis(0);
        assert_eq!(g.block_no(), 0);
        assert_eq!(g.header.prev_hash, BlockId::ZERO);
    }

    #[test]
    fn empty_body_has_zero_txs_root() {
        assert_eq!(txs_root_hash(&[]), [0u8; 32]);
    }
}
