//! Fixed-depth sparse Merkle trie.
//!
//! An authenticated map from 256-bit keys to 32-byte value hashes,
//! producing a 32-byte root. The all-zero hash denotes an empty
//! subtree, so the empty trie root is the zero hash and writing a zero
//! value deletes a leaf. Interior nodes are stored in a `KvStore` as
//! 64 bytes (left child hash ‖ right child hash) keyed by their own
//! SHA-256 hash; `update` stages nodes in memory and `commit` flushes
//! them.
//!
//! The root depends only on the set of non-empty leaves, never on the
//! order or grouping of past updates.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use thiserror::Error;

use skald_store::{KvHandle, StoreError};

/// Key width in bits; leaves sit at this depth.
const KEY_BITS: usize = 256;

/// Hash of an empty subtree.
const EMPTY: [u8; 32] = [0u8; 32];

#[derive(Debug, Error)]
pub enum TrieError {
    /// Caller violated the sorted-unique-keys contract. This is a
    /// programming error on the caller's side.
    #[error("update keys must be strictly ascending with no duplicates")]
    UnsortedKeys,

    #[error("update called with {keys} keys but {vals} values")]
    LengthMismatch { keys: usize, vals: usize },

    #[error("missing trie node {0}")]
    MissingNode(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Trie {
    store: KvHandle,
    root: [u8; 32],
    /// Nodes produced by updates since the last commit, keyed by hash.
    dirty: HashMap<[u8; 32], [u8; 64]>,
}

impl Trie {
    /// A trie starting from the empty root.
    pub fn new(store: KvHandle) -> Self {
        Self::with_root(store, EMPTY)
    }

    /// A trie resuming from a previously committed root.
    pub fn with_root(store: KvHandle, root: [u8; 32]) -> Self {
        Self {
            store,
            root,
            dirty: HashMap::new(),
        }
    }

    /// The current root hash.
    pub fn root(&self) -> [u8; 32] {
        self.root
    }

    /// Atomically replace the values at `keys` with `vals` and return
    /// the new root. Keys must be pre-sorted in ascending byte order
    /// with no duplicates. A zero value removes the leaf.
    pub fn update(&mut self, keys: &[[u8; 32]], vals: &[[u8; 32]]) -> Result<[u8; 32], TrieError> {
        if keys.len() != vals.len() {
            return Err(TrieError::LengthMismatch {
                keys: keys.len(),
                vals: vals.len(),
            });
        }
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TrieError::UnsortedKeys);
        }
        if keys.is_empty() {
            return Ok(self.root);
        }

        let pairs: Vec<(&[u8; 32], &[u8; 32])> = keys.iter().zip(vals.iter()).collect();
        let root = self.root;
        self.root = self.update_rec(root, &pairs, 0)?;
        Ok(self.root)
    }

    /// Flush dirty nodes to the backing store.
    pub fn commit(&mut self) -> Result<(), TrieError> {
        for (hash, bytes) in self.dirty.drain() {
            self.store.set(&hash, &bytes)?;
        }
        Ok(())
    }

    fn update_rec(
        &mut self,
        node: [u8; 32],
        pairs: &[(&[u8; 32], &[u8; 32])],
        depth: usize,
    ) -> Result<[u8; 32], TrieError> {
        if depth == KEY_BITS {
            // keys are unique, so exactly one pair reaches a leaf
            return Ok(*pairs[0].1);
        }

        let (left, right) = self.children(&node)?;
        let split = pairs.partition_point(|&(key, _)| bit(key, depth) == 0);

        let new_left = if split == 0 {
            left
        } else {
            self.update_rec(left, &pairs[..split], depth + 1)?
        };
        let new_right = if split == pairs.len() {
            right
        } else {
            self.update_rec(right, &pairs[split..], depth + 1)?
        };

        if new_left == EMPTY && new_right == EMPTY {
            return Ok(EMPTY);
        }

        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&new_left);
        bytes[32..].copy_from_slice(&new_right);

        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let hash: [u8; 32] = hasher.finalize().into();

        self.dirty.insert(hash, bytes);
        Ok(hash)
    }

    fn children(&self, node: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), TrieError> {
        if *node == EMPTY {
            return Ok((EMPTY, EMPTY));
        }
        let bytes: [u8; 64] = match self.dirty.get(node) {
            Some(b) => *b,
            None => {
                let raw = self
                    .store
                    .get(node)?
                    .ok_or_else(|| TrieError::MissingNode(hex(node)))?;
                raw.as_slice()
                    .try_into()
                    .map_err(|_| TrieError::MissingNode(hex(node)))?
            }
        };
        let mut left = [0u8; 32];
        let mut right = [0u8; 32];
        left.copy_from_slice(&bytes[..32]);
        right.copy_from_slice(&bytes[32..]);
        Ok((left, right))
    }
}

fn bit(key: &[u8; 32], i: usize) -> u8 {
    (key[i / 8] >> (7 - (i % 8))) & 1
}

fn hex(bytes: &[u8; 32]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use skald_store::MemStore;
    use std::sync::Arc;

    fn empty_trie() -> Trie {
        Trie::new(Arc::new(MemStore::new()))
    }

    fn key(b: u8) -> [u8; 32] {
        [b; 32]
    }

    #[test]
    fn empty_root_is_zero() {
        assert_eq!(empty_trie().root(), EMPTY);
    }

    #[test]
    fn update_changes_root() {
        let mut trie = empty_trie();
        let root = trie.update(&[key(1)], &[key(0xAA)]).unwrap();
        assert_ne!(root, EMPTY);
        assert_eq!(trie.root(), root);
    }

    #[test]
    fn root_depends_only_on_content() {
        let mut one_shot = empty_trie();
        let root_a = one_shot
            .update(&[key(1), key(2)], &[key(0xAA), key(0xBB)])
            .unwrap();

        let mut two_step = empty_trie();
        two_step.update(&[key(2)], &[key(0xBB)]).unwrap();
        let root_b = two_step.update(&[key(1)], &[key(0xAA)]).unwrap();

        assert_eq!(root_a, root_b);
    }

    #[test]
    fn identical_batches_give_identical_roots() {
        let keys = [key(3), key(7), key(9)];
        let vals = [key(1), key(2), key(3)];

        let mut a = empty_trie();
        let mut b = empty_trie();
        assert_eq!(a.update(&keys, &vals).unwrap(), b.update(&keys, &vals).unwrap());
    }

    #[test]
    fn zero_value_deletes_leaf() {
        let mut trie = empty_trie();
        trie.update(&[key(1)], &[key(0xAA)]).unwrap();
        let root = trie.update(&[key(1)], &[EMPTY]).unwrap();
        assert_eq!(root, EMPTY);
    }

    #[test]
    fn delete_one_of_two_matches_single_insert() {
        let mut both = empty_trie();
        both.update(&[key(1), key(2)], &[key(0xAA), key(0xBB)])
            .unwrap();
        let after_delete = both.update(&[key(2)], &[EMPTY]).unwrap();

        let mut single = empty_trie();
        let only_first = single.update(&[key(1)], &[key(0xAA)]).unwrap();

        assert_eq!(after_delete, only_first);
    }

    #[test]
    fn unsorted_keys_are_rejected() {
        let mut trie = empty_trie();
        let err = trie
            .update(&[key(2), key(1)], &[key(0xAA), key(0xBB)])
            .unwrap_err();
        assert!(matches!(err, TrieError::UnsortedKeys));
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut trie = empty_trie();
        let err = trie
            .update(&[key(1), key(1)], &[key(0xAA), key(0xBB)])
            .unwrap_err();
        assert!(matches!(err, TrieError::UnsortedKeys));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut trie = empty_trie();
        let err = trie.update(&[key(1)], &[]).unwrap_err();
        assert!(matches!(err, TrieError::LengthMismatch { .. }));
    }

    #[test]
    fn empty_update_is_a_noop() {
        let mut trie = empty_trie();
        let before = trie.update(&[key(1)], &[key(0xAA)]).unwrap();
        let after = trie.update(&[], &[]).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn commit_then_reopen_resumes_from_root() {
        let store: KvHandle = Arc::new(MemStore::new());

        let mut trie = Trie::new(Arc::clone(&store));
        trie.update(&[key(1), key(2)], &[key(0xAA), key(0xBB)])
            .unwrap();
        trie.commit().unwrap();
        let root = trie.root();

        let mut reopened = Trie::with_root(store, root);
        let after = reopened.update(&[key(2)], &[EMPTY]).unwrap();

        let mut fresh = empty_trie();
        let expected = fresh.update(&[key(1)], &[key(0xAA)]).unwrap();
        assert_eq!(after, expected);
    }

    #[test]
    fn uncommitted_nodes_are_missing_after_reopen() {
        let store: KvHandle = Arc::new(MemStore::new());

        let mut trie = Trie::new(Arc::clone(&store));
        let root = trie.update(&[key(1), key(2)], &[key(0xAA), key(0xBB)]).unwrap();
        // no commit

        let mut reopened = Trie::with_root(store, root);
        let err = reopened.update(&[key(2)], &[EMPTY]).unwrap_err();
        assert!(matches!(err, TrieError::MissingNode(_)));
    }
}
