//! Block-level state deltas: the unit of apply/rollback in the state engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::account::{AccountId, AccountState};
use crate::hash::BlockId;
use crate::BlockNo;

/// Position of a block in the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub no: BlockNo,
    pub hash: BlockId,
    pub prev_hash: BlockId,
}

impl BlockInfo {
    pub fn new(no: BlockNo, hash: BlockId, prev_hash: BlockId) -> Self {
        Self {
            no,
            hash,
            prev_hash,
        }
    }
}

/// Post/pre pair for one account touched by a block.
///
/// `pre` is `None` when the account was absent (or structurally empty)
/// before the block, which is exactly the information rollback needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub post: AccountState,
    pub pre: Option<AccountState>,
}

impl StateEntry {
    /// Normalizes a structurally empty `pre` to `None`.
    pub fn new(post: AccountState, pre: Option<AccountState>) -> Self {
        let pre = pre.filter(|s| !s.is_empty());
        Self { post, pre }
    }
}

/// The complete set of account-level changes produced by one block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockState {
    pub info: BlockInfo,
    pub accounts: HashMap<AccountId, StateEntry>,
}

impl BlockState {
    pub fn new(no: BlockNo, hash: BlockId, prev_hash: BlockId) -> Self {
        Self {
            info: BlockInfo::new(no, hash, prev_hash),
            accounts: HashMap::new(),
        }
    }

    /// Record a delta for `aid`. If the account was already touched by
    /// this block only `post` is updated; the original `pre` image is
    /// preserved so rollback reverts to the state before the block.
    pub fn put_account(&mut self, aid: AccountId, pre: AccountState, post: AccountState) {
        match self.accounts.get_mut(&aid) {
            Some(entry) => entry.post = post,
            None => {
                self.accounts.insert(aid, StateEntry::new(post, Some(pre)));
            }
        }
    }

    /// Account ids touched by this block, sorted ascending by raw bytes.
    /// This is the canonical key order fed to the trie.
    pub fn sorted_account_ids(&self) -> Vec<AccountId> {
        let mut ids: Vec<AccountId> = self.accounts.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aid(b: u8) -> AccountId {
        AccountId::new([b; 32])
    }

    fn state(balance: u128) -> AccountState {
        AccountState {
            nonce: 0,
            balance,
            code_hash: [0u8; 32],
        }
    }

    #[test]
    fn empty_pre_is_normalized_to_none() {
        let entry = StateEntry::new(state(10), Some(AccountState::new()));
        assert!(entry.pre.is_none());

        let entry = StateEntry::new(state(10), Some(state(5)));
        assert_eq!(entry.pre, Some(state(5)));
    }

    #[test]
    fn put_account_preserves_original_pre() {
        let mut bs = BlockState::new(1, BlockId::new([1u8; 32]), BlockId::new([0xAA; 32]));
        bs.put_account(aid(1), state(100), state(80));
        bs.put_account(aid(1), state(80), state(60));

        let entry = &bs.accounts[&aid(1)];
        assert_eq!(entry.post, state(60));
        assert_eq!(entry.pre, Some(state(100)));
    }

    #[test]
    fn sorted_account_ids_are_byte_ordered() {
        let mut bs = BlockState::new(1, BlockId::ZERO, BlockId::ZERO);
        bs.put_account(aid(3), AccountState::new(), state(1));
        bs.put_account(aid(1), AccountState::new(), state(1));
        bs.put_account(aid(2), AccountState::new(), state(1));

        assert_eq!(bs.sorted_account_ids(), vec![aid(1), aid(2), aid(3)]);
    }
}
