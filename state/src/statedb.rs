//! The chain state database.
//!
//! One write-or-read lock guards every public operation; `apply` and
//! `rollback` hold the write lock for their whole duration so readers
//! always observe a consistent snapshot.
//!
//! KV layout (three namespaces under the state directory):
//! - `state`: trie nodes plus persisted block-state records (keyed by
//!   `b'b' ‖ block hash`)
//! - `state.accounts`: account snapshots keyed by raw `AccountId`,
//!   with a key index under `b"index"`
//! - `state.latest`: the single latest-pointer record

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use skald_store::KvHandle;
use skald_store_lmdb::LmdbEnvironment;
use skald_trie::Trie;
use skald_types::{AccountId, AccountState, BlockId, BlockInfo, BlockNo, BlockState};

use crate::StateError;

const NS_STATE: &str = "state";
const NS_ACCOUNTS: &str = "state.accounts";
const NS_LATEST: &str = "state.latest";

const KEY_LATEST: &[u8] = b"latest";
const KEY_ACCOUNT_INDEX: &[u8] = b"index";
const BLOCK_STATE_PREFIX: u8 = b'b';

/// Latest-pointer record: block position plus the committed trie root,
/// so `init` can resume the trie where the last flush left it.
#[derive(Serialize, Deserialize)]
struct LatestRecord {
    info: BlockInfo,
    trie_root: [u8; 32],
}

/// The account-state database.
pub struct ChainStateDb {
    inner: RwLock<Inner>,
}

struct Inner {
    accounts: HashMap<AccountId, AccountState>,
    trie: Trie,
    latest: Option<BlockInfo>,
    state_kv: KvHandle,
    accounts_kv: KvHandle,
    latest_kv: KvHandle,
}

impl ChainStateDb {
    /// Open (or create) the engine's LMDB environment under
    /// `data_dir/state` and restore the latest pointer, the account
    /// map, and the trie root.
    pub fn init(data_dir: &Path) -> Result<Self, StateError> {
        let env = LmdbEnvironment::open(&data_dir.join("state"), &[NS_STATE, NS_ACCOUNTS, NS_LATEST])?;
        Self::with_stores(
            env.namespace(NS_STATE)?,
            env.namespace(NS_ACCOUNTS)?,
            env.namespace(NS_LATEST)?,
        )
    }

    /// Build the engine over explicit namespace handles. Used by
    /// `init` and by tests with in-memory stores.
    pub fn with_stores(
        state_kv: KvHandle,
        accounts_kv: KvHandle,
        latest_kv: KvHandle,
    ) -> Result<Self, StateError> {
        let latest_record: Option<LatestRecord> = match latest_kv.get(KEY_LATEST)? {
            Some(raw) => {
                Some(bincode::deserialize(&raw).map_err(|e| StateError::Serialization(e.to_string()))?)
            }
            None => None,
        };

        let mut accounts = HashMap::new();
        if let Some(raw) = accounts_kv.get(KEY_ACCOUNT_INDEX)? {
            let index: Vec<AccountId> =
                bincode::deserialize(&raw).map_err(|e| StateError::Serialization(e.to_string()))?;
            for aid in index {
                let state = match accounts_kv.get(aid.as_bytes())? {
                    Some(raw) => bincode::deserialize(&raw)
                        .map_err(|e| StateError::Serialization(e.to_string()))?,
                    None => AccountState::new(),
                };
                accounts.insert(aid, state);
            }
        }

        let (latest, trie) = match latest_record {
            Some(rec) => (
                Some(rec.info),
                Trie::with_root(state_kv.clone(), rec.trie_root),
            ),
            None => (None, Trie::new(state_kv.clone())),
        };

        tracing::debug!(
            accounts = accounts.len(),
            latest_no = latest.as_ref().map(|l| l.no),
            "state engine initialized"
        );

        Ok(Self {
            inner: RwLock::new(Inner {
                accounts,
                trie,
                latest,
                state_kv,
                accounts_kv,
                latest_kv,
            }),
        })
    }

    /// Persist the full account snapshot and the latest pointer.
    /// The backing environment closes when the engine is dropped.
    pub fn close(&self) -> Result<(), StateError> {
        let mut inner = self.write();
        let all: Vec<AccountId> = inner.accounts.keys().copied().collect();
        inner.persist_accounts(&all)?;
        inner.persist_latest()
    }

    /// Record the genesis block: `latest = (0, hash(block), 0)` with an
    /// empty persisted block-state so rollback is total down to height 0.
    pub fn set_genesis(&self, genesis_hash: BlockId) -> Result<(), StateError> {
        let mut inner = self.write();
        if inner.latest.is_some() {
            return Err(StateError::GenesisAlreadySet);
        }
        let info = BlockInfo::new(0, genesis_hash, BlockId::ZERO);
        let bstate = BlockState::new(0, genesis_hash, BlockId::ZERO);
        inner.save_block_state(&bstate)?;
        inner.latest = Some(info);
        inner.persist_latest()
    }

    /// Deep copy of the current state of `aid`, creating an empty entry
    /// if the account has never been touched.
    pub fn get_account_state_clone(&self, aid: &AccountId) -> Result<AccountState, StateError> {
        if aid.is_zero() {
            return Err(StateError::InvalidAccountId);
        }
        let mut inner = self.write();
        Ok(inner.accounts.entry(*aid).or_default().clone())
    }

    /// Deep copy of `aid` as seen by the pending block state `bs`:
    /// the in-block `post` image if the block already touched the
    /// account, otherwise the current engine state.
    pub fn get_block_account_clone(
        &self,
        bs: &BlockState,
        aid: &AccountId,
    ) -> Result<AccountState, StateError> {
        if aid.is_zero() {
            return Err(StateError::InvalidAccountId);
        }
        if let Some(entry) = bs.accounts.get(aid) {
            return Ok(entry.post.clone());
        }
        let mut inner = self.write();
        Ok(inner.accounts.entry(*aid).or_default().clone())
    }

    /// Commit a block-level delta: persist it, fold the post images
    /// into the account map, advance the trie, and move the latest
    /// pointer. The block must extend the current latest block.
    pub fn apply(&self, bstate: &BlockState) -> Result<(), StateError> {
        let mut inner = self.write();
        let latest = inner.latest.clone().ok_or(StateError::NoGenesis)?;

        if bstate.info.no != latest.no + 1 {
            return Err(StateError::BlockNoMismatch {
                latest: latest.no,
                got: bstate.info.no,
            });
        }
        if bstate.info.prev_hash != latest.hash {
            return Err(StateError::PrevHashMismatch {
                latest: latest.hash,
                got: bstate.info.prev_hash,
            });
        }

        inner.save_block_state(bstate)?;
        inner.update_trie(bstate, false)?;
        for (aid, entry) in &bstate.accounts {
            inner.accounts.insert(*aid, entry.post.clone());
        }
        inner.latest = Some(bstate.info.clone());

        let touched: Vec<AccountId> = bstate.accounts.keys().copied().collect();
        inner.persist_accounts(&touched)?;
        inner.persist_latest()?;

        tracing::debug!(no = bstate.info.no, hash = %bstate.info.hash, "applied block state");
        Ok(())
    }

    /// Revert deltas block by block until `target_no` is the latest
    /// block. The block at `target_no` itself is kept; rolling back to
    /// 0 restores the genesis snapshot.
    pub fn rollback(&self, target_no: BlockNo) -> Result<(), StateError> {
        let mut inner = self.write();
        let latest = inner.latest.clone().ok_or(StateError::NoGenesis)?;
        if target_no >= latest.no {
            return Err(StateError::InvalidRollbackTarget {
                target: target_no,
                latest: latest.no,
            });
        }

        let mut touched: Vec<AccountId> = Vec::new();
        while inner.latest.as_ref().map(|l| l.no).unwrap_or(0) > target_no {
            let current_hash = inner.latest.as_ref().map(|l| l.hash).unwrap_or(BlockId::ZERO);
            let bstate = inner.load_block_state(&current_hash)?;

            for (aid, entry) in &bstate.accounts {
                let reverted = entry.pre.clone().unwrap_or_default();
                inner.accounts.insert(*aid, reverted);
                touched.push(*aid);
            }
            inner.update_trie(&bstate, true)?;

            let prev = inner.load_block_state(&bstate.info.prev_hash)?;
            inner.latest = Some(prev.info);
        }

        inner.persist_accounts(&touched)?;
        inner.persist_latest()?;

        tracing::debug!(target = target_no, "rolled back block states");
        Ok(())
    }

    /// The current trie root.
    pub fn get_hash(&self) -> [u8; 32] {
        self.read().trie.root()
    }

    /// The latest applied block, if genesis has been set.
    pub fn latest(&self) -> Option<BlockInfo> {
        self.read().latest.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("state lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("state lock poisoned")
    }
}

impl Inner {
    fn block_state_key(hash: &BlockId) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + 32);
        key.push(BLOCK_STATE_PREFIX);
        key.extend_from_slice(hash.as_bytes());
        key
    }

    fn save_block_state(&mut self, bstate: &BlockState) -> Result<(), StateError> {
        let raw =
            bincode::serialize(bstate).map_err(|e| StateError::Serialization(e.to_string()))?;
        self.state_kv.set(&Self::block_state_key(&bstate.info.hash), &raw)?;
        Ok(())
    }

    fn load_block_state(&self, hash: &BlockId) -> Result<BlockState, StateError> {
        let raw = self
            .state_kv
            .get(&Self::block_state_key(hash))?
            .ok_or(StateError::MissingBlockState(*hash))?;
        bincode::deserialize(&raw).map_err(|e| StateError::Serialization(e.to_string()))
    }

    /// Feed the trie the touched accounts in canonical (ascending raw
    /// byte) key order. `undo` selects the pre images; an absent pre is
    /// the empty state, whose zero hash deletes the leaf. The trie is
    /// flushed unconditionally so every committed block ends durable.
    fn update_trie(&mut self, bstate: &BlockState, undo: bool) -> Result<(), StateError> {
        let ids = bstate.sorted_account_ids();
        let keys: Vec<[u8; 32]> = ids.iter().map(|aid| *aid.as_bytes()).collect();
        let vals: Vec<[u8; 32]> = ids
            .iter()
            .map(|aid| {
                let entry = &bstate.accounts[aid];
                if undo {
                    entry.pre.as_ref().map(|s| s.hash()).unwrap_or([0u8; 32])
                } else {
                    entry.post.hash()
                }
            })
            .collect();

        self.trie.update(&keys, &vals)?;
        self.trie.commit()?;
        Ok(())
    }

    fn persist_accounts(&mut self, touched: &[AccountId]) -> Result<(), StateError> {
        for aid in touched {
            if let Some(state) = self.accounts.get(aid) {
                let raw = bincode::serialize(state)
                    .map_err(|e| StateError::Serialization(e.to_string()))?;
                self.accounts_kv.set(aid.as_bytes(), &raw)?;
            }
        }
        let index: Vec<AccountId> = self.accounts.keys().copied().collect();
        let raw =
            bincode::serialize(&index).map_err(|e| StateError::Serialization(e.to_string()))?;
        self.accounts_kv.set(KEY_ACCOUNT_INDEX, &raw)?;
        Ok(())
    }

    fn persist_latest(&mut self) -> Result<(), StateError> {
        let Some(info) = self.latest.clone() else {
            return Ok(());
        };
        let record = LatestRecord {
            info,
            trie_root: self.trie.root(),
        };
        let raw =
            bincode::serialize(&record).map_err(|e| StateError::Serialization(e.to_string()))?;
        self.latest_kv.set(KEY_LATEST, &raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skald_store::MemStore;
    use std::sync::Arc;

    fn fresh_engine() -> ChainStateDb {
        ChainStateDb::with_stores(
            Arc::new(MemStore::new()),
            Arc::new(MemStore::new()),
            Arc::new(MemStore::new()),
        )
        .expect("engine")
    }

    fn aid(b: u8) -> AccountId {
        AccountId::new([b; 32])
    }

    fn bid(b: u8) -> BlockId {
        BlockId::new([b; 32])
    }

    fn balance(v: u128) -> AccountState {
        AccountState {
            nonce: 0,
            balance: v,
            code_hash: [0u8; 32],
        }
    }

    /// Genesis at hash 0xAA..AA, then two accounts created in block 1.
    fn engine_with_block_one() -> (ChainStateDb, [u8; 32]) {
        let db = fresh_engine();
        db.set_genesis(bid(0xAA)).unwrap();

        let mut bs1 = BlockState::new(1, bid(0x01), bid(0xAA));
        bs1.put_account(aid(1), AccountState::new(), balance(100));
        bs1.put_account(aid(2), AccountState::new(), balance(50));
        db.apply(&bs1).unwrap();
        let root1 = db.get_hash();
        (db, root1)
    }

    #[test]
    fn genesis_sets_latest_and_keeps_empty_root() {
        let db = fresh_engine();
        db.set_genesis(bid(0xAA)).unwrap();

        let latest = db.latest().unwrap();
        assert_eq!(latest.no, 0);
        assert_eq!(latest.hash, bid(0xAA));
        assert_eq!(db.get_hash(), [0u8; 32]);
    }

    #[test]
    fn double_genesis_is_rejected() {
        let db = fresh_engine();
        db.set_genesis(bid(0xAA)).unwrap();
        assert!(matches!(
            db.set_genesis(bid(0xBB)),
            Err(StateError::GenesisAlreadySet)
        ));
    }

    #[test]
    fn apply_then_rollback_restores_previous_root_and_accounts() {
        let (db, root1) = engine_with_block_one();

        let mut bs2 = BlockState::new(2, bid(0x02), bid(0x01));
        bs2.put_account(aid(1), balance(100), balance(70));
        db.apply(&bs2).unwrap();
        let root2 = db.get_hash();
        assert_ne!(root2, root1);

        db.rollback(1).unwrap();
        assert_eq!(db.get_hash(), root1);
        assert_eq!(db.get_account_state_clone(&aid(1)).unwrap(), balance(100));

        db.rollback(0).unwrap();
        assert!(db.get_account_state_clone(&aid(1)).unwrap().is_empty());
        assert_eq!(db.get_hash(), [0u8; 32]);
        assert_eq!(db.latest().unwrap().no, 0);
    }

    #[test]
    fn apply_height_mismatch_leaves_engine_unchanged() {
        let db = fresh_engine();
        db.set_genesis(bid(0xAA)).unwrap();
        let genesis_root = db.get_hash();

        let mut bs = BlockState::new(2, bid(0x02), bid(0xAA));
        bs.put_account(aid(1), AccountState::new(), balance(1));
        let err = db.apply(&bs).unwrap_err();
        assert!(matches!(err, StateError::BlockNoMismatch { latest: 0, got: 2 }));

        assert_eq!(db.get_hash(), genesis_root);
        assert_eq!(db.latest().unwrap().no, 0);
    }

    #[test]
    fn apply_prev_hash_mismatch_is_rejected() {
        let db = fresh_engine();
        db.set_genesis(bid(0xAA)).unwrap();

        let mut bs = BlockState::new(1, bid(0x01), bid(0xBB));
        bs.put_account(aid(1), AccountState::new(), balance(1));
        assert!(matches!(
            db.apply(&bs),
            Err(StateError::PrevHashMismatch { .. })
        ));
    }

    #[test]
    fn apply_without_genesis_is_rejected() {
        let db = fresh_engine();
        let bs = BlockState::new(1, bid(0x01), bid(0xAA));
        assert!(matches!(db.apply(&bs), Err(StateError::NoGenesis)));
    }

    #[test]
    fn rollback_target_must_be_below_latest() {
        let (db, _) = engine_with_block_one();
        assert!(matches!(
            db.rollback(1),
            Err(StateError::InvalidRollbackTarget { target: 1, latest: 1 })
        ));
        assert!(matches!(
            db.rollback(7),
            Err(StateError::InvalidRollbackTarget { .. })
        ));
    }

    #[test]
    fn same_blocks_give_identical_roots_on_independent_engines() {
        let (_, root_a) = engine_with_block_one();
        let (_, root_b) = engine_with_block_one();
        assert_eq!(root_a, root_b);
    }

    #[test]
    fn applied_posts_are_observable_as_clones() {
        let (db, _) = engine_with_block_one();
        assert_eq!(db.get_account_state_clone(&aid(1)).unwrap(), balance(100));
        assert_eq!(db.get_account_state_clone(&aid(2)).unwrap(), balance(50));
    }

    #[test]
    fn clone_accessors_reject_zero_id() {
        let db = fresh_engine();
        assert!(matches!(
            db.get_account_state_clone(&AccountId::ZERO),
            Err(StateError::InvalidAccountId)
        ));
        let bs = BlockState::new(1, bid(1), bid(0xAA));
        assert!(matches!(
            db.get_block_account_clone(&bs, &AccountId::ZERO),
            Err(StateError::InvalidAccountId)
        ));
    }

    #[test]
    fn block_account_clone_prefers_pending_post() {
        let (db, _) = engine_with_block_one();

        let mut bs2 = BlockState::new(2, bid(0x02), bid(0x01));
        bs2.put_account(aid(1), balance(100), balance(70));

        assert_eq!(db.get_block_account_clone(&bs2, &aid(1)).unwrap(), balance(70));
        // untouched by the pending block: falls through to the engine
        assert_eq!(db.get_block_account_clone(&bs2, &aid(2)).unwrap(), balance(50));
    }

    #[test]
    fn returned_clone_does_not_alias_engine_state() {
        let (db, _) = engine_with_block_one();
        let mut clone = db.get_account_state_clone(&aid(1)).unwrap();
        clone.balance = 1;
        assert_eq!(db.get_account_state_clone(&aid(1)).unwrap(), balance(100));
    }

    #[test]
    fn reopening_with_same_stores_restores_state() {
        let state_kv: KvHandle = Arc::new(MemStore::new());
        let accounts_kv: KvHandle = Arc::new(MemStore::new());
        let latest_kv: KvHandle = Arc::new(MemStore::new());

        let root = {
            let db = ChainStateDb::with_stores(
                state_kv.clone(),
                accounts_kv.clone(),
                latest_kv.clone(),
            )
            .unwrap();
            db.set_genesis(bid(0xAA)).unwrap();
            let mut bs1 = BlockState::new(1, bid(0x01), bid(0xAA));
            bs1.put_account(aid(1), AccountState::new(), balance(42));
            db.apply(&bs1).unwrap();
            db.get_hash()
        };

        let db = ChainStateDb::with_stores(state_kv, accounts_kv, latest_kv).unwrap();
        assert_eq!(db.get_hash(), root);
        assert_eq!(db.latest().unwrap().no, 1);
        assert_eq!(db.get_account_state_clone(&aid(1)).unwrap(), balance(42));

        // the reopened engine can still roll back through the log
        db.rollback(0).unwrap();
        assert_eq!(db.get_hash(), [0u8; 32]);
    }

    #[test]
    fn multi_block_rollback_walks_the_full_log() {
        let db = fresh_engine();
        db.set_genesis(bid(0xAA)).unwrap();

        let mut prev = bid(0xAA);
        let mut roots = vec![db.get_hash()];
        for no in 1..=4u8 {
            let hash = bid(no);
            let mut bs = BlockState::new(no as u64, hash, prev);
            let before = db.get_account_state_clone(&aid(1)).unwrap();
            bs.put_account(aid(1), before, balance(no as u128 * 10));
            db.apply(&bs).unwrap();
            roots.push(db.get_hash());
            prev = hash;
        }

        db.rollback(2).unwrap();
        assert_eq!(db.get_hash(), roots[2]);
        assert_eq!(db.get_account_state_clone(&aid(1)).unwrap(), balance(20));
        assert_eq!(db.latest().unwrap().no, 2);
    }
}
