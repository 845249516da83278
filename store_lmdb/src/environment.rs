//! LMDB environment setup.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use skald_store::{KvHandle, KvStore, StoreError};

/// Default LMDB map size: 1 GiB.
const DEFAULT_MAP_SIZE: usize = 1 << 30;

/// Wraps the LMDB environment and its named database handles.
///
/// The environment closes when the last clone of any namespace handle
/// is dropped.
pub struct LmdbEnvironment {
    env: Arc<Env>,
    dbs: HashMap<String, Database<Bytes, Bytes>>,
}

impl LmdbEnvironment {
    /// Open or create an LMDB environment at `path` with one named
    /// database per entry in `namespaces`.
    pub fn open(path: &Path, namespaces: &[&str]) -> Result<Self, StoreError> {
        Self::open_with_map_size(path, namespaces, DEFAULT_MAP_SIZE)
    }

    pub fn open_with_map_size(
        path: &Path,
        namespaces: &[&str],
        map_size: usize,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path)
            .map_err(|e| StoreError::Io(format!("failed to create {}: {e}", path.display())))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .max_dbs(namespaces.len() as u32)
                .map_size(map_size)
                .open(path)
                .map_err(|e| StoreError::Backend(e.to_string()))?
        };

        let mut dbs = HashMap::with_capacity(namespaces.len());
        let mut wtxn = env
            .write_txn()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        for name in namespaces {
            let db = env
                .create_database(&mut wtxn, Some(name))
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            dbs.insert((*name).to_string(), db);
        }
        wtxn.commit()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Self {
            env: Arc::new(env),
            dbs,
        })
    }

    /// Shared `KvStore` handle for a namespace created at open time.
    pub fn namespace(&self, name: &str) -> Result<KvHandle, StoreError> {
        let db = self
            .dbs
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::UnknownNamespace(name.to_string()))?;
        Ok(Arc::new(LmdbKv {
            env: Arc::clone(&self.env),
            db,
        }))
    }
}

/// One named LMDB database exposed through the `KvStore` trait.
pub struct LmdbKv {
    env: Arc<Env>,
    db: Database<Bytes, Bytes>,
}

impl KvStore for LmdbKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let value = self
            .db
            .get(&rtxn, key)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.db
            .put(&mut wtxn, key, value)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.db
            .delete(&mut wtxn, key)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        wtxn.commit()
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("skald-lmdb-{tag}-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        dir
    }

    #[test]
    fn open_and_roundtrip() {
        let dir = temp_dir("roundtrip");
        let env = LmdbEnvironment::open(&dir, &["state", "state.latest"]).expect("open");
        let kv = env.namespace("state").expect("namespace");

        assert_eq!(kv.get(b"k").unwrap(), None);
        kv.set(b"k", b"v").unwrap();
        assert_eq!(kv.get(b"k").unwrap(), Some(b"v".to_vec()));
        kv.delete(b"k").unwrap();
        assert_eq!(kv.get(b"k").unwrap(), None);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn namespaces_are_isolated() {
        let dir = temp_dir("isolated");
        let env = LmdbEnvironment::open(&dir, &["a", "b"]).expect("open");
        let a = env.namespace("a").unwrap();
        let b = env.namespace("b").unwrap();

        a.set(b"k", b"from-a").unwrap();
        assert_eq!(b.get(b"k").unwrap(), None);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unknown_namespace_is_an_error() {
        let dir = temp_dir("unknown");
        let env = LmdbEnvironment::open(&dir, &["a"]).expect("open");
        assert!(matches!(
            env.namespace("missing"),
            Err(StoreError::UnknownNamespace(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn data_survives_reopen() {
        let dir = temp_dir("reopen");
        {
            let env = LmdbEnvironment::open(&dir, &["state"]).expect("open");
            let kv = env.namespace("state").unwrap();
            kv.set(b"persist", b"yes").unwrap();
        }
        {
            let env = LmdbEnvironment::open(&dir, &["state"]).expect("reopen");
            let kv = env.namespace("state").unwrap();
            assert_eq!(kv.get(b"persist").unwrap(), Some(b"yes".to_vec()));
        }
        std::fs::remove_dir_all(&dir).ok();
    }
}
