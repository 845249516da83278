//! In-memory storage backend for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{KvStore, StoreError};

/// HashMap-backed `KvStore`. Not persistent; intended for unit tests
/// and ephemeral tooling.
#[derive(Default)]
pub struct MemStore {
    map: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.map.lock().expect("mem store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let map = self.map.lock().expect("mem store lock poisoned");
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut map = self.map.lock().expect("mem store lock poisoned");
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut map = self.map.lock().expect("mem store lock poisoned");
        map.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let store = MemStore::new();
        assert_eq!(store.get(b"k").unwrap(), None);

        store.set(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));

        store.delete(b"k").unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
    }

    #[test]
    fn overwrite_replaces_value() {
        let store = MemStore::new();
        store.set(b"k", b"v1").unwrap();
        store.set(b"k", b"v2").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.len(), 1);
    }
}
