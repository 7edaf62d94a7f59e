//! The commitment store: the durable, content-addressed backing for nodes
//! once they leave the buffer pool (§4.5).
//!
//! Trimmed from the reference's `NodeStore` trait down to the byte-level
//! `get`/`set`/`delete` operations this core actually needs — epoch
//! sharding, block indices, and pruning-by-epoch belong to a host
//! application layered on top, not to the tree itself.

use crate::error::{Error, Result};
use crate::node_key::NodeKey;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

/// Durable storage for serialized nodes, keyed by [`NodeKey`].
pub trait CommitmentStore: Send + Sync {
    fn get(&self, key: NodeKey) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: NodeKey, value: Vec<u8>) -> Result<()>;
    fn delete(&self, key: NodeKey) -> Result<()>;
}

/// An in-memory [`CommitmentStore`], used by tests and for ephemeral trees.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<[u8; NodeKey::ENCODED_LEN], Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("memory store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CommitmentStore for MemoryStore {
    fn get(&self, key: NodeKey) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.read().expect("memory store lock poisoned");
        Ok(inner.get(&key.to_bytes()).cloned())
    }

    fn set(&self, key: NodeKey, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.write().expect("memory store lock poisoned");
        inner.insert(key.to_bytes(), value);
        Ok(())
    }

    fn delete(&self, key: NodeKey) -> Result<()> {
        let mut inner = self.inner.write().expect("memory store lock poisoned");
        inner.remove(&key.to_bytes());
        Ok(())
    }
}

const NODES_TABLE: redb::TableDefinition<&[u8], &[u8]> =
    redb::TableDefinition::new("cowavl_nodes");

/// A [`CommitmentStore`] backed by a single `redb` table, trimmed from the
/// reference's epoch-sharded store down to one table since this core has no
/// concept of epochs of its own.
pub struct RedbStore {
    db: redb::Database,
    // redb transactions are not `Sync`-safe to interleave; serialize writers.
    write_lock: Mutex<()>,
}

impl RedbStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = redb::Database::create(path).map_err(|e| Error::IoFailure(e.to_string()))?;
        let write_txn = db.begin_write().map_err(|e| Error::IoFailure(e.to_string()))?;
        {
            write_txn
                .open_table(NODES_TABLE)
                .map_err(|e| Error::IoFailure(e.to_string()))?;
        }
        write_txn.commit().map_err(|e| Error::IoFailure(e.to_string()))?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }
}

impl CommitmentStore for RedbStore {
    fn get(&self, key: NodeKey) -> Result<Option<Vec<u8>>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::IoFailure(e.to_string()))?;
        let table = read_txn
            .open_table(NODES_TABLE)
            .map_err(|e| Error::IoFailure(e.to_string()))?;
        let bytes = key.to_bytes();
        let value = table
            .get(bytes.as_slice())
            .map_err(|e| Error::IoFailure(e.to_string()))?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn set(&self, key: NodeKey, value: Vec<u8>) -> Result<()> {
        let _guard = self.write_lock.lock().expect("redb write lock poisoned");
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::IoFailure(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(NODES_TABLE)
                .map_err(|e| Error::IoFailure(e.to_string()))?;
            let bytes = key.to_bytes();
            table
                .insert(bytes.as_slice(), value.as_slice())
                .map_err(|e| Error::IoFailure(e.to_string()))?;
        }
        write_txn.commit().map_err(|e| Error::IoFailure(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: NodeKey) -> Result<()> {
        let _guard = self.write_lock.lock().expect("redb write lock poisoned");
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::IoFailure(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(NODES_TABLE)
                .map_err(|e| Error::IoFailure(e.to_string()))?;
            let bytes = key.to_bytes();
            table
                .remove(bytes.as_slice())
                .map_err(|e| Error::IoFailure(e.to_string()))?;
        }
        write_txn.commit().map_err(|e| Error::IoFailure(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryStore::new();
        let key = NodeKey::new(1, 1);
        assert!(store.get(key).unwrap().is_none());
        store.set(key, vec![1, 2, 3]).unwrap();
        assert_eq!(store.get(key).unwrap(), Some(vec![1, 2, 3]));
        store.delete(key).unwrap();
        assert!(store.get(key).unwrap().is_none());
    }

    #[test]
    fn redb_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("nodes.redb")).unwrap();
        let key = NodeKey::new(3, 2);
        store.set(key, vec![9, 9, 9]).unwrap();
        assert_eq!(store.get(key).unwrap(), Some(vec![9, 9, 9]));
        store.delete(key).unwrap();
        assert!(store.get(key).unwrap().is_none());
    }
}
