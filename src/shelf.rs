//! Persistent key/value shelves backing workflow state.
//!
//! The engine's four shelves (nodes, objects, resources, job-completion) are all
//! instances of the same abstract `Shelf` capability, mirroring how the original
//! `pypeliner` implementation layers everything over Python's `shelve` module.
//! This crate backs the trait with `sled`, opened once per pipeline directory and
//! flushed on every mutation.

use crate::error::EngineResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// A typed persistent key/value store. Opened at run start, flushed on every
/// mutation, closed (dropped) at run end.
pub trait Shelf<K, V>: Send + Sync {
    fn get(&self, key: &K) -> EngineResult<Option<V>>;
    fn put(&self, key: &K, value: &V) -> EngineResult<()>;
    fn remove(&self, key: &K) -> EngineResult<()>;
    fn contains(&self, key: &K) -> EngineResult<bool> {
        Ok(self.get(key)?.is_some())
    }
    fn flush(&self) -> EngineResult<()>;
    /// Every key currently stored. Used by maintenance passes (e.g. pruning
    /// stale job-completion entries) that need to scan the whole tree.
    fn keys(&self) -> EngineResult<Vec<K>>;
}

/// A `sled`-backed shelf over one named tree of a shared database.
pub struct SledShelf<K, V> {
    tree: sled::Tree,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> SledShelf<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    pub fn open(db: &sled::Db, tree_name: &str) -> EngineResult<Self> {
        let tree = db.open_tree(tree_name)?;
        Ok(Self {
            tree,
            _marker: PhantomData,
        })
    }

    fn encode_key(key: &K) -> EngineResult<Vec<u8>> {
        Ok(bincode::serialize(key)?)
    }

    /// Removes every entry in this tree. Used by `--rerun` to force a full
    /// rebuild regardless of recorded freshness.
    pub fn clear(&self) -> EngineResult<()> {
        self.tree.clear()?;
        self.tree.flush()?;
        Ok(())
    }
}

impl<K, V> Shelf<K, V> for SledShelf<K, V>
where
    K: Serialize + DeserializeOwned + Send + Sync,
    V: Serialize + DeserializeOwned + Send + Sync,
{
    fn get(&self, key: &K) -> EngineResult<Option<V>> {
        let raw_key = Self::encode_key(key)?;
        match self.tree.get(raw_key)? {
            Some(raw_value) => {
                let value: V = serde_json::from_slice(&raw_value)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &K, value: &V) -> EngineResult<()> {
        let raw_key = Self::encode_key(key)?;
        let raw_value = serde_json::to_vec(value)?;
        self.tree.insert(raw_key, raw_value)?;
        self.tree.flush()?;
        Ok(())
    }

    fn remove(&self, key: &K) -> EngineResult<()> {
        let raw_key = Self::encode_key(key)?;
        self.tree.remove(raw_key)?;
        self.tree.flush()?;
        Ok(())
    }

    fn flush(&self) -> EngineResult<()> {
        self.tree.flush()?;
        Ok(())
    }

    fn keys(&self) -> EngineResult<Vec<K>> {
        let mut out = Vec::new();
        for entry in self.tree.iter() {
            let (raw_key, _) = entry?;
            out.push(bincode::deserialize(&raw_key)?);
        }
        Ok(out)
    }
}

/// Opens the four named shelves over one `sled::Db` rooted at `db_dir`.
pub struct Shelves {
    pub db: sled::Db,
}

impl Shelves {
    pub fn open(db_dir: &std::path::Path) -> EngineResult<Arc<Self>> {
        std::fs::create_dir_all(db_dir)?;
        let db = sled::open(db_dir.join("shelves"))?;
        Ok(Arc::new(Self { db }))
    }

    pub fn tree<K, V>(&self, name: &str) -> EngineResult<SledShelf<K, V>>
    where
        K: Serialize + DeserializeOwned,
        V: Serialize + DeserializeOwned,
    {
        SledShelf::open(&self.db, name)
    }

    pub fn close(&self) -> EngineResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
