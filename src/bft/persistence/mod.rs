//! Durable key-value storage for PBFT state.
//!
//! Key layout follows the persisted state described by
//! `original_source/pbft/pbft_checkpoint_manager.hpp` and
//! `pbft_config_store.hpp`: flat string keys, scanned by prefix to recover
//! a class of records (e.g. all partial checkpoint proofs for a sequence
//! number).

use crate::bft::error::*;

/// Ordering of entries returned from a prefix scan.
pub type ScanIter<'a> = Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

/// A durable key-value store.
///
/// Grounded on `original_source/storage/storage_base.hpp`'s `get`/`add`/
/// `remove` surface, and on the key-prefix scan that the checkpoint manager
/// and config store both rely on.
pub trait Storage: Send + Sync {
    /// Reads the value stored at `key`, if any.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Writes `value` at `key`, overwriting any previous value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Removes the value stored at `key`, if any.
    fn remove(&self, key: &[u8]) -> Result<()>;

    /// Iterates over every key-value pair whose key starts with `prefix`.
    fn scan_prefix<'a>(&'a self, prefix: &[u8]) -> Result<ScanIter<'a>>;
}

/// An in-memory `Storage` test double.
pub struct MemStorage {
    inner: parking_lot::Mutex<std::collections::BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStorage {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(std::collections::BTreeMap::new()),
        }
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.inner.lock().remove(key);
        Ok(())
    }

    fn scan_prefix<'a>(&'a self, prefix: &[u8]) -> Result<ScanIter<'a>> {
        let prefix = prefix.to_vec();
        let snapshot: Vec<_> = self
            .inner
            .lock()
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(snapshot.into_iter()))
    }
}

/// A `sled`-backed `Storage` implementation.
///
/// Grounded on `examples/HautlyS-Housaky/housaky-photon-db`, which wraps
/// `sled` for the same purpose: a content-addressed, crash-safe KV store
/// with no native build toolchain requirement.
pub struct SledStorage {
    tree: sled::Db,
}

impl SledStorage {
    /// Opens (or creates) a sled database at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let tree = sled::open(path).wrapped(ErrorKind::Persistence)?;
        Ok(Self { tree })
    }
}

impl Storage for SledStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tree
            .get(key)
            .wrapped(ErrorKind::Persistence)?
            .map(|ivec| ivec.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree
            .insert(key, value)
            .wrapped(ErrorKind::Persistence)?;
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.tree.remove(key).wrapped(ErrorKind::Persistence)?;
        Ok(())
    }

    fn scan_prefix<'a>(&'a self, prefix: &[u8]) -> Result<ScanIter<'a>> {
        let iter = self.tree.scan_prefix(prefix).filter_map(|entry| {
            let (k, v) = entry.ok()?;
            Some((k.to_vec(), v.to_vec()))
        });
        Ok(Box::new(iter))
    }
}

/// Key under which the latest stable checkpoint `(seq, digest)` pair lives.
pub const STABLE_CHECKPOINT_KEY: &[u8] = b"stable_checkpoint";
/// Key prefix for per-peer stable checkpoint attestations.
pub const STABLE_CHECKPOINT_PROOF_PREFIX: &[u8] = b"stable_checkpoint_proof/";
/// Key under which the latest local (not yet stable) checkpoint lives.
pub const LOCAL_CHECKPOINT_KEY: &[u8] = b"local_checkpoint";
/// Key prefix for partial checkpoint proofs, keyed by `seq/hash/uuid`.
pub const PARTIAL_CHECKPOINT_PROOFS_PREFIX: &[u8] = b"partial_checkpoint_proofs/";
/// Key prefix for logged operations, keyed by `view/sequence/hash/type/sender`.
pub const OPERATION_PREFIX: &[u8] = b"operation/";
/// Key prefix for tracked configurations.
pub const CONFIG_STORE_PREFIX: &[u8] = b"config_store/";
/// Key under which the current view number lives.
pub const VIEW_KEY: &[u8] = b"view";
/// Key under which the next sequence number to be issued lives.
pub const NEXT_SEQUENCE_KEY: &[u8] = b"next_sequence";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_storage_roundtrip() {
        let store = MemStorage::new();
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        store.remove(b"a").unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
    }

    #[test]
    fn mem_storage_prefix_scan() {
        let store = MemStorage::new();
        store.put(b"operation/1/1", b"x").unwrap();
        store.put(b"operation/1/2", b"y").unwrap();
        store.put(b"view", b"z").unwrap();
        let scanned: Vec<_> = store.scan_prefix(b"operation/").unwrap().collect();
        assert_eq!(scanned.len(), 2);
    }
}
