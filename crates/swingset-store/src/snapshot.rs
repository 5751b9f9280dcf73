use std::collections::BTreeMap;
use std::fmt;

use crate::{Hash, StoreError, StoreResult};

/// Durable home for content-addressed snapshot blobs.
pub trait SnapBackend: Send {
    fn put(&mut self, hash: Hash, bytes: &[u8]) -> StoreResult<()>;
    fn get(&self, hash: Hash) -> StoreResult<Option<Vec<u8>>>;
}

/// Content-addressed worker snapshots. Which vat and incarnation a snapshot
/// belongs to is recorded by the kernel in the kv store; blobs themselves are
/// keyed only by their hash and are never overwritten.
pub struct SnapStore {
    backend: Box<dyn SnapBackend>,
    pending: BTreeMap<Hash, Vec<u8>>,
}

impl fmt::Debug for SnapStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapStore")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl SnapStore {
    pub fn new(backend: Box<dyn SnapBackend>) -> Self {
        Self {
            backend,
            pending: BTreeMap::new(),
        }
    }

    pub fn save(&mut self, bytes: Vec<u8>) -> Hash {
        let hash = Hash::digest(&bytes);
        self.pending.entry(hash).or_insert(bytes);
        hash
    }

    pub fn has(&self, hash: Hash) -> StoreResult<bool> {
        if self.pending.contains_key(&hash) {
            return Ok(true);
        }
        Ok(self.backend.get(hash)?.is_some())
    }

    /// Load a snapshot, verifying its content hash.
    pub fn load(&self, hash: Hash) -> StoreResult<Vec<u8>> {
        if let Some(bytes) = self.pending.get(&hash) {
            return Ok(bytes.clone());
        }
        let bytes = self
            .backend
            .get(hash)?
            .ok_or(StoreError::SnapshotNotFound(hash))?;
        let actual = Hash::digest(&bytes);
        if actual != hash {
            return Err(StoreError::HashMismatch {
                expected: hash,
                actual,
            });
        }
        Ok(bytes)
    }

    pub fn commit(&mut self) -> StoreResult<()> {
        for (hash, bytes) in std::mem::take(&mut self.pending) {
            self.backend.put(hash, &bytes)?;
        }
        Ok(())
    }

    pub fn abort(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemBackends;

    #[test]
    fn identical_snapshots_share_one_blob() {
        let mut snaps = SnapStore::new(Box::new(MemBackends::default().snapshots()));
        let a = snaps.save(b"heap".to_vec());
        let b = snaps.save(b"heap".to_vec());
        assert_eq!(a, b);
        snaps.commit().expect("commit");
        assert_eq!(snaps.load(a).expect("load"), b"heap");
    }

    #[test]
    fn missing_snapshot_is_an_error() {
        let snaps = SnapStore::new(Box::new(MemBackends::default().snapshots()));
        let err = snaps.load(Hash::digest(b"nothing")).unwrap_err();
        assert!(matches!(err, StoreError::SnapshotNotFound(_)));
    }
}
