use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::transcript::collect_range;
use crate::{Hash, KvBackend, SnapBackend, StoreError, StoreResult, TranscriptBackend};

type Transcripts = BTreeMap<String, BTreeMap<u64, Vec<u8>>>;

/// Shared in-memory storage. Cloning yields another handle onto the same
/// data, which lets a test drop a kernel and reopen one over what it committed.
#[derive(Clone, Default)]
pub struct MemBackends {
    kv: Arc<Mutex<BTreeMap<String, String>>>,
    transcripts: Arc<Mutex<Transcripts>>,
    snapshots: Arc<Mutex<HashMap<Hash, Vec<u8>>>>,
}

impl fmt::Debug for MemBackends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemBackends").finish_non_exhaustive()
    }
}

impl MemBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kv(&self) -> MemKvBackend {
        MemKvBackend(self.kv.clone())
    }

    pub fn transcripts(&self) -> MemTranscriptBackend {
        MemTranscriptBackend(self.transcripts.clone())
    }

    pub fn snapshots(&self) -> MemSnapBackend {
        MemSnapBackend(self.snapshots.clone())
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> StoreResult<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| StoreError::Poisoned(what))
}

#[derive(Clone, Debug)]
pub struct MemKvBackend(Arc<Mutex<BTreeMap<String, String>>>);

impl KvBackend for MemKvBackend {
    fn load(&self) -> StoreResult<BTreeMap<String, String>> {
        Ok(lock(&self.0, "kv")?.clone())
    }

    fn persist(
        &mut self,
        _image: &BTreeMap<String, String>,
        changes: &BTreeMap<String, Option<String>>,
    ) -> StoreResult<()> {
        let mut guard = lock(&self.0, "kv")?;
        for (key, value) in changes {
            match value {
                Some(value) => {
                    guard.insert(key.clone(), value.clone());
                }
                None => {
                    guard.remove(key);
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct MemTranscriptBackend(Arc<Mutex<Transcripts>>);

impl TranscriptBackend for MemTranscriptBackend {
    fn append(&mut self, vat_id: &str, items: &[(u64, Vec<u8>)]) -> StoreResult<()> {
        let mut guard = lock(&self.0, "transcripts")?;
        let stream = guard.entry(vat_id.to_string()).or_default();
        for (position, item) in items {
            stream.insert(*position, item.clone());
        }
        Ok(())
    }

    fn read_range(&self, vat_id: &str, start: u64, end: u64) -> StoreResult<Vec<Vec<u8>>> {
        let guard = lock(&self.0, "transcripts")?;
        let stream = guard.get(vat_id);
        collect_range(vat_id, start, end, |position| {
            stream.and_then(|s| s.get(&position)).cloned()
        })
    }

    fn delete_vat(&mut self, vat_id: &str) -> StoreResult<()> {
        lock(&self.0, "transcripts")?.remove(vat_id);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct MemSnapBackend(Arc<Mutex<HashMap<Hash, Vec<u8>>>>);

impl SnapBackend for MemSnapBackend {
    fn put(&mut self, hash: Hash, bytes: &[u8]) -> StoreResult<()> {
        lock(&self.0, "snapshots")?
            .entry(hash)
            .or_insert_with(|| bytes.to_vec());
        Ok(())
    }

    fn get(&self, hash: Hash) -> StoreResult<Option<Vec<u8>>> {
        Ok(lock(&self.0, "snapshots")?.get(&hash).cloned())
    }
}
