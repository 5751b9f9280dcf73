use std::fmt;

use crate::{StoreError, StoreResult};

/// Append-only per-vat item streams addressed by position.
pub trait TranscriptBackend: Send {
    fn append(&mut self, vat_id: &str, items: &[(u64, Vec<u8>)]) -> StoreResult<()>;

    /// Items at positions `[start, end)` in order. Missing positions are
    /// reported as [`StoreError::TranscriptGap`].
    fn read_range(&self, vat_id: &str, start: u64, end: u64) -> StoreResult<Vec<Vec<u8>>>;

    fn delete_vat(&mut self, vat_id: &str) -> StoreResult<()>;
}

/// Buffers transcript writes until the surrounding crank commits. Appends
/// are written ahead of the kv commit point; stream deletions only after it,
/// so a crash in between never loses a transcript the kv image still uses.
pub struct TranscriptStore {
    backend: Box<dyn TranscriptBackend>,
    appends: Vec<(String, u64, Vec<u8>)>,
    deletes: Vec<String>,
}

impl fmt::Debug for TranscriptStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscriptStore")
            .field("appends", &self.appends.len())
            .field("deletes", &self.deletes)
            .finish()
    }
}

impl TranscriptStore {
    pub fn new(backend: Box<dyn TranscriptBackend>) -> Self {
        Self {
            backend,
            appends: Vec::new(),
            deletes: Vec::new(),
        }
    }

    pub fn append(&mut self, vat_id: &str, position: u64, item: Vec<u8>) {
        self.appends.push((vat_id.to_string(), position, item));
    }

    pub fn delete_vat(&mut self, vat_id: &str) {
        self.deletes.push(vat_id.to_string());
    }

    /// Read committed items only.
    pub fn read_range(&self, vat_id: &str, start: u64, end: u64) -> StoreResult<Vec<Vec<u8>>> {
        if start >= end {
            return Ok(Vec::new());
        }
        self.backend.read_range(vat_id, start, end)
    }

    /// Write buffered appends, one backend call per run of items for the
    /// same vat.
    pub fn commit(&mut self) -> StoreResult<()> {
        let appends = std::mem::take(&mut self.appends);
        let mut batch: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut batch_vat: Option<String> = None;
        for (vat_id, position, item) in appends {
            if batch_vat.as_deref() != Some(vat_id.as_str()) {
                self.flush(batch_vat.take(), &mut batch)?;
                batch_vat = Some(vat_id);
            }
            batch.push((position, item));
        }
        self.flush(batch_vat, &mut batch)
    }

    fn flush(&mut self, vat_id: Option<String>, batch: &mut Vec<(u64, Vec<u8>)>) -> StoreResult<()> {
        if let Some(vat_id) = vat_id {
            if !batch.is_empty() {
                self.backend.append(&vat_id, batch)?;
            }
        }
        batch.clear();
        Ok(())
    }

    /// Remove the streams deleted since the last commit. Runs once the kv
    /// image no longer refers to them.
    pub fn apply_deletes(&mut self) -> StoreResult<()> {
        for vat_id in std::mem::take(&mut self.deletes) {
            self.backend.delete_vat(&vat_id)?;
        }
        Ok(())
    }

    pub fn abort(&mut self) {
        self.appends.clear();
        self.deletes.clear();
    }
}

pub(crate) fn collect_range(
    vat_id: &str,
    start: u64,
    end: u64,
    mut lookup: impl FnMut(u64) -> Option<Vec<u8>>,
) -> StoreResult<Vec<Vec<u8>>> {
    (start..end)
        .map(|position| {
            lookup(position).ok_or_else(|| StoreError::TranscriptGap {
                vat_id: vat_id.to_string(),
                position,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemBackends;

    #[test]
    fn items_become_readable_after_commit() {
        let mut store = TranscriptStore::new(Box::new(MemBackends::default().transcripts()));
        store.append("v1", 0, b"a".to_vec());
        store.append("v2", 0, b"b".to_vec());
        store.append("v1", 1, b"c".to_vec());
        assert!(store.read_range("v1", 0, 1).is_err());
        store.commit().expect("commit");
        assert_eq!(
            store.read_range("v1", 0, 2).expect("read"),
            vec![b"a".to_vec(), b"c".to_vec()]
        );
        assert_eq!(store.read_range("v2", 0, 1).expect("read").len(), 1);
    }

    #[test]
    fn gap_is_reported_with_position() {
        let mut store = TranscriptStore::new(Box::new(MemBackends::default().transcripts()));
        store.append("v1", 0, b"a".to_vec());
        store.commit().expect("commit");
        let err = store.read_range("v1", 0, 2).unwrap_err();
        assert!(matches!(err, StoreError::TranscriptGap { position: 1, .. }));
    }

    #[test]
    fn deletes_wait_for_apply_deletes() {
        let mut store = TranscriptStore::new(Box::new(MemBackends::default().transcripts()));
        store.append("v1", 0, b"a".to_vec());
        store.delete_vat("v1");
        store.commit().expect("commit");
        assert_eq!(store.read_range("v1", 0, 1).expect("still there").len(), 1);
        store.apply_deletes().expect("delete");
        assert!(store.read_range("v1", 0, 1).is_err());
        assert!(store.read_range("v1", 3, 3).expect("empty").is_empty());
    }
}
