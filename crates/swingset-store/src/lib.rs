//! Durable storage for the kernel: a transactional key/value store, per-vat
//! transcript streams and a content-addressed snapshot store.

mod fs_store;
mod hash;
mod kv;
mod mem_store;
mod snapshot;
mod transcript;

pub use fs_store::{FsKvBackend, FsSnapBackend, FsTranscriptBackend};
pub use hash::{HASH_PREFIX, Hash, HashParseError, to_canonical_cbor};
pub use kv::{ACTIVITY_HASH_KEY, KvBackend, KvStore};
pub use mem_store::{MemBackends, MemKvBackend, MemSnapBackend, MemTranscriptBackend};
pub use snapshot::{SnapBackend, SnapStore};
pub use transcript::{TranscriptBackend, TranscriptStore};

use std::{io, path::Path, path::PathBuf};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CBOR serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("snapshot hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: Hash, actual: Hash },
    #[error("snapshot {0} not found")]
    SnapshotNotFound(Hash),
    #[error("transcript for {vat_id} is missing position {position}")]
    TranscriptGap { vat_id: String, position: u64 },
    #[error("corrupt store data: {0}")]
    Corrupt(String),
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}

/// The three storage components the kernel commits together at every crank
/// boundary.
pub struct SwingStore {
    kv: KvStore,
    transcripts: TranscriptStore,
    snapshots: SnapStore,
}

impl std::fmt::Debug for SwingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwingStore")
            .field("kv", &self.kv)
            .finish_non_exhaustive()
    }
}

impl SwingStore {
    pub fn new(
        kv: Box<dyn KvBackend>,
        transcripts: Box<dyn TranscriptBackend>,
        snapshots: Box<dyn SnapBackend>,
    ) -> StoreResult<Self> {
        Ok(Self {
            kv: KvStore::open(kv)?,
            transcripts: TranscriptStore::new(transcripts),
            snapshots: SnapStore::new(snapshots),
        })
    }

    /// Open (or create) a filesystem store rooted at `root`.
    pub fn open_fs(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref();
        Self::new(
            Box::new(FsKvBackend::open(root)?),
            Box::new(FsTranscriptBackend::open(root)?),
            Box::new(FsSnapBackend::open(root)?),
        )
    }

    /// Open a store over shared in-memory backends. Opening twice over the same
    /// `MemBackends` sees whatever the first store committed.
    pub fn open_mem(backends: &MemBackends) -> StoreResult<Self> {
        Self::new(
            Box::new(backends.kv()),
            Box::new(backends.transcripts()),
            Box::new(backends.snapshots()),
        )
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn kv_mut(&mut self) -> &mut KvStore {
        &mut self.kv
    }

    pub fn transcripts(&self) -> &TranscriptStore {
        &self.transcripts
    }

    pub fn transcripts_mut(&mut self) -> &mut TranscriptStore {
        &mut self.transcripts
    }

    pub fn snapshots(&self) -> &SnapStore {
        &self.snapshots
    }

    pub fn snapshots_mut(&mut self) -> &mut SnapStore {
        &mut self.snapshots
    }

    /// Flush all buffered writes. The kv commit is the commit point:
    /// transcript items and snapshots written ahead of it are ignored after a
    /// crash because nothing in the kv image refers to them. Transcript
    /// deletions run after it; one that fails only leaves an unreferenced
    /// stream behind.
    pub fn commit(&mut self) -> StoreResult<()> {
        self.snapshots.commit()?;
        self.transcripts.commit()?;
        self.kv.commit()?;
        if let Err(err) = self.transcripts.apply_deletes() {
            log::warn!("leaving a deleted transcript in place: {err}");
        }
        Ok(())
    }

    /// Discard all buffered writes.
    pub fn abort(&mut self) {
        self.snapshots.abort();
        self.transcripts.abort();
        self.kv.abort();
    }
}
