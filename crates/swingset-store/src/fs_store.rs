use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::transcript::collect_range;
use crate::{
    Hash, KvBackend, SnapBackend, StoreError, StoreResult, TranscriptBackend, io_error,
    to_canonical_cbor,
};

const KV_DIR: &str = "kv";
const KV_IMAGE: &str = "kv.cbor";
const KV_LOG: &str = "kv.log";
const TRANSCRIPT_DIR: &str = "transcripts";
const SNAPSHOT_DIR: &str = "snapshots";

/// The kv log is folded into the image once it is larger than both the image
/// and this many bytes.
pub const DEFAULT_COMPACTION_BYTES: u64 = 1 << 20;

/// Filesystem kv backend: a base image in `<root>/kv/kv.cbor` plus a log of
/// per-commit change sets in `<root>/kv/kv.log`. A commit appends and fsyncs
/// one change set. When the log outgrows the image, the image is rewritten
/// through a temporary file and a rename and the log is emptied; change sets
/// are absolute writes, so replaying one the image already holds is harmless.
#[derive(Debug)]
pub struct FsKvBackend {
    image_path: PathBuf,
    log_path: PathBuf,
    image_len: u64,
    log_len: u64,
    compaction_bytes: u64,
    /// Whether the log tail has been checked since this process opened it.
    tail_checked: bool,
}

impl FsKvBackend {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = root.as_ref().join(KV_DIR);
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        let image_path = dir.join(KV_IMAGE);
        let log_path = dir.join(KV_LOG);
        Ok(Self {
            image_len: file_len(&image_path)?,
            log_len: file_len(&log_path)?,
            image_path,
            log_path,
            compaction_bytes: DEFAULT_COMPACTION_BYTES,
            tail_checked: false,
        })
    }

    pub fn with_compaction_bytes(mut self, bytes: u64) -> Self {
        self.compaction_bytes = bytes;
        self
    }

    fn compact(&mut self, image: &BTreeMap<String, String>) -> StoreResult<()> {
        let bytes = to_canonical_cbor(image)?;
        let tmp = self.image_path.with_extension("cbor.tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| io_error(&tmp, e))?;
            file.write_all(&bytes).map_err(|e| io_error(&tmp, e))?;
            file.sync_all().map_err(|e| io_error(&tmp, e))?;
        }
        fs::rename(&tmp, &self.image_path).map_err(|e| io_error(&self.image_path, e))?;
        let log = File::create(&self.log_path).map_err(|e| io_error(&self.log_path, e))?;
        log.sync_all().map_err(|e| io_error(&self.log_path, e))?;
        log::debug!(
            "compacted kv log ({} bytes) into a {} byte image",
            self.log_len,
            bytes.len()
        );
        self.image_len = bytes.len() as u64;
        self.log_len = 0;
        Ok(())
    }
}

impl KvBackend for FsKvBackend {
    fn load(&self) -> StoreResult<BTreeMap<String, String>> {
        let mut image: BTreeMap<String, String> = match fs::read(&self.image_path) {
            Ok(bytes) => serde_cbor::from_slice(&bytes)?,
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(io_error(&self.image_path, err)),
        };
        for frame in read_log(&self.log_path)?.frames {
            let changes: BTreeMap<String, Option<String>> = serde_cbor::from_slice(&frame)?;
            for (key, value) in changes {
                match value {
                    Some(value) => image.insert(key, value),
                    None => image.remove(&key),
                };
            }
        }
        Ok(image)
    }

    fn persist(
        &mut self,
        image: &BTreeMap<String, String>,
        changes: &BTreeMap<String, Option<String>>,
    ) -> StoreResult<()> {
        if !self.tail_checked {
            self.log_len = cut_torn_tail(&self.log_path)?;
            self.tail_checked = true;
        }
        let mut buf = Vec::new();
        push_frame(&mut buf, changes)?;
        if let Err(err) = append_bytes(&self.log_path, &buf) {
            self.tail_checked = false;
            return Err(err);
        }
        self.log_len += buf.len() as u64;
        if self.log_len > self.image_len.max(self.compaction_bytes) {
            self.compact(image)?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct TranscriptRecord {
    position: u64,
    #[serde(with = "serde_bytes")]
    item: Vec<u8>,
}

/// Filesystem transcript backend: one log of length-prefixed canonical CBOR
/// records per vat. A later record for a position supersedes an earlier one.
/// A torn record at the end of a log, left by a crash mid-append, is ignored
/// on read and cut off before the next append.
#[derive(Debug)]
pub struct FsTranscriptBackend {
    dir: PathBuf,
    /// Vats whose log tail has been checked since this process opened it.
    tail_checked: BTreeSet<String>,
}

impl FsTranscriptBackend {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = root.as_ref().join(TRANSCRIPT_DIR);
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        Ok(Self {
            dir,
            tail_checked: BTreeSet::new(),
        })
    }

    fn log_path(&self, vat_id: &str) -> PathBuf {
        self.dir.join(format!("{vat_id}.log"))
    }
}

impl TranscriptBackend for FsTranscriptBackend {
    fn append(&mut self, vat_id: &str, items: &[(u64, Vec<u8>)]) -> StoreResult<()> {
        let path = self.log_path(vat_id);
        if !self.tail_checked.contains(vat_id) {
            cut_torn_tail(&path)?;
            self.tail_checked.insert(vat_id.to_string());
        }
        let mut buf = Vec::new();
        for (position, item) in items {
            push_frame(
                &mut buf,
                &TranscriptRecord {
                    position: *position,
                    item: item.clone(),
                },
            )?;
        }
        append_bytes(&path, &buf).inspect_err(|_| {
            self.tail_checked.remove(vat_id);
        })
    }

    fn read_range(&self, vat_id: &str, start: u64, end: u64) -> StoreResult<Vec<Vec<u8>>> {
        let mut records = BTreeMap::new();
        for frame in read_log(&self.log_path(vat_id))?.frames {
            let record: TranscriptRecord = serde_cbor::from_slice(&frame)?;
            records.insert(record.position, record.item);
        }
        collect_range(vat_id, start, end, |position| records.remove(&position))
    }

    fn delete_vat(&mut self, vat_id: &str) -> StoreResult<()> {
        let path = self.log_path(vat_id);
        self.tail_checked.remove(vat_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("removed transcript log {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&path, err)),
        }
    }
}

fn file_len(path: &Path) -> StoreResult<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
        Err(err) => Err(io_error(path, err)),
    }
}

/// Append a `u32` little-endian length header and the value's canonical CBOR.
fn push_frame<T: Serialize>(buf: &mut Vec<u8>, value: &T) -> StoreResult<()> {
    let bytes = to_canonical_cbor(value)?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| StoreError::Corrupt("log record larger than 4GiB".into()))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&bytes);
    Ok(())
}

fn append_bytes(path: &Path, buf: &[u8]) -> StoreResult<()> {
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|e| io_error(path, e))?;
    file.write_all(buf).map_err(|e| io_error(path, e))?;
    file.sync_all().map_err(|e| io_error(path, e))
}

struct LogContents {
    frames: Vec<Vec<u8>>,
    /// Length of the prefix made of whole frames.
    intact_len: u64,
}

/// Split a log into its frames. A missing file is an empty log; a short
/// header or body at the end is a torn append and is left out.
fn read_log(path: &Path) -> StoreResult<LogContents> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(io_error(path, err)),
    };
    let mut frames = Vec::new();
    let mut offset = 0;
    while let Some(header) = bytes.get(offset..offset + 4) {
        let Ok(header) = <[u8; 4]>::try_from(header) else {
            break;
        };
        let body_start = offset + 4;
        let body_end = body_start + u32::from_le_bytes(header) as usize;
        let Some(body) = bytes.get(body_start..body_end) else {
            break;
        };
        frames.push(body.to_vec());
        offset = body_end;
    }
    if offset < bytes.len() {
        log::warn!(
            "ignoring {} torn bytes at the end of {}",
            bytes.len() - offset,
            path.display()
        );
    }
    Ok(LogContents {
        frames,
        intact_len: offset as u64,
    })
}

/// Truncate a log to its whole frames. Returns the resulting length.
fn cut_torn_tail(path: &Path) -> StoreResult<u64> {
    let intact_len = read_log(path)?.intact_len;
    if file_len(path)? > intact_len {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| io_error(path, e))?;
        file.set_len(intact_len).map_err(|e| io_error(path, e))?;
        file.sync_all().map_err(|e| io_error(path, e))?;
        log::info!("cut {} back to {intact_len} bytes", path.display());
    }
    Ok(intact_len)
}

/// Filesystem snapshot backend rooted at `<root>/snapshots/sha256`.
#[derive(Debug)]
pub struct FsSnapBackend {
    dir: PathBuf,
}

impl FsSnapBackend {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = root.as_ref().join(SNAPSHOT_DIR).join("sha256");
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        Ok(Self { dir })
    }

    fn blob_path(&self, hash: &Hash) -> PathBuf {
        self.dir.join(hex::encode(hash.as_bytes()))
    }
}

impl SnapBackend for FsSnapBackend {
    fn put(&mut self, hash: Hash, bytes: &[u8]) -> StoreResult<()> {
        let path = self.blob_path(&hash);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(bytes).map_err(|e| io_error(&path, e))?;
                file.sync_all().map_err(|e| io_error(&path, e))
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(io_error(&path, err)),
        }
    }

    fn get(&self, hash: Hash) -> StoreResult<Option<Vec<u8>>> {
        let path = self.blob_path(&hash);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(&path, err)),
        }
    }
}
