use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound;

use crate::{Hash, StoreResult};

/// Key holding the chained hash of every committed consensus change.
pub const ACTIVITY_HASH_KEY: &str = "activityhash";

/// Keys under this prefix are node-local and excluded from crank hashes.
const LOCAL_PREFIX: &str = "local.";

/// Durable home for committed key/value images.
pub trait KvBackend: Send {
    fn load(&self) -> StoreResult<BTreeMap<String, String>>;

    /// Persist a commit. `image` is the full post-commit state and `changes`
    /// the delta that produced it, so a backend may write either.
    fn persist(
        &mut self,
        image: &BTreeMap<String, String>,
        changes: &BTreeMap<String, Option<String>>,
    ) -> StoreResult<()>;
}

/// Transactional key/value store. Writes are buffered until [`KvStore::commit`]
/// and reads see buffered writes.
pub struct KvStore {
    committed: BTreeMap<String, String>,
    pending: BTreeMap<String, Option<String>>,
    last_crank_hash: Option<Hash>,
    backend: Box<dyn KvBackend>,
}

impl fmt::Debug for KvStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvStore")
            .field("committed", &self.committed.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl KvStore {
    pub fn open(backend: Box<dyn KvBackend>) -> StoreResult<Self> {
        let committed = backend.load()?;
        Ok(Self {
            committed,
            pending: BTreeMap::new(),
            last_crank_hash: None,
            backend,
        })
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self.pending.get(key) {
            Some(value) => value.clone(),
            None => self.committed.get(key).cloned(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.pending.insert(key.to_string(), Some(value.to_string()));
    }

    pub fn delete(&mut self, key: &str) {
        self.pending.insert(key.to_string(), None);
    }

    /// The smallest live key strictly greater than `prior`.
    pub fn get_next_key(&self, prior: &str) -> Option<String> {
        self.live_keys(Bound::Excluded(prior), Bound::Unbounded)
            .into_iter()
            .next()
    }

    /// Live keys in `[start, end)`; an empty `end` means unbounded.
    pub fn get_keys(&self, start: &str, end: &str) -> Vec<String> {
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else if start >= end {
            return Vec::new();
        } else {
            Bound::Excluded(end)
        };
        self.live_keys(Bound::Included(start), upper)
    }

    pub fn get_prefixed_keys(&self, prefix: &str) -> Vec<String> {
        let end = prefix_end(prefix);
        let upper = end.as_deref().map_or(Bound::Unbounded, Bound::Excluded);
        self.live_keys(Bound::Included(prefix), upper)
            .into_iter()
            .take_while(|key| key.starts_with(prefix))
            .collect()
    }

    fn live_keys(&self, lower: Bound<&str>, upper: Bound<&str>) -> Vec<String> {
        let mut keys: BTreeSet<&String> = self
            .committed
            .range::<str, _>((lower, upper))
            .map(|(k, _)| k)
            .collect();
        for (key, value) in self.pending.range::<str, _>((lower, upper)) {
            if value.is_some() {
                keys.insert(key);
            } else {
                keys.remove(key);
            }
        }
        keys.into_iter().cloned().collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Hash of the consensus changes applied by the most recent commit.
    pub fn last_crank_hash(&self) -> Option<Hash> {
        self.last_crank_hash
    }

    /// The chained hash over every committed consensus change so far.
    pub fn activity_hash(&self) -> Option<String> {
        self.get(ACTIVITY_HASH_KEY)
    }

    /// Apply buffered writes and persist them through the backend.
    pub fn commit(&mut self) -> StoreResult<()> {
        self.pending.retain(|key, value| {
            self.committed.get(key).map(String::as_str) != value.as_deref()
        });
        if self.pending.is_empty() {
            return Ok(());
        }
        let crank_hash = crank_hash(&self.pending);
        if let Some(crank_hash) = crank_hash {
            let previous = self.get(ACTIVITY_HASH_KEY).unwrap_or_default();
            let crank_hex = crank_hash.to_string();
            let activity =
                Hash::digest_parts([previous.as_bytes(), b"\n".as_slice(), crank_hex.as_bytes()]);
            self.pending
                .insert(ACTIVITY_HASH_KEY.to_string(), Some(activity.to_string()));
        }
        self.last_crank_hash = crank_hash;
        for (key, value) in &self.pending {
            match value {
                Some(value) => {
                    self.committed.insert(key.clone(), value.clone());
                }
                None => {
                    self.committed.remove(key);
                }
            }
        }
        let changes = std::mem::take(&mut self.pending);
        log::debug!("kv commit: {} changed keys", changes.len());
        self.backend.persist(&self.committed, &changes)
    }

    pub fn abort(&mut self) {
        self.pending.clear();
    }
}

/// A string sorting after every string that starts with `prefix`.
fn prefix_end(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = char::from_u32(last as u32 + 1) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

fn crank_hash(changes: &BTreeMap<String, Option<String>>) -> Option<Hash> {
    let mut chunks: Vec<&[u8]> = Vec::new();
    for (key, value) in changes {
        if key.starts_with(LOCAL_PREFIX) || key == ACTIVITY_HASH_KEY {
            continue;
        }
        match value {
            Some(value) => {
                chunks.extend([b"add\0".as_slice(), key.as_bytes(), b"\0", value.as_bytes()]);
            }
            None => chunks.extend([b"delete\0".as_slice(), key.as_bytes()]),
        }
        chunks.push(b"\n");
    }
    if chunks.is_empty() {
        None
    } else {
        Some(Hash::digest_parts(chunks))
    }
}
