//! Maps that remember what a crank changed.
//!
//! Every write pushes the value it replaced onto an undo log, so a savepoint
//! is just the log's length and rolling back replays the log backwards. The
//! keys written since the last commit are kept apart for persistence, which
//! rewrites only those. Marks are only valid until the next `take_dirty`.

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, btree_map};
use std::fmt;
use std::ops::RangeBounds;

#[derive(Clone)]
pub struct TrackedMap<K, V> {
    map: BTreeMap<K, V>,
    undo: Vec<(K, Option<V>)>,
    dirty: BTreeSet<K>,
}

impl<K, V> Default for TrackedMap<K, V> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
            undo: Vec::new(),
            dirty: BTreeSet::new(),
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for TrackedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.map.fmt(f)
    }
}

impl<K: PartialEq, V: PartialEq> PartialEq for TrackedMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.map == other.map
    }
}

impl<K: Eq, V: Eq> Eq for TrackedMap<K, V> {}

impl<'a, K, V> IntoIterator for &'a TrackedMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = btree_map::Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.iter()
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for TrackedMap<K, V> {
    /// Loaded entries start clean.
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            map: iter.into_iter().collect(),
            ..Self::default()
        }
    }
}

impl<K: Ord + Clone, V: Clone> TrackedMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.map.get(key)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.map.contains_key(key)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, K, V> {
        self.map.iter()
    }

    pub fn keys(&self) -> btree_map::Keys<'_, K, V> {
        self.map.keys()
    }

    pub fn values(&self) -> btree_map::Values<'_, K, V> {
        self.map.values()
    }

    pub fn range<Q, R>(&self, range: R) -> btree_map::Range<'_, K, V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        R: RangeBounds<Q>,
    {
        self.map.range(range)
    }

    pub fn insert(&mut self, key: K, value: V) {
        let old = self.map.insert(key.clone(), value);
        self.record(key, old);
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let old = self.map.remove(key)?;
        self.record(key.clone(), Some(old.clone()));
        Some(old)
    }

    /// Mutable access. The current value is logged first, whether or not
    /// the caller ends up changing it.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let old = self.map.get(key)?.clone();
        self.record(key.clone(), Some(old));
        self.map.get_mut(key)
    }

    fn record(&mut self, key: K, old: Option<V>) {
        self.dirty.insert(key.clone());
        self.undo.push((key, old));
    }

    pub fn mark(&self) -> usize {
        self.undo.len()
    }

    /// Undo every write made since `mark`. Rolled-back keys stay dirty;
    /// persisting an unchanged value is harmless.
    pub fn rollback(&mut self, mark: usize) {
        while self.undo.len() > mark {
            let Some((key, old)) = self.undo.pop() else {
                break;
            };
            match old {
                Some(value) => {
                    self.map.insert(key, value);
                }
                None => {
                    self.map.remove(&key);
                }
            }
        }
    }

    /// Keys written since the last call. Forgets the undo log, so earlier
    /// marks can no longer be rolled back to.
    pub fn take_dirty(&mut self) -> BTreeSet<K> {
        self.undo.clear();
        std::mem::take(&mut self.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_restores_overwritten_and_removed_entries() {
        let mut map: TrackedMap<&str, u32> = [("a", 1), ("b", 2)].into_iter().collect();
        let mark = map.mark();
        map.insert("a", 10);
        map.remove(&"b");
        map.insert("c", 3);
        *map.get_mut(&"c").unwrap() += 1;
        assert_eq!(map.get("c"), Some(&4));

        map.rollback(mark);
        let entries: Vec<_> = map.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(entries, vec![("a", 1), ("b", 2)]);
    }

    #[test]
    fn nested_marks_unwind_independently() {
        let mut map = TrackedMap::new();
        map.insert(1, "one");
        let outer = map.mark();
        map.insert(2, "two");
        let inner = map.mark();
        map.insert(3, "three");
        map.rollback(inner);
        assert!(map.contains_key(&2));
        assert!(!map.contains_key(&3));
        map.rollback(outer);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn dirty_keys_accumulate_until_taken() {
        let mut map: TrackedMap<u32, u32> = [(1, 1), (2, 2)].into_iter().collect();
        assert!(map.take_dirty().is_empty());
        map.insert(3, 3);
        map.remove(&1);
        map.remove(&9);
        assert_eq!(map.take_dirty(), BTreeSet::from([1, 3]));
        assert!(map.take_dirty().is_empty());
        assert_eq!(map.mark(), 0);
    }

    #[test]
    fn equality_ignores_history() {
        let mut edited: TrackedMap<u32, u32> = TrackedMap::new();
        edited.insert(1, 5);
        edited.insert(1, 1);
        let loaded: TrackedMap<u32, u32> = [(1, 1)].into_iter().collect();
        assert_eq!(edited, loaded);
    }
}
