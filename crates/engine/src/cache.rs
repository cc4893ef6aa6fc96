//! Bounded row cache
//!
//! Each connection keeps two of these (data and metadata). Eviction is
//! FIFO-with-second-chance: entries touched since they were queued get one
//! more trip through the queue before they are dropped. Removal leaves a
//! stale queue slot behind; slots are skipped when popped if the map no
//! longer holds the key.
//!
//! Hit/miss counters exist for tests and log lines; nothing reads them on the
//! hot path.

use std::borrow::Borrow;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

struct Slot<V> {
    value: V,
    accessed: bool,
}

/// Bounded insert-order cache with second-chance eviction.
///
/// A `limit` of zero means unbounded.
pub struct BoundedCache<K, V> {
    map: HashMap<K, Slot<V>>,
    queue: VecDeque<K>,
    limit: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a cache holding at most `limit` entries (zero = unbounded).
    pub fn new(limit: usize) -> Self {
        Self {
            map: HashMap::new(),
            queue: VecDeque::new(),
            limit,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True if no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Looks up `key`, marking the entry recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        match self.map.get_mut(key) {
            Some(slot) => {
                slot.accessed = true;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// True if `key` is cached. Does not count as an access.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.map.contains_key(key)
    }

    /// Inserts or replaces `key`, evicting if over the limit.
    pub fn insert(&mut self, key: K, value: V) {
        match self.map.get_mut(&key) {
            Some(slot) => {
                slot.value = value;
                slot.accessed = true;
            }
            None => {
                self.map.insert(
                    key.clone(),
                    Slot {
                        value,
                        accessed: false,
                    },
                );
                self.queue.push_back(key);
                self.evict_if_needed();
            }
        }
    }

    /// Replaces the value only if `key` is already cached.
    ///
    /// This is the cache-patching primitive: changeset application must never
    /// grow a sibling's cache, only correct what it already holds.
    pub fn update_if_present<Q>(&mut self, key: &Q, value: V)
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        if let Some(slot) = self.map.get_mut(key) {
            slot.value = value;
        }
    }

    /// Removes `key` if present. The queue slot goes stale and is skipped
    /// during a later eviction sweep.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.map.remove(key).map(|slot| slot.value)
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.map.clear();
        self.queue.clear();
    }

    /// Lookup hits since creation.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookup misses since creation.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn evict_if_needed(&mut self) {
        if self.limit == 0 {
            return;
        }
        while self.map.len() > self.limit {
            let Some(candidate) = self.queue.pop_front() else {
                return;
            };
            match self.map.get_mut(&candidate) {
                None => {
                    // stale slot left by remove()
                }
                Some(slot) if slot.accessed => {
                    slot.accessed = false;
                    self.queue.push_back(candidate);
                }
                Some(_) => {
                    self.map.remove(&candidate);
                }
            }
        }
    }
}

impl<K, V> std::fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("len", &self.map.len())
            .field("limit", &self.limit)
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut cache = BoundedCache::new(4);
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_eviction_respects_limit() {
        let mut cache = BoundedCache::new(3);
        for i in 0..10 {
            cache.insert(i, i);
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_second_chance_keeps_hot_entries() {
        let mut cache = BoundedCache::new(2);
        cache.insert("hot", 1);
        cache.insert("cold", 2);
        assert_eq!(cache.get(&"hot"), Some(1));
        cache.insert("new", 3);
        // "cold" was never accessed, so it goes first.
        assert!(cache.contains(&"hot"));
        assert!(!cache.contains(&"cold"));
        assert!(cache.contains(&"new"));
    }

    #[test]
    fn test_update_if_present_never_grows() {
        let mut cache = BoundedCache::new(4);
        cache.insert("a", 1);
        cache.update_if_present(&"a", 10);
        cache.update_if_present(&"b", 20);
        assert_eq!(cache.get(&"a"), Some(10));
        assert!(!cache.contains(&"b"));
    }

    #[test]
    fn test_remove_then_reinsert() {
        let mut cache = BoundedCache::new(2);
        cache.insert("a", 1);
        assert_eq!(cache.remove(&"a"), Some(1));
        assert!(!cache.contains(&"a"));
        cache.insert("a", 2);
        cache.insert("b", 3);
        cache.insert("c", 4);
        // stale slot from the removed "a" must not break eviction
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_limit_is_unbounded() {
        let mut cache = BoundedCache::new(0);
        for i in 0..1000 {
            cache.insert(i, i);
        }
        assert_eq!(cache.len(), 1000);
    }
}
