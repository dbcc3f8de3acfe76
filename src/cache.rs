//! Bounded "already seen" caches for gossip deduplication
//!
//! Security events are keyed by signature and gossiped blocks by hash. The
//! oldest keys are evicted once the capacity is reached, so a replay older
//! than the window is caught by the ledger's own duplicate checks instead.

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;

pub struct SeenCache<K: Hash + Eq> {
    inner: Mutex<LruCache<K, i64>>,
}

impl<K: Hash + Eq + Clone> SeenCache<K> {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record `key` as seen at `now`. Returns true the first time a key is
    /// observed (within the cache window).
    pub fn insert(&self, key: K, now: i64) -> bool {
        let mut cache = self.inner.lock();
        if cache.contains(&key) {
            cache.promote(&key);
            return false;
        }
        cache.put(key, now);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    /// When `key` was first seen.
    pub fn first_seen(&self, key: &K) -> Option<i64> {
        self.inner.lock().peek(key).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }
}

impl<K: Hash + Eq + Clone> Default for SeenCache<K> {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_insert_wins() {
        let cache: SeenCache<String> = SeenCache::new(8);
        assert!(cache.insert("sig-a".to_string(), 10));
        assert!(!cache.insert("sig-a".to_string(), 20));
        assert_eq!(cache.first_seen(&"sig-a".to_string()), Some(10));
    }

    #[test]
    fn test_oldest_key_is_evicted() {
        let cache: SeenCache<u32> = SeenCache::new(3);
        for key in 0..3 {
            cache.insert(key, 0);
        }
        // Touching 0 makes 1 the eviction candidate.
        assert!(!cache.insert(0, 1));
        cache.insert(3, 1);
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&0));
        assert!(!cache.contains(&1));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache: SeenCache<u32> = SeenCache::new(0);
        assert_eq!(cache.capacity(), 1);
        assert!(cache.is_empty());
    }
}
