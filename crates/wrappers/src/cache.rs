//! Flush-aware LRU cache for per-record encryption keys.
//!
//! A thin layer over [`lru::LruCache`]: `get` promotes to most-recent,
//! inserting beyond capacity evicts oldest-first, and an optional flush
//! callback observes each eviction (not explicit removals or same-key
//! replacements).

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

pub struct KeyCache<K: Eq + Hash + Clone, V> {
    inner: LruCache<K, V>,
    flush: Option<Box<dyn Fn(&K, &V) + Send + Sync>>,
}

impl<K: Eq + Hash + Clone, V> KeyCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        KeyCache {
            inner: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            flush: None,
        }
    }

    pub fn with_flush(mut self, flush: impl Fn(&K, &V) + Send + Sync + 'static) -> Self {
        self.flush = Some(Box::new(flush));
        self
    }

    /// Promotes the entry to most-recently-used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    pub fn insert(&mut self, key: K, value: V) {
        let probe = key.clone();
        if let Some((evicted_key, evicted_value)) = self.inner.push(key, value) {
            // push also hands back a replaced value under the same key;
            // only genuine evictions reach the flush hook.
            if evicted_key != probe {
                if let Some(flush) = &self.flush {
                    flush(&evicted_key, &evicted_value);
                }
            }
        }
    }

    /// Removes without flushing.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }
}
