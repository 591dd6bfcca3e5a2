//! Bounded LRU cache with per-entry TTL.
//!
//! Shared by the retrieval result cache, the TTS phrase cache and the
//! prompt cache. `get` refreshes recency; entries past their TTL are
//! treated as misses and evicted on touch. A periodic sweep reclaims
//! expired entries that are never touched again.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    /// Bumped on every touch; stale queue records are skipped on eviction.
    generation: u64,
}

struct Inner<K, V> {
    map: HashMap<K, Entry<V>>,
    /// Recency queue of (key, generation). Oldest at the front.
    order: VecDeque<(K, u64)>,
    hits: u64,
    misses: u64,
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Bounded map with LRU eviction and TTL expiry.
pub struct LruTtlCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
    ttl: Duration,
}

impl<K, V> LruTtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity * 2),
                hits: 0,
                misses: 0,
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Look up a key, refreshing its recency on hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let expired = match inner.map.get(key) {
            Some(entry) => now.duration_since(entry.inserted_at) >= self.ttl,
            None => {
                inner.misses += 1;
                return None;
            }
        };

        if expired {
            inner.map.remove(key);
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        let entry = inner.map.get_mut(key).expect("checked above");
        entry.generation += 1;
        let generation = entry.generation;
        let value = entry.value.clone();
        inner.order.push_back((key.clone(), generation));
        Some(value)
    }

    /// Insert a value, evicting the least recently used beyond capacity.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        let generation = inner.map.get(&key).map(|e| e.generation + 1).unwrap_or(0);
        inner.map.insert(
            key.clone(),
            Entry {
                value,
                inserted_at: Instant::now(),
                generation,
            },
        );
        inner.order.push_back((key, generation));

        while inner.map.len() > self.capacity {
            let Some((candidate, gen)) = inner.order.pop_front() else {
                break;
            };
            // Skip records superseded by a later touch.
            let current = inner.map.get(&candidate).map(|e| e.generation);
            if current == Some(gen) {
                inner.map.remove(&candidate);
            }
        }
    }

    /// Remove a single key.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().map.remove(key).map(|e| e.value)
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
    }

    /// Reclaim expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let ttl = self.ttl;
        let before = inner.map.len();
        inner
            .map
            .retain(|_, e| now.duration_since(e.inserted_at) < ttl);
        before - inner.map.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let total = inner.hits + inner.misses;
        CacheStats {
            size: inner.map.len(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_and_miss_accounting() {
        let cache = LruTtlCache::new(4, Duration::from_secs(60));
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn lru_eviction_respects_recency() {
        let cache = LruTtlCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        // Touch "a" so "b" becomes the eviction candidate.
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = LruTtlCache::new(4, Duration::from_millis(0));
        cache.insert("a", 1);
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn purge_reclaims_expired() {
        let cache = LruTtlCache::new(8, Duration::from_millis(5));
        cache.insert("a", 1);
        cache.insert("b", 2);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.purge_expired(), 2);
        assert!(cache.is_empty());
    }
}
