//! Small TTL cache for node and location lookups.
//!
//! Not internally synchronized; the engine wraps each cache in a mutex.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() >= ttl
    }
}

/// Map whose entries expire `ttl` after insertion. A zero TTL disables
/// caching.
///
/// Every invalidation bumps a generation counter. A caller that loads a
/// value outside the lock reads the generation first and stores the value
/// with [`TtlCache::insert_if_current`], so a load that raced an
/// invalidation is dropped instead of resurrecting the old row.
pub struct TtlCache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    ttl: Duration,
    generation: u64,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            generation: 0,
        }
    }

    /// Cached value, if present and fresh. Expired entries are removed.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let expired = self.entries.get(key)?.is_expired(self.ttl);
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|e| e.value.clone())
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Insert only if nothing was invalidated since `generation` was read.
    /// Returns whether the value was stored.
    pub fn insert_if_current(&mut self, key: K, value: V, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.insert(key, value);
        true
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn invalidate(&mut self, key: &K) {
        self.entries.remove(key);
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_then_invalidate() {
        let mut cache = TtlCache::new(Duration::from_secs(60));
        cache.insert(1u64, "node-a".to_string());
        assert_eq!(cache.get(&1).as_deref(), Some("node-a"));

        cache.invalidate(&1);
        assert!(cache.get(&1).is_none());
    }

    #[test]
    fn load_racing_invalidation_is_dropped() {
        let mut cache = TtlCache::new(Duration::from_secs(60));
        let seen = cache.generation();
        // Row changes and is invalidated while the caller is still loading.
        cache.invalidate(&1u64);
        assert!(!cache.insert_if_current(1, "node-a".to_string(), seen));
        assert!(cache.get(&1).is_none());

        let seen = cache.generation();
        assert!(cache.insert_if_current(1, "node-b".to_string(), seen));
        assert_eq!(cache.get(&1).as_deref(), Some("node-b"));
    }

    #[test]
    fn entries_expire() {
        let mut cache = TtlCache::new(Duration::from_millis(10));
        cache.insert(1u64, 42u32);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let mut cache = TtlCache::new(Duration::ZERO);
        cache.insert(1u64, 42u32);
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.len(), 0);
    }
}
