//! Bounded cache with TTL and max-size eviction.
//!
//! Block timestamps never change once a block is final, but the tracker may
//! run for weeks, so entries still expire and the map never grows past
//! `max_size`.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub const DEFAULT_BLOCK_CACHE_SIZE: usize = 10_000;
pub const DEFAULT_BLOCK_CACHE_TTL_SECS: u64 = 3_600;

/// Map of `K → V` with TTL and capacity limits.
///
/// - **Max capacity:** when full, the oldest entry is evicted on insert.
/// - **TTL:** expired entries are invisible to `get` and dropped on insert.
pub struct BoundedTtlCache<K, V> {
    map: HashMap<K, (V, Instant)>,
    max_size: usize,
    ttl: Duration,
}

impl<K, V> BoundedTtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            max_size: max_size.max(1),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map
            .get(key)
            .filter(|(_, t)| t.elapsed() < self.ttl)
            .map(|(v, _)| v.clone())
    }

    pub fn insert(&mut self, key: K, value: V) {
        let now = Instant::now();
        self.map
            .retain(|_, (_, t)| now.duration_since(*t) < self.ttl);
        while self.map.len() >= self.max_size && !self.map.contains_key(&key) {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, (_, t))| *t)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.map.remove(&k);
                }
                None => break,
            }
        }
        self.map.insert(key, (value, now));
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut cache = BoundedTtlCache::new(10, Duration::from_secs(60));
        cache.insert(1000u64, 1_700_000_000i64);
        assert_eq!(cache.get(&1000), Some(1_700_000_000));
        assert_eq!(cache.get(&1001), None);
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let mut cache = BoundedTtlCache::new(2, Duration::from_secs(60));
        cache.insert(1u64, "a");
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(2u64, "b");
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(3u64, "c");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&3), Some("c"));
    }

    #[test]
    fn test_reinsert_existing_key_does_not_evict() {
        let mut cache = BoundedTtlCache::new(2, Duration::from_secs(60));
        cache.insert(1u64, 1);
        cache.insert(2u64, 2);
        cache.insert(2u64, 20);
        assert_eq!(cache.get(&1), Some(1));
        assert_eq!(cache.get(&2), Some(20));
    }

    #[test]
    fn test_expired_entries_are_hidden() {
        let mut cache = BoundedTtlCache::new(10, Duration::from_millis(1));
        cache.insert(1u64, 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&1), None);
        cache.insert(2u64, 2);
        assert_eq!(cache.len(), 1);
    }
}
