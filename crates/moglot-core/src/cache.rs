//! Bounded, time-expiring memoization for expensive aggregate queries.
//!
//! Entries are keyed by operation name plus parameters and carry their
//! insertion time. Reads evict stale entries; writes at capacity evict
//! the entry with the oldest insertion. No recency tracking.

use std::collections::HashMap;
use std::fmt::Display;
use std::time::{Duration, Instant};

use xxhash_rust::xxh3::xxh3_64;

/// Cache key: operation name plus named parameters. Parameters are
/// sorted before hashing so argument order never splits the key.
#[derive(Debug, Clone)]
pub struct CacheKey {
    operation: &'static str,
    params: Vec<(String, String)>,
}

impl CacheKey {
    pub fn new(operation: &'static str) -> Self {
        CacheKey {
            operation,
            params: Vec::new(),
        }
    }

    pub fn param(mut self, name: &str, value: impl Display) -> Self {
        self.params.push((name.to_string(), value.to_string()));
        self
    }

    fn fingerprint(&self) -> u64 {
        let mut params = self.params.clone();
        params.sort();
        let mut data = String::from(self.operation);
        for (name, value) in &params {
            data.push('|');
            data.push_str(name);
            data.push('=');
            data.push_str(value);
        }
        xxh3_64(data.as_bytes())
    }
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    seq: u64,
}

pub struct ResultCache<V> {
    entries: HashMap<u64, Entry<V>>,
    ttl: Duration,
    capacity: usize,
    seq: u64,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        ResultCache {
            entries: HashMap::new(),
            ttl,
            capacity,
            seq: 0,
        }
    }

    /// A fresh entry's value, or `None`. Stale entries are removed on
    /// the read that finds them.
    pub fn get(&mut self, key: &CacheKey) -> Option<V> {
        let fp = key.fingerprint();
        match self.entries.get(&fp) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                self.entries.remove(&fp);
                None
            }
            None => None,
        }
    }

    /// Store a value, evicting the oldest insertion when a new key
    /// would exceed capacity. Overwriting an existing key evicts
    /// nothing. A zero capacity disables storage entirely.
    pub fn put(&mut self, key: &CacheKey, value: V) {
        if self.capacity == 0 {
            return;
        }
        let fp = key.fingerprint();
        if !self.entries.contains_key(&fp) && self.entries.len() >= self.capacity {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(k, _)| *k)
            {
                self.entries.remove(&oldest);
            }
        }
        self.seq += 1;
        self.entries.insert(
            fp,
            Entry {
                value,
                inserted_at: Instant::now(),
                seq: self.seq,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn key(name: &'static str) -> CacheKey {
        CacheKey::new(name)
    }

    #[test]
    fn test_hit_within_ttl() {
        let mut cache = ResultCache::new(Duration::from_secs(60), 10);
        cache.put(&key("patterns"), 42);
        assert_eq!(cache.get(&key("patterns")), Some(42));
    }

    #[test]
    fn test_stale_entry_evicted_on_read() {
        let mut cache = ResultCache::new(Duration::from_millis(30), 10);
        cache.put(&key("patterns"), 42);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get(&key("patterns")), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_param_order_does_not_split_keys() {
        let mut cache = ResultCache::new(Duration::from_secs(60), 10);
        let forward = CacheKey::new("patterns").param("db", "shop").param("limit", 50);
        let reversed = CacheKey::new("patterns").param("limit", 50).param("db", "shop");
        cache.put(&forward, 1);
        assert_eq!(cache.get(&reversed), Some(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_different_params_are_different_keys() {
        let mut cache = ResultCache::new(Duration::from_secs(60), 10);
        cache.put(&CacheKey::new("patterns").param("db", "a"), 1);
        cache.put(&CacheKey::new("patterns").param("db", "b"), 2);
        assert_eq!(cache.get(&CacheKey::new("patterns").param("db", "a")), Some(1));
        assert_eq!(cache.get(&CacheKey::new("patterns").param("db", "b")), Some(2));
    }

    #[test]
    fn test_capacity_evicts_oldest_insertion() {
        let mut cache = ResultCache::new(Duration::from_secs(60), 3);
        cache.put(&key("a"), 1);
        cache.put(&key("b"), 2);
        cache.put(&key("c"), 3);
        cache.put(&key("d"), 4);
        assert_eq!(cache.get(&key("a")), None);
        assert_eq!(cache.get(&key("b")), Some(2));
        assert_eq!(cache.get(&key("d")), Some(4));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_overwrite_refreshes_insertion_order() {
        let mut cache = ResultCache::new(Duration::from_secs(60), 2);
        cache.put(&key("a"), 1);
        cache.put(&key("b"), 2);
        cache.put(&key("a"), 10);
        cache.put(&key("c"), 3);
        // "b" was the oldest insertion once "a" was rewritten.
        assert_eq!(cache.get(&key("b")), None);
        assert_eq!(cache.get(&key("a")), Some(10));
        assert_eq!(cache.get(&key("c")), Some(3));
    }

    #[test]
    fn test_zero_capacity_disables_storage() {
        let mut cache = ResultCache::new(Duration::from_secs(60), 0);
        cache.put(&key("a"), 1);
        assert_eq!(cache.get(&key("a")), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut cache = ResultCache::new(Duration::from_secs(60), 10);
        cache.put(&key("a"), 1);
        cache.put(&key("b"), 2);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&key("a")), None);
    }
}
