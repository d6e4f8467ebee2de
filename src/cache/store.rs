//! In-memory TTL store backing the gateway's response cache.
//!
//! Entries are valid while `now - created_at < ttl`. Expired entries stay
//! behind (bounded by LRU capacity and the stale-retention sweep) so the
//! gateway can fall back to them when the backend is unreachable, but they
//! are only ever handed out through [`TtlStore::get_stale`], which labels
//! them as such.

use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use tokio::time::Instant;

use super::config::CacheConfig;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";

const METRIC_HIT: &str = "paddock_gateway_cache_hit_total";
const METRIC_MISS: &str = "paddock_gateway_cache_miss_total";
const METRIC_EVICT: &str = "paddock_gateway_cache_evict_total";

/// A cached value with its write time and lifetime.
#[derive(Debug, Clone)]
pub struct Entry<V> {
    pub value: V,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl<V> Entry<V> {
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < self.ttl
    }

    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// How a cached value relates to its TTL when it is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Fetched from the backend just now.
    Fetched,
    /// Served from memory within its TTL.
    Cached,
    /// Served from memory past its TTL because the backend failed.
    Stale,
}

/// LRU-bounded map of TTL entries.
pub struct TtlStore<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, Entry<V>>>,
}

impl<K, V> TtlStore<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(config.capacity_non_zero())),
        }
    }

    /// Return the value only if its entry is still valid.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        match entries.get(key) {
            Some(entry) if entry.is_valid_at(now) => {
                counter!(METRIC_HIT).increment(1);
                Some(entry.value.clone())
            }
            _ => {
                counter!(METRIC_MISS).increment(1);
                None
            }
        }
    }

    /// Return whatever is retained for the key, expired or not, together with
    /// its age.
    pub fn get_stale(&self, key: &K) -> Option<(V, Duration)> {
        let now = Instant::now();
        mutex_lock(&self.entries, SOURCE, "get_stale")
            .peek(key)
            .map(|entry| (entry.value.clone(), entry.age_at(now)))
    }

    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            created_at: Instant::now(),
            ttl,
        };
        let evicted = mutex_lock(&self.entries, SOURCE, "insert").push(key.clone(), entry);
        if let Some((evicted_key, _)) = evicted
            && evicted_key != key
        {
            counter!(METRIC_EVICT).increment(1);
        }
    }

    /// Remove every entry whose key satisfies the predicate.
    pub fn invalidate_where(&self, mut predicate: impl FnMut(&K) -> bool) -> usize {
        let mut entries = mutex_lock(&self.entries, SOURCE, "invalidate_where");
        let doomed: Vec<K> = entries
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    /// Evict entries that expired more than `retention` ago.
    pub fn purge_expired(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "purge_expired");
        let doomed: Vec<K> = entries
            .iter()
            .filter(|(_, entry)| entry.age_at(now) >= entry.ttl.saturating_add(retention))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    pub fn clear(&self) {
        mutex_lock(&self.entries, SOURCE, "clear").clear();
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    fn store(capacity: usize) -> TtlStore<&'static str, u32> {
        TtlStore::new(&CacheConfig {
            capacity,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn entry_is_valid_until_ttl_elapses() {
        let store = store(8);
        let ttl = Duration::from_secs(60);
        store.insert("featured", 1, ttl);

        tokio::time::advance(ttl - Duration::from_millis(1)).await;
        assert_eq!(store.get(&"featured"), Some(1));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(store.get(&"featured"), None);
        let (stale, age) = store.get_stale(&"featured").expect("retained");
        assert_eq!(stale, 1);
        assert!(age > ttl);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_respects_retention() {
        let store = store(8);
        store.insert("a", 1, Duration::from_secs(10));
        store.insert("b", 2, Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.purge_expired(Duration::from_secs(60)), 0);

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(store.purge_expired(Duration::from_secs(60)), 1);
        assert!(store.get_stale(&"a").is_none());
        assert_eq!(store.get(&"b"), Some(2));
    }

    #[tokio::test]
    async fn invalidate_where_drops_matching_keys() {
        let store = store(8);
        store.insert("posts:all", 1, Duration::from_secs(60));
        store.insert("posts:featured", 2, Duration::from_secs(60));
        store.insert("categories:all", 3, Duration::from_secs(60));

        let dropped = store.invalidate_where(|key| key.starts_with("posts:"));
        assert_eq!(dropped, 2);
        assert_eq!(store.len(), 1);
        assert!(store.get_stale(&"posts:all").is_none());
    }

    #[tokio::test]
    async fn lru_eviction_bounds_memory() {
        let store = store(2);
        store.insert("a", 1, Duration::from_secs(60));
        store.insert("b", 2, Duration::from_secs(60));
        store.insert("c", 3, Duration::from_secs(60));

        assert!(store.get(&"a").is_none());
        assert_eq!(store.get(&"c"), Some(3));
    }

    #[tokio::test]
    async fn store_recovers_from_poisoned_lock() {
        let store = store(2);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.entries.lock().expect("lock should be acquired");
            panic!("poison store lock");
        }));

        store.insert("a", 1, Duration::from_secs(60));
        assert_eq!(store.get(&"a"), Some(1));
    }
}
