//! In-memory TTL caches shared across requests.
//!
//! One generic cache backs the result cache, the query-expansion cache, and
//! the embedding cache. Entries are evicted on expiry and, when the cache is
//! full, in least-recently-used order. All caches live at process scope on
//! the [`CoreContext`](crate::context::CoreContext); nothing is persisted.
//!
//! # Cache Key Strategy
//!
//! Keys are SHA-256 hashes of `prefix | normalized input` so that:
//! - different operations sharing one cache never collide
//! - keys are stable across restarts
//! - tenant/scope material mixed into the input can never be elided

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Statistics for cache performance monitoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries in cache.
    pub entry_count: usize,
    /// Number of evictions due to capacity or expiry.
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    last_accessed: Instant,
    expires_at: Instant,
}

/// A TTL + size bounded cache, safe for concurrent access.
///
/// Thread-safe via `parking_lot::RwLock`; hit/miss/eviction counters are
/// lock-free atomics.
pub struct TtlCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    max_entries: usize,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone> TtlCache<V> {
    /// Create a cache bounded to `max_entries` with the given default TTL.
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Compute a namespaced cache key.
    pub fn compute_key(prefix: &str, input: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prefix.as_bytes());
        hasher.update(b"|");
        hasher.update(input.trim().to_lowercase().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Get a value, refreshing its recency. Expired entries count as misses.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => {}
                _ => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_accessed = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value with the default TTL.
    pub fn set(&self, key: &str, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Store a value with an explicit TTL.
    pub fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write();

        // Drop expired entries first, then fall back to LRU eviction.
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.expires_at <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for k in expired {
                entries.remove(&k);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }

            while entries.len() >= self.max_entries {
                let lru = entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_accessed)
                    .map(|(k, _)| k.clone());
                match lru {
                    Some(k) => {
                        entries.remove(&k);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                last_accessed: now,
                expires_at: now + ttl,
            },
        );
    }

    /// Remove an entry.
    pub fn invalidate(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Current number of entries (including not-yet-evicted expired ones).
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.read().len(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> TtlCache<String> {
        TtlCache::new(3, Duration::from_secs(60))
    }

    #[test]
    fn test_compute_key_namespacing() {
        let a = TtlCache::<String>::compute_key("hyde", "responsabilidade civil");
        let b = TtlCache::<String>::compute_key("multi_query", "responsabilidade civil");
        let c = TtlCache::<String>::compute_key("hyde", "  Responsabilidade Civil  ");
        assert_ne!(a, b);
        // Normalized input: trim + lowercase
        assert_eq!(a, c);
    }

    #[test]
    fn test_set_get_and_stats() {
        let cache = cache();
        assert!(cache.get("k").is_none());
        cache.set("k", "v".to_string());
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = TtlCache::new(10, Duration::from_secs(60));
        cache.set_with_ttl("k", "v".to_string(), Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache = cache();
        cache.set("a", "1".to_string());
        cache.set("b", "2".to_string());
        cache.set("c", "3".to_string());

        // Touch a and c so b becomes the LRU entry
        let _ = cache.get("a");
        let _ = cache.get("c");

        cache.set("d", "4".to_string());
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("d").is_some());
        assert!(cache.stats().evictions >= 1);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = cache();
        cache.set("a", "1".to_string());
        cache.set("b", "2".to_string());
        cache.invalidate("a");
        assert!(cache.get("a").is_none());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            entry_count: 0,
            evictions: 0,
        };
        assert!((stats.hit_rate() - 75.0).abs() < 0.001);
    }
}
