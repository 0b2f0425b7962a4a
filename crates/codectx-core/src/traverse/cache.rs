//! Traversal result cache: TTL + LRU bounded, invalidated by edge
//! writes.
//!
//! A cached result is immutable. Hits hand back a clone stamped
//! `cache_hit = true`; the stored body is never touched, so a later
//! hit on the same entry sees identical data. Any edge upsert touching
//! a node recorded in an entry's visited set evicts that entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;

use super::TraversalResult;
use crate::types::SpanId;

struct CachedEntry {
    result: TraversalResult,
    inserted: Instant,
}

/// Hit/miss counters for cache health reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Served from cache.
    pub hits: u64,
    /// Computed fresh.
    pub misses: u64,
    /// Entries currently held.
    pub len: usize,
    /// Entry bound.
    pub capacity: usize,
}

impl CacheStats {
    /// Hit rate in [0, 1]; zero when the cache is cold.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// TTL + LRU traversal cache with node-keyed invalidation.
pub struct TraversalCache {
    entries: Mutex<LruCache<String, CachedEntry>>,
    node_index: DashMap<SpanId, Vec<String>>,
    ttl: Duration,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TraversalCache {
    /// Build a cache with the given entry bound and TTL.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let bound = std::num::NonZeroUsize::new(capacity.max(1))
            .unwrap_or(std::num::NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(bound)),
            node_index: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a result. Expired entries count as misses and are
    /// dropped in place.
    pub fn get(&self, key: &str) -> Option<TraversalResult> {
        let mut entries = self.entries.lock();
        let fresh = entries.get(key).and_then(|entry| {
            if entry.inserted.elapsed() <= self.ttl {
                let mut result = entry.result.clone();
                result.cache_hit = true;
                Some(result)
            } else {
                None
            }
        });
        match fresh {
            Some(result) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(result)
            }
            None => {
                // Absent or expired either way; pop is a no-op when
                // the key is missing.
                entries.pop(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a freshly computed result and index its visited nodes
    /// for invalidation.
    pub fn put(&self, key: String, result: &TraversalResult) {
        for node in &result.visited {
            self.node_index
                .entry(node.clone())
                .or_default()
                .push(key.clone());
        }
        let mut entries = self.entries.lock();
        entries.put(
            key,
            CachedEntry {
                result: result.clone(),
                inserted: Instant::now(),
            },
        );
    }

    /// Evict every entry whose visited set contains any of the given
    /// nodes. Called on edge upserts.
    pub fn invalidate_nodes(&self, nodes: &[SpanId]) {
        let mut entries = self.entries.lock();
        for node in nodes {
            if let Some((_, keys)) = self.node_index.remove(node) {
                for key in keys {
                    entries.pop(&key);
                }
            }
        }
    }

    /// Drop every entry. Used when a reindex rewrites a file's spans
    /// wholesale and per-node invalidation would be no cheaper.
    pub fn clear(&self) {
        self.entries.lock().clear();
        self.node_index.clear();
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: self.entries.lock().len(),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with_nodes(nodes: &[&str]) -> TraversalResult {
        TraversalResult {
            visited: nodes.iter().map(|s| s.to_string()).collect(),
            edges: Vec::new(),
            truncated: false,
            depth_reached: 1,
            tokens_used: 10,
            cache_hit: false,
        }
    }

    #[test]
    fn test_hit_sets_flag_on_clone_only() {
        let cache = TraversalCache::new(10, Duration::from_secs(60));
        cache.put("k".into(), &result_with_nodes(&["n1"]));

        let first = cache.get("k").expect("hit");
        assert!(first.cache_hit);

        // The stored body was not back-mutated by the first hit.
        let second = cache.get("k").expect("hit again");
        assert!(second.cache_hit);
        assert_eq!(second.visited, first.visited);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = TraversalCache::new(10, Duration::from_millis(0));
        cache.put("k".into(), &result_with_nodes(&["n1"]));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_invalidate_on_touched_node() {
        let cache = TraversalCache::new(10, Duration::from_secs(60));
        cache.put("k1".into(), &result_with_nodes(&["n1", "n2"]));
        cache.put("k2".into(), &result_with_nodes(&["n3"]));

        cache.invalidate_nodes(&["n2".to_string()]);
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k2").is_some());
    }

    #[test]
    fn test_lru_bound() {
        let cache = TraversalCache::new(2, Duration::from_secs(60));
        cache.put("k1".into(), &result_with_nodes(&["a"]));
        cache.put("k2".into(), &result_with_nodes(&["b"]));
        cache.put("k3".into(), &result_with_nodes(&["c"]));
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k3").is_some());
        assert_eq!(cache.stats().len, 2);
    }

    #[test]
    fn test_stats_counts() {
        let cache = TraversalCache::new(4, Duration::from_secs(60));
        cache.put("k".into(), &result_with_nodes(&["a"]));
        let _ = cache.get("k");
        let _ = cache.get("absent");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }
}
