//! Bundle signatures and the signature-keyed outcome cache.
//!
//! A signature identifies the effective content of a bundle: the same
//! span set under the same engine version and policy hashes to the
//! same value, so identical bundles collide and their outcomes
//! aggregate. A policy change flips the hash and naturally invalidates
//! everything learned against the old weights.

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Signature over a bundle's effective content:
/// `hash(sorted item keys | version | policy hash)`.
pub fn bundle_signature(item_keys: &[String], version: &str, policy_hash: &str) -> String {
    let mut sorted = item_keys.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    for key in &sorted {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(version.as_bytes());
    hasher.update([0u8]);
    hasher.update(policy_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Aggregated outcomes for one signature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignatureStats {
    /// Interactions observed for this signature.
    pub observations: u32,
    /// Of those, how many were satisfied.
    pub satisfied: u32,
}

impl SignatureStats {
    /// Satisfaction rate in [0, 1]; zero when unobserved.
    pub fn satisfaction_rate(&self) -> f64 {
        if self.observations == 0 {
            0.0
        } else {
            f64::from(self.satisfied) / f64::from(self.observations)
        }
    }
}

/// LRU-bounded signature cache. A hit refreshes recency.
pub struct SignatureCache {
    inner: Mutex<LruCache<String, SignatureStats>>,
    capacity: usize,
}

impl SignatureCache {
    /// Build a cache with the given entry bound.
    pub fn new(capacity: usize) -> Self {
        let bound = std::num::NonZeroUsize::new(capacity.max(1))
            .unwrap_or(std::num::NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(bound)),
            capacity: capacity.max(1),
        }
    }

    /// Stats for a signature, refreshing its recency.
    pub fn get(&self, signature: &str) -> Option<SignatureStats> {
        self.inner.lock().get(signature).copied()
    }

    /// Fold one observed outcome into the signature's stats.
    pub fn record(&self, signature: &str, satisfied: bool) {
        let mut inner = self.inner.lock();
        let stats = match inner.get(signature) {
            Some(stats) => SignatureStats {
                observations: stats.observations + 1,
                satisfied: stats.satisfied + u32::from(satisfied),
            },
            None => SignatureStats {
                observations: 1,
                satisfied: u32::from(satisfied),
            },
        };
        inner.put(signature.to_string(), stats);
    }

    /// Entries currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_order_insensitive() {
        let a = bundle_signature(
            &["src/a.rs:0-10".into(), "src/b.rs:5-20".into()],
            "0.4.2",
            "ph",
        );
        let b = bundle_signature(
            &["src/b.rs:5-20".into(), "src/a.rs:0-10".into()],
            "0.4.2",
            "ph",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_signature_depends_on_policy_hash() {
        let keys = vec!["src/a.rs:0-10".to_string()];
        assert_ne!(
            bundle_signature(&keys, "0.4.2", "ph1"),
            bundle_signature(&keys, "0.4.2", "ph2")
        );
        assert_ne!(
            bundle_signature(&keys, "0.4.2", "ph1"),
            bundle_signature(&keys, "0.5.0", "ph1")
        );
    }

    #[test]
    fn test_cache_records_and_aggregates() {
        let cache = SignatureCache::new(10);
        cache.record("sig", true);
        cache.record("sig", false);
        cache.record("sig", true);
        let stats = cache.get("sig").expect("stats");
        assert_eq!(stats.observations, 3);
        assert_eq!(stats.satisfied, 2);
        assert!((stats.satisfaction_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_lru_eviction_with_recency_refresh() {
        let cache = SignatureCache::new(2);
        cache.record("a", true);
        cache.record("b", true);
        // Touch "a" so "b" is the eviction victim.
        let _ = cache.get("a");
        cache.record("c", true);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert_eq!(cache.len(), 2);
    }
}
