//! Rerank orchestration: cache replay, retry with backoff, and soft
//! failure.
//!
//! The cache is immutable and keyed by the full call identity
//! (provider, model, query, sorted candidate ids), so a hit is always
//! an exact replay. Terminal provider failures (4xx) fall back to the
//! fused order; retryable failures (5xx/timeout) back off exponentially
//! up to the attempt cap. A failed call never writes the cache.

use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::CtxError;
use crate::providers::{RerankProvider, RerankScore};
use crate::store::Store;
use crate::types::ChunkId;

/// Outcome of one rerank orchestration.
#[derive(Debug, Clone, Default)]
pub struct RerankOutcome {
    /// Scores sorted descending, indices into the submitted candidate
    /// list. None when the rerank lane degraded.
    pub scores: Option<Vec<RerankScore>>,
    /// True when the ordering came from the cache.
    pub cached: bool,
    /// Provider calls actually made (0 on cache hit).
    pub attempts: u32,
    /// Failure detail when the lane degraded.
    pub failure: Option<String>,
}

/// Cache key over the full call identity. Candidate ids are sorted so
/// the key is insensitive to fused-order changes among the same set.
pub fn cache_key(provider: &str, model: &str, query: &str, candidate_ids: &[ChunkId]) -> String {
    let mut sorted = candidate_ids.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    for part in [provider, model, query] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    for id in &sorted {
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Run the rerank protocol for one candidate window.
pub async fn rerank_candidates(
    store: &Store,
    provider: &dyn RerankProvider,
    query: &str,
    candidate_ids: &[ChunkId],
    documents: &[String],
    top_k: usize,
    max_attempts: u32,
    backoff: Duration,
) -> RerankOutcome {
    let key = cache_key(provider.name(), provider.model(), query, candidate_ids);

    match store.rerank_cache_get(&key) {
        Ok(Some(ordering)) => {
            return RerankOutcome {
                scores: Some(
                    ordering
                        .into_iter()
                        .map(|(index, score)| RerankScore { index, score })
                        .collect(),
                ),
                cached: true,
                attempts: 0,
                failure: None,
            };
        }
        Ok(None) => {}
        Err(e) => {
            // A broken cache read degrades to a live call.
            tracing::warn!(error = %e, "rerank cache read failed");
        }
    }

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match provider.rerank(query, documents, top_k).await {
            Ok(scores) => {
                let payload: Vec<(u32, f64)> = scores
                    .iter()
                    .map(|s| (s.index, trunc6(s.score)))
                    .collect();
                if let Err(e) = store.rerank_cache_put(&key, &payload) {
                    tracing::warn!(error = %e, "rerank cache write failed");
                }
                return RerankOutcome {
                    scores: Some(scores),
                    cached: false,
                    attempts,
                    failure: None,
                };
            }
            Err(CtxError::Provider {
                retryable: true,
                message,
                ..
            }) if attempts < max_attempts => {
                let delay = backoff * 2u32.saturating_pow(attempts - 1);
                tracing::debug!(attempt = attempts, %message, delay_ms = delay.as_millis() as u64, "rerank retry");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::warn!(attempts, error = %e, "rerank lane degraded");
                return RerankOutcome {
                    scores: None,
                    cached: false,
                    attempts,
                    failure: Some(e.to_string()),
                };
            }
        }
    }
}

/// Truncate a score to 6 decimals before it enters the cache payload,
/// so replayed orderings hash identically across platforms.
fn trunc6(x: f64) -> f64 {
    (x * 1e6).trunc() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_support::{ScriptedCall, ScriptedRerankProvider};

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Store::open(&dir.path().join("r.db"), 1).expect("open");
        (dir, store)
    }

    fn ids(n: usize) -> Vec<ChunkId> {
        (0..n).map(|i| format!("chunk{i}")).collect()
    }

    fn docs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("doc {i}")).collect()
    }

    #[test]
    fn test_cache_key_insensitive_to_candidate_order() {
        let forward = ids(3);
        let mut reversed = forward.clone();
        reversed.reverse();
        assert_eq!(
            cache_key("p", "m", "q", &forward),
            cache_key("p", "m", "q", &reversed)
        );
        assert_ne!(
            cache_key("p", "m", "q", &forward),
            cache_key("p", "m", "other query", &forward)
        );
    }

    #[tokio::test]
    async fn test_success_writes_cache_and_replays() {
        let (_dir, store) = open_store();
        let provider = ScriptedRerankProvider::new(vec![ScriptedCall::SucceedReversed]);

        let first = rerank_candidates(
            &store, &provider, "q", &ids(3), &docs(3), 10, 3,
            Duration::from_millis(1),
        )
        .await;
        assert!(!first.cached);
        assert_eq!(first.attempts, 1);
        let first_scores = first.scores.expect("scores");

        let second = rerank_candidates(
            &store, &provider, "q", &ids(3), &docs(3), 10, 3,
            Duration::from_millis(1),
        )
        .await;
        assert!(second.cached);
        assert_eq!(second.attempts, 0);
        assert_eq!(provider.call_count(), 1);
        let second_scores = second.scores.expect("scores");
        assert_eq!(
            first_scores.iter().map(|s| s.index).collect::<Vec<_>>(),
            second_scores.iter().map(|s| s.index).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_retryable_failures_exhaust_attempts_without_cache_write() {
        let (_dir, store) = open_store();
        let provider = ScriptedRerankProvider::new(vec![
            ScriptedCall::FailRetryable,
            ScriptedCall::FailRetryable,
            ScriptedCall::FailRetryable,
        ]);

        let outcome = rerank_candidates(
            &store, &provider, "q", &ids(2), &docs(2), 10, 3,
            Duration::from_millis(1),
        )
        .await;
        assert!(outcome.scores.is_none());
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.failure.is_some());
        assert_eq!(provider.call_count(), 3);

        let key = cache_key("scripted", "scripted-v1", "q", &ids(2));
        assert!(store.rerank_cache_get(&key).expect("get").is_none());
    }

    #[tokio::test]
    async fn test_terminal_failure_stops_immediately() {
        let (_dir, store) = open_store();
        let provider = ScriptedRerankProvider::new(vec![ScriptedCall::FailTerminal]);

        let outcome = rerank_candidates(
            &store, &provider, "q", &ids(2), &docs(2), 10, 3,
            Duration::from_millis(1),
        )
        .await;
        assert!(outcome.scores.is_none());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_then_success_recovers() {
        let (_dir, store) = open_store();
        let provider = ScriptedRerankProvider::new(vec![
            ScriptedCall::FailRetryable,
            ScriptedCall::SucceedReversed,
        ]);

        let outcome = rerank_candidates(
            &store, &provider, "q", &ids(2), &docs(2), 10, 3,
            Duration::from_millis(1),
        )
        .await;
        assert!(outcome.scores.is_some());
        assert_eq!(outcome.attempts, 2);
    }

    #[test]
    fn test_trunc6() {
        assert!((trunc6(0.123_456_789) - 0.123_456).abs() < 1e-12);
        assert!((trunc6(-0.123_456_789) - -0.123_456).abs() < 1e-12);
    }
}
