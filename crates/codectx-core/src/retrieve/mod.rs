//! Hybrid retrieval: lexical + optional vector lanes fused with RRF,
//! optionally reordered by a rerank provider.
//!
//! Every degradation is explicit in the outcome: a missing embedding
//! model drops the vector lane, a provider outage drops the rerank
//! lane, and the caller turns those into evidence and stop reasons.
//! The fused candidate list itself is always served.

pub mod fuse;
pub mod rerank;

use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::error::CtxResult;
use crate::policy::PolicySnapshot;
use crate::providers::{EmbeddingProvider, RerankProvider};
use crate::store::Store;
use crate::types::{Lane, RankedChunk};
use crate::vector::VectorIndex;
use fuse::{rrf_fuse, LaneList};
use rerank::{rerank_candidates, RerankOutcome};

/// One retrieval request.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Natural-language or keyword query.
    pub query: String,
    /// Requested candidate count.
    pub k: usize,
    /// Restrict to one repository.
    pub repo: Option<String>,
    /// Restrict to paths matching a glob.
    pub path_glob: Option<String>,
    /// Restrict to one language tag.
    pub lang: Option<String>,
}

/// Retrieval output with per-lane accounting.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    /// Fused (and possibly reranked) candidates, best first, at most k.
    pub candidates: Vec<RankedChunk>,
    /// True when the requested k exceeded the configured maximum and
    /// was clamped.
    pub limit_clamped: bool,
    /// True when the rerank ordering came from the cache.
    pub rerank_cached: bool,
    /// Provider attempts made by the rerank lane (0 = cache hit or
    /// lane not configured).
    pub rerank_attempts: u32,
    /// Failure description when the rerank lane degraded.
    pub rerank_failure: Option<String>,
    /// Failure description when the vector lane degraded.
    pub vector_degraded: Option<String>,
    /// Candidate counts per lane before fusion, for the search log.
    pub lane_counts: serde_json::Value,
}

/// Hybrid retriever over the store's lanes.
pub struct Retriever {
    store: Arc<Store>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    reranker: Option<Arc<dyn RerankProvider>>,
    config: RetrievalConfig,
}

impl Retriever {
    /// Build a retriever. Providers are optional; their absence simply
    /// removes the corresponding lane.
    pub fn new(
        store: Arc<Store>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        reranker: Option<Arc<dyn RerankProvider>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            reranker,
            config,
        }
    }

    /// Execute a hybrid search under a policy snapshot.
    pub async fn search(
        &self,
        request: &SearchRequest,
        policy: &PolicySnapshot,
    ) -> CtxResult<RetrievalOutcome> {
        let mut outcome = RetrievalOutcome::default();

        let mut k = request.k.max(1);
        if k > self.config.max_limit {
            k = self.config.max_limit;
            outcome.limit_clamped = true;
        }
        let k_fts = (k * 3).min(200);

        // Lexical lane.
        let mut lexical_ids = Vec::new();
        for (chunk_id, _score) in
            self.store
                .fts_search(&request.query, k_fts, request.repo.as_deref(), request.path_glob.as_deref())?
        {
            if let Some(lang) = &request.lang {
                match self.store.chunk_origin(&chunk_id)? {
                    Some((_, language)) if &language == lang => {}
                    _ => continue,
                }
            }
            lexical_ids.push(chunk_id);
        }

        // Vector lane, present only when an embedder and a model are
        // configured. Chunks without an embedding simply never appear.
        let mut lanes = vec![LaneList {
            lane: Lane::Lexical,
            ranked: lexical_ids,
        }];
        if let Some(embedder) = &self.embedder {
            if policy.embedding_model != "none" {
                match self.vector_lane(embedder.as_ref(), &request.query, policy, k_fts).await {
                    Ok(ranked) => lanes.push(LaneList {
                        lane: Lane::Vector,
                        ranked,
                    }),
                    Err(e) => {
                        tracing::warn!(error = %e, "vector lane degraded to lexical-only");
                        outcome.vector_degraded = Some(e.to_string());
                    }
                }
            }
        }

        outcome.lane_counts = serde_json::json!({
            "lexical": lanes[0].ranked.len(),
            "vector": lanes.get(1).map_or(0, |l| l.ranked.len()),
        });

        let mut candidates = rrf_fuse(&lanes, &policy.lane_weights, policy.rrf_k);
        candidates.truncate(policy.max_candidates);

        // Rerank window over the fused head.
        if let Some(reranker) = &self.reranker {
            if !candidates.is_empty() {
                let n = (k * 5).min(100).min(candidates.len());
                let rerank_outcome = self
                    .rerank_window(reranker.as_ref(), &request.query, &mut candidates, n)
                    .await;
                outcome.rerank_cached = rerank_outcome.cached;
                outcome.rerank_attempts = rerank_outcome.attempts;
                outcome.rerank_failure = rerank_outcome.failure;
            }
        }

        candidates.truncate(k);
        outcome.candidates = candidates;

        if let Err(e) = self
            .store
            .log_search(&request.query, k, &outcome.lane_counts)
        {
            tracing::warn!(error = %e, "search log write failed");
        }

        Ok(outcome)
    }

    async fn vector_lane(
        &self,
        embedder: &dyn EmbeddingProvider,
        query: &str,
        policy: &PolicySnapshot,
        k: usize,
    ) -> CtxResult<Vec<String>> {
        let vectors = embedder
            .embed(&[query.to_string()], &policy.embedding_model)
            .await?;
        let query_vec = vectors.into_iter().next().unwrap_or_default();
        let index = VectorIndex::load(&self.store, &policy.embedding_model)?;
        Ok(index
            .search(&query_vec, k)
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Apply the rerank protocol to the first `n` fused candidates and
    /// reorder that window by provider score. Unscored candidates keep
    /// their fused order behind the scored ones; fused scores are never
    /// overwritten.
    async fn rerank_window(
        &self,
        reranker: &dyn RerankProvider,
        query: &str,
        candidates: &mut Vec<RankedChunk>,
        n: usize,
    ) -> RerankOutcome {
        let window_ids: Vec<String> = candidates[..n].iter().map(|c| c.chunk_id.clone()).collect();
        let mut documents = Vec::with_capacity(n);
        for id in &window_ids {
            let text = match self.store.get_chunk(id) {
                Ok(Some(chunk)) => chunk.content,
                _ => String::new(),
            };
            documents.push(text);
        }

        let outcome = rerank_candidates(
            &self.store,
            reranker,
            query,
            &window_ids,
            &documents,
            n,
            self.config.rerank_attempts,
            std::time::Duration::from_millis(self.config.rerank_backoff_ms),
        )
        .await;

        if let Some(scores) = &outcome.scores {
            let mut scored: Vec<RankedChunk> = Vec::with_capacity(n);
            let mut taken = vec![false; n];
            for s in scores {
                let idx = s.index as usize;
                if idx < n && !taken[idx] {
                    taken[idx] = true;
                    let mut candidate = candidates[idx].clone();
                    candidate.lanes.rerank = true;
                    candidate.rerank_score = Some(s.score);
                    scored.push(candidate);
                }
            }
            // Unscored window members follow in fused order.
            for (idx, candidate) in candidates[..n].iter().enumerate() {
                if !taken[idx] {
                    scored.push(candidate.clone());
                }
            }
            let tail = candidates.split_off(n);
            *candidates = scored;
            candidates.extend(tail);
        }

        outcome
    }
}
