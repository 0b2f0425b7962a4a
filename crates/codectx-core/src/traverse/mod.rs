//! Token-guarded breadth-first graph expansion.
//!
//! Traversal charges every accepted edge against a token budget and
//! stops the moment a charge would overflow, so the assembler can
//! bound how much of the request budget graph context may consume.
//! Iteration order is fixed by the store's edge ordering; identical
//! inputs over identical state produce bit-identical results.
//!
//! Depth is hard-capped at 2: beyond two hops the code graph connects
//! almost everything to everything, and relevance signal drowns.

pub mod cache;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{CtxError, CtxResult};
use crate::graph::GraphStore;
use crate::tokenizer::TokenCounter;
use crate::types::{EdgeKind, EdgeRecord, SpanId};
use cache::TraversalCache;

/// Hard cap on traversal depth.
pub const MAX_DEPTH: u8 = 2;

/// Frontier expansion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalStrategy {
    /// Store order within each level.
    Breadth,
    /// Sort each level by confidence before charging, so the highest
    /// quality edges survive truncation.
    QualityFirst,
}

impl TraversalStrategy {
    /// Stable string for cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Breadth => "breadth",
            Self::QualityFirst => "quality_first",
        }
    }
}

/// One traversal request.
#[derive(Debug, Clone)]
pub struct TraversalRequest {
    /// Query text; its token cost is the counter's starting charge.
    pub query: String,
    /// Seed spans.
    pub seeds: Vec<SpanId>,
    /// Depth bound, at most [`MAX_DEPTH`].
    pub max_depth: u8,
    /// Token budget covering the query cost plus all accepted edges.
    pub token_budget: u32,
    /// Edge kinds to follow.
    pub edge_kinds: Vec<EdgeKind>,
    /// Expansion order.
    pub strategy: TraversalStrategy,
}

/// Traversal output: visited set, accepted edges, and accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalResult {
    /// Seeds plus discovered nodes, in discovery order.
    pub visited: Vec<SpanId>,
    /// Accepted edges, in charge order.
    pub edges: Vec<EdgeRecord>,
    /// True when the token budget cut the expansion short.
    pub truncated: bool,
    /// Deepest level processed (0 = seeds only).
    pub depth_reached: u8,
    /// Tokens charged, query cost included.
    pub tokens_used: u32,
    /// True when this result was served from the cache. Set only on
    /// the returned clone, never on the cached body.
    pub cache_hit: bool,
}

/// Graph traversal engine with a shared result cache.
pub struct TraversalEngine {
    graph: GraphStore,
    tokenizer: Arc<TokenCounter>,
    cache: Arc<TraversalCache>,
}

impl TraversalEngine {
    /// Build an engine over a graph view.
    pub fn new(graph: GraphStore, tokenizer: Arc<TokenCounter>, cache: Arc<TraversalCache>) -> Self {
        Self {
            graph,
            tokenizer,
            cache,
        }
    }

    /// The shared cache, for invalidation hooks.
    pub fn cache(&self) -> &Arc<TraversalCache> {
        &self.cache
    }

    /// Run one traversal. Yields to the runtime between depth levels
    /// so a cancelled request stops at a level boundary.
    pub async fn traverse(&self, request: &TraversalRequest) -> CtxResult<TraversalResult> {
        if request.max_depth > MAX_DEPTH {
            return Err(CtxError::Config {
                details: format!(
                    "max_depth {} exceeds the hard cap {MAX_DEPTH}",
                    request.max_depth
                ),
            });
        }

        let key = cache_key(request);
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(seeds = request.seeds.len(), "traversal cache hit");
            return Ok(hit);
        }

        let result = self.run(request).await?;
        self.cache.put(key, &result);
        Ok(result)
    }

    async fn run(&self, request: &TraversalRequest) -> CtxResult<TraversalResult> {
        let mut visited: Vec<SpanId> = Vec::new();
        let mut visited_set: HashSet<SpanId> = HashSet::new();
        for seed in &request.seeds {
            if visited_set.insert(seed.clone()) {
                visited.push(seed.clone());
            }
        }

        let mut tokens_used = self
            .tokenizer
            .count_json(&serde_json::Value::String(request.query.clone()));
        let mut edges: Vec<EdgeRecord> = Vec::new();
        let mut seen_edges: HashSet<(String, String, EdgeKind)> = HashSet::new();
        let mut truncated = false;
        let mut depth_reached = 0u8;

        let kinds: Option<&[EdgeKind]> = if request.edge_kinds.is_empty() {
            None
        } else {
            Some(&request.edge_kinds)
        };

        let mut frontier = visited.clone();

        for depth in 0..request.max_depth {
            if frontier.is_empty() || truncated {
                break;
            }

            // Collect the level's unseen edges in store order.
            let mut level_edges: Vec<(SpanId, EdgeRecord)> = Vec::new();
            for node in &frontier {
                for edge in self.graph.neighbors(node, kinds)? {
                    if seen_edges.insert(edge.identity()) {
                        level_edges.push((node.clone(), edge));
                    }
                }
            }

            if level_edges.is_empty() {
                break;
            }

            if request.strategy == TraversalStrategy::QualityFirst {
                level_edges.sort_by(|a, b| {
                    b.1.confidence
                        .partial_cmp(&a.1.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.1.identity().cmp(&b.1.identity()))
                });
            }

            let mut next_frontier: Vec<SpanId> = Vec::new();
            for (node, edge) in level_edges {
                let cost = self.tokenizer.count_json(&edge_charge_json(&edge));
                if tokens_used + cost > request.token_budget {
                    truncated = true;
                    break;
                }
                tokens_used += cost;
                // A level counts as reached once it lands an edge.
                depth_reached = depth + 1;

                if let Some(other) = GraphStore::other_endpoint(&edge, &node) {
                    if visited_set.insert(other.clone()) {
                        visited.push(other.clone());
                        next_frontier.push(other);
                    }
                }
                edges.push(edge);
            }

            frontier = next_frontier;

            // Level boundary: let the runtime check for cancellation.
            tokio::task::yield_now().await;
        }

        Ok(TraversalResult {
            visited,
            edges,
            truncated,
            depth_reached,
            tokens_used,
            cache_hit: false,
        })
    }
}

/// Serialized form an accepted edge is charged as.
fn edge_charge_json(edge: &EdgeRecord) -> serde_json::Value {
    serde_json::json!({
        "src": edge.source_id,
        "dst": edge.target.key(),
        "kind": edge.kind.as_str(),
        "confidence": edge.confidence,
    })
}

/// Cache key over the inputs that determine a traversal's output.
fn cache_key(request: &TraversalRequest) -> String {
    let mut seeds = request.seeds.clone();
    seeds.sort();
    let mut kinds: Vec<&str> = request.edge_kinds.iter().map(EdgeKind::as_str).collect();
    kinds.sort_unstable();
    let query_fingerprint = xxh3_64(request.query.as_bytes());
    format!(
        "{}|{}|{}|{}|{:016x}|{}",
        seeds.join(","),
        request.max_depth,
        kinds.join(","),
        request.strategy.as_str(),
        query_fingerprint,
        request.token_budget,
    )
}
