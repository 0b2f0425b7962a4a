//! The engine façade: owns every subsystem and drives the request
//! pipeline.
//!
//! One request is a linear sequence of async stages sharing a deadline
//! and a policy snapshot taken at the start:
//!
//! ```text
//! query --> retriever (seeds) --> traversal (neighbors)
//!       --> assembler (pack under budget) --> bundle
//! ```
//!
//! Every stage checks the deadline before its next suspension point;
//! expiry yields the partial bundle with a TIMEOUT stop reason instead
//! of an error.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::assemble::bundle::{ContextBundle, TokenReport};
use crate::assemble::{Assembler, Candidate, PackOutcome, ViaEdge};
use crate::config::Config;
use crate::error::{CtxError, CtxResult};
use crate::graph::GraphStore;
use crate::ingest::{FileIngest, IngestRecord, Ingestor, ReferenceRecord};
use crate::learn::signature::bundle_signature;
use crate::learn::{LearnOutcome, Learner};
use crate::policy::PolicyStore;
use crate::providers::{EmbeddingProvider, RerankProvider};
use crate::retrieve::{Retriever, SearchRequest};
use crate::stop::{StopKind, StopLog, StopReason};
use crate::store::{ReindexOutcome, Store, StoreStats};
use crate::tokenizer::TokenCounter;
use crate::traverse::cache::TraversalCache;
use crate::traverse::{TraversalEngine, TraversalRequest, TraversalStrategy, MAX_DEPTH};
use crate::types::{CandidateObservation, EdgeKind, Interaction, LaneMask, SpanId};

/// One context request.
#[derive(Debug, Clone)]
pub struct AssembleRequest {
    /// Natural-language query.
    pub query: String,
    /// Token budget; 0 means the configured default.
    pub budget: u32,
    /// Graph expansion depth, at most 2.
    pub depth: u8,
    /// Attach nearest tests to implementation items.
    pub include_tests: bool,
    /// Keep plain comments in rendered bodies.
    pub verbose_comments: bool,
    /// Seed candidate count; 0 means the configured default.
    pub k: usize,
    /// Restrict to one repository.
    pub repo: Option<String>,
    /// Restrict to paths matching a glob.
    pub path_glob: Option<String>,
    /// Restrict to one language tag.
    pub lang: Option<String>,
}

impl AssembleRequest {
    /// A request with defaults for everything but the query.
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            budget: 0,
            depth: 1,
            include_tests: true,
            verbose_comments: false,
            k: 0,
            repo: None,
            path_glob: None,
            lang: None,
        }
    }
}

/// An assembled bundle plus the learning-side artifacts that belong
/// to the same run.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    /// The bundle, the externally stable contract.
    pub bundle: ContextBundle,
    /// Bundle signature (sorted item keys | version | policy hash).
    pub signature: String,
    /// Candidate set observed during this run, for interaction records.
    pub observations: Vec<CandidateObservation>,
}

/// Engine status for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    /// Store table counts.
    pub store: StoreStats,
    /// Traversal cache hit/miss counters.
    pub traversal_cache_hits: u64,
    /// Traversal cache misses.
    pub traversal_cache_misses: u64,
    /// Active policy version.
    pub policy_version: u64,
    /// Active policy hash.
    pub policy_hash: String,
    /// Tokenizer model in use.
    pub tokenizer_model: String,
}

/// The codectx engine. Owns the store, caches, providers, and policy;
/// everything a request needs flows through here.
pub struct ContextEngine {
    config: Config,
    store: Arc<Store>,
    tokenizer: Arc<TokenCounter>,
    retriever: Retriever,
    graph: GraphStore,
    traversal: TraversalEngine,
    assembler: Assembler,
    ingestor: Ingestor,
    learner: Learner,
    policy: PolicyStore,
}

impl ContextEngine {
    /// Create an engine for the given repository, loading layered
    /// configuration.
    pub fn new(repo_path: &Path) -> CtxResult<Self> {
        let config = Config::load(repo_path)?;
        Self::with_config(config)
    }

    /// Create an engine with explicit configuration and no providers.
    pub fn with_config(config: Config) -> CtxResult<Self> {
        Self::with_providers(config, None, None)
    }

    /// Create an engine with explicit configuration and providers.
    pub fn with_providers(
        config: Config,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        reranker: Option<Arc<dyn RerankProvider>>,
    ) -> CtxResult<Self> {
        config.validate()?;

        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)?;
        let store = Arc::new(Store::open(
            &data_dir.join("ctx.db"),
            config.store.reader_pool_size,
        )?);

        let tokenizer = Arc::new(TokenCounter::new(&config.tokenizer));
        let policy = PolicyStore::load_or_default(&store)?;

        let retriever = Retriever::new(
            store.clone(),
            embedder,
            reranker,
            config.retrieval.clone(),
        );
        let graph = GraphStore::new(store.clone());
        let cache = Arc::new(TraversalCache::new(
            config.traversal.cache_capacity,
            Duration::from_secs(config.traversal.cache_ttl_secs),
        ));
        let traversal = TraversalEngine::new(GraphStore::new(store.clone()), tokenizer.clone(), cache);
        let assembler = Assembler::new(tokenizer.clone(), config.assembly.clone());
        let ingestor = Ingestor::new(store.clone());
        let learner = Learner::new(config.learner.clone());

        tracing::info!(
            repo = %config.repo_path.display(),
            data_dir = %data_dir.display(),
            tokenizer = tokenizer.model(),
            policy_version = policy.snapshot().version,
            "engine initialized"
        );

        Ok(Self {
            config,
            store,
            tokenizer,
            retriever,
            graph,
            traversal,
            assembler,
            ingestor,
            learner,
            policy,
        })
    }

    /// The underlying store (read access for tooling).
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The policy holder.
    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    // -----------------------------------------------------------------
    // Ingest
    // -----------------------------------------------------------------

    /// Ingest one JSONL record.
    pub fn ingest_record(&self, record: &IngestRecord) -> CtxResult<()> {
        match record {
            IngestRecord::File(file) => {
                self.ingest_file(file)?;
            }
            IngestRecord::Reference(reference) => {
                self.ingest_reference(reference)?;
            }
        }
        Ok(())
    }

    /// Ingest a file; a structural change flushes the traversal cache.
    pub fn ingest_file(&self, file: &FileIngest) -> CtxResult<ReindexOutcome> {
        let outcome = self.ingestor.ingest_file(file)?;
        if !outcome.unchanged {
            self.traversal.cache().clear();
        }
        Ok(outcome)
    }

    /// Ingest a reference edge, evicting traversal results that
    /// touched either endpoint.
    pub fn ingest_reference(&self, reference: &ReferenceRecord) -> CtxResult<()> {
        let touched = self.ingestor.ingest_reference(reference)?;
        self.traversal.cache().invalidate_nodes(&touched);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Assembly
    // -----------------------------------------------------------------

    /// Run the full pipeline for one request.
    pub async fn assemble(&self, request: &AssembleRequest) -> CtxResult<AssembledContext> {
        if request.depth > MAX_DEPTH {
            return Err(CtxError::Config {
                details: format!("depth {} exceeds the hard cap {MAX_DEPTH}", request.depth),
            });
        }
        let budget = if request.budget == 0 {
            self.config.assembly.token_budget
        } else {
            request.budget
        };
        let k = if request.k == 0 {
            self.config.retrieval.default_limit
        } else {
            request.k
        };

        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.assembly.deadline_ms);
        let policy = self.policy.snapshot();
        let mut stop = StopLog::new();

        // Stage 1: retrieval.
        let retrieval = self
            .retriever
            .search(
                &SearchRequest {
                    query: request.query.clone(),
                    k,
                    repo: request.repo.clone(),
                    path_glob: request.path_glob.clone(),
                    lang: request.lang.clone(),
                },
                &policy,
            )
            .await?;

        if retrieval.limit_clamped {
            stop.record(StopReason::new(
                StopKind::LimitReached,
                serde_json::json!({"requested": request.k, "max": self.config.retrieval.max_limit}),
                "requested candidate count exceeded the configured maximum",
            ));
        }
        if let Some(failure) = &retrieval.vector_degraded {
            stop.record(StopReason::new(
                StopKind::SearchFailure,
                serde_json::json!({"lane": "vector", "attempt": 1, "error": failure}),
                "vector lane failed; degraded to lexical-only",
            ));
        }
        if let Some(failure) = &retrieval.rerank_failure {
            stop.record(StopReason::new(
                StopKind::SearchFailure,
                serde_json::json!({
                    "lane": "rerank",
                    "attempt": retrieval.rerank_attempts,
                    "error": failure,
                }),
                "rerank lane failed; fused order preserved",
            ));
        }

        // Stage 2: graph expansion under its sub-budget.
        let mut candidates = self.seed_candidates(&retrieval)?;

        if request.depth > 0 && !candidates.is_empty() && Instant::now() < deadline {
            let sub_budget = ((f64::from(budget) * self.config.traversal.budget_fraction) as u32)
                .min(self.config.traversal.budget_ceiling);
            let seeds: Vec<SpanId> = candidates.keys().cloned().collect();
            let traversal = self
                .traversal
                .traverse(&TraversalRequest {
                    query: request.query.clone(),
                    seeds,
                    max_depth: request.depth,
                    token_budget: sub_budget,
                    edge_kinds: Vec::new(),
                    strategy: TraversalStrategy::QualityFirst,
                })
                .await?;

            let graph_cached = traversal.cache_hit;
            if traversal.truncated {
                stop.record(StopReason::new(
                    StopKind::GraphTraversalLimit,
                    serde_json::json!({
                        "nodes": traversal.visited.len(),
                        "edges": traversal.edges.len(),
                        "tokens": traversal.tokens_used,
                        "budget": sub_budget,
                        "truncated": true,
                    }),
                    "graph expansion stopped at its token budget",
                ));
            }

            self.expand_candidates(&mut candidates, &traversal.edges, graph_cached)?;
        }

        // Graph relevance term and test attachment.
        let mut attached_tests: Vec<SpanId> = Vec::new();
        for candidate in candidates.values_mut() {
            let best = self
                .graph
                .best_incoming_confidence(&candidate.span.id)?
                .unwrap_or(0.0);
            candidate.best_incoming = best;
            candidate.relevance = candidate.fused_score + policy.lambda * best;

            if request.include_tests {
                if let Some(edge) = self
                    .graph
                    .incoming(&candidate.span.id, Some(&[EdgeKind::TestOf]))?
                    .first()
                {
                    if let Some(test_span) = self.store.get_span(&edge.source_id)? {
                        let test_chunk =
                            self.store.chunks_for_span(&test_span.id)?.into_iter().next();
                        attached_tests.push(test_span.id.clone());
                        candidate.test = Some((test_span, test_chunk));
                    }
                }
            }
        }
        // A span attached as someone's test renders with its target,
        // never as a duplicate standalone item.
        for test_id in &attached_tests {
            candidates.remove(test_id);
        }

        let candidate_list: Vec<Candidate> = candidates.into_values().collect();

        // Stage 3: packing.
        let packed = self.assembler.pack(
            &request.query,
            candidate_list.clone(),
            budget,
            request.include_tests,
            request.verbose_comments,
            &policy,
            Some(deadline),
            &mut stop,
        );

        let bundle = self.emit_bundle(&request.query, budget, packed, stop);
        let signature = bundle_signature(
            &bundle.item_keys(),
            env!("CARGO_PKG_VERSION"),
            &policy.policy_hash(),
        );
        let observations = build_observations(&candidate_list, &bundle);

        tracing::info!(
            query = %request.query,
            items = bundle.items.len(),
            tokens = bundle.token_report.actual,
            satisfied = bundle.satisfied,
            duration_ms = started.elapsed().as_millis() as u64,
            "bundle assembled"
        );

        Ok(AssembledContext {
            bundle,
            signature,
            observations,
        })
    }

    /// Map retrieval candidates onto their owning spans, keeping the
    /// best chunk rank per span.
    fn seed_candidates(
        &self,
        retrieval: &crate::retrieve::RetrievalOutcome,
    ) -> CtxResult<BTreeMap<SpanId, Candidate>> {
        let mut candidates: BTreeMap<SpanId, Candidate> = BTreeMap::new();
        for (index, ranked) in retrieval.candidates.iter().enumerate() {
            let Some((span, _language)) = self.store.chunk_origin(&ranked.chunk_id)? else {
                continue;
            };
            if candidates.contains_key(&span.id) {
                continue;
            }
            let chunk = self.store.get_chunk(&ranked.chunk_id)?;
            let siblings = self.store.chunks_for_span(&span.id)?;
            candidates.insert(
                span.id.clone(),
                Candidate {
                    span,
                    chunk,
                    sibling_chunks: siblings,
                    fused_score: ranked.score,
                    seed_rank: Some(index as u32 + 1),
                    lanes: ranked.lanes,
                    lexical_rank: ranked.lexical_rank,
                    vector_rank: ranked.vector_rank,
                    via_edge: None,
                    best_incoming: 0.0,
                    relevance: ranked.score,
                    test: None,
                    cached: retrieval.rerank_cached && ranked.lanes.rerank,
                },
            );
        }
        Ok(candidates)
    }

    /// Fold traversal edges into the candidate set: discovered spans
    /// become graph-expansion candidates, and seeds touched by an edge
    /// pick up the edge justification (evidence is additive).
    fn expand_candidates(
        &self,
        candidates: &mut BTreeMap<SpanId, Candidate>,
        edges: &[crate::types::EdgeRecord],
        cached: bool,
    ) -> CtxResult<()> {
        for edge in edges {
            let endpoints = [
                Some(edge.source_id.clone()),
                edge.target.span_id().map(str::to_string),
            ];
            for span_id in endpoints.into_iter().flatten() {
                let peer_id = if span_id == edge.source_id {
                    edge.target.span_id().unwrap_or_default().to_string()
                } else {
                    edge.source_id.clone()
                };
                if let Some(existing) = candidates.get_mut(&span_id) {
                    if existing.via_edge.is_none() && peer_id != span_id {
                        let peer = self
                            .store
                            .get_span(&peer_id)?
                            .and_then(|s| s.name)
                            .unwrap_or_else(|| short_id(&peer_id));
                        existing.via_edge = Some(ViaEdge {
                            kind: edge.kind,
                            confidence: edge.confidence,
                            peer,
                        });
                    }
                    continue;
                }
                let Some(span) = self.store.get_span(&span_id)? else {
                    continue;
                };
                let peer = self
                    .store
                    .get_span(&peer_id)?
                    .and_then(|s| s.name)
                    .unwrap_or_else(|| short_id(&peer_id));
                let chunk = self.store.chunks_for_span(&span_id)?.into_iter().next();
                candidates.insert(
                    span_id.clone(),
                    Candidate {
                        span,
                        chunk,
                        sibling_chunks: Vec::new(),
                        fused_score: 0.0,
                        seed_rank: None,
                        lanes: LaneMask::default(),
                        lexical_rank: None,
                        vector_rank: None,
                        via_edge: Some(ViaEdge {
                            kind: edge.kind,
                            confidence: edge.confidence,
                            peer,
                        }),
                        best_incoming: 0.0,
                        relevance: 0.0,
                        test: None,
                        cached,
                    },
                );
            }
        }
        Ok(())
    }

    fn emit_bundle(
        &self,
        query: &str,
        budget: u32,
        packed: PackOutcome,
        stop: StopLog,
    ) -> ContextBundle {
        let summary = stop.summary(packed.used_tokens);
        ContextBundle {
            bundle_id: format!("c_{}", now_millis()),
            query: query.to_string(),
            token_report: TokenReport {
                budget,
                est_used: packed.est_tokens,
                actual: packed.used_tokens,
                model: self.tokenizer.model().to_string(),
            },
            items: packed.items,
            satisfied: packed.satisfied,
            reason: packed.reason,
            stopping_reasons: stop.into_reasons(),
            summary,
            evidence: packed.evidence,
        }
    }

    // -----------------------------------------------------------------
    // Interactions / learning
    // -----------------------------------------------------------------

    /// Record an interaction against an assembled bundle.
    pub fn record_interaction(
        &self,
        session: &str,
        assembled: &AssembledContext,
        satisfied: bool,
        notes: &str,
    ) -> CtxResult<i64> {
        self.store.append_interaction(&Interaction {
            id: 0,
            session: session.to_string(),
            query: assembled.bundle.query.clone(),
            bundle_id: assembled.bundle.bundle_id.clone(),
            signature: assembled.signature.clone(),
            satisfied,
            notes: notes.to_string(),
            candidates: assembled.observations.clone(),
            created_at: crate::store::now_secs(),
        })
    }

    /// Run one learner batch over the recent interaction window.
    pub fn learn(&self) -> CtxResult<LearnOutcome> {
        self.learner.run(&self.store, &self.policy)
    }

    /// Engine status for diagnostics.
    pub fn status(&self) -> CtxResult<EngineStatus> {
        let cache_stats = self.traversal.cache().stats();
        let snapshot = self.policy.snapshot();
        Ok(EngineStatus {
            store: self.store.stats()?,
            traversal_cache_hits: cache_stats.hits,
            traversal_cache_misses: cache_stats.misses,
            policy_version: snapshot.version,
            policy_hash: snapshot.policy_hash(),
            tokenizer_model: self.tokenizer.model().to_string(),
        })
    }
}

/// Observations for the learner: every candidate with its lane ranks
/// and whether it made the bundle.
fn build_observations(
    candidates: &[Candidate],
    bundle: &ContextBundle,
) -> Vec<CandidateObservation> {
    let emitted = bundle.item_keys();
    candidates
        .iter()
        .map(|c| {
            let key = format!("{}:{}-{}", c.span.path, c.span.byte_start, c.span.byte_end);
            CandidateObservation {
                span_id: c.span.id.clone(),
                lexical_rank: c.lexical_rank,
                vector_rank: c.vector_rank,
                rerank_rank: c.seed_rank.filter(|_| c.lanes.rerank),
                edge_confidence: c.best_incoming,
                selected: emitted.binary_search(&key).is_ok(),
            }
        })
        .collect()
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
