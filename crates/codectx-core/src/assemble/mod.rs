//! Progressive context assembly: greedy packing under a measured token
//! budget.
//!
//! Candidates arrive scored (fused retrieval + graph term) and sorted
//! here into a deterministic pack order. Each candidate is admitted at
//! the lowest level that satisfies the query class and still fits;
//! budget pressure degrades an item down the level ladder before it is
//! dropped. Tokens are always measured on the final serialized item at
//! admission time; estimates only pre-filter.

pub mod bundle;
pub mod levels;
pub mod query_class;

use std::sync::Arc;
use std::time::Instant;

use crate::config::AssemblyConfig;
use crate::evidence::{EvidenceRecord, InclusionReason};
use crate::policy::PolicySnapshot;
use crate::stop::{StopKind, StopLog, StopReason};
use crate::tokenizer::TokenCounter;
use crate::types::{Chunk, EdgeKind, LaneMask, Span};

use bundle::{BundleItem, ContextLevel, EdgeWhy, WhyIncluded};
use query_class::{query_mentions_symbol, symbol_matches, QueryClass};

/// Graph edge a candidate was reached through.
#[derive(Debug, Clone)]
pub struct ViaEdge {
    /// Edge kind.
    pub kind: EdgeKind,
    /// Edge confidence.
    pub confidence: f64,
    /// Short name of the other endpoint, for the `why` block.
    pub peer: String,
}

/// One assembly candidate: a span with retrieval and graph context.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The span under consideration.
    pub span: Span,
    /// Its retrieval chunk, when one is stored.
    pub chunk: Option<Chunk>,
    /// Sibling chunks backing the Full level.
    pub sibling_chunks: Vec<Chunk>,
    /// Fused retrieval score (0 for pure graph expansions).
    pub fused_score: f64,
    /// 1-based retriever rank when the candidate was a seed.
    pub seed_rank: Option<u32>,
    /// Lanes that surfaced the candidate.
    pub lanes: LaneMask,
    /// 1-based rank in the lexical lane, if present there.
    pub lexical_rank: Option<u32>,
    /// 1-based rank in the vector lane, if present there.
    pub vector_rank: Option<u32>,
    /// Edge the candidate was reached through, when graph-expanded.
    pub via_edge: Option<ViaEdge>,
    /// Best incoming edge confidence (the graph relevance term).
    pub best_incoming: f64,
    /// Final relevance: `fused + lambda * best_incoming`.
    pub relevance: f64,
    /// Nearest test span, when one exists.
    pub test: Option<(Span, Option<Chunk>)>,
    /// Whether any cache served this candidate along the way.
    pub cached: bool,
}

/// Assembly output before bundle envelope fields are attached.
#[derive(Debug, Default)]
pub struct PackOutcome {
    /// Emitted items, pack order.
    pub items: Vec<BundleItem>,
    /// Evidence records, append order.
    pub evidence: Vec<EvidenceRecord>,
    /// Measured tokens of all emitted items.
    pub used_tokens: u32,
    /// Pre-filter estimate of the emitted items.
    pub est_tokens: u32,
    /// Whether an early-stop heuristic fired.
    pub satisfied: bool,
    /// Assembly outcome description.
    pub reason: String,
}

/// Track of what has been admitted, for early-stop evaluation.
struct AdmittedItem {
    name: Option<String>,
    level: ContextLevel,
    via_kind: Option<EdgeKind>,
    is_test: bool,
    has_signature: bool,
    executable: bool,
}

/// The greedy packer.
pub struct Assembler {
    tokenizer: Arc<TokenCounter>,
    config: AssemblyConfig,
}

impl Assembler {
    /// Build an assembler.
    pub fn new(tokenizer: Arc<TokenCounter>, config: AssemblyConfig) -> Self {
        Self { tokenizer, config }
    }

    /// Pack candidates into bundle items under `budget` measured tokens.
    #[allow(clippy::too_many_lines)]
    pub fn pack(
        &self,
        query: &str,
        mut candidates: Vec<Candidate>,
        budget: u32,
        include_tests: bool,
        verbose_comments: bool,
        policy: &PolicySnapshot,
        deadline: Option<Instant>,
        stop: &mut StopLog,
    ) -> PackOutcome {
        let class = QueryClass::classify(query);
        let preferred = class.preferred_level();

        // Deterministic pack order: relevance descending, span id as
        // the tie-break.
        candidates.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.span.id.cmp(&b.span.id))
        });

        let mut out = PackOutcome::default();
        let mut admitted: Vec<AdmittedItem> = Vec::new();
        let mut warned = false;
        let mut dropped = 0usize;

        for candidate in &candidates {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                stop.record(StopReason::new(
                    StopKind::Timeout,
                    serde_json::json!({"stage": "pack", "items": out.items.len()}),
                    "request deadline expired during packing; returning the partial bundle",
                ));
                break;
            }
            if stop.should_halt() {
                break;
            }

            // Candidates are sorted; the first one under the quality
            // threshold means everything after it is too.
            if candidate.relevance < policy.quality_threshold {
                stop.record(StopReason::new(
                    StopKind::QualityThreshold,
                    serde_json::json!({
                        "score": candidate.relevance,
                        "threshold": policy.quality_threshold,
                    }),
                    "remaining candidates score below the quality threshold",
                ));
                break;
            }

            match self.admit(
                candidate,
                preferred,
                budget,
                out.used_tokens,
                verbose_comments,
            ) {
                Admission::Fits {
                    item,
                    level,
                    measured,
                    first_measured,
                } => {
                    if level < preferred {
                        stop.record(StopReason::new(
                            StopKind::DegradationTriggered,
                            serde_json::json!({
                                "file": item.file,
                                "from_level": u8::from(preferred),
                                "to_level": u8::from(level),
                                "token_delta": first_measured.saturating_sub(measured),
                            }),
                            "item downshifted to fit the remaining budget",
                        ));
                    }
                    out.used_tokens += measured;
                    out.est_tokens += candidate
                        .chunk
                        .as_ref()
                        .map_or(0, |c| c.token_estimate);
                    self.push_evidence(&mut out.evidence, candidate);
                    admitted.push(AdmittedItem {
                        name: candidate.span.name.clone(),
                        level,
                        via_kind: candidate.via_edge.as_ref().map(|v| v.kind),
                        is_test: false,
                        has_signature: candidate.span.signature.is_some(),
                        executable: candidate.span.kind.is_executable(),
                    });
                    out.items.push(item);
                }
                Admission::Dropped => {
                    dropped += 1;
                    if !stop.contains(StopKind::BudgetExhausted) {
                        stop.record(StopReason::new(
                            StopKind::BudgetExhausted,
                            serde_json::json!({
                                "used": out.used_tokens,
                                "budget": budget,
                                "dropped": dropped,
                            }),
                            "remaining budget cannot fit even a capsule entry",
                        ));
                    }
                    continue;
                }
            }

            // Attach the nearest test, implementation level only:
            // tests add nothing to a definition or capsule rendition,
            // and they are the first thing trimmed under pressure.
            let admitted_level = admitted.last().map(|a| a.level);
            if include_tests && admitted_level >= Some(ContextLevel::Implementation) {
                if let Some((test_span, test_chunk)) = &candidate.test {
                    if let Some(last) = out.items.last_mut() {
                        last.why.test = Some(test_span.path.clone());
                    }
                    match self.admit_test(test_span, test_chunk.as_ref(), budget, out.used_tokens, verbose_comments) {
                        Some((item, measured)) => {
                            out.used_tokens += measured;
                            out.est_tokens +=
                                test_chunk.as_ref().map_or(0, |c| c.token_estimate);
                            out.evidence.push(EvidenceRecord {
                                file: test_span.path.clone(),
                                symbol: test_span.name.clone(),
                                reason: InclusionReason::TestOf,
                                edge_type: Some(EdgeKind::TestOf),
                                rank: None,
                                score: candidate.fused_score,
                                cached: candidate.cached,
                                lanes: LaneMask::default(),
                            });
                            admitted.push(AdmittedItem {
                                name: test_span.name.clone(),
                                level: ContextLevel::Implementation,
                                via_kind: Some(EdgeKind::TestOf),
                                is_test: true,
                                has_signature: test_span.signature.is_some(),
                                executable: true,
                            });
                            out.items.push(item);
                        }
                        None => {
                            stop.record(StopReason::new(
                                StopKind::DegradationTriggered,
                                serde_json::json!({
                                    "file": test_span.path,
                                    "trimmed": "test",
                                }),
                                "attached test trimmed to fit the remaining budget",
                            ));
                        }
                    }
                }
            }

            if !warned
                && f64::from(out.used_tokens)
                    >= self.config.warning_fraction * f64::from(budget)
            {
                warned = true;
                stop.record(StopReason::new(
                    StopKind::BudgetWarning,
                    serde_json::json!({"used": out.used_tokens, "budget": budget}),
                    "token usage crossed the warning fraction",
                ));
            }

            if policy.early_stop {
                if let Some(reason) = early_stop_reason(query, &class, &admitted, false) {
                    out.satisfied = true;
                    out.reason = reason;
                    break;
                }
            }

            if out.used_tokens == budget {
                if !stop.contains(StopKind::BudgetExhausted) {
                    stop.record(StopReason::new(
                        StopKind::BudgetExhausted,
                        serde_json::json!({"used": out.used_tokens, "budget": budget}),
                        "token budget fully consumed",
                    ));
                }
                break;
            }
        }

        // Final pass: conditions that should not cut packing short but
        // do mark the finished bundle as satisfying (e.g. definition +
        // test with no usage candidate left to wait for).
        if !out.satisfied && policy.early_stop {
            if let Some(reason) = early_stop_reason(query, &class, &admitted, true) {
                out.satisfied = true;
                out.reason = reason;
            }
        }

        if out.reason.is_empty() {
            out.reason = if stop.contains(StopKind::BudgetExhausted) {
                format!(
                    "budget exhausted: packed {} items, dropped {dropped}",
                    out.items.len()
                )
            } else if stop.contains(StopKind::Timeout) {
                format!("deadline expired: packed {} items", out.items.len())
            } else {
                format!("packed {} items within budget", out.items.len())
            };
        }

        out
    }

    /// Try to admit a candidate, walking down the level ladder from
    /// `preferred` until a rendition fits.
    fn admit(
        &self,
        candidate: &Candidate,
        preferred: ContextLevel,
        budget: u32,
        used: u32,
        verbose_comments: bool,
    ) -> Admission {
        let mut level = preferred;
        let mut first_measured: Option<u32> = None;
        loop {
            let item = self.render_item(candidate, level, verbose_comments);
            let measured = self.measure(&item);
            if first_measured.is_none() {
                first_measured = Some(measured);
            }
            if used + measured <= budget {
                return Admission::Fits {
                    item,
                    level,
                    measured,
                    first_measured: first_measured.unwrap_or(measured),
                };
            }
            match level.down() {
                Some(lower) => level = lower,
                None => return Admission::Dropped,
            }
        }
    }

    /// A test either fits whole at implementation level or is trimmed;
    /// degrading a test to its signature has no value.
    fn admit_test(
        &self,
        test_span: &Span,
        test_chunk: Option<&Chunk>,
        budget: u32,
        used: u32,
        verbose_comments: bool,
    ) -> Option<(BundleItem, u32)> {
        let content = levels::render(
            test_span,
            test_chunk,
            &[],
            ContextLevel::Implementation,
            verbose_comments,
        );
        let item = BundleItem {
            file: test_span.path.clone(),
            spans: vec![[test_span.byte_start, test_span.byte_end]],
            level: ContextLevel::Implementation,
            why: WhyIncluded {
                seed: 0.0,
                edges: vec![EdgeWhy(
                    EdgeKind::TestOf.as_str().to_string(),
                    test_span.name.clone().unwrap_or_default(),
                    1.0,
                    0.0,
                )],
                test: None,
            },
            content,
        };
        let measured = self.measure(&item);
        (used + measured <= budget).then_some((item, measured))
    }

    fn render_item(
        &self,
        candidate: &Candidate,
        level: ContextLevel,
        verbose_comments: bool,
    ) -> BundleItem {
        let content = levels::render(
            &candidate.span,
            candidate.chunk.as_ref(),
            &candidate.sibling_chunks,
            level,
            verbose_comments,
        );
        let mut edges = Vec::new();
        if let Some(via) = &candidate.via_edge {
            edges.push(EdgeWhy(
                via.kind.as_str().to_string(),
                via.peer.clone(),
                via.confidence,
                via.confidence * candidate_lambda_weight(candidate),
            ));
        }
        BundleItem {
            file: candidate.span.path.clone(),
            spans: vec![[candidate.span.byte_start, candidate.span.byte_end]],
            level,
            why: WhyIncluded {
                seed: candidate.fused_score,
                edges,
                test: None,
            },
            content,
        }
    }

    /// Measured cost of an item: the serialized form that will be
    /// emitted, not an estimate.
    fn measure(&self, item: &BundleItem) -> u32 {
        match serde_json::to_value(item) {
            Ok(value) => self.tokenizer.count_json(&value),
            // Serialization of these types cannot fail in practice;
            // charge the content alone if it somehow does.
            Err(_) => self
                .tokenizer
                .count(&item.content, crate::tokenizer::TextClass::Code),
        }
    }

    fn push_evidence(&self, evidence: &mut Vec<EvidenceRecord>, candidate: &Candidate) {
        if candidate.seed_rank.is_some() {
            evidence.push(EvidenceRecord {
                file: candidate.span.path.clone(),
                symbol: candidate.span.name.clone(),
                reason: InclusionReason::Seed,
                edge_type: None,
                rank: candidate.seed_rank,
                score: candidate.fused_score,
                cached: candidate.cached,
                lanes: candidate.lanes,
            });
        }
        if let Some(via) = &candidate.via_edge {
            let reason = match via.kind {
                EdgeKind::TestOf => InclusionReason::TestOf,
                EdgeKind::Routes => InclusionReason::RoutesTarget,
                EdgeKind::ConfigKey => InclusionReason::ConfigKey,
                _ => InclusionReason::GraphExpansion,
            };
            evidence.push(EvidenceRecord {
                file: candidate.span.path.clone(),
                symbol: candidate.span.name.clone(),
                reason,
                edge_type: Some(via.kind),
                rank: None,
                score: candidate.fused_score,
                cached: candidate.cached,
                lanes: candidate.lanes,
            });
        }
    }
}

enum Admission {
    Fits {
        item: BundleItem,
        level: ContextLevel,
        measured: u32,
        first_measured: u32,
    },
    Dropped,
}

/// The graph term weight recorded in `why` blocks. Kept on the
/// candidate rather than re-reading policy so the record matches the
/// score the packer actually used.
fn candidate_lambda_weight(candidate: &Candidate) -> f64 {
    if candidate.best_incoming > 0.0 {
        (candidate.relevance - candidate.fused_score) / candidate.best_incoming
    } else {
        0.0
    }
}

/// Evaluate the early-stop heuristics against what has been admitted.
/// `final_pass` is true once no candidates remain: conditions that
/// would otherwise wait for a better item become acceptable then.
fn early_stop_reason(
    query: &str,
    class: &QueryClass,
    admitted: &[AdmittedItem],
    final_pass: bool,
) -> Option<String> {
    match class {
        QueryClass::ConfigKey(_) => {
            let resolved = admitted
                .iter()
                .any(|a| a.via_kind == Some(EdgeKind::ConfigKey));
            (resolved && admitted.len() >= 2)
                .then(|| "config key resolved with definition and usage".to_string())
        }
        QueryClass::Route(_) => {
            let route_target = admitted.iter().any(|a| a.via_kind == Some(EdgeKind::Routes));
            let handler_signature = admitted
                .iter()
                .any(|a| a.executable && a.has_signature);
            (route_target && handler_signature)
                .then(|| "route target and handler signature present".to_string())
        }
        QueryClass::Symbol(token) => {
            symbol_early_stop(admitted, final_pass, |name| symbol_matches(token, name))
        }
        // A conceptual query can still name a symbol in passing; the
        // definition + usage rule applies against the raw query text.
        QueryClass::Conceptual => {
            symbol_early_stop(admitted, final_pass, |name| query_mentions_symbol(query, name))
        }
    }
}

fn symbol_early_stop(
    admitted: &[AdmittedItem],
    final_pass: bool,
    matches: impl Fn(&str) -> bool,
) -> Option<String> {
    let definition_idx = admitted.iter().position(|a| {
        !a.is_test
            && a.level >= ContextLevel::Definition
            && a.name.as_deref().is_some_and(&matches)
    })?;
    // The definition itself never counts as its own usage, even when
    // it carries an edge justification.
    let usage = admitted.iter().enumerate().any(|(idx, a)| {
        idx != definition_idx
            && !a.is_test
            && matches!(
                a.via_kind,
                Some(EdgeKind::Call | EdgeKind::Import | EdgeKind::Read | EdgeKind::Write)
            )
    });
    let test = admitted.iter().any(|a| a.is_test);
    match (usage, test) {
        (true, true) => Some("definition + usage + test in bundle".to_string()),
        (true, false) => Some("definition + usage in bundle".to_string()),
        // A test alone satisfies only once no usage candidate remains;
        // stopping on it mid-pack would shut out an imminent usage.
        (false, true) if final_pass => Some("definition + test in bundle".to_string()),
        _ => None,
    }
}
