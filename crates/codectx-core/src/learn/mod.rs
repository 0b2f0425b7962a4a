//! Outcome-driven weight tuning.
//!
//! An offline batch job: read the recent interaction window, turn each
//! interaction into a label, and fit the retrieval weight vector
//! (lexical, vector, rerank, lambda) by projected gradient descent
//! against the stored candidate sets. The optimized weights land in a
//! new policy snapshot; a failed batch changes nothing.

pub mod signature;

use rayon::prelude::*;

use crate::assemble::query_class::QueryClass;
use crate::config::LearnerConfig;
use crate::error::CtxResult;
use crate::policy::PolicyStore;
use crate::store::{now_secs, Store};
use crate::types::{CandidateObservation, Interaction};
use signature::SignatureCache;

/// RRF constant used when re-scoring stored candidate sets. Matches
/// the retrieval default so offline scores track online behavior.
const RERANK_K: f64 = 60.0;

/// Finite-difference step for the numeric gradient.
const FD_STEP: f64 = 1e-4;

/// Outcome of one learner batch.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LearnOutcome {
    /// Interactions consumed.
    pub interactions: usize,
    /// Gradient iterations performed.
    pub iterations: u32,
    /// Whether the delta fell below epsilon before the iteration cap.
    pub converged: bool,
    /// Final weight vector `[lexical, vector, rerank, lambda]`.
    pub weights: [f64; 4],
    /// Final loss value.
    pub loss: f64,
    /// Whether a new policy snapshot was installed.
    pub updated_policy: bool,
}

/// Per-group satisfaction aggregate.
#[derive(Debug, Clone, Default, serde::Serialize)]
struct GroupStats {
    observations: u32,
    satisfied: u32,
}

/// The offline learner job.
pub struct Learner {
    config: LearnerConfig,
    signatures: SignatureCache,
}

impl Learner {
    /// Build a learner.
    pub fn new(config: LearnerConfig) -> Self {
        let signatures = SignatureCache::new(config.signature_cache_size);
        Self {
            config,
            signatures,
        }
    }

    /// The signature cache (shared with status reporting).
    pub fn signatures(&self) -> &SignatureCache {
        &self.signatures
    }

    /// Extract the label for one interaction:
    /// `sat_weight * satisfied + engagement_weight * f(notes)`,
    /// clamped to [0, 1].
    pub fn extract_signal(&self, interaction: &Interaction) -> f64 {
        let sat = if interaction.satisfied { 1.0 } else { 0.0 };
        let signal = self.config.sat_weight * sat
            + self.config.engagement_weight * engagement(&interaction.notes);
        signal.clamp(0.0, 1.0)
    }

    /// Run one batch: extract signals, aggregate groups, optimize the
    /// weight vector, and install the result as a new policy snapshot.
    /// Optimization failure keeps the previous weights and logs.
    pub fn run(&self, store: &Store, policy: &PolicyStore) -> CtxResult<LearnOutcome> {
        let since = now_secs() - i64::from(self.config.window_days) * 86_400;
        let interactions = store.read_interactions(since)?;

        let snapshot = policy.snapshot();
        let w0 = project_simplex(snapshot.weight_vector());

        if interactions.is_empty() {
            store.record_job_run("learner", "skipped", "no interactions in window")?;
            return Ok(LearnOutcome {
                interactions: 0,
                iterations: 0,
                converged: false,
                weights: w0,
                loss: 0.0,
                updated_policy: false,
            });
        }

        // Signature aggregation and group satisfaction metrics.
        let mut groups: std::collections::BTreeMap<String, GroupStats> =
            std::collections::BTreeMap::new();
        for interaction in &interactions {
            self.signatures
                .record(&interaction.signature, interaction.satisfied);
            let group = self.group_key(store, interaction);
            let stats = groups.entry(group).or_default();
            stats.observations += 1;
            stats.satisfied += u32::from(interaction.satisfied);
        }

        let labeled: Vec<(Interaction, f64)> = interactions
            .into_iter()
            .map(|i| {
                let label = self.extract_signal(&i);
                (i, label)
            })
            .collect();

        let (weights, iterations, converged, final_loss) = self.optimize(&labeled, w0);

        if !weights.iter().all(|x| x.is_finite()) || !final_loss.is_finite() {
            tracing::warn!("learner produced non-finite weights, keeping previous policy");
            store.record_job_run("learner", "failed", "non-finite optimization result")?;
            return Ok(LearnOutcome {
                interactions: labeled.len(),
                iterations,
                converged: false,
                weights: w0,
                loss: f64::NAN,
                updated_policy: false,
            });
        }

        let next = snapshot.with_weights(weights);
        policy.install(next, store)?;

        let detail = serde_json::json!({
            "interactions": labeled.len(),
            "iterations": iterations,
            "converged": converged,
            "loss": final_loss,
            "groups": groups,
        });
        store.record_job_run("learner", "ok", &detail.to_string())?;
        tracing::info!(
            interactions = labeled.len(),
            iterations,
            converged,
            loss = final_loss,
            "learner batch complete"
        );

        Ok(LearnOutcome {
            interactions: labeled.len(),
            iterations,
            converged,
            weights,
            loss: final_loss,
            updated_policy: true,
        })
    }

    /// Group key: intent class, language of the first selected
    /// candidate's file, repo.
    fn group_key(&self, store: &Store, interaction: &Interaction) -> String {
        let class = match QueryClass::classify(&interaction.query) {
            QueryClass::Symbol(_) => "symbol",
            QueryClass::ConfigKey(_) => "config",
            QueryClass::Route(_) => "route",
            QueryClass::Conceptual => "conceptual",
        };
        let (language, repo) = interaction
            .candidates
            .iter()
            .find(|c| c.selected)
            .and_then(|c| store.get_span(&c.span_id).ok().flatten())
            .map_or(("unknown".to_string(), "unknown".to_string()), |span| {
                let language = store
                    .get_file(&span.repo, &span.path)
                    .ok()
                    .flatten()
                    .map_or_else(|| "unknown".to_string(), |f| f.language);
                (language, span.repo)
            });
        format!("{class}/{language}/{repo}")
    }

    /// Projected gradient descent with a numeric central-difference
    /// gradient. Returns `(weights, iterations, converged, loss)`.
    fn optimize(
        &self,
        labeled: &[(Interaction, f64)],
        mut w: [f64; 4],
    ) -> ([f64; 4], u32, bool, f64) {
        let mut iterations = 0u32;
        let mut converged = false;

        for _ in 0..self.config.max_iterations {
            iterations += 1;

            let mut gradient = [0.0f64; 4];
            for dim in 0..4 {
                let mut plus = w;
                let mut minus = w;
                plus[dim] += FD_STEP;
                minus[dim] = (minus[dim] - FD_STEP).max(0.0);
                let denominator = plus[dim] - minus[dim];
                if denominator <= 0.0 {
                    continue;
                }
                gradient[dim] = (loss(labeled, plus) - loss(labeled, minus)) / denominator;
            }

            let mut next = w;
            for dim in 0..4 {
                next[dim] -= self.config.learning_rate * gradient[dim];
            }
            let next = project_simplex(next);

            let delta = w
                .iter()
                .zip(next.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f64, f64::max);
            w = next;

            if delta < self.config.epsilon {
                converged = true;
                break;
            }
        }

        (w, iterations, converged, loss(labeled, w))
    }
}

/// Engagement term: word-count saturation. Longer substantive feedback
/// counts as stronger engagement, capped so a rant cannot dominate.
fn engagement(notes: &str) -> f64 {
    let words = notes.split_whitespace().count();
    (words.min(40) as f64) / 40.0
}

/// Mean squared error between the predicted rank score of the selected
/// items under `w` and the interaction label.
fn loss(labeled: &[(Interaction, f64)], w: [f64; 4]) -> f64 {
    if labeled.is_empty() {
        return 0.0;
    }
    let total: f64 = labeled
        .par_iter()
        .map(|(interaction, label)| {
            let predicted = predicted_rank_score(&interaction.candidates, w);
            (predicted - label) * (predicted - label)
        })
        .sum();
    total / labeled.len() as f64
}

/// Score the stored candidate set under `w` and return the mean score
/// share of the selected items (1 = selected items hold all the score
/// mass, 0 = none of it).
///
/// A hard normalized rank would be piecewise constant in `w`, leaving
/// the gradient zero almost everywhere; the score share is its smooth
/// counterpart and moves monotonically with the same ranking.
fn predicted_rank_score(candidates: &[CandidateObservation], w: [f64; 4]) -> f64 {
    if candidates.is_empty() {
        return 0.0;
    }

    let lane = |rank: Option<u32>, weight: f64| {
        rank.map_or(0.0, |r| weight / (RERANK_K + f64::from(r)))
    };
    let scores: Vec<f64> = candidates
        .iter()
        .map(|c| {
            lane(c.lexical_rank, w[0])
                + lane(c.vector_rank, w[1])
                + lane(c.rerank_rank, w[2])
                + w[3] * c.edge_confidence
        })
        .collect();

    let total: f64 = scores.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }

    let selected: Vec<f64> = candidates
        .iter()
        .zip(scores.iter())
        .filter(|(c, _)| c.selected)
        .map(|(_, s)| s / total)
        .collect();
    if selected.is_empty() {
        return 0.0;
    }
    selected.iter().sum::<f64>() / selected.len() as f64
}

/// Euclidean projection onto the probability simplex
/// (`w >= 0`, `sum(w) = 1`).
fn project_simplex(w: [f64; 4]) -> [f64; 4] {
    let mut sorted = w;
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumulative = 0.0;
    let mut theta = 0.0;
    for (i, value) in sorted.iter().enumerate() {
        cumulative += value;
        let candidate = (cumulative - 1.0) / (i as f64 + 1.0);
        if value - candidate > 0.0 {
            theta = candidate;
        }
    }

    let mut out = [0.0f64; 4];
    for (o, value) in out.iter_mut().zip(w.iter()) {
        *o = (value - theta).max(0.0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn learner() -> Learner {
        Learner::new(LearnerConfig::default())
    }

    fn interaction(satisfied: bool, notes: &str) -> Interaction {
        Interaction {
            id: 0,
            session: "s".into(),
            query: "q".into(),
            bundle_id: "c_1".into(),
            signature: "sig".into(),
            satisfied,
            notes: notes.into(),
            candidates: Vec::new(),
            created_at: now_secs(),
        }
    }

    #[test]
    fn test_signal_extraction_bounds() {
        let l = learner();
        let low = l.extract_signal(&interaction(false, ""));
        let high = l.extract_signal(&interaction(true, "great result with exactly the span I needed"));
        assert!(low >= 0.0 && low < 0.1);
        assert!(high > 0.7 && high <= 1.0);
        assert!(high > low);
    }

    #[test]
    fn test_engagement_saturates() {
        let short = engagement("ok");
        let long = engagement(&"word ".repeat(100));
        assert!(short < long);
        assert!((long - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_project_simplex_properties() {
        for input in [
            [0.25, 0.25, 0.25, 0.25],
            [2.0, 0.0, 0.0, 0.0],
            [-1.0, 0.5, 0.5, 0.5],
            [0.9, 0.9, 0.9, 0.9],
        ] {
            let p = project_simplex(input);
            let sum: f64 = p.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "sum for {input:?} was {sum}");
            assert!(p.iter().all(|x| *x >= 0.0), "negative entry for {input:?}");
        }
        // Already on the simplex: unchanged.
        let p = project_simplex([0.4, 0.3, 0.2, 0.1]);
        for (a, b) in p.iter().zip([0.4, 0.3, 0.2, 0.1].iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_predicted_rank_score_tracks_preferred_lane() {
        let candidates = vec![
            CandidateObservation {
                span_id: "picked".into(),
                lexical_rank: Some(1),
                vector_rank: Some(10),
                rerank_rank: None,
                edge_confidence: 0.0,
                selected: true,
            },
            CandidateObservation {
                span_id: "passed".into(),
                lexical_rank: Some(10),
                vector_rank: Some(1),
                rerank_rank: None,
                edge_confidence: 0.0,
                selected: false,
            },
        ];
        let lexical_heavy = predicted_rank_score(&candidates, [1.0, 0.0, 0.0, 0.0]);
        let vector_heavy = predicted_rank_score(&candidates, [0.0, 1.0, 0.0, 0.0]);
        assert!(lexical_heavy > 0.5);
        assert!(vector_heavy < 0.5);
        assert!(lexical_heavy > vector_heavy);
        // Smooth in w: nudging a weight moves the score, it does not
        // jump between plateaus.
        let nudged = predicted_rank_score(&candidates, [0.99, 0.01, 0.0, 0.0]);
        assert!((lexical_heavy - nudged).abs() < 0.05);
    }

    #[test]
    fn test_loss_lower_when_weights_match_preference() {
        // Selected items rank first under lexical, last under vector.
        let labeled: Vec<(Interaction, f64)> = (0..20)
            .map(|i| {
                let mut it = interaction(true, "good");
                it.candidates = vec![
                    CandidateObservation {
                        span_id: format!("sel{i}"),
                        lexical_rank: Some(1),
                        vector_rank: Some(10),
                        rerank_rank: None,
                        edge_confidence: 0.0,
                        selected: true,
                    },
                    CandidateObservation {
                        span_id: format!("other{i}"),
                        lexical_rank: Some(10),
                        vector_rank: Some(1),
                        rerank_rank: None,
                        edge_confidence: 0.0,
                        selected: false,
                    },
                ];
                let label = 1.0;
                (it, label)
            })
            .collect();
        let lexical_heavy = loss(&labeled, [0.9, 0.1, 0.0, 0.0]);
        let vector_heavy = loss(&labeled, [0.1, 0.9, 0.0, 0.0]);
        assert!(lexical_heavy < vector_heavy);
    }

    #[test]
    fn test_optimize_moves_toward_preferred_lane() {
        let labeled: Vec<(Interaction, f64)> = (0..50)
            .map(|i| {
                let mut it = interaction(true, "exactly right");
                it.candidates = vec![
                    CandidateObservation {
                        span_id: format!("sel{i}"),
                        lexical_rank: Some(1),
                        vector_rank: Some(20),
                        rerank_rank: None,
                        edge_confidence: 0.0,
                        selected: true,
                    },
                    CandidateObservation {
                        span_id: format!("noise{i}"),
                        lexical_rank: Some(20),
                        vector_rank: Some(1),
                        rerank_rank: None,
                        edge_confidence: 0.0,
                        selected: false,
                    },
                ];
                (it, 1.0)
            })
            .collect();

        let l = learner();
        let start = project_simplex([0.25, 0.25, 0.25, 0.25]);
        let (w, iterations, _converged, final_loss) = l.optimize(&labeled, start);
        assert!(iterations <= 50);
        assert!(w[0] > start[0], "lexical weight should grow: {w:?}");
        assert!(final_loss <= loss(&labeled, start));
        let sum: f64 = w.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }
}
