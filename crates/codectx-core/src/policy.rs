//! Retrieval and assembly policy: versioned, read-mostly weight state.
//!
//! A [`PolicySnapshot`] is immutable; the engine reads it through an
//! `Arc` taken at request start, so a concurrent update never changes
//! weights mid-request. Updates build a new snapshot and atomically
//! swap the shared pointer. The `policy_hash` participates in bundle
//! signatures so that weight changes invalidate reuse.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CtxError, CtxResult};
use crate::store::Store;

/// Per-lane fusion weights. Projected onto the simplex together with
/// the graph term by the learner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LaneWeights {
    /// Lexical (FTS) lane weight.
    pub lexical: f64,
    /// Vector lane weight.
    pub vector: f64,
    /// Rerank lane weight.
    pub rerank: f64,
}

impl Default for LaneWeights {
    fn default() -> Self {
        Self {
            lexical: 0.4,
            vector: 0.3,
            rerank: 0.2,
        }
    }
}

/// One immutable policy snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySnapshot {
    /// Monotonically increasing version.
    pub version: u64,
    /// Fusion lane weights.
    pub lane_weights: LaneWeights,
    /// Graph term weight: relevance = fused + lambda * best incoming
    /// edge confidence.
    pub lambda: f64,
    /// Candidates scoring below this are flagged by a stop reason.
    pub quality_threshold: f64,
    /// Whether early-stop heuristics may end assembly before the
    /// budget runs out.
    pub early_stop: bool,
    /// Cap on fused candidates entering assembly.
    pub max_candidates: usize,
    /// RRF constant.
    pub rrf_k: u32,
    /// Embedding model the vector lane reads.
    pub embedding_model: String,
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self {
            version: 1,
            lane_weights: LaneWeights::default(),
            lambda: 0.1,
            // RRF scores live near w/(k_rrf + 1); the floor only cuts
            // candidates with effectively no signal.
            quality_threshold: 0.001,
            early_stop: true,
            max_candidates: 200,
            rrf_k: 60,
            embedding_model: "none".into(),
        }
    }
}

impl PolicySnapshot {
    /// Canonical hash of the snapshot's effective content.
    ///
    /// Floats are truncated to 6 decimals before hashing so that
    /// representation noise cannot produce distinct hashes for the
    /// same effective policy.
    pub fn policy_hash(&self) -> String {
        let canonical = format!(
            "v{}|lex{}|vec{}|rr{}|lam{}|qt{}|es{}|mc{}|k{}|em{}",
            self.version,
            trunc6(self.lane_weights.lexical),
            trunc6(self.lane_weights.vector),
            trunc6(self.lane_weights.rerank),
            trunc6(self.lambda),
            trunc6(self.quality_threshold),
            self.early_stop,
            self.max_candidates,
            self.rrf_k,
            self.embedding_model,
        );
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    /// Weight vector consumed by the learner:
    /// `[lexical, vector, rerank, lambda]`.
    pub fn weight_vector(&self) -> [f64; 4] {
        [
            self.lane_weights.lexical,
            self.lane_weights.vector,
            self.lane_weights.rerank,
            self.lambda,
        ]
    }

    /// Build the successor snapshot carrying a learned weight vector.
    pub fn with_weights(&self, w: [f64; 4]) -> Self {
        Self {
            version: self.version + 1,
            lane_weights: LaneWeights {
                lexical: w[0],
                vector: w[1],
                rerank: w[2],
            },
            lambda: w[3],
            ..self.clone()
        }
    }

    /// Validate ranges; invalid snapshots must never be installed.
    pub fn validate(&self) -> CtxResult<()> {
        let w = self.weight_vector();
        if w.iter().any(|x| *x < 0.0 || !x.is_finite()) {
            return Err(CtxError::Config {
                details: format!("policy weights must be non-negative and finite: {w:?}"),
            });
        }
        if self.max_candidates == 0 {
            return Err(CtxError::Config {
                details: "policy max_candidates must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Shared policy holder: copy-on-write snapshot swaps.
pub struct PolicyStore {
    current: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyStore {
    /// Start from a snapshot.
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Load the newest persisted snapshot from the store, or install
    /// defaults (persisting them) when none exists.
    pub fn load_or_default(store: &Store) -> CtxResult<Self> {
        if let Some((_, payload)) = store.load_latest_policy()? {
            let snapshot: PolicySnapshot =
                serde_json::from_str(&payload).map_err(|e| CtxError::Config {
                    details: format!("persisted policy is invalid: {e}"),
                })?;
            snapshot.validate()?;
            return Ok(Self::new(snapshot));
        }
        let snapshot = PolicySnapshot::default();
        store.save_policy(
            snapshot.version,
            &snapshot.policy_hash(),
            &serde_json::to_string(&snapshot)?,
        )?;
        Ok(Self::new(snapshot))
    }

    /// Current snapshot. Cheap; the Arc is cloned, not the data.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.read().clone()
    }

    /// Validate, persist, and atomically install a new snapshot.
    pub fn install(&self, snapshot: PolicySnapshot, store: &Store) -> CtxResult<()> {
        snapshot.validate()?;
        store.save_policy(
            snapshot.version,
            &snapshot.policy_hash(),
            &serde_json::to_string(&snapshot)?,
        )?;
        tracing::info!(
            version = snapshot.version,
            policy_hash = %snapshot.policy_hash(),
            "installed policy snapshot"
        );
        *self.current.write() = Arc::new(snapshot);
        Ok(())
    }
}

/// Truncate (not round) a float to 6 decimals for canonical hashing.
fn trunc6(x: f64) -> String {
    format!("{:.6}", (x * 1e6).trunc() / 1e6)
}
