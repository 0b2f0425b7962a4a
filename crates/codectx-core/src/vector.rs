//! Flat vector index for the retrieval vector lane.
//!
//! Brute-force cosine similarity over the embeddings stored for one
//! model. Chunk counts here are repository-scoped (tens of thousands,
//! not millions), so exact scan beats an ANN structure on simplicity
//! and determinism. A chunk with no embedding under the active model
//! simply has no vector lane.

use crate::error::CtxResult;
use crate::store::Store;
use crate::types::ChunkId;

/// In-memory flat index over one model's embeddings.
pub struct VectorIndex {
    model: String,
    entries: Vec<(ChunkId, Vec<f32>)>,
}

impl VectorIndex {
    /// Load all embeddings for a model from the store.
    pub fn load(store: &Store, model: &str) -> CtxResult<Self> {
        let entries = store.embeddings_for_model(model)?;
        tracing::debug!(model, vectors = entries.len(), "vector index loaded");
        Ok(Self {
            model: model.to_string(),
            entries,
        })
    }

    /// Model this index serves.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Number of vectors in the index.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// K nearest chunks by cosine similarity, ties broken by chunk id
    /// so results are deterministic.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(ChunkId, f64)> {
        let mut scored: Vec<(ChunkId, f64)> = self
            .entries
            .iter()
            .filter(|(_, v)| v.len() == query.len())
            .map(|(id, v)| (id.clone(), cosine(query, v)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
