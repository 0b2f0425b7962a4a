//! Typed adjacency over the persistent edge table.
//!
//! Edges are keyed by content-addressed span ids, so cycles are
//! natural and nothing here needs object references. Ordering is part
//! of the contract: neighbors come back confidence-descending with a
//! fixed tie-break, which is what makes traversal deterministic.

use std::sync::Arc;

use crate::error::CtxResult;
use crate::store::{EdgeDirection, Store};
use crate::types::{EdgeKind, EdgeRecord, SpanId};

/// Read-only adjacency view over the store's edges.
pub struct GraphStore {
    store: Arc<Store>,
}

impl GraphStore {
    /// Wrap a store handle.
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Outgoing resolved edges from a span, filtered by kind set.
    pub fn outgoing(&self, span_id: &str, kinds: Option<&[EdgeKind]>) -> CtxResult<Vec<EdgeRecord>> {
        self.store.edges_at(span_id, EdgeDirection::Outgoing, kinds)
    }

    /// Incoming resolved edges to a span, filtered by kind set.
    pub fn incoming(&self, span_id: &str, kinds: Option<&[EdgeKind]>) -> CtxResult<Vec<EdgeRecord>> {
        self.store.edges_at(span_id, EdgeDirection::Incoming, kinds)
    }

    /// Both directions at once, outgoing first. This is the per-node
    /// fetch traversal uses; keeping the concatenation order fixed here
    /// keeps level iteration order fixed there.
    pub fn neighbors(
        &self,
        span_id: &str,
        kinds: Option<&[EdgeKind]>,
    ) -> CtxResult<Vec<EdgeRecord>> {
        let mut edges = self.outgoing(span_id, kinds)?;
        edges.extend(self.incoming(span_id, kinds)?);
        Ok(edges)
    }

    /// Best incoming edge confidence for a span, if any edge exists.
    /// Feeds the assembler's graph relevance term.
    pub fn best_incoming_confidence(&self, span_id: &str) -> CtxResult<Option<f64>> {
        // Store ordering is confidence-descending, so the head is the max.
        Ok(self.incoming(span_id, None)?.first().map(|e| e.confidence))
    }

    /// The other endpoint of an edge relative to `from`, when resolved.
    pub fn other_endpoint(edge: &EdgeRecord, from: &str) -> Option<SpanId> {
        if edge.source_id == from {
            edge.target.span_id().map(str::to_string)
        } else {
            Some(edge.source_id.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, EdgeProvenance, EdgeTarget, Span, SpanKind};

    fn seed_store() -> (tempfile::TempDir, Arc<Store>, Vec<Span>) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(Store::open(&dir.path().join("g.db"), 1).expect("open"));
        let mut spans = Vec::new();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let path = format!("src/{name}.rs");
            let id = Span::compute_id(
                "r",
                &path,
                0,
                10,
                SpanKind::Function,
                Some(name),
                None,
                None,
                &[],
            );
            let span = Span {
                id: id.clone(),
                repo: "r".into(),
                path: path.clone(),
                byte_start: 0,
                byte_end: 10,
                kind: SpanKind::Function,
                name: Some((*name).into()),
                signature: None,
                doc: None,
                parents: Vec::new(),
            };
            let context_hash = format!("ctx{i}");
            let chunk = Chunk {
                id: Chunk::compute_id(&id, &context_hash),
                span_id: id.clone(),
                content: format!("fn {name}() {{}}"),
                context_hash,
                token_estimate: 5,
            };
            store
                .reindex_file("r", &path, "rust", &format!("h{i}"), &[span.clone()], &[chunk])
                .expect("reindex");
            spans.push(span);
        }
        (dir, store, spans)
    }

    fn edge(src: &Span, dst: &Span, kind: EdgeKind, confidence: f64) -> EdgeRecord {
        EdgeRecord {
            source_id: src.id.clone(),
            target: EdgeTarget::Span(dst.id.clone()),
            kind,
            confidence,
            provenance: EdgeProvenance::Lsp,
        }
    }

    #[test]
    fn test_kind_filter() {
        let (_dir, store, spans) = seed_store();
        store.upsert_edge(&edge(&spans[0], &spans[1], EdgeKind::Call, 0.9)).expect("e1");
        store.upsert_edge(&edge(&spans[0], &spans[2], EdgeKind::Import, 0.8)).expect("e2");

        let graph = GraphStore::new(store);
        let calls = graph
            .outgoing(&spans[0].id, Some(&[EdgeKind::Call]))
            .expect("calls");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, EdgeKind::Call);

        let all = graph.outgoing(&spans[0].id, None).expect("all");
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_neighbors_covers_both_directions() {
        let (_dir, store, spans) = seed_store();
        store.upsert_edge(&edge(&spans[0], &spans[1], EdgeKind::Call, 0.9)).expect("e1");
        store.upsert_edge(&edge(&spans[2], &spans[0], EdgeKind::TestOf, 0.7)).expect("e2");

        let graph = GraphStore::new(store);
        let neighbors = graph.neighbors(&spans[0].id, None).expect("neighbors");
        assert_eq!(neighbors.len(), 2);
        // Outgoing first, then incoming.
        assert_eq!(neighbors[0].kind, EdgeKind::Call);
        assert_eq!(neighbors[1].kind, EdgeKind::TestOf);
    }

    #[test]
    fn test_best_incoming_confidence() {
        let (_dir, store, spans) = seed_store();
        store.upsert_edge(&edge(&spans[1], &spans[0], EdgeKind::Call, 0.5)).expect("e1");
        store.upsert_edge(&edge(&spans[2], &spans[0], EdgeKind::Call, 0.8)).expect("e2");

        let graph = GraphStore::new(store);
        let best = graph
            .best_incoming_confidence(&spans[0].id)
            .expect("query")
            .expect("present");
        assert!((best - 0.8).abs() < f64::EPSILON);
        assert!(graph
            .best_incoming_confidence(&spans[1].id)
            .expect("query")
            .is_none());
    }

    #[test]
    fn test_other_endpoint() {
        let (_dir, store, spans) = seed_store();
        let e = edge(&spans[0], &spans[1], EdgeKind::Call, 0.9);
        store.upsert_edge(&e).expect("edge");
        assert_eq!(
            GraphStore::other_endpoint(&e, &spans[0].id),
            Some(spans[1].id.clone())
        );
        assert_eq!(
            GraphStore::other_endpoint(&e, &spans[1].id),
            Some(spans[0].id.clone())
        );
    }
}
