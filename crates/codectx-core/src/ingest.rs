//! Span and reference ingest.
//!
//! The engine does not parse source. Language adapters emit span and
//! reference records; this module validates them against the span
//! invariants, computes content-addressed ids, derives retrieval
//! chunks, and lands everything in the store one atomic file at a
//! time. Unknown fields on ingest records are rejected, not ignored.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{CtxError, CtxResult};
use crate::store::{ReindexOutcome, Store};
use crate::types::{
    sha256_hex, Chunk, EdgeKind, EdgeProvenance, EdgeRecord, EdgeTarget, Span, SpanId, SpanKind,
};

/// Bytes of preceding source folded into each chunk as context.
const SIBLING_WINDOW_BYTES: usize = 160;

/// One span as emitted by a language adapter.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpanRecord {
    /// Start byte offset (inclusive).
    pub byte_start: u32,
    /// End byte offset (exclusive).
    pub byte_end: u32,
    /// Semantic kind.
    pub kind: SpanKind,
    /// Symbol name, if any.
    #[serde(default)]
    pub name: Option<String>,
    /// Declaration signature, if any.
    #[serde(default)]
    pub signature: Option<String>,
    /// Leading doc comment, if any.
    #[serde(default)]
    pub doc: Option<String>,
    /// Ancestor span ids, outermost first.
    #[serde(default)]
    pub parents: Vec<SpanId>,
}

/// One reference as emitted by an extractor.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReferenceRecord {
    /// Source span id.
    pub source_id: SpanId,
    /// Target span or unresolved location.
    pub target: EdgeTarget,
    /// Relation kind.
    pub kind: EdgeKind,
    /// Extraction confidence in [0, 1].
    pub confidence: f64,
    /// Extractor provenance.
    pub provenance: EdgeProvenance,
}

/// One file's worth of ingest input.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileIngest {
    /// Repository identifier.
    pub repo: String,
    /// Path relative to the repository root.
    pub path: String,
    /// Language tag.
    #[serde(default)]
    pub language: String,
    /// Full file content.
    pub content: String,
    /// Spans covering the file.
    pub spans: Vec<SpanRecord>,
}

/// A line of the JSONL ingest stream. Unknown fields are rejected by
/// the variant payloads.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestRecord {
    /// A file with its spans.
    File(FileIngest),
    /// A reference between spans.
    Reference(ReferenceRecord),
}

/// Ingest front-end over the store.
pub struct Ingestor {
    store: std::sync::Arc<Store>,
}

impl Ingestor {
    /// Wrap a store handle.
    pub fn new(store: std::sync::Arc<Store>) -> Self {
        Self { store }
    }

    /// Ingest one file: validate invariants, compute ids, derive
    /// chunks, and reindex atomically. Unchanged content is a no-op.
    pub fn ingest_file(&self, file: &FileIngest) -> CtxResult<ReindexOutcome> {
        let content_hash = sha256_hex(file.content.as_bytes());

        // Cheap idempotence check before any validation work.
        if self.store.file_content_hash(&file.repo, &file.path)?.as_deref()
            == Some(content_hash.as_str())
        {
            return Ok(ReindexOutcome {
                unchanged: true,
                ..ReindexOutcome::default()
            });
        }

        validate_spans(file)?;

        let mut spans = Vec::with_capacity(file.spans.len());
        let mut chunks = Vec::with_capacity(file.spans.len());
        for record in &file.spans {
            let id = Span::compute_id(
                &file.repo,
                &file.path,
                record.byte_start,
                record.byte_end,
                record.kind,
                record.name.as_deref(),
                record.signature.as_deref(),
                record.doc.as_deref(),
                &record.parents,
            );
            let span = Span {
                id: id.clone(),
                repo: file.repo.clone(),
                path: file.path.clone(),
                byte_start: record.byte_start,
                byte_end: record.byte_end,
                kind: record.kind,
                name: record.name.clone(),
                signature: record.signature.clone(),
                doc: record.doc.clone(),
                parents: record.parents.clone(),
            };
            chunks.push(derive_chunk(&span, record, &file.content));
            spans.push(span);
        }

        let outcome = self.store.reindex_file(
            &file.repo,
            &file.path,
            &file.language,
            &content_hash,
            &spans,
            &chunks,
        )?;

        // New spans may satisfy previously dangling references.
        let resolved = self.store.resolve_edges()?;
        if resolved > 0 {
            tracing::debug!(resolved, path = %file.path, "references resolved after reindex");
        }

        Ok(outcome)
    }

    /// Ingest one reference. Returns the span ids whose adjacency
    /// changed, for traversal cache invalidation.
    pub fn ingest_reference(&self, reference: &ReferenceRecord) -> CtxResult<Vec<SpanId>> {
        if !(0.0..=1.0).contains(&reference.confidence) {
            return Err(CtxError::Ingest {
                details: format!(
                    "reference confidence {} outside [0, 1]",
                    reference.confidence
                ),
            });
        }
        self.store.upsert_edge(&EdgeRecord {
            source_id: reference.source_id.clone(),
            target: reference.target.clone(),
            kind: reference.kind,
            confidence: reference.confidence,
            provenance: reference.provenance,
        })
    }
}

/// Span invariants: ranges fit the file on char boundaries, overlapping
/// ranges nest, parent chains are acyclic and rooted at a module span.
fn validate_spans(file: &FileIngest) -> CtxResult<()> {
    let len = file.content.len() as u32;
    for record in &file.spans {
        if record.byte_start >= record.byte_end || record.byte_end > len {
            return Err(CtxError::Ingest {
                details: format!(
                    "span range {}..{} does not fit {} ({len} bytes)",
                    record.byte_start, record.byte_end, file.path
                ),
            });
        }
        if !file.content.is_char_boundary(record.byte_start as usize)
            || !file.content.is_char_boundary(record.byte_end as usize)
        {
            return Err(CtxError::Ingest {
                details: format!(
                    "span range {}..{} splits a UTF-8 character in {}",
                    record.byte_start, record.byte_end, file.path
                ),
            });
        }
    }

    // Overlapping ranges of distinct kinds must nest, never cross.
    for (i, a) in file.spans.iter().enumerate() {
        for b in file.spans.iter().skip(i + 1) {
            let overlap = a.byte_start < b.byte_end && b.byte_start < a.byte_end;
            if !overlap || a.kind == b.kind {
                continue;
            }
            let a_contains_b = a.byte_start <= b.byte_start && b.byte_end <= a.byte_end;
            let b_contains_a = b.byte_start <= a.byte_start && a.byte_end <= b.byte_end;
            if !a_contains_b && !b_contains_a {
                return Err(CtxError::Ingest {
                    details: format!(
                        "spans {}..{} and {}..{} cross without nesting in {}",
                        a.byte_start, a.byte_end, b.byte_start, b.byte_end, file.path
                    ),
                });
            }
        }
    }

    // Parent chains: known ids, no self-ancestry, rooted at a module.
    let ids: HashMap<SpanId, SpanKind> = file
        .spans
        .iter()
        .map(|r| {
            let id = Span::compute_id(
                &file.repo,
                &file.path,
                r.byte_start,
                r.byte_end,
                r.kind,
                r.name.as_deref(),
                r.signature.as_deref(),
                r.doc.as_deref(),
                &r.parents,
            );
            (id, r.kind)
        })
        .collect();

    for record in &file.spans {
        if record.parents.is_empty() {
            continue;
        }
        let own_id = Span::compute_id(
            &file.repo,
            &file.path,
            record.byte_start,
            record.byte_end,
            record.kind,
            record.name.as_deref(),
            record.signature.as_deref(),
            record.doc.as_deref(),
            &record.parents,
        );
        let mut seen = std::collections::HashSet::new();
        for parent in &record.parents {
            if *parent == own_id || !seen.insert(parent.clone()) {
                return Err(CtxError::Ingest {
                    details: format!("cyclic parents chain on span at {}", record.byte_start),
                });
            }
        }
        let root = &record.parents[0];
        match ids.get(root) {
            Some(SpanKind::Module) => {}
            Some(_) => {
                return Err(CtxError::Ingest {
                    details: format!(
                        "parents chain at {} is not rooted at a module span",
                        record.byte_start
                    ),
                });
            }
            None => {
                return Err(CtxError::Ingest {
                    details: format!(
                        "unknown parent span id on span at {}",
                        record.byte_start
                    ),
                });
            }
        }
    }

    Ok(())
}

/// Build the retrieval chunk for a span: a small preceding window,
/// the doc block, then the span body.
fn derive_chunk(span: &Span, record: &SpanRecord, content: &str) -> Chunk {
    let start = record.byte_start as usize;
    let end = record.byte_end as usize;
    let body = content.get(start..end).unwrap_or_default();

    // Preceding sibling window, trimmed forward to a line boundary.
    let window_start = start.saturating_sub(SIBLING_WINDOW_BYTES);
    let mut window = "";
    if window_start < start {
        if let Some(raw) = content.get(window_start..start) {
            window = match raw.find('\n') {
                Some(pos) if pos + 1 < raw.len() => &raw[pos + 1..],
                _ => raw,
            };
        }
    }

    let mut text = String::new();
    if !window.is_empty() {
        text.push_str(window);
        if !window.ends_with('\n') {
            text.push('\n');
        }
    }
    if let Some(doc) = &record.doc {
        for line in doc.lines() {
            text.push_str("/// ");
            text.push_str(line);
            text.push('\n');
        }
    }
    text.push_str(body);

    let context_hash = sha256_hex(
        format!("{window}\u{0}{}", record.doc.as_deref().unwrap_or("")).as_bytes(),
    );
    Chunk {
        id: Chunk::compute_id(&span.id, &context_hash),
        span_id: span.id.clone(),
        token_estimate: text.len().div_ceil(3) as u32,
        content: text,
        context_hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ingestor() -> (tempfile::TempDir, Ingestor, Arc<Store>) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(Store::open(&dir.path().join("i.db"), 1).expect("open"));
        (dir, Ingestor::new(store.clone()), store)
    }

    fn simple_file(content: &str, spans: Vec<SpanRecord>) -> FileIngest {
        FileIngest {
            repo: "r".into(),
            path: "src/lib.rs".into(),
            language: "rust".into(),
            content: content.into(),
            spans,
        }
    }

    fn fn_span(start: u32, end: u32, name: &str) -> SpanRecord {
        SpanRecord {
            byte_start: start,
            byte_end: end,
            kind: SpanKind::Function,
            name: Some(name.into()),
            signature: Some(format!("fn {name}()")),
            doc: None,
            parents: Vec::new(),
        }
    }

    #[test]
    fn test_ingest_and_reingest_idempotent() {
        let (_dir, ingestor, store) = ingestor();
        let file = simple_file("fn alpha() {}\n", vec![fn_span(0, 13, "alpha")]);

        let first = ingestor.ingest_file(&file).expect("ingest");
        assert!(!first.unchanged);
        assert_eq!(first.spans_written, 1);

        let second = ingestor.ingest_file(&file).expect("reingest");
        assert!(second.unchanged);
        assert_eq!(store.stats().expect("stats").spans, 1);
    }

    #[test]
    fn test_rejects_out_of_range_span() {
        let (_dir, ingestor, _) = ingestor();
        let file = simple_file("short\n", vec![fn_span(0, 100, "bad")]);
        assert!(matches!(
            ingestor.ingest_file(&file),
            Err(CtxError::Ingest { .. })
        ));
    }

    #[test]
    fn test_rejects_crossing_spans() {
        let (_dir, ingestor, _) = ingestor();
        let content = "fn a() {} fn b() {}\n";
        let mut class_span = fn_span(5, 15, "cross");
        class_span.kind = SpanKind::Class;
        let file = simple_file(content, vec![fn_span(0, 9, "a"), class_span]);
        assert!(matches!(
            ingestor.ingest_file(&file),
            Err(CtxError::Ingest { .. })
        ));
    }

    #[test]
    fn test_nested_spans_of_distinct_kinds_allowed() {
        let (_dir, ingestor, _) = ingestor();
        let content = "mod m { fn inner() {} }\n";
        let mut module = fn_span(0, 23, "m");
        module.kind = SpanKind::Module;
        let file = simple_file(content, vec![module, fn_span(8, 21, "inner")]);
        assert!(ingestor.ingest_file(&file).is_ok());
    }

    #[test]
    fn test_parents_must_root_at_module() {
        let (_dir, ingestor, _) = ingestor();
        let content = "mod m { fn inner() {} }\n";

        // Parent is a function span, not a module.
        let outer = fn_span(0, 23, "outer");
        let outer_id = Span::compute_id(
            "r", "src/lib.rs", 0, 23, SpanKind::Function, Some("outer"),
            Some("fn outer()"), None, &[],
        );
        let mut inner = fn_span(8, 21, "inner");
        inner.parents = vec![outer_id];
        let file = simple_file(content, vec![outer, inner]);
        assert!(matches!(
            ingestor.ingest_file(&file),
            Err(CtxError::Ingest { .. })
        ));
    }

    #[test]
    fn test_chunk_carries_doc_and_window() {
        let (_dir, ingestor, store) = ingestor();
        let content = "const X: u32 = 1;\nfn alpha() { use_x(X); }\n";
        let mut span = fn_span(18, 42, "alpha");
        span.doc = Some("Alpha does things.".into());
        let file = simple_file(content, vec![span]);
        ingestor.ingest_file(&file).expect("ingest");

        let hits = store.fts_search("alpha", 10, None, None).expect("search");
        assert_eq!(hits.len(), 1);
        let chunk = store.get_chunk(&hits[0].0).expect("get").expect("chunk");
        assert!(chunk.content.contains("/// Alpha does things."));
        assert!(chunk.content.contains("const X"));
        assert!(chunk.content.contains("fn alpha()"));
    }

    #[test]
    fn test_reference_confidence_validated() {
        let (_dir, ingestor, _) = ingestor();
        let reference = ReferenceRecord {
            source_id: "s".into(),
            target: EdgeTarget::Span("t".into()),
            kind: EdgeKind::Call,
            confidence: 1.5,
            provenance: EdgeProvenance::Heuristic,
        };
        assert!(matches!(
            ingestor.ingest_reference(&reference),
            Err(CtxError::Ingest { .. })
        ));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let json = serde_json::json!({
            "type": "file",
            "repo": "r",
            "path": "a.rs",
            "content": "fn a() {}",
            "spans": [],
            "surprise": true,
        });
        let parsed: Result<IngestRecord, _> = serde_json::from_value(json);
        assert!(parsed.is_err());
    }
}
