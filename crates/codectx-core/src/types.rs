//! Core domain types shared across all codectx-core subsystems.
//!
//! These types form the API contract between modules. Changing them
//! requires updating all consumers, so they should be stable and minimal.
//!
//! Spans and chunks are content-addressed: their ids are SHA-256 digests
//! of their identifying fields, so an unchanged region of source keeps
//! the same id across reindex runs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content-addressed span identifier (hex-encoded SHA-256).
pub type SpanId = String;

/// Content-addressed chunk identifier (hex-encoded SHA-256).
pub type ChunkId = String;

// ---------------------------------------------------------------------------
// File-level types
// ---------------------------------------------------------------------------

/// Metadata about an indexed file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Database ID.
    pub id: i64,
    /// Repository identifier this file belongs to.
    pub repo: String,
    /// Path relative to the repository root.
    pub path: String,
    /// Language tag as reported by the ingesting adapter.
    pub language: String,
    /// SHA-256 hash of file content at time of indexing.
    pub content_hash: String,
}

// ---------------------------------------------------------------------------
// Span types
// ---------------------------------------------------------------------------

/// The semantic kind of a source span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// Module or file-level scope.
    Module,
    /// Class, struct, or record definition.
    Class,
    /// Free function definition.
    Function,
    /// Method attached to a class or impl.
    Method,
    /// Property, field, or constant.
    Property,
    /// Enum definition.
    Enum,
    /// Trait, interface, or protocol definition.
    Interface,
    /// Standalone comment or doc block.
    Comment,
}

impl SpanKind {
    /// Convert to database string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Module => "module",
            Self::Class => "class",
            Self::Function => "function",
            Self::Method => "method",
            Self::Property => "property",
            Self::Enum => "enum",
            Self::Interface => "interface",
            Self::Comment => "comment",
        }
    }

    /// Parse from database string.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "module" => Self::Module,
            "class" => Self::Class,
            "function" => Self::Function,
            "method" => Self::Method,
            "property" => Self::Property,
            "enum" => Self::Enum,
            "interface" => Self::Interface,
            _ => Self::Comment,
        }
    }

    /// Returns true if the span is directly executable (has a body).
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Function | Self::Method)
    }
}

/// A bounded region of one file with a semantic kind.
///
/// The span id is a pure function of the identifying tuple, computed by
/// [`Span::compute_id`]. Reindexing an unchanged region yields the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Content-addressed identifier.
    pub id: SpanId,
    /// Repository identifier.
    pub repo: String,
    /// Path relative to the repository root.
    pub path: String,
    /// Start byte offset (inclusive).
    pub byte_start: u32,
    /// End byte offset (exclusive).
    pub byte_end: u32,
    /// Semantic kind of the region.
    pub kind: SpanKind,
    /// Symbol name, if the region defines one.
    pub name: Option<String>,
    /// Declaration signature, if applicable.
    pub signature: Option<String>,
    /// Leading doc comment text.
    pub doc: Option<String>,
    /// Ancestor span ids, innermost last, rooted at a module span.
    pub parents: Vec<SpanId>,
}

impl Span {
    /// Compute the content-addressed id for a span's identifying tuple.
    ///
    /// Fields are fed to the hasher with explicit separators so that
    /// adjacent fields can never alias each other. `doc` and `parents`
    /// contribute through their own digests, keeping the outer preimage
    /// fixed-width regardless of their size.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_id(
        repo: &str,
        path: &str,
        byte_start: u32,
        byte_end: u32,
        kind: SpanKind,
        name: Option<&str>,
        signature: Option<&str>,
        doc: Option<&str>,
        parents: &[SpanId],
    ) -> SpanId {
        let doc_hash = sha256_hex(doc.unwrap_or("").as_bytes());
        let parents_hash = sha256_hex(parents.join(",").as_bytes());
        let start = byte_start.to_string();
        let end = byte_end.to_string();

        let fields: [&str; 9] = [
            repo,
            path,
            &start,
            &end,
            kind.as_str(),
            name.unwrap_or(""),
            signature.unwrap_or(""),
            &doc_hash,
            &parents_hash,
        ];
        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Byte length of the region.
    pub fn len_bytes(&self) -> u32 {
        self.byte_end.saturating_sub(self.byte_start)
    }
}

// ---------------------------------------------------------------------------
// Chunk types
// ---------------------------------------------------------------------------

/// Retrievable text unit derived from one span.
///
/// The chunk body is the span text plus its leading docs and a small
/// sibling window. Chunks are the unit of FTS indexing and embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Content-addressed identifier: `sha256(span_id, context_hash)`.
    pub id: ChunkId,
    /// Owning span.
    pub span_id: SpanId,
    /// Assembled chunk text.
    pub content: String,
    /// Hash of the surrounding context that was folded into the body.
    pub context_hash: String,
    /// Cheap token estimate used for pre-filtering only. Admission
    /// decisions always re-measure with the real tokenizer.
    pub token_estimate: u32,
}

impl Chunk {
    /// Compute the content-addressed chunk id.
    pub fn compute_id(span_id: &str, context_hash: &str) -> ChunkId {
        let mut hasher = Sha256::new();
        hasher.update(span_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(context_hash.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// SHA-256 digest of raw bytes, hex-encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Edge types
// ---------------------------------------------------------------------------

/// The kind of relation between two spans. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    /// Source calls the target.
    Call,
    /// Source imports the target.
    Import,
    /// Source reads a value defined by the target.
    Read,
    /// Source writes a value defined by the target.
    Write,
    /// Source is a test exercising the target.
    TestOf,
    /// Source routes requests to the target handler.
    Routes,
    /// Source defines a configuration key the target consumes.
    ConfigKey,
}

impl EdgeKind {
    /// All edge kinds, in canonical order.
    pub const ALL: [EdgeKind; 7] = [
        Self::Call,
        Self::Import,
        Self::Read,
        Self::Write,
        Self::TestOf,
        Self::Routes,
        Self::ConfigKey,
    ];

    /// Convert to database string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Import => "import",
            Self::Read => "read",
            Self::Write => "write",
            Self::TestOf => "test-of",
            Self::Routes => "routes",
            Self::ConfigKey => "config-key",
        }
    }

    /// Parse from database string.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "import" => Self::Import,
            "read" => Self::Read,
            "write" => Self::Write,
            "test-of" => Self::TestOf,
            "routes" => Self::Routes,
            "config-key" => Self::ConfigKey,
            _ => Self::Call,
        }
    }
}

/// Which extractor produced an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeProvenance {
    /// Language server protocol references.
    Lsp,
    /// SCIP index import.
    Scip,
    /// Heuristic text-level extraction.
    Heuristic,
}

impl EdgeProvenance {
    /// Convert to database string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lsp => "lsp",
            Self::Scip => "scip",
            Self::Heuristic => "heuristic",
        }
    }

    /// Parse from database string.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "lsp" => Self::Lsp,
            "scip" => Self::Scip,
            _ => Self::Heuristic,
        }
    }
}

/// Target of an edge: a known span, or a location resolved lazily.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeTarget {
    /// Resolved target span.
    Span(SpanId),
    /// Unresolved `(path, byte_range)` location.
    Location {
        /// Path relative to the repository root.
        path: String,
        /// Start byte offset.
        byte_start: u32,
        /// End byte offset.
        byte_end: u32,
    },
}

impl EdgeTarget {
    /// Stable key used for edge identity and de-duplication.
    pub fn key(&self) -> String {
        match self {
            Self::Span(id) => id.clone(),
            Self::Location {
                path,
                byte_start,
                byte_end,
            } => format!("{path}:{byte_start}-{byte_end}"),
        }
    }

    /// Resolved span id, if this target points at a known span.
    pub fn span_id(&self) -> Option<&str> {
        match self {
            Self::Span(id) => Some(id),
            Self::Location { .. } => None,
        }
    }
}

/// A typed directed relation between a source span and a target.
///
/// Duplicate `(source, target, kind)` tuples collapse in the store to
/// the maximum-confidence entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Source span.
    pub source_id: SpanId,
    /// Target span or unresolved location.
    pub target: EdgeTarget,
    /// Relation kind.
    pub kind: EdgeKind,
    /// Extraction confidence in [0, 1].
    pub confidence: f64,
    /// Extractor that produced this edge.
    pub provenance: EdgeProvenance,
}

impl EdgeRecord {
    /// Identity triple used for traversal de-duplication.
    pub fn identity(&self) -> (String, String, EdgeKind) {
        (self.source_id.clone(), self.target.key(), self.kind)
    }
}

// ---------------------------------------------------------------------------
// Retrieval types
// ---------------------------------------------------------------------------

/// Retrieval lane that contributed a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// BM25-style full-text search.
    Lexical,
    /// Embedding nearest-neighbor search.
    Vector,
    /// Cross-encoder / remote reranker.
    Rerank,
}

/// Which lanes contributed to a candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneMask {
    /// Lexical lane contributed.
    pub lexical: bool,
    /// Vector lane contributed.
    pub vector: bool,
    /// Reranker scored this candidate.
    pub rerank: bool,
}

/// A fused retrieval candidate with per-lane provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedChunk {
    /// The candidate chunk.
    pub chunk_id: ChunkId,
    /// Fused RRF score (post-rerank ordering does not overwrite this).
    pub score: f64,
    /// Lanes that surfaced the candidate.
    pub lanes: LaneMask,
    /// 1-based rank in the lexical lane, if present there.
    pub lexical_rank: Option<u32>,
    /// 1-based rank in the vector lane, if present there.
    pub vector_rank: Option<u32>,
    /// Reranker score, if the reranker scored this candidate.
    pub rerank_score: Option<f64>,
}

// ---------------------------------------------------------------------------
// Interaction / learning types
// ---------------------------------------------------------------------------

/// One observed retrieval candidate, persisted with the interaction so
/// the learner can re-rank it under trial weight vectors offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateObservation {
    /// Candidate span.
    pub span_id: SpanId,
    /// 1-based lexical lane rank, if any.
    pub lexical_rank: Option<u32>,
    /// 1-based vector lane rank, if any.
    pub vector_rank: Option<u32>,
    /// 1-based rerank lane rank, if any.
    pub rerank_rank: Option<u32>,
    /// Best incoming edge confidence at assembly time.
    pub edge_confidence: f64,
    /// Whether the span made it into the emitted bundle.
    pub selected: bool,
}

/// A recorded user interaction with an emitted bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    /// Database ID.
    pub id: i64,
    /// Session identifier.
    pub session: String,
    /// The query that produced the bundle.
    pub query: String,
    /// Bundle identifier.
    pub bundle_id: String,
    /// Bundle signature (sorted span ids | version | policy hash).
    pub signature: String,
    /// Whether the user accepted the bundle as satisfying.
    pub satisfied: bool,
    /// Free-form feedback notes.
    pub notes: String,
    /// Candidate set observed at assembly time.
    pub candidates: Vec<CandidateObservation>,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_id_is_pure() {
        let parents = vec!["p1".to_string()];
        let a = Span::compute_id(
            "repo",
            "src/auth.rs",
            10,
            90,
            SpanKind::Function,
            Some("rotate"),
            Some("fn rotate()"),
            Some("Rotates tokens."),
            &parents,
        );
        let b = Span::compute_id(
            "repo",
            "src/auth.rs",
            10,
            90,
            SpanKind::Function,
            Some("rotate"),
            Some("fn rotate()"),
            Some("Rotates tokens."),
            &parents,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_span_id_changes_with_any_field() {
        let base = Span::compute_id(
            "repo", "a.rs", 0, 10, SpanKind::Function, Some("f"), None, None, &[],
        );
        let other_range = Span::compute_id(
            "repo", "a.rs", 0, 11, SpanKind::Function, Some("f"), None, None, &[],
        );
        let other_kind = Span::compute_id(
            "repo", "a.rs", 0, 10, SpanKind::Method, Some("f"), None, None, &[],
        );
        let other_doc = Span::compute_id(
            "repo", "a.rs", 0, 10, SpanKind::Function, Some("f"), None, Some("d"), &[],
        );
        assert_ne!(base, other_range);
        assert_ne!(base, other_kind);
        assert_ne!(base, other_doc);
    }

    #[test]
    fn test_span_id_fields_do_not_alias() {
        // "ab" + "c" must not collide with "a" + "bc".
        let a = Span::compute_id("ab", "c", 0, 0, SpanKind::Module, None, None, None, &[]);
        let b = Span::compute_id("a", "bc", 0, 0, SpanKind::Module, None, None, None, &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_chunk_id_depends_on_context() {
        let a = Chunk::compute_id("span", "ctx1");
        let b = Chunk::compute_id("span", "ctx2");
        assert_ne!(a, b);
        assert_eq!(a, Chunk::compute_id("span", "ctx1"));
    }

    #[test]
    fn test_edge_kind_round_trip() {
        for kind in EdgeKind::ALL {
            assert_eq!(EdgeKind::from_str_lossy(kind.as_str()), kind);
        }
    }

    #[test]
    fn test_edge_target_key() {
        let span = EdgeTarget::Span("abc".into());
        assert_eq!(span.key(), "abc");
        let loc = EdgeTarget::Location {
            path: "src/x.rs".into(),
            byte_start: 5,
            byte_end: 9,
        };
        assert_eq!(loc.key(), "src/x.rs:5-9");
        assert!(loc.span_id().is_none());
    }
}
