//! SQLite store: files, spans, chunks, FTS5 index, edges, caches, and
//! the interaction/learning substrate.
//!
//! ## Concurrency
//!
//! SQLite runs in WAL mode with `synchronous=NORMAL`, so readers never
//! block the writer. One writer connection is serialized behind a
//! mutex; reads go through a small pool of read-only connections picked
//! round-robin.
//!
//! ## Consistency
//!
//! All writes belonging to one reindex of a file happen in a single
//! transaction, FTS mutations included. Reindexing a file whose content
//! hash is unchanged performs zero writes.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{CtxError, CtxResult};
use crate::types::{
    Chunk, ChunkId, EdgeKind, EdgeProvenance, EdgeRecord, EdgeTarget, FileRecord, Interaction,
    Span, SpanId, SpanKind,
};

/// Current schema version. Migrations are forward-only: an on-disk
/// version newer than this is a schema mismatch, not a downgrade.
const SCHEMA_VERSION: i64 = 1;

/// Direction of an adjacency query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    /// Edges whose source is the queried span.
    Outgoing,
    /// Edges whose resolved target is the queried span.
    Incoming,
}

/// Outcome of a per-file reindex.
#[derive(Debug, Clone, Default)]
pub struct ReindexOutcome {
    /// True when the content hash matched and no writes were performed.
    pub unchanged: bool,
    /// Spans written in this reindex.
    pub spans_written: usize,
    /// Chunks written in this reindex.
    pub chunks_written: usize,
}

/// Aggregate store counts for status reporting.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreStats {
    /// Indexed files.
    pub files: u64,
    /// Stored spans.
    pub spans: u64,
    /// Stored chunks.
    pub chunks: u64,
    /// Stored edges (resolved and unresolved).
    pub edges: u64,
    /// Edges pending resolution.
    pub unresolved_edges: u64,
    /// Logged interactions.
    pub interactions: u64,
}

/// SQLite-backed store. Owns every persistent table; the retrieval,
/// traversal, and assembly layers hold read-only handles to it.
pub struct Store {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open(db_path: &Path, reader_pool_size: usize) -> CtxResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer = Connection::open(db_path)?;
        configure_connection(&writer)?;
        ensure_schema(&writer)?;

        let pool_size = reader_pool_size.max(1);
        let mut readers = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let conn = Connection::open(db_path)?;
            configure_connection(&conn)?;
            readers.push(Mutex::new(conn));
        }

        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
        })
    }

    fn reader(&self) -> MutexGuard<'_, Connection> {
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        self.readers[idx].lock()
    }

    /// Run an integrity check on the database.
    pub fn check_integrity(&self) -> CtxResult<bool> {
        let conn = self.reader();
        let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok(result == "ok")
    }

    // -----------------------------------------------------------------
    // Files / spans / chunks
    // -----------------------------------------------------------------

    /// Upsert file metadata, returning the file id.
    pub fn upsert_file(
        &self,
        repo: &str,
        path: &str,
        language: &str,
        content_hash: &str,
    ) -> CtxResult<i64> {
        let conn = self.writer.lock();
        upsert_file_tx(&conn, repo, path, language, content_hash)
    }

    /// Content hash currently stored for a file, if indexed.
    pub fn file_content_hash(&self, repo: &str, path: &str) -> CtxResult<Option<String>> {
        let conn = self.reader();
        let hash = conn
            .query_row(
                "SELECT content_hash FROM files WHERE repo = ?1 AND path = ?2",
                params![repo, path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    /// Reindex one file atomically: file row, spans, chunks, and FTS
    /// rows all move in a single transaction. Returns early with zero
    /// writes when the content hash is unchanged.
    pub fn reindex_file(
        &self,
        repo: &str,
        path: &str,
        language: &str,
        content_hash: &str,
        spans: &[Span],
        chunks: &[Chunk],
    ) -> CtxResult<ReindexOutcome> {
        let mut conn = self.writer.lock();

        let existing: Option<String> = conn
            .query_row(
                "SELECT content_hash FROM files WHERE repo = ?1 AND path = ?2",
                params![repo, path],
                |row| row.get(0),
            )
            .optional()?;
        if existing.as_deref() == Some(content_hash) {
            return Ok(ReindexOutcome {
                unchanged: true,
                ..ReindexOutcome::default()
            });
        }

        let tx = conn.transaction()?;

        let file_id = upsert_file_tx(&tx, repo, path, language, content_hash)?;

        // Drop previous spans for this file. Chunks cascade; the FTS
        // virtual table has no foreign keys, so its rows go explicitly.
        tx.execute(
            "DELETE FROM chunk_fts WHERE chunk_id IN (
                 SELECT c.id FROM chunks c
                 JOIN spans s ON c.span_id = s.id
                 WHERE s.file_id = ?1
             )",
            params![file_id],
        )?;
        tx.execute("DELETE FROM spans WHERE file_id = ?1", params![file_id])?;

        for span in spans {
            tx.execute(
                "INSERT OR REPLACE INTO spans
                     (id, file_id, kind, name, signature, doc, byte_start, byte_end, parents)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    span.id,
                    file_id,
                    span.kind.as_str(),
                    span.name,
                    span.signature,
                    span.doc,
                    span.byte_start,
                    span.byte_end,
                    serde_json::to_string(&span.parents)?,
                ],
            )?;
        }

        for chunk in chunks {
            tx.execute(
                "INSERT OR REPLACE INTO chunks (id, span_id, content, context_hash, token_estimate)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    chunk.id,
                    chunk.span_id,
                    chunk.content,
                    chunk.context_hash,
                    chunk.token_estimate,
                ],
            )?;
            tx.execute(
                "INSERT INTO chunk_fts (chunk_id, repo, path, content) VALUES (?1, ?2, ?3, ?4)",
                params![chunk.id, repo, path, chunk.content],
            )?;
        }

        tx.commit()?;

        Ok(ReindexOutcome {
            unchanged: false,
            spans_written: spans.len(),
            chunks_written: chunks.len(),
        })
    }

    /// Upsert a single span. The owning file must already be indexed;
    /// bulk ingest goes through [`Store::reindex_file`] instead.
    pub fn upsert_span(&self, span: &Span) -> CtxResult<()> {
        let conn = self.writer.lock();
        let file_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM files WHERE repo = ?1 AND path = ?2",
                params![span.repo, span.path],
                |row| row.get(0),
            )
            .optional()?;
        let Some(file_id) = file_id else {
            return Err(CtxError::NotFound {
                entity: format!("file {}:{}", span.repo, span.path),
            });
        };
        conn.execute(
            "INSERT OR REPLACE INTO spans
                 (id, file_id, kind, name, signature, doc, byte_start, byte_end, parents)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                span.id,
                file_id,
                span.kind.as_str(),
                span.name,
                span.signature,
                span.doc,
                span.byte_start,
                span.byte_end,
                serde_json::to_string(&span.parents)?,
            ],
        )?;
        Ok(())
    }

    /// Upsert a single chunk and its FTS row in one transaction. The
    /// owning span must already be stored.
    pub fn upsert_chunk(&self, chunk: &Chunk) -> CtxResult<()> {
        let mut conn = self.writer.lock();
        let origin: Option<(String, String)> = conn
            .query_row(
                "SELECT f.repo, f.path FROM spans s JOIN files f ON s.file_id = f.id
                 WHERE s.id = ?1",
                params![chunk.span_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((repo, path)) = origin else {
            return Err(CtxError::NotFound {
                entity: format!("span {}", chunk.span_id),
            });
        };
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM chunk_fts WHERE chunk_id = ?1",
            params![chunk.id],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO chunks (id, span_id, content, context_hash, token_estimate)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                chunk.id,
                chunk.span_id,
                chunk.content,
                chunk.context_hash,
                chunk.token_estimate,
            ],
        )?;
        tx.execute(
            "INSERT INTO chunk_fts (chunk_id, repo, path, content) VALUES (?1, ?2, ?3, ?4)",
            params![chunk.id, repo, path, chunk.content],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove a file and everything hanging off it.
    pub fn remove_file(&self, repo: &str, path: &str) -> CtxResult<bool> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let file_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM files WHERE repo = ?1 AND path = ?2",
                params![repo, path],
                |row| row.get(0),
            )
            .optional()?;
        let Some(file_id) = file_id else {
            return Ok(false);
        };
        tx.execute(
            "DELETE FROM chunk_fts WHERE chunk_id IN (
                 SELECT c.id FROM chunks c JOIN spans s ON c.span_id = s.id
                 WHERE s.file_id = ?1
             )",
            params![file_id],
        )?;
        tx.execute("DELETE FROM files WHERE id = ?1", params![file_id])?;
        tx.commit()?;
        Ok(true)
    }

    /// Fetch a span by id, joined with its file for repo/path.
    pub fn get_span(&self, id: &str) -> CtxResult<Option<Span>> {
        let conn = self.reader();
        let span = conn
            .query_row(
                "SELECT s.id, f.repo, f.path, s.byte_start, s.byte_end, s.kind,
                        s.name, s.signature, s.doc, s.parents
                 FROM spans s JOIN files f ON s.file_id = f.id
                 WHERE s.id = ?1",
                params![id],
                row_to_span,
            )
            .optional()?;
        Ok(span)
    }

    /// Fetch a chunk by id.
    pub fn get_chunk(&self, id: &str) -> CtxResult<Option<Chunk>> {
        let conn = self.reader();
        let chunk = conn
            .query_row(
                "SELECT id, span_id, content, context_hash, token_estimate
                 FROM chunks WHERE id = ?1",
                params![id],
                row_to_chunk,
            )
            .optional()?;
        Ok(chunk)
    }

    /// All chunks derived from a span, ordered by id for determinism.
    pub fn chunks_for_span(&self, span_id: &str) -> CtxResult<Vec<Chunk>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT id, span_id, content, context_hash, token_estimate
             FROM chunks WHERE span_id = ?1 ORDER BY id",
        )?;
        let chunks = stmt
            .query_map(params![span_id], row_to_chunk)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chunks)
    }

    /// Owning span and file language for a chunk, in one query.
    pub fn chunk_origin(&self, chunk_id: &str) -> CtxResult<Option<(Span, String)>> {
        let conn = self.reader();
        let row = conn
            .query_row(
                "SELECT s.id, f.repo, f.path, s.byte_start, s.byte_end, s.kind,
                        s.name, s.signature, s.doc, s.parents, f.language
                 FROM chunks c
                 JOIN spans s ON c.span_id = s.id
                 JOIN files f ON s.file_id = f.id
                 WHERE c.id = ?1",
                params![chunk_id],
                |row| {
                    let span = row_to_span(row)?;
                    let language: String = row.get(10)?;
                    Ok((span, language))
                },
            )
            .optional()?;
        Ok(row)
    }

    /// File metadata for a `(repo, path)` pair.
    pub fn get_file(&self, repo: &str, path: &str) -> CtxResult<Option<FileRecord>> {
        let conn = self.reader();
        let file = conn
            .query_row(
                "SELECT id, repo, path, language, content_hash
                 FROM files WHERE repo = ?1 AND path = ?2",
                params![repo, path],
                |row| {
                    Ok(FileRecord {
                        id: row.get(0)?,
                        repo: row.get(1)?,
                        path: row.get(2)?,
                        language: row.get(3)?,
                        content_hash: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(file)
    }

    // -----------------------------------------------------------------
    // Full-text search
    // -----------------------------------------------------------------

    /// BM25-ranked full-text search over chunk content.
    ///
    /// Returns up to `k` `(chunk_id, score)` pairs, higher score first.
    /// The raw query is reduced to quoted OR-joined terms so user
    /// punctuation cannot inject FTS5 syntax.
    pub fn fts_search(
        &self,
        query: &str,
        k: usize,
        repo: Option<&str>,
        path_glob: Option<&str>,
    ) -> CtxResult<Vec<(ChunkId, f64)>> {
        let Some(match_expr) = fts_match_expr(query) else {
            return Ok(Vec::new());
        };

        let glob = match path_glob {
            Some(pattern) => Some(
                globset::GlobBuilder::new(pattern)
                    .literal_separator(false)
                    .build()
                    .map_err(|e| CtxError::Config {
                        details: format!("invalid path glob {pattern:?}: {e}"),
                    })?
                    .compile_matcher(),
            ),
            None => None,
        };

        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT chunk_id, path, repo, bm25(chunk_fts) AS rank
             FROM chunk_fts WHERE chunk_fts MATCH ?1
             ORDER BY rank, chunk_id",
        )?;

        let rows = stmt.query_map(params![match_expr], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            let (chunk_id, path, row_repo, rank) = row?;
            if let Some(repo) = repo {
                if row_repo != repo {
                    continue;
                }
            }
            if let Some(glob) = &glob {
                if !glob.is_match(&path) {
                    continue;
                }
            }
            // bm25() is lower-is-better; flip so callers see descending.
            hits.push((chunk_id, -rank));
            if hits.len() >= k {
                break;
            }
        }
        Ok(hits)
    }

    /// Rebuild the FTS index from the chunks table. Repair path for a
    /// corrupted index; one transaction.
    pub fn rebuild_fts(&self) -> CtxResult<usize> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chunk_fts", [])?;
        let rebuilt = tx.execute(
            "INSERT INTO chunk_fts (chunk_id, repo, path, content)
             SELECT c.id, f.repo, f.path, c.content
             FROM chunks c
             JOIN spans s ON c.span_id = s.id
             JOIN files f ON s.file_id = f.id",
            [],
        )?;
        tx.commit()?;
        tracing::info!(chunks = rebuilt, "rebuilt FTS index from chunks");
        Ok(rebuilt)
    }

    // -----------------------------------------------------------------
    // Edges
    // -----------------------------------------------------------------

    /// Upsert an edge, collapsing duplicate `(source, target, kind)`
    /// tuples to the maximum-confidence entry. Returns the span ids
    /// whose adjacency changed (for traversal cache invalidation).
    pub fn upsert_edge(&self, edge: &EdgeRecord) -> CtxResult<Vec<SpanId>> {
        let conn = self.writer.lock();

        let (target_id, target_path, target_start, target_end) = match &edge.target {
            EdgeTarget::Span(id) => (Some(id.clone()), None, None, None),
            EdgeTarget::Location {
                path,
                byte_start,
                byte_end,
            } => (None, Some(path.clone()), Some(*byte_start), Some(*byte_end)),
        };

        // A span-id target still needs the span to exist before
        // traversal may follow it.
        let resolved = match &target_id {
            Some(id) => span_exists(&conn, id)?,
            None => false,
        };

        conn.execute(
            "INSERT INTO edges
                 (source_id, target_id, target_key, target_path, target_start, target_end,
                  kind, confidence, provenance, resolved)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (source_id, target_key, kind) DO UPDATE SET
                 confidence = max(confidence, excluded.confidence),
                 provenance = CASE WHEN excluded.confidence > confidence
                                   THEN excluded.provenance ELSE provenance END,
                 resolved = max(resolved, excluded.resolved)",
            params![
                edge.source_id,
                target_id,
                edge.target.key(),
                target_path,
                target_start,
                target_end,
                edge.kind.as_str(),
                edge.confidence,
                edge.provenance.as_str(),
                resolved,
            ],
        )?;

        let mut touched = vec![edge.source_id.clone()];
        if let Some(id) = target_id {
            touched.push(id);
        }
        Ok(touched)
    }

    /// Resolve pending edges: span-id targets that now exist, and
    /// location targets now covered by a stored span. Unresolvable
    /// edges stay flagged and invisible to traversal.
    pub fn resolve_edges(&self) -> CtxResult<usize> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;

        let by_id = tx.execute(
            "UPDATE edges SET resolved = 1
             WHERE resolved = 0 AND target_id IS NOT NULL
               AND target_id IN (SELECT id FROM spans)",
            [],
        )?;

        // Location targets: bind to the tightest span covering the range.
        let pending: Vec<(i64, String, u32, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT id, target_path, target_start, target_end FROM edges
                 WHERE resolved = 0 AND target_path IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut by_location = 0usize;
        for (edge_id, path, start, end) in pending {
            let span_id: Option<String> = tx
                .query_row(
                    "SELECT s.id FROM spans s JOIN files f ON s.file_id = f.id
                     WHERE f.path = ?1 AND s.byte_start <= ?2 AND s.byte_end >= ?3
                     ORDER BY (s.byte_end - s.byte_start) ASC, s.id ASC
                     LIMIT 1",
                    params![path, start, end],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(span_id) = span_id {
                tx.execute(
                    "UPDATE edges SET target_id = ?1, resolved = 1 WHERE id = ?2",
                    params![span_id, edge_id],
                )?;
                by_location += 1;
            }
        }

        tx.commit()?;
        Ok(by_id + by_location)
    }

    /// Adjacency query: resolved edges at one span, filtered by kind
    /// set, in deterministic order (confidence descending, then
    /// `(target_key, kind)` ascending).
    pub fn edges_at(
        &self,
        span_id: &str,
        direction: EdgeDirection,
        kinds: Option<&[EdgeKind]>,
    ) -> CtxResult<Vec<EdgeRecord>> {
        let column = match direction {
            EdgeDirection::Outgoing => "source_id",
            EdgeDirection::Incoming => "target_id",
        };
        let sql = format!(
            "SELECT source_id, target_id, target_path, target_start, target_end,
                    kind, confidence, provenance
             FROM edges
             WHERE {column} = ?1 AND resolved = 1
             ORDER BY confidence DESC, target_key ASC, kind ASC"
        );

        let conn = self.reader();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![span_id], row_to_edge)?;

        let mut edges = Vec::new();
        for row in rows {
            let edge = row?;
            if let Some(kinds) = kinds {
                if !kinds.contains(&edge.kind) {
                    continue;
                }
            }
            edges.push(edge);
        }
        Ok(edges)
    }

    /// Outgoing resolved edges from a span.
    pub fn get_outgoing_edges(
        &self,
        span_id: &str,
        kinds: Option<&[EdgeKind]>,
    ) -> CtxResult<Vec<EdgeRecord>> {
        self.edges_at(span_id, EdgeDirection::Outgoing, kinds)
    }

    /// Incoming resolved edges to a span.
    pub fn get_incoming_edges(
        &self,
        span_id: &str,
        kinds: Option<&[EdgeKind]>,
    ) -> CtxResult<Vec<EdgeRecord>> {
        self.edges_at(span_id, EdgeDirection::Incoming, kinds)
    }

    // -----------------------------------------------------------------
    // Embeddings
    // -----------------------------------------------------------------

    /// Store one embedding per `(chunk, model)`.
    pub fn put_embedding(&self, chunk_id: &str, model: &str, vector: &[f32]) -> CtxResult<()> {
        let blob = bincode::serialize(vector)
            .map_err(|e| CtxError::Internal(format!("embedding encode: {e}")))?;
        let conn = self.writer.lock();
        conn.execute(
            "INSERT OR REPLACE INTO embeddings (chunk_id, model, dim, vector)
             VALUES (?1, ?2, ?3, ?4)",
            params![chunk_id, model, vector.len() as i64, blob],
        )?;
        Ok(())
    }

    /// Embedding for a chunk under a model, if present.
    pub fn get_embedding(&self, chunk_id: &str, model: &str) -> CtxResult<Option<Vec<f32>>> {
        let conn = self.reader();
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT vector FROM embeddings WHERE chunk_id = ?1 AND model = ?2",
                params![chunk_id, model],
                |row| row.get(0),
            )
            .optional()?;
        blob.map(|b| {
            bincode::deserialize(&b).map_err(|e| CtxError::Internal(format!("embedding decode: {e}")))
        })
        .transpose()
    }

    /// All embeddings stored under a model, ordered by chunk id.
    pub fn embeddings_for_model(&self, model: &str) -> CtxResult<Vec<(ChunkId, Vec<f32>)>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT chunk_id, vector FROM embeddings WHERE model = ?1 ORDER BY chunk_id",
        )?;
        let rows = stmt.query_map(params![model], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (chunk_id, blob) = row?;
            let vector = bincode::deserialize(&blob)
                .map_err(|e| CtxError::Internal(format!("embedding decode: {e}")))?;
            out.push((chunk_id, vector));
        }
        Ok(out)
    }

    // -----------------------------------------------------------------
    // Rerank cache
    // -----------------------------------------------------------------

    /// Read a cached rerank ordering.
    pub fn rerank_cache_get(&self, key: &str) -> CtxResult<Option<Vec<(u32, f64)>>> {
        let conn = self.reader();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM rerank_cache WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(CtxError::from))
            .transpose()
    }

    /// Write a rerank ordering. Immutable once written: a second write
    /// under the same key is a no-op, never an overwrite.
    pub fn rerank_cache_put(&self, key: &str, ordering: &[(u32, f64)]) -> CtxResult<()> {
        let payload = serde_json::to_string(ordering)?;
        let conn = self.writer.lock();
        conn.execute(
            "INSERT OR IGNORE INTO rerank_cache (key, payload, created_at) VALUES (?1, ?2, ?3)",
            params![key, payload, now_secs()],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Interactions / audit
    // -----------------------------------------------------------------

    /// Append an interaction record, returning its row id.
    pub fn append_interaction(&self, interaction: &Interaction) -> CtxResult<i64> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT INTO interactions
                 (session, query, bundle_id, signature, satisfied, notes, candidates, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                interaction.session,
                interaction.query,
                interaction.bundle_id,
                interaction.signature,
                interaction.satisfied,
                interaction.notes,
                serde_json::to_string(&interaction.candidates)?,
                interaction.created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Interactions recorded at or after `since` (unix seconds).
    pub fn read_interactions(&self, since: i64) -> CtxResult<Vec<Interaction>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT id, session, query, bundle_id, signature, satisfied, notes, candidates, created_at
             FROM interactions WHERE created_at >= ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![since], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, i64>(8)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, session, query, bundle_id, signature, satisfied, notes, candidates, created_at) =
                row?;
            out.push(Interaction {
                id,
                session,
                query,
                bundle_id,
                signature,
                satisfied,
                notes,
                candidates: serde_json::from_str(&candidates)?,
                created_at,
            });
        }
        Ok(out)
    }

    /// Append a search audit row.
    pub fn log_search(&self, query: &str, k: usize, lanes: &serde_json::Value) -> CtxResult<()> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT INTO search_log (query, k, lanes, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![query, k as i64, lanes.to_string(), now_secs()],
        )?;
        Ok(())
    }

    /// Record a batch job run.
    pub fn record_job_run(&self, kind: &str, status: &str, detail: &str) -> CtxResult<()> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT INTO job_runs (kind, status, detail, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![kind, status, detail, now_secs()],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Policy persistence
    // -----------------------------------------------------------------

    /// Persist a policy snapshot under a new version.
    pub fn save_policy(&self, version: u64, policy_hash: &str, payload: &str) -> CtxResult<()> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT OR REPLACE INTO policy (version, policy_hash, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![version as i64, policy_hash, payload, now_secs()],
        )?;
        Ok(())
    }

    /// Newest persisted policy `(version, payload)`, if any.
    pub fn load_latest_policy(&self) -> CtxResult<Option<(u64, String)>> {
        let conn = self.reader();
        let row = conn
            .query_row(
                "SELECT version, payload FROM policy ORDER BY version DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Aggregate counts for status output.
    pub fn stats(&self) -> CtxResult<StoreStats> {
        let conn = self.reader();
        let count = |sql: &str| -> CtxResult<u64> {
            Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as u64)
        };
        Ok(StoreStats {
            files: count("SELECT COUNT(*) FROM files")?,
            spans: count("SELECT COUNT(*) FROM spans")?,
            chunks: count("SELECT COUNT(*) FROM chunks")?,
            edges: count("SELECT COUNT(*) FROM edges")?,
            unresolved_edges: count("SELECT COUNT(*) FROM edges WHERE resolved = 0")?,
            interactions: count("SELECT COUNT(*) FROM interactions")?,
        })
    }
}

fn configure_connection(conn: &Connection) -> CtxResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

fn ensure_schema(conn: &Connection) -> CtxResult<()> {
    conn.execute_batch(include_str!("schema.sql"))?;

    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match stored.and_then(|v| v.parse::<i64>().ok()) {
        None => {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) if v < SCHEMA_VERSION => {
            // Forward-only migration hook; v1 is the floor today.
            conn.execute(
                "UPDATE meta SET value = ?1 WHERE key = 'schema_version'",
                params![SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(v) => {
            return Err(CtxError::Store {
                details: format!("store schema version {v} is newer than supported {SCHEMA_VERSION}"),
            });
        }
    }
    Ok(())
}

fn upsert_file_tx(
    conn: &Connection,
    repo: &str,
    path: &str,
    language: &str,
    content_hash: &str,
) -> CtxResult<i64> {
    conn.execute(
        "INSERT INTO files (repo, path, language, content_hash)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (repo, path) DO UPDATE SET
             language = excluded.language,
             content_hash = excluded.content_hash",
        params![repo, path, language, content_hash],
    )?;
    let id = conn.query_row(
        "SELECT id FROM files WHERE repo = ?1 AND path = ?2",
        params![repo, path],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn span_exists(conn: &Connection, id: &str) -> CtxResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM spans WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn row_to_span(row: &rusqlite::Row<'_>) -> rusqlite::Result<Span> {
    let kind: String = row.get(5)?;
    let parents: String = row.get(9)?;
    Ok(Span {
        id: row.get(0)?,
        repo: row.get(1)?,
        path: row.get(2)?,
        byte_start: row.get(3)?,
        byte_end: row.get(4)?,
        kind: SpanKind::from_str_lossy(&kind),
        name: row.get(6)?,
        signature: row.get(7)?,
        doc: row.get(8)?,
        parents: serde_json::from_str(&parents).unwrap_or_default(),
    })
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        id: row.get(0)?,
        span_id: row.get(1)?,
        content: row.get(2)?,
        context_hash: row.get(3)?,
        token_estimate: row.get(4)?,
    })
}

fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<EdgeRecord> {
    let target_id: Option<String> = row.get(1)?;
    let target = match target_id {
        Some(id) => EdgeTarget::Span(id),
        None => EdgeTarget::Location {
            path: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            byte_start: row.get::<_, Option<u32>>(3)?.unwrap_or_default(),
            byte_end: row.get::<_, Option<u32>>(4)?.unwrap_or_default(),
        },
    };
    let kind: String = row.get(5)?;
    let provenance: String = row.get(7)?;
    Ok(EdgeRecord {
        source_id: row.get(0)?,
        target,
        kind: EdgeKind::from_str_lossy(&kind),
        confidence: row.get(6)?,
        provenance: EdgeProvenance::from_str_lossy(&provenance),
    })
}

/// Build an FTS5 MATCH expression from free text: bare terms, quoted,
/// OR-joined. Returns None when no indexable term remains.
fn fts_match_expr(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Unix timestamp in seconds.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Chunk;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = Store::open(&dir.path().join("ctx.db"), 2).expect("open store");
        (dir, store)
    }

    fn make_span(repo: &str, path: &str, start: u32, end: u32, name: &str) -> Span {
        let id = Span::compute_id(
            repo,
            path,
            start,
            end,
            SpanKind::Function,
            Some(name),
            None,
            None,
            &[],
        );
        Span {
            id,
            repo: repo.into(),
            path: path.into(),
            byte_start: start,
            byte_end: end,
            kind: SpanKind::Function,
            name: Some(name.into()),
            signature: None,
            doc: None,
            parents: Vec::new(),
        }
    }

    fn make_chunk(span: &Span, content: &str) -> Chunk {
        let context_hash = crate::types::sha256_hex(content.as_bytes());
        Chunk {
            id: Chunk::compute_id(&span.id, &context_hash),
            span_id: span.id.clone(),
            content: content.into(),
            context_hash,
            token_estimate: (content.len() / 3) as u32,
        }
    }

    #[test]
    fn test_open_creates_database() {
        let (_dir, store) = open_store();
        assert!(store.check_integrity().expect("integrity"));
    }

    #[test]
    fn test_reindex_is_content_hash_idempotent() {
        let (_dir, store) = open_store();
        let span = make_span("r", "src/a.rs", 0, 20, "alpha");
        let chunk = make_chunk(&span, "fn alpha() {}");

        let first = store
            .reindex_file("r", "src/a.rs", "rust", "hash1", &[span.clone()], &[chunk.clone()])
            .expect("reindex");
        assert!(!first.unchanged);
        assert_eq!(first.spans_written, 1);

        let second = store
            .reindex_file("r", "src/a.rs", "rust", "hash1", &[span], &[chunk])
            .expect("reindex again");
        assert!(second.unchanged);
        assert_eq!(second.spans_written, 0);
    }

    #[test]
    fn test_single_span_and_chunk_upsert() {
        let (_dir, store) = open_store();
        store
            .upsert_file("r", "src/solo.rs", "rust", "h1")
            .expect("file");
        let span = make_span("r", "src/solo.rs", 0, 30, "solo");
        store.upsert_span(&span).expect("span");
        let chunk = make_chunk(&span, "fn solo() { lonely_work(); }");
        store.upsert_chunk(&chunk).expect("chunk");

        assert!(store.get_span(&span.id).expect("get").is_some());
        let hits = store.fts_search("lonely", 10, None, None).expect("search");
        assert_eq!(hits.len(), 1);

        // Re-upserting the same chunk does not duplicate its FTS row.
        store.upsert_chunk(&chunk).expect("chunk again");
        let hits = store.fts_search("lonely", 10, None, None).expect("search");
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_upsert_span_requires_file() {
        let (_dir, store) = open_store();
        let span = make_span("r", "src/missing.rs", 0, 10, "ghost");
        assert!(matches!(
            store.upsert_span(&span),
            Err(CtxError::NotFound { .. })
        ));
    }

    #[test]
    fn test_fts_search_finds_chunk() {
        let (_dir, store) = open_store();
        let span = make_span("r", "src/auth.rs", 0, 40, "rotate");
        let chunk = make_chunk(&span, "fn rotate() { refresh_token_rotation(); }");
        store
            .reindex_file("r", "src/auth.rs", "rust", "h", &[span], &[chunk.clone()])
            .expect("reindex");

        let hits = store
            .fts_search("refresh token rotation", 10, None, None)
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, chunk.id);
    }

    #[test]
    fn test_fts_search_path_glob_filter() {
        let (_dir, store) = open_store();
        let a = make_span("r", "src/auth.rs", 0, 10, "alpha");
        let b = make_span("r", "tests/auth.rs", 0, 10, "alpha_test");
        store
            .reindex_file("r", "src/auth.rs", "rust", "h1", &[a.clone()], &[make_chunk(&a, "alpha body")])
            .expect("reindex a");
        store
            .reindex_file("r", "tests/auth.rs", "rust", "h2", &[b.clone()], &[make_chunk(&b, "alpha body test")])
            .expect("reindex b");

        let hits = store
            .fts_search("alpha", 10, None, Some("src/*"))
            .expect("search");
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_edge_dedupe_keeps_max_confidence() {
        let (_dir, store) = open_store();
        let s1 = make_span("r", "a.rs", 0, 10, "f");
        let s2 = make_span("r", "b.rs", 0, 10, "g");
        store
            .reindex_file("r", "a.rs", "rust", "h1", &[s1.clone()], &[make_chunk(&s1, "f")])
            .expect("reindex");
        store
            .reindex_file("r", "b.rs", "rust", "h2", &[s2.clone()], &[make_chunk(&s2, "g")])
            .expect("reindex");

        let low = EdgeRecord {
            source_id: s1.id.clone(),
            target: EdgeTarget::Span(s2.id.clone()),
            kind: EdgeKind::Call,
            confidence: 0.4,
            provenance: EdgeProvenance::Heuristic,
        };
        let high = EdgeRecord {
            confidence: 0.9,
            provenance: EdgeProvenance::Lsp,
            ..low.clone()
        };
        store.upsert_edge(&low).expect("low");
        store.upsert_edge(&high).expect("high");
        store.upsert_edge(&low).expect("low again");

        let edges = store.get_outgoing_edges(&s1.id, None).expect("edges");
        assert_eq!(edges.len(), 1);
        assert!((edges[0].confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(edges[0].provenance, EdgeProvenance::Lsp);
    }

    #[test]
    fn test_unresolved_edges_excluded_from_adjacency() {
        let (_dir, store) = open_store();
        let s1 = make_span("r", "a.rs", 0, 10, "f");
        store
            .reindex_file("r", "a.rs", "rust", "h1", &[s1.clone()], &[make_chunk(&s1, "f")])
            .expect("reindex");

        let dangling = EdgeRecord {
            source_id: s1.id.clone(),
            target: EdgeTarget::Span("missing-span".into()),
            kind: EdgeKind::Call,
            confidence: 1.0,
            provenance: EdgeProvenance::Lsp,
        };
        store.upsert_edge(&dangling).expect("upsert");

        assert!(store.get_outgoing_edges(&s1.id, None).expect("edges").is_empty());
        let stats = store.stats().expect("stats");
        assert_eq!(stats.edges, 1);
        assert_eq!(stats.unresolved_edges, 1);
    }

    #[test]
    fn test_resolve_location_edge_to_covering_span() {
        let (_dir, store) = open_store();
        let s1 = make_span("r", "a.rs", 0, 10, "f");
        let s2 = make_span("r", "b.rs", 0, 100, "g");
        store
            .reindex_file("r", "a.rs", "rust", "h1", &[s1.clone()], &[make_chunk(&s1, "f")])
            .expect("reindex");
        store
            .reindex_file("r", "b.rs", "rust", "h2", &[s2.clone()], &[make_chunk(&s2, "g")])
            .expect("reindex");

        let edge = EdgeRecord {
            source_id: s1.id.clone(),
            target: EdgeTarget::Location {
                path: "b.rs".into(),
                byte_start: 10,
                byte_end: 20,
            },
            kind: EdgeKind::Call,
            confidence: 0.8,
            provenance: EdgeProvenance::Heuristic,
        };
        store.upsert_edge(&edge).expect("upsert");
        let resolved = store.resolve_edges().expect("resolve");
        assert_eq!(resolved, 1);

        let edges = store.get_outgoing_edges(&s1.id, None).expect("edges");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target.span_id(), Some(s2.id.as_str()));
    }

    #[test]
    fn test_edge_ordering_deterministic() {
        let (_dir, store) = open_store();
        let src = make_span("r", "a.rs", 0, 10, "f");
        let t1 = make_span("r", "b.rs", 0, 10, "g");
        let t2 = make_span("r", "c.rs", 0, 10, "h");
        for (path, span) in [("a.rs", &src), ("b.rs", &t1), ("c.rs", &t2)] {
            store
                .reindex_file("r", path, "rust", path, &[span.clone()], &[make_chunk(span, path)])
                .expect("reindex");
        }

        for (target, conf) in [(&t1, 0.5), (&t2, 0.9)] {
            store
                .upsert_edge(&EdgeRecord {
                    source_id: src.id.clone(),
                    target: EdgeTarget::Span(target.id.clone()),
                    kind: EdgeKind::Call,
                    confidence: conf,
                    provenance: EdgeProvenance::Lsp,
                })
                .expect("upsert");
        }

        let edges = store.get_outgoing_edges(&src.id, None).expect("edges");
        assert_eq!(edges.len(), 2);
        assert!(edges[0].confidence >= edges[1].confidence);
        assert_eq!(edges[0].target.span_id(), Some(t2.id.as_str()));
    }

    #[test]
    fn test_rerank_cache_is_immutable() {
        let (_dir, store) = open_store();
        let first = vec![(0u32, 0.9f64), (1, 0.3)];
        let second = vec![(1u32, 0.99f64), (0, 0.01)];
        store.rerank_cache_put("k", &first).expect("put");
        store.rerank_cache_put("k", &second).expect("put again");
        let cached = store.rerank_cache_get("k").expect("get").expect("present");
        assert_eq!(cached, first);
    }

    #[test]
    fn test_interaction_round_trip() {
        let (_dir, store) = open_store();
        let interaction = Interaction {
            id: 0,
            session: "s1".into(),
            query: "find auth".into(),
            bundle_id: "c_1".into(),
            signature: "sig".into(),
            satisfied: true,
            notes: "helpful".into(),
            candidates: vec![crate::types::CandidateObservation {
                span_id: "sp1".into(),
                lexical_rank: Some(1),
                vector_rank: None,
                rerank_rank: None,
                edge_confidence: 0.0,
                selected: true,
            }],
            created_at: 1000,
        };
        store.append_interaction(&interaction).expect("append");

        let read = store.read_interactions(0).expect("read");
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].query, "find auth");
        assert_eq!(read[0].candidates.len(), 1);
        assert!(store.read_interactions(2000).expect("read").is_empty());
    }

    #[test]
    fn test_rebuild_fts_restores_search() {
        let (_dir, store) = open_store();
        let span = make_span("r", "src/a.rs", 0, 20, "alpha");
        store
            .reindex_file("r", "src/a.rs", "rust", "h", &[span.clone()], &[make_chunk(&span, "alpha beta gamma")])
            .expect("reindex");

        {
            let conn = store.writer.lock();
            conn.execute("DELETE FROM chunk_fts", []).expect("clear fts");
        }
        assert!(store.fts_search("alpha", 10, None, None).expect("search").is_empty());

        store.rebuild_fts().expect("rebuild");
        assert_eq!(store.fts_search("alpha", 10, None, None).expect("search").len(), 1);
    }

    #[test]
    fn test_fts_match_expr_sanitizes() {
        assert_eq!(
            fts_match_expr("JWT_SECRET default"),
            Some("\"JWT_SECRET\" OR \"default\"".into())
        );
        assert_eq!(fts_match_expr("  ;;  "), None);
    }
}
