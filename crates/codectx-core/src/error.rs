//! Error types for codectx-core.
//!
//! Uses a hierarchical error enum so callers can pattern-match on
//! the failure class. Recoverable conditions (budget overflow,
//! traversal truncation, provider degradation) are not errors at all:
//! they are recorded as stop reasons on the bundle and the request
//! keeps going. Only conditions that make the request unservable
//! surface here.

use thiserror::Error;

/// Top-level error type for all codectx-core operations.
#[derive(Debug, Error)]
pub enum CtxError {
    // ---- Fail fast (no partial work) ----
    /// Invalid policy, budget, or interface parameters.
    #[error("configuration error: {details}")]
    Config {
        /// What's wrong with the configuration.
        details: String,
    },

    // ---- Request fails ----
    /// Store corruption, lock contention, or schema mismatch.
    #[error("store error: {details}")]
    Store {
        /// Diagnostic details.
        details: String,
    },

    /// Requested span, chunk, or file was not found in the store.
    #[error("not found: {entity}")]
    NotFound {
        /// Description of what was not found.
        entity: String,
    },

    // ---- Degraded (lane fails, request continues elsewhere) ----
    /// Remote embed/rerank provider failed. The caller degrades the
    /// affected lane and records the failure as evidence.
    #[error("provider error ({provider}): {message}")]
    Provider {
        /// Provider name.
        provider: String,
        /// Human-readable error description.
        message: String,
        /// Whether a retry could succeed (5xx/timeout vs 4xx).
        retryable: bool,
    },

    /// Ingest record failed validation (unknown fields, bad ranges).
    #[error("invalid ingest record: {details}")]
    Ingest {
        /// What's wrong with the record.
        details: String,
    },

    // ---- Wrapped external errors ----
    /// SQLite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal error for unexpected conditions. A bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CtxError {
    /// Returns true if a retry of the failed call could succeed.
    ///
    /// Only provider failures are ever retryable; everything else
    /// either fails the request or fails fast.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider { retryable: true, .. })
    }
}

/// Convenience type alias for Results in codectx-core.
pub type CtxResult<T> = Result<T, CtxError>;
