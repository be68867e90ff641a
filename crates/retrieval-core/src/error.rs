//! Error types for the retrieval engine.
//!
//! Uses a hierarchical error enum so callers can pattern-match on the
//! subsystem that failed, and a `transient()` classifier so retry logic in
//! the ingestion/retrieval pipelines doesn't need to match every variant.
//! Each external-facing error also carries the kind it maps onto
//! (`ConfigError`, `TransientRpc`, `PermanentRpc`, `ParseError`,
//! `ConsistencyError`, `Cancelled`).

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for all retrieval-core operations.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Configuration is invalid, missing a required field, or combines
    /// features inconsistently (e.g. hybrid search requested with no
    /// sparse service URL configured).
    #[error("configuration error: {details}")]
    Config {
        /// What's wrong with the config.
        details: String,
    },

    /// A call to an embedding, sparse, or reranker RPC service failed in a
    /// way that is expected to succeed on retry (timeout, connection reset,
    /// 5xx, 429).
    #[error("transient RPC error calling {service}: {message}")]
    TransientRpc {
        /// Name of the remote service (`"dense-embedder"`, `"reranker"`, ...).
        service: String,
        /// Human-readable error description.
        message: String,
    },

    /// A call to an embedding, sparse, or reranker RPC service failed in a
    /// way that will not succeed on retry (4xx other than 429/413, malformed
    /// response schema).
    #[error("permanent RPC error calling {service}: {message}")]
    PermanentRpc {
        /// Name of the remote service.
        service: String,
        /// Human-readable error description.
        message: String,
    },

    /// A single file or document failed to parse or chunk. The rest of the
    /// ingestion job continues.
    #[error("parse error for {path}: {message}")]
    Parse {
        /// Path or URL of the item that failed to parse.
        path: String,
        /// Human-readable error description.
        message: String,
    },

    /// The catalog and vector store disagree about the state of an entity in
    /// a way that cannot be reconciled automatically (e.g. a chunk row
    /// exists with no matching vector point after a crash mid-upsert).
    #[error("consistency error: {details}")]
    Consistency {
        /// Diagnostic details.
        details: String,
    },

    /// The operation was cancelled by its caller (job cancellation, request
    /// timeout) before it completed.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Requested entity was not found in the catalog.
    #[error("not found: {entity}")]
    NotFound {
        /// Description of what was not found.
        entity: String,
    },

    /// Path to the data directory does not exist: {0}
    #[error("path unreadable: {0}")]
    Path(PathBuf),

    // ---- Wrapped external errors ----
    /// SQLite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RetrievalError {
    /// True if the caller should retry this operation with backoff rather
    /// than surface it or fall back immediately.
    #[must_use]
    pub fn transient(&self) -> bool {
        matches!(self, RetrievalError::TransientRpc { .. })
    }

    /// True if this error represents cancellation, which callers should
    /// propagate rather than retry or log as a failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetrievalError::Cancelled(_))
    }
}

/// Convenience type alias for Results in retrieval-core.
pub type RetrievalResult<T> = Result<T, RetrievalError>;
