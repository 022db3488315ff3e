//! Embedded knowledge-base service.
//!
//! Stores document collections, ingests files/URLs/transcripts through
//! pluggable processors with progress and statistics tracking, and serves
//! vector queries. The vector store is an external Chroma-compatible engine
//! reached over HTTP; the registry row in SQLite is the single source of
//! truth for each ingestion job.

pub mod chunking;
pub mod embeddings;
pub mod ingestion;
pub mod models;
pub mod plugins;
pub mod query;
pub mod store;
pub mod vector;

/// Errors from knowledge-base operations.
#[derive(Debug, thiserror::Error)]
pub enum KbError {
    /// Database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Lookup target does not exist.
    #[error("{entity} not found")]
    NotFound {
        /// Entity kind (for the message).
        entity: &'static str,
    },
    /// Request payload failed validation.
    #[error("validation error: {0}")]
    Validation(String),
    /// Vector store failure.
    #[error("vector store error: {0}")]
    VectorStore(String),
    /// Embedding generation failure.
    #[error("embedding error: {0}")]
    Embedding(String),
    /// Filesystem failure while persisting uploads or derivatives.
    #[error("storage error: {0}")]
    Storage(String),
    /// Requested plugin is not registered.
    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),
}
