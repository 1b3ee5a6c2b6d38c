//! Storage Module
//!
//! Persistence adapters for the engine:
//! - `vector` - SQLite-backed entry store with HNSW approximate search
//! - `bm25` - Okapi BM25 lexical index with an opaque persistence blob
//! - `projects` / `bookmarks` - small JSON key-value stores

mod bm25;
mod bookmarks;
mod projects;
mod vector;

use thiserror::Error;

pub use bm25::{Bm25Hit, Bm25Index};
pub use bookmarks::{BookmarkStore, SearchBookmark};
pub use projects::{Project, ProjectStore};
pub use vector::{StoredEntry, VectorHit, VectorStore};

/// Storage error types
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying SQLite failure
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// ANN index failure
    #[error("vector index: {0}")]
    Index(String),

    /// Requested id does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid arguments (e.g. mismatched embedding dimensions)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Persisted blob could not be decoded
    #[error("corrupt store: {0}")]
    Corrupt(String),
}

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
