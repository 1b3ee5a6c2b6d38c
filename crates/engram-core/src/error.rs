//! Engine-wide error type
//!
//! Subsystems keep their own error enums (`StorageError`, `ModelError`);
//! this type is the one surfaced across service boundaries and mapped onto
//! RPC error objects by the façade.

use thiserror::Error;

use crate::model::ModelError;
use crate::storage::StorageError;

/// Errors surfaced by the engine's service layer.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EngineError {
    /// Memory or project absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad parameters
    #[error("validation: {0}")]
    Validation(String),

    /// Persistence layer failure
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// Embedding or generation failed
    #[error("model: {0}")]
    Model(#[from] ModelError),

    /// Queue-wait or model call exceeded its bound
    #[error("timeout after {0} ms")]
    Timeout(u64),

    /// Index load failure
    #[error("corruption: {0}")]
    Corruption(String),

    /// Anything else
    #[error("internal: {0}")]
    Internal(String),
}

/// Convenience alias used across the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
