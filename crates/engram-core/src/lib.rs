//! # Engram Core
//!
//! Local-first conversational memory engine. Ingests dialogue turns, stores
//! them as schema-classified memories, and serves hybrid retrieval with
//! cross-encoder reranking:
//!
//! - **Hybrid Search**: vector similarity (HNSW) + BM25 merged and rescored
//!   with a rule-based formula (strength, recency, references, metadata
//!   alignment)
//! - **Cross-Encoder Reranker**: LLM-scored relevance behind a three-tier
//!   cache (exact / keyword signature / semantic ladder) with parallel
//!   scoring and graceful degradation under queue pressure
//! - **Project Memory Pool**: pre-loads project embeddings to warm the
//!   semantic cache for query-agnostic hits
//! - **Consolidation**: working -> short-term migration, greedy similarity
//!   clustering with representatives, and age+importance forgetting
//! - **Model Gateway**: task-routed local (Ollama) and cloud (CLI) tiers
//!   with automatic fallback
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use engram_core::{Conversation, IngestionService, SearchService};
//!
//! let memory_id = ingestion.ingest_conversation(&Conversation {
//!     user: "How to fix TypeError?".into(),
//!     assistant: "Check None values before calling methods.".into(),
//!     source: "cli".into(),
//!     ..Default::default()
//! })?;
//!
//! let results = search.search("TypeError fix", Some(5), None);
//! ```

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod consolidation;
pub mod error;
pub mod ingestion;
pub mod memory;
pub mod model;
pub mod processing;
pub mod search;
pub mod session;
pub mod storage;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Configuration
pub use config::{
    ConsolidationConfig, CrossEncoderConfig, EngineConfig, ModelConfig, PoolConfig, SearchConfig,
    SessionConfig, WorkingMemoryConfig, LANG_OVERRIDE_ENV,
};

// Errors
pub use error::{EngineError, Result};

// Memory model
pub use memory::{
    sanitize_metadata, Chunk, Conversation, Memory, MemoryTier, Metadata, MetadataValue,
    SchemaType, MEMORY_METADATA_SUFFIX,
};

// Model gateway
pub use model::{
    cosine_similarity, CliModelClient, Embedding, EmbeddingBackend, GenerateOptions,
    GenerationBackend, ModelError, ModelRouter, OllamaClient, Route, TaskKind,
    INTERNAL_CALL_SENTINEL,
};

// Processing
pub use processing::{salience_weight, Chunker, Indexer, SchemaClassifier};

// Storage
pub use storage::{
    Bm25Hit, Bm25Index, BookmarkStore, Project, ProjectStore, SearchBookmark, StorageError,
    StoredEntry, VectorHit, VectorStore,
};

// Search pipeline
pub use search::{
    CrossEncoderReranker, MemoryChunk, MemoryDetails, ProjectMemoryPool, QueryAttributeExtractor,
    QueryAttributes, RecentMemory, RerankerMetrics, ScoreComponents, SearchResult, SearchService,
    SearchStats,
};

// Services
pub use consolidation::{ConsolidationService, ConsolidationStats};
pub use ingestion::{detect_language, IngestionService};
pub use session::{CommandEntry, ProjectHint, SessionCoordinator, MANUAL_RPC_SOURCE};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
