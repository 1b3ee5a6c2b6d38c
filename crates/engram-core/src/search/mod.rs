//! Search Module
//!
//! The retrieval pipeline:
//! - `attributes` - heuristic + LLM query attribute extraction
//! - `keywords` - stop-word-filtered keyword signatures for the L2 cache
//! - `reranker` - cross-encoder reranker with the three-tier cache
//! - `pool` - project memory pool for cache warming
//! - `hybrid` - hybrid search orchestrator (vector + BM25 + rescoring)

mod attributes;
pub mod keywords;
mod pool;
mod reranker;
mod hybrid;

use serde::{Deserialize, Serialize};

use crate::memory::Metadata;

pub use attributes::{QueryAttributeExtractor, QueryAttributes};
pub use hybrid::{MemoryChunk, MemoryDetails, RecentMemory, SearchService, SearchStats};
pub use pool::{LoadedPool, PoolWarmStats, ProjectMemoryPool};
pub use reranker::{CrossEncoderReranker, RerankerMetrics};

// ============================================================================
// SHARED RESULT TYPES
// ============================================================================

/// Rule-based score components for a candidate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub memory_strength: f64,
    pub recency: f64,
    pub refs_reliability: f64,
    pub bm25: f64,
    pub vector: f64,
    pub metadata: f64,
}

/// A hybrid search candidate / result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    /// Rule-based combined score in [0, 1]
    pub score: f64,
    pub combined_score: f64,
    pub vector_similarity: f64,
    pub bm25_score: f64,
    pub components: ScoreComponents,
    /// Cross-encoder relevance, present after reranking
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_score: Option<f64>,
    /// Dedup priority (lower wins); internal
    #[serde(skip)]
    pub priority: i32,
}

impl SearchResult {
    /// Candidate id used for cache keys: the entry id, falling back to the
    /// metadata's memory id.
    pub fn candidate_id(&self) -> Option<String> {
        if !self.id.is_empty() {
            return Some(self.id.clone());
        }
        self.metadata
            .get("memory_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Project scope used for cache keys.
    pub fn project_scope(&self) -> Option<String> {
        self.metadata
            .get("project_id")
            .or_else(|| self.metadata.get("project"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}
