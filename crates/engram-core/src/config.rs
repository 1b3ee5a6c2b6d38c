//! Engine Configuration
//!
//! Every option has a default; an optional `config.toml` in the data
//! directory overrides them. The two environment variables the core consumes
//! (`CONTEXT_ORCHESTRATOR_INTERNAL`, `CONTEXT_ORCHESTRATOR_LANG_OVERRIDE`)
//! are read where they apply, not here.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Environment variable forcing the language detection result.
pub const LANG_OVERRIDE_ENV: &str = "CONTEXT_ORCHESTRATOR_LANG_OVERRIDE";

// ============================================================================
// CONFIG SECTIONS
// ============================================================================

/// Cross-encoder reranker options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossEncoderConfig {
    pub enabled: bool,
    /// Only the first N candidates are rescored
    pub max_candidates: usize,
    /// Bound for the L1/L2 caches and the L3 candidate count
    pub cache_max_entries: usize,
    pub cache_ttl_seconds: u64,
    /// Worker pool size; 1 means sequential scoring
    pub max_parallel: usize,
    /// Queue-wait cutoff for degraded scoring; 0 disables
    pub fallback_max_wait_ms: u64,
    /// "heuristic" or "none"
    pub fallback_mode: String,
    pub semantic_similarity_threshold: f64,
    pub skip_rerank_for_simple_queries: bool,
    pub simple_query_max_words: usize,
}

impl Default for CrossEncoderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_candidates: 5,
            cache_max_entries: 256,
            cache_ttl_seconds: 900,
            max_parallel: 1,
            fallback_max_wait_ms: 0,
            fallback_mode: "heuristic".to_string(),
            semantic_similarity_threshold: 0.80,
            skip_rerank_for_simple_queries: true,
            simple_query_max_words: 3,
        }
    }
}

/// Project memory pool options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Most-recent memories kept per project
    pub size: usize,
    pub ttl_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 100,
            ttl_seconds: 28_800,
        }
    }
}

/// Consolidation thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub similarity_threshold: f64,
    pub min_cluster_size: usize,
    pub age_threshold_days: i64,
    pub importance_threshold: f64,
    /// Background scheduler cadence
    pub interval_hours: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.9,
            min_cluster_size: 2,
            age_threshold_days: 30,
            importance_threshold: 0.3,
            interval_hours: 24,
        }
    }
}

/// Working memory options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkingMemoryConfig {
    pub retention_hours: i64,
}

impl Default for WorkingMemoryConfig {
    fn default() -> Self {
        Self { retention_hours: 8 }
    }
}

/// Model gateway options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub embedding_model: String,
    pub inference_model: String,
    /// Cloud tier CLI command; empty disables the cloud tier
    pub cloud_command: String,
    pub timeout_seconds: u64,
    /// Languages the local summary tier handles well; anything else routes
    /// the summary task to the cloud tier
    pub supported_languages: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            inference_model: "qwen2.5:7b".to_string(),
            cloud_command: "claude".to_string(),
            timeout_seconds: 60,
            supported_languages: vec!["en".to_string()],
        }
    }
}

/// Session coordination options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Hint confidence needed to trigger project prefetch
    pub prefetch_confidence: f64,
    /// Session log rotation threshold
    pub max_log_size_mb: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefetch_confidence: 0.55,
            max_log_size_mb: 10,
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// Full engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(flatten)]
    pub search: SearchConfig,
    pub cross_encoder: CrossEncoderConfig,
    pub pool: PoolConfig,
    pub consolidation: ConsolidationConfig,
    pub working_memory: WorkingMemoryConfig,
    pub model: ModelConfig,
    pub session: SessionConfig,
}

/// Hybrid search options (top level of the flat map).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub candidate_count: usize,
    pub result_count: usize,
    pub recency_half_life_hours: f64,
    /// Attribute-extractor LLM confidence floor
    pub min_llm_confidence: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            candidate_count: 50,
            result_count: 10,
            recency_half_life_hours: 24.0,
            min_llm_confidence: 0.4,
        }
    }
}

impl EngineConfig {
    /// Load `<data_dir>/config.toml` when present, defaults otherwise.
    /// A malformed file is logged and ignored rather than fatal.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join("config.toml");
        match std::fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(config) => config,
                Err(e) => {
                    warn!("malformed config.toml, using defaults: {e}");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.search.candidate_count, 50);
        assert_eq!(config.search.result_count, 10);
        assert_eq!(config.search.recency_half_life_hours, 24.0);
        assert!(config.cross_encoder.enabled);
        assert_eq!(config.cross_encoder.max_candidates, 5);
        assert_eq!(config.cross_encoder.max_parallel, 1);
        assert_eq!(config.cross_encoder.fallback_max_wait_ms, 0);
        assert_eq!(config.cross_encoder.fallback_mode, "heuristic");
        assert_eq!(config.cross_encoder.semantic_similarity_threshold, 0.80);
        assert!(config.cross_encoder.skip_rerank_for_simple_queries);
        assert_eq!(config.cross_encoder.simple_query_max_words, 3);
        assert_eq!(config.pool.size, 100);
        assert_eq!(config.pool.ttl_seconds, 28_800);
        assert_eq!(config.consolidation.similarity_threshold, 0.9);
        assert_eq!(config.consolidation.min_cluster_size, 2);
        assert_eq!(config.consolidation.age_threshold_days, 30);
        assert_eq!(config.consolidation.importance_threshold, 0.3);
        assert_eq!(config.working_memory.retention_hours, 8);
        assert_eq!(config.session.prefetch_confidence, 0.55);
        assert_eq!(config.session.max_log_size_mb, 10);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let raw = r#"
            candidate_count = 20

            [cross_encoder]
            max_parallel = 4
            cache_ttl_seconds = 28800
        "#;
        let config: EngineConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.search.candidate_count, 20);
        assert_eq!(config.search.result_count, 10);
        assert_eq!(config.cross_encoder.max_parallel, 4);
        assert_eq!(config.cross_encoder.cache_ttl_seconds, 28_800);
        assert_eq!(config.cross_encoder.max_candidates, 5);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path());
        assert_eq!(config.search.result_count, 10);
    }

    #[test]
    fn test_load_malformed_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "not [ valid").unwrap();
        let config = EngineConfig::load(dir.path());
        assert_eq!(config.search.candidate_count, 50);
    }
}
