//! Project Memory Pool
//!
//! Pre-loads a project's memory embeddings so the reranker's semantic cache
//! can be warmed query-agnostically. Optimizes for a developer working on a
//! single project for extended periods: once the project is confirmed, any
//! query semantically close to its memories hits the L3 tier without an LLM
//! call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::CrossEncoderReranker;
use crate::memory::{Metadata, MetadataValue, MEMORY_METADATA_SUFFIX};
use crate::model::ModelRouter;
use crate::storage::VectorStore;

// ============================================================================
// TYPES
// ============================================================================

/// A loaded project pool.
#[derive(Debug, Clone)]
pub struct LoadedPool {
    pub project_id: String,
    pub loaded_at: Instant,
    pub memory_count: usize,
    /// candidate_id -> memory embedding
    pub embeddings: HashMap<String, Vec<f32>>,
    /// candidate_id -> entry metadata
    pub metadata: HashMap<String, Metadata>,
}

impl LoadedPool {
    fn empty(project_id: &str, loaded_at: Instant) -> Self {
        Self {
            project_id: project_id.to_string(),
            loaded_at,
            memory_count: 0,
            embeddings: HashMap::new(),
            metadata: HashMap::new(),
        }
    }
}

/// Cache warm-up statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolWarmStats {
    pub project_id: String,
    pub memories_loaded: usize,
    pub cache_entries_added: usize,
    pub elapsed_ms: f64,
}

// ============================================================================
// POOL
// ============================================================================

/// Per-process pool of project memory embeddings.
pub struct ProjectMemoryPool {
    vector: Arc<VectorStore>,
    router: Arc<ModelRouter>,
    max_memories_per_project: usize,
    ttl: Duration,
    pools: Mutex<HashMap<String, LoadedPool>>,
}

impl ProjectMemoryPool {
    pub fn new(
        vector: Arc<VectorStore>,
        router: Arc<ModelRouter>,
        max_memories_per_project: usize,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            vector,
            router,
            max_memories_per_project: max_memories_per_project.max(1),
            ttl: Duration::from_secs(ttl_seconds),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Load a project's memories and their embeddings, reusing a fresh
    /// cached pool when available.
    pub fn load_project(&self, project_id: &str) -> LoadedPool {
        let now = Instant::now();

        {
            let pools = self.pools.lock().expect("pool lock poisoned");
            if let Some(pool) = pools.get(project_id) {
                if now.duration_since(pool.loaded_at) <= self.ttl {
                    debug!(project_id, "reusing fresh project pool");
                    return pool.clone();
                }
            }
        }

        info!(project_id, "loading project memory pool");
        let started = Instant::now();

        let mut filter = Metadata::new();
        filter.insert(
            "project_id".to_string(),
            MetadataValue::Str(project_id.to_string()),
        );
        filter.insert("is_memory_entry".to_string(), MetadataValue::Bool(true));

        let mut memories = match self.vector.list_by_metadata(&filter, true, false) {
            Ok(memories) => memories,
            Err(e) => {
                warn!(project_id, "project pool load failed: {e}");
                return LoadedPool::empty(project_id, now);
            }
        };

        if memories.is_empty() {
            warn!(project_id, "no memories found for project");
            return LoadedPool::empty(project_id, now);
        }

        // Keep the most recent N
        memories.sort_by(|a, b| {
            let created = |entry: &crate::storage::StoredEntry| {
                entry
                    .metadata
                    .get("created_at")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            };
            created(b).cmp(&created(a))
        });
        memories.truncate(self.max_memories_per_project);

        let mut embeddings = HashMap::new();
        let mut metadata_map = HashMap::new();
        for memory in &memories {
            if memory.content.is_empty() {
                continue;
            }
            match self.router.generate_embedding(&memory.content) {
                Ok(embedding) => {
                    embeddings.insert(memory.id.clone(), embedding);
                    metadata_map.insert(memory.id.clone(), memory.metadata.clone());
                }
                Err(e) => {
                    warn!(candidate = %memory.id, "pool embedding failed: {e}");
                }
            }
        }

        let pool = LoadedPool {
            project_id: project_id.to_string(),
            loaded_at: now,
            memory_count: embeddings.len(),
            embeddings,
            metadata: metadata_map,
        };

        self.pools
            .lock()
            .expect("pool lock poisoned")
            .insert(project_id.to_string(), pool.clone());

        info!(
            project_id,
            memories = memories.len(),
            embeddings = pool.memory_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "loaded project pool"
        );
        pool
    }

    /// Load the pool and seed the reranker's semantic cache with it.
    pub fn warm_cache(
        &self,
        reranker: &CrossEncoderReranker,
        project_id: &str,
    ) -> PoolWarmStats {
        let started = Instant::now();
        let pool = self.load_project(project_id);

        let mut stats = PoolWarmStats {
            project_id: project_id.to_string(),
            memories_loaded: pool.memory_count,
            cache_entries_added: 0,
            elapsed_ms: 0.0,
        };

        if pool.embeddings.is_empty() {
            warn!(project_id, "no embeddings to warm cache with");
            return stats;
        }

        stats.cache_entries_added = reranker.warm_semantic_cache_from_pool(&pool.embeddings);
        stats.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        info!(
            project_id,
            memories = stats.memories_loaded,
            entries = stats.cache_entries_added,
            "warmed reranker cache from project pool"
        );
        stats
    }

    /// Base memory ids of a loaded pool (with the `-metadata` suffix
    /// stripped), used for candidate filtering.
    pub fn get_memory_ids(&self, project_id: &str) -> HashSet<String> {
        let pools = self.pools.lock().expect("pool lock poisoned");
        let Some(pool) = pools.get(project_id) else {
            return HashSet::new();
        };
        pool.embeddings
            .keys()
            .map(|id| {
                id.strip_suffix(MEMORY_METADATA_SUFFIX)
                    .unwrap_or(id)
                    .to_string()
            })
            .collect()
    }

    /// Drop a loaded pool. Returns whether one was present.
    pub fn clear_pool(&self, project_id: &str) -> bool {
        self.pools
            .lock()
            .expect("pool lock poisoned")
            .remove(project_id)
            .is_some()
    }

    /// Drop every loaded pool. Returns how many were cleared.
    pub fn clear_all_pools(&self) -> usize {
        let mut pools = self.pools.lock().expect("pool lock poisoned");
        let count = pools.len();
        pools.clear();
        info!(count, "cleared all project pools");
        count
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrossEncoderConfig;
    use crate::model::testing::fixed_router;

    fn store_with_project_memories() -> Arc<VectorStore> {
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        for (id, created) in [
            ("mem-a-metadata", "2026-01-03T00:00:00Z"),
            ("mem-b-metadata", "2026-01-02T00:00:00Z"),
            ("mem-c-metadata", "2026-01-01T00:00:00Z"),
        ] {
            let mut metadata = Metadata::new();
            metadata.insert("project_id".to_string(), MetadataValue::Str("p1".to_string()));
            metadata.insert("is_memory_entry".to_string(), MetadataValue::Bool(true));
            metadata.insert("created_at".to_string(), MetadataValue::Str(created.to_string()));
            store.add(id, &[1.0, 0.0], &metadata, "summary text").unwrap();
        }
        store
    }

    #[test]
    fn test_load_project_collects_embeddings() {
        let store = store_with_project_memories();
        let router = Arc::new(fixed_router("", vec![0.5, 0.5]));
        let pool = ProjectMemoryPool::new(store, router, 100, 3600);

        let loaded = pool.load_project("p1");
        assert_eq!(loaded.memory_count, 3);
        assert!(loaded.embeddings.contains_key("mem-a-metadata"));
        assert_eq!(loaded.metadata["mem-a-metadata"]["project_id"].as_str(), Some("p1"));
    }

    #[test]
    fn test_recent_cap_keeps_newest() {
        let store = store_with_project_memories();
        let router = Arc::new(fixed_router("", vec![0.5, 0.5]));
        let pool = ProjectMemoryPool::new(store, router, 2, 3600);

        let loaded = pool.load_project("p1");
        assert_eq!(loaded.memory_count, 2);
        assert!(loaded.embeddings.contains_key("mem-a-metadata"));
        assert!(loaded.embeddings.contains_key("mem-b-metadata"));
        assert!(!loaded.embeddings.contains_key("mem-c-metadata"));
    }

    #[test]
    fn test_unknown_project_yields_empty_pool() {
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        let router = Arc::new(fixed_router("", vec![0.5]));
        let pool = ProjectMemoryPool::new(store, router, 100, 3600);

        let loaded = pool.load_project("nope");
        assert_eq!(loaded.memory_count, 0);
        assert!(pool.get_memory_ids("nope").is_empty());
    }

    #[test]
    fn test_get_memory_ids_strips_suffix() {
        let store = store_with_project_memories();
        let router = Arc::new(fixed_router("", vec![0.5, 0.5]));
        let pool = ProjectMemoryPool::new(store, router, 100, 3600);
        pool.load_project("p1");

        let ids = pool.get_memory_ids("p1");
        assert!(ids.contains("mem-a"));
        assert!(ids.contains("mem-b"));
        assert!(ids.contains("mem-c"));
    }

    #[test]
    fn test_warm_cache_populates_reranker() {
        let store = store_with_project_memories();
        let router = Arc::new(fixed_router("0.7", vec![0.5, 0.5]));
        let pool = ProjectMemoryPool::new(store, router.clone(), 100, 3600);
        let reranker = CrossEncoderReranker::new(
            router,
            CrossEncoderConfig::default(),
        );

        let stats = pool.warm_cache(&reranker, "p1");
        assert_eq!(stats.memories_loaded, 3);
        assert_eq!(stats.cache_entries_added, 3);
        assert_eq!(reranker.metrics().semantic_cache_candidates, 3);
    }

    #[test]
    fn test_clear_pools() {
        let store = store_with_project_memories();
        let router = Arc::new(fixed_router("", vec![0.5, 0.5]));
        let pool = ProjectMemoryPool::new(store, router, 100, 3600);
        pool.load_project("p1");

        assert!(pool.clear_pool("p1"));
        assert!(!pool.clear_pool("p1"));
        pool.load_project("p1");
        assert_eq!(pool.clear_all_pools(), 1);
    }
}
