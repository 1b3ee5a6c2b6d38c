//! Consolidation Engine
//!
//! Maintains the index over time:
//! 1. Migrate working memories past their retention window to short-term.
//! 2. Cluster memory entries by embedding similarity (greedy single pass).
//! 3. Pick one representative per cluster; flag the rest compressed.
//! 4. Forget old, low-importance memories along with their chunks.
//!
//! Every step isolates its failures; partial progress is preserved and the
//! operation itself never raises. It is not transactional - consumers must
//! tolerate in-between snapshots.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::ConsolidationConfig;
use crate::memory::{Metadata, MetadataValue, MemoryTier, MEMORY_METADATA_SUFFIX};
use crate::model::cosine_similarity;
use crate::processing::Indexer;
use crate::storage::VectorStore;

// ============================================================================
// TYPES
// ============================================================================

/// Outcome of a consolidation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationStats {
    pub migrated_count: usize,
    pub clusters_created: usize,
    pub memories_compressed: usize,
    pub memories_deleted: usize,
    pub duration_seconds: f64,
}

/// Consolidation and forgetting over the memory index.
pub struct ConsolidationService {
    vector: Arc<VectorStore>,
    indexer: Arc<Indexer>,
    config: ConsolidationConfig,
    working_retention_hours: i64,
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

impl ConsolidationService {
    pub fn new(
        vector: Arc<VectorStore>,
        indexer: Arc<Indexer>,
        config: ConsolidationConfig,
        working_retention_hours: i64,
    ) -> Self {
        info!(
            similarity = config.similarity_threshold,
            min_cluster = config.min_cluster_size,
            age_days = config.age_threshold_days,
            importance = config.importance_threshold,
            retention_hours = working_retention_hours,
            "consolidation service initialized"
        );
        Self {
            vector,
            indexer,
            config,
            working_retention_hours,
        }
    }

    /// Run the full consolidation pass. Never raises; failed steps leave
    /// their counters at the progress reached.
    pub fn consolidate(&self) -> ConsolidationStats {
        info!("starting memory consolidation");
        let started = Instant::now();
        let mut stats = ConsolidationStats::default();

        stats.migrated_count = self.migrate_working_memory();
        info!(migrated = stats.migrated_count, "working -> short-term migration done");

        let clusters = self.cluster_similar_memories();
        stats.clusters_created = clusters.len();
        info!(clusters = clusters.len(), "clustering done");

        stats.memories_compressed = self.process_clusters(&clusters);
        info!(compressed = stats.memories_compressed, "cluster processing done");

        stats.memories_deleted = self.forget_old_memories();
        info!(deleted = stats.memories_deleted, "forgetting done");

        stats.duration_seconds = started.elapsed().as_secs_f64();
        info!(
            duration_s = stats.duration_seconds,
            "consolidation complete"
        );
        stats
    }

    // ------------------------------------------------------------------
    // Step 1: migration
    // ------------------------------------------------------------------

    /// Promote working memories older than the retention window.
    fn migrate_working_memory(&self) -> usize {
        let mut filter = Metadata::new();
        filter.insert("is_memory_entry".to_string(), MetadataValue::Bool(true));
        filter.insert(
            "memory_type".to_string(),
            MetadataValue::Str(MemoryTier::Working.as_str().to_string()),
        );

        let entries = match self.vector.list_by_metadata(&filter, false, false) {
            Ok(entries) => entries,
            Err(e) => {
                error!("working memory listing failed: {e}");
                return 0;
            }
        };

        let cutoff = Utc::now() - Duration::hours(self.working_retention_hours);
        let mut migrated = 0usize;

        for entry in entries {
            let Some(memory_id) = entry
                .metadata
                .get("memory_id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
            else {
                continue;
            };

            let timestamp = entry
                .metadata
                .get("updated_at")
                .or_else(|| entry.metadata.get("created_at"))
                .and_then(|v| v.as_str())
                .and_then(parse_timestamp);
            let Some(timestamp) = timestamp else {
                continue;
            };
            if timestamp > cutoff {
                continue;
            }

            let now_iso = Utc::now().to_rfc3339();
            let mut patch = Metadata::new();
            patch.insert(
                "memory_type".to_string(),
                MetadataValue::Str(MemoryTier::ShortTerm.as_str().to_string()),
            );
            patch.insert("updated_at".to_string(), MetadataValue::Str(now_iso.clone()));
            patch.insert("migrated_at".to_string(), MetadataValue::Str(now_iso));

            match self.vector.update_metadata(&entry.id, &patch) {
                Ok(()) => {
                    debug!(%memory_id, "migrated to short-term");
                    migrated += 1;
                }
                Err(e) => error!(%memory_id, "migration update failed: {e}"),
            }
        }

        migrated
    }

    // ------------------------------------------------------------------
    // Step 2: clustering
    // ------------------------------------------------------------------

    /// Greedy single-pass clustering over memory-entry embeddings.
    fn cluster_similar_memories(&self) -> Vec<Vec<String>> {
        let mut filter = Metadata::new();
        filter.insert("is_memory_entry".to_string(), MetadataValue::Bool(true));

        let entries = match self.vector.list_by_metadata(&filter, false, true) {
            Ok(entries) => entries,
            Err(e) => {
                error!("memory entry listing failed: {e}");
                return vec![];
            }
        };

        let memory_embeddings: Vec<(String, Vec<f32>)> = entries
            .into_iter()
            .filter_map(|entry| {
                let memory_id = entry
                    .metadata
                    .get("memory_id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())?;
                let embedding = entry.embedding?;
                Some((memory_id, embedding))
            })
            .collect();

        let mut visited: Vec<bool> = vec![false; memory_embeddings.len()];
        let mut clusters: Vec<Vec<String>> = Vec::new();

        for i in 0..memory_embeddings.len() {
            if visited[i] {
                continue;
            }
            visited[i] = true;
            let mut cluster = vec![memory_embeddings[i].0.clone()];

            for j in (i + 1)..memory_embeddings.len() {
                if visited[j] {
                    continue;
                }
                let similarity =
                    cosine_similarity(&memory_embeddings[i].1, &memory_embeddings[j].1) as f64;
                if similarity >= self.config.similarity_threshold {
                    visited[j] = true;
                    cluster.push(memory_embeddings[j].0.clone());
                }
            }
            clusters.push(cluster);
        }

        clusters
    }

    // ------------------------------------------------------------------
    // Step 3: representatives + compression flags
    // ------------------------------------------------------------------

    /// Flag a representative per qualifying cluster and mark the rest
    /// compressed. Content reduction itself is deferred.
    fn process_clusters(&self, clusters: &[Vec<String>]) -> usize {
        let mut compressed = 0usize;

        for cluster in clusters {
            if cluster.len() < self.config.min_cluster_size {
                continue;
            }

            let representative = self.select_representative(cluster);
            debug!(%representative, size = cluster.len(), "processing cluster");

            self.mark_representative(&representative, cluster.len());

            for memory_id in cluster {
                if *memory_id != representative {
                    if self.compress_memory(memory_id) {
                        compressed += 1;
                    }
                }
            }
        }

        compressed
    }

    /// Representative score: content length dominates, recency and
    /// importance break ties.
    fn select_representative(&self, cluster: &[String]) -> String {
        let now = Utc::now();
        let mut best_id = cluster[0].clone();
        let mut best_score = f64::MIN;

        for memory_id in cluster {
            let entry_id = format!("{memory_id}{MEMORY_METADATA_SUFFIX}");
            let Ok(Some(entry)) = self.vector.get(&entry_id) else {
                continue;
            };

            let recency = entry
                .metadata
                .get("created_at")
                .and_then(|v| v.as_str())
                .and_then(parse_timestamp)
                .map(|created| {
                    let age_days = (now - created).num_days().max(0) as f64;
                    1.0 / (1.0 + age_days)
                })
                .unwrap_or(0.5);
            let importance = entry
                .metadata
                .get("importance")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5);

            let score = entry.content.chars().count() as f64 * 0.5
                + recency * 1000.0 * 0.3
                + importance * 1000.0 * 0.2;

            if score > best_score {
                best_score = score;
                best_id = memory_id.clone();
            }
        }

        best_id
    }

    fn mark_representative(&self, memory_id: &str, cluster_size: usize) {
        let mut patch = Metadata::new();
        patch.insert(
            "cluster_id".to_string(),
            MetadataValue::Str(format!("cluster-{memory_id}")),
        );
        patch.insert("is_representative".to_string(), MetadataValue::Bool(true));
        patch.insert(
            "cluster_size".to_string(),
            MetadataValue::Int(cluster_size as i64),
        );

        let entry_id = format!("{memory_id}{MEMORY_METADATA_SUFFIX}");
        if let Err(e) = self.vector.update_metadata(&entry_id, &patch) {
            error!(memory_id, "marking representative failed: {e}");
        }
    }

    fn compress_memory(&self, memory_id: &str) -> bool {
        let mut patch = Metadata::new();
        patch.insert("is_compressed".to_string(), MetadataValue::Bool(true));
        patch.insert(
            "compressed_at".to_string(),
            MetadataValue::Str(Utc::now().to_rfc3339()),
        );

        let entry_id = format!("{memory_id}{MEMORY_METADATA_SUFFIX}");
        match self.vector.update_metadata(&entry_id, &patch) {
            Ok(()) => true,
            Err(e) => {
                error!(memory_id, "compression flag failed: {e}");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Step 4: forgetting
    // ------------------------------------------------------------------

    /// Delete memories that are both old and unimportant, chunks included.
    fn forget_old_memories(&self) -> usize {
        let mut filter = Metadata::new();
        filter.insert("is_memory_entry".to_string(), MetadataValue::Bool(true));

        let entries = match self.vector.list_by_metadata(&filter, false, false) {
            Ok(entries) => entries,
            Err(e) => {
                error!("memory entry listing failed: {e}");
                return 0;
            }
        };

        let cutoff = Utc::now() - Duration::days(self.config.age_threshold_days);
        let mut deleted = 0usize;

        for entry in entries {
            let Some(memory_id) = entry
                .metadata
                .get("memory_id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
            else {
                continue;
            };

            let importance = entry
                .metadata
                .get("importance")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5);
            if importance >= self.config.importance_threshold {
                continue;
            }

            let created = entry
                .metadata
                .get("created_at")
                .and_then(|v| v.as_str())
                .and_then(parse_timestamp);
            let Some(created) = created else {
                continue;
            };
            if created > cutoff {
                continue;
            }

            if self.delete_memory(&memory_id) {
                deleted += 1;
            }
        }

        deleted
    }

    fn delete_memory(&self, memory_id: &str) -> bool {
        let entry_id = format!("{memory_id}{MEMORY_METADATA_SUFFIX}");
        if let Err(e) = self.vector.delete(&entry_id) {
            error!(memory_id, "memory entry delete failed: {e}");
            return false;
        }
        self.indexer.delete_by_memory_id(memory_id);
        debug!(memory_id, "forgot memory");
        true
    }

    // ------------------------------------------------------------------
    // Auxiliary operations
    // ------------------------------------------------------------------

    /// Importance from access frequency, recency, and reference count,
    /// clamped to [0, 1].
    pub fn calculate_importance_score(
        &self,
        memory_id: &str,
        access_count: u64,
        refs_count: u64,
    ) -> f64 {
        let entry_id = format!("{memory_id}{MEMORY_METADATA_SUFFIX}");
        let entry = match self.vector.get(&entry_id) {
            Ok(Some(entry)) => entry,
            _ => return 0.5,
        };

        let access_score = (1.0 + access_count as f64).ln() / 101.0_f64.ln();
        let recency_score = entry
            .metadata
            .get("created_at")
            .and_then(|v| v.as_str())
            .and_then(parse_timestamp)
            .map(|created| {
                let age_days = (Utc::now() - created).num_days().max(0) as f64;
                (-age_days / 30.0).exp()
            })
            .unwrap_or(0.5);
        let refs_score = (1.0 + refs_count as f64).ln() / 11.0_f64.ln();

        (access_score * 0.4 + recency_score * 0.3 + refs_score * 0.3).clamp(0.0, 1.0)
    }

    /// Boost a memory's strength on access; strength never exceeds 1.0.
    pub fn update_memory_strength(&self, memory_id: &str, access_boost: f64) -> bool {
        let entry_id = format!("{memory_id}{MEMORY_METADATA_SUFFIX}");
        let entry = match self.vector.get(&entry_id) {
            Ok(Some(entry)) => entry,
            _ => {
                warn!(memory_id, "memory not found for strength update");
                return false;
            }
        };

        let current = entry
            .metadata
            .get("strength")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5);
        let new_strength = (current + access_boost).min(1.0);

        let mut patch = Metadata::new();
        patch.insert("strength".to_string(), MetadataValue::Float(new_strength));
        patch.insert(
            "last_accessed".to_string(),
            MetadataValue::Str(Utc::now().to_rfc3339()),
        );

        match self.vector.update_metadata(&entry_id, &patch) {
            Ok(()) => {
                debug!(memory_id, current, new_strength, "strength updated");
                true
            }
            Err(e) => {
                error!(memory_id, "strength update failed: {e}");
                false
            }
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// TESTS
// ============================================================================
