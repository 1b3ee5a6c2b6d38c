//! Hybrid Search Orchestrator
//!
//! Pipeline per query:
//! 1. Extract query attributes and merge them into the metadata filters.
//! 2. Generate the query embedding.
//! 3. Vector search and BM25 search over the same candidate budget.
//! 4. Merge by id (vector entry is the base, BM25 score overlays).
//! 5. Rescore with the rule-based formula, collecting components.
//! 6. Sort, deduplicate (priority + semantic fingerprint), trim.
//! 7. Prefer memory entries over chunk representations.
//! 8. Cross-encoder rerank the survivors.
//!
//! Every non-critical failure degrades: attribute trouble means no hints,
//! BM25 trouble means vector-only results, an embedding failure means an
//! empty result list. Search never raises.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{
    CrossEncoderReranker, QueryAttributeExtractor, QueryAttributes, ScoreComponents, SearchResult,
};
use crate::memory::{Metadata, MetadataValue, MemoryTier, MEMORY_METADATA_SUFFIX};
use crate::model::ModelRouter;
use crate::storage::{Bm25Index, ProjectStore, VectorStore};

// ============================================================================
// RESULT SHAPES
// ============================================================================

/// A memory with its chunks, as returned by `get_memory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDetails {
    pub memory_id: String,
    pub content: String,
    pub metadata: Metadata,
    pub chunks: Vec<MemoryChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryChunk {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
}

/// A recent-memory listing item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentMemory {
    pub memory_id: String,
    pub summary: String,
    pub schema_type: String,
    pub created_at: String,
    pub metadata: Metadata,
}

/// Index counters.
#[derive(Debug, Clone, Serialize)]
pub struct SearchStats {
    pub total_indexed: usize,
    pub vector_count: usize,
    pub bm25_count: usize,
}

// ============================================================================
// SERVICE
// ============================================================================

/// Hybrid search over the vector store and the BM25 index.
pub struct SearchService {
    vector: Arc<VectorStore>,
    bm25: Arc<Bm25Index>,
    router: Arc<ModelRouter>,
    projects: Option<Arc<ProjectStore>>,
    attributes: QueryAttributeExtractor,
    reranker: Option<Arc<CrossEncoderReranker>>,
    candidate_count: usize,
    result_count: usize,
    recency_half_life_hours: f64,
}

impl SearchService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vector: Arc<VectorStore>,
        bm25: Arc<Bm25Index>,
        router: Arc<ModelRouter>,
        projects: Option<Arc<ProjectStore>>,
        attributes: QueryAttributeExtractor,
        reranker: Option<Arc<CrossEncoderReranker>>,
        candidate_count: usize,
        result_count: usize,
        recency_half_life_hours: f64,
    ) -> Self {
        info!(
            candidate_count,
            result_count, recency_half_life_hours, "search service initialized"
        );
        Self {
            vector,
            bm25,
            router,
            projects,
            attributes,
            reranker,
            candidate_count,
            result_count,
            recency_half_life_hours,
        }
    }

    /// Hybrid search. Best-effort: failures yield an empty list.
    pub fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
        filters: Option<Metadata>,
    ) -> Vec<SearchResult> {
        self.search_internal(query, top_k, filters, false)
    }

    /// Warm-up mode search used by project prefetch: identical pipeline but
    /// the reranker runs with `prefetch=true` so its counters attribute the
    /// traffic correctly. Returns the number of queries exercised.
    pub fn prefetch_project(&self, project_id: &str, queries: &[String]) -> usize {
        let mut warmed = 0usize;
        for query in queries {
            if query.trim().is_empty() {
                continue;
            }
            let mut filters = Metadata::new();
            filters.insert(
                "project_id".to_string(),
                MetadataValue::Str(project_id.to_string()),
            );
            self.search_internal(query, None, Some(filters), true);
            warmed += 1;
        }
        debug!(project_id, warmed, "project prefetch complete");
        warmed
    }

    fn search_internal(
        &self,
        query: &str,
        top_k: Option<usize>,
        filters: Option<Metadata>,
        prefetch: bool,
    ) -> Vec<SearchResult> {
        let result_limit = top_k.unwrap_or(self.result_count);
        let query_attributes = self.extract_attributes(query);
        let filters = self.prepare_filters(filters, query_attributes.as_ref());

        info!(top_k = result_limit, "searching: '{}'", truncate(query, 100));
        let started = std::time::Instant::now();

        // Embedding failure degrades to an empty result list
        let query_embedding = match self.router.generate_embedding(query) {
            Ok(embedding) => embedding,
            Err(e) => {
                error!("query embedding failed: {e}");
                return vec![];
            }
        };

        let vector_results = self.vector_search(&query_embedding, filters.as_ref());
        debug!(hits = vector_results.len(), "vector search done");

        let bm25_results = self.bm25_search(query);
        debug!(hits = bm25_results.len(), "BM25 search done");

        let merged = merge_results(vector_results, bm25_results);
        debug!(candidates = merged.len(), "merged candidate sets");

        let mut scored = self.rescore(merged, query, filters.as_ref(), query_attributes.as_ref());
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let deduped = deduplicate(scored, result_limit);
        let survivors = prefer_memory_entries(deduped);

        let final_results = match &self.reranker {
            Some(reranker) => reranker.rerank(query, survivors, prefetch),
            None => survivors,
        };

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            results = final_results.len(),
            "search complete"
        );
        final_results
    }

    fn extract_attributes(&self, query: &str) -> Option<QueryAttributes> {
        if query.is_empty() {
            return None;
        }
        Some(self.attributes.extract(query))
    }

    /// Merge query attribute hints into the caller's filters. A resolvable
    /// project name becomes a `project_id` filter unless one is already set.
    fn prepare_filters(
        &self,
        filters: Option<Metadata>,
        attributes: Option<&QueryAttributes>,
    ) -> Option<Metadata> {
        let mut combined = filters.unwrap_or_default();

        if let (Some(attrs), Some(projects)) = (attributes, &self.projects) {
            if !combined.contains_key("project_id") {
                if let Some(name) = &attrs.project_name {
                    if let Some(project) = projects.get_by_name(name) {
                        debug!(project = %name, id = %project.id, "applied project filter from query attributes");
                        combined.insert(
                            "project_id".to_string(),
                            MetadataValue::Str(project.id),
                        );
                    }
                }
            }
        }

        if combined.is_empty() {
            None
        } else {
            Some(combined)
        }
    }

    fn vector_search(
        &self,
        query_embedding: &[f32],
        filters: Option<&Metadata>,
    ) -> Vec<SearchResult> {
        match self.vector.search(query_embedding, self.candidate_count, filters) {
            Ok(hits) => hits
                .into_iter()
                .map(|hit| SearchResult {
                    id: hit.id,
                    content: hit.content,
                    metadata: hit.metadata,
                    score: 0.0,
                    combined_score: 0.0,
                    vector_similarity: hit.similarity as f64,
                    bm25_score: 0.0,
                    components: ScoreComponents::default(),
                    cross_score: None,
                    priority: 0,
                })
                .collect(),
            Err(e) => {
                error!("vector search failed: {e}");
                vec![]
            }
        }
    }

    /// BM25 hits enriched with content and metadata from the vector store.
    fn bm25_search(&self, query: &str) -> Vec<SearchResult> {
        let hits = self.bm25.search(query, self.candidate_count);
        let mut enriched = Vec::with_capacity(hits.len());
        for hit in hits {
            match self.vector.get(&hit.id) {
                Ok(Some(entry)) => enriched.push(SearchResult {
                    id: hit.id,
                    content: entry.content,
                    metadata: entry.metadata,
                    score: 0.0,
                    combined_score: 0.0,
                    vector_similarity: 0.0,
                    bm25_score: hit.score,
                    components: ScoreComponents::default(),
                    cross_score: None,
                    priority: 0,
                }),
                Ok(None) => {}
                Err(e) => warn!(id = %hit.id, "BM25 enrichment failed: {e}"),
            }
        }
        enriched
    }

    // ------------------------------------------------------------------
    // Rule-based rescoring
    // ------------------------------------------------------------------

    fn rescore(
        &self,
        candidates: Vec<SearchResult>,
        query: &str,
        filters: Option<&Metadata>,
        attributes: Option<&QueryAttributes>,
    ) -> Vec<SearchResult> {
        candidates
            .into_iter()
            .map(|mut candidate| {
                let metadata = &candidate.metadata;

                let memory_strength = metadata
                    .get("strength")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.5);
                let recency = self.recency_score(metadata);
                let refs_reliability = refs_reliability(metadata);
                let normalized_bm25 = normalize_bm25(candidate.bm25_score);
                let vector_similarity = candidate.vector_similarity;
                let metadata_bonus = metadata_alignment(metadata, query, filters, attributes);

                let combined = (memory_strength * 0.3
                    + recency * 0.2
                    + refs_reliability * 0.1
                    + normalized_bm25 * 0.2
                    + vector_similarity * 0.2
                    + metadata_bonus)
                    .clamp(0.0, 1.0);

                candidate.priority = memory_priority(metadata);
                candidate.score = combined;
                candidate.combined_score = combined;
                candidate.components = ScoreComponents {
                    memory_strength,
                    recency,
                    refs_reliability,
                    bm25: normalized_bm25,
                    vector: vector_similarity,
                    metadata: metadata_bonus,
                };
                candidate
            })
            .collect()
    }

    /// Exponential decay over age, slowed for consolidated tiers.
    fn recency_score(&self, metadata: &Metadata) -> f64 {
        let Some(created_at) = metadata
            .get("created_at")
            .and_then(|v| v.as_str())
            .and_then(parse_timestamp)
        else {
            return 0.5;
        };

        let age_hours = (Utc::now() - created_at).num_seconds().max(0) as f64 / 3600.0;
        let multiplier = metadata
            .get("memory_type")
            .and_then(|v| v.as_str())
            .map(tier_multiplier)
            .unwrap_or(4.0);
        let half_life = (self.recency_half_life_hours * multiplier).max(1.0);
        (-age_hours / half_life).exp().clamp(0.0, 1.0)
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Fetch a memory's summary entry and its chunks.
    pub fn get_memory(&self, memory_id: &str) -> Option<MemoryDetails> {
        let entry_id = format!("{memory_id}{MEMORY_METADATA_SUFFIX}");
        let entry = match self.vector.get(&entry_id) {
            Ok(Some(entry)) => entry,
            Ok(None) => match self.vector.get(memory_id) {
                Ok(Some(entry)) => entry,
                _ => {
                    warn!(memory_id, "memory not found");
                    return None;
                }
            },
            Err(e) => {
                error!(memory_id, "memory lookup failed: {e}");
                return None;
            }
        };

        let mut filter = Metadata::new();
        filter.insert(
            "memory_id".to_string(),
            MetadataValue::Str(memory_id.to_string()),
        );
        let chunks = self
            .vector
            .list_by_metadata(&filter, true, false)
            .unwrap_or_default()
            .into_iter()
            .filter(|chunk| chunk.id != entry_id)
            .map(|chunk| MemoryChunk {
                id: chunk.id,
                content: chunk.content,
                metadata: chunk.metadata,
            })
            .collect();

        Some(MemoryDetails {
            memory_id: memory_id.to_string(),
            content: entry.content,
            metadata: entry.metadata,
            chunks,
        })
    }

    /// Recent memory entries, newest first.
    pub fn list_recent(&self, limit: usize, filter_metadata: Option<Metadata>) -> Vec<RecentMemory> {
        let mut filter = filter_metadata.unwrap_or_default();
        filter.insert("is_memory_entry".to_string(), MetadataValue::Bool(true));

        let mut entries = match self.vector.list_by_metadata(&filter, true, false) {
            Ok(entries) => entries,
            Err(e) => {
                error!("recent listing failed: {e}");
                return vec![];
            }
        };

        entries.sort_by(|a, b| {
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
        entries.truncate(limit);

        entries
            .into_iter()
            .map(|entry| {
                let summary = if entry.content.chars().count() > 200 {
                    let prefix: String = entry.content.chars().take(200).collect();
                    format!("{prefix}...")
                } else {
                    entry.content.clone()
                };
                RecentMemory {
                    memory_id: entry.id.clone(),
                    summary,
                    schema_type: entry
                        .metadata
                        .get("schema_type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Unknown")
                        .to_string(),
                    created_at: entry
                        .metadata
                        .get("created_at")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Unknown")
                        .to_string(),
                    metadata: entry.metadata,
                }
            })
            .collect()
    }

    /// Project-scoped search. Also records project usage.
    pub fn search_in_project(
        &self,
        project_id: &str,
        query: &str,
        top_k: Option<usize>,
        additional_filters: Option<Metadata>,
    ) -> Vec<SearchResult> {
        let mut filters = additional_filters.unwrap_or_default();
        filters.insert(
            "project_id".to_string(),
            MetadataValue::Str(project_id.to_string()),
        );

        if let Some(projects) = &self.projects {
            if let Err(e) = projects.record_usage(project_id) {
                debug!(project_id, "usage bump skipped: {e}");
            }
        }

        self.search(query, top_k, Some(filters))
    }

    /// Memories semantically close to a stored memory, excluding itself.
    pub fn get_related_memories(&self, memory_id: &str, top_k: usize) -> Vec<SearchResult> {
        let entry_id = format!("{memory_id}{MEMORY_METADATA_SUFFIX}");
        let source = match self.vector.get(&entry_id) {
            Ok(Some(entry)) => entry,
            _ => {
                warn!(memory_id, "memory not found for related lookup");
                return vec![];
            }
        };
        let Some(embedding) = source.embedding else {
            warn!(memory_id, "memory has no embedding");
            return vec![];
        };

        let mut filter = Metadata::new();
        filter.insert("is_memory_entry".to_string(), MetadataValue::Bool(true));

        let mut related = self.vector_search_raw(&embedding, top_k + 1, Some(&filter));
        related.retain(|result| result.id != entry_id);
        related.truncate(top_k);
        related
    }

    fn vector_search_raw(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&Metadata>,
    ) -> Vec<SearchResult> {
        match self.vector.search(embedding, top_k, filter) {
            Ok(hits) => hits
                .into_iter()
                .map(|hit| SearchResult {
                    id: hit.id,
                    content: hit.content,
                    metadata: hit.metadata,
                    score: hit.similarity as f64,
                    combined_score: hit.similarity as f64,
                    vector_similarity: hit.similarity as f64,
                    bm25_score: 0.0,
                    components: ScoreComponents::default(),
                    cross_score: None,
                    priority: 0,
                })
                .collect(),
            Err(e) => {
                error!("related lookup failed: {e}");
                vec![]
            }
        }
    }

    /// Index counters.
    pub fn stats(&self) -> SearchStats {
        let vector_count = self.vector.count().unwrap_or(0);
        SearchStats {
            total_indexed: vector_count,
            vector_count,
            bm25_count: self.bm25.count(),
        }
    }
}

// ============================================================================
// SCORING HELPERS
// ============================================================================

/// Sigmoid normalization of an unbounded BM25 score into [0, 1].
fn normalize_bm25(score: f64) -> f64 {
    if score <= 0.0 {
        return 0.0;
    }
    1.0 / (1.0 + (-0.1 * score).exp())
}

/// `log(1 + refs) / log(11)`, clamped to [0, 1]. Ten references saturate.
fn refs_reliability(metadata: &Metadata) -> f64 {
    let refs_count = metadata
        .get("refs_count")
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
        .max(0) as f64;
    if refs_count == 0.0 {
        return 0.0;
    }
    ((1.0 + refs_count).ln() / 11.0_f64.ln()).min(1.0)
}

fn tier_multiplier(tier: &str) -> f64 {
    match tier {
        "working" => MemoryTier::Working.half_life_multiplier(),
        "short_term" => MemoryTier::ShortTerm.half_life_multiplier(),
        "long_term" => MemoryTier::LongTerm.half_life_multiplier(),
        _ => 4.0,
    }
}

/// Heuristic bonus for metadata aligned with the query, filters, and
/// extracted attributes; mild penalties for mismatches and session noise.
fn metadata_alignment(
    metadata: &Metadata,
    query: &str,
    filters: Option<&Metadata>,
    attributes: Option<&QueryAttributes>,
) -> f64 {
    let mut bonus = 0.0;
    let query_lc = query.to_lowercase();

    let topic = metadata.get("topic").and_then(|v| v.as_str());
    if let Some(topic) = topic {
        if !topic.is_empty() && query_lc.contains(&topic.to_lowercase()) {
            bonus += 0.05;
        } else {
            bonus -= 0.01;
        }
    }

    let severity = metadata.get("severity").and_then(|v| v.as_str());
    if severity.map(|s| s.eq_ignore_ascii_case("high")).unwrap_or(false) {
        let incident_cue = ["incident", "inc", "bug", "sev", "pager"]
            .iter()
            .any(|cue| query_lc.contains(cue));
        if incident_cue {
            bonus += 0.05;
        }
    }

    if let Some(project_filter) = filters.and_then(|f| f.get("project_id")) {
        if metadata.get("project_id") == Some(project_filter) {
            bonus += 0.03;
        } else {
            bonus -= 0.05;
        }
    }

    if let Some(attrs) = attributes {
        if let Some(query_topic) = &attrs.topic {
            match topic {
                Some(topic) if topic.eq_ignore_ascii_case(query_topic) => bonus += 0.05,
                Some(_) => bonus -= 0.01,
                None => {}
            }
        }
        if let Some(query_doc_type) = &attrs.doc_type {
            let doc_type = metadata.get("type").and_then(|v| v.as_str());
            if doc_type.map(|d| d.eq_ignore_ascii_case(query_doc_type)).unwrap_or(false) {
                bonus += 0.03;
            }
        }
        if let (Some(query_severity), Some(severity)) = (&attrs.severity, severity) {
            if severity.eq_ignore_ascii_case(query_severity) {
                bonus += 0.02;
            }
        }
    }

    // Session transcripts are noisy; nudge them below curated memories
    if metadata
        .get("source")
        .and_then(|v| v.as_str())
        .map(|s| s == "session")
        .unwrap_or(false)
    {
        bonus -= 0.05;
    }

    bonus
}

/// Lower is better when collapsing duplicates: fresher tiers and
/// memory-entry representations win.
fn memory_priority(metadata: &Metadata) -> i32 {
    let tier = metadata
        .get("memory_type")
        .and_then(|v| v.as_str())
        .unwrap_or("working");
    let mut priority = match tier {
        "working" => 0,
        "short_term" => 1,
        "long_term" => 2,
        _ => 3,
    };

    let is_memory_entry = metadata
        .get("is_memory_entry")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !is_memory_entry {
        if metadata.contains_key("chunk_index") {
            priority += 1;
        } else {
            priority += 2;
        }
    }
    priority
}

// ============================================================================
// MERGE + DEDUP
// ============================================================================

/// Union the vector and BM25 candidate sets by id. Shared ids keep the
/// vector entry as base with the BM25 score overlaid.
fn merge_results(
    vector_results: Vec<SearchResult>,
    bm25_results: Vec<SearchResult>,
) -> Vec<SearchResult> {
    let mut merged: Vec<SearchResult> = Vec::with_capacity(vector_results.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for result in vector_results {
        positions.insert(result.id.clone(), merged.len());
        merged.push(result);
    }
    for result in bm25_results {
        match positions.get(&result.id) {
            Some(&pos) => merged[pos].bm25_score = result.bm25_score,
            None => {
                positions.insert(result.id.clone(), merged.len());
                merged.push(result);
            }
        }
    }
    merged
}

type SemanticKey = (Option<String>, Option<String>, Option<String>, Option<String>);

fn semantic_key(metadata: &Metadata) -> Option<SemanticKey> {
    let get = |key: &str| {
        metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };
    let key = (
        get("project_id"),
        get("topic"),
        get("source"),
        get("created_at"),
    );
    if key.0.is_some() || key.1.is_some() || key.2.is_some() || key.3.is_some() {
        Some(key)
    } else {
        None
    }
}

fn is_better_candidate(new: &SearchResult, existing: &SearchResult) -> bool {
    if new.priority != existing.priority {
        return new.priority < existing.priority;
    }
    new.score > existing.score
}

/// Skip (and possibly replace in place) when a slot for the key exists.
fn should_skip<K: std::hash::Hash + Eq>(
    candidate: &SearchResult,
    index_map: &HashMap<K, usize>,
    key: &Option<K>,
    selected: &mut [SearchResult],
) -> bool {
    let Some(key) = key else {
        return false;
    };
    let Some(&existing_idx) = index_map.get(key) else {
        return false;
    };
    if existing_idx >= selected.len() {
        return false;
    }
    if is_better_candidate(candidate, &selected[existing_idx]) {
        selected[existing_idx] = candidate.clone();
    }
    true
}

/// Collapse duplicate memories: by `memory_id`, then by the semantic
/// fingerprint `(project_id, topic, source, created_at)`.
fn deduplicate(scored: Vec<SearchResult>, top_k: usize) -> Vec<SearchResult> {
    let mut selected: Vec<SearchResult> = Vec::new();
    let mut memory_index: HashMap<String, usize> = HashMap::new();
    let mut semantic_index: HashMap<SemanticKey, usize> = HashMap::new();

    for candidate in scored {
        let memory_key = candidate
            .metadata
            .get("memory_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let fingerprint = semantic_key(&candidate.metadata);

        if should_skip(&candidate, &memory_index, &memory_key, &mut selected) {
            continue;
        }
        if should_skip(&candidate, &semantic_index, &fingerprint, &mut selected) {
            continue;
        }

        let idx = selected.len();
        if let Some(key) = memory_key {
            memory_index.insert(key, idx);
        }
        if let Some(key) = fingerprint {
            semantic_index.insert(key, idx);
        }
        selected.push(candidate);
    }

    // Guard against id-level duplicates surviving the replacement passes
    let mut unique: Vec<SearchResult> = Vec::with_capacity(selected.len());
    let mut seen_ids: Vec<String> = Vec::new();
    for result in selected {
        if seen_ids.contains(&result.id) {
            continue;
        }
        seen_ids.push(result.id.clone());
        unique.push(result);
    }

    unique.truncate(top_k);
    unique
}

/// Prefer memory-entry candidates when any are present; otherwise keep the
/// chunk representations.
fn prefer_memory_entries(results: Vec<SearchResult>) -> Vec<SearchResult> {
    let filtered: Vec<SearchResult> = results
        .iter()
        .filter(|r| {
            r.metadata
                .get("is_memory_entry")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if filtered.is_empty() {
        results
    } else {
        filtered
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
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

    fn service(router_reply: &str, embedding: Vec<f32>) -> (SearchService, Arc<VectorStore>, Arc<Bm25Index>) {
        let vector = Arc::new(VectorStore::open_in_memory().unwrap());
        let bm25 = Arc::new(Bm25Index::in_memory());
        let router = Arc::new(fixed_router(router_reply, embedding));
        let service = SearchService::new(
            vector.clone(),
            bm25.clone(),
            router,
            None,
            QueryAttributeExtractor::new(None, 0.4, false),
            None,
            50,
            10,
            24.0,
        );
        (service, vector, bm25)
    }

    fn entry_metadata(memory_id: &str, extra: &[(&str, MetadataValue)]) -> Metadata {
        // Distinct timestamps keep semantic fingerprints apart between entries
        static SEQ: std::sync::atomic::AtomicI64 = std::sync::atomic::AtomicI64::new(0);
        let offset = SEQ.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let mut metadata = Metadata::new();
        metadata.insert("memory_id".to_string(), MetadataValue::Str(memory_id.to_string()));
        metadata.insert("is_memory_entry".to_string(), MetadataValue::Bool(true));
        metadata.insert(
            "created_at".to_string(),
            MetadataValue::Str((Utc::now() - chrono::Duration::seconds(offset)).to_rfc3339()),
        );
        for (key, value) in extra {
            metadata.insert(key.to_string(), value.clone());
        }
        metadata
    }

    #[test]
    fn test_empty_index_returns_empty_without_error() {
        let (service, _, _) = service("", vec![1.0, 0.0]);
        assert!(service.search("anything at all", None, None).is_empty());
    }

    #[test]
    fn test_vector_similarity_dominates_with_equal_components() {
        let (service, vector, _) = service("", vec![1.0, 0.0]);

        vector
            .add("mem-hi-metadata", &[1.0, 0.0], &entry_metadata("mem-hi", &[]), "close match text")
            .unwrap();
        vector
            .add("mem-lo-metadata", &[0.5, (1.0_f32 - 0.25).sqrt()], &entry_metadata("mem-lo", &[]), "distant match text")
            .unwrap();

        let results = service.search("find the close match", None, None);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].metadata["memory_id"].as_str(), Some("mem-hi"));

        // Component weights reproduce the final score
        for result in &results {
            let c = &result.components;
            let reconstructed = (c.memory_strength * 0.3
                + c.recency * 0.2
                + c.refs_reliability * 0.1
                + c.bm25 * 0.2
                + c.vector * 0.2
                + c.metadata)
                .clamp(0.0, 1.0);
            assert!((reconstructed - result.score).abs() < 1e-6);
        }
    }

    #[test]
    fn test_dedup_one_result_per_memory() {
        let (service, vector, bm25) = service("", vec![1.0, 0.0]);

        // Memory entry and chunk for the same memory: only one survives
        vector
            .add("mem-1-metadata", &[1.0, 0.0], &entry_metadata("mem-1", &[]), "summary of typeerror fix")
            .unwrap();
        let mut chunk_meta = Metadata::new();
        chunk_meta.insert("memory_id".to_string(), MetadataValue::Str("mem-1".to_string()));
        chunk_meta.insert("chunk_index".to_string(), MetadataValue::Int(0));
        chunk_meta.insert(
            "created_at".to_string(),
            MetadataValue::Str("2026-01-01T00:00:00+00:00".to_string()),
        );
        vector
            .add("mem-1-chunk-0", &[0.99, 0.05], &chunk_meta, "typeerror fix body text")
            .unwrap();
        bm25.add_document("mem-1-chunk-0", "typeerror fix body text").unwrap();

        let results = service.search("typeerror fix details please", None, None);
        let mem1_count = results
            .iter()
            .filter(|r| r.metadata.get("memory_id").and_then(|v| v.as_str()) == Some("mem-1"))
            .count();
        assert_eq!(mem1_count, 1);
        // The memory-entry representation is preferred
        assert_eq!(results[0].id, "mem-1-metadata");
    }

    #[test]
    fn test_session_source_penalty() {
        let metadata_session = {
            let mut m = entry_metadata("mem-s", &[]);
            m.insert("source".to_string(), MetadataValue::Str("session".to_string()));
            m
        };
        let metadata_cli = {
            let mut m = entry_metadata("mem-c", &[]);
            m.insert("source".to_string(), MetadataValue::Str("cli".to_string()));
            m
        };

        let penalty = metadata_alignment(&metadata_session, "query", None, None);
        let neutral = metadata_alignment(&metadata_cli, "query", None, None);
        assert!((neutral - penalty - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_project_filter_bonus_and_penalty() {
        let mut filters = Metadata::new();
        filters.insert("project_id".to_string(), MetadataValue::Str("p1".to_string()));

        let matching = entry_metadata("m", &[("project_id", "p1".into())]);
        let mismatched = entry_metadata("m", &[("project_id", "p2".into())]);

        let bonus = metadata_alignment(&matching, "q", Some(&filters), None);
        let penalty = metadata_alignment(&mismatched, "q", Some(&filters), None);
        assert!((bonus - 0.03).abs() < 1e-9);
        assert!((penalty + 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_memory_priority_ordering() {
        let memory_entry = entry_metadata("m", &[("memory_type", "working".into())]);
        assert_eq!(memory_priority(&memory_entry), 0);

        let mut chunk = Metadata::new();
        chunk.insert("memory_type".to_string(), MetadataValue::Str("working".to_string()));
        chunk.insert("chunk_index".to_string(), MetadataValue::Int(0));
        assert_eq!(memory_priority(&chunk), 1);

        let mut bare = Metadata::new();
        bare.insert("memory_type".to_string(), MetadataValue::Str("long_term".to_string()));
        assert_eq!(memory_priority(&bare), 4);
    }

    #[test]
    fn test_normalize_bm25() {
        assert_eq!(normalize_bm25(0.0), 0.0);
        assert_eq!(normalize_bm25(-3.0), 0.0);
        assert!(normalize_bm25(5.0) > 0.5);
        assert!(normalize_bm25(100.0) < 1.0);
        assert!(normalize_bm25(10.0) > normalize_bm25(5.0));
    }

    #[test]
    fn test_refs_reliability_saturates_at_ten() {
        let mut metadata = Metadata::new();
        assert_eq!(refs_reliability(&metadata), 0.0);

        metadata.insert("refs_count".to_string(), MetadataValue::Int(10));
        assert!((refs_reliability(&metadata) - 1.0).abs() < 1e-9);

        metadata.insert("refs_count".to_string(), MetadataValue::Int(100));
        assert_eq!(refs_reliability(&metadata), 1.0);
    }

    #[test]
    fn test_merge_overlays_bm25_score() {
        let base = SearchResult {
            id: "x".to_string(),
            content: "c".to_string(),
            metadata: Metadata::new(),
            score: 0.0,
            combined_score: 0.0,
            vector_similarity: 0.8,
            bm25_score: 0.0,
            components: ScoreComponents::default(),
            cross_score: None,
            priority: 0,
        };
        let mut lexical = base.clone();
        lexical.vector_similarity = 0.0;
        lexical.bm25_score = 7.0;

        let merged = merge_results(vec![base], vec![lexical]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].vector_similarity, 0.8);
        assert_eq!(merged[0].bm25_score, 7.0);
    }

    #[test]
    fn test_reranked_search_attaches_cross_scores() {
        let vector = Arc::new(VectorStore::open_in_memory().unwrap());
        let bm25 = Arc::new(Bm25Index::in_memory());
        let router = Arc::new(fixed_router("0.7", vec![1.0, 0.0]));
        let reranker = Arc::new(CrossEncoderReranker::new(
            router.clone(),
            CrossEncoderConfig {
                skip_rerank_for_simple_queries: false,
                ..Default::default()
            },
        ));
        let service = SearchService::new(
            vector.clone(),
            bm25,
            router,
            None,
            QueryAttributeExtractor::new(None, 0.4, false),
            Some(reranker),
            50,
            10,
            24.0,
        );

        vector
            .add("mem-1-metadata", &[1.0, 0.0], &entry_metadata("mem-1", &[]), "summary")
            .unwrap();
        let results = service.search("an elaborate multi word query", None, None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].cross_score, Some(0.7));
    }

    #[test]
    fn test_list_recent_orders_newest_first() {
        let (service, vector, _) = service("", vec![1.0, 0.0]);
        for (id, created) in [
            ("mem-old-metadata", "2026-01-01T00:00:00+00:00"),
            ("mem-new-metadata", "2026-02-01T00:00:00+00:00"),
        ] {
            let mut metadata = Metadata::new();
            metadata.insert("memory_id".to_string(), MetadataValue::Str(id.trim_end_matches("-metadata").to_string()));
            metadata.insert("is_memory_entry".to_string(), MetadataValue::Bool(true));
            metadata.insert("created_at".to_string(), MetadataValue::Str(created.to_string()));
            metadata.insert("schema_type".to_string(), MetadataValue::Str("Process".to_string()));
            vector.add(id, &[1.0, 0.0], &metadata, "summary").unwrap();
        }

        let recent = service.list_recent(10, None);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].memory_id, "mem-new-metadata");
        assert_eq!(recent[0].schema_type, "Process");
    }

    #[test]
    fn test_get_memory_returns_chunks() {
        let (service, vector, _) = service("", vec![1.0, 0.0]);
        vector
            .add("mem-1-metadata", &[1.0, 0.0], &entry_metadata("mem-1", &[]), "the summary")
            .unwrap();
        let mut chunk_meta = Metadata::new();
        chunk_meta.insert("memory_id".to_string(), MetadataValue::Str("mem-1".to_string()));
        vector.add("mem-1-chunk-0", &[1.0, 0.0], &chunk_meta, "chunk body").unwrap();

        let details = service.get_memory("mem-1").unwrap();
        assert_eq!(details.content, "the summary");
        assert_eq!(details.chunks.len(), 1);
        assert_eq!(details.chunks[0].id, "mem-1-chunk-0");

        assert!(service.get_memory("mem-missing").is_none());
    }

    #[test]
    fn test_related_memories_excludes_self() {
        let (service, vector, _) = service("", vec![1.0, 0.0]);
        vector
            .add("mem-1-metadata", &[1.0, 0.0], &entry_metadata("mem-1", &[]), "first")
            .unwrap();
        vector
            .add("mem-2-metadata", &[0.9, 0.1], &entry_metadata("mem-2", &[]), "second")
            .unwrap();

        let related = service.get_related_memories("mem-1", 5);
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].id, "mem-2-metadata");
    }
}
