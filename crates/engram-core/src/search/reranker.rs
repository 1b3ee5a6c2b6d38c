//! Cross-Encoder Reranker
//!
//! LLM-scored reranker assigning each candidate a `cross_score` in [0, 1].
//! Only the first `max_candidates` are rescored; the rest keep their
//! original order appended at the end.
//!
//! Scoring consults a three-tier cache before touching the model:
//! - **L1** exact: `query :: project_scope? :: candidate_id`
//! - **L2** keyword signature: reworded queries with the same top keywords
//!   share a slot
//! - **L3** semantic: per-candidate memory embeddings compared against the
//!   query embedding through an adaptive confidence ladder
//!   (0.80 / 0.70 / 0.60)
//!
//! The L3 tier is what project pool warming populates: memory embeddings go
//! in with a sentinel score, and later queries hit on similarity alone.
//!
//! With `max_parallel > 1` candidates are scored by a fixed worker pool.
//! Each task measures its queue wait at pick-up; when the wait exceeds
//! `fallback_max_wait_ms` the LLM result is discarded in favor of a
//! heuristic blend of the candidate's rule-based components.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use lru::LruCache;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::keywords;
use super::SearchResult;
use crate::config::CrossEncoderConfig;
use crate::model::{cosine_similarity, GenerateOptions, ModelRouter, TaskKind};

/// Most recent embeddings kept per candidate in the L3 tier.
const SEMANTIC_ENTRIES_PER_CANDIDATE: usize = 10;

/// Candidate text is truncated to this many bytes in the scoring prompt.
const PROMPT_CANDIDATE_LIMIT: usize = 2000;

// ============================================================================
// CACHE ENTRY TYPES
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct CachedScore {
    score: f64,
    cached_at: Instant,
}

#[derive(Debug, Clone)]
struct SemanticEntry {
    embedding: Vec<f32>,
    score: f64,
    cached_at: Instant,
}

#[derive(Debug, Default)]
struct Stats {
    pairs_scored: u64,
    cache_hits: u64,
    cache_misses: u64,
    keyword_cache_hits: u64,
    keyword_cache_misses: u64,
    semantic_cache_hits: u64,
    semantic_cache_misses: u64,
    prefetch_requests: u64,
    prefetch_cache_hits: u64,
    prefetch_cache_misses: u64,
    llm_calls: u64,
    llm_failures: u64,
    llm_latency_ms_total: f64,
    llm_latency_ms_max: f64,
    queue_wait_total_ms: f64,
    queue_wait_max_ms: f64,
    queue_rejections: u64,
}

/// Observable reranker metrics.
#[derive(Debug, Clone, Serialize)]
pub struct RerankerMetrics {
    pub enabled: bool,
    pub pairs_scored: u64,
    pub cache_entries: usize,
    pub keyword_cache_entries: usize,
    pub semantic_cache_candidates: usize,
    pub semantic_cache_embeddings: usize,
    pub cache_size: usize,
    pub cache_ttl_seconds: u64,
    pub semantic_similarity_threshold: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub keyword_cache_hits: u64,
    pub keyword_cache_misses: u64,
    pub keyword_cache_hit_rate: f64,
    pub semantic_cache_hits: u64,
    pub semantic_cache_misses: u64,
    pub semantic_cache_hit_rate: f64,
    pub total_cache_hit_rate: f64,
    pub prefetch_requests: u64,
    pub prefetch_cache_hits: u64,
    pub prefetch_cache_misses: u64,
    pub llm_calls: u64,
    pub llm_failures: u64,
    pub avg_llm_latency_ms: f64,
    pub max_llm_latency_ms: f64,
    pub queue_wait_avg_ms: f64,
    pub queue_wait_max_ms: f64,
    pub queue_rejections: u64,
    pub max_parallel_reranks: usize,
}

// ============================================================================
// RERANKER
// ============================================================================

/// LLM-backed reranker with a three-tier cache.
pub struct CrossEncoderReranker {
    router: Arc<ModelRouter>,
    config: CrossEncoderConfig,
    exact_cache: Mutex<LruCache<String, CachedScore>>,
    keyword_cache: Mutex<LruCache<String, CachedScore>>,
    semantic_cache: Mutex<HashMap<String, Vec<SemanticEntry>>>,
    stats: Mutex<Stats>,
}

impl CrossEncoderReranker {
    pub fn new(router: Arc<ModelRouter>, config: CrossEncoderConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_max_entries.max(1))
            .expect("capacity is at least one");
        Self {
            router,
            config,
            exact_cache: Mutex::new(LruCache::new(capacity)),
            keyword_cache: Mutex::new(LruCache::new(capacity)),
            semantic_cache: Mutex::new(HashMap::new()),
            stats: Mutex::new(Stats::default()),
        }
    }

    fn cache_enabled(&self) -> bool {
        self.config.cache_max_entries > 0 && self.config.cache_ttl_seconds > 0
    }

    fn is_expired(&self, cached_at: Instant) -> bool {
        cached_at.elapsed().as_secs() > self.config.cache_ttl_seconds
    }

    /// Queries with few words skip the cross-encoder entirely; hybrid search
    /// alone is usually enough for them.
    fn is_simple_query(&self, query: &str) -> bool {
        query.split_whitespace().count() <= self.config.simple_query_max_words
    }

    /// Rerank candidates by LLM relevance. Returns the rescored head sorted
    /// by `cross_score` descending, with the untouched tail appended.
    pub fn rerank(
        &self,
        query: &str,
        candidates: Vec<SearchResult>,
        prefetch: bool,
    ) -> Vec<SearchResult> {
        if !self.config.enabled || candidates.is_empty() || query.is_empty() {
            return candidates;
        }

        if self.config.skip_rerank_for_simple_queries && self.is_simple_query(query) {
            debug!(
                max_words = self.config.simple_query_max_words,
                "simple query, skipping cross-encoder"
            );
            return candidates;
        }

        let split = self.config.max_candidates.min(candidates.len());
        let mut head = candidates;
        let tail = head.split_off(split);

        // One query embedding per rerank call feeds every L3 lookup
        let query_embedding: Option<Vec<f32>> = if self.cache_enabled() {
            match self.router.generate_embedding(query) {
                Ok(embedding) => Some(embedding),
                Err(e) => {
                    warn!("query embedding for semantic cache failed: {e}");
                    None
                }
            }
        } else {
            None
        };

        if prefetch {
            self.stats.lock().expect("stats lock").prefetch_requests += 1;
        }

        let mut rescored: Vec<SearchResult> = if self.config.max_parallel <= 1 {
            head.into_iter()
                .map(|mut candidate| {
                    let score =
                        self.score_with_cache(query, &candidate, query_embedding.as_deref(), prefetch);
                    candidate.cross_score = Some(score);
                    candidate
                })
                .collect()
        } else {
            self.rerank_parallel(query, head, query_embedding.as_deref(), prefetch)
        };

        rescored.sort_by(|a, b| {
            b.cross_score
                .unwrap_or(0.0)
                .partial_cmp(&a.cross_score.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        rescored.extend(tail);
        rescored
    }

    /// Fixed worker pool over the head slice. Queue wait is measured by the
    /// worker at pick-up, not by the submitter.
    fn rerank_parallel(
        &self,
        query: &str,
        head: Vec<SearchResult>,
        query_embedding: Option<&[f32]>,
        prefetch: bool,
    ) -> Vec<SearchResult> {
        let jobs: Mutex<VecDeque<(usize, Instant)>> = Mutex::new(
            (0..head.len()).map(|idx| (idx, Instant::now())).collect(),
        );
        let outcomes: Mutex<Vec<(usize, f64, f64)>> = Mutex::new(Vec::with_capacity(head.len()));
        let workers = self.config.max_parallel.min(head.len()).max(1);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let job = jobs.lock().expect("job queue lock").pop_front();
                    let Some((idx, enqueued_at)) = job else {
                        break;
                    };
                    let wait_ms = enqueued_at.elapsed().as_secs_f64() * 1000.0;
                    let score =
                        self.score_with_cache(query, &head[idx], query_embedding, prefetch);
                    outcomes
                        .lock()
                        .expect("outcome lock")
                        .push((idx, score, wait_ms));
                });
            }
        });

        let mut scores: Vec<(f64, f64)> = vec![(0.0, 0.0); head.len()];
        for (idx, score, wait_ms) in outcomes.into_inner().expect("outcome lock") {
            scores[idx] = (score, wait_ms);
        }

        let fallback_active =
            self.config.fallback_max_wait_ms > 0 && self.config.fallback_mode != "none";

        head.into_iter()
            .enumerate()
            .map(|(idx, mut candidate)| {
                let (score, wait_ms) = scores[idx];
                {
                    let mut stats = self.stats.lock().expect("stats lock");
                    stats.queue_wait_total_ms += wait_ms;
                    if wait_ms > stats.queue_wait_max_ms {
                        stats.queue_wait_max_ms = wait_ms;
                    }
                }

                if fallback_active && wait_ms > self.config.fallback_max_wait_ms as f64 {
                    self.stats.lock().expect("stats lock").queue_rejections += 1;
                    candidate.cross_score = Some(self.fallback_score(&candidate));
                } else {
                    candidate.cross_score = Some(score);
                }
                candidate
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Per-pair scoring: L1 -> L2 -> L3 -> LLM
    // ------------------------------------------------------------------

    fn score_with_cache(
        &self,
        query: &str,
        candidate: &SearchResult,
        query_embedding: Option<&[f32]>,
        prefetch: bool,
    ) -> f64 {
        let candidate_id = candidate.candidate_id();
        let exact_key = self.build_exact_key(query, candidate);
        let keyword_key = self.build_keyword_key(query, candidate);
        let cache_enabled = self.cache_enabled() && exact_key.is_some();

        // L1: exact match
        if cache_enabled {
            let key = exact_key.as_ref().expect("exact key present");
            let mut cache = self.exact_cache.lock().expect("exact cache lock");
            match cache.get(key).copied() {
                Some(cached) if !self.is_expired(cached.cached_at) => {
                    drop(cache);
                    let mut stats = self.stats.lock().expect("stats lock");
                    stats.pairs_scored += 1;
                    stats.cache_hits += 1;
                    if prefetch {
                        stats.prefetch_cache_hits += 1;
                    }
                    return cached.score;
                }
                Some(_) => {
                    cache.pop(key);
                }
                None => {}
            }
            drop(cache);
            let mut stats = self.stats.lock().expect("stats lock");
            stats.cache_misses += 1;
            if prefetch {
                stats.prefetch_cache_misses += 1;
            }
        }

        // L2: keyword signature
        if cache_enabled {
            if let Some(kw_key) = &keyword_key {
                let mut cache = self.keyword_cache.lock().expect("keyword cache lock");
                match cache.get(kw_key).copied() {
                    Some(cached) if !self.is_expired(cached.cached_at) => {
                        drop(cache);
                        {
                            let mut stats = self.stats.lock().expect("stats lock");
                            stats.pairs_scored += 1;
                            stats.keyword_cache_hits += 1;
                        }
                        // Promote into L1 for faster future access
                        if let Some(key) = &exact_key {
                            self.exact_cache.lock().expect("exact cache lock").put(
                                key.clone(),
                                CachedScore {
                                    score: cached.score,
                                    cached_at: Instant::now(),
                                },
                            );
                        }
                        return cached.score;
                    }
                    Some(_) => {
                        cache.pop(kw_key);
                    }
                    None => {}
                }
                drop(cache);
                self.stats.lock().expect("stats lock").keyword_cache_misses += 1;
            }
        }

        // L3: semantic similarity ladder
        if cache_enabled {
            if let (Some(embedding), Some(id)) = (query_embedding, candidate_id.as_deref()) {
                if let Some(estimated) = self.semantic_lookup(id, embedding) {
                    {
                        let mut stats = self.stats.lock().expect("stats lock");
                        stats.pairs_scored += 1;
                        stats.semantic_cache_hits += 1;
                    }
                    let now = Instant::now();
                    if let Some(key) = &exact_key {
                        self.exact_cache.lock().expect("exact cache lock").put(
                            key.clone(),
                            CachedScore {
                                score: estimated,
                                cached_at: now,
                            },
                        );
                    }
                    if let Some(kw_key) = &keyword_key {
                        self.keyword_cache.lock().expect("keyword cache lock").put(
                            kw_key.clone(),
                            CachedScore {
                                score: estimated,
                                cached_at: now,
                            },
                        );
                    }
                    return estimated;
                }
                self.stats.lock().expect("stats lock").semantic_cache_misses += 1;
            }
        }

        // LLM: fresh cross-encoder score
        let score = self.score_pair(query, &candidate.content);
        self.stats.lock().expect("stats lock").pairs_scored += 1;

        if cache_enabled {
            let now = Instant::now();
            if let Some(key) = &exact_key {
                self.exact_cache
                    .lock()
                    .expect("exact cache lock")
                    .put(key.clone(), CachedScore { score, cached_at: now });
            }
            if let Some(kw_key) = &keyword_key {
                self.keyword_cache
                    .lock()
                    .expect("keyword cache lock")
                    .put(kw_key.clone(), CachedScore { score, cached_at: now });
            }
            if let (Some(embedding), Some(id)) = (query_embedding, candidate_id.as_deref()) {
                self.semantic_insert(id, embedding.to_vec(), score, now);
            }
        }

        score
    }

    /// Adaptive confidence ladder over the candidate's cached embeddings.
    /// Expired entries are evicted on the way through.
    fn semantic_lookup(&self, candidate_id: &str, query_embedding: &[f32]) -> Option<f64> {
        let mut cache = self.semantic_cache.lock().expect("semantic cache lock");
        let entries = cache.get_mut(candidate_id)?;
        entries.retain(|entry| !self.is_expired(entry.cached_at));
        if entries.is_empty() {
            return None;
        }

        let mut best_similarity = f64::MIN;
        let mut best_stored_score = 0.0;
        for entry in entries.iter() {
            let similarity = cosine_similarity(query_embedding, &entry.embedding) as f64;
            if similarity > best_similarity {
                best_similarity = similarity;
                best_stored_score = entry.score;
            }
        }

        let (estimated, confidence) = if best_similarity >= 0.80 {
            (best_similarity * 0.95, "high")
        } else if best_similarity >= 0.70 {
            (best_similarity * 0.90, "medium")
        } else if best_similarity >= 0.60 {
            (best_similarity * 0.85, "low")
        } else {
            debug!(candidate_id, similarity = best_similarity, "L3 below ladder");
            return None;
        };

        // The banded estimate replaces the stored score, which may be the
        // warm-up sentinel
        info!(
            candidate_id,
            similarity = best_similarity,
            confidence,
            estimated_score = estimated,
            stored_score = best_stored_score,
            "L3 semantic cache hit"
        );
        Some(estimated)
    }

    fn semantic_insert(&self, candidate_id: &str, embedding: Vec<f32>, score: f64, now: Instant) {
        let mut cache = self.semantic_cache.lock().expect("semantic cache lock");
        let entries = cache.entry(candidate_id.to_string()).or_default();
        entries.push(SemanticEntry {
            embedding,
            score,
            cached_at: now,
        });
        if entries.len() > SEMANTIC_ENTRIES_PER_CANDIDATE {
            let excess = entries.len() - SEMANTIC_ENTRIES_PER_CANDIDATE;
            entries.drain(..excess);
        }

        // Whole-candidate eviction keeps the tier bounded
        if cache.len() > self.config.cache_max_entries {
            let oldest = cache
                .iter()
                .min_by_key(|(_, entries)| {
                    entries
                        .iter()
                        .map(|e| e.cached_at)
                        .min()
                        .unwrap_or_else(Instant::now)
                })
                .map(|(id, _)| id.clone());
            if let Some(id) = oldest {
                cache.remove(&id);
            }
        }
    }

    /// Single LLM scoring call. Parse failures and out-of-range replies
    /// score 0.0 so one bad candidate never poisons the batch.
    fn score_pair(&self, query: &str, candidate_text: &str) -> f64 {
        if candidate_text.is_empty() {
            return 0.0;
        }

        let truncated = truncate_bytes(candidate_text, PROMPT_CANDIDATE_LIMIT);
        let prompt = format!(
            "You are a reranker that scores how well a retrieved passage answers a query.\n\
             Return only a floating-point number between 0.0 (irrelevant) and 1.0 (perfect match).\n\
             Query:\n{query}\n\nCandidate Passage:\n{truncated}\n\nScore (0.0-1.0):"
        );

        let opts = GenerateOptions {
            max_tokens: Some(20),
            temperature: 0.0,
            ..Default::default()
        };

        let started = Instant::now();
        let outcome = self
            .router
            .route(TaskKind::ShortSummary, &prompt, &opts)
            .ok()
            .and_then(|raw| raw.split_whitespace().next().map(|t| t.to_string()))
            .and_then(|token| token.parse::<f64>().ok())
            .filter(|score| (0.0..=1.5).contains(score));
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut stats = self.stats.lock().expect("stats lock");
        stats.llm_calls += 1;
        stats.llm_latency_ms_total += duration_ms;
        if duration_ms > stats.llm_latency_ms_max {
            stats.llm_latency_ms_max = duration_ms;
        }

        match outcome {
            Some(score) => score.clamp(0.0, 1.0),
            None => {
                stats.llm_failures += 1;
                warn!("cross-encoder scoring failed or out of range");
                0.0
            }
        }
    }

    /// Heuristic score used when queue wait exceeds the configured bound.
    fn fallback_score(&self, candidate: &SearchResult) -> f64 {
        if self.config.fallback_mode != "heuristic" {
            return 0.0;
        }
        let c = &candidate.components;
        (0.4 * c.vector + 0.3 * c.bm25 + 0.2 * c.metadata + 0.1 * c.recency).clamp(0.0, 1.0)
    }

    // ------------------------------------------------------------------
    // Cache keys
    // ------------------------------------------------------------------

    fn build_exact_key(&self, query: &str, candidate: &SearchResult) -> Option<String> {
        let candidate_id = candidate.candidate_id()?;
        match candidate.project_scope() {
            Some(scope) => Some(format!("{query}::{scope}::{candidate_id}")),
            None => Some(format!("{query}::{candidate_id}")),
        }
    }

    fn build_keyword_key(&self, query: &str, candidate: &SearchResult) -> Option<String> {
        let candidate_id = candidate.candidate_id()?;
        let signature = keywords::signature_for(query)?;
        match candidate.project_scope() {
            Some(scope) => Some(format!("{signature}::{scope}::{candidate_id}")),
            None => Some(format!("{signature}::{candidate_id}")),
        }
    }

    // ------------------------------------------------------------------
    // Warm-up and metrics
    // ------------------------------------------------------------------

    /// Seed the L3 tier with memory embeddings from a project pool.
    /// The 0.0 score is a sentinel; on a hit the banded similarity score is
    /// used, never the sentinel.
    pub fn warm_semantic_cache_from_pool(&self, embeddings: &HashMap<String, Vec<f32>>) -> usize {
        if embeddings.is_empty() || !self.cache_enabled() {
            debug!("semantic cache warm-up skipped");
            return 0;
        }

        let now = Instant::now();
        let mut cache = self.semantic_cache.lock().expect("semantic cache lock");
        let mut added = 0usize;
        for (candidate_id, embedding) in embeddings {
            if candidate_id.is_empty() || embedding.is_empty() {
                continue;
            }
            cache
                .entry(candidate_id.clone())
                .or_default()
                .push(SemanticEntry {
                    embedding: embedding.clone(),
                    score: 0.0,
                    cached_at: now,
                });
            added += 1;
        }

        info!(added, "warmed semantic cache from project pool");
        added
    }

    /// Snapshot of all cache/LLM/queue counters.
    pub fn metrics(&self) -> RerankerMetrics {
        let stats = self.stats.lock().expect("stats lock");
        let semantic = self.semantic_cache.lock().expect("semantic cache lock");

        let cache_events = stats.cache_hits + stats.cache_misses;
        let keyword_events = stats.keyword_cache_hits + stats.keyword_cache_misses;
        let semantic_events = stats.semantic_cache_hits + stats.semantic_cache_misses;
        let ratio = |hits: u64, events: u64| {
            if events > 0 {
                hits as f64 / events as f64
            } else {
                0.0
            }
        };

        RerankerMetrics {
            enabled: self.config.enabled,
            pairs_scored: stats.pairs_scored,
            cache_entries: self.exact_cache.lock().expect("exact cache lock").len(),
            keyword_cache_entries: self.keyword_cache.lock().expect("keyword cache lock").len(),
            semantic_cache_candidates: semantic.len(),
            semantic_cache_embeddings: semantic.values().map(|v| v.len()).sum(),
            cache_size: self.config.cache_max_entries,
            cache_ttl_seconds: self.config.cache_ttl_seconds,
            semantic_similarity_threshold: self.config.semantic_similarity_threshold,
            cache_hits: stats.cache_hits,
            cache_misses: stats.cache_misses,
            cache_hit_rate: ratio(stats.cache_hits, cache_events),
            keyword_cache_hits: stats.keyword_cache_hits,
            keyword_cache_misses: stats.keyword_cache_misses,
            keyword_cache_hit_rate: ratio(stats.keyword_cache_hits, keyword_events),
            semantic_cache_hits: stats.semantic_cache_hits,
            semantic_cache_misses: stats.semantic_cache_misses,
            semantic_cache_hit_rate: ratio(stats.semantic_cache_hits, semantic_events),
            total_cache_hit_rate: if stats.pairs_scored > 0 {
                1.0 - stats.llm_calls as f64 / stats.pairs_scored as f64
            } else {
                0.0
            },
            prefetch_requests: stats.prefetch_requests,
            prefetch_cache_hits: stats.prefetch_cache_hits,
            prefetch_cache_misses: stats.prefetch_cache_misses,
            llm_calls: stats.llm_calls,
            llm_failures: stats.llm_failures,
            avg_llm_latency_ms: if stats.llm_calls > 0 {
                stats.llm_latency_ms_total / stats.llm_calls as f64
            } else {
                0.0
            },
            max_llm_latency_ms: stats.llm_latency_ms_max,
            queue_wait_avg_ms: if stats.pairs_scored > 0 {
                stats.queue_wait_total_ms / stats.pairs_scored as f64
            } else {
                0.0
            },
            queue_wait_max_ms: stats.queue_wait_max_ms,
            queue_rejections: stats.queue_rejections,
            max_parallel_reranks: self.config.max_parallel,
        }
    }
}

fn truncate_bytes(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ============================================================================
// TESTS
// ============================================================================
