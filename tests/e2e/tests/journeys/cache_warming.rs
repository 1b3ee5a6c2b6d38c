//! Cache warming journey
//!
//! Exercises the reranker's three-tier cache end to end: exact and keyword
//! hits on repeat queries, semantic hits from a warmed project pool, and
//! the session-driven prefetch path.

use std::collections::HashMap;

use engram_core::cosine_similarity;
use engram_e2e::{bag_of_words_embedding, TestEngine};

#[test]
fn repeat_queries_hit_the_exact_and_keyword_tiers() {
    let engine = TestEngine::new();
    engine.ingest(
        "Why did the change feed ingestion fail?",
        "The change feed ingestion failed on malformed offsets.",
        "cli",
    );

    let query = "change feed ingestion failure details";
    engine.search.search(query, None, None);
    let after_first = engine.reranker.metrics().llm_calls;
    assert!(after_first >= 1);

    // Identical query: the exact tier answers
    engine.search.search(query, None, None);
    let metrics = engine.reranker.metrics();
    assert_eq!(metrics.llm_calls, after_first);
    assert!(metrics.cache_hits >= 1);

    // Reworded query with the same top keywords: the keyword tier answers
    engine.search.search("details failure ingestion change feed", None, None);
    let metrics = engine.reranker.metrics();
    assert_eq!(metrics.llm_calls, after_first);
    assert!(metrics.keyword_cache_hits >= 1);
    assert!(metrics.total_cache_hit_rate > 0.0);
}

#[test]
fn warmed_semantic_tier_answers_without_the_model() {
    let engine = TestEngine::new();

    // Warm the L3 tier with an embedding the query will reproduce exactly
    let warm_text = "deployment checklist for the quarterly rollout";
    let warmed: HashMap<String, Vec<f32>> = HashMap::from([(
        "mem-warm-metadata".to_string(),
        bag_of_words_embedding(warm_text),
    )]);
    assert_eq!(engine.reranker.warm_semantic_cache_from_pool(&warmed), 1);

    // Sanity: identical text embeds identically
    assert!(
        cosine_similarity(
            &bag_of_words_embedding(warm_text),
            &warmed["mem-warm-metadata"]
        ) > 0.999
    );

    let candidates = vec![engram_core::SearchResult {
        id: "mem-warm-metadata".to_string(),
        content: "Deployment checklist body".to_string(),
        metadata: Default::default(),
        score: 0.5,
        combined_score: 0.5,
        vector_similarity: 0.5,
        bm25_score: 0.0,
        components: Default::default(),
        cross_score: None,
        priority: 0,
    }];

    let reranked = engine.reranker.rerank(warm_text, candidates, false);
    let cross = reranked[0].cross_score.unwrap();

    // High band: similarity ~1.0 estimates ~0.95, and no model call happened
    assert!((0.76..=0.95).contains(&cross), "cross_score was {cross}");
    let metrics = engine.reranker.metrics();
    assert_eq!(metrics.llm_calls, 0);
    assert_eq!(metrics.semantic_cache_hits, 1);
}

#[test]
fn project_pool_warms_the_reranker() {
    let engine = TestEngine::new();
    let project = engine.projects.create("Warmable", "", vec![]).unwrap();
    engine.ingest_in_project(
        "Track the rollout steps",
        "Rollout proceeds region by region behind the canary gate.",
        &project.id,
    );
    engine.ingest_in_project(
        "Track the rollback steps",
        "Rollback reverts the canary gate first.",
        &project.id,
    );

    let stats = engine.pool.warm_cache(&engine.reranker, &project.id);
    assert_eq!(stats.memories_loaded, 2);
    assert_eq!(stats.cache_entries_added, 2);

    let metrics = engine.reranker.metrics();
    assert_eq!(metrics.semantic_cache_candidates, 2);
    assert_eq!(metrics.semantic_cache_embeddings, 2);

    let ids = engine.pool.get_memory_ids(&project.id);
    assert_eq!(ids.len(), 2);
    assert!(ids.iter().all(|id| id.starts_with("mem-")));
    assert!(ids.iter().all(|id| !id.ends_with("-metadata")));
}

#[test]
fn confident_session_hint_prefetches_once() {
    let engine = TestEngine::new();
    let project = engine.projects.create("Hinted", "", vec![]).unwrap();
    engine.ingest_in_project(
        "Keep the hinted context",
        "Hinted context covers the project runbook.",
        &project.id,
    );

    let session_id = engine.sessions.start_session(None);
    assert!(engine.sessions.set_project_hint(&session_id, "Hinted", 0.8, "auto"));

    // Prefetch runs on a background thread: pool warm-up first, then the
    // warm-up search (which bumps the prefetch counter)
    let mut warmed = false;
    for _ in 0..500 {
        let metrics = engine.reranker.metrics();
        if metrics.semantic_cache_candidates > 0 && metrics.prefetch_requests >= 1 {
            warmed = true;
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert!(warmed, "prefetch never warmed the semantic cache");
    std::thread::sleep(std::time::Duration::from_millis(150));

    // The guard is single-shot until the hint is cleared
    let requests = engine.reranker.metrics().prefetch_requests;
    assert!(engine.sessions.set_project_hint(&session_id, "Hinted", 0.9, "auto"));
    std::thread::sleep(std::time::Duration::from_millis(150));
    assert_eq!(engine.reranker.metrics().prefetch_requests, requests);

    assert!(engine.sessions.clear_project_hint(&session_id));
    assert!(engine.sessions.get_project_hint(&session_id).is_none());
}

#[test]
fn simple_queries_skip_the_cross_encoder() {
    let engine = TestEngine::with_config(engram_core::CrossEncoderConfig::default());
    engine.ingest(
        "Where is the auth error logged?",
        "Auth errors land in the gateway log.",
        "cli",
    );

    // Three words or fewer: no rerank, no model calls
    let results = engine.search.search("auth error", None, None);
    assert!(!results.is_empty());
    assert!(results[0].cross_score.is_none());
    assert_eq!(engine.reranker.metrics().llm_calls, 0);
}
