//! Ingest -> search journey
//!
//! Covers the write path end to end: a conversation lands in both stores,
//! hybrid search brings it back by a distinctive token, duplicates collapse
//! to one result per memory, and project scoping filters candidates.

use engram_e2e::TestEngine;
use engram_core::{MetadataValue, Metadata};

#[test]
fn ingested_conversation_is_searchable_by_distinctive_token() {
    let engine = TestEngine::new();

    let memory_id = engine.ingest(
        "How to fix TypeError?",
        "Check None values before calling methods on them.",
        "cli",
    );

    // Both stores carry the chunk; the vector store also carries the entry
    assert_eq!(engine.bm25.count(), 1);
    assert_eq!(engine.vector.count().unwrap(), 2);

    let results = engine.search.search("TypeError fix please", None, None);
    assert!(!results.is_empty());
    assert!(results[0].content.contains("TypeError"));
    assert_eq!(
        results[0].metadata.get("memory_id").and_then(|v| v.as_str()),
        Some(memory_id.as_str())
    );
}

#[test]
fn each_memory_appears_at_most_once() {
    let engine = TestEngine::new();

    engine.ingest(
        "Why does the deployment pipeline stall?",
        "The deployment pipeline stalls when the canary gate times out.",
        "cli",
    );
    engine.ingest(
        "Where are the release notes kept?",
        "Release notes live in the changelog directory.",
        "cli",
    );

    let results = engine.search.search("deployment pipeline stall gate", None, None);
    assert!(!results.is_empty());

    let mut seen: Vec<String> = vec![];
    for result in &results {
        let memory_id = result
            .metadata
            .get("memory_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        assert!(!seen.contains(&memory_id), "memory {memory_id} appeared twice");
        seen.push(memory_id);
    }

    // Memory-entry representations are preferred over raw chunks
    for result in &results {
        assert_eq!(
            result.metadata.get("is_memory_entry").and_then(|v| v.as_bool()),
            Some(true)
        );
    }
}

#[test]
fn project_scoped_search_filters_candidates() {
    let engine = TestEngine::new();
    let project = engine.projects.create("Scoped", "", vec![]).unwrap();

    engine.ingest_in_project(
        "What broke the scoped ingestion job?",
        "The scoped ingestion job broke on a schema change.",
        &project.id,
    );
    engine.ingest(
        "What broke the other ingestion job?",
        "The other ingestion job broke on quota limits.",
        "cli",
    );

    let results = engine
        .search
        .search_in_project(&project.id, "ingestion job broke badly", None, None);
    assert!(!results.is_empty());
    for result in &results {
        assert_eq!(
            result.metadata.get("project_id").and_then(|v| v.as_str()),
            Some(project.id.as_str())
        );
    }

    // The scoped search bumped the project usage counter
    let refreshed = engine.projects.get(&project.id).unwrap();
    assert_eq!(refreshed.usage_count, 1);
    assert_eq!(refreshed.memory_count, 1);
}

#[test]
fn reranker_attaches_cross_scores_and_counts_pairs() {
    let engine = TestEngine::new();
    engine.ingest(
        "How do we rotate the signing keys?",
        "Signing keys rotate through the vault exporter once a quarter.",
        "cli",
    );

    let results = engine
        .search
        .search("how do we rotate the signing keys", None, None);
    assert!(!results.is_empty());
    assert_eq!(results[0].cross_score, Some(0.7));

    let metrics = engine.reranker.metrics();
    assert!(metrics.pairs_scored >= 1);
    assert!(metrics.llm_calls >= 1);
}

#[test]
fn deleted_memory_disappears_from_search() {
    let engine = TestEngine::new();
    let memory_id = engine.ingest(
        "Remember the beacon endpoint",
        "The beacon endpoint is beacon.internal.example",
        "cli",
    );

    engine.ingestion.delete_memory(&memory_id).unwrap();
    assert_eq!(engine.vector.count().unwrap(), 0);
    assert_eq!(engine.bm25.count(), 0);

    let results = engine.search.search("beacon endpoint address", None, None);
    assert!(results.is_empty());
}

#[test]
fn bookmarked_search_replays_with_saved_filters() {
    let engine = TestEngine::new();
    let project = engine.projects.create("Bookmarked", "", vec![]).unwrap();
    engine.ingest_in_project(
        "What is the audit cadence?",
        "Audits run monthly with a compliance checklist.",
        &project.id,
    );

    let mut filters = Metadata::new();
    filters.insert(
        "project_id".to_string(),
        MetadataValue::Str(project.id.clone()),
    );
    let bookmark = engine
        .bookmarks
        .create("monthly audits", "audit cadence checklist", filters)
        .unwrap();

    let used = engine.bookmarks.record_use(&bookmark.id).unwrap();
    assert_eq!(used.usage_count, 1);

    let results = engine
        .search
        .search(&used.query, None, Some(used.filters.clone()));
    assert!(!results.is_empty());
    assert_eq!(
        results[0].metadata.get("project_id").and_then(|v| v.as_str()),
        Some(project.id.as_str())
    );
}
