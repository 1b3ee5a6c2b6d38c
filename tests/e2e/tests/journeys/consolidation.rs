//! Consolidation journey
//!
//! Exercises the maintenance loop over really-ingested memories: tier
//! migration after the retention window, clustering with representative
//! selection, forgetting of old low-importance memories, and idempotence of
//! a second run.

use chrono::{Duration, Utc};

use engram_core::{Metadata, MetadataValue};
use engram_e2e::TestEngine;

/// Backdate a memory and optionally weaken it, like time passing would.
fn age_memory(engine: &TestEngine, memory_id: &str, days: i64, importance: f64) {
    let mut patch = Metadata::new();
    patch.insert(
        "created_at".to_string(),
        MetadataValue::Str((Utc::now() - Duration::days(days)).to_rfc3339()),
    );
    patch.insert("importance".to_string(), MetadataValue::Float(importance));
    engine
        .vector
        .update_metadata(&format!("{memory_id}-metadata"), &patch)
        .unwrap();
}

#[test]
fn working_memory_migrates_after_retention_window() {
    let engine = TestEngine::new();
    let stale = engine.ingest("old question", "old answer about the indexer", "cli");
    let fresh = engine.ingest("new question", "new answer about the chunker", "cli");

    // Only the stale memory is past the 8-hour retention window
    age_memory(&engine, &stale, 1, 0.5);

    let stats = engine.consolidation.consolidate();
    assert_eq!(stats.migrated_count, 1);

    let migrated = engine.vector.get(&format!("{stale}-metadata")).unwrap().unwrap();
    assert_eq!(migrated.metadata["memory_type"].as_str(), Some("short_term"));
    assert!(migrated.metadata.contains_key("migrated_at"));

    let untouched = engine.vector.get(&format!("{fresh}-metadata")).unwrap().unwrap();
    assert_eq!(untouched.metadata["memory_type"].as_str(), Some("working"));
}

#[test]
fn near_duplicates_cluster_under_one_representative() {
    let engine = TestEngine::new();
    // Same wording twice: the echoed summaries embed almost identically
    let first = engine.ingest(
        "How does the retry backoff work?",
        "Retry backoff doubles the delay up to one minute.",
        "cli",
    );
    let second = engine.ingest(
        "How does the retry backoff work?",
        "Retry backoff doubles the delay up to one minute.",
        "cli",
    );
    // And one unrelated memory that must stay out of the cluster
    let outlier = engine.ingest(
        "Where is the billing dashboard?",
        "Billing lives in the finance portal.",
        "cli",
    );

    let stats = engine.consolidation.consolidate();
    assert_eq!(stats.memories_compressed, 1);

    let is_representative = |memory_id: &str| {
        engine
            .vector
            .get(&format!("{memory_id}-metadata"))
            .unwrap()
            .unwrap()
            .metadata
            .get("is_representative")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    };
    let is_compressed = |memory_id: &str| {
        engine
            .vector
            .get(&format!("{memory_id}-metadata"))
            .unwrap()
            .unwrap()
            .metadata
            .get("is_compressed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    };

    // Exactly one of the twins represents the cluster; the other is flagged
    assert!(is_representative(&first) ^ is_representative(&second));
    assert!(is_compressed(&first) ^ is_compressed(&second));
    // The singleton never qualifies for cluster processing
    assert!(!is_representative(&outlier));
    assert!(!is_compressed(&outlier));
}

#[test]
fn old_unimportant_memories_are_forgotten_with_their_chunks() {
    let engine = TestEngine::new();
    let doomed = engine.ingest(
        "Note the temporary workaround",
        "Pin the dependency until the upstream fix lands.",
        "cli",
    );
    let kept = engine.ingest(
        "Record the incident follow-up",
        "The incident follow-up assigns pager duty rotation.",
        "cli",
    );

    age_memory(&engine, &doomed, 45, 0.1);
    age_memory(&engine, &kept, 45, 0.5);

    let stats = engine.consolidation.consolidate();
    assert_eq!(stats.memories_deleted, 1);

    assert!(engine.vector.get(&format!("{doomed}-metadata")).unwrap().is_none());
    assert!(engine.vector.get(&format!("{doomed}-chunk-0")).unwrap().is_none());
    assert_eq!(engine.bm25.get(&format!("{doomed}-chunk-0")), None);

    assert!(engine.vector.get(&format!("{kept}-metadata")).unwrap().is_some());
    assert!(engine.vector.get(&format!("{kept}-chunk-0")).unwrap().is_some());
}

#[test]
fn second_run_without_writes_changes_nothing() {
    let engine = TestEngine::new();
    let memory_id = engine.ingest("only question", "only answer text", "cli");
    age_memory(&engine, &memory_id, 1, 0.5);

    let first = engine.consolidation.consolidate();
    assert_eq!(first.migrated_count, 1);
    assert_eq!(first.memories_deleted, 0);

    let second = engine.consolidation.consolidate();
    assert_eq!(second.migrated_count, 0);
    assert_eq!(second.memories_deleted, 0);
    assert_eq!(engine.vector.count().unwrap(), 2);
}

#[test]
fn access_boost_raises_strength_and_timestamps() {
    let engine = TestEngine::new();
    let memory_id = engine.ingest("boost me", "content worth revisiting", "cli");

    assert!(engine.consolidation.update_memory_strength(&memory_id, 0.1));
    let entry = engine.vector.get(&format!("{memory_id}-metadata")).unwrap().unwrap();
    // Ingestion starts at 1.0; the boost clamps there
    assert_eq!(entry.metadata["strength"].as_f64(), Some(1.0));
    assert!(entry.metadata.contains_key("last_accessed"));

    let importance = engine
        .consolidation
        .calculate_importance_score(&memory_id, 4, 2);
    assert!((0.0..=1.0).contains(&importance));
}
