//! Indexer
//!
//! Writes chunks to both stores: embeds each chunk, attaches the salience
//! weight, adds it to the vector store, and batches the texts into the BM25
//! index. Per-chunk failures are logged and skipped so the rest of the batch
//! still lands.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::memory::{Chunk, Metadata, MetadataValue, MEMORY_METADATA_SUFFIX};
use crate::model::ModelRouter;
use crate::storage::{Bm25Index, VectorStore};

// ============================================================================
// SALIENCE WEIGHT
// ============================================================================

/// Optimal chunk token range lower bound.
const OPTIMAL_MIN_TOKENS: f64 = 256.0;

/// Optimal chunk token range upper bound.
const OPTIMAL_MAX_TOKENS: f64 = 384.0;

/// Normalized chunk-length bonus in [0.5, 1.0].
///
/// Chunks in the 256-384 token range score 0.95-1.0 (peaking at 320);
/// smaller chunks decay linearly, larger ones logarithmically.
pub fn salience_weight(tokens: usize) -> f64 {
    let tokens = tokens as f64;
    let optimal_mid = (OPTIMAL_MIN_TOKENS + OPTIMAL_MAX_TOKENS) / 2.0;

    if (OPTIMAL_MIN_TOKENS..=OPTIMAL_MAX_TOKENS).contains(&tokens) {
        let distance = (tokens - optimal_mid).abs() / (OPTIMAL_MAX_TOKENS - OPTIMAL_MIN_TOKENS);
        (1.0 - distance * 0.05).clamp(0.95, 1.0)
    } else if tokens < OPTIMAL_MIN_TOKENS {
        let ratio = tokens / OPTIMAL_MIN_TOKENS;
        (0.5 + ratio * 0.45).clamp(0.5, 0.95)
    } else {
        let excess_ratio = (tokens - OPTIMAL_MAX_TOKENS) / OPTIMAL_MAX_TOKENS;
        (0.95 - excess_ratio.ln_1p() * 0.15).clamp(0.5, 0.95)
    }
}

// ============================================================================
// INDEXER
// ============================================================================

/// Dual-store indexer.
pub struct Indexer {
    vector: Arc<VectorStore>,
    bm25: Arc<Bm25Index>,
    router: Arc<ModelRouter>,
}

impl Indexer {
    pub fn new(vector: Arc<VectorStore>, bm25: Arc<Bm25Index>, router: Arc<ModelRouter>) -> Self {
        Self { vector, bm25, router }
    }

    /// Index chunks in both stores. Per-chunk embedding or write failures
    /// skip that chunk; the others still index.
    pub fn index(&self, chunks: &mut [Chunk]) {
        if chunks.is_empty() {
            return;
        }

        let mut bm25_batch: BTreeMap<String, String> = BTreeMap::new();

        for chunk in chunks.iter_mut() {
            let embedding = match self.router.generate_embedding(&chunk.content) {
                Ok(embedding) => embedding,
                Err(e) => {
                    error!(chunk = %chunk.id, "embedding failed, skipping chunk: {e}");
                    continue;
                }
            };
            chunk.embedding = Some(embedding.clone());

            let mut metadata = chunk.metadata.clone();
            metadata
                .entry("memory_id".to_string())
                .or_insert_with(|| MetadataValue::Str(chunk.memory_id.clone()));
            metadata.insert(
                "salience_weight".to_string(),
                MetadataValue::Float(salience_weight(chunk.tokens)),
            );

            if let Err(e) = self.vector.add(&chunk.id, &embedding, &metadata, &chunk.content) {
                error!(chunk = %chunk.id, "vector write failed, skipping chunk: {e}");
                continue;
            }

            bm25_batch.insert(chunk.id.clone(), chunk.content.clone());
        }

        if let Err(e) = self.bm25.add_documents(&bm25_batch) {
            error!("BM25 batch indexing failed: {e}");
        }

        info!(indexed = bm25_batch.len(), total = chunks.len(), "indexed chunks");
    }

    /// Delete specific chunk ids from both stores.
    pub fn delete(&self, chunk_ids: &[String]) {
        for id in chunk_ids {
            if let Err(e) = self.vector.delete(id) {
                error!(chunk = %id, "vector delete failed: {e}");
            }
            if let Err(e) = self.bm25.delete(id) {
                error!(chunk = %id, "BM25 delete failed: {e}");
            }
        }
        debug!(deleted = chunk_ids.len(), "deleted chunks");
    }

    /// Delete every chunk belonging to a memory, leaving its memory-level
    /// metadata entry alone.
    pub fn delete_by_memory_id(&self, memory_id: &str) {
        let mut filter = Metadata::new();
        filter.insert(
            "memory_id".to_string(),
            MetadataValue::Str(memory_id.to_string()),
        );

        let entries = match self.vector.list_by_metadata(&filter, false, false) {
            Ok(entries) => entries,
            Err(e) => {
                error!(memory_id, "listing chunks failed: {e}");
                return;
            }
        };

        let chunk_ids: Vec<String> = entries
            .into_iter()
            .filter(|entry| {
                let is_memory_entry = entry
                    .metadata
                    .get("is_memory_entry")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                !is_memory_entry && !entry.id.ends_with(MEMORY_METADATA_SUFFIX)
            })
            .map(|entry| entry.id)
            .collect();

        if chunk_ids.is_empty() {
            debug!(memory_id, "no chunks to delete");
            return;
        }
        self.delete(&chunk_ids);
    }

    /// Counts across both stores.
    pub fn index_stats(&self) -> (usize, usize) {
        let vector_count = self.vector.count().unwrap_or(0);
        let bm25_count = self.bm25.count();
        (vector_count, bm25_count)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::fixed_router;

    fn make_chunk(id: &str, memory_id: &str, content: &str, tokens: usize) -> Chunk {
        Chunk {
            id: id.to_string(),
            memory_id: memory_id.to_string(),
            content: content.to_string(),
            tokens,
            embedding: None,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_salience_weight_optimal_range() {
        assert!((salience_weight(320) - 1.0).abs() < 1e-9);
        assert!(salience_weight(256) >= 0.95);
        assert!(salience_weight(384) >= 0.95);
        assert!(salience_weight(300) <= 1.0);
    }

    #[test]
    fn test_salience_weight_small_chunks() {
        let w128 = salience_weight(128);
        assert!((w128 - 0.725).abs() < 1e-9);
        assert!((salience_weight(0) - 0.5).abs() < 1e-9);
        // Monotonic up to the optimal range
        assert!(salience_weight(64) < salience_weight(128));
        assert!(salience_weight(128) < salience_weight(255));
    }

    #[test]
    fn test_salience_weight_large_chunks() {
        let w512 = salience_weight(512);
        assert!(w512 < 0.95 && w512 > 0.85);
        assert!(salience_weight(1024) < salience_weight(512));
        assert!(salience_weight(100_000) >= 0.5);
    }

    #[test]
    fn test_index_writes_both_stores() {
        let vector = Arc::new(VectorStore::open_in_memory().unwrap());
        let bm25 = Arc::new(Bm25Index::in_memory());
        let router = Arc::new(fixed_router("", vec![1.0, 0.0]));
        let indexer = Indexer::new(vector.clone(), bm25.clone(), router);

        let mut chunks = vec![
            make_chunk("m1-chunk-0", "m1", "first chunk text", 3),
            make_chunk("m1-chunk-1", "m1", "second chunk text", 3),
        ];
        indexer.index(&mut chunks);

        assert_eq!(vector.count().unwrap(), 2);
        assert_eq!(bm25.count(), 2);
        assert!(chunks.iter().all(|c| c.embedding.is_some()));

        let entry = vector.get("m1-chunk-0").unwrap().unwrap();
        assert_eq!(entry.metadata["memory_id"].as_str(), Some("m1"));
        let weight = entry.metadata["salience_weight"].as_f64().unwrap();
        assert!((0.5..=1.0).contains(&weight));

        assert_eq!(indexer.index_stats(), (2, 2));
    }

    #[test]
    fn test_delete_by_memory_id_spares_metadata_entry() {
        let vector = Arc::new(VectorStore::open_in_memory().unwrap());
        let bm25 = Arc::new(Bm25Index::in_memory());
        let router = Arc::new(fixed_router("", vec![1.0, 0.0]));
        let indexer = Indexer::new(vector.clone(), bm25.clone(), router);

        let mut chunks = vec![make_chunk("m1-chunk-0", "m1", "chunk body", 3)];
        indexer.index(&mut chunks);

        // The memory-level entry shares the memory_id but must survive
        let mut metadata = Metadata::new();
        metadata.insert("memory_id".to_string(), MetadataValue::Str("m1".to_string()));
        metadata.insert("is_memory_entry".to_string(), MetadataValue::Bool(true));
        vector.add("m1-metadata", &[1.0, 0.0], &metadata, "summary").unwrap();

        indexer.delete_by_memory_id("m1");

        assert!(vector.get("m1-chunk-0").unwrap().is_none());
        assert!(vector.get("m1-metadata").unwrap().is_some());
        assert_eq!(bm25.count(), 0);
    }
}
