//! Lexical Index (Okapi BM25)
//!
//! Keyword search over a document id -> text map. Tokenization is the
//! contract: lowercase, whitespace split. The scoring tables are rebuilt
//! whenever the document set changes; `add_documents` amortizes rebuilds for
//! batches. Persistence is an opaque binary blob; a corrupt blob falls back
//! to an empty index.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Result;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Term frequency saturation.
const K1: f64 = 1.5;

/// Document length normalization.
const B: f64 = 0.75;

/// Persistence blob format version.
const BLOB_VERSION: u32 = 1;

// ============================================================================
// TYPES
// ============================================================================

/// A lexical search hit. Scores are unbounded and non-negative; zero-score
/// documents are omitted.
#[derive(Debug, Clone)]
pub struct Bm25Hit {
    pub id: String,
    pub score: f64,
}

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    version: u32,
    documents: BTreeMap<String, String>,
}

struct Inner {
    /// doc_id -> original text, in insertion order
    documents: Vec<(String, String)>,
    /// doc_id -> position in `documents`
    positions: HashMap<String, usize>,
    /// tokenized documents, parallel to `documents`
    tokens: Vec<Vec<String>>,
    /// term -> number of documents containing it
    doc_frequency: HashMap<String, usize>,
    avg_doc_len: f64,
}

/// Okapi BM25 index with opaque blob persistence.
pub struct Bm25Index {
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

impl Bm25Index {
    /// Open the index, loading the persisted blob when present.
    /// A corrupt blob is logged and replaced with an empty index.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let documents = match std::fs::read(&path) {
            Ok(bytes) => match bincode::deserialize::<PersistedIndex>(&bytes) {
                Ok(persisted) if persisted.version == BLOB_VERSION => persisted.documents,
                Ok(persisted) => {
                    warn!(version = persisted.version, "unknown BM25 blob version, starting empty");
                    BTreeMap::new()
                }
                Err(e) => {
                    warn!("corrupt BM25 blob, starting empty: {e}");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };

        let mut inner = Inner::empty();
        for (id, text) in documents {
            inner.insert(id, text);
        }
        inner.rebuild();

        debug!(documents = inner.documents.len(), "BM25 index opened");
        Self {
            path: Some(path),
            inner: Mutex::new(inner),
        }
    }

    /// Purely in-memory index (tests, ephemeral usage).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(Inner::empty()),
        }
    }

    /// Add (or replace) a single document. Triggers a full rebuild; prefer
    /// [`Bm25Index::add_documents`] for batches.
    pub fn add_document(&self, id: &str, text: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("bm25 lock poisoned");
        inner.insert(id.to_string(), text.to_string());
        inner.rebuild();
        self.save(&inner)
    }

    /// Add multiple documents with a single rebuild.
    pub fn add_documents(&self, documents: &BTreeMap<String, String>) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().expect("bm25 lock poisoned");
        for (id, text) in documents {
            inner.insert(id.clone(), text.clone());
        }
        inner.rebuild();
        self.save(&inner)
    }

    /// Delete a document. Unknown ids are a no-op.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("bm25 lock poisoned");
        if inner.remove(id) {
            inner.rebuild();
            self.save(&inner)?;
        }
        Ok(())
    }

    /// Search for documents matching the query, best first. Ties keep
    /// insertion order.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<Bm25Hit> {
        let inner = self.inner.lock().expect("bm25 lock poisoned");
        if inner.documents.is_empty() || query.trim().is_empty() {
            return vec![];
        }

        let query_terms = tokenize(query);
        let total_docs = inner.documents.len() as f64;

        let mut hits: Vec<Bm25Hit> = Vec::new();
        for (position, (id, _)) in inner.documents.iter().enumerate() {
            let doc_tokens = &inner.tokens[position];
            if doc_tokens.is_empty() {
                continue;
            }

            let mut score = 0.0;
            for term in &query_terms {
                let df = match inner.doc_frequency.get(term) {
                    Some(df) => *df as f64,
                    None => continue,
                };
                let tf = doc_tokens.iter().filter(|t| *t == term).count() as f64;
                if tf == 0.0 {
                    continue;
                }

                // Non-negative idf variant so scores stay >= 0
                let idf = ((total_docs - df + 0.5) / (df + 0.5) + 1.0).ln();
                let doc_len = doc_tokens.len() as f64;
                let denom = tf + K1 * (1.0 - B + B * doc_len / inner.avg_doc_len);
                score += idf * tf * (K1 + 1.0) / denom;
            }

            if score > 0.0 {
                hits.push(Bm25Hit {
                    id: id.clone(),
                    score,
                });
            }
        }

        // Stable sort keeps insertion order for equal scores
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        hits
    }

    /// Original text of a document.
    pub fn get(&self, id: &str) -> Option<String> {
        let inner = self.inner.lock().expect("bm25 lock poisoned");
        inner
            .positions
            .get(id)
            .map(|&pos| inner.documents[pos].1.clone())
    }

    /// Total number of documents.
    pub fn count(&self) -> usize {
        self.inner.lock().expect("bm25 lock poisoned").documents.len()
    }

    fn save(&self, inner: &Inner) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let persisted = PersistedIndex {
            version: BLOB_VERSION,
            documents: inner
                .documents
                .iter()
                .map(|(id, text)| (id.clone(), text.clone()))
                .collect(),
        };
        let bytes = bincode::serialize(&persisted)
            .map_err(|e| super::StorageError::Corrupt(e.to_string()))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

impl Inner {
    fn empty() -> Self {
        Self {
            documents: Vec::new(),
            positions: HashMap::new(),
            tokens: Vec::new(),
            doc_frequency: HashMap::new(),
            avg_doc_len: 0.0,
        }
    }

    fn insert(&mut self, id: String, text: String) {
        match self.positions.get(&id) {
            Some(&pos) => self.documents[pos].1 = text,
            None => {
                self.positions.insert(id.clone(), self.documents.len());
                self.documents.push((id, text));
            }
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(pos) = self.positions.remove(id) else {
            return false;
        };
        self.documents.remove(pos);
        // Reindex positions after the removal point
        self.positions.clear();
        for (i, (doc_id, _)) in self.documents.iter().enumerate() {
            self.positions.insert(doc_id.clone(), i);
        }
        true
    }

    fn rebuild(&mut self) {
        self.tokens = self
            .documents
            .iter()
            .map(|(_, text)| tokenize(text))
            .collect();

        self.doc_frequency.clear();
        let mut total_len = 0usize;
        for doc_tokens in &self.tokens {
            total_len += doc_tokens.len();
            let mut seen: Vec<&String> = Vec::new();
            for token in doc_tokens {
                if !seen.contains(&token) {
                    seen.push(token);
                    *self.doc_frequency.entry(token.clone()).or_insert(0) += 1;
                }
            }
        }

        self.avg_doc_len = if self.tokens.is_empty() {
            0.0
        } else {
            (total_len as f64 / self.tokens.len() as f64).max(1.0)
        };
    }
}

/// The tokenization contract: lowercase, whitespace split.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|t| t.to_string())
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_ranks_matching_documents() {
        let index = Bm25Index::in_memory();
        index.add_document("d1", "python error handling guide").unwrap();
        index.add_document("d2", "rust ownership and borrowing").unwrap();
        index.add_document("d3", "python typing deep dive").unwrap();

        let hits = index.search("python guide", 10);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, "d1");
        assert!(hits.iter().all(|h| h.score > 0.0));
        assert!(hits.iter().all(|h| h.id != "d2"));
    }

    #[test]
    fn test_zero_score_documents_omitted() {
        let index = Bm25Index::in_memory();
        index.add_document("d1", "alpha beta").unwrap();
        let hits = index.search("gamma", 10);
        assert!(hits.is_empty());
    }

    #[test]
    fn test_empty_index_and_empty_query() {
        let index = Bm25Index::in_memory();
        assert!(index.search("anything", 5).is_empty());
        index.add_document("d1", "text").unwrap();
        assert!(index.search("   ", 5).is_empty());
    }

    #[test]
    fn test_batch_add_and_delete() {
        let index = Bm25Index::in_memory();
        let mut batch = BTreeMap::new();
        batch.insert("a".to_string(), "first doc".to_string());
        batch.insert("b".to_string(), "second doc".to_string());
        index.add_documents(&batch).unwrap();
        assert_eq!(index.count(), 2);

        index.delete("a").unwrap();
        assert_eq!(index.count(), 1);
        assert!(index.get("a").is_none());
        assert_eq!(index.get("b").unwrap(), "second doc");

        // Unknown delete is a no-op
        index.delete("never").unwrap();
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn test_replacement_keeps_single_entry() {
        let index = Bm25Index::in_memory();
        index.add_document("a", "old text").unwrap();
        index.add_document("a", "new text").unwrap();
        assert_eq!(index.count(), 1);
        assert_eq!(index.get("a").unwrap(), "new text");
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bm25_index.bin");

        {
            let index = Bm25Index::open(&path);
            index.add_document("d1", "persisted document").unwrap();
        }

        let reopened = Bm25Index::open(&path);
        assert_eq!(reopened.count(), 1);
        assert_eq!(reopened.search("persisted", 5)[0].id, "d1");
    }

    #[test]
    fn test_corrupt_blob_falls_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bm25_index.bin");
        std::fs::write(&path, b"not a valid blob at all").unwrap();

        let index = Bm25Index::open(&path);
        assert_eq!(index.count(), 0);
    }
}
