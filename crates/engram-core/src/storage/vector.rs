//! Vector Store
//!
//! SQLite holds every indexed entry (document text, scalar metadata as JSON,
//! embedding as a little-endian f32 BLOB). A USearch HNSW index over the same
//! embeddings serves unfiltered similarity queries; filtered queries apply a
//! pure AND over metadata and score the surviving rows exactly.
//!
//! The HNSW index is rebuilt from SQLite at open, so the database file is the
//! single source of truth.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use super::{Result, StorageError};
use crate::memory::{Metadata, MetadataValue};
use crate::model::embedding::{cosine_similarity, Embedding};

// ============================================================================
// CONSTANTS
// ============================================================================

/// HNSW connectivity parameter (higher = better recall, more memory)
const CONNECTIVITY: usize = 16;

/// HNSW expansion factor for index building
const EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search
const EXPANSION_SEARCH: usize = 64;

/// Initial index capacity reservation
const INITIAL_CAPACITY: usize = 64;

// ============================================================================
// TYPES
// ============================================================================

/// A stored indexed entry.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    pub embedding: Option<Vec<f32>>,
}

/// A similarity search hit. `similarity` is cosine similarity in [0, 1]
/// (higher is better).
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    pub similarity: f32,
}

struct Inner {
    conn: Connection,
    index: Option<Index>,
    dimensions: usize,
    id_to_key: HashMap<String, u64>,
    key_to_id: HashMap<u64, String>,
    next_key: u64,
    capacity: usize,
}

/// Embedding collection with metadata filtering.
pub struct VectorStore {
    inner: Mutex<Inner>,
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

impl VectorStore {
    /// Open (or create) the store at the given SQLite path and rebuild the
    /// ANN index from the persisted rows.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                id        TEXT PRIMARY KEY,
                document  TEXT NOT NULL,
                metadata  TEXT NOT NULL,
                embedding BLOB
            );",
        )?;

        let mut inner = Inner {
            conn,
            index: None,
            dimensions: 0,
            id_to_key: HashMap::new(),
            key_to_id: HashMap::new(),
            next_key: 0,
            capacity: 0,
        };
        inner.rebuild_index()?;

        debug!(entries = inner.id_to_key.len(), "vector store opened");
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// In-memory store (tests, ephemeral usage).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                id        TEXT PRIMARY KEY,
                document  TEXT NOT NULL,
                metadata  TEXT NOT NULL,
                embedding BLOB
            );",
        )?;
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                index: None,
                dimensions: 0,
                id_to_key: HashMap::new(),
                key_to_id: HashMap::new(),
                next_key: 0,
                capacity: 0,
            }),
        })
    }

    /// Add an entry. Replaces any existing entry with the same id.
    pub fn add(
        &self,
        id: &str,
        embedding: &[f32],
        metadata: &Metadata,
        document: &str,
    ) -> Result<()> {
        if id.is_empty() {
            return Err(StorageError::InvalidInput("empty entry id".to_string()));
        }

        let mut inner = self.inner.lock().expect("vector store lock poisoned");

        if !embedding.is_empty() {
            if inner.dimensions == 0 {
                inner.init_index(embedding.len())?;
            } else if embedding.len() != inner.dimensions {
                return Err(StorageError::InvalidInput(format!(
                    "embedding dimensions {} do not match collection dimensions {}",
                    embedding.len(),
                    inner.dimensions
                )));
            }
        }

        let metadata_json = serde_json::to_string(metadata)
            .map_err(|e| StorageError::InvalidInput(e.to_string()))?;
        let blob = if embedding.is_empty() {
            None
        } else {
            Some(Embedding::new(embedding.to_vec()).to_bytes())
        };

        inner.conn.execute(
            "INSERT OR REPLACE INTO entries (id, document, metadata, embedding)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, document, metadata_json, blob],
        )?;

        // Keep the ANN index in sync: drop a stale key before re-adding.
        if let Some(old_key) = inner.id_to_key.remove(id) {
            inner.key_to_id.remove(&old_key);
            if let Some(index) = &inner.index {
                let _ = index.remove(old_key);
            }
        }
        if !embedding.is_empty() {
            inner.index_add(id, embedding)?;
        }

        Ok(())
    }

    /// Search for the `top_k` most similar entries.
    ///
    /// Multi-key filters are AND over scalar metadata equality. An empty
    /// collection yields an empty list, not an error.
    pub fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        filter_metadata: Option<&Metadata>,
    ) -> Result<Vec<VectorHit>> {
        let inner = self.inner.lock().expect("vector store lock poisoned");

        if top_k == 0 || inner.id_to_key.is_empty() {
            return Ok(vec![]);
        }

        let has_filter = filter_metadata.map(|f| !f.is_empty()).unwrap_or(false);
        if has_filter || inner.index.is_none() {
            return inner.exact_search(query_embedding, top_k, filter_metadata);
        }

        inner.ann_search(query_embedding, top_k)
    }

    /// Get a single entry (with its embedding) by id.
    pub fn get(&self, id: &str) -> Result<Option<StoredEntry>> {
        let inner = self.inner.lock().expect("vector store lock poisoned");
        let row = inner
            .conn
            .query_row(
                "SELECT document, metadata, embedding FROM entries WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<Vec<u8>>>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((document, metadata_json, blob)) => Ok(Some(StoredEntry {
                id: id.to_string(),
                content: document,
                metadata: decode_metadata(&metadata_json)?,
                embedding: blob.and_then(|b| Embedding::from_bytes(&b)).map(|e| e.vector),
            })),
            None => Ok(None),
        }
    }

    /// Merge the provided keys into an entry's metadata.
    pub fn update_metadata(&self, id: &str, patch: &Metadata) -> Result<()> {
        let inner = self.inner.lock().expect("vector store lock poisoned");
        let existing: Option<String> = inner
            .conn
            .query_row(
                "SELECT metadata FROM entries WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(metadata_json) = existing else {
            return Err(StorageError::NotFound(id.to_string()));
        };

        let mut metadata = decode_metadata(&metadata_json)?;
        for (key, value) in patch {
            metadata.insert(key.clone(), value.clone());
        }

        let updated = serde_json::to_string(&metadata)
            .map_err(|e| StorageError::InvalidInput(e.to_string()))?;
        inner.conn.execute(
            "UPDATE entries SET metadata = ?1 WHERE id = ?2",
            params![updated, id],
        )?;
        Ok(())
    }

    /// Delete an entry. Deleting an unknown id is a no-op.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("vector store lock poisoned");
        inner.conn.execute("DELETE FROM entries WHERE id = ?1", params![id])?;

        if let Some(key) = inner.id_to_key.remove(id) {
            inner.key_to_id.remove(&key);
            if let Some(index) = &inner.index {
                let _ = index.remove(key);
            }
        }
        Ok(())
    }

    /// List entries whose metadata matches every key of `filter` exactly.
    pub fn list_by_metadata(
        &self,
        filter: &Metadata,
        include_documents: bool,
        include_embeddings: bool,
    ) -> Result<Vec<StoredEntry>> {
        let inner = self.inner.lock().expect("vector store lock poisoned");
        let mut stmt = inner
            .conn
            .prepare("SELECT id, document, metadata, embedding FROM entries ORDER BY rowid")?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<Vec<u8>>>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, document, metadata_json, blob) = row?;
            let metadata = decode_metadata(&metadata_json)?;
            if !matches_filter(&metadata, filter) {
                continue;
            }
            entries.push(StoredEntry {
                id,
                content: if include_documents { document } else { String::new() },
                metadata,
                embedding: if include_embeddings {
                    blob.and_then(|b| Embedding::from_bytes(&b)).map(|e| e.vector)
                } else {
                    None
                },
            });
        }
        Ok(entries)
    }

    /// Total number of entries.
    pub fn count(&self) -> Result<usize> {
        let inner = self.inner.lock().expect("vector store lock poisoned");
        let count: i64 = inner
            .conn
            .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl Inner {
    fn init_index(&mut self, dimensions: usize) -> Result<()> {
        let options = IndexOptions {
            dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: CONNECTIVITY,
            expansion_add: EXPANSION_ADD,
            expansion_search: EXPANSION_SEARCH,
            multi: false,
        };
        let index = Index::new(&options).map_err(|e| StorageError::Index(e.to_string()))?;
        index
            .reserve(INITIAL_CAPACITY)
            .map_err(|e| StorageError::Index(e.to_string()))?;
        self.capacity = INITIAL_CAPACITY;
        self.dimensions = dimensions;
        self.index = Some(index);
        Ok(())
    }

    fn index_add(&mut self, id: &str, embedding: &[f32]) -> Result<()> {
        let key = self.next_key;
        self.next_key += 1;

        if let Some(index) = &self.index {
            if index.size() + 1 > self.capacity {
                let new_capacity = (self.capacity * 2).max(INITIAL_CAPACITY);
                index
                    .reserve(new_capacity)
                    .map_err(|e| StorageError::Index(e.to_string()))?;
                self.capacity = new_capacity;
            }
            index
                .add(key, embedding)
                .map_err(|e| StorageError::Index(e.to_string()))?;
        }

        self.id_to_key.insert(id.to_string(), key);
        self.key_to_id.insert(key, id.to_string());
        Ok(())
    }

    fn rebuild_index(&mut self) -> Result<()> {
        let rows: Vec<(String, Option<Vec<u8>>)> = {
            let mut stmt = self
                .conn
                .prepare("SELECT id, embedding FROM entries ORDER BY rowid")?;
            let mapped = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<Vec<u8>>>(1)?))
            })?;
            mapped.collect::<std::result::Result<_, _>>()?
        };

        for (id, blob) in rows {
            let Some(embedding) = blob.and_then(|b| Embedding::from_bytes(&b)) else {
                // Entry without a usable embedding stays searchable by metadata only
                self.register_without_vector(&id);
                continue;
            };
            if self.dimensions == 0 {
                self.init_index(embedding.dimensions)?;
            }
            if embedding.dimensions != self.dimensions {
                warn!(id = %id, "skipping entry with mismatched embedding dimensions");
                self.register_without_vector(&id);
                continue;
            }
            self.index_add(&id, &embedding.vector)?;
        }
        Ok(())
    }

    fn register_without_vector(&mut self, id: &str) {
        let key = self.next_key;
        self.next_key += 1;
        self.id_to_key.insert(id.to_string(), key);
        self.key_to_id.insert(key, id.to_string());
    }

    fn ann_search(&self, query: &[f32], top_k: usize) -> Result<Vec<VectorHit>> {
        let index = self.index.as_ref().expect("ann_search without index");
        if query.len() != self.dimensions {
            return Err(StorageError::InvalidInput(format!(
                "query dimensions {} do not match collection dimensions {}",
                query.len(),
                self.dimensions
            )));
        }

        let matches = index
            .search(query, top_k.min(index.size().max(1)))
            .map_err(|e| StorageError::Index(e.to_string()))?;

        let mut hits = Vec::with_capacity(matches.keys.len());
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            let Some(id) = self.key_to_id.get(key) else {
                continue;
            };
            let row: Option<(String, String)> = self
                .conn
                .query_row(
                    "SELECT document, metadata FROM entries WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((document, metadata_json)) = row else {
                continue;
            };
            hits.push(VectorHit {
                id: id.clone(),
                content: document,
                metadata: decode_metadata(&metadata_json)?,
                similarity: (1.0 - distance).clamp(0.0, 1.0),
            });
        }
        Ok(hits)
    }

    /// Exact cosine scan over rows surviving the metadata filter.
    fn exact_search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&Metadata>,
    ) -> Result<Vec<VectorHit>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, document, metadata, embedding FROM entries ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<Vec<u8>>>(3)?,
            ))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            let (id, document, metadata_json, blob) = row?;
            let metadata = decode_metadata(&metadata_json)?;
            if let Some(filter) = filter {
                if !matches_filter(&metadata, filter) {
                    continue;
                }
            }
            let Some(embedding) = blob.and_then(|b| Embedding::from_bytes(&b)) else {
                continue;
            };
            let similarity = cosine_similarity(query, &embedding.vector).clamp(0.0, 1.0);
            hits.push(VectorHit {
                id,
                content: document,
                metadata,
                similarity,
            });
        }

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);
        Ok(hits)
    }
}

fn decode_metadata(json: &str) -> Result<Metadata> {
    serde_json::from_str(json).map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn matches_filter(metadata: &Metadata, filter: &Metadata) -> bool {
    filter.iter().all(|(key, expected)| {
        metadata
            .get(key)
            .map(|actual| metadata_value_eq(actual, expected))
            .unwrap_or(false)
    })
}

fn metadata_value_eq(a: &MetadataValue, b: &MetadataValue) -> bool {
    match (a, b) {
        (MetadataValue::Int(x), MetadataValue::Float(y))
        | (MetadataValue::Float(y), MetadataValue::Int(x)) => (*x as f64) == *y,
        _ => a == b,
    }
}

// ============================================================================
// TESTS
// ============================================================================
