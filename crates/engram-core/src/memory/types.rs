//! Memory record types
//!
//! A `Memory` owns its `Chunk`s. Chunks carry ids of the form
//! `<memory_id>-chunk-<index>`; the memory-level indexed entry uses the id
//! `<memory_id>-metadata` and is flagged with `is_memory_entry=true`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Id suffix of memory-level indexed entries (as opposed to chunk entries).
pub const MEMORY_METADATA_SUFFIX: &str = "-metadata";

// ============================================================================
// SCHEMA KINDS
// ============================================================================

/// Schema classification of a memory
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SchemaType {
    /// Bug reports, errors, troubleshooting
    Incident,
    /// Code examples with usage context
    Snippet,
    /// Architectural choices, trade-offs
    Decision,
    /// Thought processes, learning, experimentation
    #[default]
    Process,
}

impl SchemaType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaType::Incident => "Incident",
            SchemaType::Snippet => "Snippet",
            SchemaType::Decision => "Decision",
            SchemaType::Process => "Process",
        }
    }

    /// Parse from string name; unknown values fall back to Process
    pub fn parse_name(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "incident" => SchemaType::Incident,
            "snippet" => SchemaType::Snippet,
            "decision" => SchemaType::Decision,
            _ => SchemaType::Process,
        }
    }
}

impl std::fmt::Display for SchemaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// MEMORY TIERS
// ============================================================================

/// Lifecycle tier of a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// Fresh memories, hours-scale retention
    #[default]
    Working,
    /// Consolidated memories, days/weeks-scale
    ShortTerm,
    /// Durable memories
    LongTerm,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::Working => "working",
            MemoryTier::ShortTerm => "short_term",
            MemoryTier::LongTerm => "long_term",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "short_term" => MemoryTier::ShortTerm,
            "long_term" => MemoryTier::LongTerm,
            _ => MemoryTier::Working,
        }
    }

    /// Half-life multiplier used by recency scoring.
    /// Older tiers decay slower so consolidated knowledge stays reachable.
    pub fn half_life_multiplier(&self) -> f64 {
        match self {
            MemoryTier::Working => 1.0,
            MemoryTier::ShortTerm => 3.0,
            MemoryTier::LongTerm => 6.0,
        }
    }

    /// Dedup priority (lower wins when collapsing duplicate candidates).
    pub fn priority(&self) -> i32 {
        match self {
            MemoryTier::Working => 0,
            MemoryTier::ShortTerm => 1,
            MemoryTier::LongTerm => 2,
        }
    }
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// METADATA (scalar-only map)
// ============================================================================

/// A scalar metadata value.
///
/// Indexed-entry metadata is restricted to scalars; nested values and nulls
/// are dropped at the serialization boundary (see [`sanitize_metadata`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Int(i) => Some(*i as f64),
            MetadataValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(i) => Some(*i),
            MetadataValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetadataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Str(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Str(s)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Int(i)
    }
}

impl From<f64> for MetadataValue {
    fn from(f: f64) -> Self {
        MetadataValue::Float(f)
    }
}

/// Scalar-only metadata map attached to indexed entries.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Reduce a free-form JSON object to a scalar-only metadata map.
///
/// Nested objects, arrays, and nulls are dropped. The operation is
/// idempotent: sanitizing an already-sanitized map is a no-op.
pub fn sanitize_metadata(raw: &serde_json::Map<String, serde_json::Value>) -> Metadata {
    let mut out = Metadata::new();
    for (key, value) in raw {
        match value {
            serde_json::Value::Bool(b) => {
                out.insert(key.clone(), MetadataValue::Bool(*b));
            }
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    out.insert(key.clone(), MetadataValue::Int(i));
                } else if let Some(f) = n.as_f64() {
                    out.insert(key.clone(), MetadataValue::Float(f));
                }
            }
            serde_json::Value::String(s) => {
                out.insert(key.clone(), MetadataValue::Str(s.clone()));
            }
            // Nested / null values are not representable in entry metadata
            serde_json::Value::Null
            | serde_json::Value::Array(_)
            | serde_json::Value::Object(_) => {}
        }
    }
    out
}

// ============================================================================
// MEMORY
// ============================================================================

/// A conversational memory record
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Stable opaque id (`mem-<12 hex>`)
    pub id: String,
    /// Schema kind
    pub schema_type: SchemaType,
    /// Original content (markdown)
    pub content: String,
    /// Short summary (<= 100 tokens)
    pub summary: String,
    /// Source references (URLs, file paths)
    pub refs: Vec<String>,
    /// When the memory was created (UTC)
    pub created_at: DateTime<Utc>,
    /// When the memory was last modified (UTC)
    pub updated_at: DateTime<Utc>,
    /// Retention strength in [0, 1]; boosted on access
    pub strength: f64,
    /// Importance in [0, 1]; recomputed from usage
    pub importance: f64,
    /// Categorization tags
    pub tags: Vec<String>,
    /// Free-form scalar metadata
    pub metadata: Metadata,
    /// Lifecycle tier
    pub tier: MemoryTier,
    /// Cluster assignment from consolidation
    pub cluster_id: Option<String>,
    /// Whether this memory represents its cluster
    pub is_representative: bool,
    /// Owning project, if any
    pub project_id: Option<String>,
}

impl Memory {
    /// Id of the memory-level indexed entry for this memory.
    pub fn metadata_entry_id(&self) -> String {
        format!("{}{}", self.id, MEMORY_METADATA_SUFFIX)
    }
}

// ============================================================================
// CHUNK
// ============================================================================

/// A bounded-length piece of a memory's content.
///
/// Created alongside its memory and destroyed with it; never independently
/// mutated except for metadata recomputation on reindex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// `<memory_id>-chunk-<index>`
    pub id: String,
    /// Back-reference to the owning memory
    pub memory_id: String,
    /// Textual payload
    pub content: String,
    /// Token count under the fixed chunker tokenizer
    pub tokens: usize,
    /// Embedding vector, attached by the indexer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Metadata inherited from the parent memory
    pub metadata: Metadata,
}

impl Chunk {
    /// Build the stable chunk id for a memory and index.
    pub fn make_id(memory_id: &str, index: usize) -> String {
        format!("{memory_id}-chunk-{index}")
    }
}

// ============================================================================
// CONVERSATION PAYLOAD
// ============================================================================

/// An ingestable dialogue turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    /// User message
    pub user: String,
    /// Assistant response
    pub assistant: String,
    /// ISO 8601 timestamp; defaults to ingestion time when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Origin tag (`cli`, `session`, ...)
    pub source: String,
    /// Source references
    #[serde(default)]
    pub refs: Vec<String>,
    /// Free-form metadata, sanitized to scalars at ingestion
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Project association
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

// ============================================================================
// TESTS
// ============================================================================
