//! Memory Model
//!
//! Core record types shared across the engine:
//! - `Memory` - the unit of recall (schema kind, summary, tier, strength)
//! - `Chunk` - bounded-length piece of a memory used for indexing
//! - `Metadata` - scalar-only key/value map attached to indexed entries

mod types;

pub use types::{
    sanitize_metadata, Chunk, Conversation, Memory, MemoryTier, Metadata, MetadataValue,
    SchemaType, MEMORY_METADATA_SUFFIX,
};
