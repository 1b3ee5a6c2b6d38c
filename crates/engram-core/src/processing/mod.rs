//! Processing Module
//!
//! Turns raw conversation text into indexed chunks:
//! - `chunker` - deterministic markdown splitter with a token budget
//! - `classifier` - schema classification via the model gateway
//! - `indexer` - dual writes into the vector store and the BM25 index

mod chunker;
mod classifier;
mod indexer;

pub use chunker::{format_conversation, Chunker, DEFAULT_MAX_TOKENS};
pub use classifier::SchemaClassifier;
pub use indexer::{salience_weight, Indexer};
