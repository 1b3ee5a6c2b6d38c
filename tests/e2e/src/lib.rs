//! End-to-end test support
//!
//! - `harness` - a fully wired engine over a temporary data directory
//! - `mocks` - deterministic model backends (no network, no model files)

pub mod harness;
pub mod mocks;

pub use harness::TestEngine;
pub use mocks::{bag_of_words_embedding, ScriptedModel};
