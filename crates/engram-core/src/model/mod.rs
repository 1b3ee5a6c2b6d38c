//! Model Gateway
//!
//! Task-routed access to two model tiers:
//! - **local** - Ollama HTTP API (embeddings + short generation)
//! - **cloud** - external CLI child process (long generation / reasoning)
//!
//! Routing follows a fixed table keyed by task kind. Embedding and
//! classification are forced local; heavyweight tasks go to the cloud tier
//! with automatic local fallback unless the caller disables it.
//!
//! Backends are trait objects so tests can inject deterministic stubs.

mod cli;
pub mod embedding;
mod local;

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

pub use cli::CliModelClient;
pub use embedding::{cosine_similarity, dot_product, Embedding};
pub use local::OllamaClient;

/// Environment sentinel set in cloud CLI children to prevent external
/// recorders from re-ingesting the engine's own internal calls.
pub const INTERNAL_CALL_SENTINEL: &str = "CONTEXT_ORCHESTRATOR_INTERNAL";

/// Default per-call timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Model gateway error types
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ModelError {
    /// Backend unreachable or returned a failure
    #[error("model unavailable: {0}")]
    Unavailable(String),

    /// Call exceeded its timeout
    #[error("model call timed out after {0} s")]
    Timeout(u64),

    /// Backend returned something unparseable
    #[error("invalid model response: {0}")]
    InvalidResponse(String),

    /// Bad request parameters
    #[error("invalid model input: {0}")]
    InvalidInput(String),
}

// ============================================================================
// TASK ROUTING
// ============================================================================

/// Task kinds understood by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Embedding,
    Classification,
    ShortSummary,
    LongSummary,
    Reasoning,
    Consolidation,
}

/// Target tier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Cloud,
}

impl TaskKind {
    /// Fixed routing table. Embedding and classification never leave the
    /// local tier; heavyweight tasks prefer the cloud tier.
    pub fn default_route(&self) -> Route {
        match self {
            TaskKind::Embedding => Route::Local,
            TaskKind::Classification => Route::Local,
            TaskKind::ShortSummary => Route::Local,
            TaskKind::LongSummary => Route::Cloud,
            TaskKind::Reasoning => Route::Cloud,
            TaskKind::Consolidation => Route::Cloud,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Embedding => "embedding",
            TaskKind::Classification => "classification",
            TaskKind::ShortSummary => "short_summary",
            TaskKind::LongSummary => "long_summary",
            TaskKind::Reasoning => "reasoning",
            TaskKind::Consolidation => "consolidation",
        }
    }
}

// ============================================================================
// BACKEND TRAITS
// ============================================================================

/// Text generation backend (blocking).
pub trait GenerationBackend: Send + Sync {
    fn generate(
        &self,
        prompt: &str,
        max_tokens: Option<u32>,
        temperature: f32,
        timeout: Duration,
    ) -> Result<String, ModelError>;
}

/// Embedding backend (blocking).
pub trait EmbeddingBackend: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError>;
}

// ============================================================================
// GENERATION OPTIONS
// ============================================================================

/// Per-call generation options.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_tokens: Option<u32>,
    pub temperature: f32,
    /// Override the routing table (language policy uses this)
    pub force_routing: Option<Route>,
    /// Fall back to the local tier when the cloud tier fails
    pub fallback_to_local: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: 0.7,
            force_routing: None,
            fallback_to_local: true,
        }
    }
}

// ============================================================================
// MODEL ROUTER
// ============================================================================

/// Router selecting the model tier per task kind.
pub struct ModelRouter {
    embedder: Box<dyn EmbeddingBackend>,
    local: Box<dyn GenerationBackend>,
    cloud: Option<Box<dyn GenerationBackend>>,
    timeout: Duration,
}

impl ModelRouter {
    pub fn new(
        embedder: Box<dyn EmbeddingBackend>,
        local: Box<dyn GenerationBackend>,
        cloud: Option<Box<dyn GenerationBackend>>,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            local,
            cloud,
            timeout,
        }
    }

    /// Route a generation task to the appropriate tier.
    pub fn route(
        &self,
        task: TaskKind,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> Result<String, ModelError> {
        if task == TaskKind::Embedding {
            return Err(ModelError::InvalidInput(
                "embedding tasks use generate_embedding".to_string(),
            ));
        }

        let routing = opts.force_routing.unwrap_or_else(|| task.default_route());
        debug!(task = task.as_str(), route = ?routing, "routing generation task");

        match routing {
            Route::Local => self
                .local
                .generate(prompt, opts.max_tokens, opts.temperature, self.timeout),
            Route::Cloud => {
                let cloud = match &self.cloud {
                    Some(cloud) => cloud,
                    None => {
                        // No cloud tier configured; the local tier covers it
                        return self.local.generate(
                            prompt,
                            opts.max_tokens,
                            opts.temperature,
                            self.timeout,
                        );
                    }
                };
                match cloud.generate(prompt, opts.max_tokens, opts.temperature, self.timeout) {
                    Ok(text) => Ok(text),
                    Err(err) if opts.fallback_to_local => {
                        warn!("cloud generation failed, falling back to local: {err}");
                        self.local
                            .generate(prompt, opts.max_tokens, opts.temperature, self.timeout)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Generate an embedding (always local).
    pub fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        self.embedder.embed(text)
    }

    /// Whether a task stays on the local tier.
    pub fn is_lightweight_task(&self, task: TaskKind) -> bool {
        task.default_route() == Route::Local
    }

    /// Configured per-call timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

// ============================================================================
// TEST SUPPORT
// ============================================================================


// ============================================================================
// TESTS
// ============================================================================
