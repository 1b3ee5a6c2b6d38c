//! Engine Assembly
//!
//! Builds the full service stack over a data directory, in dependency
//! order: stores -> gateway -> indexer -> reranker -> pool -> orchestrator
//! -> session coordinator.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use engram_core::{
    Bm25Index, BookmarkStore, Chunker, CliModelClient, ConsolidationService, CrossEncoderReranker,
    EngineConfig, GenerationBackend, Indexer, IngestionService, ModelRouter, OllamaClient,
    ProjectMemoryPool, ProjectStore, QueryAttributeExtractor, SearchService, SessionCoordinator,
    VectorStore,
};

use crate::sessionlog::SessionLogWriter;

/// The assembled service stack.
pub struct Engine {
    pub config: EngineConfig,
    pub ingestion: Arc<IngestionService>,
    pub search: Arc<SearchService>,
    pub consolidation: Arc<ConsolidationService>,
    pub sessions: Arc<SessionCoordinator>,
    pub projects: Arc<ProjectStore>,
    pub bookmarks: Arc<BookmarkStore>,
    pub reranker: Arc<CrossEncoderReranker>,
    pub pool: Arc<ProjectMemoryPool>,
    pub session_logs: SessionLogWriter,
}

impl Engine {
    /// Initialize every service over the given data directory.
    pub fn init(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        let config = EngineConfig::load(data_dir);

        // Stores
        let vector = Arc::new(
            VectorStore::open(data_dir.join("memories.db")).context("opening vector store")?,
        );
        let bm25 = Arc::new(Bm25Index::open(data_dir.join("bm25_index.bin")));
        let projects = Arc::new(ProjectStore::open(data_dir.join("projects.json")));
        let bookmarks = Arc::new(BookmarkStore::open(data_dir.join("bookmarks.json")));

        // Model gateway
        let timeout = Duration::from_secs(config.model.timeout_seconds);
        let embedder = OllamaClient::new(
            config.model.base_url.clone(),
            config.model.embedding_model.clone(),
            config.model.inference_model.clone(),
            timeout,
        )
        .context("building embedding client")?;
        let local = OllamaClient::new(
            config.model.base_url.clone(),
            config.model.embedding_model.clone(),
            config.model.inference_model.clone(),
            timeout,
        )
        .context("building local generation client")?;
        let cloud: Option<Box<dyn GenerationBackend>> = if config.model.cloud_command.is_empty() {
            None
        } else {
            Some(Box::new(CliModelClient::new(config.model.cloud_command.clone())))
        };
        let router = Arc::new(ModelRouter::new(
            Box::new(embedder),
            Box::new(local),
            cloud,
            timeout,
        ));

        // Indexing and retrieval stack
        let indexer = Arc::new(Indexer::new(vector.clone(), bm25.clone(), router.clone()));
        let reranker = Arc::new(CrossEncoderReranker::new(
            router.clone(),
            config.cross_encoder.clone(),
        ));
        let pool = Arc::new(ProjectMemoryPool::new(
            vector.clone(),
            router.clone(),
            config.pool.size,
            config.pool.ttl_seconds,
        ));
        let attributes = QueryAttributeExtractor::new(
            Some(router.clone()),
            config.search.min_llm_confidence,
            true,
        );
        let search = Arc::new(SearchService::new(
            vector.clone(),
            bm25.clone(),
            router.clone(),
            Some(projects.clone()),
            attributes,
            Some(reranker.clone()),
            config.search.candidate_count,
            config.search.result_count,
            config.search.recency_half_life_hours,
        ));
        let consolidation = Arc::new(ConsolidationService::new(
            vector.clone(),
            indexer.clone(),
            config.consolidation.clone(),
            config.working_memory.retention_hours,
        ));
        let ingestion = Arc::new(IngestionService::new(
            vector.clone(),
            Chunker::new(),
            indexer,
            router.clone(),
            Some(projects.clone()),
            config.model.supported_languages.clone(),
        ));
        let sessions = Arc::new(SessionCoordinator::new(
            ingestion.clone(),
            router,
            search.clone(),
            Some(pool.clone()),
            Some(reranker.clone()),
            Some(projects.clone()),
            config.session.prefetch_confidence,
        ));

        let session_logs = SessionLogWriter::new(data_dir, config.session.max_log_size_mb);

        info!(data_dir = %data_dir.display(), "engine initialized");
        Ok(Self {
            config,
            ingestion,
            search,
            consolidation,
            sessions,
            projects,
            bookmarks,
            reranker,
            pool,
            session_logs,
        })
    }
}
