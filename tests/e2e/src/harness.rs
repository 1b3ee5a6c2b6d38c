//! Test Engine Harness
//!
//! Wires the full service stack over a temporary data directory with
//! scripted model backends. The directory lives as long as the harness, so
//! every test runs fully isolated.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use engram_core::{
    Bm25Index, BookmarkStore, Chunker, ConsolidationConfig, ConsolidationService,
    CrossEncoderConfig, CrossEncoderReranker, Conversation, Indexer, IngestionService,
    ModelRouter, ProjectMemoryPool, ProjectStore, QueryAttributeExtractor, SearchService,
    SessionCoordinator, VectorStore,
};

use crate::mocks::ScriptedModel;

/// A fully wired engine over an isolated temporary directory.
pub struct TestEngine {
    pub vector: Arc<VectorStore>,
    pub bm25: Arc<Bm25Index>,
    pub router: Arc<ModelRouter>,
    pub indexer: Arc<Indexer>,
    pub reranker: Arc<CrossEncoderReranker>,
    pub pool: Arc<ProjectMemoryPool>,
    pub search: Arc<SearchService>,
    pub consolidation: Arc<ConsolidationService>,
    pub ingestion: Arc<IngestionService>,
    pub sessions: Arc<SessionCoordinator>,
    pub projects: Arc<ProjectStore>,
    pub bookmarks: Arc<BookmarkStore>,
    _temp_dir: TempDir,
}

impl TestEngine {
    /// Engine with default scripted replies and default configuration,
    /// except the simple-query shortcut which most journeys want off.
    pub fn new() -> Self {
        Self::with_config(CrossEncoderConfig {
            skip_rerank_for_simple_queries: false,
            ..Default::default()
        })
    }

    pub fn with_config(cross_encoder: CrossEncoderConfig) -> Self {
        let temp_dir = tempfile::tempdir().expect("temp dir");

        let vector =
            Arc::new(VectorStore::open(temp_dir.path().join("memories.db")).expect("vector store"));
        let bm25 = Arc::new(Bm25Index::open(temp_dir.path().join("bm25_index.bin")));
        let projects = Arc::new(ProjectStore::open(temp_dir.path().join("projects.json")));
        let bookmarks = Arc::new(BookmarkStore::open(temp_dir.path().join("bookmarks.json")));

        let router = Arc::new(ModelRouter::new(
            Box::new(ScriptedModel::default()),
            Box::new(ScriptedModel::default()),
            None,
            Duration::from_secs(5),
        ));

        let indexer = Arc::new(Indexer::new(vector.clone(), bm25.clone(), router.clone()));
        let reranker = Arc::new(CrossEncoderReranker::new(router.clone(), cross_encoder));
        let pool = Arc::new(ProjectMemoryPool::new(vector.clone(), router.clone(), 100, 3600));
        let search = Arc::new(SearchService::new(
            vector.clone(),
            bm25.clone(),
            router.clone(),
            Some(projects.clone()),
            QueryAttributeExtractor::new(None, 0.4, false),
            Some(reranker.clone()),
            50,
            10,
            24.0,
        ));
        let consolidation = Arc::new(ConsolidationService::new(
            vector.clone(),
            indexer.clone(),
            ConsolidationConfig::default(),
            8,
        ));
        let ingestion = Arc::new(IngestionService::new(
            vector.clone(),
            Chunker::new(),
            indexer.clone(),
            router.clone(),
            Some(projects.clone()),
            vec!["en".to_string()],
        ));
        let sessions = Arc::new(SessionCoordinator::new(
            ingestion.clone(),
            router.clone(),
            search.clone(),
            Some(pool.clone()),
            Some(reranker.clone()),
            Some(projects.clone()),
            0.55,
        ));

        Self {
            vector,
            bm25,
            router,
            indexer,
            reranker,
            pool,
            search,
            consolidation,
            ingestion,
            sessions,
            projects,
            bookmarks,
            _temp_dir: temp_dir,
        }
    }

    /// Ingest a simple (user, assistant) exchange from the given source.
    pub fn ingest(&self, user: &str, assistant: &str, source: &str) -> String {
        self.ingestion
            .ingest_conversation(&Conversation {
                user: user.to_string(),
                assistant: assistant.to_string(),
                source: source.to_string(),
                ..Default::default()
            })
            .expect("ingest")
    }

    /// Ingest an exchange associated with a project.
    pub fn ingest_in_project(
        &self,
        user: &str,
        assistant: &str,
        project_id: &str,
    ) -> String {
        self.ingestion
            .ingest_conversation(&Conversation {
                user: user.to_string(),
                assistant: assistant.to_string(),
                source: "cli".to_string(),
                project_id: Some(project_id.to_string()),
                ..Default::default()
            })
            .expect("ingest in project")
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
