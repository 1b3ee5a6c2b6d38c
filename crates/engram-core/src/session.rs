//! Session Coordinator
//!
//! Tracks terminal/CLI working sessions: the command log, a project hint
//! with confidence, and a one-shot prefetch guard. When a hint becomes
//! confident enough, the project pool warms the reranker's semantic cache
//! and a warm-up search runs - on a background thread, so `add_command`
//! never blocks on it.
//!
//! Ending a session packages the command log into a conversation payload
//! and feeds the ingestion pipeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::ingestion::IngestionService;
use crate::memory::{Conversation, Metadata};
use crate::model::{GenerateOptions, ModelRouter, TaskKind};
use crate::search::{CrossEncoderReranker, ProjectMemoryPool, SearchService};
use crate::storage::ProjectStore;

/// Hint source tag used by explicit RPC assignment; always overwrites.
pub const MANUAL_RPC_SOURCE: &str = "manual_rpc";

// ============================================================================
// TYPES
// ============================================================================

/// A session-scoped project hint.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectHint {
    pub name: String,
    pub project_id: Option<String>,
    pub confidence: f64,
    pub source: String,
}

/// One executed command inside a session.
#[derive(Debug, Clone, Serialize)]
pub struct CommandEntry {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub output: String,
    pub exit_code: i32,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
struct SessionState {
    id: String,
    started_at: DateTime<Utc>,
    commands: Vec<CommandEntry>,
    last_activity: DateTime<Utc>,
    project_hint: Option<ProjectHint>,
    prefetch_done: bool,
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// Active-session registry with prefetch coordination.
pub struct SessionCoordinator {
    ingestion: Arc<IngestionService>,
    router: Arc<ModelRouter>,
    search: Arc<SearchService>,
    pool: Option<Arc<ProjectMemoryPool>>,
    reranker: Option<Arc<CrossEncoderReranker>>,
    projects: Option<Arc<ProjectStore>>,
    sessions: Mutex<HashMap<String, SessionState>>,
    prefetch_confidence: f64,
}

impl SessionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ingestion: Arc<IngestionService>,
        router: Arc<ModelRouter>,
        search: Arc<SearchService>,
        pool: Option<Arc<ProjectMemoryPool>>,
        reranker: Option<Arc<CrossEncoderReranker>>,
        projects: Option<Arc<ProjectStore>>,
        prefetch_confidence: f64,
    ) -> Self {
        Self {
            ingestion,
            router,
            search,
            pool,
            reranker,
            projects,
            sessions: Mutex::new(HashMap::new()),
            prefetch_confidence,
        }
    }

    /// Start a session, generating an id when none is supplied.
    pub fn start_session(&self, session_id: Option<String>) -> String {
        let session_id = session_id
            .unwrap_or_else(|| format!("session-{}", &Uuid::new_v4().simple().to_string()[..12]));

        let now = Utc::now();
        self.sessions.lock().expect("session lock").insert(
            session_id.clone(),
            SessionState {
                id: session_id.clone(),
                started_at: now,
                commands: vec![],
                last_activity: now,
                project_hint: None,
                prefetch_done: false,
            },
        );

        info!(session_id, "started session");
        session_id
    }

    /// Record a command. Returns false for unknown sessions. May trigger a
    /// background project prefetch; the caller never waits on it.
    pub fn add_command(
        &self,
        session_id: &str,
        command: &str,
        output: &str,
        exit_code: i32,
        metadata: Option<Metadata>,
    ) -> bool {
        {
            let mut sessions = self.sessions.lock().expect("session lock");
            let Some(session) = sessions.get_mut(session_id) else {
                warn!(session_id, "session not found");
                return false;
            };
            session.commands.push(CommandEntry {
                timestamp: Utc::now(),
                command: command.to_string(),
                output: output.to_string(),
                exit_code,
                metadata: metadata.unwrap_or_default(),
            });
            session.last_activity = Utc::now();
        }

        self.maybe_trigger_prefetch(session_id);
        true
    }

    /// Current project hint.
    pub fn get_project_hint(&self, session_id: &str) -> Option<ProjectHint> {
        let sessions = self.sessions.lock().expect("session lock");
        sessions.get(session_id)?.project_hint.clone()
    }

    /// Set the project hint. Only overwrites when the incoming confidence is
    /// higher, or the source is `manual_rpc`.
    pub fn set_project_hint(
        &self,
        session_id: &str,
        name: &str,
        confidence: f64,
        source: &str,
    ) -> bool {
        let project_id = self
            .projects
            .as_ref()
            .and_then(|projects| projects.get_by_name(name))
            .map(|project| project.id);

        {
            let mut sessions = self.sessions.lock().expect("session lock");
            let Some(session) = sessions.get_mut(session_id) else {
                warn!(session_id, "session not found");
                return false;
            };

            if let Some(current) = &session.project_hint {
                if source != MANUAL_RPC_SOURCE && confidence <= current.confidence {
                    debug!(
                        session_id,
                        incoming = confidence,
                        current = current.confidence,
                        "keeping existing project hint"
                    );
                    return true;
                }
            }

            session.project_hint = Some(ProjectHint {
                name: name.to_string(),
                project_id,
                confidence: confidence.clamp(0.0, 1.0),
                source: source.to_string(),
            });
            info!(session_id, name, confidence, source, "project hint set");
        }

        self.maybe_trigger_prefetch(session_id);
        true
    }

    /// Clear the hint and re-arm the prefetch guard.
    pub fn clear_project_hint(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("session lock");
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        session.project_hint = None;
        session.prefetch_done = false;
        info!(session_id, "project hint cleared");
        true
    }

    /// End a session: ingest the command log as a memory and drop the
    /// session. The note-export flag is accepted for callers that mirror
    /// sessions into an external vault; the export itself is delegated.
    pub fn end_session(&self, session_id: &str, create_note: bool) -> Result<String> {
        let session = {
            let sessions = self.sessions.lock().expect("session lock");
            sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?
        };

        let session_log = format_session_log(&session);
        let summary = self.generate_session_summary(&session);

        let mut metadata = serde_json::Map::new();
        metadata.insert("session_id".to_string(), session.id.clone().into());
        metadata.insert(
            "command_count".to_string(),
            (session.commands.len() as u64).into(),
        );
        metadata.insert(
            "duration_seconds".to_string(),
            ((Utc::now() - session.started_at).num_seconds().max(0) as u64).into(),
        );
        metadata.insert("summary".to_string(), summary.into());

        let mut project_id = None;
        if let Some(hint) = &session.project_hint {
            metadata.insert("project".to_string(), hint.name.clone().into());
            if let Some(id) = &hint.project_id {
                metadata.insert("project_id".to_string(), id.clone().into());
                project_id = Some(id.clone());
            }
            metadata.insert(
                "project_hint_confidence".to_string(),
                serde_json::Number::from_f64(hint.confidence)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
            );
            metadata.insert(
                "project_hint_source".to_string(),
                hint.source.clone().into(),
            );
        }

        let conversation = Conversation {
            user: format!("Session {} commands", session.id),
            assistant: session_log,
            timestamp: Some(session.started_at.to_rfc3339()),
            source: "session".to_string(),
            refs: vec![format!("session://{}", session.id)],
            metadata,
            tags: vec![],
            project_id,
        };

        let memory_id = self.ingestion.ingest_conversation(&conversation)?;

        if create_note {
            debug!(session_id, %memory_id, "note export delegated to the vault exporter");
        }

        self.sessions.lock().expect("session lock").remove(session_id);
        info!(session_id, %memory_id, "ended session");
        Ok(memory_id)
    }

    /// Active session ids.
    pub fn list_active_sessions(&self) -> Vec<String> {
        self.sessions
            .lock()
            .expect("session lock")
            .keys()
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Prefetch
    // ------------------------------------------------------------------

    /// Fire the single-shot project prefetch when the hint is confident
    /// enough. Runs on a background thread; cache writes from a racing
    /// direct search remain valid either way.
    fn maybe_trigger_prefetch(&self, session_id: &str) {
        let hint = {
            let mut sessions = self.sessions.lock().expect("session lock");
            let Some(session) = sessions.get_mut(session_id) else {
                return;
            };
            let Some(hint) = &session.project_hint else {
                return;
            };
            if session.prefetch_done
                || hint.confidence < self.prefetch_confidence
                || hint.project_id.is_none()
            {
                return;
            }
            session.prefetch_done = true;
            hint.clone()
        };

        let project_id = hint.project_id.clone().expect("checked above");
        let search = Arc::clone(&self.search);
        let pool = self.pool.clone();
        let reranker = self.reranker.clone();
        let warm_query = hint.name.clone();

        info!(session_id, %project_id, "triggering project prefetch");
        std::thread::spawn(move || {
            if let (Some(pool), Some(reranker)) = (&pool, &reranker) {
                let stats = pool.warm_cache(reranker, &project_id);
                debug!(
                    %project_id,
                    entries = stats.cache_entries_added,
                    "pool warm-up finished"
                );
            }
            search.prefetch_project(&project_id, &[warm_query]);
        });
    }

    fn generate_session_summary(&self, session: &SessionState) -> String {
        let commands: Vec<&str> = session
            .commands
            .iter()
            .take(10)
            .map(|c| c.command.as_str())
            .collect();
        let prompt = format!(
            "Summarize this terminal session in 1-2 sentences.\n\
             Focus on what tasks were accomplished.\n\n\
             Session commands:\n{}\n\nSummary:",
            commands.join("\n")
        );

        let opts = GenerateOptions {
            max_tokens: Some(100),
            temperature: 0.7,
            ..Default::default()
        };
        match self.router.route(TaskKind::ShortSummary, &prompt, &opts) {
            Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
            _ => match session.commands.first() {
                Some(first) => format!(
                    "Session with {} commands: {}",
                    session.commands.len(),
                    first.command
                ),
                None => "Empty session".to_string(),
            },
        }
    }
}

/// Markdown transcript of a session's commands.
fn format_session_log(session: &SessionState) -> String {
    let mut lines = vec![
        format!("# Session {}", session.id),
        String::new(),
        format!("**Started**: {}", session.started_at.format("%Y-%m-%d %H:%M:%S")),
        format!("**Commands**: {}", session.commands.len()),
        String::new(),
        "## Commands".to_string(),
        String::new(),
    ];

    for (i, cmd) in session.commands.iter().enumerate() {
        let output: String = cmd.output.chars().take(1000).collect();
        lines.extend([
            format!("### Command {}: `{}`", i + 1, cmd.command),
            String::new(),
            format!("**Time**: {}", cmd.timestamp.to_rfc3339()),
            format!("**Exit Code**: {}", cmd.exit_code),
            String::new(),
            "**Output**:".to_string(),
            "```".to_string(),
            output,
            "```".to_string(),
            String::new(),
        ]);
    }

    lines.join("\n")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrossEncoderConfig;
    use crate::memory::{Metadata, MetadataValue};
    use crate::model::testing::fixed_router;
    use crate::processing::{Chunker, Indexer};
    use crate::search::QueryAttributeExtractor;
    use crate::storage::{Bm25Index, VectorStore};

    struct Fixture {
        coordinator: SessionCoordinator,
        vector: Arc<VectorStore>,
        reranker: Arc<CrossEncoderReranker>,
        projects: Arc<ProjectStore>,
    }

    fn fixture() -> Fixture {
        let vector = Arc::new(VectorStore::open_in_memory().unwrap());
        let bm25 = Arc::new(Bm25Index::in_memory());
        let router = Arc::new(fixed_router("0.7", vec![1.0, 0.0]));
        let projects = Arc::new(ProjectStore::in_memory());
        let indexer = Arc::new(Indexer::new(vector.clone(), bm25.clone(), router.clone()));
        let ingestion = Arc::new(IngestionService::new(
            vector.clone(),
            Chunker::new(),
            indexer,
            router.clone(),
            Some(projects.clone()),
            vec!["en".to_string()],
        ));
        let reranker = Arc::new(CrossEncoderReranker::new(
            router.clone(),
            CrossEncoderConfig::default(),
        ));
        let pool = Arc::new(ProjectMemoryPool::new(
            vector.clone(),
            router.clone(),
            100,
            3600,
        ));
        let search = Arc::new(SearchService::new(
            vector.clone(),
            bm25,
            router.clone(),
            Some(projects.clone()),
            QueryAttributeExtractor::new(None, 0.4, false),
            Some(reranker.clone()),
            50,
            10,
            24.0,
        ));

        Fixture {
            coordinator: SessionCoordinator::new(
                ingestion,
                router,
                search,
                Some(pool),
                Some(reranker.clone()),
                Some(projects.clone()),
                0.55,
            ),
            vector,
            reranker,
            projects,
        }
    }

    #[test]
    fn test_start_add_end_creates_memory() {
        let f = fixture();
        let session_id = f.coordinator.start_session(None);
        assert!(session_id.starts_with("session-"));

        assert!(f.coordinator.add_command(&session_id, "cargo test", "ok", 0, None));
        assert!(f.coordinator.add_command(&session_id, "git status", "clean", 0, None));

        let memory_id = f.coordinator.end_session(&session_id, false).unwrap();
        assert!(memory_id.starts_with("mem-"));
        assert!(f.coordinator.list_active_sessions().is_empty());

        let entry = f.vector.get(&format!("{memory_id}-metadata")).unwrap().unwrap();
        assert_eq!(entry.metadata["source"].as_str(), Some("session"));
        assert_eq!(entry.metadata["command_count"].as_i64(), Some(2));
        assert_eq!(entry.metadata["session_id"].as_str(), Some(session_id.as_str()));
    }

    #[test]
    fn test_unknown_session_operations() {
        let f = fixture();
        assert!(!f.coordinator.add_command("nope", "ls", "", 0, None));
        assert!(!f.coordinator.set_project_hint("nope", "P", 0.9, "auto"));
        assert!(!f.coordinator.clear_project_hint("nope"));
        assert!(f.coordinator.get_project_hint("nope").is_none());
        assert!(matches!(
            f.coordinator.end_session("nope", false),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_hint_overwrite_rules() {
        let f = fixture();
        let session_id = f.coordinator.start_session(None);

        assert!(f.coordinator.set_project_hint(&session_id, "First", 0.7, "auto"));
        // Lower confidence from an automatic source does not overwrite
        assert!(f.coordinator.set_project_hint(&session_id, "Second", 0.4, "auto"));
        assert_eq!(f.coordinator.get_project_hint(&session_id).unwrap().name, "First");

        // Higher confidence overwrites
        assert!(f.coordinator.set_project_hint(&session_id, "Third", 0.9, "auto"));
        assert_eq!(f.coordinator.get_project_hint(&session_id).unwrap().name, "Third");

        // manual_rpc always overwrites
        assert!(f.coordinator.set_project_hint(&session_id, "Manual", 0.1, MANUAL_RPC_SOURCE));
        let hint = f.coordinator.get_project_hint(&session_id).unwrap();
        assert_eq!(hint.name, "Manual");
        assert_eq!(hint.source, MANUAL_RPC_SOURCE);
    }

    #[test]
    fn test_clear_hint_rearms_prefetch() {
        let f = fixture();
        let session_id = f.coordinator.start_session(None);
        f.coordinator.set_project_hint(&session_id, "P", 0.8, "auto");
        assert!(f.coordinator.clear_project_hint(&session_id));
        assert!(f.coordinator.get_project_hint(&session_id).is_none());
    }

    #[test]
    fn test_confident_hint_triggers_prefetch_once() {
        let f = fixture();
        let project = f.projects.create("Warmed", "", vec![]).unwrap();

        // One memory entry in the project so the pool has something to load
        let mut metadata = Metadata::new();
        metadata.insert("project_id".to_string(), MetadataValue::Str(project.id.clone()));
        metadata.insert("is_memory_entry".to_string(), MetadataValue::Bool(true));
        metadata.insert(
            "created_at".to_string(),
            MetadataValue::Str(Utc::now().to_rfc3339()),
        );
        f.vector
            .add("mem-w-metadata", &[1.0, 0.0], &metadata, "warmed summary")
            .unwrap();

        let session_id = f.coordinator.start_session(None);
        f.coordinator.set_project_hint(&session_id, "Warmed", 0.8, "auto");

        // The prefetch runs on a background thread; give it a moment
        for _ in 0..100 {
            if f.reranker.metrics().semantic_cache_candidates > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(f.reranker.metrics().semantic_cache_candidates >= 1);

        // Guard is single-shot: a second confident hint does not re-warm
        let embeddings_before = f.reranker.metrics().semantic_cache_embeddings;
        f.coordinator.set_project_hint(&session_id, "Warmed", 0.95, "auto");
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(f.reranker.metrics().semantic_cache_embeddings, embeddings_before);
    }

    #[test]
    fn test_session_log_format() {
        let session = SessionState {
            id: "session-x".to_string(),
            started_at: Utc::now(),
            commands: vec![CommandEntry {
                timestamp: Utc::now(),
                command: "make build".to_string(),
                output: "done".to_string(),
                exit_code: 0,
            }],
            last_activity: Utc::now(),
            project_hint: None,
            prefetch_done: false,
        };
        let log = format_session_log(&session);
        assert!(log.starts_with("# Session session-x"));
        assert!(log.contains("### Command 1: `make build`"));
        assert!(log.contains("**Exit Code**: 0"));
    }
}
