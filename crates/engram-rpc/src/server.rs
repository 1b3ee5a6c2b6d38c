//! RPC Server
//!
//! Thin dispatch over the engine: parses params, calls the owning service,
//! and maps failures onto JSON-RPC error objects. Validation trouble becomes
//! `-32602`; unknown methods `-32601`; anything else `-32603` with the
//! detail string in `data`.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use engram_core::{
    sanitize_metadata, Conversation, EngineError, Metadata, MetadataValue, MANUAL_RPC_SOURCE,
};

use crate::engine::Engine;
use crate::protocol::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// JSON-RPC dispatch over the engine.
pub struct RpcServer {
    engine: Engine,
}

// ============================================================================
// PARAM SHAPES
// ============================================================================

#[derive(Deserialize)]
struct IngestParams {
    conversation: Conversation,
}

#[derive(Deserialize)]
struct SearchParams {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    filter_metadata: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct MemoryIdParams {
    memory_id: String,
}

#[derive(Deserialize)]
struct ListRecentParams {
    #[serde(default = "default_list_limit")]
    limit: usize,
    #[serde(default)]
    filter_metadata: Option<serde_json::Map<String, Value>>,
}

fn default_list_limit() -> usize {
    20
}

#[derive(Deserialize)]
struct StartSessionParams {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct EndSessionParams {
    session_id: String,
    #[serde(default)]
    create_note: bool,
}

#[derive(Deserialize)]
struct AddCommandParams {
    session_id: String,
    command: String,
    #[serde(default)]
    output: String,
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    metadata: Option<serde_json::Map<String, Value>>,
}

#[derive(Deserialize)]
struct SessionIdParams {
    session_id: String,
}

#[derive(Deserialize)]
struct SetProjectParams {
    session_id: String,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default, alias = "project_name", alias = "project_hint")]
    project: Option<String>,
    #[serde(default = "default_manual_confidence")]
    confidence: f64,
}

fn default_manual_confidence() -> f64 {
    0.99
}

#[derive(Deserialize)]
struct CreateProjectParams {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct ProjectIdParams {
    project_id: String,
}

#[derive(Deserialize)]
struct SearchInProjectParams {
    project_id: String,
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    filter_metadata: Option<serde_json::Map<String, Value>>,
}

#[derive(Deserialize)]
struct CreateBookmarkParams {
    name: String,
    query: String,
    #[serde(default)]
    filter_metadata: Option<serde_json::Map<String, Value>>,
}

#[derive(Deserialize)]
struct UseBookmarkParams {
    #[serde(default)]
    bookmark_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

// ============================================================================
// SERVER
// ============================================================================

impl RpcServer {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Handle one request, always producing a response.
    pub fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        debug!(method = %request.method, "handling request");

        let result = match request.method.as_str() {
            "ingest_conversation" => self.ingest_conversation(request.params),
            "search_memory" => self.search_memory(request.params),
            "get_memory" => self.get_memory(request.params),
            "list_recent_memories" => self.list_recent_memories(request.params),
            "consolidate_memories" => self.consolidate_memories(),
            "start_session" => self.start_session(request.params),
            "end_session" => self.end_session(request.params),
            "add_command" => self.add_command(request.params),
            "session_get_hint" => self.session_get_hint(request.params),
            "session_set_project" => self.session_set_project(request.params),
            "session_clear_project" => self.session_clear_project(request.params),
            "create_project" => self.create_project(request.params),
            "list_projects" => self.list_projects(),
            "get_project" => self.get_project(request.params),
            "delete_project" => self.delete_project(request.params),
            "search_in_project" => self.search_in_project(request.params),
            "create_bookmark" => self.create_bookmark(request.params),
            "list_bookmarks" => self.list_bookmarks(),
            "use_bookmark" => self.use_bookmark(request.params),
            "get_reranker_metrics" => self.get_reranker_metrics(),
            "get_search_stats" => self.get_search_stats(),
            method => {
                warn!(method, "unknown method");
                Err(JsonRpcError::method_not_found(method))
            }
        };

        match result {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(error) => JsonRpcResponse::error(request.id, error),
        }
    }

    // ------------------------------------------------------------------
    // Memory methods
    // ------------------------------------------------------------------

    fn ingest_conversation(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: IngestParams = parse_params(params)?;
        let memory_id = self
            .engine
            .ingestion
            .ingest_conversation(&params.conversation)
            .map_err(map_engine_error)?;
        Ok(json!({ "memory_id": memory_id }))
    }

    fn search_memory(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: SearchParams = parse_params(params)?;
        let mut filters = params.filter_metadata.as_ref().map(sanitize_metadata);

        // Inject the session's project hint unless the caller already scoped
        if let Some(session_id) = &params.session_id {
            filters = self.merge_session_filter(filters, session_id);
        }

        let results = self.engine.search.search(&params.query, params.top_k, filters);
        Ok(json!({ "count": results.len(), "results": results }))
    }

    fn merge_session_filter(
        &self,
        filters: Option<Metadata>,
        session_id: &str,
    ) -> Option<Metadata> {
        let Some(hint) = self.engine.sessions.get_project_hint(session_id) else {
            return filters;
        };
        if hint.confidence < self.engine.config.session.prefetch_confidence {
            return filters;
        }
        let Some(project_id) = hint.project_id else {
            return filters;
        };

        let mut merged = filters.unwrap_or_default();
        if !merged.contains_key("project_id") {
            debug!(session_id, %project_id, "applied session project filter");
            merged.insert("project_id".to_string(), MetadataValue::Str(project_id));
        }
        Some(merged)
    }

    fn get_memory(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: MemoryIdParams = parse_params(params)?;
        match self.engine.search.get_memory(&params.memory_id) {
            Some(details) => serde_json::to_value(details)
                .map_err(|e| JsonRpcError::internal_error(&e.to_string())),
            None => Err(JsonRpcError::internal_error(&format!(
                "memory not found: {}",
                params.memory_id
            ))),
        }
    }

    fn list_recent_memories(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: ListRecentParams = parse_params(params)?;
        let filters = params.filter_metadata.as_ref().map(sanitize_metadata);
        let memories = self.engine.search.list_recent(params.limit, filters);
        Ok(json!({ "count": memories.len(), "memories": memories }))
    }

    fn consolidate_memories(&self) -> Result<Value, JsonRpcError> {
        let stats = self.engine.consolidation.consolidate();
        serde_json::to_value(stats).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }

    // ------------------------------------------------------------------
    // Session methods
    // ------------------------------------------------------------------

    fn start_session(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: StartSessionParams = parse_params(params)?;
        let session_id = self.engine.sessions.start_session(params.session_id);
        Ok(json!({ "session_id": session_id }))
    }

    fn end_session(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: EndSessionParams = parse_params(params)?;
        let memory_id = self
            .engine
            .sessions
            .end_session(&params.session_id, params.create_note)
            .map_err(map_engine_error)?;
        Ok(json!({ "memory_id": memory_id }))
    }

    fn add_command(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: AddCommandParams = parse_params(params)?;
        if params.command.is_empty() {
            return Err(JsonRpcError::invalid_params("command is required"));
        }

        let metadata = params.metadata.as_ref().map(sanitize_metadata);
        let success = self.engine.sessions.add_command(
            &params.session_id,
            &params.command,
            &params.output,
            params.exit_code,
            metadata,
        );
        if success {
            self.engine.session_logs.append(
                &params.session_id,
                &params.command,
                &params.output,
                params.exit_code,
            );
        }
        Ok(json!({ "success": success }))
    }

    fn session_get_hint(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: SessionIdParams = parse_params(params)?;
        let hint = self.engine.sessions.get_project_hint(&params.session_id);
        Ok(hint_response(&params.session_id, hint.as_ref()))
    }

    fn session_set_project(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: SetProjectParams = parse_params(params)?;

        // Resolve an explicit project id to its canonical name
        let name = match (&params.project_id, &params.project) {
            (Some(project_id), _) => {
                let project = self.engine.projects.get(project_id).ok_or_else(|| {
                    JsonRpcError::invalid_params(&format!("project not found: {project_id}"))
                })?;
                project.name
            }
            (None, Some(name)) => name.clone(),
            (None, None) => {
                return Err(JsonRpcError::invalid_params(
                    "project_id or project name is required",
                ))
            }
        };

        let success = self.engine.sessions.set_project_hint(
            &params.session_id,
            &name,
            params.confidence,
            MANUAL_RPC_SOURCE,
        );
        if !success {
            return Err(JsonRpcError::internal_error(&format!(
                "session not found: {}",
                params.session_id
            )));
        }

        let hint = self.engine.sessions.get_project_hint(&params.session_id);
        Ok(hint_response(&params.session_id, hint.as_ref()))
    }

    fn session_clear_project(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: SessionIdParams = parse_params(params)?;
        if !self.engine.sessions.clear_project_hint(&params.session_id) {
            return Err(JsonRpcError::internal_error(&format!(
                "session not found: {}",
                params.session_id
            )));
        }
        let mut response = hint_response(&params.session_id, None);
        response["cleared"] = json!(true);
        Ok(response)
    }

    // ------------------------------------------------------------------
    // Project methods
    // ------------------------------------------------------------------

    fn create_project(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: CreateProjectParams = parse_params(params)?;
        let project = self
            .engine
            .projects
            .create(&params.name, &params.description, params.tags)
            .map_err(|e| JsonRpcError::invalid_params(&e.to_string()))?;
        serde_json::to_value(project).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }

    fn list_projects(&self) -> Result<Value, JsonRpcError> {
        let projects = self.engine.projects.list();
        Ok(json!({ "count": projects.len(), "projects": projects }))
    }

    fn get_project(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: ProjectIdParams = parse_params(params)?;
        match self.engine.projects.get(&params.project_id) {
            Some(project) => serde_json::to_value(project)
                .map_err(|e| JsonRpcError::internal_error(&e.to_string())),
            None => Err(JsonRpcError::internal_error(&format!(
                "project not found: {}",
                params.project_id
            ))),
        }
    }

    fn delete_project(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: ProjectIdParams = parse_params(params)?;
        let removed = self
            .engine
            .projects
            .delete(&params.project_id)
            .map_err(|e| JsonRpcError::internal_error(&e.to_string()))?;
        self.engine.pool.clear_pool(&params.project_id);
        Ok(json!({ "success": removed }))
    }

    fn search_in_project(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: SearchInProjectParams = parse_params(params)?;
        let filters = params.filter_metadata.as_ref().map(sanitize_metadata);
        let results = self.engine.search.search_in_project(
            &params.project_id,
            &params.query,
            params.top_k,
            filters,
        );
        Ok(json!({ "count": results.len(), "results": results }))
    }

    // ------------------------------------------------------------------
    // Bookmark methods
    // ------------------------------------------------------------------

    fn create_bookmark(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: CreateBookmarkParams = parse_params(params)?;
        let filters = params
            .filter_metadata
            .as_ref()
            .map(sanitize_metadata)
            .unwrap_or_default();
        let bookmark = self
            .engine
            .bookmarks
            .create(&params.name, &params.query, filters)
            .map_err(|e| JsonRpcError::invalid_params(&e.to_string()))?;
        serde_json::to_value(bookmark).map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }

    fn list_bookmarks(&self) -> Result<Value, JsonRpcError> {
        let bookmarks = self.engine.bookmarks.list();
        Ok(json!({ "count": bookmarks.len(), "bookmarks": bookmarks }))
    }

    /// Run a saved search and bump its usage counters.
    fn use_bookmark(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: UseBookmarkParams = parse_params(params)?;

        let bookmark = match (&params.bookmark_id, &params.name) {
            (Some(id), _) => self.engine.bookmarks.get(id),
            (None, Some(name)) => self.engine.bookmarks.get_by_name(name),
            (None, None) => {
                return Err(JsonRpcError::invalid_params("bookmark_id or name is required"))
            }
        };
        let Some(bookmark) = bookmark else {
            return Err(JsonRpcError::internal_error("bookmark not found"));
        };

        let updated = self
            .engine
            .bookmarks
            .record_use(&bookmark.id)
            .map_err(|e| JsonRpcError::internal_error(&e.to_string()))?;

        let filters = if bookmark.filters.is_empty() {
            None
        } else {
            Some(bookmark.filters.clone())
        };
        let results = self.engine.search.search(&bookmark.query, None, filters);

        Ok(json!({
            "bookmark": updated,
            "count": results.len(),
            "results": results,
        }))
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    fn get_reranker_metrics(&self) -> Result<Value, JsonRpcError> {
        serde_json::to_value(self.engine.reranker.metrics())
            .map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }

    fn get_search_stats(&self) -> Result<Value, JsonRpcError> {
        serde_json::to_value(self.engine.search.stats())
            .map_err(|e| JsonRpcError::internal_error(&e.to_string()))
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn parse_params<T: serde::de::DeserializeOwned>(
    params: Option<Value>,
) -> Result<T, JsonRpcError> {
    let value = params.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    serde_json::from_value(value).map_err(|e| JsonRpcError::invalid_params(&e.to_string()))
}

fn map_engine_error(error: EngineError) -> JsonRpcError {
    match error {
        EngineError::Validation(message) => JsonRpcError::invalid_params(&message),
        other => JsonRpcError::internal_error(&other.to_string()),
    }
}

fn hint_response(session_id: &str, hint: Option<&engram_core::ProjectHint>) -> Value {
    match hint {
        Some(hint) => json!({
            "session_id": session_id,
            "project_hint": hint.name,
            "project_id": hint.project_id,
            "confidence": hint.confidence,
            "source": hint.source,
        }),
        None => json!({
            "session_id": session_id,
            "project_hint": Value::Null,
            "project_id": Value::Null,
            "confidence": 0.0,
            "source": Value::Null,
        }),
    }
}

// ============================================================================
// TESTS
// ============================================================================
