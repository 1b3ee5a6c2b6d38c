//! Ingestion Pipeline
//!
//! Turns a dialogue turn into a searchable memory:
//! 1. Validate the payload.
//! 2. Classify the schema kind (Process on failure).
//! 3. Generate a structured summary, routing to the cloud tier when the
//!    detected language is outside the locally supported set.
//! 4. Build the Memory record (Working tier, strength 1.0, importance 0.5).
//! 5. Chunk the conversation and index the chunks.
//! 6. Write the memory-level indexed entry (`<id>-metadata`).
//!
//! Classification and summary failures fall back; an indexing failure aborts
//! only the affected memory. A metadata-entry write failure is logged but
//! does not undo chunk writes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::LANG_OVERRIDE_ENV;
use crate::error::{EngineError, Result};
use crate::memory::{
    sanitize_metadata, Conversation, Memory, MemoryTier, Metadata, MetadataValue, SchemaType,
};
use crate::model::{GenerateOptions, ModelRouter, Route, TaskKind};
use crate::processing::{format_conversation, Chunker, Indexer, SchemaClassifier};
use crate::storage::{ProjectStore, VectorStore};

// ============================================================================
// LANGUAGE DETECTION
// ============================================================================

/// Heuristic language detection: Unicode blocks for Japanese, marker letters
/// for Spanish, English otherwise.
pub fn detect_language(text: &str) -> &'static str {
    let japanese = text.chars().any(|c| {
        matches!(c as u32,
            0x3040..=0x309F   // hiragana
            | 0x30A0..=0x30FF // katakana
            | 0x4E00..=0x9FFF // CJK unified ideographs
        )
    });
    if japanese {
        return "ja";
    }

    if text.chars().any(|c| "áéíóúñü¿¡".contains(c)) {
        return "es";
    }
    "en"
}

// ============================================================================
// SERVICE
// ============================================================================

/// Conversation ingestion service.
pub struct IngestionService {
    vector: Arc<VectorStore>,
    chunker: Chunker,
    indexer: Arc<Indexer>,
    router: Arc<ModelRouter>,
    projects: Option<Arc<ProjectStore>>,
    supported_languages: Vec<String>,
}

impl IngestionService {
    pub fn new(
        vector: Arc<VectorStore>,
        chunker: Chunker,
        indexer: Arc<Indexer>,
        router: Arc<ModelRouter>,
        projects: Option<Arc<ProjectStore>>,
        supported_languages: Vec<String>,
    ) -> Self {
        Self {
            vector,
            chunker,
            indexer,
            router,
            projects,
            supported_languages,
        }
    }

    /// Ingest a conversation and return the new memory id.
    pub fn ingest_conversation(&self, conversation: &Conversation) -> Result<String> {
        self.validate(conversation)?;
        info!(source = %conversation.source, "ingesting conversation");

        // Classification failure falls back to Process
        let schema_type = SchemaClassifier::new(&self.router)
            .classify_conversation(&conversation.user, &conversation.assistant)
            .unwrap_or_else(|e| {
                warn!("classification failed, defaulting to Process: {e}");
                SchemaType::Process
            });
        debug!(schema = schema_type.as_str(), "classified conversation");

        let summary = self.generate_summary(conversation, schema_type);
        debug!("summary: {}", truncate(&summary, 100));

        let memory = self.build_memory(conversation, schema_type, &summary);

        let mut chunks = self.chunker.chunk_conversation(
            &conversation.user,
            &conversation.assistant,
            &memory.id,
            &memory.metadata,
        );
        debug!(chunks = chunks.len(), "chunked conversation");

        self.indexer.index(&mut chunks);

        self.store_memory_entry(&memory, &summary);

        if let (Some(projects), Some(project_id)) = (&self.projects, &memory.project_id) {
            if let Err(e) = projects.increment_memory_count(project_id) {
                debug!(%project_id, "memory count bump skipped: {e}");
            }
        }

        info!(memory_id = %memory.id, "ingested conversation");
        Ok(memory.id)
    }

    /// Ingest a batch; per-item failures do not abort the rest.
    pub fn ingest_batch(&self, conversations: &[Conversation]) -> Vec<String> {
        let mut memory_ids = Vec::with_capacity(conversations.len());
        for (i, conversation) in conversations.iter().enumerate() {
            match self.ingest_conversation(conversation) {
                Ok(memory_id) => memory_ids.push(memory_id),
                Err(e) => error!(index = i, "batch item failed: {e}"),
            }
        }
        info!(
            ingested = memory_ids.len(),
            total = conversations.len(),
            "batch ingestion complete"
        );
        memory_ids
    }

    /// Delete a memory and all its chunks. Absent ids are a no-op.
    pub fn delete_memory(&self, memory_id: &str) -> Result<()> {
        let entry_id = format!("{memory_id}-metadata");
        self.vector.delete(&entry_id)?;
        self.indexer.delete_by_memory_id(memory_id);
        info!(memory_id, "deleted memory");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pipeline steps
    // ------------------------------------------------------------------

    fn validate(&self, conversation: &Conversation) -> Result<()> {
        if conversation.user.trim().is_empty() {
            return Err(EngineError::Validation("user message is required".to_string()));
        }
        if conversation.assistant.trim().is_empty() {
            return Err(EngineError::Validation(
                "assistant message is required".to_string(),
            ));
        }
        if conversation.source.trim().is_empty() {
            return Err(EngineError::Validation("source is required".to_string()));
        }
        Ok(())
    }

    /// Structured summary with language-policy routing. Falls back to a
    /// metadata-derived summary when the model is unavailable.
    fn generate_summary(&self, conversation: &Conversation, schema_type: SchemaType) -> String {
        let content = format!(
            "User: {}\n\nAssistant: {}",
            conversation.user, conversation.assistant
        );
        let prompt = format!(
            "Summarize the following conversation as structured lines, max 100 tokens total.\n\
             Use exactly this layout:\n\
             Topic: <short topic>\n\
             DocType: <document type>\n\
             Project: <project name or none>\n\
             KeyActions:\n\
             - <key action>\n\n\
             Conversation:\n---\n{}\n---\n\nSummary:",
            truncate(&content, 1000)
        );

        let language = self.resolve_language(conversation);
        let force_routing = if self.supported_languages.iter().any(|l| l == language) {
            None
        } else {
            debug!(%language, "unsupported language, forcing cloud summary");
            Some(Route::Cloud)
        };

        let opts = GenerateOptions {
            max_tokens: Some(100),
            temperature: 0.7,
            force_routing,
            ..Default::default()
        };

        match self.router.route(TaskKind::ShortSummary, &prompt, &opts) {
            Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
            Ok(_) | Err(_) => {
                warn!("summary generation failed, using structured fallback");
                self.fallback_summary(conversation, schema_type)
            }
        }
    }

    /// Detected language, unless overridden by payload metadata or the
    /// environment.
    fn resolve_language(&self, conversation: &Conversation) -> String {
        if let Some(lang) = conversation
            .metadata
            .get("language_override")
            .and_then(|v| v.as_str())
        {
            return lang.to_string();
        }
        if let Ok(lang) = std::env::var(LANG_OVERRIDE_ENV) {
            if !lang.is_empty() {
                return lang;
            }
        }
        detect_language(&format!("{} {}", conversation.user, conversation.assistant)).to_string()
    }

    fn fallback_summary(&self, conversation: &Conversation, schema_type: SchemaType) -> String {
        let topic = conversation
            .metadata
            .get("topic")
            .and_then(|v| v.as_str())
            .unwrap_or("general");
        let doc_type = conversation
            .metadata
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or(schema_type.as_str());
        let project = conversation.project_id.as_deref().unwrap_or("none");
        format!(
            "Topic: {topic}\nDocType: {doc_type}\nProject: {project}\nKeyActions:\n- {}",
            truncate(conversation.user.trim(), 100)
        )
    }

    fn build_memory(
        &self,
        conversation: &Conversation,
        schema_type: SchemaType,
        summary: &str,
    ) -> Memory {
        let memory_id = format!("mem-{}", &Uuid::new_v4().simple().to_string()[..12]);

        let created_at = conversation
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(|| {
                if conversation.timestamp.is_some() {
                    warn!("unparseable timestamp, using now");
                }
                Utc::now()
            });

        let mut metadata = sanitize_metadata(&conversation.metadata);
        metadata.insert(
            "source".to_string(),
            MetadataValue::Str(conversation.source.clone()),
        );
        metadata.insert(
            "created_at".to_string(),
            MetadataValue::Str(created_at.to_rfc3339()),
        );
        metadata.insert(
            "refs_count".to_string(),
            MetadataValue::Int(conversation.refs.len() as i64),
        );
        if let Some(project_id) = &conversation.project_id {
            metadata.insert(
                "project_id".to_string(),
                MetadataValue::Str(project_id.clone()),
            );
        }

        Memory {
            id: memory_id,
            schema_type,
            content: format_conversation(&conversation.user, &conversation.assistant),
            summary: summary.to_string(),
            refs: conversation.refs.clone(),
            created_at,
            updated_at: created_at,
            strength: 1.0,
            importance: 0.5,
            tags: conversation.tags.clone(),
            metadata,
            tier: MemoryTier::Working,
            cluster_id: None,
            is_representative: false,
            project_id: conversation.project_id.clone(),
        }
    }

    /// Write the memory-level indexed entry carrying the summary embedding.
    /// Non-fatal: the chunks are already searchable.
    fn store_memory_entry(&self, memory: &Memory, summary: &str) {
        let embedding = match self.router.generate_embedding(summary) {
            Ok(embedding) => embedding,
            Err(e) => {
                error!(memory_id = %memory.id, "summary embedding failed: {e}");
                return;
            }
        };

        let mut metadata = memory.metadata.clone();
        metadata.insert(
            "memory_id".to_string(),
            MetadataValue::Str(memory.id.clone()),
        );
        metadata.insert(
            "schema_type".to_string(),
            MetadataValue::Str(memory.schema_type.as_str().to_string()),
        );
        metadata.insert(
            "memory_type".to_string(),
            MetadataValue::Str(memory.tier.as_str().to_string()),
        );
        metadata.insert("strength".to_string(), MetadataValue::Float(memory.strength));
        metadata.insert(
            "importance".to_string(),
            MetadataValue::Float(memory.importance),
        );
        metadata.insert("is_memory_entry".to_string(), MetadataValue::Bool(true));

        if let Err(e) = self
            .vector
            .add(&memory.metadata_entry_id(), &embedding, &metadata, summary)
        {
            error!(memory_id = %memory.id, "memory entry write failed: {e}");
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============================================================================
// TESTS
// ============================================================================
