//! Schema Classifier
//!
//! Classifies content into one of the four schema kinds via the local model
//! tier. The reply contract is a single word; parsing is lenient (substring
//! match) and anything unrecognized falls back to Process.

use tracing::debug;

use crate::memory::SchemaType;
use crate::model::{GenerateOptions, ModelError, ModelRouter, TaskKind};

/// Classifier over the model gateway.
pub struct SchemaClassifier<'a> {
    router: &'a ModelRouter,
}

impl<'a> SchemaClassifier<'a> {
    pub fn new(router: &'a ModelRouter) -> Self {
        Self { router }
    }

    /// Classify arbitrary content.
    pub fn classify(&self, content: &str) -> Result<SchemaType, ModelError> {
        let prompt = build_classification_prompt(content);
        let opts = GenerateOptions {
            max_tokens: Some(10),
            temperature: 0.0,
            ..Default::default()
        };
        let raw = self.router.route(TaskKind::Classification, &prompt, &opts)?;
        let parsed = parse_classification(&raw);
        debug!(raw = raw.trim(), schema = parsed.as_str(), "classified content");
        Ok(parsed)
    }

    /// Classify a (user, assistant) exchange.
    pub fn classify_conversation(
        &self,
        user_message: &str,
        assistant_message: &str,
    ) -> Result<SchemaType, ModelError> {
        let content = format!("User: {user_message}\n\nAssistant: {assistant_message}");
        self.classify(&content)
    }
}

fn build_classification_prompt(content: &str) -> String {
    format!(
        "Classify the following content into one of these schema types:\n\
         - Incident: Bug reports, errors, troubleshooting\n\
         - Snippet: Code examples with usage context\n\
         - Decision: Architectural choices, trade-offs\n\
         - Process: Thought processes, learning, experimentation\n\n\
         Content:\n{content}\n\n\
         Respond with ONLY the schema type (Incident, Snippet, Decision, or Process).\n\
         Schema type:"
    )
}

/// Lenient reply parsing: first recognized kind mentioned wins.
fn parse_classification(raw: &str) -> SchemaType {
    let lowered = raw.to_lowercase();
    if lowered.contains("incident") {
        SchemaType::Incident
    } else if lowered.contains("snippet") {
        SchemaType::Snippet
    } else if lowered.contains("decision") {
        SchemaType::Decision
    } else {
        SchemaType::Process
    }
}

// ============================================================================
// TESTS
// ============================================================================
