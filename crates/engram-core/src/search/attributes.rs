//! Query Attribute Extraction
//!
//! Infers topic / doc type / project / severity hints from a free-form query.
//! Substring-match tables run first; an optional LLM pass fills the gaps when
//! the heuristics come up short. Hints feed both candidate prefiltering and
//! metadata alignment bonuses in the hybrid search.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{GenerateOptions, ModelRouter, TaskKind};

/// Default LLM confidence floor for overriding heuristic hints.
pub const DEFAULT_MIN_LLM_CONFIDENCE: f64 = 0.4;

// ============================================================================
// CLOSED VOCABULARY TABLES
// ============================================================================
// Ordered: the first needle contained in the query wins, so specific phrases
// come before their generic substrings.

const PROJECT_KEYWORDS: &[(&str, &str)] = &[
    ("appbrain", "AppBrain"),
    ("orchestrator", "AppBrain"),
    ("pilot", "AppBrain"),
    ("demo", "AppBrain"),
    ("bugfixer", "BugFixer"),
    ("再発防止", "BugFixer"),
    ("再デプロイ", "BugFixer"),
    ("insightops", "InsightOps"),
    ("guardrails", "InsightOps"),
    ("observability", "InsightOps"),
    ("phase sync", "PhaseSync"),
    ("phasesync", "PhaseSync"),
    ("バグフィクサー", "BugFixer"),
    ("フェーズシンク", "PhaseSync"),
];

const TOPIC_KEYWORDS: &[(&str, &str)] = &[
    ("timeline", "timeline"),
    ("release notes", "release"),
    ("release", "release"),
    ("rerank", "rerank"),
    ("chunker", "chunker"),
    ("dashboard", "dashboard"),
    ("governance", "governance"),
    ("retention policy", "policy"),
    ("retention", "policy"),
    ("policy", "policy"),
    ("obsidian", "obsidian"),
    ("change feed", "ingestion"),
    ("consolidation", "consolidation"),
    ("doctor report", "health"),
    ("doctor", "health"),
    ("再発防止", "chunker"),
    ("再デプロイ", "chunker"),
    ("deployment", "deployment"),
    ("deploy", "deployment"),
    ("rollout", "deployment"),
    ("canary", "deployment"),
    ("blue-green", "deployment"),
    ("blue green", "deployment"),
    ("hotfix", "release"),
    ("patch", "release"),
    ("version", "release"),
    ("alert", "monitoring"),
    ("monitoring", "monitoring"),
    ("sla", "monitoring"),
    ("downtime", "incident"),
    ("outage", "incident"),
    ("degradation", "incident"),
    ("incident response", "incident"),
    ("root cause", "incident"),
    ("rca", "incident"),
    ("audit", "audit"),
    ("compliance", "compliance"),
    ("security", "security"),
    ("vulnerability", "security"),
    ("pen test", "security"),
    ("penetration", "security"),
    ("refactor", "development"),
    ("tech debt", "development"),
    ("technical debt", "development"),
    ("prototype", "development"),
    ("poc", "development"),
    ("proof of concept", "development"),
    ("backup", "operations"),
    ("disaster recovery", "operations"),
    ("failover", "operations"),
    ("scaling", "operations"),
    ("capacity", "operations"),
    ("performance", "operations"),
    ("optimization", "optimization"),
    ("data migration", "data"),
    ("etl", "data"),
    ("pipeline", "data"),
    ("streaming", "ingestion"),
    ("migration", "development"),
    ("タイムライン", "timeline"),
    ("リリース", "release"),
    ("デプロイ", "deployment"),
    ("障害", "incident"),
    ("監査", "audit"),
    ("開発", "development"),
    ("despliegue", "deployment"),
    ("lanzamiento", "release"),
    ("incidentes", "incident"),
    ("incidente", "incident"),
    ("auditoría", "audit"),
];

const DOC_TYPE_KEYWORDS: &[(&str, &str)] = &[
    ("checklist", "checklist"),
    ("runbook", "checklist"),
    ("experiment", "experiment"),
    ("postmortem", "postmortem"),
    ("template", "template"),
    ("deployment guide", "guide"),
    ("guide", "guide"),
    ("doctor report", "report"),
    ("audit report", "report"),
    ("incident log", "report"),
    ("report", "report"),
    ("change log", "runbook"),
    ("retention policy", "policy"),
    ("security policy", "policy"),
    ("rollout plan", "checklist"),
    ("compliance checklist", "checklist"),
    ("release notes", "changelog"),
    ("changelog", "changelog"),
    ("incident report", "incident"),
    ("root cause analysis", "postmortem"),
    ("rca", "postmortem"),
    ("design doc", "design"),
    ("architecture", "design"),
    ("rfc", "design"),
    ("proposal", "design"),
    ("手順書", "guide"),
    ("チェックリスト", "checklist"),
    ("報告書", "report"),
    ("テンプレート", "template"),
    ("lista de verificación", "checklist"),
    ("guía", "guide"),
    ("informe", "report"),
    // Generic fallback, after every specific phrase
    ("incident", "incident"),
];

const SEVERITY_KEYWORDS: &[(&str, &str)] = &[
    ("sev1", "high"),
    ("sev2", "medium"),
    ("sev3", "low"),
    ("critical", "high"),
    ("high priority", "high"),
    ("major", "medium"),
];

fn incident_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)inc[-_ ]?\d+").expect("valid incident pattern"))
}

// ============================================================================
// ATTRIBUTES
// ============================================================================

/// Structured hints parsed from a query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryAttributes {
    pub topic: Option<String>,
    pub doc_type: Option<String>,
    pub project_name: Option<String>,
    pub severity: Option<String>,
    pub keywords: BTreeSet<String>,
    /// Per-field confidence in [0, 1]
    pub confidence: BTreeMap<String, f64>,
}

impl QueryAttributes {
    /// Whether any hint field is filled.
    pub fn has_hints(&self) -> bool {
        self.topic.is_some()
            || self.doc_type.is_some()
            || self.project_name.is_some()
            || self.severity.is_some()
    }

    fn apply(&mut self, field: &str, value: &str, confidence: f64) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        match field {
            "topic" => self.topic = Some(value.to_string()),
            "doc_type" => self.doc_type = Some(value.to_string()),
            "project_name" => self.project_name = Some(value.to_string()),
            "severity" => self.severity = Some(value.to_string()),
            _ => return,
        }
        if confidence > 0.0 {
            self.confidence.insert(field.to_string(), confidence);
        }
    }

    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "topic" => self.topic.as_deref(),
            "doc_type" => self.doc_type.as_deref(),
            "project_name" => self.project_name.as_deref(),
            "severity" => self.severity.as_deref(),
            _ => None,
        }
    }
}

// ============================================================================
// EXTRACTOR
// ============================================================================

/// Hybrid heuristic + LLM attribute extractor.
pub struct QueryAttributeExtractor {
    router: Option<Arc<ModelRouter>>,
    min_llm_confidence: f64,
    llm_enabled: bool,
}

impl Default for QueryAttributeExtractor {
    fn default() -> Self {
        Self {
            router: None,
            min_llm_confidence: DEFAULT_MIN_LLM_CONFIDENCE,
            llm_enabled: true,
        }
    }
}

impl QueryAttributeExtractor {
    pub fn new(router: Option<Arc<ModelRouter>>, min_llm_confidence: f64, llm_enabled: bool) -> Self {
        Self {
            router,
            min_llm_confidence,
            llm_enabled,
        }
    }

    /// Extract structured hints from the query. Never fails: LLM trouble
    /// leaves the heuristic output untouched.
    pub fn extract(&self, query: &str) -> QueryAttributes {
        let mut attributes = QueryAttributes::default();
        let normalized = query.to_lowercase();

        attributes.keywords = normalized
            .split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect();

        attributes.topic = lookup(&normalized, TOPIC_KEYWORDS);
        attributes.doc_type = lookup(&normalized, DOC_TYPE_KEYWORDS);
        attributes.project_name = lookup(&normalized, PROJECT_KEYWORDS);
        attributes.severity = lookup(&normalized, SEVERITY_KEYWORDS);

        // Incident-style identifiers imply incident topic/type
        if incident_id_pattern().is_match(&normalized) {
            attributes.topic.get_or_insert_with(|| "incident".to_string());
            attributes.doc_type.get_or_insert_with(|| "incident".to_string());
            attributes.severity.get_or_insert_with(|| "high".to_string());
        }

        if self.should_call_llm(&attributes) {
            self.enrich_with_llm(query, &mut attributes);
        }
        attributes
    }

    /// Skip the LLM when the primary hints are already filled.
    fn should_call_llm(&self, attributes: &QueryAttributes) -> bool {
        if !self.llm_enabled || self.router.is_none() {
            return false;
        }

        let topic_ready = attributes.topic.is_some();
        let doc_ready = attributes.doc_type.is_some();
        let project_ready = attributes.project_name.is_some();

        if project_ready && topic_ready {
            return false;
        }

        !project_ready || (!topic_ready && !doc_ready)
    }

    fn enrich_with_llm(&self, query: &str, attributes: &mut QueryAttributes) {
        let Some(router) = &self.router else {
            return;
        };

        let prompt = format!(
            "You are an assistant that labels search queries for a knowledge base.\n\
             Return a compact JSON object with keys: topic, doc_type, project_name, severity, and confidence.\n\
             confidence must itself be a JSON object mapping attribute names to a float 0-1.\n\
             If an attribute is unknown, use null.\n\n\
             Query:\n{}\nJSON:",
            query.trim()
        );

        let opts = GenerateOptions {
            max_tokens: Some(200),
            temperature: 0.0,
            ..Default::default()
        };
        let raw = match router.route(TaskKind::ShortSummary, &prompt, &opts) {
            Ok(raw) => raw,
            Err(e) => {
                debug!("LLM attribute extraction failed: {e}");
                return;
            }
        };

        let Some(payload) = lenient_json_parse(&raw) else {
            debug!("LLM attribute reply was not JSON");
            return;
        };

        let confidence = payload
            .get("confidence")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        for field in ["topic", "doc_type", "project_name", "severity"] {
            let Some(value) = payload.get(field).and_then(|v| v.as_str()) else {
                continue;
            };
            let field_conf = confidence.get(field).and_then(|v| v.as_f64()).unwrap_or(0.0);

            // Keep the heuristic value unless the LLM is confident
            if attributes.field(field).is_some() && field_conf < self.min_llm_confidence {
                continue;
            }
            attributes.apply(field, value, field_conf);
        }
    }
}

fn lookup(text: &str, table: &[(&str, &str)]) -> Option<String> {
    table
        .iter()
        .find(|(needle, _)| text.contains(needle))
        .map(|(_, value)| value.to_string())
}

/// Accept pure JSON or JSON embedded between the first `{` and last `}`.
fn lenient_json_parse(raw: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(text) {
        return Some(map);
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&text[start..=end]) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => {
            warn!("could not salvage JSON from LLM attribute reply");
            None
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
