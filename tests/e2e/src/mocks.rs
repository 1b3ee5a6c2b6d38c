//! Deterministic model backends for end-to-end tests
//!
//! `ScriptedModel` answers each prompt kind the way a well-behaved model
//! would: reranker prompts get a float, classification prompts get a schema
//! word, summary prompts echo the content they were asked to summarize.
//! Embeddings are a bag-of-words hash, so texts sharing words land close in
//! cosine space.

use std::time::Duration;

use engram_core::{EmbeddingBackend, GenerationBackend, ModelError};

/// Embedding dimensions used by the test embedder.
pub const TEST_EMBEDDING_DIMENSIONS: usize = 32;

/// Deterministic bag-of-words embedding: each word hashes to a bucket,
/// the vector is normalized to unit length.
pub fn bag_of_words_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; TEST_EMBEDDING_DIMENSIONS];
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let bucket: usize =
            word.bytes().map(|b| b as usize).sum::<usize>() % TEST_EMBEDDING_DIMENSIONS;
        vector[bucket] += 1.0;
    }

    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    } else {
        vector[0] = 1.0;
    }
    vector
}

/// Prompt-aware scripted model.
pub struct ScriptedModel {
    /// Reply for reranker scoring prompts
    pub rerank_score: &'static str,
    /// Reply for classification prompts
    pub schema: &'static str,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self {
            rerank_score: "0.7",
            schema: "Process",
        }
    }
}

impl ScriptedModel {
    /// Echo the conversation body out of a summary prompt so each memory
    /// gets a distinctive summary.
    fn echo_summary(prompt: &str) -> String {
        let body = prompt
            .split("---")
            .nth(1)
            .unwrap_or(prompt)
            .trim()
            .chars()
            .take(300)
            .collect::<String>();
        format!("Topic: general\nDocType: note\nProject: none\nKeyActions:\n- {body}")
    }
}

impl GenerationBackend for ScriptedModel {
    fn generate(
        &self,
        prompt: &str,
        _max_tokens: Option<u32>,
        _temperature: f32,
        _timeout: Duration,
    ) -> Result<String, ModelError> {
        if prompt.starts_with("You are a reranker") {
            return Ok(self.rerank_score.to_string());
        }
        if prompt.starts_with("Classify the following content") {
            return Ok(self.schema.to_string());
        }
        Ok(Self::echo_summary(prompt))
    }
}

impl EmbeddingBackend for ScriptedModel {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        Ok(bag_of_words_embedding(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::cosine_similarity;

    #[test]
    fn test_embedding_is_deterministic_and_unit_length() {
        let a = bag_of_words_embedding("fix the TypeError in parser");
        let b = bag_of_words_embedding("fix the TypeError in parser");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_words_raise_similarity() {
        let a = bag_of_words_embedding("deployment checklist for rollout");
        let close = bag_of_words_embedding("rollout deployment checklist");
        let far = bag_of_words_embedding("quarterly finance report numbers");
        assert!(cosine_similarity(&a, &close) > cosine_similarity(&a, &far));
    }

    #[test]
    fn test_scripted_replies_by_prompt_kind() {
        let model = ScriptedModel::default();
        let score = model
            .generate("You are a reranker that scores...", None, 0.0, Duration::from_secs(1))
            .unwrap();
        assert_eq!(score, "0.7");

        let schema = model
            .generate("Classify the following content into...", None, 0.0, Duration::from_secs(1))
            .unwrap();
        assert_eq!(schema, "Process");

        let summary = model
            .generate(
                "Summarize...\nConversation:\n---\nUser: hello there\n---\n\nSummary:",
                None,
                0.0,
                Duration::from_secs(1),
            )
            .unwrap();
        assert!(summary.contains("hello there"));
    }
}
