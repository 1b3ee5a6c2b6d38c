//! Local model tier - Ollama HTTP API
//!
//! Blocking client for `/api/embeddings` and `/api/generate`. Keeps
//! embeddings and short generation fully local.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{EmbeddingBackend, GenerationBackend, ModelError};

/// Default Ollama endpoint.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

/// Client for a local Ollama instance.
pub struct OllamaClient {
    base_url: String,
    embedding_model: String,
    inference_model: String,
    http: reqwest::blocking::Client,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(
        base_url: impl Into<String>,
        embedding_model: impl Into<String>,
        inference_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::Unavailable(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            embedding_model: embedding_model.into(),
            inference_model: inference_model.into(),
            http,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl EmbeddingBackend for OllamaClient {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        if text.is_empty() {
            return Err(ModelError::InvalidInput("empty embedding input".to_string()));
        }

        debug!(model = %self.embedding_model, "requesting embedding");
        let response = self
            .http
            .post(self.endpoint("/api/embeddings"))
            .json(&json!({
                "model": self.embedding_model,
                "prompt": text,
            }))
            .send()
            .map_err(map_reqwest_error)?
            .error_for_status()
            .map_err(map_reqwest_error)?;

        let parsed: EmbeddingsResponse = response
            .json()
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        if parsed.embedding.is_empty() {
            return Err(ModelError::InvalidResponse("empty embedding".to_string()));
        }
        Ok(parsed.embedding)
    }
}

impl GenerationBackend for OllamaClient {
    fn generate(
        &self,
        prompt: &str,
        max_tokens: Option<u32>,
        temperature: f32,
        _timeout: Duration,
    ) -> Result<String, ModelError> {
        let mut options = json!({ "temperature": temperature });
        if let Some(limit) = max_tokens {
            options["num_predict"] = json!(limit);
        }

        debug!(model = %self.inference_model, "requesting generation");
        let response = self
            .http
            .post(self.endpoint("/api/generate"))
            .json(&json!({
                "model": self.inference_model,
                "prompt": prompt,
                "stream": false,
                "options": options,
            }))
            .send()
            .map_err(map_reqwest_error)?
            .error_for_status()
            .map_err(map_reqwest_error)?;

        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        Ok(parsed.response)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ModelError {
    if err.is_timeout() {
        ModelError::Timeout(0)
    } else {
        ModelError::Unavailable(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
