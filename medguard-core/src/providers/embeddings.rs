//! Embedding providers.
//!
//! - `LocalEmbedder`: hashed term-frequency vectors, no network (default)
//! - `OpenAiEmbedder`: OpenAI `/v1/embeddings`
//! - `OllamaEmbedder`: local Ollama `/api/embed`
//!
//! Remote providers fail loudly: a failed call is an error, never a zero vector.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;

use super::{http_client, map_http_error, map_transport_error, resolve_api_key, with_retry};
use crate::config::{EmbeddingConfig, RetryConfig};
use crate::error::GatewayError;
use crate::gateway::EmbeddingModel;

/// Hashed term-frequency embedder.
///
/// Deterministic and offline; useful for tests, benchmarks and air-gapped
/// deployments. Only lexical overlap is captured.
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dimensions: usize,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Synchronous embedding, shared with the mock embedder.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        let lowered = text.to_lowercase();
        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            *tf.entry(word).or_insert(0) += 1;
        }

        for (term, count) in &tf {
            let idx = djb2(term) % self.dimensions;
            vector[idx] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

fn djb2(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[async_trait]
impl EmbeddingModel for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        Ok(self.embed_text(text))
    }

    fn model_name(&self) -> &str {
        "local-hashed-tf"
    }
}

/// Parse an array of JSON numbers into a vector.
fn parse_vector(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

fn check_count(expected: usize, got: usize) -> Result<(), GatewayError> {
    if expected == got {
        Ok(())
    } else {
        Err(GatewayError::ResponseParse {
            message: format!("expected {expected} embeddings, got {got}"),
        })
    }
}

/// OpenAI embeddings API.
pub struct OpenAiEmbedder {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout: Duration,
    retry: RetryConfig,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, retry: RetryConfig) -> Result<Self, GatewayError> {
        let api_key = resolve_api_key("OpenAI embeddings", &config.api_key_env, config.base_url.as_deref())?;
        Ok(Self {
            client: http_client(config.timeout())?,
            api_key,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "text-embedding-3-small".into()),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".into())
                .trim_end_matches('/')
                .to_string(),
            timeout: config.timeout(),
            retry,
        })
    }

    async fn call(&self, input: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = json!({ "model": self.model, "input": input });
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| map_transport_error(e, self.timeout))?;
        if !status.is_success() {
            return Err(map_http_error("OpenAI embeddings", status, &text));
        }
        let json: Value = serde_json::from_str(&text).map_err(|e| GatewayError::ResponseParse {
            message: format!("Invalid JSON: {e}"),
        })?;
        let data = json["data"]
            .as_array()
            .ok_or_else(|| GatewayError::ResponseParse {
                message: "No data array in embeddings response".into(),
            })?;
        let vectors = data
            .iter()
            .map(|d| parse_vector(&d["embedding"]))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| GatewayError::ResponseParse {
                message: "Malformed embedding in response".into(),
            })?;
        check_count(input.len(), vectors.len())?;
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        let input = [text.to_string()];
        let mut out = with_retry(&self.retry, || self.call(&input)).await?;
        out.pop().ok_or_else(|| GatewayError::ResponseParse {
            message: "Empty embeddings response".into(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        with_retry(&self.retry, || self.call(texts)).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Ollama local embedding API.
pub struct OllamaEmbedder {
    client: Client,
    model: String,
    base_url: String,
    timeout: Duration,
    retry: RetryConfig,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig, retry: RetryConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            client: http_client(config.timeout())?,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "nomic-embed-text".into()),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".into())
                .trim_end_matches('/')
                .to_string(),
            timeout: config.timeout(),
            retry,
        })
    }

    async fn call(&self, input: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        let url = format!("{}/api/embed", self.base_url);
        let body = json!({ "model": self.model, "input": input });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| map_transport_error(e, self.timeout))?;
        if !status.is_success() {
            return Err(map_http_error("Ollama", status, &text));
        }
        let json: Value = serde_json::from_str(&text).map_err(|e| GatewayError::ResponseParse {
            message: format!("Invalid JSON: {e}"),
        })?;
        let vectors = json["embeddings"]
            .as_array()
            .and_then(|arr| arr.iter().map(parse_vector).collect::<Option<Vec<_>>>())
            .ok_or_else(|| GatewayError::ResponseParse {
                message: "No embeddings in Ollama response".into(),
            })?;
        check_count(input.len(), vectors.len())?;
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingModel for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        let input = [text.to_string()];
        let mut out = with_retry(&self.retry, || self.call(&input)).await?;
        out.pop().ok_or_else(|| GatewayError::ResponseParse {
            message: "Empty embeddings response".into(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        with_retry(&self.retry, || self.call(texts)).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
