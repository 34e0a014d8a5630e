//! OpenAI-compatible chat completion client.
//!
//! Works with OpenAI and any server exposing `/chat/completions` with the
//! same request shape (vLLM, Ollama, LM Studio).

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use super::{http_client, map_http_error, map_transport_error, resolve_api_key, with_retry};
use crate::config::{GenerationConfig, RetryConfig};
use crate::error::GatewayError;
use crate::gateway::GenerationModel;
use crate::types::SamplingConfig;

const PROVIDER: &str = "OpenAI-compatible";

/// Generation model backed by an OpenAI-compatible endpoint.
pub struct OpenAiCompatibleGenerator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    retry: RetryConfig,
}

impl OpenAiCompatibleGenerator {
    /// Create a generator, reading the API key from `config.api_key_env`.
    pub fn new(config: &GenerationConfig, retry: RetryConfig) -> Result<Self, GatewayError> {
        let api_key = resolve_api_key(PROVIDER, &config.api_key_env, config.base_url.as_deref())?;
        Self::new_with_key(config, retry, api_key)
    }

    /// Create a generator with an explicitly provided API key.
    pub fn new_with_key(
        config: &GenerationConfig,
        retry: RetryConfig,
        api_key: String,
    ) -> Result<Self, GatewayError> {
        let timeout = config.timeout();
        let client = http_client(timeout)?;
        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: config.model.clone(),
            timeout,
            retry,
        })
    }

    fn request_body(&self, prompt: &str, sampling: &SamplingConfig) -> Value {
        json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": sampling.temperature,
            "max_tokens": sampling.max_tokens,
            "stream": false,
        })
    }

    fn parse_response(body: &Value) -> Result<String, GatewayError> {
        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| GatewayError::ResponseParse {
                message: "No choices in response".to_string(),
            })?;
        choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| GatewayError::ResponseParse {
                message: "No text content in choice".to_string(),
            })
    }

    async fn send_once(&self, body: &Value) -> Result<String, GatewayError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %self.model, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| map_transport_error(e, self.timeout))?;
        if !status.is_success() {
            return Err(map_http_error(PROVIDER, status, &text));
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| GatewayError::ResponseParse {
            message: format!("Invalid JSON: {e}"),
        })?;
        Self::parse_response(&json)
    }
}

#[async_trait]
impl GenerationModel for OpenAiCompatibleGenerator {
    async fn generate(
        &self,
        prompt: &str,
        sampling: &SamplingConfig,
    ) -> Result<String, GatewayError> {
        let body = self.request_body(prompt, sampling);
        with_retry(&self.retry, || self.send_once(&body)).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
