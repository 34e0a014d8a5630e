//! Concrete model and knowledge-source clients.
//!
//! Every client speaks HTTP through `reqwest`, maps status codes onto
//! [`GatewayError`] the same way, and retries transient failures through
//! [`with_retry`]. The factories build trait objects from configuration.

pub mod embeddings;
pub mod openai_compat;
pub mod semantic_scholar;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::{EmbeddingConfig, ExternalConfig, GenerationConfig, RetryConfig};
use crate::error::GatewayError;
use crate::gateway::{EmbeddingModel, ExternalKnowledgeSource, GenerationModel};

pub use embeddings::{LocalEmbedder, OllamaEmbedder, OpenAiEmbedder};
pub use openai_compat::OpenAiCompatibleGenerator;
pub use semantic_scholar::SemanticScholarSource;

/// Execute an async operation with retry logic for transient errors.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, GatewayError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_retryable() || attempt >= config.max_retries {
                    return Err(e);
                }
                let backoff_ms = compute_backoff(config, attempt, &e);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Compute backoff delay, respecting rate limit retry-after hints.
fn compute_backoff(config: &RetryConfig, attempt: u32, err: &GatewayError) -> u64 {
    if let GatewayError::RateLimited { retry_after_secs } = err {
        let server_ms = retry_after_secs * 1000;
        return server_ms.max(compute_exponential_backoff(config, attempt));
    }
    compute_exponential_backoff(config, attempt)
}

fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter {
        // up to 25%
        let jitter = (capped as f64 * 0.25 * rand_simple()) as u64;
        capped + jitter
    } else {
        capped
    }
}

/// Cheap jitter source; quality doesn't matter here.
fn rand_simple() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Map a non-success HTTP status onto a gateway error.
pub(crate) fn map_http_error(provider: &str, status: reqwest::StatusCode, body: &str) -> GatewayError {
    match status.as_u16() {
        401 | 403 => {
            debug!(provider, body = %body, "Authentication failed");
            GatewayError::AuthFailed {
                provider: provider.to_string(),
            }
        }
        429 => GatewayError::RateLimited {
            retry_after_secs: parse_retry_after(body).unwrap_or(5),
        },
        408 => GatewayError::Timeout { timeout_ms: 0 },
        code if code >= 500 => GatewayError::Connection {
            message: format!("Server error ({status}): {body}"),
        },
        _ => GatewayError::ApiRequest {
            message: format!("HTTP {status}: {body}"),
        },
    }
}

/// Pull the seconds out of messages like "Rate limit reached ... try again in 7s".
fn parse_retry_after(body: &str) -> Option<u64> {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error")?.get("message")?.as_str().map(str::to_string))?;
    message
        .split("in ")
        .last()
        .and_then(|s| s.trim().trim_end_matches('.').trim_end_matches('s').parse().ok())
}

/// HTTP client with a request timeout; build failures surface as connection errors.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, GatewayError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| GatewayError::Connection {
            message: format!("Failed to build HTTP client: {e}"),
        })
}

/// Map a transport-level `reqwest` failure.
pub(crate) fn map_transport_error(err: reqwest::Error, timeout: Duration) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    } else if err.is_connect() || err.is_request() {
        GatewayError::Connection {
            message: err.to_string(),
        }
    } else {
        GatewayError::ApiRequest {
            message: format!("Request failed: {err}"),
        }
    }
}

/// Read an API key from the named environment variable.
///
/// Local endpoints (localhost, 127.0.0.1) get a dummy bearer token so that
/// Ollama, vLLM and LM Studio work without a key.
pub(crate) fn resolve_api_key(
    provider: &str,
    env_var: &str,
    base_url: Option<&str>,
) -> Result<String, GatewayError> {
    if let Ok(key) = std::env::var(env_var)
        && !key.trim().is_empty()
    {
        return Ok(key);
    }
    let is_local = base_url
        .map(|u| u.contains("localhost") || u.contains("127.0.0.1"))
        .unwrap_or(false);
    if is_local {
        debug!(provider, "No API key set for local endpoint; using dummy bearer token");
        return Ok("local".to_string());
    }
    Err(GatewayError::AuthFailed {
        provider: format!("{provider}: env var '{env_var}' not set"),
    })
}

/// Build the generation model named in configuration.
pub fn create_generation_model(
    config: &GenerationConfig,
    retry: &RetryConfig,
) -> Result<Arc<dyn GenerationModel>, GatewayError> {
    match config.provider.as_str() {
        "openai" | "openai_compatible" | "vllm" | "ollama" => {
            let provider = OpenAiCompatibleGenerator::new(config, retry.clone())?;
            Ok(Arc::new(provider))
        }
        other => Err(GatewayError::ApiRequest {
            message: format!("Unknown generation provider '{other}'"),
        }),
    }
}

/// Build the embedding model named in configuration.
pub fn create_embedding_model(
    config: &EmbeddingConfig,
    retry: &RetryConfig,
) -> Result<Arc<dyn EmbeddingModel>, GatewayError> {
    match config.provider.as_str() {
        "local" => Ok(Arc::new(LocalEmbedder::new(config.dimensions))),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config, retry.clone())?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config, retry.clone())?)),
        other => Err(GatewayError::ApiRequest {
            message: format!("Unknown embedding provider '{other}'"),
        }),
    }
}

/// Build the external knowledge source, or `None` when external validation is disabled.
///
/// `keyword_model` is used for search-keyword extraction when
/// `use_llm_keywords` is set.
pub fn create_knowledge_source(
    config: &ExternalConfig,
    retry: &RetryConfig,
    keyword_model: Option<Arc<dyn GenerationModel>>,
) -> Result<Option<Arc<dyn ExternalKnowledgeSource>>, GatewayError> {
    if !config.enabled {
        return Ok(None);
    }
    match config.provider.as_str() {
        "semantic_scholar" => {
            let mut source = SemanticScholarSource::new(config, retry.clone())?;
            if config.use_llm_keywords
                && let Some(model) = keyword_model
            {
                source = source.with_keyword_model(model);
            }
            Ok(Some(Arc::new(source)))
        }
        other => Err(GatewayError::ApiRequest {
            message: format!("Unknown external knowledge source '{other}'"),
        }),
    }
}
