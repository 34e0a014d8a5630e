//! Semantic Scholar paper search as an external knowledge source.
//!
//! Claims are reduced to a short keyword query (heuristically, or by asking a
//! generation model), sent to the Graph API `paper/search` endpoint, and the
//! returned abstracts become evidence passages.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{http_client, with_retry};
use crate::config::{ExternalConfig, RetryConfig};
use crate::error::{ExternalSourceError, GatewayError};
use crate::gateway::{ExternalKnowledgeSource, GenerationModel};
use crate::text;
use crate::types::{Evidence, SamplingConfig};

const KEYWORD_PROMPT: &str = "\
You extract 3 to 6 concise keywords from a clinical answer for a literature search.

Rules:
1. Output ONE line containing only the keywords separated by spaces.
2. Use lower-case nouns; drop adjectives and stop-words.
3. Include a keyword for the main disease or problem, the intervention or drug class \
(if present), and the population or setting (if present).
4. No numbers, punctuation or explanations.
5. If the answer covers several topics, pick the most central one.

Answer:
{answer}

Keywords:";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Paper>,
}

#[derive(Debug, Deserialize)]
struct Paper {
    #[serde(default, rename = "abstract")]
    abstract_text: Option<String>,
}

/// Semantic Scholar Graph API client.
pub struct SemanticScholarSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    max_results: usize,
    max_keywords: usize,
    keyword_sampling: SamplingConfig,
    timeout: Duration,
    retry: RetryConfig,
    keyword_model: Option<Arc<dyn GenerationModel>>,
}

impl SemanticScholarSource {
    pub fn new(config: &ExternalConfig, retry: RetryConfig) -> Result<Self, GatewayError> {
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.trim().is_empty());
        Ok(Self {
            client: http_client(config.timeout())?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_results: config.max_results.max(1),
            max_keywords: config.max_keywords.max(1),
            keyword_sampling: config.keyword_sampling(),
            timeout: config.timeout(),
            retry,
            keyword_model: None,
        })
    }

    /// Use a generation model to pick search keywords.
    pub fn with_keyword_model(mut self, model: Arc<dyn GenerationModel>) -> Self {
        self.keyword_model = Some(model);
        self
    }

    /// Build the search query for a set of claims.
    ///
    /// Falls back to the heuristic extractor when the keyword model fails or
    /// returns nothing usable.
    pub async fn build_query(&self, claims: &[String]) -> String {
        let joined = claims.join(" ");
        if let Some(model) = &self.keyword_model {
            let prompt = KEYWORD_PROMPT.replace("{answer}", &joined);
            match model.generate(&prompt, &self.keyword_sampling).await {
                Ok(raw) => {
                    let cleaned = text::keywords(&raw, self.max_keywords).join(" ");
                    if !cleaned.is_empty() {
                        return cleaned;
                    }
                    debug!("Keyword model returned no usable keywords");
                }
                Err(e) => warn!(error = %e, "Keyword extraction failed, using heuristic"),
            }
        }
        text::keywords(&joined, self.max_keywords).join(" ")
    }

    async fn search_once(&self, query: &str) -> Result<String, GatewayError> {
        let url = format!("{}/paper/search", self.base_url);
        let limit = self.max_results.to_string();
        let mut request = self.client.get(&url).query(&[
            ("query", query),
            ("limit", limit.as_str()),
            ("fields", "title,abstract"),
        ]);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| super::map_transport_error(e, self.timeout))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| super::map_transport_error(e, self.timeout))?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_status(status, &body))
        }
    }
}

/// 429 and 5xx are transient; anything else is a request we got wrong.
fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        GatewayError::RateLimited {
            retry_after_secs: 1,
        }
    } else if status.is_server_error() {
        GatewayError::Connection {
            message: format!("Semantic Scholar returned {status}"),
        }
    } else {
        GatewayError::ApiRequest {
            message: format!("Semantic Scholar returned {status}: {body}"),
        }
    }
}

fn to_source_error(err: GatewayError) -> ExternalSourceError {
    match err {
        GatewayError::ApiRequest { message } | GatewayError::ResponseParse { message } => {
            ExternalSourceError::malformed(message)
        }
        GatewayError::AuthFailed { provider } => {
            ExternalSourceError::malformed(format!("authentication failed for {provider}"))
        }
        other => ExternalSourceError::unavailable(other.to_string()),
    }
}

/// Parse a `paper/search` body into evidence, skipping papers without abstracts.
fn parse_evidence(body: &str, query: &str) -> Result<Evidence, ExternalSourceError> {
    let response: SearchResponse = serde_json::from_str(body)
        .map_err(|e| ExternalSourceError::malformed(format!("invalid search response: {e}")))?;
    let passages: Vec<String> = response
        .data
        .into_iter()
        .filter_map(|p| p.abstract_text)
        .filter(|a| !a.trim().is_empty())
        .collect();
    Ok(Evidence {
        source_count: passages.len(),
        passages,
        query_used: query.to_string(),
    })
}

#[async_trait]
impl ExternalKnowledgeSource for SemanticScholarSource {
    async fn query(&self, claims: &[String]) -> Result<Evidence, ExternalSourceError> {
        let query = self.build_query(claims).await;
        if query.is_empty() {
            return Ok(Evidence::default());
        }
        debug!(query = %query, "Searching Semantic Scholar");
        let body = with_retry(&self.retry, || self.search_once(&query))
            .await
            .map_err(to_source_error)?;
        let evidence = parse_evidence(&body, &query)?;
        debug!(abstracts = evidence.passages.len(), "Semantic Scholar search complete");
        Ok(evidence)
    }

    fn source_name(&self) -> &str {
        "semantic_scholar"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGenerationModel;
    use pretty_assertions::assert_eq;

    fn source() -> SemanticScholarSource {
        SemanticScholarSource::new(&ExternalConfig::default(), RetryConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_evidence_skips_missing_abstracts() {
        let body = r#"{"total": 3, "data": [
            {"paperId": "a", "title": "T1", "abstract": "Amoxicillin remains first-line."},
            {"paperId": "b", "title": "T2", "abstract": null},
            {"paperId": "c", "title": "T3"}
        ]}"#;
        let evidence = parse_evidence(body, "amoxicillin pneumonia").unwrap();
        assert_eq!(evidence.passages, vec!["Amoxicillin remains first-line."]);
        assert_eq!(evidence.source_count, 1);
        assert_eq!(evidence.query_used, "amoxicillin pneumonia");
    }

    #[test]
    fn test_parse_evidence_empty_result() {
        let evidence = parse_evidence(r#"{"total": 0}"#, "q").unwrap();
        assert!(evidence.is_empty());
    }

    #[test]
    fn test_parse_evidence_malformed() {
        assert!(matches!(
            parse_evidence("<html>", "q"),
            Err(ExternalSourceError::Malformed { .. })
        ));
        assert!(matches!(
            parse_evidence(r#"{"data": "oops"}"#, "q"),
            Err(ExternalSourceError::Malformed { .. })
        ));
    }

    #[test]
    fn test_status_classification() {
        let unavailable = to_source_error(classify_status(StatusCode::TOO_MANY_REQUESTS, ""));
        assert!(matches!(unavailable, ExternalSourceError::Unavailable { .. }));
        let down = to_source_error(classify_status(StatusCode::BAD_GATEWAY, ""));
        assert!(matches!(down, ExternalSourceError::Unavailable { .. }));
        let bad = to_source_error(classify_status(StatusCode::BAD_REQUEST, "bad field"));
        assert!(matches!(bad, ExternalSourceError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_heuristic_query() {
        let query = source()
            .build_query(&["Amoxicillin is first-line for pneumonia in adults".into()])
            .await;
        assert_eq!(query, "amoxicillin first-line pneumonia adults");
    }

    #[tokio::test]
    async fn test_llm_query_used_when_available() {
        let model = MockGenerationModel::from_fn(|_, sampling, _| {
            assert_eq!(sampling.max_tokens, 32);
            Ok("Pneumonia, amoxicillin; adults".to_string())
        });
        let query = source()
            .with_keyword_model(Arc::new(model))
            .build_query(&["Some claim about lungs.".into()])
            .await;
        assert_eq!(query, "pneumonia amoxicillin adults");
    }

    #[tokio::test]
    async fn test_llm_query_falls_back_on_failure() {
        let model = MockGenerationModel::failing(GatewayError::Timeout { timeout_ms: 5 });
        let query = source()
            .with_keyword_model(Arc::new(model))
            .build_query(&["Sepsis needs early antibiotics".into()])
            .await;
        assert_eq!(query, "sepsis needs early antibiotics");
    }
}
