//! Cross-checking answer claims against an external knowledge source.
//!
//! The outcome distinguishes "we could not check" (`Unavailable`) from "the
//! check is misconfigured" (`Error`). Neither produces a score, so neither
//! can pull the composite down.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use medguard_core::config::ExternalConfig;
use medguard_core::error::{ExternalSourceError, MedGuardError};
use medguard_core::gateway::{EmbeddingModel, ExternalKnowledgeSource};
use medguard_core::guard::{Interrupt, run_guarded};
use medguard_core::similarity::support_score;
use medguard_core::text::split_sentences_min;
use medguard_core::types::Answer;

use crate::interpret;
use crate::sampling::{SignalFailure, embed_each};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalStatus {
    Ok,
    Unavailable,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExternalValidationResult {
    /// Present only when `status` is `Ok`.
    pub score: Option<f64>,
    pub status: ExternalStatus,
    pub detail: String,
    pub interpretation: Option<String>,
    pub recommendation: Option<String>,
    pub query_used: Option<String>,
    pub evidence_count: usize,
    pub source: String,
    /// Claims or evidence sentences whose embedding failed.
    pub failures: Vec<SignalFailure>,
}

impl ExternalValidationResult {
    fn unavailable(source: &str, detail: impl Into<String>) -> Self {
        Self {
            score: None,
            status: ExternalStatus::Unavailable,
            detail: detail.into(),
            interpretation: None,
            recommendation: None,
            query_used: None,
            evidence_count: 0,
            source: source.to_string(),
            failures: Vec::new(),
        }
    }

    fn from_source_error(source: &str, err: ExternalSourceError) -> Self {
        let status = match err {
            ExternalSourceError::Unavailable { .. } => ExternalStatus::Unavailable,
            ExternalSourceError::Malformed { .. } => ExternalStatus::Error,
        };
        Self {
            status,
            ..Self::unavailable(source, err.to_string())
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ExternalStatus::Ok
    }

    /// Attach the fact-check recommendation given the internal support score.
    pub fn with_recommendation(mut self, internal_score: f64) -> Self {
        let external = if self.is_ok() { self.score } else { None };
        self.recommendation = Some(interpret::recommendation(internal_score, external).to_string());
        self
    }
}

/// Mean over claims of the best support among evidence sentences.
///
/// A claim without a vector contributes 0. `None` when there is no evidence
/// or no claim could be embedded.
pub fn claim_support(claims: &[Option<Vec<f32>>], evidence: &[Vec<f32>]) -> Option<f64> {
    if evidence.is_empty() || claims.iter().all(Option::is_none) {
        return None;
    }
    let total: f64 = claims
        .iter()
        .flatten()
        .map(|c| {
            evidence
                .iter()
                .map(|e| support_score(c, e))
                .fold(0.0, f64::max)
        })
        .sum();
    Some(total / claims.len() as f64)
}

pub struct ExternalValidator {
    source: Arc<dyn ExternalKnowledgeSource>,
    embedder: Arc<dyn EmbeddingModel>,
    config: ExternalConfig,
    embed_timeout: Duration,
}

impl ExternalValidator {
    pub fn new(
        source: Arc<dyn ExternalKnowledgeSource>,
        embedder: Arc<dyn EmbeddingModel>,
        config: ExternalConfig,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            source,
            embedder,
            config,
            embed_timeout,
        }
    }

    /// Claims to check: answer sentences of at least `min_claim_len` chars,
    /// or every sentence if none is that long.
    pub fn default_claims(&self, answer: &Answer) -> Vec<String> {
        let long: Vec<String> = answer
            .sentences
            .iter()
            .filter(|s| s.chars().count() >= self.config.min_claim_len)
            .cloned()
            .collect();
        if long.is_empty() {
            answer.sentences.clone()
        } else {
            long
        }
    }

    /// Validate the answer. The whole call, source query and embedding
    /// included, is bounded by the external timeout.
    ///
    /// Only cancellation is returned as an error; every other failure is
    /// folded into the result's status.
    pub async fn validate(
        &self,
        answer: &Answer,
        claims: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<ExternalValidationResult, MedGuardError> {
        let source = self.source.source_name().to_string();
        let claims: Vec<String> = match claims {
            Some(c) => c.to_vec(),
            None => self.default_claims(answer),
        };
        if claims.is_empty() {
            return Ok(ExternalValidationResult::unavailable(
                &source,
                "answer has no checkable claims",
            ));
        }

        match run_guarded(
            self.config.timeout(),
            cancel,
            self.check_claims(&source, &claims, cancel),
        )
        .await
        {
            Err(Interrupt::Cancelled) => Err(MedGuardError::Cancelled),
            Err(interrupt) => {
                let err = ExternalSourceError::from(interrupt);
                warn!(source = %source, error = %err, "External validation timed out");
                Ok(ExternalValidationResult::from_source_error(&source, err))
            }
            Ok(result) => result,
        }
    }

    async fn check_claims(
        &self,
        source: &str,
        claims: &[String],
        cancel: &CancellationToken,
    ) -> Result<ExternalValidationResult, MedGuardError> {
        let evidence = match self.source.query(claims).await {
            Ok(evidence) => evidence,
            Err(err) => {
                warn!(source = %source, error = %err, "External source failed");
                return Ok(ExternalValidationResult::from_source_error(source, err));
            }
        };

        let evidence_sentences: Vec<String> = evidence
            .passages
            .iter()
            .flat_map(|p| split_sentences_min(p, self.config.min_claim_len))
            .collect();
        if evidence_sentences.is_empty() {
            debug!(source = %source, query = %evidence.query_used, "No external evidence found");
            return Ok(ExternalValidationResult {
                query_used: Some(evidence.query_used),
                ..ExternalValidationResult::unavailable(source, "no evidence found")
            });
        }

        let concurrency = self.config.embed_concurrency;
        let (claim_vecs, evidence_vecs) = tokio::join!(
            embed_each(
                self.embedder.as_ref(),
                claims,
                self.embed_timeout,
                concurrency,
                cancel
            ),
            embed_each(
                self.embedder.as_ref(),
                &evidence_sentences,
                self.embed_timeout,
                concurrency,
                cancel
            ),
        );

        let mut failures = Vec::new();
        let claim_vecs: Vec<Option<Vec<f32>>> = claim_vecs?
            .into_iter()
            .enumerate()
            .map(|(i, r)| match r {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(claim = i, error = %e, "Claim embedding failed; scoring it 0");
                    failures.push(SignalFailure::new(format!("claim {i}"), &e));
                    None
                }
            })
            .collect();
        let evidence_vecs: Vec<Vec<f32>> = evidence_vecs?
            .into_iter()
            .enumerate()
            .filter_map(|(i, r)| match r {
                Ok(v) => Some(v),
                Err(e) => {
                    failures.push(SignalFailure::new(format!("evidence sentence {i}"), &e));
                    None
                }
            })
            .collect();

        let Some(score) = claim_support(&claim_vecs, &evidence_vecs) else {
            warn!(source = %source, "Embedding failed for every claim or evidence sentence");
            return Ok(ExternalValidationResult {
                query_used: Some(evidence.query_used),
                evidence_count: evidence.source_count,
                failures,
                ..ExternalValidationResult::unavailable(
                    source,
                    "embedding failed for external evidence",
                )
            });
        };

        debug!(
            source = %source,
            score,
            claims = claim_vecs.len(),
            evidence_sentences = evidence_vecs.len(),
            failures = failures.len(),
            "External validation scored"
        );
        Ok(ExternalValidationResult {
            score: Some(score),
            status: ExternalStatus::Ok,
            detail: format!(
                "{} claims checked against {} evidence sentences",
                claim_vecs.len(),
                evidence_vecs.len()
            ),
            interpretation: Some(interpret::external(score).to_string()),
            recommendation: None,
            query_used: Some(evidence.query_used),
            evidence_count: evidence.source_count,
            source: source.to_string(),
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medguard_core::mock::{MockEmbeddingModel, MockKnowledgeSource};

    fn validator(source: MockKnowledgeSource, embedder: MockEmbeddingModel) -> ExternalValidator {
        ExternalValidator::new(
            Arc::new(source),
            Arc::new(embedder),
            ExternalConfig {
                timeout_secs: 2,
                ..Default::default()
            },
            Duration::from_secs(1),
        )
    }

    fn answer() -> Answer {
        Answer::new("Amoxicillin is first-line for pneumonia. Ok.")
    }

    #[test]
    fn test_default_claims_skip_short_sentences() {
        let v = validator(
            MockKnowledgeSource::with_passages(&[]),
            MockEmbeddingModel::new(4),
        );
        assert_eq!(
            v.default_claims(&answer()),
            vec!["Amoxicillin is first-line for pneumonia"]
        );
    }

    #[tokio::test]
    async fn test_supported_claims_score_ok() {
        let source =
            MockKnowledgeSource::with_passages(&["Amoxicillin is first-line for pneumonia."]);
        let v = validator(source, MockEmbeddingModel::new(64));
        let result = v
            .validate(&answer(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, ExternalStatus::Ok);
        assert!(result.score.unwrap() > 0.99);
        assert!(result.interpretation.unwrap().starts_with("Strong"));
        assert_eq!(result.evidence_count, 1);
    }

    #[tokio::test]
    async fn test_no_evidence_is_unavailable() {
        let v = validator(
            MockKnowledgeSource::with_passages(&[]),
            MockEmbeddingModel::new(4),
        );
        let result = v
            .validate(&answer(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, ExternalStatus::Unavailable);
        assert!(result.score.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_unavailable() {
        let source = MockKnowledgeSource::with_passages(&["Some long evidence sentence."])
            .with_delay(Duration::from_secs(60));
        let v = validator(source, MockEmbeddingModel::new(4));
        let result = v
            .validate(&answer(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, ExternalStatus::Unavailable);
        assert!(result.detail.contains("timed out"));
    }

    #[tokio::test]
    async fn test_malformed_is_error() {
        let source = MockKnowledgeSource::failing(ExternalSourceError::malformed("HTTP 400"));
        let v = validator(source, MockEmbeddingModel::new(4));
        let result = v
            .validate(&answer(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, ExternalStatus::Error);
        assert!(result.score.is_none());
        assert!(result.detail.contains("HTTP 400"));
    }

    #[tokio::test]
    async fn test_embedding_failure_is_unavailable() {
        let source = MockKnowledgeSource::with_passages(&["Amoxicillin is first-line."]);
        let v = validator(source, MockEmbeddingModel::new(4).failing_all());
        let result = v
            .validate(&answer(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, ExternalStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let v = validator(
            MockKnowledgeSource::with_passages(&["x"]),
            MockEmbeddingModel::new(4),
        );
        assert!(matches!(
            v.validate(&answer(), None, &cancel).await,
            Err(MedGuardError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_failed_claim_counts_as_zero_support() {
        let source =
            MockKnowledgeSource::with_passages(&["Amoxicillin is first-line for pneumonia."]);
        let embedder = MockEmbeddingModel::new(64).failing_when(|t| t.starts_with("Vitamin C"));
        let v = validator(source, embedder);
        let answer = Answer::new(
            "Amoxicillin is first-line for pneumonia. Vitamin C cures every pneumonia case.",
        );
        let result = v
            .validate(&answer, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, ExternalStatus::Ok);
        assert!((result.score.unwrap() - 0.5).abs() < 1e-6);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].subject, "claim 1");
        assert!(result.detail.starts_with("2 claims"));
    }

    #[test]
    fn test_claim_support_scores_missing_claims_zero() {
        let evidence = vec![vec![1.0, 0.0]];
        assert_eq!(
            claim_support(&[Some(vec![1.0, 0.0]), None], &evidence),
            Some(0.5)
        );
        assert_eq!(claim_support(&[None, None], &evidence), None);
        assert_eq!(claim_support(&[Some(vec![1.0, 0.0])], &[]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_embedding_bounded_by_external_timeout() {
        let source =
            MockKnowledgeSource::with_passages(&["Amoxicillin is first-line for pneumonia."]);
        let v = ExternalValidator::new(
            Arc::new(source),
            Arc::new(MockEmbeddingModel::new(64).with_delay(Duration::from_secs(20))),
            ExternalConfig {
                timeout_secs: 2,
                ..Default::default()
            },
            Duration::from_secs(60),
        );
        let started = tokio::time::Instant::now();
        let result = v
            .validate(&answer(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, ExternalStatus::Unavailable);
        assert!(result.score.is_none());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_recommendation_ignores_unavailable_score() {
        let r = ExternalValidationResult::unavailable("s", "down").with_recommendation(0.8);
        assert!(
            r.recommendation
                .unwrap()
                .contains("external validation unavailable")
        );
    }
}
