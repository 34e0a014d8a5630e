//! Multi-trial consistency: resample the answer and measure agreement.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use medguard_core::config::ConsistencyConfig;
use medguard_core::error::MedGuardError;
use medguard_core::gateway::EmbeddingModel;
use medguard_core::similarity::support_score;
use medguard_core::types::{RetrievedChunk, SamplingConfig};

use crate::prompts::answer_prompt;
use crate::sampling::{SignalFailure, TrialOutcome, TrialSampler, embed_each};

/// Score reported when there are not enough trials to compare.
pub const SINGLE_TRIAL_SCORE: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyResult {
    pub trial_answers: Vec<String>,
    /// Symmetric, unit diagonal, one row per surviving trial.
    pub pairwise_similarity: Vec<Vec<f64>>,
    pub overall_score: f64,
    pub requested_trials: usize,
    /// Fewer than two trials survived out of two or more requested.
    pub degraded: bool,
    pub failures: Vec<SignalFailure>,
}

impl ConsistencyResult {
    /// Enough trials survived for the score to carry information.
    pub fn is_informative(&self) -> bool {
        self.trial_answers.len() >= 2
    }
}

/// Pairwise similarity over trial answers.
///
/// Byte-identical answers score exactly 1. Otherwise the clamped cosine of
/// their vectors, or 0 if either vector is missing.
pub fn similarity_matrix(answers: &[String], vectors: &[Option<Vec<f32>>]) -> Vec<Vec<f64>> {
    let n = answers.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        matrix[i][i] = 1.0;
        for j in (i + 1)..n {
            let sim = if answers[i] == answers[j] {
                1.0
            } else {
                match (&vectors[i], &vectors[j]) {
                    (Some(a), Some(b)) => support_score(a, b),
                    _ => 0.0,
                }
            };
            matrix[i][j] = sim;
            matrix[j][i] = sim;
        }
    }
    matrix
}

/// Mean of the off-diagonal entries. `None` for fewer than two rows.
pub fn mean_off_diagonal(matrix: &[Vec<f64>]) -> Option<f64> {
    let n = matrix.len();
    if n < 2 {
        return None;
    }
    let mut sum = 0.0;
    for (i, row) in matrix.iter().enumerate() {
        for (j, value) in row.iter().enumerate() {
            if i != j {
                sum += value;
            }
        }
    }
    Some(sum / (n * (n - 1)) as f64)
}

pub struct ConsistencyChecker {
    sampler: TrialSampler,
    embedder: Arc<dyn EmbeddingModel>,
    config: ConsistencyConfig,
    max_tokens: usize,
    timeout: Duration,
}

impl ConsistencyChecker {
    pub fn new(
        sampler: TrialSampler,
        embedder: Arc<dyn EmbeddingModel>,
        config: ConsistencyConfig,
        max_tokens: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            sampler,
            embedder,
            config,
            max_tokens,
            timeout,
        }
    }

    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig::new(self.config.temperature, self.max_tokens)
    }

    /// Generate `trials` answers with the primary prompt and score their agreement.
    pub async fn check(
        &self,
        question: &str,
        chunks: &[RetrievedChunk],
        trials: usize,
        cancel: &CancellationToken,
    ) -> Result<ConsistencyResult, MedGuardError> {
        if trials == 0 {
            return Err(MedGuardError::invalid_input(
                "consistency trials must be at least 1",
            ));
        }
        let prompt = answer_prompt(question, chunks);
        let outcome = self
            .sampler
            .sample(&prompt, self.sampling(), trials, cancel)
            .await?;
        self.score_trials(outcome, cancel).await
    }

    /// Score an already-sampled set of trials.
    pub async fn score_trials(
        &self,
        outcome: TrialOutcome,
        cancel: &CancellationToken,
    ) -> Result<ConsistencyResult, MedGuardError> {
        let TrialOutcome {
            requested,
            answers,
            mut failures,
        } = outcome;

        if answers.len() < 2 {
            let degraded = answers.len() < requested.min(2);
            if degraded {
                warn!(
                    requested,
                    survivors = answers.len(),
                    "Too few trials survived; consistency is a sentinel"
                );
            }
            let matrix = similarity_matrix(&answers, &vec![None; answers.len()]);
            return Ok(ConsistencyResult {
                trial_answers: answers,
                pairwise_similarity: matrix,
                overall_score: SINGLE_TRIAL_SCORE,
                requested_trials: requested,
                degraded,
                failures,
            });
        }

        // Only distinct texts need vectors; identical pairs short-circuit to 1.
        let mut distinct: Vec<String> = Vec::new();
        for a in &answers {
            if !distinct.contains(a) {
                distinct.push(a.clone());
            }
        }
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; answers.len()];
        if distinct.len() > 1 {
            let embedded = embed_each(
                self.embedder.as_ref(),
                &distinct,
                self.timeout,
                self.config.max_concurrency,
                cancel,
            )
            .await?;
            for (text, result) in distinct.iter().zip(embedded) {
                match result {
                    Ok(v) => {
                        for (slot, answer) in vectors.iter_mut().zip(&answers) {
                            if answer == text {
                                *slot = Some(v.clone());
                            }
                        }
                    }
                    Err(e) => {
                        let first = answers.iter().position(|a| a == text).unwrap_or(0);
                        warn!(trial = first, error = %e, "Trial embedding failed");
                        failures.push(SignalFailure::new(format!("trial {first} embedding"), &e));
                    }
                }
            }
        }

        let matrix = similarity_matrix(&answers, &vectors);
        let overall = mean_off_diagonal(&matrix).unwrap_or(SINGLE_TRIAL_SCORE);
        debug!(trials = answers.len(), overall, "Consistency scored");
        Ok(ConsistencyResult {
            trial_answers: answers,
            pairwise_similarity: matrix,
            overall_score: overall,
            requested_trials: requested,
            degraded: false,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medguard_core::error::GatewayError;
    use medguard_core::mock::{MockEmbeddingModel, MockGenerationModel};

    fn checker(
        generator: MockGenerationModel,
        embedder: Arc<MockEmbeddingModel>,
    ) -> ConsistencyChecker {
        ConsistencyChecker::new(
            TrialSampler::new(Arc::new(generator), Duration::from_secs(5), 3),
            embedder,
            ConsistencyConfig::default(),
            256,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_matrix_is_symmetric_with_unit_diagonal() {
        let answers = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let vectors = vec![Some(vec![1.0, 0.0]), Some(vec![0.6, 0.8]), None];
        let m = similarity_matrix(&answers, &vectors);
        for i in 0..3 {
            assert_eq!(m[i][i], 1.0);
            for j in 0..3 {
                assert_eq!(m[i][j], m[j][i]);
            }
        }
        assert!((m[0][1] - 0.6).abs() < 1e-6);
        assert_eq!(m[0][2], 0.0);
    }

    #[test]
    fn test_identical_text_without_vectors_is_one() {
        let answers = vec!["same".to_string(), "same".to_string()];
        let m = similarity_matrix(&answers, &[None, None]);
        assert_eq!(mean_off_diagonal(&m), Some(1.0));
    }

    #[tokio::test]
    async fn test_identical_trials_score_one_without_embedding() {
        let embedder = Arc::new(MockEmbeddingModel::new(8));
        let result = checker(
            MockGenerationModel::fixed("Azithromycin is safe."),
            embedder.clone(),
        )
        .check("q", &[], 3, &CancellationToken::new())
        .await
        .unwrap();
        assert_eq!(result.overall_score, 1.0);
        assert!(!result.degraded);
        assert_eq!(result.trial_answers.len(), 3);
        assert_eq!(embedder.call_count(), 0);
    }

    #[tokio::test]
    async fn test_single_trial_sentinel() {
        let embedder = Arc::new(MockEmbeddingModel::new(8));
        let result = checker(MockGenerationModel::fixed("x"), embedder)
            .check("q", &[], 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.overall_score, SINGLE_TRIAL_SCORE);
        assert!(!result.degraded);
    }

    #[tokio::test]
    async fn test_too_few_survivors_is_degraded() {
        let generator = MockGenerationModel::from_fn(|_, _, i| {
            if i == 0 {
                Ok("only one".into())
            } else {
                Err(GatewayError::Connection {
                    message: "down".into(),
                })
            }
        });
        let result = checker(generator, Arc::new(MockEmbeddingModel::new(8)))
            .check("q", &[], 3, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.overall_score, SINGLE_TRIAL_SCORE);
        assert!(result.degraded);
        assert_eq!(result.failures.len(), 2);
        assert!(!result.is_informative());
    }

    #[tokio::test]
    async fn test_divergent_trials_score_below_one() {
        let embedder = Arc::new(
            MockEmbeddingModel::new(2)
                .with_vector("yes", vec![1.0, 0.0])
                .with_vector("no", vec![0.0, 1.0]),
        );
        let result = checker(MockGenerationModel::cycle(&["yes", "no"]), embedder)
            .check("q", &[], 2, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.overall_score, 0.0);
    }

    #[tokio::test]
    async fn test_embedding_failure_contributes_zero() {
        let embedder = Arc::new(
            MockEmbeddingModel::new(2)
                .with_vector("a", vec![1.0, 0.0])
                .with_vector("b", vec![1.0, 0.0])
                .failing_when(|t| t == "c"),
        );
        let result = checker(MockGenerationModel::cycle(&["a", "b", "c"]), embedder)
            .check("q", &[], 3, &CancellationToken::new())
            .await
            .unwrap();
        // pairs: ab = 1, ac = 0, bc = 0
        assert!((result.overall_score - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_trials_rejected() {
        let result = checker(
            MockGenerationModel::fixed("x"),
            Arc::new(MockEmbeddingModel::new(2)),
        )
        .check("q", &[], 0, &CancellationToken::new())
        .await;
        assert!(matches!(result, Err(MedGuardError::InvalidInput { .. })));
    }
}
