//! Semantic entropy over meaning-equivalence clusters of sampled answers.
//!
//! Answers are grouped by greedy-representative clustering: each answer joins
//! the first cluster whose representative is similar enough, otherwise it
//! founds a new cluster. Shannon entropy over cluster sizes measures how
//! many distinct things the model says when asked the same question.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use medguard_core::config::EntropyConfig;
use medguard_core::error::MedGuardError;
use medguard_core::gateway::EmbeddingModel;
use medguard_core::similarity::cosine_similarity;
use medguard_core::types::{RetrievedChunk, SamplingConfig};

use crate::aggregate::ConfidenceLabel;
use crate::prompts::answer_prompt;
use crate::sampling::{SignalFailure, TrialOutcome, TrialSampler, embed_each};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub representative_answer: String,
    pub member_count: usize,
    /// Indices into the trial answers.
    pub members: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntropyResult {
    pub clusters: Vec<Cluster>,
    pub entropy_bits: f64,
    pub trial_count: usize,
    pub degraded: bool,
    pub failures: Vec<SignalFailure>,
}

impl EntropyResult {
    pub fn is_informative(&self) -> bool {
        self.trial_count >= 2
    }
}

/// Greedy-representative clustering.
///
/// An answer without a vector can only join a cluster whose representative
/// has identical text.
pub fn cluster_answers(
    answers: &[String],
    vectors: &[Option<Vec<f32>>],
    threshold: f64,
) -> Vec<Cluster> {
    let mut clusters: Vec<Cluster> = Vec::new();
    // Index of each cluster's representative.
    let mut reps: Vec<usize> = Vec::new();

    for (i, answer) in answers.iter().enumerate() {
        let joined = reps.iter().position(|&r| {
            if answers[r] == *answer {
                return true;
            }
            match (&vectors[r], &vectors[i]) {
                (Some(a), Some(b)) => cosine_similarity(a, b) >= threshold,
                _ => false,
            }
        });
        match joined {
            Some(c) => {
                clusters[c].member_count += 1;
                clusters[c].members.push(i);
            }
            None => {
                reps.push(i);
                clusters.push(Cluster {
                    representative_answer: answer.clone(),
                    member_count: 1,
                    members: vec![i],
                });
            }
        }
    }
    clusters
}

/// Shannon entropy in bits of the distribution given by `counts`.
pub fn shannon_entropy(counts: &[usize]) -> f64 {
    let total: usize = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    let h: f64 = counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum();
    // -0.0 for a single cluster
    h.max(0.0)
}

/// Map entropy into a certainty score in [0, 1]: `1 - min(H / H_max, 1)`.
///
/// `H_max` is `max_bits` when configured, else `log2(trial_count)`. `None`
/// when fewer than two trials make the normalization meaningless.
pub fn normalized_certainty(bits: f64, trial_count: usize, max_bits: Option<f64>) -> Option<f64> {
    if trial_count < 2 {
        return None;
    }
    let h_max = max_bits.unwrap_or_else(|| (trial_count as f64).log2());
    if h_max <= 0.0 {
        return None;
    }
    Some(1.0 - (bits / h_max).min(1.0))
}

pub struct EntropyEstimator {
    sampler: TrialSampler,
    embedder: Arc<dyn EmbeddingModel>,
    config: EntropyConfig,
    max_tokens: usize,
    timeout: Duration,
}

impl EntropyEstimator {
    pub fn new(
        sampler: TrialSampler,
        embedder: Arc<dyn EmbeddingModel>,
        config: EntropyConfig,
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

    pub fn config(&self) -> &EntropyConfig {
        &self.config
    }

    /// Confidence in the answer implied by an entropy value.
    pub fn confidence(&self, bits: f64) -> ConfidenceLabel {
        if bits < self.config.medium_uncertainty_bits {
            ConfidenceLabel::High
        } else if bits < self.config.high_uncertainty_bits {
            ConfidenceLabel::Medium
        } else {
            ConfidenceLabel::Low
        }
    }

    /// Certainty score for aggregation, or `None` if not informative.
    pub fn certainty(&self, result: &EntropyResult) -> Option<f64> {
        normalized_certainty(
            result.entropy_bits,
            result.trial_count,
            self.config.max_entropy_bits,
        )
    }

    /// Draw `samples` answers at the entropy temperature and estimate.
    pub async fn sample_and_estimate(
        &self,
        question: &str,
        chunks: &[RetrievedChunk],
        cancel: &CancellationToken,
    ) -> Result<EntropyResult, MedGuardError> {
        let prompt = answer_prompt(question, chunks);
        let sampling = SamplingConfig::new(self.config.temperature, self.max_tokens);
        let outcome = self
            .sampler
            .sample(&prompt, sampling, self.config.samples, cancel)
            .await?;
        self.estimate_outcome(outcome, cancel).await
    }

    /// Estimate entropy over already-generated answers.
    pub async fn estimate(
        &self,
        answers: &[String],
        cancel: &CancellationToken,
    ) -> Result<EntropyResult, MedGuardError> {
        let outcome = TrialOutcome {
            requested: answers.len(),
            answers: answers.to_vec(),
            failures: Vec::new(),
        };
        self.estimate_outcome(outcome, cancel).await
    }

    pub async fn estimate_outcome(
        &self,
        outcome: TrialOutcome,
        cancel: &CancellationToken,
    ) -> Result<EntropyResult, MedGuardError> {
        let TrialOutcome {
            requested,
            answers,
            mut failures,
        } = outcome;

        let all_identical = answers.windows(2).all(|w| w[0] == w[1]);
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; answers.len()];
        if !all_identical {
            let embedded = embed_each(
                self.embedder.as_ref(),
                &answers,
                self.timeout,
                self.config.embed_concurrency,
                cancel,
            )
            .await?;
            for (i, result) in embedded.into_iter().enumerate() {
                match result {
                    Ok(v) => vectors[i] = Some(v),
                    Err(e) => {
                        warn!(trial = i, error = %e, "Answer embedding failed; exact-match clustering only");
                        failures.push(SignalFailure::new(format!("trial {i} embedding"), &e));
                    }
                }
            }
        }

        let clusters = cluster_answers(&answers, &vectors, self.config.cluster_threshold);
        let counts: Vec<usize> = clusters.iter().map(|c| c.member_count).collect();
        let bits = shannon_entropy(&counts);
        let degraded = answers.len() < requested;
        debug!(
            trials = answers.len(),
            clusters = clusters.len(),
            entropy_bits = bits,
            "Semantic entropy estimated"
        );
        Ok(EntropyResult {
            trial_count: answers.len(),
            clusters,
            entropy_bits: bits,
            degraded,
            failures,
        })
    }
}
