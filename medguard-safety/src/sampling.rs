//! Bounded fan-out of generation trials and embedding calls.
//!
//! Every call is guarded by a per-call timeout and the query's cancellation
//! token. Results come back in input order regardless of completion order.

use futures::StreamExt;
use futures::stream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use medguard_core::error::{GatewayError, MedGuardError};
use medguard_core::gateway::{EmbeddingModel, GenerationModel};
use medguard_core::guard::guarded_call;
use medguard_core::types::SamplingConfig;

/// A contained failure inside one signal: what failed and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignalFailure {
    /// The failing unit, e.g. "sentence 2", "chunk c7", "trial 1".
    pub subject: String,
    pub message: String,
}

impl SignalFailure {
    pub fn new(subject: impl Into<String>, error: &GatewayError) -> Self {
        Self {
            subject: subject.into(),
            message: error.to_string(),
        }
    }
}

/// Answers that survived a trial fan-out, in trial order.
#[derive(Debug, Clone, Default)]
pub struct TrialOutcome {
    pub requested: usize,
    pub answers: Vec<String>,
    pub failures: Vec<SignalFailure>,
}

impl TrialOutcome {
    pub fn survivors(&self) -> usize {
        self.answers.len()
    }
}

/// Generates independent trials of one prompt with bounded concurrency.
#[derive(Clone)]
pub struct TrialSampler {
    generator: Arc<dyn GenerationModel>,
    timeout: Duration,
    max_concurrency: usize,
}

impl TrialSampler {
    pub fn new(
        generator: Arc<dyn GenerationModel>,
        timeout: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            generator,
            timeout,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Run `n` trials. Failed or timed-out trials are dropped and recorded;
    /// cancellation aborts the whole fan-out.
    pub async fn sample(
        &self,
        prompt: &str,
        sampling: SamplingConfig,
        n: usize,
        cancel: &CancellationToken,
    ) -> Result<TrialOutcome, MedGuardError> {
        let results: Vec<(usize, Result<String, GatewayError>)> = stream::iter(0..n)
            .map(|i| {
                let generator = Arc::clone(&self.generator);
                async move {
                    let out =
                        guarded_call(self.timeout, cancel, generator.generate(prompt, &sampling))
                            .await;
                    (i, out)
                }
            })
            .buffered(self.max_concurrency)
            .collect()
            .await;

        if cancel.is_cancelled() {
            return Err(MedGuardError::Cancelled);
        }

        let mut outcome = TrialOutcome {
            requested: n,
            ..Default::default()
        };
        for (i, result) in results {
            match result {
                Ok(text) => outcome.answers.push(text.trim().to_string()),
                Err(GatewayError::Cancelled) => return Err(MedGuardError::Cancelled),
                Err(e) => {
                    warn!(trial = i, error = %e, "Trial generation failed; dropping trial");
                    outcome
                        .failures
                        .push(SignalFailure::new(format!("trial {i}"), &e));
                }
            }
        }
        debug!(
            requested = n,
            survivors = outcome.survivors(),
            temperature = sampling.temperature,
            "Trial fan-out complete"
        );
        Ok(outcome)
    }
}

/// Embed each text independently, keeping per-text failures.
///
/// Returns `Err(Cancelled)` if the token fires; every other failure is
/// reported in place.
pub async fn embed_each(
    embedder: &dyn EmbeddingModel,
    texts: &[String],
    timeout: Duration,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<Vec<Result<Vec<f32>, GatewayError>>, MedGuardError> {
    let results: Vec<Result<Vec<f32>, GatewayError>> = stream::iter(texts.iter())
        .map(|text| guarded_call(timeout, cancel, embedder.embed(text)))
        .buffered(concurrency.max(1))
        .collect()
        .await;
    if cancel.is_cancelled()
        || results
            .iter()
            .any(|r| matches!(r, Err(GatewayError::Cancelled)))
    {
        return Err(MedGuardError::Cancelled);
    }
    Ok(results)
}
