//! Sentence-level attribution of an answer to its retrieved evidence.
//!
//! Each answer sentence is scored by its best embedding match among the
//! retrieved chunks. Sentences below the weak threshold are surfaced so a
//! reviewer can see exactly which claims lack support.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use medguard_core::config::{Aggregation, AttributionConfig};
use medguard_core::error::MedGuardError;
use medguard_core::gateway::EmbeddingModel;
use medguard_core::similarity::support_score;
use medguard_core::types::{Answer, RetrievedChunk};

use crate::sampling::{SignalFailure, embed_each};

/// An answer sentence whose support falls below the weak threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeakSentence {
    pub index: usize,
    pub sentence: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributionResult {
    /// Score per sentence, indexed like `Answer::sentences`.
    pub per_sentence_scores: Vec<f64>,
    pub overall_score: f64,
    pub aggregation: Aggregation,
    pub weak_sentences: Vec<WeakSentence>,
    pub failures: Vec<SignalFailure>,
}

/// Per-sentence support: max over chunks of the clamped cosine.
///
/// A sentence without a vector, or an empty chunk pool, scores 0.
pub fn sentence_scores(sentences: &[Option<Vec<f32>>], chunks: &[Vec<f32>]) -> Vec<f64> {
    sentences
        .iter()
        .map(|s| match s {
            Some(v) => chunks
                .iter()
                .map(|c| support_score(v, c))
                .fold(0.0, f64::max),
            None => 0.0,
        })
        .collect()
}

/// Fold sentence scores into one. Empty input scores 0.
pub fn aggregate_scores(scores: &[f64], aggregation: Aggregation) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    match aggregation {
        Aggregation::Mean => scores.iter().sum::<f64>() / scores.len() as f64,
        Aggregation::Min => scores.iter().copied().fold(f64::INFINITY, f64::min),
    }
}

pub fn weak_sentences(sentences: &[String], scores: &[f64], threshold: f64) -> Vec<WeakSentence> {
    sentences
        .iter()
        .zip(scores)
        .enumerate()
        .filter(|(_, (_, score))| **score < threshold)
        .map(|(index, (sentence, score))| WeakSentence {
            index,
            sentence: sentence.clone(),
            score: *score,
        })
        .collect()
}

pub struct AttributionScorer {
    embedder: Arc<dyn EmbeddingModel>,
    config: AttributionConfig,
    timeout: Duration,
}

impl AttributionScorer {
    pub fn new(
        embedder: Arc<dyn EmbeddingModel>,
        config: AttributionConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            config,
            timeout,
        }
    }

    /// Score every sentence of `answer` against `chunks`.
    ///
    /// Embedding failures degrade the affected sentence or chunk and are
    /// recorded; only cancellation is returned as an error.
    pub async fn score(
        &self,
        answer: &Answer,
        chunks: &[RetrievedChunk],
        cancel: &CancellationToken,
    ) -> Result<AttributionResult, MedGuardError> {
        let mut failures = Vec::new();

        if answer.sentences.is_empty() {
            debug!("Answer has no sentences; attribution is 0");
            return Ok(self.finish(answer, Vec::new(), failures));
        }

        let chunk_texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let (chunk_vectors, sentence_vectors) = tokio::join!(
            embed_each(
                self.embedder.as_ref(),
                &chunk_texts,
                self.timeout,
                self.config.embed_concurrency,
                cancel,
            ),
            embed_each(
                self.embedder.as_ref(),
                &answer.sentences,
                self.timeout,
                self.config.embed_concurrency,
                cancel,
            ),
        );

        let mut pool = Vec::with_capacity(chunks.len());
        for (chunk, result) in chunks.iter().zip(chunk_vectors?) {
            match result {
                Ok(v) => pool.push(v),
                Err(e) => {
                    warn!(chunk_id = %chunk.id, error = %e, "Chunk embedding failed; dropping chunk");
                    failures.push(SignalFailure::new(format!("chunk {}", chunk.id), &e));
                }
            }
        }

        let mut vectors = Vec::with_capacity(answer.sentences.len());
        for (i, result) in sentence_vectors?.into_iter().enumerate() {
            match result {
                Ok(v) => vectors.push(Some(v)),
                Err(e) => {
                    warn!(sentence = i, error = %e, "Sentence embedding failed; scoring 0");
                    failures.push(SignalFailure::new(format!("sentence {i}"), &e));
                    vectors.push(None);
                }
            }
        }

        let scores = sentence_scores(&vectors, &pool);
        Ok(self.finish(answer, scores, failures))
    }

    fn finish(
        &self,
        answer: &Answer,
        scores: Vec<f64>,
        failures: Vec<SignalFailure>,
    ) -> AttributionResult {
        let overall = aggregate_scores(&scores, self.config.aggregation);
        let weak = weak_sentences(&answer.sentences, &scores, self.config.weak_threshold);
        debug!(
            sentences = scores.len(),
            overall,
            weak = weak.len(),
            "Attribution scored"
        );
        AttributionResult {
            per_sentence_scores: scores,
            overall_score: overall,
            aggregation: self.config.aggregation,
            weak_sentences: weak,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medguard_core::mock::MockEmbeddingModel;

    fn chunk(id: &str, text: &str) -> RetrievedChunk {
        RetrievedChunk {
            id: id.into(),
            text: text.into(),
            source_document_id: "PMC1".into(),
            relevance_score: 1.0,
            recall_score: 1.0,
        }
    }

    fn scorer(embedder: MockEmbeddingModel) -> AttributionScorer {
        AttributionScorer::new(
            Arc::new(embedder),
            AttributionConfig::default(),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_sentence_score_is_max_over_chunks() {
        let scores = sentence_scores(
            &[Some(vec![1.0, 0.0]), None],
            &[vec![0.0, 1.0], vec![1.0, 0.0]],
        );
        assert!((scores[0] - 1.0).abs() < 1e-9);
        assert_eq!(scores[1], 0.0);
    }

    #[test]
    fn test_negative_cosine_clamps_to_zero() {
        let scores = sentence_scores(&[Some(vec![1.0, 0.0])], &[vec![-1.0, 0.0]]);
        assert_eq!(scores, vec![0.0]);
    }

    #[test]
    fn test_aggregate_mean_and_min() {
        assert!((aggregate_scores(&[0.9, 0.3, 0.6], Aggregation::Mean) - 0.6).abs() < 1e-9);
        assert_eq!(aggregate_scores(&[0.9, 0.3, 0.6], Aggregation::Min), 0.3);
        assert_eq!(aggregate_scores(&[], Aggregation::Min), 0.0);
    }

    #[tokio::test]
    async fn test_zero_sentences() {
        let result = scorer(MockEmbeddingModel::new(8))
            .score(
                &Answer::new(""),
                &[chunk("c1", "text")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.overall_score, 0.0);
        assert!(result.weak_sentences.is_empty());
    }

    #[tokio::test]
    async fn test_zero_chunks_makes_every_sentence_weak() {
        let answer = Answer::new("First claim here. Second claim here.");
        let result = scorer(MockEmbeddingModel::new(8))
            .score(&answer, &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.per_sentence_scores, vec![0.0, 0.0]);
        assert_eq!(result.weak_sentences.len(), 2);
    }

    #[tokio::test]
    async fn test_one_weak_sentence_of_three() {
        let answer = Answer::new("Alpha claim. Beta claim. Gamma claim.");
        let embedder = MockEmbeddingModel::new(2)
            .with_vector("Alpha claim", vec![1.0, 0.0])
            .with_vector("Beta claim", vec![0.3, 0.953_939_2])
            .with_vector("Gamma claim", vec![1.0, 0.0])
            .with_vector("evidence", vec![1.0, 0.0]);
        let result = scorer(embedder)
            .score(
                &answer,
                &[chunk("c1", "evidence")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.weak_sentences.len(), 1);
        assert_eq!(result.weak_sentences[0].index, 1);
        assert!((result.weak_sentences[0].score - 0.3).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_sentence_embedding_failure_is_contained() {
        let answer = Answer::new("Supported claim. Broken claim.");
        let embedder = MockEmbeddingModel::new(2)
            .with_vector("Supported claim", vec![1.0, 0.0])
            .with_vector("evidence", vec![1.0, 0.0])
            .failing_when(|t| t == "Broken claim");
        let result = scorer(embedder)
            .score(
                &answer,
                &[chunk("c1", "evidence")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.per_sentence_scores[1], 0.0);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].subject, "sentence 1");
        assert!((result.overall_score - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_all_chunks_failing_scores_zero() {
        let answer = Answer::new("A claim.");
        let embedder = MockEmbeddingModel::new(4).failing_when(|t| t.starts_with("chunk"));
        let result = scorer(embedder)
            .score(
                &answer,
                &[chunk("c1", "chunk one"), chunk("c2", "chunk two")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.overall_score, 0.0);
        assert_eq!(result.failures.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = scorer(MockEmbeddingModel::new(4))
            .score(&Answer::new("A claim."), &[chunk("c1", "x")], &cancel)
            .await;
        assert!(matches!(result, Err(MedGuardError::Cancelled)));
    }
}
