//! Query decomposition for complex multi-part questions.
//!
//! The generation model splits the question into a few sub-questions. Each is
//! retrieved and answered separately, the contexts are merged so every
//! sub-question is represented, and the final answer is synthesized from the
//! sub-answers.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use medguard_core::error::{GatewayError, RetrievalError};
use medguard_core::gateway::GenerationModel;
use medguard_core::guard::guarded_call;
use medguard_core::types::{RetrievedChunk, SamplingConfig};

use crate::prompts::{answer_prompt, decompose_prompt, parse_sub_questions, synthesis_prompt};
use crate::retriever::MultiStageRetriever;

/// One sub-question answered against its own retrieved context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubAnswer {
    pub question: String,
    pub answer: String,
    /// Chunks the sub-answer was generated from.
    pub chunk_ids: Vec<String>,
}

/// Retrieval outcome for a possibly decomposed question.
#[derive(Debug, Clone, Default)]
pub struct DecomposedRetrieval {
    pub sub_questions: Vec<String>,
    /// Context of every sub-question that returned chunks, in sub-question order.
    pub per_sub: Vec<(String, Vec<RetrievedChunk>)>,
    /// Merged context for the original question.
    pub chunks: Vec<RetrievedChunk>,
}

impl DecomposedRetrieval {
    /// Plain retrieval for the original question.
    pub fn direct(chunks: Vec<RetrievedChunk>) -> Self {
        Self {
            chunks,
            ..Default::default()
        }
    }

    /// True when at least one sub-question has its own context.
    pub fn is_decomposed(&self) -> bool {
        !self.per_sub.is_empty()
    }
}

pub struct QueryDecomposer {
    generator: Arc<dyn GenerationModel>,
    timeout: Duration,
    max_sub_questions: usize,
    sampling: SamplingConfig,
}

impl QueryDecomposer {
    pub fn new(
        generator: Arc<dyn GenerationModel>,
        timeout: Duration,
        max_sub_questions: usize,
        sampling: SamplingConfig,
    ) -> Self {
        Self {
            generator,
            timeout,
            max_sub_questions: max_sub_questions.max(2),
            sampling,
        }
    }

    /// Split `question` into sub-questions. May return an empty list.
    pub async fn decompose(
        &self,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, GatewayError> {
        let prompt = decompose_prompt(question, self.max_sub_questions);
        let response = guarded_call(
            self.timeout,
            cancel,
            self.generator.generate(&prompt, &self.sampling),
        )
        .await?;
        let subs = parse_sub_questions(&response, self.max_sub_questions);
        debug!(count = subs.len(), "Decomposed question");
        Ok(subs)
    }

    /// Merged context only; see [`QueryDecomposer::retrieve_decomposed`].
    pub async fn retrieve(
        &self,
        retriever: &MultiStageRetriever,
        question: &str,
        k_broad: usize,
        k_final: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        self.retrieve_decomposed(retriever, question, k_broad, k_final, cancel)
            .await
            .map(|r| r.chunks)
    }

    /// Retrieve for each sub-question and merge, falling back to direct
    /// retrieval when decomposition or every sub-retrieval yields nothing.
    pub async fn retrieve_decomposed(
        &self,
        retriever: &MultiStageRetriever,
        question: &str,
        k_broad: usize,
        k_final: usize,
        cancel: &CancellationToken,
    ) -> Result<DecomposedRetrieval, RetrievalError> {
        if k_final == 0 || k_final > k_broad {
            return Err(RetrievalError::InvalidParameters { k_broad, k_final });
        }

        let subs = match self.decompose(question, cancel).await {
            Ok(subs) => subs,
            Err(GatewayError::Cancelled) => return Err(RetrievalError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Query decomposition failed; retrieving directly");
                Vec::new()
            }
        };
        if subs.is_empty() {
            return retriever
                .retrieve(question, k_broad, k_final, cancel)
                .await
                .map(DecomposedRetrieval::direct);
        }

        let mut per_sub = Vec::with_capacity(subs.len());
        for sub in &subs {
            match retriever.retrieve(sub, k_broad, k_final, cancel).await {
                Ok(chunks) => per_sub.push((sub.clone(), chunks)),
                Err(RetrievalError::NoResults) => {
                    debug!(sub_question = %sub, "No chunks for sub-question");
                }
                Err(e) => return Err(e),
            }
        }

        let merged = merge_round_robin(
            per_sub.iter().map(|(_, chunks)| chunks.clone()).collect(),
            k_final,
        );
        if merged.is_empty() {
            return retriever
                .retrieve(question, k_broad, k_final, cancel)
                .await
                .map(DecomposedRetrieval::direct);
        }
        info!(
            sub_questions = subs.len(),
            answered = per_sub.len(),
            chunks = merged.len(),
            "Merged decomposed retrieval"
        );
        Ok(DecomposedRetrieval {
            sub_questions: subs,
            per_sub,
            chunks: merged,
        })
    }

    /// Answer every sub-question from its own context, in order.
    pub async fn answer_sub_questions(
        &self,
        per_sub: &[(String, Vec<RetrievedChunk>)],
        sampling: &SamplingConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<SubAnswer>, GatewayError> {
        let mut answers = Vec::with_capacity(per_sub.len());
        for (question, chunks) in per_sub {
            let prompt = answer_prompt(question, chunks);
            let text = guarded_call(
                self.timeout,
                cancel,
                self.generator.generate(&prompt, sampling),
            )
            .await?;
            debug!(sub_question = %question, "Answered sub-question");
            answers.push(SubAnswer {
                question: question.clone(),
                answer: text.trim().to_string(),
                chunk_ids: chunks.iter().map(|c| c.id.clone()).collect(),
            });
        }
        Ok(answers)
    }

    /// Combine the sub-answers into one answer to the original question.
    pub async fn synthesize(
        &self,
        question: &str,
        sub_answers: &[SubAnswer],
        sampling: &SamplingConfig,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError> {
        let prompt = synthesis_prompt(question, sub_answers);
        let text = guarded_call(
            self.timeout,
            cancel,
            self.generator.generate(&prompt, sampling),
        )
        .await?;
        Ok(text.trim().to_string())
    }
}

/// Take rank 0 of every list, then rank 1, and so on, skipping ids already
/// taken, until `k` chunks are selected. The result is re-sorted by
/// descending relevance (stable).
pub fn merge_round_robin(lists: Vec<Vec<RetrievedChunk>>, k: usize) -> Vec<RetrievedChunk> {
    let depth = lists.iter().map(Vec::len).max().unwrap_or(0);
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    'outer: for rank in 0..depth {
        for list in &lists {
            if out.len() >= k {
                break 'outer;
            }
            if let Some(chunk) = list.get(rank)
                && seen.insert(chunk.id.clone())
            {
                out.push(chunk.clone());
            }
        }
    }
    out.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
    out
}
