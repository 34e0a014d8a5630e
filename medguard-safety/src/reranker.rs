//! Stage-2 rerankers for the multi-stage retriever.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use medguard_core::error::GatewayError;
use medguard_core::gateway::{EmbeddingModel, GenerationModel};
use medguard_core::guard::guarded_call;
use medguard_core::similarity::support_score;
use medguard_core::types::{RetrievedChunk, SamplingConfig};

use crate::prompts::{parse_relevance, rerank_prompt};

/// Scores query/chunk relevance.
///
/// Returns one score in [0, 1] per input chunk, in input order. The
/// retriever treats any error, or a score count that doesn't match, as a
/// reason to keep stage-1 order.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn score(
        &self,
        query: &str,
        chunks: &[RetrievedChunk],
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, GatewayError>;

    fn name(&self) -> &str;
}

/// Cosine between query and chunk embeddings.
pub struct EmbeddingReranker {
    embedder: Arc<dyn EmbeddingModel>,
    timeout: Duration,
}

impl EmbeddingReranker {
    pub fn new(embedder: Arc<dyn EmbeddingModel>, timeout: Duration) -> Self {
        Self { embedder, timeout }
    }
}

#[async_trait]
impl Reranker for EmbeddingReranker {
    async fn score(
        &self,
        query: &str,
        chunks: &[RetrievedChunk],
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, GatewayError> {
        let mut texts = Vec::with_capacity(chunks.len() + 1);
        texts.push(query.to_string());
        texts.extend(chunks.iter().map(|c| c.text.clone()));
        let vectors = guarded_call(self.timeout, cancel, self.embedder.embed_batch(&texts)).await?;
        let Some((query_vec, chunk_vecs)) = vectors.split_first() else {
            return Err(GatewayError::ResponseParse {
                message: "embedding batch returned no vectors".into(),
            });
        };
        Ok(chunk_vecs
            .iter()
            .map(|v| support_score(query_vec, v) as f32)
            .collect())
    }

    fn name(&self) -> &str {
        "embedding"
    }
}

/// Relevance graded 0-10 by a generation model, one call per chunk.
pub struct LlmRelevanceReranker {
    generator: Arc<dyn GenerationModel>,
    timeout: Duration,
    concurrency: usize,
    sampling: SamplingConfig,
}

impl LlmRelevanceReranker {
    pub fn new(
        generator: Arc<dyn GenerationModel>,
        timeout: Duration,
        concurrency: usize,
        sampling: SamplingConfig,
    ) -> Self {
        Self {
            generator,
            timeout,
            concurrency: concurrency.max(1),
            sampling,
        }
    }
}

#[async_trait]
impl Reranker for LlmRelevanceReranker {
    async fn score(
        &self,
        query: &str,
        chunks: &[RetrievedChunk],
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, GatewayError> {
        let sampling = self.sampling;
        let grades: Vec<Result<String, GatewayError>> = stream::iter(
            chunks
                .iter()
                .map(|chunk| rerank_prompt(query, &chunk.text))
                .collect::<Vec<String>>(),
        )
        .map(|prompt| async move {
            guarded_call(
                self.timeout,
                cancel,
                self.generator.generate(&prompt, &sampling),
            )
            .await
        })
        .buffered(self.concurrency)
        .collect()
        .await;

        grades
            .into_iter()
            .map(|grade| {
                let raw = grade?;
                parse_relevance(&raw).ok_or_else(|| GatewayError::ResponseParse {
                    message: format!("unparseable relevance grade: {raw:?}"),
                })
            })
            .collect()
    }

    fn name(&self) -> &str {
        "llm"
    }
}
