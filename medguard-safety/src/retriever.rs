//! Two-stage retrieval: broad vector recall, then precision rerank.

use futures::StreamExt;
use futures::stream;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use medguard_core::error::{GatewayError, RetrievalError};
use medguard_core::gateway::{ChunkStore, EmbeddingModel, VectorIndex};
use medguard_core::guard::guarded_call;
use medguard_core::types::RetrievedChunk;

use crate::reranker::Reranker;

/// Order candidates by rerank score, breaking ties by stage-1 score and
/// then by input position, and keep the first `k_final`.
///
/// `scores` must be parallel to `candidates`.
pub fn apply_rerank(
    candidates: Vec<RetrievedChunk>,
    scores: &[f32],
    k_final: usize,
) -> Vec<RetrievedChunk> {
    let mut ranked: Vec<(usize, RetrievedChunk)> = candidates
        .into_iter()
        .zip(scores)
        .map(|(mut chunk, score)| {
            chunk.relevance_score = *score;
            chunk
        })
        .enumerate()
        .collect();
    ranked.sort_by(|(ia, a), (ib, b)| {
        b.relevance_score
            .total_cmp(&a.relevance_score)
            .then_with(|| b.recall_score.total_cmp(&a.recall_score))
            .then_with(|| ia.cmp(ib))
    });
    ranked.into_iter().take(k_final).map(|(_, c)| c).collect()
}

pub struct MultiStageRetriever {
    embedder: Arc<dyn EmbeddingModel>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn ChunkStore>,
    reranker: Option<Arc<dyn Reranker>>,
    timeout: Duration,
    store_concurrency: usize,
}

impl MultiStageRetriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingModel>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn ChunkStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            index,
            store,
            reranker: None,
            timeout,
            store_concurrency: 8,
        }
    }

    /// Upper bound on concurrent chunk-store lookups.
    pub fn with_store_concurrency(mut self, limit: usize) -> Self {
        self.store_concurrency = limit.max(1);
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Retrieve the `k_final` most relevant chunks for `query`.
    pub async fn retrieve(
        &self,
        query: &str,
        k_broad: usize,
        k_final: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        if k_final == 0 || k_final > k_broad {
            return Err(RetrievalError::InvalidParameters { k_broad, k_final });
        }

        let candidates = self.recall(query, k_broad, cancel).await?;
        if candidates.is_empty() {
            return Err(RetrievalError::NoResults);
        }

        let Some(reranker) = &self.reranker else {
            return Ok(candidates.into_iter().take(k_final).collect());
        };

        match reranker.score(query, &candidates, cancel).await {
            Ok(scores) if scores.len() == candidates.len() => {
                let out = apply_rerank(candidates, &scores, k_final);
                info!(
                    reranker = reranker.name(),
                    kept = out.len(),
                    "Reranked retrieval candidates"
                );
                Ok(out)
            }
            Ok(scores) => {
                warn!(
                    expected = candidates.len(),
                    got = scores.len(),
                    "Reranker score count mismatch; keeping stage-1 order"
                );
                Ok(candidates.into_iter().take(k_final).collect())
            }
            Err(GatewayError::Cancelled) => Err(RetrievalError::Cancelled),
            Err(e) => {
                warn!(reranker = reranker.name(), error = %e, "Reranker failed; keeping stage-1 order");
                Ok(candidates.into_iter().take(k_final).collect())
            }
        }
    }

    /// Stage 1: embed, search, resolve chunk text. Order follows the index.
    pub async fn recall(
        &self,
        query: &str,
        k_broad: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let vector = guarded_call(self.timeout, cancel, self.embedder.embed(query))
            .await
            .map_err(|e| match e {
                GatewayError::Cancelled => RetrievalError::Cancelled,
                other => RetrievalError::Embedding(other),
            })?;

        let hits = guarded_call(self.timeout, cancel, self.index.search(&vector, k_broad))
            .await
            .map_err(|e| match e {
                GatewayError::Cancelled => RetrievalError::Cancelled,
                other => RetrievalError::Search(other),
            })?;

        let resolved: Vec<_> = stream::iter(hits)
            .map(|hit| async move {
                let stored =
                    guarded_call(self.timeout, cancel, self.store.get(&hit.chunk_id)).await;
                (hit, stored)
            })
            .buffered(self.store_concurrency)
            .collect()
            .await;

        let mut chunks = Vec::with_capacity(resolved.len());
        for (hit, stored) in resolved {
            match stored {
                Ok(Some(chunk)) => chunks.push(RetrievedChunk {
                    id: hit.chunk_id,
                    text: chunk.text,
                    source_document_id: chunk.source_document_id,
                    relevance_score: hit.score,
                    recall_score: hit.score,
                }),
                Ok(None) => warn!(chunk_id = %hit.chunk_id, "Chunk missing from store; skipping"),
                Err(GatewayError::Cancelled) => return Err(RetrievalError::Cancelled),
                Err(e) => {
                    warn!(chunk_id = %hit.chunk_id, error = %e, "Chunk lookup failed; skipping")
                }
            }
        }
        debug!(
            query_len = query.len(),
            candidates = chunks.len(),
            "Stage-1 recall complete"
        );
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use medguard_core::index::{InMemoryChunkStore, build_corpus};
    use medguard_core::mock::{MockEmbeddingModel, MockVectorIndex};
    use medguard_core::providers::LocalEmbedder;
    use medguard_core::types::StoredChunk;

    struct FixedScores(Result<Vec<f32>, GatewayError>);

    #[async_trait]
    impl Reranker for FixedScores {
        async fn score(
            &self,
            _query: &str,
            _chunks: &[RetrievedChunk],
            _cancel: &CancellationToken,
        ) -> Result<Vec<f32>, GatewayError> {
            self.0.clone()
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn store(ids: &[&str]) -> Arc<InMemoryChunkStore> {
        let mut store = InMemoryChunkStore::new();
        for id in ids {
            store.insert(
                *id,
                StoredChunk {
                    text: format!("text of {id}"),
                    source_document_id: format!("doc-{id}"),
                },
            );
        }
        Arc::new(store)
    }

    fn retriever(hits: &[(&str, f32)], stored: &[&str]) -> MultiStageRetriever {
        MultiStageRetriever::new(
            Arc::new(MockEmbeddingModel::new(4)),
            Arc::new(MockVectorIndex::with_hits(hits)),
            store(stored),
            Duration::from_secs(1),
        )
    }

    fn ids(chunks: &[RetrievedChunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_apply_rerank_tie_breaks() {
        let mk = |id: &str, recall: f32| RetrievedChunk {
            id: id.into(),
            text: String::new(),
            source_document_id: String::new(),
            relevance_score: recall,
            recall_score: recall,
        };
        let out = apply_rerank(
            vec![mk("a", 0.5), mk("b", 0.9), mk("c", 0.9), mk("d", 0.1)],
            &[0.8, 0.8, 0.8, 0.95],
            4,
        );
        // d wins on rerank; b and c tie on both scores so input order holds; a has lower recall.
        assert_eq!(ids(&out), vec!["d", "b", "c", "a"]);
        assert_eq!(out[0].relevance_score, 0.95);
        assert_eq!(out[0].recall_score, 0.1);
    }

    #[tokio::test]
    async fn test_invalid_parameters() {
        let r = retriever(&[("a", 0.9)], &["a"]);
        let cancel = CancellationToken::new();
        assert!(matches!(
            r.retrieve("q", 5, 0, &cancel).await,
            Err(RetrievalError::InvalidParameters { .. })
        ));
        assert!(matches!(
            r.retrieve("q", 5, 6, &cancel).await,
            Err(RetrievalError::InvalidParameters {
                k_broad: 5,
                k_final: 6
            })
        ));
    }

    #[tokio::test]
    async fn test_missing_chunks_skipped() {
        let r = retriever(&[("a", 0.9), ("ghost", 0.8), ("b", 0.7)], &["a", "b"]);
        let out = r
            .retrieve("q", 3, 3, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids(&out), vec!["a", "b"]);
        assert_eq!(out[0].source_document_id, "doc-a");
    }

    #[tokio::test]
    async fn test_serial_store_lookups_keep_recall_order() {
        let r = retriever(&[("a", 0.9), ("b", 0.8), ("c", 0.7)], &["a", "b", "c"])
            .with_store_concurrency(1);
        let out = r
            .retrieve("q", 3, 3, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids(&out), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_no_results() {
        let r = retriever(&[("ghost", 0.9)], &[]);
        assert!(matches!(
            r.retrieve("q", 3, 1, &CancellationToken::new()).await,
            Err(RetrievalError::NoResults)
        ));
    }

    #[tokio::test]
    async fn test_search_failure_is_fatal() {
        let r = MultiStageRetriever::new(
            Arc::new(MockEmbeddingModel::new(4)),
            Arc::new(MockVectorIndex::failing(GatewayError::Connection {
                message: "index down".into(),
            })),
            store(&[]),
            Duration::from_secs(1),
        );
        assert!(matches!(
            r.retrieve("q", 3, 1, &CancellationToken::new()).await,
            Err(RetrievalError::Search(_))
        ));
    }

    #[tokio::test]
    async fn test_embedding_failure_is_fatal() {
        let r = MultiStageRetriever::new(
            Arc::new(MockEmbeddingModel::new(4).failing_all()),
            Arc::new(MockVectorIndex::with_hits(&[("a", 0.9)])),
            store(&["a"]),
            Duration::from_secs(1),
        );
        assert!(matches!(
            r.retrieve("q", 3, 1, &CancellationToken::new()).await,
            Err(RetrievalError::Embedding(_))
        ));
    }

    #[tokio::test]
    async fn test_rerank_reorders_and_truncates() {
        let r = retriever(&[("a", 0.9), ("b", 0.8), ("c", 0.7)], &["a", "b", "c"])
            .with_reranker(Arc::new(FixedScores(Ok(vec![0.1, 0.2, 0.9]))));
        let out = r
            .retrieve("q", 3, 2, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids(&out), vec!["c", "b"]);
        assert_eq!(out[0].recall_score, 0.7);
    }

    #[tokio::test]
    async fn test_reranker_failure_keeps_stage_one_order() {
        let r = retriever(&[("a", 0.9), ("b", 0.8), ("c", 0.7)], &["a", "b", "c"]).with_reranker(
            Arc::new(FixedScores(Err(GatewayError::Timeout { timeout_ms: 10 }))),
        );
        let out = r
            .retrieve("q", 3, 2, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids(&out), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_reranker_count_mismatch_keeps_stage_one_order() {
        let r = retriever(&[("a", 0.9), ("b", 0.8)], &["a", "b"])
            .with_reranker(Arc::new(FixedScores(Ok(vec![0.1]))));
        let out = r
            .retrieve("q", 2, 2, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids(&out), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_retrieval_is_idempotent() {
        let embedder = Arc::new(LocalEmbedder::new(128));
        let (index, store) = build_corpus(
            embedder.as_ref(),
            &[
                (
                    "c1",
                    "PMC1",
                    "Amoxicillin is first-line for community-acquired pneumonia.",
                ),
                (
                    "c2",
                    "PMC2",
                    "Doxycycline is an alternative for pneumonia in adults.",
                ),
                ("c3", "PMC3", "Total knee arthroplasty rehabilitation."),
            ],
        )
        .await
        .unwrap();
        let r = MultiStageRetriever::new(
            embedder.clone(),
            Arc::new(index),
            Arc::new(store),
            Duration::from_secs(1),
        )
        .with_reranker(Arc::new(crate::reranker::EmbeddingReranker::new(
            embedder,
            Duration::from_secs(1),
        )));
        let cancel = CancellationToken::new();
        let first = r
            .retrieve("pneumonia antibiotics", 3, 2, &cancel)
            .await
            .unwrap();
        let second = r
            .retrieve("pneumonia antibiotics", 3, 2, &cancel)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_ne!(first[0].id, "c3");
    }
}
