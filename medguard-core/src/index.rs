//! Brute-force in-memory vector index and chunk store.
//!
//! Exact cosine search over every stored vector. Suitable for small corpora,
//! tests and benchmarks; production deployments plug in a real index through
//! [`VectorIndex`].

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::GatewayError;
use crate::gateway::{ChunkStore, EmbeddingModel, VectorIndex};
use crate::similarity::cosine_similarity;
use crate::types::{SearchHit, StoredChunk};

/// Exact cosine-similarity index.
#[derive(Debug, Default, Clone)]
pub struct InMemoryVectorIndex {
    entries: Vec<(String, Vec<f32>)>,
    dimensions: Option<usize>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a vector. All vectors must share one dimensionality.
    pub fn insert(&mut self, id: impl Into<String>, vector: Vec<f32>) -> Result<(), GatewayError> {
        match self.dimensions {
            Some(expected) if expected != vector.len() => {
                return Err(GatewayError::DimensionMismatch {
                    expected,
                    got: vector.len(),
                });
            }
            None => self.dimensions = Some(vector.len()),
            _ => {}
        }
        let id = id.into();
        if let Some(slot) = self.entries.iter_mut().find(|(existing, _)| *existing == id) {
            slot.1 = vector;
        } else {
            self.entries.push((id, vector));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<SearchHit>, GatewayError> {
        if let Some(expected) = self.dimensions
            && expected != vector.len()
        {
            return Err(GatewayError::DimensionMismatch {
                expected,
                got: vector.len(),
            });
        }
        let mut hits: Vec<SearchHit> = self
            .entries
            .iter()
            .map(|(id, v)| SearchHit {
                chunk_id: id.clone(),
                score: cosine_similarity(vector, v) as f32,
            })
            .collect();
        // Ties break on id so results are reproducible.
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

/// Chunk store backed by a hash map.
#[derive(Debug, Default, Clone)]
pub struct InMemoryChunkStore {
    chunks: HashMap<String, StoredChunk>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, chunk: StoredChunk) {
        self.chunks.insert(id.into(), chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn get(&self, chunk_id: &str) -> Result<Option<StoredChunk>, GatewayError> {
        Ok(self.chunks.get(chunk_id).cloned())
    }
}

/// A chunk to be indexed: `(chunk id, source document id, text)`.
pub type CorpusEntry<'a> = (&'a str, &'a str, &'a str);

/// Embed a corpus and build a matching index and store in one pass.
pub async fn build_corpus(
    embedder: &dyn EmbeddingModel,
    entries: &[CorpusEntry<'_>],
) -> Result<(InMemoryVectorIndex, InMemoryChunkStore), GatewayError> {
    let texts: Vec<String> = entries.iter().map(|(_, _, t)| t.to_string()).collect();
    let vectors = embedder.embed_batch(&texts).await?;
    let mut index = InMemoryVectorIndex::new();
    let mut store = InMemoryChunkStore::new();
    for ((id, doc, text), vector) in entries.iter().zip(vectors) {
        index.insert(*id, vector)?;
        store.insert(
            *id,
            StoredChunk {
                text: text.to_string(),
                source_document_id: doc.to_string(),
            },
        );
    }
    tracing::debug!(chunks = index.len(), "Built in-memory corpus");
    Ok((index, store))
}
