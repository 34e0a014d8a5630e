//! Capability traits for the external collaborators.
//!
//! Every model, index and knowledge-source client is injected as a trait object
//! at construction. Implementations must be safe to share between concurrent
//! queries; none of them may hold per-query state.

use async_trait::async_trait;

use crate::error::{ExternalSourceError, GatewayError};
use crate::types::{Evidence, SamplingConfig, SearchHit, StoredChunk};

/// Text embedding model.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError>;

    /// Embed a batch of texts. The default issues one call per text and fails
    /// on the first error; providers with a batch endpoint should override it.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Return the model name.
    fn model_name(&self) -> &str;
}

/// Text generation model.
#[async_trait]
pub trait GenerationModel: Send + Sync {
    /// Generate a completion for the prompt.
    async fn generate(&self, prompt: &str, sampling: &SamplingConfig)
    -> Result<String, GatewayError>;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

/// Nearest-neighbour vector index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Return up to `k` hits ordered by descending similarity.
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<SearchHit>, GatewayError>;
}

/// Chunk text lookup.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Resolve a chunk id. `Ok(None)` when the id is unknown.
    async fn get(&self, chunk_id: &str) -> Result<Option<StoredChunk>, GatewayError>;
}

/// External authority used to cross-check answer claims.
#[async_trait]
pub trait ExternalKnowledgeSource: Send + Sync {
    /// Fetch evidence relevant to the claims.
    async fn query(&self, claims: &[String]) -> Result<Evidence, ExternalSourceError>;

    /// Return the source name.
    fn source_name(&self) -> &str;
}
