//! Shared data types for retrieval, generation and assessment.

use serde::{Deserialize, Serialize};

use crate::text::split_sentences;

/// A chunk returned by retrieval, ordered by descending relevance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub text: String,
    pub source_document_id: String,
    /// Final relevance (stage-2 score when reranked, stage-1 otherwise).
    pub relevance_score: f32,
    /// Stage-1 vector similarity.
    pub recall_score: f32,
}

/// A generated answer with deterministic sentence segmentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub sentences: Vec<String>,
}

impl Answer {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let sentences = split_sentences(&text);
        Self { text, sentences }
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }
}

/// Sampling parameters for a generation call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub max_tokens: usize,
}

impl SamplingConfig {
    pub fn new(temperature: f32, max_tokens: usize) -> Self {
        Self {
            temperature,
            max_tokens,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 1024,
        }
    }
}

/// A raw vector-index hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
}

/// Chunk content resolved from the chunk store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub text: String,
    pub source_document_id: String,
}

/// Evidence returned by an external knowledge source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// Free-text passages (typically abstracts).
    pub passages: Vec<String>,
    /// Number of source records the passages came from.
    pub source_count: usize,
    /// The search query actually sent to the source.
    pub query_used: String,
}

impl Evidence {
    pub fn is_empty(&self) -> bool {
        self.passages.iter().all(|p| p.trim().is_empty())
    }
}
