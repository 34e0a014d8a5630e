//! Scriptable in-process collaborators for testing and development.
//!
//! Each mock counts its calls and can inject latency or failures, so the
//! pipeline's degradation paths can be exercised without a network.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::error::{ExternalSourceError, GatewayError};
use crate::gateway::{EmbeddingModel, ExternalKnowledgeSource, GenerationModel, VectorIndex};
use crate::providers::LocalEmbedder;
use crate::types::{Evidence, SamplingConfig, SearchHit};

type GenerateFn = dyn Fn(&str, &SamplingConfig, usize) -> Result<String, GatewayError> + Send + Sync;
type DelayFn = dyn Fn(&str, usize) -> Option<Duration> + Send + Sync;

/// A mock generation model driven by a handler closure.
///
/// The handler receives the prompt, the sampling parameters and the zero-based
/// call index.
pub struct MockGenerationModel {
    name: String,
    handler: Box<GenerateFn>,
    delay: Option<Box<DelayFn>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockGenerationModel {
    pub fn from_fn<F>(handler: F) -> Self
    where
        F: Fn(&str, &SamplingConfig, usize) -> Result<String, GatewayError> + Send + Sync + 'static,
    {
        Self {
            name: "mock-generator".to_string(),
            handler: Box::new(handler),
            delay: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Always return the same text.
    pub fn fixed(text: &str) -> Self {
        let text = text.to_string();
        Self::from_fn(move |_, _, _| Ok(text.clone()))
    }

    /// Return the responses in order, wrapping around.
    pub fn cycle(responses: &[&str]) -> Self {
        let responses: Vec<String> = responses.iter().map(|s| s.to_string()).collect();
        Self::from_fn(move |_, _, i| {
            if responses.is_empty() {
                return Ok(String::new());
            }
            Ok(responses[i % responses.len()].clone())
        })
    }

    /// Always fail with the given error.
    pub fn failing(err: GatewayError) -> Self {
        Self::from_fn(move |_, _, _| Err(err.clone()))
    }

    /// Sleep before every call.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_delay_fn(move |_, _| Some(delay))
    }

    /// Sleep before selected calls, chosen by prompt and call index.
    pub fn with_delay_fn<F>(mut self, delay: F) -> Self
    where
        F: Fn(&str, usize) -> Option<Duration> + Send + Sync + 'static,
    {
        self.delay = Some(Box::new(delay));
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every prompt received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl GenerationModel for MockGenerationModel {
    async fn generate(
        &self,
        prompt: &str,
        sampling: &SamplingConfig,
    ) -> Result<String, GatewayError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
        if let Some(delay) = self.delay.as_ref().and_then(|f| f(prompt, index)) {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(prompt, sampling, index)
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

/// A mock embedding model.
///
/// Texts with an explicit vector get that vector; everything else falls back
/// to the hashed term-frequency embedding.
pub struct MockEmbeddingModel {
    fallback: LocalEmbedder,
    vectors: HashMap<String, Vec<f32>>,
    fail_when: Option<Box<dyn Fn(&str) -> bool + Send + Sync>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockEmbeddingModel {
    pub fn new(dimensions: usize) -> Self {
        Self {
            fallback: LocalEmbedder::new(dimensions),
            vectors: HashMap::new(),
            fail_when: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Pin the vector returned for an exact text.
    pub fn with_vector(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }

    /// Fail every call whose text matches the predicate.
    pub fn failing_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.fail_when = Some(Box::new(predicate));
        self
    }

    pub fn failing_all(self) -> Self {
        self.failing_when(|_| true)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingModel for MockEmbeddingModel {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_when.as_ref().is_some_and(|f| f(text)) {
            return Err(GatewayError::Connection {
                message: "mock embedding failure".into(),
            });
        }
        if let Some(v) = self.vectors.get(text) {
            return Ok(v.clone());
        }
        Ok(self.fallback.embed_text(text))
    }

    fn model_name(&self) -> &str {
        "mock-embedder"
    }
}

/// A mock external knowledge source returning a canned outcome.
pub struct MockKnowledgeSource {
    outcome: Result<Evidence, ExternalSourceError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockKnowledgeSource {
    pub fn with_passages(passages: &[&str]) -> Self {
        let passages: Vec<String> = passages.iter().map(|p| p.to_string()).collect();
        Self {
            outcome: Ok(Evidence {
                source_count: passages.len(),
                passages,
                query_used: "mock query".to_string(),
            }),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: ExternalSourceError) -> Self {
        Self {
            outcome: Err(err),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExternalKnowledgeSource for MockKnowledgeSource {
    async fn query(&self, _claims: &[String]) -> Result<Evidence, ExternalSourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.outcome.clone()
    }

    fn source_name(&self) -> &str {
        "mock-source"
    }
}

/// A vector index returning canned hits regardless of the query.
pub struct MockVectorIndex {
    outcome: Result<Vec<SearchHit>, GatewayError>,
}

impl MockVectorIndex {
    /// Hits in the given order, with the given scores.
    pub fn with_hits(hits: &[(&str, f32)]) -> Self {
        Self {
            outcome: Ok(hits
                .iter()
                .map(|(id, score)| SearchHit {
                    chunk_id: id.to_string(),
                    score: *score,
                })
                .collect()),
        }
    }

    pub fn failing(err: GatewayError) -> Self {
        Self { outcome: Err(err) }
    }
}

#[async_trait]
impl VectorIndex for MockVectorIndex {
    async fn search(&self, _vector: &[f32], k: usize) -> Result<Vec<SearchHit>, GatewayError> {
        self.outcome
            .clone()
            .map(|hits| hits.into_iter().take(k).collect())
    }
}
