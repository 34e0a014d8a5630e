//! The safety orchestrator: retrieve, generate, assess, aggregate.
//!
//! The four assessment signals run concurrently and share only borrows of
//! the answer and chunks. Retrieval and primary generation failures end the
//! query; anything that goes wrong inside a signal is contained there.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};

use medguard_core::config::{MedGuardConfig, RerankerKind};
use medguard_core::error::{ConfigError, MedGuardError, RetrievalError};
use medguard_core::gateway::{
    ChunkStore, EmbeddingModel, ExternalKnowledgeSource, GenerationModel, VectorIndex,
};
use medguard_core::guard::guarded_call;
use medguard_core::providers::{
    create_embedding_model, create_generation_model, create_knowledge_source,
};
use medguard_core::types::{Answer, RetrievedChunk};

use crate::aggregate::{CheckTally, ConfidenceLabel, SignalScores, aggregate};
use crate::assessment::{PipelineStage, SafetyAssessment, SignalResults, StageClock};
use crate::attribution::AttributionScorer;
use crate::consistency::{ConsistencyChecker, ConsistencyResult};
use crate::decompose::{DecomposedRetrieval, QueryDecomposer};
use crate::entropy::{EntropyEstimator, EntropyResult};
use crate::external::ExternalValidator;
use crate::interpret::{self, Interpretations};
use crate::prompts::answer_prompt;
use crate::reranker::{EmbeddingReranker, LlmRelevanceReranker, Reranker};
use crate::retriever::MultiStageRetriever;
use crate::sampling::TrialSampler;

pub struct SafetyOrchestrator {
    config: MedGuardConfig,
    generator: Arc<dyn GenerationModel>,
    retriever: MultiStageRetriever,
    decomposer: Option<QueryDecomposer>,
    sampler: TrialSampler,
    attribution: AttributionScorer,
    consistency: ConsistencyChecker,
    entropy: EntropyEstimator,
    external: Option<ExternalValidator>,
}

impl SafetyOrchestrator {
    /// Wire the pipeline from injected collaborators.
    ///
    /// The configuration is validated here and is immutable afterwards.
    /// External validation is off when `external_source` is `None` or the
    /// configuration disables it.
    pub fn new(
        config: MedGuardConfig,
        generator: Arc<dyn GenerationModel>,
        embedder: Arc<dyn EmbeddingModel>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn ChunkStore>,
        external_source: Option<Arc<dyn ExternalKnowledgeSource>>,
    ) -> Result<Self, MedGuardError> {
        config.validate()?;

        let generation_timeout = config.generation.timeout();
        let embed_timeout = config.embedding.timeout();
        let max_tokens = config.generation.max_tokens;

        let mut retriever = MultiStageRetriever::new(
            Arc::clone(&embedder),
            index,
            store,
            config.retrieval.timeout(),
        )
        .with_store_concurrency(config.retrieval.store_concurrency);
        if config.retrieval.use_reranker {
            let reranker: Arc<dyn Reranker> = match config.retrieval.reranker {
                RerankerKind::Embedding => {
                    Arc::new(EmbeddingReranker::new(Arc::clone(&embedder), embed_timeout))
                }
                RerankerKind::Llm => Arc::new(LlmRelevanceReranker::new(
                    Arc::clone(&generator),
                    generation_timeout,
                    config.retrieval.rerank_concurrency,
                    config.retrieval.rerank_sampling(),
                )),
            };
            retriever = retriever.with_reranker(reranker);
        }

        let decomposer = config.retrieval.decompose_complex_queries.then(|| {
            QueryDecomposer::new(
                Arc::clone(&generator),
                generation_timeout,
                config.retrieval.max_sub_questions,
                config.retrieval.decompose_sampling(),
            )
        });

        let sampler = TrialSampler::new(
            Arc::clone(&generator),
            generation_timeout,
            config.consistency.max_concurrency,
        );
        let attribution = AttributionScorer::new(
            Arc::clone(&embedder),
            config.attribution.clone(),
            embed_timeout,
        );
        let consistency = ConsistencyChecker::new(
            sampler.clone(),
            Arc::clone(&embedder),
            config.consistency.clone(),
            max_tokens,
            embed_timeout,
        );
        let entropy = EntropyEstimator::new(
            sampler.clone(),
            Arc::clone(&embedder),
            config.entropy.clone(),
            max_tokens,
            embed_timeout,
        );
        let external = external_source
            .filter(|_| config.external.enabled)
            .map(|source| {
                ExternalValidator::new(
                    source,
                    Arc::clone(&embedder),
                    config.external.clone(),
                    embed_timeout,
                )
            });

        info!(
            generator = generator.model_name(),
            embedder = embedder.model_name(),
            reranker = config.retrieval.use_reranker,
            decompose = decomposer.is_some(),
            external = external.is_some(),
            "Safety orchestrator ready"
        );

        Ok(Self {
            config,
            generator,
            retriever,
            decomposer,
            sampler,
            attribution,
            consistency,
            entropy,
            external,
        })
    }

    /// Build the model and knowledge-source clients from configuration.
    pub fn from_config(
        config: MedGuardConfig,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn ChunkStore>,
    ) -> Result<Self, MedGuardError> {
        let generator = create_generation_model(&config.generation, &config.retry)
            .map_err(|e| ConfigError::invalid(format!("generation provider: {e}")))?;
        let embedder = create_embedding_model(&config.embedding, &config.retry)
            .map_err(|e| ConfigError::invalid(format!("embedding provider: {e}")))?;
        let source = create_knowledge_source(
            &config.external,
            &config.retry,
            Some(Arc::clone(&generator)),
        )
        .map_err(|e| ConfigError::invalid(format!("external source: {e}")))?;
        Self::new(config, generator, embedder, index, store, source)
    }

    pub fn config(&self) -> &MedGuardConfig {
        &self.config
    }

    /// Run the full pipeline for one question.
    pub async fn assess(&self, question: &str) -> Result<SafetyAssessment, MedGuardError> {
        self.assess_with_cancel(question, &CancellationToken::new())
            .await
    }

    /// Run the full pipeline; cancelling `cancel` aborts every in-flight call
    /// and returns `Cancelled`.
    pub async fn assess_with_cancel(
        &self,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<SafetyAssessment, MedGuardError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(MedGuardError::invalid_input("question must not be empty"));
        }
        let span = info_span!("assess", question_chars = question.chars().count());
        self.run_pipeline(question, cancel).instrument(span).await
    }

    /// Assess a supplied answer against supplied chunks, skipping retrieval
    /// and generation.
    pub async fn assess_answer(
        &self,
        question: &str,
        answer: &str,
        chunks: Vec<RetrievedChunk>,
        cancel: &CancellationToken,
    ) -> Result<SafetyAssessment, MedGuardError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(MedGuardError::invalid_input("question must not be empty"));
        }
        let clock = StageClock::starting_at(PipelineStage::Assessing);
        let span = info_span!("assess_answer", chunks = chunks.len());
        self.finish_pipeline(question, Answer::new(answer.trim()), chunks, clock, cancel)
            .instrument(span)
            .await
    }

    async fn run_pipeline(
        &self,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<SafetyAssessment, MedGuardError> {
        let mut clock = StageClock::starting_at(PipelineStage::Retrieving);

        let DecomposedRetrieval {
            sub_questions,
            per_sub,
            chunks,
        } = self.retrieve(question, cancel).await?;
        debug!(
            chunks = chunks.len(),
            sub_questions = per_sub.len(),
            "Retrieved context"
        );
        clock.advance();

        let sampling = self.config.generation.sampling();
        let (text, sub_answers) = match &self.decomposer {
            Some(decomposer) if !per_sub.is_empty() => {
                let sub_answers = decomposer
                    .answer_sub_questions(&per_sub, &sampling, cancel)
                    .await
                    .map_err(MedGuardError::from_generation)?;
                let text = decomposer
                    .synthesize(question, &sub_answers, &sampling, cancel)
                    .await
                    .map_err(MedGuardError::from_generation)?;
                (text, sub_answers)
            }
            _ => {
                let prompt = answer_prompt(question, &chunks);
                let text = guarded_call(
                    self.config.generation.timeout(),
                    cancel,
                    self.generator.generate(&prompt, &sampling),
                )
                .await
                .map_err(MedGuardError::from_generation)?;
                (text, Vec::new())
            }
        };
        let answer = Answer::new(text.trim());
        debug!(
            sentences = answer.sentences.len(),
            synthesized = !sub_answers.is_empty(),
            "Generated answer"
        );
        clock.advance();

        let assessment = self
            .finish_pipeline(question, answer, chunks, clock, cancel)
            .await?;
        if sub_answers.is_empty() {
            return Ok(assessment);
        }
        Ok(assessment.with_decomposition(sub_questions, sub_answers))
    }

    async fn retrieve(
        &self,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<DecomposedRetrieval, MedGuardError> {
        let k_broad = self.config.retrieval.k_broad;
        let k_final = self.config.retrieval.k_final;
        let result = match &self.decomposer {
            Some(decomposer) => {
                decomposer
                    .retrieve_decomposed(&self.retriever, question, k_broad, k_final, cancel)
                    .await
            }
            None => self
                .retriever
                .retrieve(question, k_broad, k_final, cancel)
                .await
                .map(DecomposedRetrieval::direct),
        };
        result.map_err(|e| match e {
            RetrievalError::Cancelled => MedGuardError::Cancelled,
            other => MedGuardError::Retrieval(other),
        })
    }

    /// Assessing and aggregating stages.
    async fn finish_pipeline(
        &self,
        question: &str,
        answer: Answer,
        chunks: Vec<RetrievedChunk>,
        mut clock: StageClock,
        cancel: &CancellationToken,
    ) -> Result<SafetyAssessment, MedGuardError> {
        debug_assert_eq!(clock.stage(), PipelineStage::Assessing);

        let external = async {
            match &self.external {
                Some(validator) => validator.validate(&answer, None, cancel).await.map(Some),
                None => Ok(None),
            }
        };
        let (attribution, sampled, external) = tokio::join!(
            self.attribution.score(&answer, &chunks, cancel),
            self.sample_signals(question, &chunks, cancel),
            external,
        );
        if cancel.is_cancelled() {
            return Err(MedGuardError::Cancelled);
        }
        let attribution = attribution?;
        let (consistency, entropy) = sampled?;
        let external = external?.map(|e| e.with_recommendation(attribution.overall_score));
        clock.advance();

        let consistency_score = consistency
            .is_informative()
            .then_some(consistency.overall_score);
        let entropy_certainty = if entropy.is_informative() {
            self.entropy.certainty(&entropy)
        } else {
            None
        };
        let entropy_confidence = self.entropy.confidence(entropy.entropy_bits);
        let external_score = external
            .as_ref()
            .filter(|e| e.is_ok())
            .and_then(|e| e.score);

        let scores = SignalScores {
            attribution: Some(attribution.overall_score),
            consistency: consistency_score,
            entropy: entropy_certainty,
            external: external_score,
        };
        let composite = aggregate(&scores, &self.config.aggregation);

        let mut checks = CheckTally::default();
        checks.record(attribution.overall_score >= self.config.attribution.pass_threshold);
        if let Some(score) = consistency_score {
            checks.record(score >= self.config.consistency.pass_threshold);
        }
        if entropy_certainty.is_some() {
            checks.record(entropy_confidence == ConfidenceLabel::High);
        }
        if let Some(score) = external_score {
            checks.record(score >= self.config.external.pass_threshold);
        }

        let interpretations = Interpretations {
            attribution: interpret::attribution(attribution.overall_score).to_string(),
            consistency: consistency_score.map(|s| interpret::consistency(s).to_string()),
            entropy: entropy_certainty.map(|_| interpret::entropy(entropy_confidence).to_string()),
            external: external.as_ref().and_then(|e| e.interpretation.clone()),
            recommendation: interpret::recommendation(attribution.overall_score, external_score)
                .to_string(),
        };

        info!(
            composite = composite.score,
            label = %composite.label,
            signals = composite.signals_used.len(),
            checks_passed = checks.passed,
            checks_total = checks.total,
            weak_sentences = attribution.weak_sentences.len(),
            "Safety assessment complete"
        );

        let signals = SignalResults {
            attribution,
            consistency,
            consistency_score,
            entropy,
            entropy_confidence,
            entropy_certainty,
            external,
        };
        clock.advance();
        let timings = clock.finish();

        Ok(SafetyAssessment::new(
            question.to_string(),
            answer,
            chunks,
            signals,
            composite,
            checks,
            interpretations,
            timings,
        ))
    }

    /// Consistency and entropy, from separate trial sets or one shared set.
    async fn sample_signals(
        &self,
        question: &str,
        chunks: &[RetrievedChunk],
        cancel: &CancellationToken,
    ) -> Result<(ConsistencyResult, EntropyResult), MedGuardError> {
        if self.config.entropy.share_consistency_trials {
            let prompt = answer_prompt(question, chunks);
            let outcome = self
                .sampler
                .sample(
                    &prompt,
                    self.consistency.sampling(),
                    self.config.consistency.trials,
                    cancel,
                )
                .await?;
            let (consistency, entropy) = tokio::join!(
                self.consistency.score_trials(outcome.clone(), cancel),
                self.entropy.estimate_outcome(outcome, cancel),
            );
            return Ok((consistency?, entropy?));
        }

        let (consistency, entropy) = tokio::join!(
            self.consistency
                .check(question, chunks, self.config.consistency.trials, cancel),
            self.entropy.sample_and_estimate(question, chunks, cancel),
        );
        Ok((consistency?, entropy?))
    }
}
