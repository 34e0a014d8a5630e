//! The per-query safety assessment and the pipeline stage machine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

use medguard_core::types::{Answer, RetrievedChunk};

use crate::aggregate::{CheckTally, Composite, ConfidenceLabel, MAX_COMPOSITE_SCORE, Signal};
use crate::attribution::{AttributionResult, WeakSentence};
use crate::consistency::ConsistencyResult;
use crate::decompose::SubAnswer;
use crate::entropy::EntropyResult;
use crate::external::ExternalValidationResult;
use crate::interpret::Interpretations;

/// Pipeline stages, in order. A query never returns to an earlier stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Retrieving,
    Generating,
    Assessing,
    Aggregating,
    Done,
}

impl PipelineStage {
    /// The following stage, or `None` from `Done`.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Retrieving => Some(Self::Generating),
            Self::Generating => Some(Self::Assessing),
            Self::Assessing => Some(Self::Aggregating),
            Self::Aggregating => Some(Self::Done),
            Self::Done => None,
        }
    }

    /// Move to the following stage. `Done` is terminal.
    pub fn advance(&mut self) -> Self {
        if let Some(next) = self.next() {
            *self = next;
        }
        *self
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Done
    }
}

/// Wall-clock milliseconds spent in each stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTimings {
    pub retrieval_ms: u64,
    pub generation_ms: u64,
    pub assessment_ms: u64,
    pub aggregation_ms: u64,
    pub total_ms: u64,
}

/// Tracks the current stage and charges elapsed time to it on each advance.
#[derive(Debug)]
pub(crate) struct StageClock {
    stage: PipelineStage,
    query_started: Instant,
    stage_started: Instant,
    timings: StageTimings,
}

impl StageClock {
    pub(crate) fn starting_at(stage: PipelineStage) -> Self {
        let now = Instant::now();
        Self {
            stage,
            query_started: now,
            stage_started: now,
            timings: StageTimings::default(),
        }
    }

    pub(crate) fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub(crate) fn advance(&mut self) -> PipelineStage {
        let now = Instant::now();
        let ms = now.duration_since(self.stage_started).as_millis() as u64;
        match self.stage {
            PipelineStage::Retrieving => self.timings.retrieval_ms = ms,
            PipelineStage::Generating => self.timings.generation_ms = ms,
            PipelineStage::Assessing => self.timings.assessment_ms = ms,
            PipelineStage::Aggregating => self.timings.aggregation_ms = ms,
            PipelineStage::Done => {}
        }
        self.stage_started = now;
        self.stage.advance()
    }

    pub(crate) fn finish(mut self) -> StageTimings {
        while !self.stage.is_terminal() {
            self.advance();
        }
        self.timings.total_ms = self.query_started.elapsed().as_millis() as u64;
        self.timings
    }
}

/// Everything the pipeline concluded about one answer. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct SafetyAssessment {
    id: Uuid,
    question: String,
    answer: Answer,
    chunks: Vec<RetrievedChunk>,
    /// Empty unless the answer was synthesized from sub-answers.
    sub_questions: Vec<String>,
    sub_answers: Vec<SubAnswer>,
    attribution: AttributionResult,
    consistency: ConsistencyResult,
    /// `None` when too few trials survived to be informative.
    consistency_score: Option<f64>,
    entropy: EntropyResult,
    entropy_confidence: ConfidenceLabel,
    /// `None` when too few samples survived to be informative.
    entropy_certainty: Option<f64>,
    external_validation: Option<ExternalValidationResult>,
    weak_sentences: Vec<WeakSentence>,
    composite_score: f64,
    max_score: f64,
    confidence_label: ConfidenceLabel,
    checks: CheckTally,
    interpretations: Interpretations,
    signals_used: Vec<Signal>,
    timings: StageTimings,
    created_at: DateTime<Utc>,
}

/// Signal outputs gathered during the assessing stage.
pub(crate) struct SignalResults {
    pub attribution: AttributionResult,
    pub consistency: ConsistencyResult,
    pub consistency_score: Option<f64>,
    pub entropy: EntropyResult,
    pub entropy_confidence: ConfidenceLabel,
    pub entropy_certainty: Option<f64>,
    pub external: Option<ExternalValidationResult>,
}

impl SafetyAssessment {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        question: String,
        answer: Answer,
        chunks: Vec<RetrievedChunk>,
        signals: SignalResults,
        composite: Composite,
        checks: CheckTally,
        interpretations: Interpretations,
        timings: StageTimings,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            question,
            answer,
            chunks,
            sub_questions: Vec::new(),
            sub_answers: Vec::new(),
            weak_sentences: signals.attribution.weak_sentences.clone(),
            attribution: signals.attribution,
            consistency: signals.consistency,
            consistency_score: signals.consistency_score,
            entropy: signals.entropy,
            entropy_confidence: signals.entropy_confidence,
            entropy_certainty: signals.entropy_certainty,
            external_validation: signals.external,
            composite_score: composite.score,
            max_score: MAX_COMPOSITE_SCORE,
            confidence_label: composite.label,
            checks,
            interpretations,
            signals_used: composite.signals_used,
            timings,
            created_at: Utc::now(),
        }
    }

    pub(crate) fn with_decomposition(
        mut self,
        sub_questions: Vec<String>,
        sub_answers: Vec<SubAnswer>,
    ) -> Self {
        self.sub_questions = sub_questions;
        self.sub_answers = sub_answers;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn answer(&self) -> &Answer {
        &self.answer
    }

    pub fn chunks(&self) -> &[RetrievedChunk] {
        &self.chunks
    }

    pub fn sub_questions(&self) -> &[String] {
        &self.sub_questions
    }

    pub fn sub_answers(&self) -> &[SubAnswer] {
        &self.sub_answers
    }

    /// True when the answer was synthesized from sub-answers.
    pub fn is_decomposed(&self) -> bool {
        !self.sub_answers.is_empty()
    }

    pub fn attribution(&self) -> &AttributionResult {
        &self.attribution
    }

    pub fn attribution_score(&self) -> f64 {
        self.attribution.overall_score
    }

    pub fn consistency(&self) -> &ConsistencyResult {
        &self.consistency
    }

    pub fn consistency_score(&self) -> Option<f64> {
        self.consistency_score
    }

    pub fn entropy(&self) -> &EntropyResult {
        &self.entropy
    }

    pub fn entropy_bits(&self) -> f64 {
        self.entropy.entropy_bits
    }

    pub fn entropy_confidence(&self) -> ConfidenceLabel {
        self.entropy_confidence
    }

    pub fn entropy_certainty(&self) -> Option<f64> {
        self.entropy_certainty
    }

    /// `None` when external validation is disabled.
    pub fn external_validation(&self) -> Option<&ExternalValidationResult> {
        self.external_validation.as_ref()
    }

    /// The external score, present only when the source answered.
    pub fn external_score(&self) -> Option<f64> {
        self.external_validation
            .as_ref()
            .filter(|e| e.is_ok())
            .and_then(|e| e.score)
    }

    pub fn weak_sentences(&self) -> &[WeakSentence] {
        &self.weak_sentences
    }

    pub fn composite_score(&self) -> f64 {
        self.composite_score
    }

    pub fn max_score(&self) -> f64 {
        self.max_score
    }

    pub fn confidence_label(&self) -> ConfidenceLabel {
        self.confidence_label
    }

    pub fn checks(&self) -> CheckTally {
        self.checks
    }

    pub fn interpretations(&self) -> &Interpretations {
        &self.interpretations
    }

    pub fn signals_used(&self) -> &[Signal] {
        &self.signals_used
    }

    pub fn timings(&self) -> StageTimings {
        self.timings
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
