//! # medguard-safety
//!
//! Safety assessment for retrieval-augmented medical answers. Given a
//! question, the [`SafetyOrchestrator`] retrieves context, generates an
//! answer, and scores it with four concurrent signals:
//!
//! - [`attribution`]: how well each answer sentence is supported by the context;
//! - [`consistency`]: agreement between resampled answers;
//! - [`entropy`]: semantic entropy over meaning clusters of resampled answers;
//! - [`external`]: support for the answer's claims in an external source.
//!
//! The signals are fused by [`aggregate`] into a composite score and a
//! confidence label, returned as an immutable [`SafetyAssessment`].

pub mod aggregate;
pub mod assessment;
pub mod attribution;
pub mod consistency;
pub mod decompose;
pub mod entropy;
pub mod external;
pub mod interpret;
pub mod orchestrator;
pub mod prompts;
pub mod reranker;
pub mod retriever;
pub mod sampling;

// Re-exports
pub use aggregate::{CheckTally, Composite, ConfidenceLabel, Signal, SignalScores};
pub use assessment::{PipelineStage, SafetyAssessment, StageTimings};
pub use attribution::{AttributionResult, AttributionScorer, WeakSentence};
pub use consistency::{ConsistencyChecker, ConsistencyResult};
pub use decompose::{DecomposedRetrieval, QueryDecomposer, SubAnswer};
pub use entropy::{Cluster, EntropyEstimator, EntropyResult};
pub use external::{ExternalStatus, ExternalValidationResult, ExternalValidator};
pub use interpret::Interpretations;
pub use orchestrator::SafetyOrchestrator;
pub use reranker::{EmbeddingReranker, LlmRelevanceReranker, Reranker};
pub use retriever::MultiStageRetriever;
pub use sampling::{SignalFailure, TrialOutcome, TrialSampler};
