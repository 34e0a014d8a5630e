//! # medguard-core
//!
//! Shared foundation for the MedGuard safety pipeline: data types, error
//! taxonomy, layered configuration, and the capability traits through which
//! embedding, generation, vector-index and external-knowledge services are
//! reached.
//!
//! Concrete HTTP clients live in [`providers`]; [`mock`] and [`index`] provide
//! in-process implementations for tests, benchmarks and offline use.

pub mod config;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod index;
pub mod mock;
pub mod providers;
pub mod similarity;
pub mod text;
pub mod types;

// Re-exports
pub use config::{MedGuardConfig, load_config};
pub use error::{
    ConfigError, ExternalSourceError, GatewayError, MedGuardError, Result, RetrievalError,
};
pub use gateway::{ChunkStore, EmbeddingModel, ExternalKnowledgeSource, GenerationModel, VectorIndex};
pub use guard::{Interrupt, guarded_call, run_guarded};
pub use types::{Answer, Evidence, RetrievedChunk, SamplingConfig, SearchHit, StoredChunk};
