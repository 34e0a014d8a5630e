//! Configuration system for MedGuard.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> explicit file -> environment. The resulting
//! [`MedGuardConfig`] is validated once and then passed by value to the
//! orchestrator; nothing mutates it afterwards.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::SamplingConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MedGuardConfig {
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub attribution: AttributionConfig,
    #[serde(default)]
    pub consistency: ConsistencyConfig,
    #[serde(default)]
    pub entropy: EntropyConfig,
    #[serde(default)]
    pub external: ExternalConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
}

/// Generation model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Provider name: "openai" (any OpenAI-compatible endpoint).
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Optional base URL override (e.g. a local vLLM or Ollama endpoint).
    pub base_url: Option<String>,
    /// Temperature for the primary answer.
    pub temperature: f32,
    /// Maximum tokens per completion.
    pub max_tokens: usize,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            temperature: 0.1,
            max_tokens: 1024,
            timeout_secs: 60,
        }
    }
}

impl GenerationConfig {
    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig::new(self.temperature, self.max_tokens)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Embedding model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Provider name: "local" (default), "openai", "ollama".
    pub provider: String,
    /// Provider-specific model name.
    pub model: Option<String>,
    /// Optional base URL override.
    pub base_url: Option<String>,
    /// Environment variable holding the API key (remote providers only).
    pub api_key_env: String,
    /// Dimensions for the local embedder.
    pub dimensions: usize,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: None,
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            dimensions: 384,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retry policy for transient provider errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

/// Which stage-2 reranker to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankerKind {
    /// Cosine between query and chunk embeddings from the configured embedder.
    Embedding,
    /// Relevance graded 0-10 by the generation model.
    Llm,
}

/// Two-stage retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Stage-1 candidate count.
    pub k_broad: usize,
    /// Chunks kept after reranking.
    pub k_final: usize,
    /// Run the stage-2 reranker.
    pub use_reranker: bool,
    pub reranker: RerankerKind,
    /// Concurrent grading calls for the LLM reranker.
    pub rerank_concurrency: usize,
    /// Sampling for LLM relevance grades; zero temperature keeps grading deterministic.
    pub rerank_temperature: f32,
    pub rerank_max_tokens: usize,
    /// Concurrent chunk-store lookups after stage-1 recall.
    pub store_concurrency: usize,
    /// Split complex questions into sub-questions, answer each, and
    /// synthesize the final answer from the sub-answers.
    pub decompose_complex_queries: bool,
    pub max_sub_questions: usize,
    pub decompose_temperature: f32,
    pub decompose_max_tokens: usize,
    /// Per-call timeout in seconds for index, store and reranker calls.
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_broad: 20,
            k_final: 5,
            use_reranker: true,
            reranker: RerankerKind::Embedding,
            rerank_concurrency: 4,
            rerank_temperature: 0.0,
            rerank_max_tokens: 8,
            store_concurrency: 8,
            decompose_complex_queries: false,
            max_sub_questions: 4,
            decompose_temperature: 0.1,
            decompose_max_tokens: 256,
            timeout_secs: 30,
        }
    }
}

impl RetrievalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn rerank_sampling(&self) -> SamplingConfig {
        SamplingConfig::new(self.rerank_temperature, self.rerank_max_tokens)
    }

    pub fn decompose_sampling(&self) -> SamplingConfig {
        SamplingConfig::new(self.decompose_temperature, self.decompose_max_tokens)
    }
}

/// How per-sentence attribution scores are folded into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Mean,
    /// Conservative: the weakest sentence decides.
    Min,
}

/// Attribution scorer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// Sentences scoring below this are reported as weak.
    pub weak_threshold: f64,
    pub aggregation: Aggregation,
    /// Score counted as a passed check in the tally.
    pub pass_threshold: f64,
    /// Concurrent embedding calls.
    pub embed_concurrency: usize,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            weak_threshold: 0.5,
            aggregation: Aggregation::Mean,
            pass_threshold: 0.6,
            embed_concurrency: 8,
        }
    }
}

/// Consistency checker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    pub trials: usize,
    /// Must be nonzero so trials actually resample.
    pub temperature: f32,
    /// Upper bound on concurrent trial generations.
    pub max_concurrency: usize,
    pub pass_threshold: f64,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            trials: 3,
            temperature: 0.7,
            max_concurrency: 3,
            pass_threshold: 0.6,
        }
    }
}

/// Semantic entropy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntropyConfig {
    pub samples: usize,
    pub temperature: f32,
    /// Cosine at or above which two answers share a meaning cluster.
    pub cluster_threshold: f64,
    /// Normalization constant; `None` uses log2(trial count).
    pub max_entropy_bits: Option<f64>,
    /// Entropy at or above this is MEDIUM uncertainty.
    pub medium_uncertainty_bits: f64,
    /// Entropy at or above this is HIGH uncertainty.
    pub high_uncertainty_bits: f64,
    /// Cluster the consistency trials instead of sampling separately.
    pub share_consistency_trials: bool,
    /// Concurrent embedding calls when clustering answers.
    pub embed_concurrency: usize,
}

impl Default for EntropyConfig {
    fn default() -> Self {
        Self {
            samples: 3,
            temperature: 0.8,
            cluster_threshold: 0.85,
            max_entropy_bits: None,
            medium_uncertainty_bits: 1.0,
            high_uncertainty_bits: 2.0,
            share_consistency_trials: false,
            embed_concurrency: 4,
        }
    }
}

/// External validation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalConfig {
    pub enabled: bool,
    /// Provider name: "semantic_scholar".
    pub provider: String,
    pub base_url: String,
    /// Optional environment variable holding an API key.
    pub api_key_env: Option<String>,
    pub max_results: usize,
    /// Claims and evidence sentences shorter than this are ignored.
    pub min_claim_len: usize,
    pub max_keywords: usize,
    /// Ask the generation model for search keywords instead of the heuristic.
    pub use_llm_keywords: bool,
    pub keyword_temperature: f32,
    pub keyword_max_tokens: usize,
    /// Concurrent embedding calls for claims and evidence sentences.
    pub embed_concurrency: usize,
    /// Bounds the whole validation: source query and embedding.
    pub timeout_secs: u64,
    pub pass_threshold: f64,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "semantic_scholar".to_string(),
            base_url: "https://api.semanticscholar.org/graph/v1".to_string(),
            api_key_env: None,
            max_results: 10,
            min_claim_len: 10,
            max_keywords: 6,
            use_llm_keywords: false,
            keyword_temperature: 0.1,
            keyword_max_tokens: 32,
            embed_concurrency: 8,
            timeout_secs: 15,
            pass_threshold: 0.6,
        }
    }
}

impl ExternalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn keyword_sampling(&self) -> SamplingConfig {
        SamplingConfig::new(self.keyword_temperature, self.keyword_max_tokens)
    }
}

/// Per-signal weights in the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalWeights {
    pub attribution: f64,
    pub consistency: f64,
    pub entropy: f64,
    pub external: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            attribution: 1.0,
            consistency: 1.0,
            entropy: 1.0,
            external: 1.0,
        }
    }
}

/// Composite score and label cut points.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub weights: SignalWeights,
    /// Composite at or above this is HIGH confidence.
    pub high_threshold: f64,
    /// Composite at or above this is MEDIUM confidence.
    pub medium_threshold: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            weights: SignalWeights::default(),
            high_threshold: 0.75,
            medium_threshold: 0.5,
        }
    }
}

impl MedGuardConfig {
    /// Check cross-field invariants. Reports every problem found, not just the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems: Vec<String> = Vec::new();

        let unit = |name: &str, v: f64, problems: &mut Vec<String>| {
            if !(0.0..=1.0).contains(&v) {
                problems.push(format!("{name} must be in [0, 1], got {v}"));
            }
        };

        let r = &self.retrieval;
        if r.k_final == 0 || r.k_final > r.k_broad {
            problems.push(format!(
                "retrieval.k_final ({}) must be in 1..=k_broad ({})",
                r.k_final, r.k_broad
            ));
        }
        if r.rerank_concurrency == 0 {
            problems.push("retrieval.rerank_concurrency must be at least 1".into());
        }
        if r.store_concurrency == 0 {
            problems.push("retrieval.store_concurrency must be at least 1".into());
        }
        if r.rerank_max_tokens == 0 || r.decompose_max_tokens == 0 {
            problems.push("retrieval max_tokens settings must be at least 1".into());
        }

        unit(
            "attribution.weak_threshold",
            self.attribution.weak_threshold,
            &mut problems,
        );
        unit(
            "attribution.pass_threshold",
            self.attribution.pass_threshold,
            &mut problems,
        );
        if self.attribution.embed_concurrency == 0 {
            problems.push("attribution.embed_concurrency must be at least 1".into());
        }

        let c = &self.consistency;
        if c.trials == 0 {
            problems.push("consistency.trials must be at least 1".into());
        }
        if c.max_concurrency == 0 {
            problems.push("consistency.max_concurrency must be at least 1".into());
        }
        if c.temperature <= 0.0 {
            problems.push("consistency.temperature must be greater than 0".into());
        }
        unit("consistency.pass_threshold", c.pass_threshold, &mut problems);

        let e = &self.entropy;
        if e.samples == 0 && !e.share_consistency_trials {
            problems.push("entropy.samples must be at least 1".into());
        }
        unit("entropy.cluster_threshold", e.cluster_threshold, &mut problems);
        if e.embed_concurrency == 0 {
            problems.push("entropy.embed_concurrency must be at least 1".into());
        }
        if let Some(max_bits) = e.max_entropy_bits
            && max_bits <= 0.0
        {
            problems.push(format!(
                "entropy.max_entropy_bits must be positive, got {max_bits}"
            ));
        }
        if e.medium_uncertainty_bits > e.high_uncertainty_bits {
            problems.push(
                "entropy.medium_uncertainty_bits must not exceed high_uncertainty_bits".into(),
            );
        }

        unit(
            "external.pass_threshold",
            self.external.pass_threshold,
            &mut problems,
        );
        if self.external.embed_concurrency == 0 {
            problems.push("external.embed_concurrency must be at least 1".into());
        }

        let a = &self.aggregation;
        let w = a.weights;
        if [w.attribution, w.consistency, w.entropy, w.external]
            .iter()
            .any(|x| *x < 0.0 || !x.is_finite())
        {
            problems.push("aggregation.weights must be finite and non-negative".into());
        } else if w.attribution + w.consistency + w.entropy + w.external == 0.0 {
            problems.push("aggregation.weights must not all be zero".into());
        }
        unit("aggregation.high_threshold", a.high_threshold, &mut problems);
        unit(
            "aggregation.medium_threshold",
            a.medium_threshold,
            &mut problems,
        );
        if a.medium_threshold > a.high_threshold {
            problems.push("aggregation.medium_threshold must not exceed high_threshold".into());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::invalid(problems.join("; ")))
        }
    }

    /// Serialize to TOML, e.g. to bootstrap a config file.
    pub fn render_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

/// Load configuration from layered sources and validate it.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `MEDGUARD_`, `__` between sections)
/// 2. Explicit config file
/// 3. Workspace-local config (`.medguard/config.toml`)
/// 4. User config (`~/.config/medguard/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
) -> Result<MedGuardConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(MedGuardConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("org", "medguard", "medguard") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".medguard").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(file) = config_file {
        // An explicitly named file must exist.
        if !file.exists() {
            return Err(ConfigError::ParseError {
                message: format!("config file not found: {}", file.display()),
            });
        }
        figment = figment.merge(Toml::file(file));
    }

    // MEDGUARD_CONSISTENCY__TRIALS, MEDGUARD_AGGREGATION__WEIGHTS__EXTERNAL, ...
    figment = figment.merge(Env::prefixed("MEDGUARD_").split("__"));

    let config: MedGuardConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    tracing::debug!(
        generation_model = %config.generation.model,
        embedding_provider = %config.embedding.provider,
        external_enabled = config.external.enabled,
        "Configuration loaded"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_config_is_valid() {
        let config = MedGuardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retrieval.k_broad, 20);
        assert_eq!(config.retrieval.k_final, 5);
        assert_eq!(config.attribution.weak_threshold, 0.5);
        assert_eq!(config.entropy.cluster_threshold, 0.85);
        assert_eq!(config.aggregation.high_threshold, 0.75);
        assert_eq!(config.aggregation.medium_threshold, 0.5);
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = MedGuardConfig::default();
        config.retrieval.k_final = 30;
        config.consistency.trials = 0;
        config.aggregation.medium_threshold = 0.9;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("k_final"));
        assert!(err.contains("consistency.trials"));
        assert!(err.contains("medium_threshold must not exceed"));
    }

    #[test]
    fn test_validate_rejects_zero_weights() {
        let mut config = MedGuardConfig::default();
        config.aggregation.weights = SignalWeights {
            attribution: 0.0,
            consistency: 0.0,
            entropy: 0.0,
            external: 0.0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_temperature_trials() {
        let mut config = MedGuardConfig::default();
        config.consistency.temperature = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency_limits() {
        let mut config = MedGuardConfig::default();
        config.retrieval.store_concurrency = 0;
        config.entropy.embed_concurrency = 0;
        config.external.embed_concurrency = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("retrieval.store_concurrency"));
        assert!(err.contains("entropy.embed_concurrency"));
        assert!(err.contains("external.embed_concurrency"));
    }

    #[test]
    fn test_auxiliary_sampling_from_config() {
        let mut retrieval = RetrievalConfig::default();
        assert_eq!(retrieval.rerank_sampling(), SamplingConfig::new(0.0, 8));
        assert_eq!(retrieval.decompose_sampling(), SamplingConfig::new(0.1, 256));
        retrieval.rerank_max_tokens = 4;
        assert_eq!(retrieval.rerank_sampling().max_tokens, 4);
    }

    #[test]
    fn test_render_toml_roundtrips_through_figment() {
        let mut config = MedGuardConfig::default();
        config.attribution.aggregation = Aggregation::Min;
        let rendered = config.render_toml().unwrap();
        assert!(rendered.contains("aggregation = \"min\""));
        let parsed: MedGuardConfig = Figment::from(Toml::string(&rendered)).extract().unwrap();
        assert_eq!(parsed.attribution.aggregation, Aggregation::Min);
    }

    #[test]
    fn test_load_workspace_file_and_env_override() {
        Jail::expect_with(|jail| {
            jail.create_dir(".medguard")?;
            jail.create_file(
                ".medguard/config.toml",
                r#"
                [consistency]
                trials = 5

                [retrieval]
                k_broad = 40
                k_final = 8
                reranker = "llm"
                "#,
            )?;
            jail.set_env("MEDGUARD_CONSISTENCY__TRIALS", "7");
            jail.set_env("MEDGUARD_EXTERNAL__ENABLED", "false");

            let config = load_config(Some(jail.directory()), None)
                .map_err(|e| figment::Error::from(e.to_string()))?;
            assert_eq!(config.consistency.trials, 7);
            assert_eq!(config.retrieval.k_broad, 40);
            assert_eq!(config.retrieval.k_final, 8);
            assert_eq!(config.retrieval.reranker, RerankerKind::Llm);
            assert!(!config.external.enabled);
            // Untouched sections keep their defaults.
            assert_eq!(config.entropy.samples, 3);
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_invalid_layered_config() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "[retrieval]\nk_broad = 2\nk_final = 3\n")?;
            let path = jail.directory().join("custom.toml");
            let result = load_config(None, Some(&path));
            assert!(matches!(result, Err(ConfigError::Invalid { .. })));
            Ok(())
        });
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let result = load_config(None, Some(Path::new("/nonexistent/medguard.toml")));
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }
}
