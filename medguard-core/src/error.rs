//! Error types for MedGuard.
//!
//! Uses `thiserror` for structured error variants. Only retrieval, generation,
//! configuration, input and cancellation failures ever reach the caller of an
//! assessment; everything else is contained inside the signal that produced it.

/// Top-level error type returned by assessment entry points.
#[derive(Debug, thiserror::Error)]
pub enum MedGuardError {
    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Generation failed: {0}")]
    Generation(GatewayError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Query was cancelled")]
    Cancelled,
}

impl MedGuardError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Wrap a failed primary generation call, keeping cancellation distinct.
    pub fn from_generation(err: GatewayError) -> Self {
        match err {
            GatewayError::Cancelled => Self::Cancelled,
            other => Self::Generation(other),
        }
    }
}

/// Errors from calls to embedding, generation and index services.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Call was cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Transient errors worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }
}

/// Errors from an external knowledge source.
///
/// The two variants are deliberately distinct outcomes: `Unavailable` means
/// "we don't know", `Malformed` means "check configuration".
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExternalSourceError {
    #[error("External service unavailable: {message}")]
    Unavailable { message: String },

    #[error("External service error: {message}")]
    Malformed { message: String },
}

impl ExternalSourceError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }
}

/// Errors from the multi-stage retriever. All of them are fatal for a query.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Query embedding failed: {0}")]
    Embedding(GatewayError),

    #[error("Vector search failed: {0}")]
    Search(GatewayError),

    #[error("No chunks retrieved for query")]
    NoResults,

    #[error("Invalid retrieval parameters: k_final ({k_final}) must be in 1..={k_broad}")]
    InvalidParameters { k_broad: usize, k_final: usize },

    #[error("Retrieval was cancelled")]
    Cancelled,
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// A type alias for results using the top-level `MedGuardError`.
pub type Result<T> = std::result::Result<T, MedGuardError>;
