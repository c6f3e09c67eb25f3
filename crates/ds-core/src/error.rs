use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Tagged error taxonomy shared across the engine.
///
/// Kinds are persisted on failed cards and surfaced in `card.failed`
/// payloads, so the wire names are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    ResolverAmbiguous,
    UpstreamUnavailable,
    UpstreamRateLimited,
    Timeout,
    LlmInvalidResponse,
    Internal,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::ResolverAmbiguous => "resolver_ambiguous",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::UpstreamRateLimited => "upstream_rate_limited",
            ErrorKind::Timeout => "timeout",
            ErrorKind::LlmInvalidResponse => "llm_invalid_response",
            ErrorKind::Internal => "internal",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<ErrorKind> {
        match raw {
            "invalid_input" => Some(ErrorKind::InvalidInput),
            "resolver_ambiguous" => Some(ErrorKind::ResolverAmbiguous),
            "upstream_unavailable" => Some(ErrorKind::UpstreamUnavailable),
            "upstream_rate_limited" => Some(ErrorKind::UpstreamRateLimited),
            "timeout" => Some(ErrorKind::Timeout),
            "llm_invalid_response" => Some(ErrorKind::LlmInvalidResponse),
            "internal" => Some(ErrorKind::Internal),
            "cancelled" => Some(ErrorKind::Cancelled),
            _ => None,
        }
    }

    /// Whether the scheduler retries a card that failed with this kind.
    ///
    /// Timeouts are retryable only for declared-idempotent fetchers; that
    /// refinement is applied at the call site, not here.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::UpstreamUnavailable | ErrorKind::UpstreamRateLimited
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("ambiguous input: {0}")]
    ResolverAmbiguous(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream rate limited (retry after {retry_after_secs:?}s)")]
    UpstreamRateLimited { retry_after_secs: Option<u64> },

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("unparseable model output: {0}")]
    LlmInvalidResponse(String),

    #[error("cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidInput(_) => ErrorKind::InvalidInput,
            EngineError::ResolverAmbiguous(_) => ErrorKind::ResolverAmbiguous,
            EngineError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            EngineError::UpstreamRateLimited { .. } => ErrorKind::UpstreamRateLimited,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::LlmInvalidResponse(_) => ErrorKind::LlmInvalidResponse,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Storage(_) | EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
