//! Platform error taxonomy.
//!
//! Every failure that crosses a component boundary is classified into one of
//! the variants below. The classification matters because different callers
//! get different propagation:
//!
//! - Query endpoints (`/query/*`) serialize the error into a 200 response
//!   body so the LLM consumer can read it and self-correct.
//! - Streaming endpoints turn the error into a terminal `error` SSE event.
//! - Scenario CRUD endpoints map variants onto conventional HTTP status
//!   codes via [`PlatformError::status_code`].
//!
//! # Example
//!
//! ```rust
//! use incidentllm::error::PlatformError;
//!
//! let err = PlatformError::resource_not_found("graph 'demo-topology' does not exist");
//! assert_eq!(err.kind(), "resource_not_found");
//! assert_eq!(err.status_code(), 404);
//! ```

use thiserror::Error;

/// Result type alias used across the platform.
pub type Result<T> = std::result::Result<T, PlatformError>;

/// Classified platform error.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// A required variable for the selected backend is absent. Detected at
    /// startup (logged) and surfaced at query time.
    #[error("configuration missing: {0}")]
    ConfigMissing(String),

    /// A queried resource (graph, container, index, document) does not exist.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// The backend rejected the query string.
    #[error("query syntax error: {0}")]
    QuerySyntax(String),

    /// The backend throttled the request after the internal retry budget
    /// was exhausted.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// Third-party API unreachable or handshake failed.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Token acquisition or authorization failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Schema manifest invalid, archive malformed, or scenario name invalid.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A concurrent provisioner activation is in progress.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The operation is not supported by this backend variant.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Unclassified internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PlatformError {
    pub fn config_missing(msg: impl Into<String>) -> Self {
        PlatformError::ConfigMissing(msg.into())
    }

    pub fn resource_not_found(msg: impl Into<String>) -> Self {
        PlatformError::ResourceNotFound(msg.into())
    }

    pub fn query_syntax(msg: impl Into<String>) -> Self {
        PlatformError::QuerySyntax(msg.into())
    }

    pub fn rate_limit(msg: impl Into<String>) -> Self {
        PlatformError::RateLimit(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        PlatformError::UpstreamUnavailable(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        PlatformError::Auth(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        PlatformError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        PlatformError::Conflict(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        PlatformError::NotSupported(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        PlatformError::Internal(msg.into())
    }

    /// Stable machine-readable kind tag, used in error payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PlatformError::ConfigMissing(_) => "config_missing",
            PlatformError::ResourceNotFound(_) => "resource_not_found",
            PlatformError::QuerySyntax(_) => "query_syntax",
            PlatformError::RateLimit(_) => "rate_limit",
            PlatformError::UpstreamUnavailable(_) => "upstream_unavailable",
            PlatformError::Auth(_) => "auth",
            PlatformError::Validation(_) => "validation",
            PlatformError::Conflict(_) => "conflict",
            PlatformError::NotSupported(_) => "not_supported",
            PlatformError::Internal(_) => "internal",
        }
    }

    /// HTTP status used by the scenario CRUD surface. Query endpoints do NOT
    /// use this; they always answer 200 with the error in the body.
    pub fn status_code(&self) -> u16 {
        match self {
            PlatformError::Validation(_) => 400,
            PlatformError::Auth(_) => 401,
            PlatformError::ResourceNotFound(_) => 404,
            PlatformError::Conflict(_) => 409,
            PlatformError::RateLimit(_) => 429,
            PlatformError::NotSupported(_) => 501,
            PlatformError::UpstreamUnavailable(_) => 502,
            _ => 500,
        }
    }

    /// True when a bounded retry inside a backend is worth attempting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlatformError::RateLimit(_) | PlatformError::UpstreamUnavailable(_)
        )
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            PlatformError::UpstreamUnavailable(e.to_string())
        } else {
            PlatformError::Internal(e.to_string())
        }
    }
}

impl From<serde_json::Error> for PlatformError {
    fn from(e: serde_json::Error) -> Self {
        PlatformError::Validation(format!("malformed JSON: {}", e))
    }
}

impl From<std::io::Error> for PlatformError {
    fn from(e: std::io::Error) -> Self {
        PlatformError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(PlatformError::config_missing("x").kind(), "config_missing");
        assert_eq!(PlatformError::rate_limit("x").kind(), "rate_limit");
        assert_eq!(PlatformError::validation("x").kind(), "validation");
        assert_eq!(PlatformError::conflict("x").kind(), "conflict");
    }

    #[test]
    fn crud_status_codes() {
        assert_eq!(PlatformError::validation("bad name").status_code(), 400);
        assert_eq!(PlatformError::resource_not_found("gone").status_code(), 404);
        assert_eq!(PlatformError::conflict("busy").status_code(), 409);
        assert_eq!(PlatformError::internal("boom").status_code(), 500);
    }

    #[test]
    fn retryable_classification() {
        assert!(PlatformError::rate_limit("429").is_retryable());
        assert!(PlatformError::upstream("refused").is_retryable());
        assert!(!PlatformError::validation("nope").is_retryable());
        assert!(!PlatformError::query_syntax("nope").is_retryable());
    }

    #[test]
    fn display_includes_message() {
        let err = PlatformError::query_syntax("unexpected token at 12");
        assert_eq!(err.to_string(), "query syntax error: unexpected token at 12");
    }
}
