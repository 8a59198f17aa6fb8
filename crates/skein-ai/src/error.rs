//! Error types for skein-ai

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Result type alias using skein-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to a model provider
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response
    #[error("API error: {message} (type: {error_type})")]
    Api {
        status: Option<u16>,
        error_type: String,
        message: String,
    },

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Invalid API key
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    /// Stream was aborted
    #[error("Request aborted")]
    Aborted,

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Context overflow / too many tokens
    #[error("Context overflow: {0}")]
    ContextOverflow(String),
}

/// Patterns providers use to report an exhausted context window.
static OVERFLOW_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)context.?length.?exceed",
        r"(?i)maximum.?context.?length",
        r"(?i)context.?window.?(exceed|full|limit)",
        r"(?i)too.?many.?tokens",
        r"(?i)prompt.?is.?too.?long",
        r"(?i)prompt.?too.?long",
        r"(?i)input.?too.?long",
        r"(?i)token.?limit.?(exceed|reach)",
        r"(?i)content.?too.?large",
        r"(?i)request.?too.?large",
        r"(?i)messages?.?too.?long",
        r"(?i)reduce.?the.?length",
        r"(?i)context_length_exceeded",
        r"(?i)max_tokens.*(exceed|limit|too|overflow)",
        r"(?i)exceeds?.+token.?limit",
        r"(?i)context.?overflow",
        r"\b413\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Check whether a provider error message describes an exhausted context window.
pub fn is_context_overflow_message(message: &str) -> bool {
    OVERFLOW_PATTERNS.iter().any(|re| re.is_match(message))
}

impl Error {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status: None,
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Create an API error carrying the HTTP status it arrived with
    pub fn api_status(status: u16, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status: Some(status),
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::RateLimited { .. } | Error::Sse(_) => true,
            Error::Api {
                status,
                error_type,
                message,
            } => {
                if matches!(status, Some(429 | 500 | 502 | 503 | 504 | 529)) {
                    return true;
                }
                let et = error_type.to_lowercase();
                let msg = message.to_lowercase();
                et.contains("rate_limit")
                    || et.contains("overloaded")
                    || msg.contains("rate limit")
                    || msg.contains("overloaded")
                    || msg.contains("too many requests")
            }
            _ => false,
        }
    }

    /// Check if this error indicates a context overflow / too many tokens
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::ContextOverflow(_) => true,
            Error::Api { message, .. } => is_context_overflow_message(message),
            _ => false,
        }
    }

    /// Seconds the provider asked us to wait before retrying, if it said so
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_typed_variants() {
        assert!(Error::RateLimited { retry_after: Some(5) }.is_retryable());
        assert!(Error::Sse("connection reset".into()).is_retryable());
    }

    #[test]
    fn test_retryable_api_overloaded_error_type() {
        let e = Error::api("overloaded_error", "The server is overloaded");
        assert!(e.is_retryable());
    }

    #[test]
    fn test_retryable_api_status() {
        let e = Error::api_status(503, "api_error", "Service unavailable");
        assert!(e.is_retryable());
    }

    #[test]
    fn test_not_retryable_api_auth() {
        let e = Error::api_status(401, "authentication_error", "Invalid API key");
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_not_retryable_non_api() {
        assert!(!Error::InvalidApiKey.is_retryable());
        assert!(!Error::Aborted.is_retryable());
        assert!(!Error::ContextOverflow("too big".into()).is_retryable());
    }

    #[test]
    fn test_overflow_api_messages() {
        for msg in [
            "prompt is too long: 210000 tokens > 200000 maximum",
            "This model's maximum context length is 128000 tokens",
            "Request too large",
            "Please reduce the length of the messages",
            "context_length_exceeded",
        ] {
            assert!(
                Error::api("invalid_request_error", msg).is_context_overflow(),
                "expected overflow for {msg:?}"
            );
        }
    }

    #[test]
    fn test_not_overflow_api_normal_error() {
        let e = Error::api("authentication_error", "Invalid API key");
        assert!(!e.is_context_overflow());
        assert!(!Error::RateLimited { retry_after: None }.is_context_overflow());
    }

    #[test]
    fn test_retry_after_only_from_rate_limit() {
        assert_eq!(Error::RateLimited { retry_after: Some(12) }.retry_after(), Some(12));
        assert_eq!(Error::api("x", "y").retry_after(), None);
    }
}
