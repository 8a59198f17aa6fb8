//! Error classification and the shared retry helper
//!
//! Every fallible external operation (persistence, checkpoints, provider
//! calls) is classified into an [`ErrorCategory`] before deciding whether
//! to try again. [`with_retry`] is the uniform wrapper used by the managers;
//! [`BackoffConfig`] drives the operator-visible countdown between model
//! request attempts.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Broad failure classes used to pick a recovery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection resets, timeouts, 5xx, overloaded providers
    Network,
    /// The provider throttled us
    RateLimit,
    /// The request no longer fits in the model's context window
    ContextWindow,
    /// The task or request was aborted
    Cancellation,
    /// Malformed tool input or missing parameters
    Validation,
    /// Durable storage failed
    Persistence,
    Unknown,
}

impl ErrorCategory {
    /// Whether an automatic retry makes sense for this category
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network
                | ErrorCategory::RateLimit
                | ErrorCategory::ContextWindow
                | ErrorCategory::Persistence
        )
    }
}

/// What to do about a classified failure
#[derive(Debug, Clone, PartialEq)]
pub struct RetryGuidance {
    pub category: ErrorCategory,
    /// Retry the operation after `delay`
    pub should_retry: bool,
    /// Suggested wait before the next attempt
    pub delay: Duration,
    /// The context must be reduced before the retry can succeed
    pub needs_context_management: bool,
}

const NETWORK_RETRY_DELAY: Duration = Duration::from_secs(1);
const RATE_LIMIT_RETRY_DELAY: Duration = Duration::from_secs(30);

const CANCELLATION_KEYWORDS: &[&str] = &["aborted", "abort", "cancelled", "canceled"];
const RATE_LIMIT_KEYWORDS: &[&str] = &["rate limit", "rate_limit", "too many requests", "429"];
const CONTEXT_KEYWORDS: &[&str] = &[
    "context window",
    "context length",
    "context_length",
    "maximum context",
];
const NETWORK_KEYWORDS: &[&str] = &[
    "connection",
    "network",
    "timeout",
    "timed out",
    "econnreset",
    "econnrefused",
    "socket",
    "overloaded",
    "temporarily unavailable",
    "502",
    "503",
    "504",
];
const PERSISTENCE_KEYWORDS: &[&str] = &[
    "storage error",
    "io error",
    "resource busy",
    "ebusy",
    "eagain",
];
const VALIDATION_KEYWORDS: &[&str] = &["validation", "missing required", "invalid argument"];

/// Classifies failures by variant and message keywords
pub struct ErrorCategorizer;

impl ErrorCategorizer {
    /// Classify an engine error
    pub fn categorize(error: &Error) -> ErrorCategory {
        match error {
            Error::Aborted | Error::AbortedDuringRetry | Error::Disposed => ErrorCategory::Cancellation,
            Error::Storage(_) | Error::Io(_) => ErrorCategory::Persistence,
            Error::EmptyResponse => ErrorCategory::Network,
            Error::Ai(ai) => match ai {
                _ if ai.is_context_overflow() => ErrorCategory::ContextWindow,
                skein_ai::Error::Aborted => ErrorCategory::Cancellation,
                skein_ai::Error::RateLimited { .. } => ErrorCategory::RateLimit,
                skein_ai::Error::Http(_) | skein_ai::Error::Sse(_) => ErrorCategory::Network,
                other => match Self::categorize_message(&other.to_string()) {
                    ErrorCategory::Unknown if other.is_retryable() => ErrorCategory::Network,
                    category => category,
                },
            },
            other => Self::categorize_message(&other.to_string()),
        }
    }

    /// Classify a raw error message by keyword
    pub fn categorize_message(message: &str) -> ErrorCategory {
        let lower = message.to_lowercase();
        let has = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

        if has(CANCELLATION_KEYWORDS) {
            ErrorCategory::Cancellation
        } else if has(CONTEXT_KEYWORDS) || skein_ai::error::is_context_overflow_message(message) {
            ErrorCategory::ContextWindow
        } else if has(RATE_LIMIT_KEYWORDS) {
            ErrorCategory::RateLimit
        } else if has(NETWORK_KEYWORDS) {
            ErrorCategory::Network
        } else if has(PERSISTENCE_KEYWORDS) {
            ErrorCategory::Persistence
        } else if has(VALIDATION_KEYWORDS) {
            ErrorCategory::Validation
        } else {
            ErrorCategory::Unknown
        }
    }

    /// Classify an error and describe how to recover from it
    pub fn guidance(error: &Error) -> RetryGuidance {
        let category = Self::categorize(error);
        let retry_after = match error {
            Error::Ai(ai) => ai.retry_after().map(Duration::from_secs),
            _ => None,
        };
        let delay = match category {
            ErrorCategory::Network => NETWORK_RETRY_DELAY,
            ErrorCategory::RateLimit => retry_after.unwrap_or(RATE_LIMIT_RETRY_DELAY),
            _ => Duration::ZERO,
        };
        RetryGuidance {
            category,
            should_retry: category.is_retryable(),
            delay,
            needs_context_management: category == ErrorCategory::ContextWindow,
        }
    }
}

/// Linear retry policy for fallible internal operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Delay after a failed attempt (1-indexed): `base * attempt`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(attempt as u64))
    }
}

/// Run `op` until it succeeds, the attempts run out, or the classifier says
/// the failure is not worth retrying. The last error is returned unchanged.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let category = ErrorCategorizer::categorize(&error);
                if attempt >= max_attempts || !category.is_retryable() {
                    tracing::error!(
                        operation,
                        attempt,
                        ?category,
                        error = %error,
                        "operation failed, giving up"
                    );
                    return Err(error);
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    ?category,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Exponential backoff between model request attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry, in seconds
    pub base_delay_secs: u64,
    pub multiplier: f64,
    /// Upper bound for a single countdown, in seconds
    pub max_delay_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 5,
            multiplier: 2.0,
            max_delay_secs: 600,
        }
    }
}

impl BackoffConfig {
    /// Delay for a given retry attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.base_delay_secs as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(secs.min(self.max_delay_secs as f64))
    }

    /// Whole seconds to count down before a retry. A provider-supplied
    /// `retry_after` takes precedence when it is longer.
    pub fn countdown_secs(&self, attempt: u32, retry_after: Option<u64>) -> u64 {
        let exponential = self.delay_for_attempt(attempt).as_secs_f64().ceil() as u64;
        match retry_after {
            Some(hint) => hint.max(exponential),
            None => exponential,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_categorize_messages() {
        let cases = [
            ("connection reset by peer", ErrorCategory::Network),
            ("request timed out", ErrorCategory::Network),
            ("Rate limit exceeded", ErrorCategory::RateLimit),
            ("prompt is too long: 250000 tokens", ErrorCategory::ContextWindow),
            ("Request was aborted", ErrorCategory::Cancellation),
            ("Tool argument validation failed", ErrorCategory::Validation),
            ("something odd happened", ErrorCategory::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(ErrorCategorizer::categorize_message(message), expected, "{message}");
        }
    }

    #[test]
    fn test_categorize_variants() {
        assert_eq!(ErrorCategorizer::categorize(&Error::Aborted), ErrorCategory::Cancellation);
        assert_eq!(
            ErrorCategorizer::categorize(&Error::Storage("disk full".into())),
            ErrorCategory::Persistence
        );
        assert_eq!(
            ErrorCategorizer::categorize(&Error::Ai(skein_ai::Error::RateLimited { retry_after: None })),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            ErrorCategorizer::categorize(&Error::Ai(skein_ai::Error::api(
                "invalid_request_error",
                "prompt is too long"
            ))),
            ErrorCategory::ContextWindow
        );
        assert_eq!(
            ErrorCategorizer::categorize(&Error::Ai(skein_ai::Error::api_status(529, "overloaded_error", "busy"))),
            ErrorCategory::Network
        );
    }

    #[test]
    fn test_guidance_prefers_retry_after() {
        let guidance =
            ErrorCategorizer::guidance(&Error::Ai(skein_ai::Error::RateLimited { retry_after: Some(7) }));
        assert!(guidance.should_retry);
        assert_eq!(guidance.delay, Duration::from_secs(7));

        let unknown = ErrorCategorizer::guidance(&Error::Other("bad".into()));
        assert!(!unknown.should_retry);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = BackoffConfig::default();
        assert_eq!(config.countdown_secs(0, None), 5);
        assert_eq!(config.countdown_secs(1, None), 10);
        assert_eq!(config.countdown_secs(3, None), 40);
        assert_eq!(config.countdown_secs(20, None), 600);
        assert_eq!(config.countdown_secs(0, Some(45)), 45);
        assert_eq!(config.countdown_secs(2, Some(1)), 20);
    }

    #[test]
    fn test_retry_policy_linear() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers_from_persistence_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(&RetryPolicy::default(), "save", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Storage("resource busy".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_rethrows_after_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = with_retry(&RetryPolicy::default(), "save", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Storage("disk full".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_cancellation() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = with_retry(&RetryPolicy::default(), "op", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Aborted)
            }
        })
        .await;
        assert!(result.unwrap_err().is_abort());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
