//! Task configuration
//!
//! Every struct deserializes with `#[serde(default)]`, so a host can load a
//! partial TOML table and get sensible values for everything it leaves out.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skein_ai::ReasoningLevel;

use crate::retry::{BackoffConfig, RetryPolicy};

/// Settings for one task and its request loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Mode slug the task starts in
    pub mode: String,
    /// Minimum seconds between any two model requests in a task tree
    pub rate_limit_seconds: u64,
    /// Retry failed requests automatically instead of asking first
    pub auto_retry: bool,
    /// Automatic retries per turn before asking the operator
    pub max_api_retries: u32,
    /// Context-window recoveries per turn before giving up
    pub max_context_window_retries: u32,
    /// Consecutive tool mistakes before asking the operator for guidance
    pub consecutive_mistake_limit: u32,
    pub enable_checkpoints: bool,
    /// How long `abort_task` waits for the loop to settle
    pub abort_wait_ms: u64,
    pub max_tokens: Option<u32>,
    pub reasoning: ReasoningLevel,
    pub backoff: BackoffConfig,
    /// Retry policy for transcript and checkpoint persistence
    pub persistence: RetryPolicy,
    pub context: ContextConfig,
    pub queue: QueueConfig,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            mode: "code".to_string(),
            rate_limit_seconds: 0,
            auto_retry: true,
            max_api_retries: 5,
            max_context_window_retries: 3,
            consecutive_mistake_limit: 3,
            enable_checkpoints: true,
            abort_wait_ms: 3000,
            max_tokens: None,
            reasoning: ReasoningLevel::Off,
            backoff: BackoffConfig::default(),
            persistence: RetryPolicy::default(),
            context: ContextConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl TaskConfig {
    pub fn rate_limit_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limit_seconds)
    }

    pub fn abort_wait(&self) -> Duration {
        Duration::from_millis(self.abort_wait_ms)
    }
}

/// Context-window management settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Summarize older turns instead of only dropping them
    pub auto_condense: bool,
    /// Context usage percentage that triggers condensation
    pub condense_threshold_percent: u8,
    /// Per-profile thresholds; `-1` inherits the global value
    pub profile_thresholds: HashMap<String, i32>,
    /// Profile whose threshold applies to this task
    pub profile: Option<String>,
    /// Messages kept verbatim at the end of a condensation
    pub keep_recent_messages: usize,
    /// Share of the context kept after a provider reports an overflow
    pub forced_reduction_percent: u8,
    /// Headroom kept free below the context window, as a percentage
    pub token_buffer_percent: u8,
    /// Replaces the built-in summarization instructions
    pub custom_condense_prompt: Option<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            auto_condense: true,
            condense_threshold_percent: 100,
            profile_thresholds: HashMap::new(),
            profile: None,
            keep_recent_messages: 3,
            forced_reduction_percent: 75,
            token_buffer_percent: 10,
            custom_condense_prompt: None,
        }
    }
}

impl ContextConfig {
    /// Threshold in effect, honoring a valid profile override
    pub fn effective_threshold(&self) -> u8 {
        let profile_value = self
            .profile
            .as_ref()
            .and_then(|p| self.profile_thresholds.get(p))
            .copied();
        match profile_value {
            Some(-1) | None => self.condense_threshold_percent,
            Some(value) if (5..=100).contains(&value) => value as u8,
            Some(value) => {
                tracing::warn!(
                    profile = ?self.profile,
                    value,
                    "invalid profile condense threshold, using global value"
                );
                self.condense_threshold_percent
            }
        }
    }
}

/// Operator-input queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_size: usize,
    /// Submission attempts before a queued message is dropped
    pub max_submit_retries: u32,
    pub submit_retry_base_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            max_submit_retries: 3,
            submit_retry_base_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_threshold_override() {
        let mut config = ContextConfig {
            condense_threshold_percent: 80,
            profile: Some("fast".into()),
            ..Default::default()
        };
        assert_eq!(config.effective_threshold(), 80);

        config.profile_thresholds.insert("fast".into(), 50);
        assert_eq!(config.effective_threshold(), 50);

        config.profile_thresholds.insert("fast".into(), -1);
        assert_eq!(config.effective_threshold(), 80);

        config.profile_thresholds.insert("fast".into(), 2);
        assert_eq!(config.effective_threshold(), 80);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: TaskConfig = serde_json::from_str(r#"{"rate_limit_seconds": 3, "queue": {"max_size": 4}}"#).unwrap();
        assert_eq!(config.rate_limit_seconds, 3);
        assert_eq!(config.queue.max_size, 4);
        assert_eq!(config.queue.max_submit_retries, 3);
        assert_eq!(config.context.keep_recent_messages, 3);
        assert!(config.auto_retry);
    }
}
