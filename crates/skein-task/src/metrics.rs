//! Token and cost accounting over the UI transcript

use serde::{Deserialize, Serialize};

use crate::message::{Say, UiMessage};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiMetrics {
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_cache_writes: u64,
    pub total_cache_reads: u64,
    pub total_cost: f64,
    /// Size of the context as of the latest request or reduction
    pub context_tokens: u64,
}

/// Aggregate metrics from `api_req_started`, `api_req_deleted` and
/// context-condense records
pub fn get_api_metrics(messages: &[UiMessage]) -> ApiMetrics {
    let mut metrics = ApiMetrics::default();

    for message in messages {
        match message.say_kind() {
            Some(Say::ApiReqStarted | Say::ApiReqDeleted) => {
                let Some(info) = message.api_req_info() else {
                    continue;
                };
                metrics.total_tokens_in += info.tokens_in.unwrap_or(0);
                metrics.total_tokens_out += info.tokens_out.unwrap_or(0);
                metrics.total_cache_writes += info.cache_writes.unwrap_or(0);
                metrics.total_cache_reads += info.cache_reads.unwrap_or(0);
                metrics.total_cost += info.cost.unwrap_or(0.0);
            }
            Some(Say::CondenseContext) => {
                if let Some(condense) = &message.context_condense {
                    metrics.total_cost += condense.cost;
                }
            }
            _ => {}
        }
    }

    // The newest entry that knows the context size wins.
    for message in messages.iter().rev() {
        if let Some(condense) = &message.context_condense {
            metrics.context_tokens = condense.new_context_tokens;
            break;
        }
        if let Some(truncation) = &message.context_truncation {
            metrics.context_tokens = truncation.new_context_tokens;
            break;
        }
        if message.say_kind() == Some(Say::ApiReqStarted) {
            if let Some(info) = message.api_req_info() {
                let size = info.tokens_in.unwrap_or(0)
                    + info.tokens_out.unwrap_or(0)
                    + info.cache_writes.unwrap_or(0)
                    + info.cache_reads.unwrap_or(0);
                if size > 0 {
                    metrics.context_tokens = size;
                    break;
                }
            }
        }
    }

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ApiReqInfo, ContextCondense};

    fn started(ts: i64, tokens_in: u64, tokens_out: u64, cost: f64) -> UiMessage {
        let info = ApiReqInfo {
            tokens_in: Some(tokens_in),
            tokens_out: Some(tokens_out),
            cost: Some(cost),
            ..Default::default()
        };
        UiMessage::say(ts, Say::ApiReqStarted, Some(info.to_text()))
    }

    #[test]
    fn test_sums_requests_and_condense_cost() {
        let mut condense = UiMessage::say(3, Say::CondenseContext, None);
        condense.context_condense = Some(ContextCondense {
            condense_id: "c".into(),
            summary: "s".into(),
            cost: 0.5,
            prev_context_tokens: 900,
            new_context_tokens: 120,
        });
        let messages = vec![
            started(1, 100, 10, 0.25),
            UiMessage::say(2, Say::Text, Some("hi".into())),
            condense,
        ];
        let metrics = get_api_metrics(&messages);
        assert_eq!(metrics.total_tokens_in, 100);
        assert_eq!(metrics.total_tokens_out, 10);
        assert!((metrics.total_cost - 0.75).abs() < 1e-9);
        assert_eq!(metrics.context_tokens, 120);
    }

    #[test]
    fn test_context_tokens_from_latest_request() {
        let messages = vec![started(1, 100, 10, 0.0), started(2, 300, 20, 0.0)];
        assert_eq!(get_api_metrics(&messages).context_tokens, 320);
    }

    #[test]
    fn test_deleted_requests_keep_their_cost() {
        let info = ApiReqInfo {
            cost: Some(1.0),
            ..Default::default()
        };
        let messages = vec![UiMessage::say(1, Say::ApiReqDeleted, Some(info.to_text()))];
        assert!((get_api_metrics(&messages).total_cost - 1.0).abs() < 1e-9);
    }
}
