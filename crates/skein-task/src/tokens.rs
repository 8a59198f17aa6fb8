//! Token estimation over transcript entries

use skein_ai::{ApiHandler, ContentBlock};

use crate::message::ApiMessage;

/// Estimate tokens for a transcript slice plus the system prompt
pub fn estimate_context_tokens<'a>(
    api: &dyn ApiHandler,
    system_prompt: &str,
    entries: impl IntoIterator<Item = &'a ApiMessage>,
) -> u64 {
    let system = api.count_tokens(&[ContentBlock::text(system_prompt)]);
    system + entries.into_iter().map(|m| api.count_tokens(&m.content)).sum::<u64>()
}

/// Percentage of `window` that `tokens` fills
pub fn context_percent(tokens: u64, window: u32) -> u64 {
    if window == 0 {
        return 100;
    }
    tokens * 100 / u64::from(window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use skein_ai::{ApiStream, Message, Model, RequestMetadata, Role};

    struct Counter;

    #[async_trait]
    impl ApiHandler for Counter {
        async fn create_message(&self, _: &str, _: &[Message], _: &RequestMetadata) -> skein_ai::Result<ApiStream> {
            Err(skein_ai::Error::UnexpectedResponse("unused".into()))
        }
        fn model(&self) -> Model {
            Model::anthropic("test")
        }
    }

    #[test]
    fn test_estimate_includes_system_prompt() {
        let entries = vec![ApiMessage::new(Role::User, vec![ContentBlock::text("a".repeat(40))], 1, 0)];
        assert_eq!(estimate_context_tokens(&Counter, "b".repeat(8).as_str(), &entries), 12);
    }

    #[test]
    fn test_context_percent() {
        assert_eq!(context_percent(50, 200), 25);
        assert_eq!(context_percent(1, 0), 100);
    }
}
