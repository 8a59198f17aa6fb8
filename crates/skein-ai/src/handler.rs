//! The provider/model collaborator interface

use async_trait::async_trait;

use crate::{ApiStream, ContentBlock, Message, Model, ReasoningLevel, Result, ToolDefinition};

/// Per-request options passed alongside the transcript
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    /// Task issuing the request, for provider-side tracing
    pub task_id: Option<String>,
    /// Active mode slug
    pub mode: Option<String>,
    /// Native tool definitions; empty when tools are described in the prompt
    pub tools: Vec<ToolDefinition>,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub reasoning: ReasoningLevel,
}

/// A model provider able to stream one response for a transcript.
///
/// Dropping the returned stream cancels the underlying transport call.
#[async_trait]
pub trait ApiHandler: Send + Sync {
    /// Open a response stream for the given system prompt and transcript
    async fn create_message(
        &self,
        system_prompt: &str,
        messages: &[Message],
        metadata: &RequestMetadata,
    ) -> Result<ApiStream>;

    /// The model this handler talks to
    fn model(&self) -> Model;

    /// Estimate the token count of some content. Providers with a real
    /// tokenizer endpoint may override this.
    fn count_tokens(&self, content: &[ContentBlock]) -> u64 {
        let chars: usize = content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.len(),
                ContentBlock::Reasoning { text, .. } => text.len(),
                ContentBlock::Image { .. } => 4800,
                ContentBlock::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
                ContentBlock::ToolResult { content, .. } => content
                    .iter()
                    .map(|c| match c {
                        ContentBlock::Image { .. } => 4800,
                        other => other.as_text().map_or(0, str::len),
                    })
                    .sum(),
            })
            .sum();
        chars.div_ceil(4) as u64
    }
}
