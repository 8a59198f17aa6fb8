//! Anthropic Claude API provider

use crate::{
    error::{Error, Result},
    handler::{ApiHandler, RequestMetadata},
    stream::{ApiStream, ApiStreamChunk},
    types::{ContentBlock, Message, Model, Role, ToolDefinition, Usage},
};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

/// Anthropic API client bound to one model
pub struct AnthropicHandler {
    client: reqwest::Client,
    api_key: String,
    model: Model,
}

impl AnthropicHandler {
    /// Create a new handler with an API key
    pub fn new(api_key: impl Into<String>, model: Model) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model,
        }
    }

    /// Create from environment variable
    pub fn from_env(model: Model) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| Error::InvalidApiKey)?;
        Ok(Self::new(api_key, model))
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", header_value(&self.api_key)?);
        headers.insert(
            "anthropic-beta",
            HeaderValue::from_static("fine-grained-tool-streaming-2025-05-14"),
        );
        headers.insert("accept", HeaderValue::from_static("application/json"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));

        for (key, value) in &self.model.headers {
            if let (Ok(name), Ok(val)) = (key.parse::<HeaderName>(), value.parse::<HeaderValue>()) {
                headers.insert(name, val);
            }
        }
        Ok(headers)
    }

    fn build_request(
        &self,
        system_prompt: &str,
        messages: &[Message],
        metadata: &RequestMetadata,
    ) -> AnthropicRequest {
        let tools = if metadata.tools.is_empty() {
            None
        } else {
            Some(convert_tools(&metadata.tools))
        };

        let thinking = metadata
            .reasoning
            .budget_tokens()
            .filter(|_| self.model.reasoning)
            .map(|budget_tokens| ThinkingConfig {
                thinking_type: "enabled".to_string(),
                budget_tokens,
            });

        let system = (!system_prompt.is_empty()).then(|| {
            vec![SystemBlock {
                block_type: "text".to_string(),
                text: system_prompt.to_string(),
                cache_control: Some(CacheControl {
                    control_type: "ephemeral".to_string(),
                }),
            }]
        });

        AnthropicRequest {
            model: self.model.id.clone(),
            messages: convert_messages(messages),
            max_tokens: metadata.max_tokens.unwrap_or(self.model.max_tokens / 3),
            stream: true,
            system,
            // Extended thinking rejects a custom temperature.
            temperature: if thinking.is_some() { None } else { metadata.temperature },
            tools,
            thinking,
            metadata: metadata.task_id.as_ref().map(|id| RequestUserMetadata {
                user_id: id.clone(),
            }),
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::InvalidConfig(format!("invalid header value: {}", e)))
}

#[async_trait]
impl ApiHandler for AnthropicHandler {
    async fn create_message(
        &self,
        system_prompt: &str,
        messages: &[Message],
        metadata: &RequestMetadata,
    ) -> Result<ApiStream> {
        let request = self.build_request(system_prompt, messages, metadata);
        let url = format!("{}/v1/messages", self.model.base_url);

        tracing::debug!(url = %url, model = %self.model.id, "opening Anthropic stream");

        let request_builder = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&request);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(Box::pin(create_stream(event_source)))
    }

    fn model(&self) -> Model {
        self.model.clone()
    }
}

/// Translate SSE events into response chunks
fn create_stream(
    mut event_source: EventSource,
) -> impl futures::Stream<Item = Result<ApiStreamChunk>> {
    stream! {
        while let Some(event_result) = event_source.next().await {
            match event_result {
                Ok(Event::Open) => {}
                Ok(Event::Message(message)) => match message.event.as_str() {
                    "message_start" => {
                        if let Ok(data) = serde_json::from_str::<MessageStartEvent>(&message.data) {
                            yield Ok(ApiStreamChunk::Usage(data.message.usage.into_usage()));
                        }
                    }
                    "content_block_start" => {
                        if let Ok(data) = serde_json::from_str::<ContentBlockStartEvent>(&message.data) {
                            match data.content_block.block_type.as_str() {
                                "tool_use" => {
                                    yield Ok(ApiStreamChunk::ToolCallPartial {
                                        index: data.index,
                                        id: data.content_block.id,
                                        name: data.content_block.name,
                                        arguments: None,
                                    });
                                }
                                "text" => {
                                    if let Some(text) = data.content_block.text.filter(|t| !t.is_empty()) {
                                        yield Ok(ApiStreamChunk::Text { text });
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                    "content_block_delta" => {
                        if let Ok(data) = serde_json::from_str::<ContentBlockDeltaEvent>(&message.data) {
                            match data.delta.delta_type.as_str() {
                                "text_delta" => {
                                    yield Ok(ApiStreamChunk::Text {
                                        text: data.delta.text.unwrap_or_default(),
                                    });
                                }
                                "thinking_delta" => {
                                    yield Ok(ApiStreamChunk::Reasoning {
                                        text: data.delta.thinking.unwrap_or_default(),
                                        signature: None,
                                    });
                                }
                                "signature_delta" => {
                                    yield Ok(ApiStreamChunk::Reasoning {
                                        text: String::new(),
                                        signature: data.delta.signature,
                                    });
                                }
                                "input_json_delta" => {
                                    yield Ok(ApiStreamChunk::ToolCallPartial {
                                        index: data.index,
                                        id: None,
                                        name: None,
                                        arguments: data.delta.partial_json,
                                    });
                                }
                                _ => {}
                            }
                        }
                    }
                    "message_delta" => {
                        if let Ok(data) = serde_json::from_str::<MessageDeltaEvent>(&message.data) {
                            // message_start already reported the input side.
                            yield Ok(ApiStreamChunk::Usage(Usage {
                                output: data.usage.output_tokens,
                                ..Default::default()
                            }));
                        }
                    }
                    "message_stop" => break,
                    "error" => {
                        let error = serde_json::from_str::<ErrorEvent>(&message.data)
                            .map(|data| Error::api(data.error.error_type, data.error.message))
                            .unwrap_or_else(|_| Error::UnexpectedResponse(message.data.clone()));
                        yield Err(error);
                        break;
                    }
                    _ => {}
                },
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                    yield Err(status_error(status.as_u16(), response).await);
                    break;
                }
                Err(e) => {
                    yield Err(Error::Sse(e.to_string()));
                    break;
                }
            }
        }
        event_source.close();
    }
}

async fn status_error(status: u16, response: reqwest::Response) -> Error {
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    if status == 429 {
        return Error::RateLimited { retry_after };
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorEvent>(&body) {
        Ok(data) => Error::api_status(status, data.error.error_type, data.error.message),
        Err(_) => Error::api_status(status, "http_error", format!("HTTP {}: {}", status, body)),
    }
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<SystemBlock>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<RequestUserMetadata>,
}

#[derive(Debug, Serialize)]
struct RequestUserMetadata {
    user_id: String,
}

#[derive(Debug, Serialize)]
struct SystemBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Debug, Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    control_type: String,
}

#[derive(Debug, Serialize)]
struct ThinkingConfig {
    #[serde(rename = "type")]
    thinking_type: String,
    budget_tokens: u32,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

// ============================================================================
// Response event types
// ============================================================================

#[derive(Debug, Deserialize)]
struct MessageStartEvent {
    message: MessageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    usage: UsageInfo,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    cache_read_input_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
}

impl UsageInfo {
    fn into_usage(self) -> Usage {
        Usage {
            input: self.input_tokens,
            output: self.output_tokens,
            cache_read: self.cache_read_input_tokens.unwrap_or(0),
            cache_write: self.cache_creation_input_tokens.unwrap_or(0),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContentBlockStartEvent {
    index: u32,
    content_block: ContentBlockInfo,
}

#[derive(Debug, Deserialize)]
struct ContentBlockInfo {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDeltaEvent {
    index: u32,
    delta: DeltaInfo,
}

#[derive(Debug, Deserialize)]
struct DeltaInfo {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    thinking: Option<String>,
    signature: Option<String>,
    partial_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaEvent {
    usage: UsageInfo,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

// ============================================================================
// Conversion functions
// ============================================================================

fn convert_block(block: &ContentBlock) -> Option<serde_json::Value> {
    match block {
        ContentBlock::Text { text } if text.is_empty() => None,
        ContentBlock::Text { text } => Some(serde_json::json!({ "type": "text", "text": text })),
        ContentBlock::Image { data, mime_type } => Some(serde_json::json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": mime_type,
                "data": data
            }
        })),
        // Unsigned thinking cannot be replayed.
        ContentBlock::Reasoning { signature: None, .. } => None,
        ContentBlock::Reasoning {
            text,
            signature: Some(signature),
        } => Some(serde_json::json!({
            "type": "thinking",
            "thinking": text,
            "signature": signature
        })),
        ContentBlock::ToolUse { id, name, input } => Some(serde_json::json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input
        })),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let inner: Vec<serde_json::Value> = content.iter().filter_map(convert_block).collect();
            Some(serde_json::json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": inner,
                "is_error": is_error
            }))
        }
    }
}

fn convert_messages(messages: &[Message]) -> Vec<AnthropicMessage> {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .filter_map(|message| {
            let blocks: Vec<serde_json::Value> = message.content.iter().filter_map(convert_block).collect();
            (!blocks.is_empty()).then(|| AnthropicMessage {
                role: message.role.as_str().to_string(),
                content: serde_json::Value::Array(blocks),
            })
        })
        .collect()
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
    tools
        .iter()
        .map(|tool| {
            let input_schema = if tool.parameters.is_object() {
                let mut schema = tool.parameters.clone();
                if let Some(obj) = schema.as_object_mut() {
                    obj.entry("type").or_insert(serde_json::json!("object"));
                }
                schema
            } else {
                serde_json::json!({
                    "type": "object",
                    "properties": {},
                    "required": []
                })
            };

            AnthropicTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReasoningLevel;

    #[test]
    fn test_convert_messages_drops_unsigned_reasoning() {
        let messages = vec![Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Reasoning {
                    text: "private".into(),
                    signature: None,
                },
                ContentBlock::text("answer"),
            ],
        }];
        let converted = convert_messages(&messages);
        assert_eq!(converted.len(), 1);
        let blocks = converted[0].content.as_array().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["type"], "text");
    }

    #[test]
    fn test_convert_messages_keeps_signed_thinking() {
        let messages = vec![Message {
            role: Role::Assistant,
            content: vec![ContentBlock::Reasoning {
                text: "plan".into(),
                signature: Some("sig".into()),
            }],
        }];
        let converted = convert_messages(&messages);
        let blocks = converted[0].content.as_array().unwrap();
        assert_eq!(blocks[0]["type"], "thinking");
        assert_eq!(blocks[0]["signature"], "sig");
    }

    #[test]
    fn test_convert_tool_result_nested_content() {
        let messages = vec![Message {
            role: Role::User,
            content: vec![ContentBlock::tool_result("t1", "done", true)],
        }];
        let converted = convert_messages(&messages);
        let block = &converted[0].content.as_array().unwrap()[0];
        assert_eq!(block["type"], "tool_result");
        assert_eq!(block["is_error"], true);
        assert_eq!(block["content"][0]["text"], "done");
    }

    #[test]
    fn test_build_request_thinking_disables_temperature() {
        let handler = AnthropicHandler::new("key", Model::anthropic("claude-test"));
        let metadata = RequestMetadata {
            temperature: Some(0.2),
            reasoning: ReasoningLevel::Low,
            ..Default::default()
        };
        let request = handler.build_request("sys", &[Message::user("hi")], &metadata);
        assert!(request.thinking.is_some());
        assert!(request.temperature.is_none());
        assert!(request.tools.is_none());
    }

    #[test]
    fn test_convert_tools_adds_object_type() {
        let tools = vec![ToolDefinition::new(
            "read",
            "Read a file",
            serde_json::json!({ "properties": { "path": { "type": "string" } } }),
        )];
        let converted = convert_tools(&tools);
        assert_eq!(converted[0].input_schema["type"], "object");
    }
}
