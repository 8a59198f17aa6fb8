//! Core types exchanged with a model

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Known model providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    Custom,
}

impl Provider {
    /// Get a human-readable name for this provider
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Anthropic => "Anthropic",
            Provider::Custom => "Custom",
        }
    }

    /// Get the environment variable name for this provider's API key
    pub fn api_key_env_var(&self) -> Option<&'static str> {
        match self {
            Provider::Anthropic => Some("ANTHROPIC_API_KEY"),
            Provider::Custom => None,
        }
    }
}

/// Cost information for a model (per million tokens)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostInfo {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
    /// Thinking/reasoning tokens cost
    #[serde(default)]
    pub thinking: f64,
}

/// Model definition returned by a handler's `model()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    /// Model identifier (e.g., "claude-sonnet-4-5")
    pub id: String,
    /// Human-readable name
    pub name: String,
    pub provider: Provider,
    /// Base URL for API calls
    pub base_url: String,
    /// Whether the model produces reasoning blocks that must be replayed
    pub reasoning: bool,
    /// Cost per million tokens
    pub cost: CostInfo,
    /// Context window size in tokens
    pub context_window: u32,
    /// Maximum output tokens
    pub max_tokens: u32,
    /// Additional headers for API calls
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Model {
    /// A Claude model on the public Anthropic endpoint.
    pub fn anthropic(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: "Claude".to_string(),
            provider: Provider::Anthropic,
            base_url: "https://api.anthropic.com".to_string(),
            reasoning: true,
            cost: CostInfo {
                input: 3.0,
                output: 15.0,
                cache_read: 0.3,
                cache_write: 3.75,
                thinking: 15.0,
            },
            context_window: 200_000,
            max_tokens: 64_000,
            headers: HashMap::new(),
        }
    }
}

/// Token usage reported by a stream. Providers may report several partial
/// usages per request; consumers sum them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    /// Thinking/reasoning tokens
    pub thinking: u64,
    /// Cost the provider computed itself, when it reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

impl Usage {
    /// Fold another partial usage report into this one
    pub fn accumulate(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.thinking += other.thinking;
        if let Some(cost) = other.total_cost {
            self.total_cost = Some(self.total_cost.unwrap_or(0.0) + cost);
        }
    }

    /// Calculate cost for this usage given a model
    pub fn calculate_cost(&self, model: &Model) -> CostBreakdown {
        let input = (self.input as f64 / 1_000_000.0) * model.cost.input;
        let output = (self.output as f64 / 1_000_000.0) * model.cost.output;
        let cache_read = (self.cache_read as f64 / 1_000_000.0) * model.cost.cache_read;
        let cache_write = (self.cache_write as f64 / 1_000_000.0) * model.cost.cache_write;
        let thinking = (self.thinking as f64 / 1_000_000.0) * model.cost.thinking;

        CostBreakdown {
            input,
            output,
            cache_read,
            cache_write,
            thinking,
            total: self
                .total_cost
                .unwrap_or(input + output + cache_read + cache_write + thinking),
        }
    }
}

/// Cost breakdown in dollars
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
    pub thinking: f64,
    pub total: f64,
}

/// Transcript roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Content blocks in a transcript message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Text content
    Text { text: String },
    /// Image content (base64 encoded)
    Image { data: String, mime_type: String },
    /// Reasoning/thinking content, with the provider signature needed to replay it
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// Tool call requested by the assistant
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Result of a tool call, sent back in a user turn
    ToolResult {
        tool_use_id: String,
        content: Vec<ContentBlock>,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    /// Create text content
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create image content from base64 data
    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Image {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Create a tool use block
    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    /// Create a text-only tool result block
    pub fn tool_result(tool_use_id: impl Into<String>, text: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: vec![Self::text(text)],
            is_error,
        }
    }

    /// Get text if this is text content
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Check if this is a tool use block
    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }

    /// Check if this is a tool result block
    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult { .. })
    }

    /// Check if this is a reasoning block
    pub fn is_reasoning(&self) -> bool {
        matches!(self, Self::Reasoning { .. })
    }
}

/// A message as sent to a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    /// Create a user message with text content
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Create an assistant message with text content
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Extract all tool uses from the message
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
                _ => None,
            })
            .collect()
    }

    /// Get combined text content
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Tool definition offered to the model for native tool calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (used in API calls)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for parameters
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Create a new tool definition
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Reasoning/thinking level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

impl ReasoningLevel {
    /// Thinking token budget for this level, if reasoning is enabled
    pub fn budget_tokens(&self) -> Option<u32> {
        match self {
            ReasoningLevel::Off => None,
            ReasoningLevel::Low => Some(2_048),
            ReasoningLevel::Medium => Some(8_192),
            ReasoningLevel::High => Some(16_384),
        }
    }
}
