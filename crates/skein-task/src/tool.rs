//! Tool trait, results and the validating registry

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skein_ai::{ContentBlock, ToolDefinition};
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, TaskEvent};

/// Control-flow effect a tool asks the task to apply after the round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolEffect {
    /// The task is done
    Completion {
        result: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    /// Hand a sub-goal to a new child task
    Delegate {
        message: String,
        mode: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        initial_todos: Vec<String>,
    },
    SwitchMode {
        mode: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ToolEffect {
    /// Effects that end the round; later tool calls are skipped
    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolEffect::Completion { .. } | ToolEffect::Delegate { .. })
    }
}

/// Result of a tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Content returned to the model
    pub content: Vec<ContentBlock>,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<ToolEffect>,
}

impl ToolResult {
    /// Create a successful text result
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: false,
            effect: None,
        }
    }

    /// Create an error result
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(message)],
            is_error: true,
            effect: None,
        }
    }

    pub fn with_effect(mut self, effect: ToolEffect) -> Self {
        self.effect = Some(effect);
        self
    }

    /// Get the text content as a single string
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Sends progress updates for one tool call as [`TaskEvent::ToolProgress`]
#[derive(Clone)]
pub struct ProgressSender {
    events: EventBus,
    tool_use_id: String,
    tool_name: String,
}

impl ProgressSender {
    pub fn new(events: EventBus, tool_use_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            events,
            tool_use_id: tool_use_id.into(),
            tool_name: tool_name.into(),
        }
    }

    pub fn send(&self, content: impl Into<String>) {
        self.events.emit(TaskEvent::ToolProgress {
            tool_use_id: self.tool_use_id.clone(),
            tool_name: self.tool_name.clone(),
            content: content.into(),
        });
    }
}

/// Trait for executable tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in API calls)
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters_schema(&self) -> serde_json::Value;

    /// Whether running this tool changes the workspace. A checkpoint is
    /// taken before the first such tool of a round.
    fn modifies_workspace(&self) -> bool {
        false
    }

    async fn execute(&self, tool_use_id: &str, arguments: serde_json::Value, cancel: CancellationToken) -> ToolResult;

    /// Execute with progress reporting. The default ignores `progress`.
    async fn execute_with_progress(
        &self,
        tool_use_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
        _progress: ProgressSender,
    ) -> ToolResult {
        self.execute(tool_use_id, arguments, cancel).await
    }
}

pub type BoxedTool = Arc<dyn Tool>;

/// Convert a tool to the definition offered to the model
pub fn to_api_tool(tool: &dyn Tool) -> ToolDefinition {
    ToolDefinition::new(tool.name(), tool.description(), tool.parameters_schema())
}

/// Tools available to a task, with compiled argument validators
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<BoxedTool>,
    schema_cache: HashMap<String, Arc<jsonschema::Validator>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in protocol tools
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for tool in crate::tools::builtin() {
            registry.register(tool);
        }
        registry
    }

    /// Add a tool, replacing one with the same name
    pub fn register(&mut self, tool: BoxedTool) {
        self.tools.retain(|t| t.name() != tool.name());
        self.cache_tool_schema(&tool);
        self.tools.push(tool);
    }

    fn cache_tool_schema(&mut self, tool: &BoxedTool) {
        let schema = tool.parameters_schema();
        match jsonschema::validator_for(&schema) {
            Ok(validator) => {
                self.schema_cache.insert(tool.name().to_string(), Arc::new(validator));
            }
            Err(e) => {
                tracing::warn!(
                    "Invalid tool parameter schema for '{}', skipping validation: {}",
                    tool.name(),
                    e
                );
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&BoxedTool> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| to_api_tool(t.as_ref())).collect()
    }

    pub fn modifies_workspace(&self, name: &str) -> bool {
        self.get(name).is_some_and(|t| t.modifies_workspace())
    }

    /// Check arguments against the tool's schema. Returns the error message
    /// to hand back to the model, if any.
    pub fn validate(&self, name: &str, arguments: &serde_json::Value) -> Option<String> {
        if let serde_json::Value::String(raw) = arguments {
            return Some(format!("Tool arguments were not valid JSON: {}", raw));
        }
        self.schema_cache
            .get(name)
            .and_then(|validator| validate_with_validator(arguments, validator))
    }

    /// Validate and run one call. Unknown tools and invalid arguments come
    /// back as error results rather than failures.
    pub async fn execute(
        &self,
        tool_use_id: &str,
        name: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
        events: &EventBus,
    ) -> ToolResult {
        let Some(tool) = self.get(name) else {
            return ToolResult::error(format!("Tool not found: {}", name));
        };
        if let Some(error) = self.validate(name, &arguments) {
            return ToolResult::error(error);
        }
        let progress = ProgressSender::new(events.clone(), tool_use_id, name);
        tool.execute_with_progress(tool_use_id, arguments, cancel, progress).await
    }
}

/// Validate tool arguments using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
fn validate_with_validator(args: &serde_json::Value, validator: &jsonschema::Validator) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!("Tool argument validation failed:\n{}", errors.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                },
                "required": ["text"]
            })
        }
        async fn execute(&self, _tool_use_id: &str, arguments: serde_json::Value, _cancel: CancellationToken) -> ToolResult {
            ToolResult::text(arguments["text"].as_str().unwrap_or("(empty)"))
        }
        async fn execute_with_progress(
            &self,
            tool_use_id: &str,
            arguments: serde_json::Value,
            cancel: CancellationToken,
            progress: ProgressSender,
        ) -> ToolResult {
            progress.send("echoing");
            self.execute(tool_use_id, arguments, cancel).await
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry
    }

    #[tokio::test]
    async fn test_execute_reports_progress() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let result = registry()
            .execute("c1", "echo", json!({"text": "hi"}), CancellationToken::new(), &events)
            .await;
        assert!(!result.is_error);
        assert_eq!(result.text_content(), "hi");
        match rx.recv().await.unwrap() {
            TaskEvent::ToolProgress {
                tool_use_id, content, ..
            } => {
                assert_eq!(tool_use_id, "c1");
                assert_eq!(content, "echoing");
            }
            other => panic!("expected ToolProgress, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result() {
        let result = registry()
            .execute("c1", "nope", json!({}), CancellationToken::new(), &EventBus::new())
            .await;
        assert!(result.is_error);
        assert_eq!(result.text_content(), "Tool not found: nope");
    }

    #[test]
    fn test_validate_missing_required() {
        let error = registry().validate("echo", &json!({})).unwrap();
        assert!(error.contains("Tool argument validation failed"));
        assert!(error.contains("text"));
    }

    #[test]
    fn test_validate_wrong_type() {
        let error = registry().validate("echo", &json!({"text": 42})).unwrap();
        assert!(error.contains("/text"));
    }

    #[test]
    fn test_unparsed_arguments_are_rejected() {
        let error = registry()
            .validate("echo", &serde_json::Value::String("{\"text\":".into()))
            .unwrap();
        assert!(error.contains("not valid JSON"));
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut registry = registry();
        registry.register(Arc::new(EchoTool));
        assert_eq!(registry.names(), vec!["echo"]);
        assert_eq!(registry.definitions()[0].description, "Echoes input");
    }

    #[test]
    fn test_terminal_effects() {
        assert!(ToolEffect::Completion {
            result: "done".into(),
            command: None
        }
        .is_terminal());
        assert!(!ToolEffect::SwitchMode {
            mode: "ask".into(),
            reason: None
        }
        .is_terminal());
    }
}
