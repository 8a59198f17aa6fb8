//! Completion tool

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::tool::{Tool, ToolEffect, ToolResult};

/// Ends the task with a final result
pub struct AttemptCompletionTool;

impl AttemptCompletionTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AttemptCompletionTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for AttemptCompletionTool {
    fn name(&self) -> &str {
        "attempt_completion"
    }

    fn description(&self) -> &str {
        "Present the final result of the task to the user. Use only once the task is complete. \
         The user may accept the result or reply with feedback, in which case work continues."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "result": {
                    "type": "string",
                    "description": "Final result of the task, stated without questions or offers of further help"
                },
                "command": {
                    "type": "string",
                    "description": "Optional command the user can run to see the result"
                }
            },
            "required": ["result"]
        })
    }

    async fn execute(&self, _tool_use_id: &str, arguments: serde_json::Value, _cancel: CancellationToken) -> ToolResult {
        let result = arguments["result"].as_str().unwrap_or_default().trim().to_string();
        if result.is_empty() {
            return ToolResult::error("Missing value for required parameter 'result'");
        }
        let command = arguments["command"].as_str().map(str::to_string);
        ToolResult::text(result.clone()).with_effect(ToolEffect::Completion { result, command })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completion_effect() {
        let result = AttemptCompletionTool::new()
            .execute("c1", json!({"result": "Done.", "command": "cat out.txt"}), CancellationToken::new())
            .await;
        assert!(!result.is_error);
        assert_eq!(
            result.effect,
            Some(ToolEffect::Completion {
                result: "Done.".into(),
                command: Some("cat out.txt".into())
            })
        );
    }

    #[tokio::test]
    async fn test_blank_result_is_error() {
        let result = AttemptCompletionTool::new()
            .execute("c1", json!({"result": "   "}), CancellationToken::new())
            .await;
        assert!(result.is_error);
        assert!(result.effect.is_none());
    }
}
