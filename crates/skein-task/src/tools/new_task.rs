//! Delegation tool

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::tool::{Tool, ToolEffect, ToolResult};

/// Hands a sub-goal to a new child task
pub struct NewTaskTool;

impl NewTaskTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NewTaskTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Todos arrive either as an array or as a markdown checklist
fn parse_todos(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        serde_json::Value::String(list) => list
            .lines()
            .map(|line| {
                let line = line.trim();
                let line = line.strip_prefix("- ").unwrap_or(line);
                let line = line
                    .strip_prefix("[ ] ")
                    .or_else(|| line.strip_prefix("[x] "))
                    .or_else(|| line.strip_prefix("[-] "))
                    .unwrap_or(line);
                line.trim().to_string()
            })
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl Tool for NewTaskTool {
    fn name(&self) -> &str {
        "new_task"
    }

    fn description(&self) -> &str {
        "Start a new subtask in the given mode with the given instructions. \
         The subtask runs on its own and its result is reported back when it finishes."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "mode": {
                    "type": "string",
                    "description": "Mode the subtask starts in"
                },
                "message": {
                    "type": "string",
                    "description": "Instructions for the subtask"
                },
                "todos": {
                    "description": "Initial todo list, as an array or a markdown checklist",
                    "type": ["array", "string"],
                    "items": { "type": "string" }
                }
            },
            "required": ["mode", "message"]
        })
    }

    async fn execute(&self, _tool_use_id: &str, arguments: serde_json::Value, _cancel: CancellationToken) -> ToolResult {
        let mode = arguments["mode"].as_str().unwrap_or_default().trim().to_string();
        let message = arguments["message"].as_str().unwrap_or_default().trim().to_string();
        if mode.is_empty() {
            return ToolResult::error("Missing value for required parameter 'mode'");
        }
        if message.is_empty() {
            return ToolResult::error("Missing value for required parameter 'message'");
        }
        let initial_todos = parse_todos(&arguments["todos"]);
        ToolResult::text(format!("Delegating to a new task in '{}' mode", mode)).with_effect(ToolEffect::Delegate {
            message,
            mode,
            initial_todos,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_checklist() {
        let todos = parse_todos(&json!("- [ ] write tests\n- [x] read code\n\nship it"));
        assert_eq!(todos, vec!["write tests", "read code", "ship it"]);
    }

    #[tokio::test]
    async fn test_delegate_effect() {
        let result = NewTaskTool::new()
            .execute(
                "c1",
                json!({"mode": "code", "message": "Fix the parser", "todos": ["a", "b"]}),
                CancellationToken::new(),
            )
            .await;
        assert!(!result.is_error);
        assert_eq!(
            result.effect,
            Some(ToolEffect::Delegate {
                message: "Fix the parser".into(),
                mode: "code".into(),
                initial_todos: vec!["a".into(), "b".into()],
            })
        );
    }

    #[tokio::test]
    async fn test_missing_message() {
        let result = NewTaskTool::new()
            .execute("c1", json!({"mode": "code", "message": ""}), CancellationToken::new())
            .await;
        assert!(result.is_error);
    }
}
