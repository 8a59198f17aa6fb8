//! Mode switching tool

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::tool::{Tool, ToolEffect, ToolResult};

pub struct SwitchModeTool;

impl SwitchModeTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SwitchModeTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for SwitchModeTool {
    fn name(&self) -> &str {
        "switch_mode"
    }

    fn description(&self) -> &str {
        "Switch the task to a different mode, for example to move from planning to implementation."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "mode_slug": {
                    "type": "string",
                    "description": "Slug of the mode to switch to"
                },
                "reason": {
                    "type": "string",
                    "description": "Why the switch is needed"
                }
            },
            "required": ["mode_slug"]
        })
    }

    async fn execute(&self, _tool_use_id: &str, arguments: serde_json::Value, _cancel: CancellationToken) -> ToolResult {
        let mode = arguments["mode_slug"].as_str().unwrap_or_default().trim().to_string();
        if mode.is_empty() {
            return ToolResult::error("Missing value for required parameter 'mode_slug'");
        }
        let reason = arguments["reason"].as_str().map(str::to_string);
        let text = match &reason {
            Some(reason) => format!("Switched to '{}' mode because: {}", mode, reason),
            None => format!("Switched to '{}' mode", mode),
        };
        ToolResult::text(text).with_effect(ToolEffect::SwitchMode { mode, reason })
    }
}
