//! File writing tool

use async_trait::async_trait;
use serde_json::json;
use skein_task::{Tool, ToolResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::sync::CancellationToken;

pub struct WriteFileTool {
    workspace: PathBuf,
}

impl WriteFileTool {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_to_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating it and any parent directories if needed. Overwrites existing files."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace"
                },
                "content": {
                    "type": "string",
                    "description": "Complete new content of the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn modifies_workspace(&self) -> bool {
        true
    }

    async fn execute(&self, _tool_use_id: &str, arguments: serde_json::Value, cancel: CancellationToken) -> ToolResult {
        let Some(path_str) = arguments.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing 'path' argument");
        };
        let Some(content) = arguments.get("content").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing 'content' argument");
        };
        if cancel.is_cancelled() {
            return ToolResult::error("Operation cancelled");
        }

        let path = super::resolve(&self.workspace, path_str);
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return ToolResult::error(format!("Failed to create directory: {}", e));
            }
        }
        match fs::write(&path, content).await {
            Ok(()) => ToolResult::text(format!("Wrote {} bytes to {}", content.len(), path_str)),
            Err(e) => ToolResult::error(format!("Failed to write {}: {}", path_str, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFileTool::new(dir.path());
        let result = tool
            .execute(
                "c1",
                json!({"path": "src/deep/mod.rs", "content": "pub fn f() {}\n"}),
                CancellationToken::new(),
            )
            .await;
        assert!(!result.is_error, "{}", result.text_content());
        let written = std::fs::read_to_string(dir.path().join("src/deep/mod.rs")).unwrap();
        assert_eq!(written, "pub fn f() {}\n");
    }

    #[tokio::test]
    async fn test_cancelled_write_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFileTool::new(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = tool.execute("c1", json!({"path": "a.txt", "content": "x"}), cancel).await;
        assert!(result.is_error);
        assert!(!dir.path().join("a.txt").exists());
    }
}
