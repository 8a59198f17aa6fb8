//! File reading tool

use async_trait::async_trait;
use serde_json::json;
use skein_task::{Tool, ToolResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::sync::CancellationToken;

const MAX_LINES: usize = 2000;
const MAX_LINE_LENGTH: usize = 2000;

pub struct ReadFileTool {
    workspace: PathBuf,
}

impl ReadFileTool {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace. For large files, use offset and limit."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace"
                },
                "offset": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Line number to start reading from (1-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of lines to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, _tool_use_id: &str, arguments: serde_json::Value, cancel: CancellationToken) -> ToolResult {
        let Some(path_str) = arguments.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing 'path' argument");
        };
        if cancel.is_cancelled() {
            return ToolResult::error("Operation cancelled");
        }

        let path = super::resolve(&self.workspace, path_str);
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("Failed to read {}: {}", path_str, e)),
        };

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();
        let offset = arguments
            .get("offset")
            .and_then(|v| v.as_u64())
            .map(|o| (o as usize).saturating_sub(1))
            .unwrap_or(0);
        let limit = arguments
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|l| l as usize)
            .unwrap_or(MAX_LINES);

        if total == 0 {
            return ToolResult::text("(empty file)");
        }
        if offset >= total {
            return ToolResult::error(format!(
                "Offset {} is beyond end of file ({} lines total)",
                offset + 1,
                total
            ));
        }

        let end = (offset + limit).min(total);
        let mut truncated = false;
        let mut output = lines[offset..end]
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let line = match line.char_indices().nth(MAX_LINE_LENGTH) {
                    Some((cut, _)) => {
                        truncated = true;
                        &line[..cut]
                    }
                    None => line,
                };
                format!("{:>6}\t{}", offset + i + 1, line)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut notices = Vec::new();
        if truncated {
            notices.push(format!("Some lines were truncated to {} characters", MAX_LINE_LENGTH));
        }
        if end < total {
            notices.push(format!(
                "{} more lines not shown. Use offset={} to continue reading",
                total - end,
                end + 1
            ));
        }
        if !notices.is_empty() {
            output.push_str(&format!("\n\n... ({})", notices.join(". ")));
        }
        ToolResult::text(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_with_offset_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "one\ntwo\nthree\nfour\n").unwrap();
        let tool = ReadFileTool::new(dir.path());

        let result = tool
            .execute(
                "c1",
                json!({"path": "notes.txt", "offset": 2, "limit": 2}),
                CancellationToken::new(),
            )
            .await;
        assert!(!result.is_error);
        let text = result.text_content();
        assert!(text.contains("2\ttwo"));
        assert!(text.contains("3\tthree"));
        assert!(!text.contains("four\n"));
        assert!(text.contains("Use offset=4"));
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReadFileTool::new(dir.path());
        let result = tool
            .execute("c1", json!({"path": "absent.txt"}), CancellationToken::new())
            .await;
        assert!(result.is_error);
    }
}
