//! Shell command tool

use async_trait::async_trait;
use serde_json::json;
use skein_task::{ProgressSender, Tool, ToolResult};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Output kept for the model, per stream
const MAX_OUTPUT_BYTES: usize = 100_000;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub struct ExecuteCommandTool {
    workspace: PathBuf,
}

impl ExecuteCommandTool {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
        }
    }
}

#[derive(Default)]
struct Captured {
    text: String,
    truncated: bool,
}

impl Captured {
    fn push(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        if self.text.len() + line.len() > MAX_OUTPUT_BYTES {
            self.truncated = true;
            return;
        }
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(line);
    }
}

fn render(stdout: Captured, stderr: Captured) -> String {
    let mut out = String::new();
    for (name, captured) in [("stdout", stdout), ("stderr", stderr)] {
        if captured.text.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&captured.text);
        if captured.truncated {
            out.push_str(&format!("\n... ({} truncated at {}KB)", name, MAX_OUTPUT_BYTES / 1024));
        }
    }
    if out.is_empty() {
        out.push_str("(no output)");
    }
    out
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace and return its output."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command line to run"
                },
                "timeout": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Timeout in seconds (default 120)"
                }
            },
            "required": ["command"]
        })
    }

    // Commands can change anything
    fn modifies_workspace(&self) -> bool {
        true
    }

    async fn execute(&self, tool_use_id: &str, arguments: serde_json::Value, cancel: CancellationToken) -> ToolResult {
        self.run(tool_use_id, arguments, cancel, None).await
    }

    async fn execute_with_progress(
        &self,
        tool_use_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
        progress: ProgressSender,
    ) -> ToolResult {
        self.run(tool_use_id, arguments, cancel, Some(progress)).await
    }
}

impl ExecuteCommandTool {
    async fn run(
        &self,
        _tool_use_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
        progress: Option<ProgressSender>,
    ) -> ToolResult {
        let Some(command) = arguments.get("command").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing 'command' argument");
        };
        let timeout_secs = arguments
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let (shell, flag) = if cfg!(target_os = "windows") { ("cmd", "/C") } else { ("sh", "-c") };
        let mut child = match Command::new(shell)
            .arg(flag)
            .arg(command)
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return ToolResult::error(format!("Failed to spawn command: {}", e)),
        };
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return ToolResult::error("Failed to capture command output");
        };
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut out = Captured::default();
        let mut err = Captured::default();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
        tokio::pin!(deadline);

        // Drain both pipes before collecting the exit status
        while stdout_open || stderr_open {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return ToolResult::error("Command cancelled");
                }
                _ = &mut deadline => {
                    let _ = child.kill().await;
                    return ToolResult::error(format!(
                        "{}\n\nCommand timed out after {} seconds",
                        render(out, err),
                        timeout_secs
                    ));
                }
                line = stdout_lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        if let Some(progress) = &progress {
                            progress.send(line.clone());
                        }
                        out.push(&line);
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        err.push(&format!("stdout read error: {}", e));
                        stdout_open = false;
                    }
                },
                line = stderr_lines.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => err.push(&line),
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        err.push(&format!("stderr read error: {}", e));
                        stderr_open = false;
                    }
                },
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return ToolResult::error("Command cancelled");
            }
            status = child.wait() => status,
        };
        match status {
            Ok(status) if status.success() => ToolResult::text(render(out, err)),
            Ok(status) => ToolResult::error(format!(
                "{}\n\nCommand exited with code {}",
                render(out, err),
                status.code().unwrap_or(-1)
            )),
            Err(e) => ToolResult::error(format!("Failed to wait for command: {}", e)),
        }
    }
}
