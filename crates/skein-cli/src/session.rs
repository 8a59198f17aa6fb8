//! Runs a task tree to the end in the foreground
//!
//! A delegation opens a child task that runs until it completes. The parent
//! then resumes with the child's result.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use skein_task::{DelegationRequest, Task, TaskDelegator, TaskExit, TaskOptions};

use crate::ui::Console;

/// Hands out child ids and parks each request until the session opens it
#[derive(Default)]
pub struct ChildLauncher {
    requests: Mutex<HashMap<String, DelegationRequest>>,
}

impl ChildLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self, child_task_id: &str) -> Option<DelegationRequest> {
        self.requests.lock().remove(child_task_id)
    }
}

#[async_trait]
impl TaskDelegator for ChildLauncher {
    async fn delegate_parent_and_open_child(&self, request: DelegationRequest) -> skein_task::Result<String> {
        let child_task_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(
            parent_task_id = %request.parent_task_id,
            child_task_id = %child_task_id,
            "reserved child task"
        );
        self.requests.lock().insert(child_task_id.clone(), request);
        Ok(child_task_id)
    }
}

/// How a task should be entered
pub enum Step {
    Start { text: String, images: Vec<String> },
    Resume,
    Message(String),
    AfterChild { child_task_id: String, result: String },
}

pub struct Session {
    console: Console,
    launcher: Arc<ChildLauncher>,
}

impl Session {
    pub fn new(console: Console, launcher: Arc<ChildLauncher>) -> Self {
        Self { console, launcher }
    }

    /// Drive `task` until it completes, is aborted, or the operator stops
    /// giving it instructions. Returns the completion result, if any.
    pub fn run<'a>(&'a mut self, task: &'a mut Task, first: Step) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
        Box::pin(async move {
            let handle = task.handle();
            let mut step = first;
            loop {
                let exit = {
                    let run = async {
                        match step {
                            Step::Start { text, images } => task.start_task(text, images).await,
                            Step::Resume => task.resume_task_from_history().await,
                            Step::Message(text) => task.submit_user_message(text, Vec::new()).await,
                            Step::AfterChild { child_task_id, result } => {
                                task.resume_after_delegation(&child_task_id, &result).await
                            }
                        }
                    };
                    self.console.drive(&handle, run).await?
                };

                step = match exit {
                    TaskExit::Completed { result } => return Ok(Some(result)),
                    TaskExit::Aborted => {
                        println!("[task {} aborted]", task.task_id());
                        return Ok(None);
                    }
                    TaskExit::TurnEnded => match self.console.read_instruction().await {
                        Some(text) => Step::Message(text),
                        None => return Ok(None),
                    },
                    TaskExit::Delegated { child_task_id } => {
                        let options = task.child_options();
                        let result = self.run_child(options, &child_task_id).await?;
                        if task.state().is_aborted() {
                            return Ok(None);
                        }
                        Step::AfterChild {
                            child_task_id,
                            result: result.unwrap_or_else(|| "The subtask ended without a result.".to_string()),
                        }
                    }
                };
            }
        })
    }

    async fn run_child(&mut self, options: TaskOptions, child_task_id: &str) -> anyhow::Result<Option<String>> {
        let request = self
            .launcher
            .take(child_task_id)
            .ok_or_else(|| anyhow::anyhow!("no delegation request recorded for {}", child_task_id))?;

        let mut options = options.with_task_id(child_task_id);
        options.config.mode = request.mode.clone();
        let mut child = Task::new(options);
        println!(
            "[subtask {} #{} in '{}' mode]",
            child.task_id(),
            child.task_number(),
            request.mode
        );

        let text = child_prompt(&request);
        let result = self.run(&mut child, Step::Start { text, images: Vec::new() }).await;
        child.dispose().await;
        result
    }
}

fn child_prompt(request: &DelegationRequest) -> String {
    if request.initial_todos.is_empty() {
        return request.message.clone();
    }
    let todos: Vec<String> = request
        .initial_todos
        .iter()
        .map(|todo| format!("- [ ] {}", todo))
        .collect();
    format!("{}\n\nTodos:\n{}", request.message, todos.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(todos: &[&str]) -> DelegationRequest {
        DelegationRequest {
            parent_task_id: "p".into(),
            message: "Write the docs".into(),
            initial_todos: todos.iter().map(|t| t.to_string()).collect(),
            mode: "docs".into(),
        }
    }

    #[tokio::test]
    async fn test_launcher_parks_requests_by_child_id() {
        let launcher = ChildLauncher::new();
        let child = launcher.delegate_parent_and_open_child(request(&[])).await.unwrap();
        assert_eq!(launcher.take(&child).unwrap().mode, "docs");
        assert!(launcher.take(&child).is_none());
    }

    #[test]
    fn test_child_prompt_lists_todos() {
        assert_eq!(child_prompt(&request(&[])), "Write the docs");
        assert_eq!(
            child_prompt(&request(&["outline", "examples"])),
            "Write the docs\n\nTodos:\n- [ ] outline\n- [ ] examples"
        );
    }
}
