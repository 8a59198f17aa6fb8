//! The task state machine
//!
//! ```text
//! start ──> say task ──> loop { request round ──> tools ──> continue | exit }
//! resume ─> reconcile ─> resume ask ──┘
//! ```
//!
//! A loop run ends with a [`TaskExit`]. Aborts end it with
//! [`TaskExit::Aborted`] rather than an error; any other failure is narrated
//! and returned.

use async_trait::async_trait;
use skein_ai::ContentBlock;

use crate::api_request::{RoundContext, RoundOutput};
use crate::checkpoint::{DiffMode, FileChange, RestoreOutcome};
use crate::error::{Error, Result};
use crate::events::TaskEvent;
use crate::history::detect_tool_protocol;
use crate::interaction::SayOptions;
use crate::message::{Ask, AskResponse, ContextCondense, Say};
use crate::queue::{QueueSubmitter, QueuedMessage};
use crate::rewind::{ConversationRewindManager, RewindOutcome};
use crate::state::{TaskStateManager, ToolProtocol};
use crate::streaming::XML_TOOL_RESULT_PREFIX;
use crate::subtask::SubtaskManager;
use crate::task::{PendingDelegation, Task};
use crate::tool::{ToolEffect, ToolResult};

const RESUME_PROMPT: &str = "[TASK RESUMPTION] This task was interrupted. It may or may not be complete, \
so reassess the task context. The project state may have changed since then. If the last tool use \
was not confirmed, assume it did not finish.";

const RESUME_COMPLETED_PROMPT: &str = "[TASK RESUMPTION] This task was completed earlier and is being \
picked up again. Review the conversation so far before continuing.";

/// How a run of the task loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum TaskExit {
    /// The operator accepted a completion result
    Completed { result: String },
    /// The model answered without calling a tool and no input was queued
    TurnEnded,
    /// A child task was opened. The parent stays usable; continue it with
    /// [`Task::resume_after_delegation`].
    Delegated { child_task_id: String },
    Aborted,
}

enum TurnOutcome {
    Continue(Vec<ContentBlock>),
    Exit(TaskExit),
}

struct ExecutedCall {
    id: String,
    name: String,
    result: ToolResult,
}

/// Collects drained queue messages; refuses them once the task is aborted
struct QueuedInput {
    state: TaskStateManager,
    messages: Vec<QueuedMessage>,
}

#[async_trait]
impl QueueSubmitter for QueuedInput {
    async fn submit(&mut self, message: &QueuedMessage) -> Result<()> {
        if self.state.is_aborted() {
            return Err(Error::Aborted);
        }
        self.messages.push(message.clone());
        Ok(())
    }
}

/// Image strings are data URLs or bare base64 PNG data
fn image_blocks(images: &[String]) -> Vec<ContentBlock> {
    images
        .iter()
        .map(|image| {
            let parsed = image
                .strip_prefix("data:")
                .and_then(|rest| rest.split_once(";base64,"));
            match parsed {
                Some((mime, data)) => ContentBlock::image(data, mime),
                None => ContentBlock::image(image.as_str(), "image/png"),
            }
        })
        .collect()
}

fn result_block(protocol: ToolProtocol, id: &str, name: &str, result: &ToolResult) -> ContentBlock {
    let text = result.text_content();
    match protocol {
        ToolProtocol::Native => ContentBlock::tool_result(id, text, result.is_error),
        ToolProtocol::Xml => {
            let status = if result.is_error { "Error" } else { "Result" };
            ContentBlock::text(format!("{}{}] {}:\n{}", XML_TOOL_RESULT_PREFIX, name, status, text))
        }
    }
}

fn result_blocks(protocol: ToolProtocol, executed: &[ExecutedCall]) -> Vec<ContentBlock> {
    executed
        .iter()
        .map(|call| result_block(protocol, &call.id, &call.name, &call.result))
        .collect()
}

fn absorb_abort(result: Result<TaskExit>) -> Result<TaskExit> {
    match result {
        Err(e) if e.is_abort() => Ok(TaskExit::Aborted),
        other => other,
    }
}

impl Task {
    /// Start a new task with the operator's first message
    pub async fn start_task(&mut self, text: impl Into<String>, images: Vec<String>) -> Result<TaskExit> {
        self.ensure_usable()?;
        let text = text.into();
        tracing::info!(task_id = %self.task_id, mode = %self.state.mode(), "starting task");
        self.events.emit(TaskEvent::TaskStarted {
            task_id: self.task_id.clone(),
        });

        let said = self
            .interaction
            .say_with(
                &mut self.messages,
                Say::Text,
                Some(text.clone()),
                SayOptions {
                    images: images.clone(),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = said {
            return absorb_abort(Err(e));
        }
        self.state.set_initialized(true);

        let mut content = vec![ContentBlock::text(format!("<task>\n{}\n</task>", text))];
        content.extend(image_blocks(&images));
        self.initiate_task_loop(content).await
    }

    /// Load a persisted task and continue it after asking the operator
    pub async fn resume_task_from_history(&mut self) -> Result<TaskExit> {
        self.ensure_usable()?;
        absorb_abort(self.resume_from_history_inner().await)
    }

    async fn resume_from_history_inner(&mut self) -> Result<TaskExit> {
        self.messages.load().await?;
        tracing::info!(task_id = %self.task_id, "resuming task from history");
        self.events.emit(TaskEvent::TaskResumed {
            task_id: self.task_id.clone(),
        });

        if let Some(protocol) = detect_tool_protocol(self.messages.api_history()) {
            self.state.set_tool_protocol(protocol);
        }

        // Earlier resume prompts are stale
        let ui = self.messages.ui_messages();
        let keep = ui
            .iter()
            .rposition(|m| !m.ask_kind().is_some_and(|ask| ask.is_resumable()))
            .map_or(0, |p| p + 1);
        if keep < ui.len() {
            let kept = ui[..keep].to_vec();
            self.messages.overwrite_ui_messages(kept).await?;
        }
        let was_completed = self
            .messages
            .last_ui_message()
            .and_then(|m| m.ask_kind())
            == Some(Ask::CompletionResult);

        SubtaskManager::reconcile_for_resume(&mut self.messages).await?;
        self.checkpoints.rebuild_from(&self.messages);
        if !self.checkpoints.commits().is_empty() {
            self.initial_checkpoint_taken = true;
        }
        self.state.set_initialized(true);

        let ask = if was_completed {
            Ask::ResumeCompletedTask
        } else {
            Ask::ResumeTask
        };
        let response = self.interaction.ask(&mut self.messages, ask, None, None).await?;

        let mut prompt = if was_completed {
            RESUME_COMPLETED_PROMPT.to_string()
        } else {
            RESUME_PROMPT.to_string()
        };
        let mut images = Vec::new();
        if let Some(response) = response {
            if let Some(text) = response.feedback() {
                self.narrate_feedback(text, &response.images).await?;
                prompt.push_str(&format!(
                    "\n\nNew instructions for task continuation:\n<user_message>\n{}\n</user_message>",
                    text
                ));
                images = response.images.clone();
            }
        }

        let mut content = vec![ContentBlock::text(prompt)];
        content.extend(image_blocks(&images));
        self.initiate_task_loop(content).await
    }

    /// Continue after the operator replied to an ended turn
    pub async fn submit_user_message(&mut self, text: impl Into<String>, images: Vec<String>) -> Result<TaskExit> {
        self.ensure_usable()?;
        let text = text.into();
        if let Err(e) = self.narrate_feedback(&text, &images).await {
            return absorb_abort(Err(e));
        }
        let mut content = vec![ContentBlock::text(format!("<user_message>\n{}\n</user_message>", text))];
        content.extend(image_blocks(&images));
        self.initiate_task_loop(content).await
    }

    /// Pick up after a child task finished.
    ///
    /// The transcripts are reconciled first, then the child's result is fed
    /// back as the result of the tool call that opened it.
    pub async fn resume_after_delegation(&mut self, child_task_id: &str, result: &str) -> Result<TaskExit> {
        self.ensure_usable()?;
        let pending = self.pending_delegation.take();
        if let Some(pending) = &pending {
            if pending.child_task_id != child_task_id {
                tracing::warn!(
                    task_id = %self.task_id,
                    expected = %pending.child_task_id,
                    child_task_id,
                    "resuming with a different child than the one delegated to"
                );
            }
        }

        SubtaskManager::reconcile_for_resume(&mut self.messages).await?;
        self.events.emit(TaskEvent::TaskResumed {
            task_id: self.task_id.clone(),
        });
        tracing::info!(task_id = %self.task_id, child_task_id, "resuming after delegation");

        if let Err(e) = self
            .interaction
            .say_complete(&mut self.messages, Say::SubtaskResult, Some(result.to_string()))
            .await
        {
            return absorb_abort(Err(e));
        }

        let outcome = format!("Subtask {} completed.\n\nResult:\n{}", child_task_id, result);
        let content = match pending {
            Some(PendingDelegation {
                tool_use_id,
                tool_name,
                mut results,
                position,
                ..
            }) => {
                let block = result_block(
                    self.state.tool_protocol(),
                    &tool_use_id,
                    &tool_name,
                    &ToolResult::text(outcome),
                );
                match results.get_mut(position) {
                    Some(slot) => *slot = block,
                    None => results.push(block),
                }
                results
            }
            None => vec![ContentBlock::text(outcome)],
        };
        self.initiate_task_loop(content).await
    }

    /// Drive request rounds until the task completes, ends its turn,
    /// delegates or is aborted.
    pub async fn initiate_task_loop(&mut self, user_content: Vec<ContentBlock>) -> Result<TaskExit> {
        self.ensure_usable()?;
        let _running = self.activity.begin();
        let mut next = user_content;

        loop {
            if self.state.is_aborted() {
                return Ok(TaskExit::Aborted);
            }
            let outcome = match self.run_turn(next).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_abort() || self.state.is_aborted() => {
                    tracing::info!(task_id = %self.task_id, "task loop stopped by abort");
                    return Ok(TaskExit::Aborted);
                }
                Err(e) => {
                    self.report_failure(&e).await;
                    return Err(e);
                }
            };

            match outcome {
                TurnOutcome::Continue(content) => next = content,
                TurnOutcome::Exit(TaskExit::TurnEnded) => match self.process_queued_messages().await {
                    Ok(Some(content)) => next = content,
                    Ok(None) => return Ok(TaskExit::TurnEnded),
                    Err(e) => return absorb_abort(Err(e)),
                },
                TurnOutcome::Exit(exit) => return Ok(exit),
            }
        }
    }

    /// One request round plus the tool calls it produced
    async fn run_turn(&mut self, user_content: Vec<ContentBlock>) -> Result<TurnOutcome> {
        let output = {
            let mut ctx = RoundContext {
                task_id: &self.task_id,
                system_prompt: &self.system_prompt,
                messages: &mut self.messages,
                streaming: &mut self.streaming,
                interaction: &self.interaction,
                context: &self.context,
                state: &self.state,
                events: &self.events,
                tools: &self.tool_definitions,
                tool_names: &self.tool_names,
            };
            self.requests.run_round(&mut ctx, user_content).await?
        };

        if !self.initial_checkpoint_taken {
            self.initial_checkpoint_taken = true;
            self.checkpoints
                .ensure_round_checkpoint(&mut self.messages, &self.interaction)
                .await?;
        }

        if output.tool_calls().is_empty() {
            return Ok(TurnOutcome::Exit(TaskExit::TurnEnded));
        }
        self.execute_tools(&output).await
    }

    /// Run the round's tool calls in order, then apply their effects.
    ///
    /// Calls after a terminal tool are skipped with an error result. Failed
    /// calls count toward the consecutive-mistake limit.
    async fn execute_tools(&mut self, output: &RoundOutput) -> Result<TurnOutcome> {
        let protocol = self.state.tool_protocol();
        let mut executed: Vec<ExecutedCall> = Vec::new();
        let mut ended_by: Option<String> = None;

        for (id, name, arguments) in output.tool_calls() {
            if self.state.is_aborted() {
                return Err(Error::Aborted);
            }
            if let Some(terminal) = &ended_by {
                let result = ToolResult::error(format!(
                    "Tool '{}' was not executed because '{}' already ended this round.",
                    name, terminal
                ));
                executed.push(ExecutedCall { id, name, result });
                continue;
            }

            if self.tools.modifies_workspace(&name) {
                self.checkpoints
                    .ensure_round_checkpoint(&mut self.messages, &self.interaction)
                    .await?;
            }
            let narration = serde_json::json!({ "tool": name, "id": id, "arguments": arguments });
            self.interaction
                .say_complete(&mut self.messages, Say::Tool, Some(narration.to_string()))
                .await?;

            let cancel = self.state.abort_token().child_token();
            let result = self.tools.execute(&id, &name, arguments, cancel, &self.events).await;
            if result.is_error {
                let mistakes = self.state.record_mistake();
                tracing::debug!(task_id = %self.task_id, tool = %name, mistakes, "tool call failed");
            } else {
                self.state.reset_mistakes();
            }
            if result.effect.as_ref().is_some_and(ToolEffect::is_terminal) {
                ended_by = Some(name.clone());
            }
            executed.push(ExecutedCall { id, name, result });
        }

        let mut extra = Vec::new();
        for position in 0..executed.len() {
            let Some(effect) = executed[position].result.effect.clone() else {
                continue;
            };
            match effect {
                ToolEffect::SwitchMode { mode, reason } => {
                    tracing::info!(task_id = %self.task_id, mode = %mode, reason = ?reason, "switching mode");
                    self.state.set_mode(mode.clone());
                    self.events.emit(TaskEvent::TaskModeSwitched {
                        task_id: self.task_id.clone(),
                        mode,
                    });
                }
                ToolEffect::Completion { result, command } => {
                    match self.present_completion(&result, command.as_deref()).await? {
                        None => return Ok(TurnOutcome::Exit(TaskExit::Completed { result })),
                        Some(feedback) => {
                            executed[position].result = ToolResult::text(format!(
                                "The user has provided feedback on the results. Consider their input to \
                                 continue the task, and then attempt completion again.\n<feedback>\n{}\n</feedback>",
                                feedback.text.as_deref().unwrap_or_default()
                            ));
                            extra.extend(image_blocks(&feedback.images));
                        }
                    }
                }
                ToolEffect::Delegate {
                    message,
                    mode,
                    initial_todos,
                } => match self.subtasks.start_subtask(message, initial_todos, mode).await {
                    Ok(child_task_id) => {
                        self.pending_delegation = Some(PendingDelegation {
                            child_task_id: child_task_id.clone(),
                            tool_use_id: executed[position].id.clone(),
                            tool_name: executed[position].name.clone(),
                            results: result_blocks(protocol, &executed),
                            position,
                        });
                        return Ok(TurnOutcome::Exit(TaskExit::Delegated { child_task_id }));
                    }
                    Err(e) if e.is_abort() => return Err(e),
                    Err(e) => {
                        tracing::warn!(task_id = %self.task_id, error = %e, "delegation failed");
                        self.state.record_mistake();
                        executed[position].result = ToolResult::error(format!("Failed to start subtask: {}", e));
                    }
                },
            }
        }

        let mut content = result_blocks(protocol, &executed);
        content.extend(extra);
        content.extend(self.check_mistake_limit().await?);
        Ok(TurnOutcome::Continue(content))
    }

    /// Show the result and ask for confirmation. Returns the operator's
    /// feedback, or `None` once the result is accepted.
    async fn present_completion(&mut self, result: &str, command: Option<&str>) -> Result<Option<AskResponse>> {
        self.interaction
            .say_complete(&mut self.messages, Say::CompletionResult, Some(result.to_string()))
            .await?;
        if let Some(command) = command {
            self.interaction
                .say_complete(&mut self.messages, Say::Text, Some(format!("Suggested command: `{}`", command)))
                .await?;
        }

        let response = self
            .interaction
            .ask(&mut self.messages, Ask::CompletionResult, None, None)
            .await?;
        match response {
            Some(response) if response.feedback().is_some() => {
                let text = response.feedback().unwrap_or_default().to_string();
                self.narrate_feedback(&text, &response.images).await?;
                Ok(Some(response))
            }
            _ => {
                let metrics = self.metrics();
                tracing::info!(
                    task_id = %self.task_id,
                    cost = metrics.total_cost,
                    tokens_in = metrics.total_tokens_in,
                    tokens_out = metrics.total_tokens_out,
                    "task completed"
                );
                self.events.emit(TaskEvent::TaskCompleted {
                    task_id: self.task_id.clone(),
                    metrics,
                });
                Ok(None)
            }
        }
    }

    /// After too many failed tool calls in a row, ask the operator for help
    async fn check_mistake_limit(&mut self) -> Result<Vec<ContentBlock>> {
        let limit = self.config.consecutive_mistake_limit;
        let mistakes = self.state.consecutive_mistakes();
        if limit == 0 || mistakes < limit {
            return Ok(Vec::new());
        }
        tracing::warn!(task_id = %self.task_id, mistakes, "consecutive mistake limit reached");

        let response = self
            .interaction
            .ask(
                &mut self.messages,
                Ask::MistakeLimitReached,
                Some(format!(
                    "The model has failed {} tool calls in a row. Guidance from you may help it get back on track.",
                    mistakes
                )),
                None,
            )
            .await?;
        self.state.reset_mistakes();

        let Some(response) = response else {
            return Ok(Vec::new());
        };
        let Some(text) = response.feedback() else {
            return Ok(Vec::new());
        };
        self.narrate_feedback(text, &response.images).await?;
        let mut blocks = vec![ContentBlock::text(format!(
            "You seem to be having trouble proceeding. The user has provided the following guidance:\n<feedback>\n{}\n</feedback>",
            text
        ))];
        blocks.extend(image_blocks(&response.images));
        Ok(blocks)
    }

    /// Drain queued operator input into the next user turn
    pub async fn process_queued_messages(&mut self) -> Result<Option<Vec<ContentBlock>>> {
        let mut input = QueuedInput {
            state: self.state.clone(),
            messages: Vec::new(),
        };
        self.queue.process_queued_messages(&mut input).await;
        if input.messages.is_empty() {
            return Ok(None);
        }

        let mut texts = Vec::with_capacity(input.messages.len());
        let mut images = Vec::new();
        for queued in &input.messages {
            self.narrate_feedback(&queued.text, &queued.images).await?;
            texts.push(queued.text.as_str());
            images.extend(queued.images.iter().cloned());
        }
        tracing::debug!(task_id = %self.task_id, count = texts.len(), "submitting queued input");

        let mut content = vec![ContentBlock::text(format!(
            "<user_message>\n{}\n</user_message>",
            texts.join("\n\n")
        ))];
        content.extend(image_blocks(&images));
        Ok(Some(content))
    }

    async fn narrate_feedback(&mut self, text: &str, images: &[String]) -> Result<()> {
        self.interaction
            .say_with(
                &mut self.messages,
                Say::UserFeedback,
                Some(text.to_string()),
                SayOptions {
                    images: images.to_vec(),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn report_failure(&mut self, error: &Error) {
        tracing::error!(task_id = %self.task_id, error = %error, "task turn failed");
        if let Err(e) = self
            .interaction
            .say_complete(&mut self.messages, Say::Error, Some(error.to_string()))
            .await
        {
            tracing::warn!(task_id = %self.task_id, error = %e, "could not narrate failure");
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    /// Summarize older turns now, whatever the context size
    pub async fn condense_context(&mut self) -> Result<ContextCondense> {
        self.ensure_usable()?;
        let request = self.requests.context_request(&self.task_id, &self.system_prompt);
        let cancel = self.state.abort_token();
        self.context
            .condense_context(&mut self.messages, &self.interaction, &request, &cancel)
            .await
    }

    pub async fn checkpoint_save(&mut self) -> Result<Option<String>> {
        self.ensure_usable()?;
        self.checkpoints
            .checkpoint_save(&mut self.messages, &self.interaction)
            .await
    }

    pub async fn checkpoint_restore(&mut self, commit: &str, restore_api_context: bool) -> Result<RestoreOutcome> {
        self.ensure_usable()?;
        self.pending_delegation = None;
        self.checkpoints
            .checkpoint_restore(
                &mut self.messages,
                &self.interaction,
                &self.state,
                commit,
                restore_api_context,
            )
            .await
    }

    pub async fn checkpoint_diff(&self, commit: &str, mode: DiffMode) -> Result<Vec<FileChange>> {
        self.checkpoints.checkpoint_diff(commit, mode).await
    }

    /// Rewind both transcripts to the UI entry with timestamp `ts`
    pub async fn rewind_to_timestamp(&mut self, ts: i64, remove_target: bool) -> Result<RewindOutcome> {
        self.ensure_usable()?;
        self.pending_delegation = None;
        ConversationRewindManager::rewind_to_timestamp(&mut self.messages, ts, remove_target).await
    }
}
