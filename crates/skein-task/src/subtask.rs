//! Delegation to child tasks and transcript reconciliation on return

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skein_ai::Role;

use crate::error::{Error, Result};
use crate::events::{EventBus, TaskEvent};
use crate::message::{Ask, Say, UiMessage};
use crate::messages::MessageManager;

/// What the parent hands to the task-creation collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRequest {
    pub parent_task_id: String,
    pub message: String,
    #[serde(default)]
    pub initial_todos: Vec<String>,
    pub mode: String,
}

/// Task-creation collaborator
#[async_trait]
pub trait TaskDelegator: Send + Sync {
    /// Create and start a child task, returning its id
    async fn delegate_parent_and_open_child(&self, request: DelegationRequest) -> Result<String>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub ui_removed: usize,
    pub api_removed: usize,
}

pub struct SubtaskManager {
    task_id: String,
    delegator: Option<Arc<dyn TaskDelegator>>,
    events: EventBus,
    children: Vec<String>,
}

impl SubtaskManager {
    pub fn new(task_id: impl Into<String>, delegator: Option<Arc<dyn TaskDelegator>>, events: EventBus) -> Self {
        Self {
            task_id: task_id.into(),
            delegator,
            events,
            children: Vec::new(),
        }
    }

    /// Ids of every child this task has opened, oldest first
    pub fn child_task_ids(&self) -> &[String] {
        &self.children
    }

    pub fn last_child(&self) -> Option<&str> {
        self.children.last().map(String::as_str)
    }

    /// Hand a sub-goal to a new child task.
    ///
    /// The parent is not paused and keeps no waiting state; the caller
    /// decides what to do with its own run.
    pub async fn start_subtask(
        &mut self,
        message: impl Into<String>,
        initial_todos: Vec<String>,
        mode: impl Into<String>,
    ) -> Result<String> {
        let delegator = self
            .delegator
            .clone()
            .ok_or_else(|| Error::Delegation("No task creator is available to open a subtask".into()))?;
        let request = DelegationRequest {
            parent_task_id: self.task_id.clone(),
            message: message.into(),
            initial_todos,
            mode: mode.into(),
        };
        let mode = request.mode.clone();

        let child_task_id = delegator.delegate_parent_and_open_child(request).await?;
        tracing::info!(
            task_id = %self.task_id,
            child_task_id = %child_task_id,
            mode = %mode,
            "delegated to subtask"
        );
        self.children.push(child_task_id.clone());
        self.events.emit(TaskEvent::TaskDelegated {
            parent_task_id: self.task_id.clone(),
            child_task_id: child_task_id.clone(),
        });
        Ok(child_task_id)
    }

    /// Clean up the transcripts before a task picks up again after a
    /// delegation or a restart.
    ///
    /// Trailing reasoning-only turns are dropped from both transcripts, the
    /// newest `api_req_started` is removed if it never recorded a cost or a
    /// cancel reason, and the UI transcript is cut after the last entry that
    /// still expected a response.
    pub async fn reconcile_for_resume(messages: &mut MessageManager) -> Result<ReconcileOutcome> {
        let mut api = messages.api_history().to_vec();
        let api_before = api.len();
        while api
            .last()
            .is_some_and(|m| m.role == Role::Assistant && m.is_reasoning_only())
        {
            api.pop();
        }

        let mut ui = messages.ui_messages().to_vec();
        let ui_before = ui.len();
        while ui.last().is_some_and(|m| m.say_kind() == Some(Say::Reasoning)) {
            ui.pop();
        }
        if let Some(position) = ui.iter().rposition(|m| m.say_kind() == Some(Say::ApiReqStarted)) {
            let terminated = ui[position].api_req_info().is_some_and(|info| info.is_terminated());
            if !terminated {
                ui.remove(position);
            }
        }
        if let Some(position) = last_response_index(&ui) {
            ui.truncate(position + 1);
        }

        let outcome = ReconcileOutcome {
            ui_removed: ui_before - ui.len(),
            api_removed: api_before - api.len(),
        };
        if outcome.api_removed > 0 {
            messages.overwrite_api_conversation_history(api).await?;
        }
        if outcome.ui_removed > 0 {
            messages.overwrite_ui_messages(ui).await?;
        }
        tracing::debug!(
            task_id = %messages.task_id(),
            ui_removed = outcome.ui_removed,
            api_removed = outcome.api_removed,
            "reconciled transcripts for resume"
        );
        Ok(outcome)
    }
}

/// Position of the last entry still waiting for an answer: an ask, or a
/// request that never terminated. Only counts when nothing after it shows the
/// task moved on; answered asks keep their feedback and later rounds.
fn last_response_index(ui: &[UiMessage]) -> Option<usize> {
    let position = ui.iter().rposition(|m| {
        m.ask_kind().is_some_and(|ask| !is_resume_ask(ask))
            || (m.say_kind() == Some(Say::ApiReqStarted)
                && !m.api_req_info().is_some_and(|info| info.is_terminated()))
    })?;
    ui[position + 1..].iter().all(is_stale).then_some(position)
}

fn is_resume_ask(ask: Ask) -> bool {
    matches!(ask, Ask::ResumeTask | Ask::ResumeCompletedTask)
}

/// Entries a resume may discard without losing an answer or a recorded cost
fn is_stale(message: &UiMessage) -> bool {
    if message.is_partial() || message.say_kind() == Some(Say::Reasoning) {
        return true;
    }
    if message.ask_kind().is_some_and(is_resume_ask) {
        return true;
    }
    message.say_kind() == Some(Say::ApiReqStarted) && !message.api_req_info().is_some_and(|info| info.is_terminated())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ApiMessage, ApiReqInfo};
    use crate::retry::RetryPolicy;
    use crate::storage::MemoryTaskStorage;
    use parking_lot::Mutex;
    use skein_ai::ContentBlock;

    #[derive(Default)]
    struct RecordingDelegator {
        requests: Mutex<Vec<DelegationRequest>>,
    }

    #[async_trait]
    impl TaskDelegator for RecordingDelegator {
        async fn delegate_parent_and_open_child(&self, request: DelegationRequest) -> Result<String> {
            let mut requests = self.requests.lock();
            requests.push(request);
            Ok(format!("child-{}", requests.len()))
        }
    }

    #[tokio::test]
    async fn test_start_subtask_emits_delegation() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let delegator = Arc::new(RecordingDelegator::default());
        let mut subtasks = SubtaskManager::new("parent", Some(delegator.clone()), events);

        let child = subtasks
            .start_subtask("Write the docs", vec!["outline".into()], "docs")
            .await
            .unwrap();
        assert_eq!(child, "child-1");
        assert_eq!(subtasks.last_child(), Some("child-1"));

        let request = delegator.requests.lock()[0].clone();
        assert_eq!(request.parent_task_id, "parent");
        assert_eq!(request.initial_todos, vec!["outline"]);

        match rx.recv().await.unwrap() {
            TaskEvent::TaskDelegated {
                parent_task_id,
                child_task_id,
            } => {
                assert_eq!(parent_task_id, "parent");
                assert_eq!(child_task_id, "child-1");
            }
            other => panic!("expected TaskDelegated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_subtask_without_delegator() {
        let mut subtasks = SubtaskManager::new("parent", None, EventBus::new());
        let err = subtasks.start_subtask("x", Vec::new(), "code").await.unwrap_err();
        assert!(matches!(err, Error::Delegation(_)));
    }

    fn started(ts: i64, cost: Option<f64>) -> UiMessage {
        let info = ApiReqInfo {
            cost,
            ..Default::default()
        };
        UiMessage::say(ts, Say::ApiReqStarted, Some(info.to_text()))
    }

    #[tokio::test]
    async fn test_reconcile_drops_stale_tail() {
        let mut messages = MessageManager::new("t1", Arc::new(MemoryTaskStorage::new()), RetryPolicy::default());
        messages
            .overwrite_api_conversation_history(vec![
                ApiMessage::new(Role::User, vec![ContentBlock::text("q")], 1, 0),
                ApiMessage::new(Role::Assistant, vec![ContentBlock::text("a")], 2, 0),
                ApiMessage::new(
                    Role::Assistant,
                    vec![ContentBlock::Reasoning {
                        text: "thinking".into(),
                        signature: None,
                    }],
                    3,
                    1,
                ),
            ])
            .await
            .unwrap();
        messages
            .overwrite_ui_messages(vec![
                UiMessage::say(10, Say::Text, Some("task".into())),
                started(11, Some(0.01)),
                UiMessage::ask(12, Ask::Followup, Some("Which file?".into())),
                UiMessage::say(13, Say::UserFeedback, Some("main.rs".into())),
                started(14, None),
                UiMessage::say(15, Say::Reasoning, Some("hmm".into())),
            ])
            .await
            .unwrap();

        let outcome = SubtaskManager::reconcile_for_resume(&mut messages).await.unwrap();
        assert_eq!(outcome.api_removed, 1);
        // reasoning tail and the unterminated request; the answered ask stays
        assert_eq!(outcome.ui_removed, 2);
        let kept: Vec<i64> = messages.ui_messages().iter().map(|m| m.ts).collect();
        assert_eq!(kept, vec![10, 11, 12, 13]);
        assert_eq!(messages.api_history().len(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_history_after_answered_asks() {
        let mut messages = MessageManager::new("t1", Arc::new(MemoryTaskStorage::new()), RetryPolicy::default());
        messages
            .overwrite_ui_messages(vec![
                UiMessage::say(10, Say::Text, Some("task".into())),
                started(11, Some(0.01)),
                UiMessage::ask(12, Ask::CompletionResult, Some("done".into())),
                UiMessage::say(13, Say::UserFeedback, Some("add a title".into())),
                started(14, Some(0.02)),
                UiMessage::say(15, Say::Tool, Some("{\"tool\":\"new_task\"}".into())),
            ])
            .await
            .unwrap();

        let outcome = SubtaskManager::reconcile_for_resume(&mut messages).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::default());
        assert_eq!(messages.ui_messages().len(), 6);
    }

    #[tokio::test]
    async fn test_reconcile_cuts_after_unanswered_ask() {
        let mut messages = MessageManager::new("t1", Arc::new(MemoryTaskStorage::new()), RetryPolicy::default());
        let mut partial = UiMessage::say(14, Say::Text, Some("half".into()));
        partial.partial = Some(true);
        messages
            .overwrite_ui_messages(vec![
                UiMessage::say(10, Say::Text, Some("task".into())),
                started(11, Some(0.01)),
                UiMessage::ask(12, Ask::Followup, Some("Which file?".into())),
                UiMessage::ask(13, Ask::ResumeTask, None),
                partial,
            ])
            .await
            .unwrap();

        let outcome = SubtaskManager::reconcile_for_resume(&mut messages).await.unwrap();
        assert_eq!(outcome.ui_removed, 2);
        assert_eq!(messages.ui_messages().last().unwrap().ask_kind(), Some(Ask::Followup));
    }

    #[tokio::test]
    async fn test_reconcile_keeps_terminated_requests() {
        let mut messages = MessageManager::new("t1", Arc::new(MemoryTaskStorage::new()), RetryPolicy::default());
        messages
            .overwrite_ui_messages(vec![
                UiMessage::say(10, Say::Text, Some("task".into())),
                started(11, Some(0.01)),
                UiMessage::say(12, Say::Text, Some("done".into())),
            ])
            .await
            .unwrap();
        let outcome = SubtaskManager::reconcile_for_resume(&mut messages).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::default());
        assert_eq!(messages.ui_messages().len(), 3);
    }
}
