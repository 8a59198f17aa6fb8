//! Workspace checkpoints tied to request rounds
//!
//! A checkpoint pairs a workspace snapshot taken by a [`CheckpointService`]
//! with the request index that was current when it was saved. Restoring
//! reverts the files first and then, when asked, the conversation. A failed
//! or skipped conversation restore never undoes the file restore; the
//! outcome says which parts happened.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::events::{EventBus, TaskEvent};
use crate::interaction::{SayOptions, UserInteractionManager};
use crate::message::{ApiReqInfo, Say, now_ms};
use crate::messages::MessageManager;
use crate::metrics::get_api_metrics;
use crate::restore::{ContextRestoreService, RestoredContext};
use crate::retry::{RetryPolicy, with_retry};
use crate::state::TaskStateManager;

/// A file that differs between two snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub before: String,
    pub after: String,
}

/// Workspace snapshot collaborator
#[async_trait]
pub trait CheckpointService: Send + Sync {
    /// Snapshot the workspace and return the commit identifier
    async fn save_checkpoint(&self, label: &str) -> Result<String>;

    /// Revert the workspace to `commit`
    async fn restore(&self, commit: &str) -> Result<()>;

    /// Changes from `from` to `to`, or to the live workspace when `to` is `None`
    async fn diff(&self, from: &str, to: Option<&str>) -> Result<Vec<FileChange>>;
}

/// What a checkpoint is compared against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffMode {
    /// The checkpoint after it, or the workspace if it is the newest
    Checkpoint,
    /// The live workspace
    ToCurrent,
    /// From the task's first checkpoint up to it
    Full,
}

/// How the conversation side of a restore went
#[derive(Debug, Clone, PartialEq)]
pub enum ContextRestore {
    NotRequested,
    Restored(RestoredContext),
    /// No request index was recorded for the commit
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreOutcome {
    pub commit: String,
    pub files_restored: bool,
    pub context: ContextRestore,
}

impl RestoreOutcome {
    /// Files and conversation now agree
    pub fn is_consistent(&self) -> bool {
        matches!(self.context, ContextRestore::NotRequested | ContextRestore::Restored(_))
    }
}

pub struct CheckpointManager {
    task_id: String,
    service: Option<Arc<dyn CheckpointService>>,
    enabled: bool,
    retry: RetryPolicy,
    events: EventBus,
    commits: Vec<String>,
    last_saved_request: Option<u64>,
}

impl CheckpointManager {
    pub fn new(
        task_id: impl Into<String>,
        service: Option<Arc<dyn CheckpointService>>,
        enabled: bool,
        retry: RetryPolicy,
        events: EventBus,
    ) -> Self {
        let enabled = enabled && service.is_some();
        Self {
            task_id: task_id.into(),
            service,
            enabled,
            retry,
            events,
            commits: Vec::new(),
            last_saved_request: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Commits saved by this task, oldest first
    pub fn commits(&self) -> &[String] {
        &self.commits
    }

    /// Rebuild the commit list and the last saved round from a loaded task.
    ///
    /// Commits come from the `checkpoint_saved` entries in transcript order.
    /// The round of each commit is taken from the persisted index map, then
    /// from the entry's own checkpoint payload.
    pub fn rebuild_from(&mut self, messages: &MessageManager) {
        self.commits.clear();
        self.last_saved_request = None;
        for message in messages.ui_messages() {
            if message.say_kind() != Some(Say::CheckpointSaved) {
                continue;
            }
            let Some(commit) = message.text.clone() else {
                continue;
            };
            let request_index = messages.index().request_index_for(&commit).or_else(|| {
                message
                    .checkpoint
                    .as_ref()
                    .and_then(|c| c.get("request_index"))
                    .and_then(|v| v.as_u64())
            });
            if let Some(request_index) = request_index {
                self.last_saved_request = Some(self.last_saved_request.map_or(request_index, |r| r.max(request_index)));
            }
            if !self.commits.contains(&commit) {
                self.commits.push(commit);
            }
        }
        tracing::debug!(
            task_id = %self.task_id,
            commits = self.commits.len(),
            last_saved_request = ?self.last_saved_request,
            "rebuilt checkpoint bookkeeping"
        );
    }

    fn active_service(&self) -> Option<Arc<dyn CheckpointService>> {
        if self.enabled {
            self.service.clone()
        } else {
            None
        }
    }

    /// The request index a checkpoint taken now belongs to
    fn request_index(messages: &MessageManager) -> u64 {
        messages
            .index()
            .current_request_index()
            .or_else(|| messages.api_history().last().map(|m| m.conversation_index))
            .unwrap_or(0)
    }

    /// Save a checkpoint unless one was already taken for the current round
    pub async fn ensure_round_checkpoint(
        &mut self,
        messages: &mut MessageManager,
        interaction: &UserInteractionManager,
    ) -> Result<Option<String>> {
        if !self.enabled || self.last_saved_request == Some(Self::request_index(messages)) {
            return Ok(None);
        }
        self.checkpoint_save(messages, interaction).await
    }

    /// Snapshot the workspace and associate the commit with the current
    /// request index.
    ///
    /// Failures go through the retry policy; if they persist, checkpoints
    /// are turned off for the rest of the task and `Ok(None)` is returned.
    pub async fn checkpoint_save(
        &mut self,
        messages: &mut MessageManager,
        interaction: &UserInteractionManager,
    ) -> Result<Option<String>> {
        let Some(service) = self.active_service() else {
            return Ok(None);
        };
        let request_index = Self::request_index(messages);
        let label = format!("Task: {}, Time: {}", self.task_id, now_ms());

        let saved = {
            let service = service.as_ref();
            let label = label.as_str();
            with_retry(&self.retry, "save checkpoint", move || service.save_checkpoint(label)).await
        };
        let commit = match saved {
            Ok(commit) => commit,
            Err(e) if e.is_abort() => return Err(e),
            Err(e) => {
                self.disable(messages, interaction, &e).await?;
                return Ok(None);
            }
        };

        messages.index_mut().associate_checkpoint(commit.clone(), request_index);
        messages.mark_checkpoint(&commit, request_index).await?;
        interaction
            .say_with(
                messages,
                Say::CheckpointSaved,
                Some(commit.clone()),
                SayOptions {
                    checkpoint: Some(serde_json::json!({
                        "commit": commit,
                        "request_index": request_index,
                    })),
                    ..Default::default()
                },
            )
            .await?;
        self.events.emit(TaskEvent::CheckpointSaved {
            commit: commit.clone(),
            request_index,
        });

        tracing::debug!(task_id = %self.task_id, commit = %commit, request_index, "checkpoint saved");
        self.commits.push(commit.clone());
        self.last_saved_request = Some(request_index);
        Ok(Some(commit))
    }

    async fn disable(
        &mut self,
        messages: &mut MessageManager,
        interaction: &UserInteractionManager,
        error: &Error,
    ) -> Result<()> {
        self.enabled = false;
        tracing::error!(task_id = %self.task_id, error = %error, "checkpoint save failed; disabling checkpoints");
        interaction
            .say_complete(
                messages,
                Say::Error,
                Some(format!("Checkpoints have been disabled for this task: {}", error)),
            )
            .await?;
        Ok(())
    }

    /// Revert the workspace to `commit` and, with `restore_api_context`,
    /// the conversation to the matching request round.
    pub async fn checkpoint_restore(
        &mut self,
        messages: &mut MessageManager,
        interaction: &UserInteractionManager,
        state: &TaskStateManager,
        commit: &str,
        restore_api_context: bool,
    ) -> Result<RestoreOutcome> {
        let service = self
            .active_service()
            .ok_or_else(|| Error::Checkpoint("Checkpoints are not enabled for this task".into()))?;

        {
            let service = service.as_ref();
            with_retry(&self.retry, "restore checkpoint", move || service.restore(commit)).await?;
        }
        tracing::info!(task_id = %self.task_id, commit = %commit, "workspace restored");

        let context = if !restore_api_context {
            ContextRestore::NotRequested
        } else {
            match messages.index().request_index_for(commit) {
                None => {
                    tracing::warn!(
                        task_id = %self.task_id,
                        commit = %commit,
                        "no request index recorded for checkpoint; conversation left as is"
                    );
                    ContextRestore::Skipped
                }
                Some(request_index) => {
                    match ContextRestoreService::restore_context(messages, state, Some(commit), request_index).await {
                        Ok(restored) => {
                            self.reconcile_ui(messages, interaction, commit, &restored).await?;
                            self.last_saved_request = Some(request_index);
                            ContextRestore::Restored(restored)
                        }
                        Err(e) if e.is_abort() => return Err(e),
                        Err(e) => {
                            tracing::warn!(
                                task_id = %self.task_id,
                                commit = %commit,
                                error = %e,
                                "conversation restore failed after files were restored"
                            );
                            ContextRestore::Failed(e.to_string())
                        }
                    }
                }
            }
        };

        if let Some(position) = self.commits.iter().position(|c| c == commit) {
            self.commits.truncate(position + 1);
        }

        Ok(RestoreOutcome {
            commit: commit.to_string(),
            files_restored: true,
            context,
        })
    }

    /// Cut the UI transcript after the commit's `checkpoint_saved` entry and
    /// record what the removed requests cost.
    async fn reconcile_ui(
        &self,
        messages: &mut MessageManager,
        interaction: &UserInteractionManager,
        commit: &str,
        restored: &RestoredContext,
    ) -> Result<()> {
        let ui = messages.ui_messages();
        let kept_api = messages.api_history().len();
        let cut = ui
            .iter()
            .position(|m| m.say_kind() == Some(Say::CheckpointSaved) && m.text.as_deref() == Some(commit))
            .map(|p| p + 1)
            .or_else(|| {
                ui.iter()
                    .position(|m| m.conversation_history_index.unwrap_or(0) > kept_api)
            })
            .unwrap_or(ui.len());

        let removed = get_api_metrics(&ui[cut..]);
        let kept = ui[..cut].to_vec();
        let removed_count = ui.len() - cut;
        messages.overwrite_ui_messages(kept).await?;

        let removed_anything = removed.total_cost > 0.0 || removed.total_tokens_in > 0 || removed.total_tokens_out > 0;
        if removed_anything {
            let info = ApiReqInfo {
                tokens_in: Some(removed.total_tokens_in),
                tokens_out: Some(removed.total_tokens_out),
                cache_writes: Some(removed.total_cache_writes),
                cache_reads: Some(removed.total_cache_reads),
                cost: Some(removed.total_cost),
                ..Default::default()
            };
            interaction
                .say_complete(messages, Say::ApiReqDeleted, Some(info.to_text()))
                .await?;
        }

        tracing::debug!(
            task_id = %self.task_id,
            ui_removed = removed_count,
            request_index = restored.request_index,
            removed_cost = removed.total_cost,
            "ui transcript reconciled with restored checkpoint"
        );
        Ok(())
    }

    /// Compare `commit` against the next checkpoint, the workspace or the
    /// task's initial checkpoint.
    pub async fn checkpoint_diff(&self, commit: &str, mode: DiffMode) -> Result<Vec<FileChange>> {
        let service = self
            .service
            .clone()
            .ok_or_else(|| Error::Checkpoint("Checkpoints are not enabled for this task".into()))?;

        let (from, to) = match mode {
            DiffMode::ToCurrent => (commit.to_string(), None),
            DiffMode::Checkpoint => {
                let next = self
                    .commits
                    .iter()
                    .position(|c| c == commit)
                    .and_then(|p| self.commits.get(p + 1))
                    .cloned();
                (commit.to_string(), next)
            }
            DiffMode::Full => {
                let initial = self
                    .commits
                    .first()
                    .cloned()
                    .ok_or_else(|| Error::Checkpoint("No initial checkpoint for this task".into()))?;
                (initial, Some(commit.to_string()))
            }
        };

        let service = service.as_ref();
        let (from, to) = (from.as_str(), to.as_deref());
        with_retry(&self.retry, "diff checkpoint", move || service.diff(from, to)).await
    }
}
