//! Rebuilding task state from a persisted transcript
//!
//! [`ContextRestoreService`] cuts the API transcript back to a checkpoint's
//! request round and re-derives the state that depends on it: the index
//! counter (through [`MessageManager`]) and the tool protocol.

use skein_ai::Role;

use crate::error::{Error, Result};
use crate::history::detect_tool_protocol;
use crate::message::ApiMessage;
use crate::messages::MessageManager;
use crate::rewind::prune_reduction_artifacts;
use crate::state::{TaskStateManager, ToolProtocol};

/// Which entry a restore was anchored on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreAnchor {
    CheckpointMarker,
    Assistant,
    User,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoredContext {
    pub request_index: u64,
    pub anchor: RestoreAnchor,
    /// Timestamp of the last kept API entry
    pub anchor_ts: i64,
    pub api_removed: usize,
    pub protocol: ToolProtocol,
}

pub struct ContextRestoreService;

impl ContextRestoreService {
    /// Find the entry to cut after: the entry carrying the checkpoint marker,
    /// else the newest assistant entry at or before `request_index`, else
    /// the newest user entry at or before it.
    pub fn locate(history: &[ApiMessage], commit: Option<&str>, request_index: u64) -> Option<(usize, RestoreAnchor)> {
        if let Some(commit) = commit {
            let marked = history.iter().rposition(|m| {
                m.checkpoint_metadata
                    .as_ref()
                    .is_some_and(|meta| meta.commit == commit)
            });
            if let Some(position) = marked {
                return Some((position, RestoreAnchor::CheckpointMarker));
            }
        }

        let nearest = |role: Role| {
            history
                .iter()
                .rposition(|m| m.role == role && m.conversation_index <= request_index)
        };
        nearest(Role::Assistant)
            .map(|p| (p, RestoreAnchor::Assistant))
            .or_else(|| nearest(Role::User).map(|p| (p, RestoreAnchor::User)))
    }

    /// Truncate the API transcript at the located entry and re-derive the
    /// tool protocol from what is left.
    pub async fn restore_context(
        messages: &mut MessageManager,
        state: &TaskStateManager,
        commit: Option<&str>,
        request_index: u64,
    ) -> Result<RestoredContext> {
        let history = messages.api_history();
        let (position, anchor) = Self::locate(history, commit, request_index).ok_or_else(|| {
            Error::Checkpoint(format!(
                "No conversation entry at or before request {}",
                request_index
            ))
        })?;

        let anchor_ts = history[position].ts;
        let kept = prune_reduction_artifacts(history[..=position].to_vec(), &[], &[]);
        let api_removed = history.len() - kept.len();

        let protocol = detect_tool_protocol(&kept).unwrap_or_else(|| state.tool_protocol());
        messages.index_mut().end_current_api_request();
        messages.overwrite_api_conversation_history(kept).await?;
        state.set_tool_protocol(protocol);

        tracing::info!(
            task_id = %messages.task_id(),
            request_index,
            ?anchor,
            api_removed,
            ?protocol,
            "restored conversation context"
        );

        Ok(RestoredContext {
            request_index,
            anchor,
            anchor_ts,
            api_removed,
            protocol,
        })
    }
}
