//! Rewinding both transcripts
//!
//! A rewind cuts the UI and API transcripts at matching points. Context
//! reductions recorded in the removed UI range are collected first, and the
//! summaries and truncation markers carrying those ids are removed from the
//! surviving API transcript so nothing keeps hiding entries that are back in
//! play.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::message::{ApiMessage, Say};
use crate::messages::MessageManager;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RewindOutcome {
    pub ui_removed: usize,
    pub api_removed: usize,
    pub removed_condense_ids: Vec<String>,
    pub removed_truncation_ids: Vec<String>,
}

pub struct ConversationRewindManager;

impl ConversationRewindManager {
    /// Rewind to the UI entry with timestamp `ts`. With `remove_target` the
    /// entry itself goes too; otherwise the cut is just after it.
    pub async fn rewind_to_timestamp(
        messages: &mut MessageManager,
        ts: i64,
        remove_target: bool,
    ) -> Result<RewindOutcome> {
        let position = messages
            .find_ui_position(ts)
            .ok_or_else(|| Error::Other(format!("No message with timestamp {ts}")))?;
        let ui_cut = if remove_target { position } else { position + 1 };

        let api_cut = match messages.ui_messages().get(ui_cut) {
            Some(first_removed) => {
                let cutoff = first_removed.ts;
                messages
                    .api_history()
                    .iter()
                    .position(|m| m.ts >= cutoff)
                    .unwrap_or(messages.api_history().len())
            }
            None => messages.api_history().len(),
        };

        Self::apply(messages, ui_cut, api_cut).await
    }

    /// Rewind so the API transcript keeps only request rounds below `index`
    pub async fn rewind_to_conversation_index(messages: &mut MessageManager, index: u64) -> Result<RewindOutcome> {
        let Some(api_cut) = messages
            .api_history()
            .iter()
            .position(|m| m.conversation_index >= index)
        else {
            return Ok(RewindOutcome::default());
        };
        let cutoff_ts = messages.api_history()[api_cut].ts;

        // The request that produced the first removed entry opened with an
        // api_req_started entry just before it.
        let ui = messages.ui_messages();
        let ui_cut = ui
            .iter()
            .rposition(|m| m.say_kind() == Some(Say::ApiReqStarted) && m.ts <= cutoff_ts)
            .filter(|&p| !ui[..p].iter().any(|m| m.ts > cutoff_ts))
            .unwrap_or_else(|| ui.iter().position(|m| m.ts >= cutoff_ts).unwrap_or(ui.len()));

        Self::apply(messages, ui_cut, api_cut).await
    }

    async fn apply(messages: &mut MessageManager, ui_cut: usize, api_cut: usize) -> Result<RewindOutcome> {
        let ui_len = messages.ui_messages().len();
        let api_len = messages.api_history().len();
        let ui_cut = ui_cut.min(ui_len);
        let api_cut = api_cut.min(api_len);

        let mut condense_ids = Vec::new();
        let mut truncation_ids = Vec::new();
        for message in &messages.ui_messages()[ui_cut..] {
            if let Some(condense) = &message.context_condense {
                condense_ids.push(condense.condense_id.clone());
            }
            if let Some(truncation) = &message.context_truncation {
                truncation_ids.push(truncation.truncation_id.clone());
            }
        }

        let kept_api = prune_reduction_artifacts(
            messages.api_history()[..api_cut].to_vec(),
            &condense_ids,
            &truncation_ids,
        );
        let kept_ui = messages.ui_messages()[..ui_cut].to_vec();

        let outcome = RewindOutcome {
            ui_removed: ui_len - kept_ui.len(),
            api_removed: api_len - kept_api.len(),
            removed_condense_ids: condense_ids,
            removed_truncation_ids: truncation_ids,
        };

        messages.overwrite_api_conversation_history(kept_api).await?;
        messages.overwrite_ui_messages(kept_ui).await?;

        tracing::info!(
            task_id = %messages.task_id(),
            ui_removed = outcome.ui_removed,
            api_removed = outcome.api_removed,
            condensations = outcome.removed_condense_ids.len(),
            truncations = outcome.removed_truncation_ids.len(),
            "rewound conversation"
        );
        Ok(outcome)
    }
}

/// Drop summaries and truncation markers with the given ids, then clear any
/// parent tag that no longer points at a live summary or marker.
pub(crate) fn prune_reduction_artifacts(
    history: Vec<ApiMessage>,
    condense_ids: &[String],
    truncation_ids: &[String],
) -> Vec<ApiMessage> {
    let mut kept: Vec<ApiMessage> = history
        .into_iter()
        .filter(|m| {
            let removed_summary = m.is_summary
                && m.condense_id.as_ref().is_some_and(|id| condense_ids.contains(id));
            let removed_marker = m.is_truncation_marker
                && m.truncation_id.as_ref().is_some_and(|id| truncation_ids.contains(id));
            !removed_summary && !removed_marker
        })
        .collect();

    let live_summaries: HashSet<String> = kept
        .iter()
        .filter(|m| m.is_summary)
        .filter_map(|m| m.condense_id.clone())
        .collect();
    let live_markers: HashSet<String> = kept
        .iter()
        .filter(|m| m.is_truncation_marker)
        .filter_map(|m| m.truncation_id.clone())
        .collect();

    for entry in &mut kept {
        if entry.condense_parent.as_ref().is_some_and(|id| !live_summaries.contains(id)) {
            entry.condense_parent = None;
        }
        if entry.truncation_parent.as_ref().is_some_and(|id| !live_markers.contains(id)) {
            entry.truncation_parent = None;
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::effective_history;
    use crate::message::{ContextCondense, UiMessage};
    use crate::retry::RetryPolicy;
    use crate::storage::MemoryTaskStorage;
    use skein_ai::{ContentBlock, Role};
    use std::sync::Arc;

    fn api(role: Role, text: &str, ts: i64, index: u64) -> ApiMessage {
        ApiMessage::new(role, vec![ContentBlock::text(text)], ts, index)
    }

    /// Three rounds; round 1 condensed round 0 away.
    async fn seeded() -> MessageManager {
        let mut messages = MessageManager::new("t1", Arc::new(MemoryTaskStorage::new()), RetryPolicy::default());

        let mut old_user = api(Role::User, "old q", 100, 0);
        old_user.condense_parent = Some("c1".into());
        let mut old_assistant = api(Role::Assistant, "old a", 110, 0);
        old_assistant.condense_parent = Some("c1".into());
        let mut summary = api(Role::User, "summary", 299, 1);
        summary.is_summary = true;
        summary.condense_id = Some("c1".into());
        let history = vec![
            old_user,
            old_assistant,
            summary,
            api(Role::User, "q2", 300, 1),
            api(Role::Assistant, "a2", 310, 1),
            api(Role::User, "q3", 400, 2),
            api(Role::Assistant, "a3", 410, 2),
        ];
        messages.overwrite_api_conversation_history(history).await.unwrap();

        let mut condense = UiMessage::say(301, Say::CondenseContext, None);
        condense.context_condense = Some(ContextCondense {
            condense_id: "c1".into(),
            summary: "summary".into(),
            cost: 0.0,
            prev_context_tokens: 10,
            new_context_tokens: 5,
        });
        let ui = vec![
            UiMessage::say(90, Say::Text, Some("old q".into())),
            UiMessage::say(95, Say::ApiReqStarted, Some("{}".into())),
            UiMessage::say(290, Say::ApiReqStarted, Some("{}".into())),
            condense,
            UiMessage::say(305, Say::Text, Some("a2".into())),
            UiMessage::say(390, Say::ApiReqStarted, Some("{}".into())),
            UiMessage::say(405, Say::Text, Some("a3".into())),
        ];
        messages.overwrite_ui_messages(ui).await.unwrap();
        messages
    }

    #[tokio::test]
    async fn test_rewind_past_condensation_removes_summary() {
        let mut messages = seeded().await;
        let before_api = messages.api_history().len();

        let outcome = ConversationRewindManager::rewind_to_timestamp(&mut messages, 301, true)
            .await
            .unwrap();

        assert_eq!(outcome.removed_condense_ids, vec!["c1".to_string()]);
        assert!(messages.api_history().len() <= before_api);
        assert!(messages.api_history().iter().all(|m| !m.is_summary));
        assert!(messages.api_history().iter().all(|m| m.condense_parent.is_none()));
        assert_eq!(effective_history(messages.api_history()).len(), 3);
        assert_eq!(messages.ui_messages().len(), 3);
    }

    #[tokio::test]
    async fn test_rewind_after_condensation_keeps_summary() {
        let mut messages = seeded().await;
        let outcome = ConversationRewindManager::rewind_to_timestamp(&mut messages, 390, true)
            .await
            .unwrap();

        assert!(outcome.removed_condense_ids.is_empty());
        assert_eq!(outcome.api_removed, 2);
        assert!(messages.api_history().iter().any(|m| m.is_summary));
        assert_eq!(messages.ui_messages().len(), 5);
    }

    #[tokio::test]
    async fn test_rewind_to_index_cuts_at_request_start() {
        let mut messages = seeded().await;
        ConversationRewindManager::rewind_to_conversation_index(&mut messages, 2)
            .await
            .unwrap();
        assert!(messages.api_history().iter().all(|m| m.conversation_index < 2));
        assert_eq!(messages.ui_messages().len(), 5);
        assert!(messages.api_history().iter().any(|m| m.is_summary));

        let outcome = ConversationRewindManager::rewind_to_conversation_index(&mut messages, 1)
            .await
            .unwrap();
        assert_eq!(outcome.removed_condense_ids, vec!["c1".to_string()]);
        assert_eq!(messages.api_history().len(), 2);
        assert!(messages.api_history().iter().all(|m| m.condense_parent.is_none()));
        assert_eq!(messages.ui_messages().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_timestamp_is_an_error() {
        let mut messages = seeded().await;
        assert!(ConversationRewindManager::rewind_to_timestamp(&mut messages, 1, true).await.is_err());
    }
}
