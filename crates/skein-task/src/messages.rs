//! The transcript owner
//!
//! [`MessageManager`] holds both transcripts in memory and persists every
//! mutation before returning. It is the only component allowed to mutate
//! them; everyone else reads through its accessors.

use std::sync::Arc;

use skein_ai::{ContentBlock, Role};

use crate::error::Result;
use crate::index::{ConversationIndexStrategy, IndexManager};
use crate::message::{ApiMessage, CheckpointMetadata, ReasoningCapture, UiMessage, now_ms};
use crate::retry::{RetryPolicy, with_retry};
use crate::storage::TaskStorage;

pub struct MessageManager {
    task_id: String,
    storage: Arc<dyn TaskStorage>,
    retry: RetryPolicy,
    index: IndexManager,
    strategy: ConversationIndexStrategy,
    api_history: Vec<ApiMessage>,
    ui_messages: Vec<UiMessage>,
    last_api_ts: i64,
    last_ui_ts: i64,
}

impl MessageManager {
    pub fn new(task_id: impl Into<String>, storage: Arc<dyn TaskStorage>, retry: RetryPolicy) -> Self {
        let task_id = task_id.into();
        Self {
            index: IndexManager::new(task_id.clone(), Arc::clone(&storage)),
            task_id,
            storage,
            retry,
            strategy: ConversationIndexStrategy,
            api_history: Vec::new(),
            ui_messages: Vec::new(),
            last_api_ts: 0,
            last_ui_ts: 0,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn api_history(&self) -> &[ApiMessage] {
        &self.api_history
    }

    pub fn ui_messages(&self) -> &[UiMessage] {
        &self.ui_messages
    }

    pub fn last_ui_message(&self) -> Option<&UiMessage> {
        self.ui_messages.last()
    }

    pub fn index(&self) -> &IndexManager {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut IndexManager {
        &mut self.index
    }

    /// Load both transcripts and the checkpoint map from storage
    pub async fn load(&mut self) -> Result<()> {
        self.api_history = self.storage.read_api_messages(&self.task_id).await?;
        self.ui_messages = self.storage.read_ui_messages(&self.task_id).await?;
        self.index.load().await?;
        self.rederive_caches();
        tracing::debug!(
            task_id = %self.task_id,
            api_entries = self.api_history.len(),
            ui_entries = self.ui_messages.len(),
            "loaded transcripts"
        );
        Ok(())
    }

    fn rederive_caches(&mut self) {
        self.last_api_ts = self.api_history.iter().map(|m| m.ts).max().unwrap_or(0);
        self.last_ui_ts = self.ui_messages.iter().map(|m| m.ts).max().unwrap_or(0);
        self.index.sync_with_history(&self.api_history);
    }

    /// A UI timestamp strictly greater than every existing one. Timestamps
    /// are the ask/response correlation key, so they must never collide.
    pub fn next_ui_ts(&mut self) -> i64 {
        let ts = now_ms().max(self.last_ui_ts + 1);
        self.last_ui_ts = ts;
        ts
    }

    fn next_api_ts(&mut self) -> i64 {
        let ts = now_ms().max(self.last_api_ts + 1);
        self.last_api_ts = ts;
        ts
    }

    /// Append an entry to the API transcript and persist it.
    ///
    /// Assistant reasoning is folded into one leading reasoning block.
    /// Returns the conversation index the entry was given.
    pub async fn add_to_api_conversation_history(
        &mut self,
        role: Role,
        content: Vec<ContentBlock>,
        reasoning: Option<ReasoningCapture>,
    ) -> Result<u64> {
        let content = if role == Role::Assistant {
            fold_reasoning(content, reasoning)
        } else {
            content
        };
        let conversation_index = self.strategy.assign(role, &mut self.index);
        let ts = self.next_api_ts();
        self.api_history
            .push(ApiMessage::new(role, content, ts, conversation_index));
        self.save_api_history().await?;
        Ok(conversation_index)
    }

    /// Replace the API transcript wholesale (rewind, restore, context management)
    pub async fn overwrite_api_conversation_history(&mut self, history: Vec<ApiMessage>) -> Result<()> {
        self.api_history = history;
        self.rederive_caches();
        self.save_api_history().await
    }

    /// Mark the newest entry of `request_index` with a checkpoint commit
    pub async fn mark_checkpoint(&mut self, commit: &str, request_index: u64) -> Result<bool> {
        let Some(entry) = self
            .api_history
            .iter_mut()
            .rev()
            .find(|m| m.conversation_index == request_index)
        else {
            return Ok(false);
        };
        entry.checkpoint_metadata = Some(CheckpointMetadata {
            commit: commit.to_string(),
            request_index,
        });
        self.save_api_history().await?;
        Ok(true)
    }

    async fn save_api_history(&self) -> Result<()> {
        let storage = &self.storage;
        let task_id = self.task_id.as_str();
        let history = self.api_history.as_slice();
        with_retry(&self.retry, "save api conversation history", move || {
            storage.save_api_messages(task_id, history)
        })
        .await
    }

    /// Append a UI entry and persist
    pub async fn add_to_ui_messages(&mut self, mut message: UiMessage) -> Result<()> {
        self.last_ui_ts = self.last_ui_ts.max(message.ts);
        message.conversation_history_index = Some(self.api_history.len());
        self.ui_messages.push(message);
        self.save_ui_messages().await
    }

    /// Replace the UI transcript wholesale
    pub async fn overwrite_ui_messages(&mut self, messages: Vec<UiMessage>) -> Result<()> {
        self.ui_messages = messages;
        self.rederive_caches();
        self.save_ui_messages().await
    }

    /// Mutate a UI entry in memory only. Callers persist with
    /// [`save_ui_messages`](Self::save_ui_messages) when the change is final.
    pub fn update_ui_message<F>(&mut self, position: usize, f: F) -> Option<&UiMessage>
    where
        F: FnOnce(&mut UiMessage),
    {
        let message = self.ui_messages.get_mut(position)?;
        f(message);
        Some(message)
    }

    /// Remove the newest UI entry and persist
    pub async fn pop_ui_message(&mut self) -> Result<Option<UiMessage>> {
        let popped = self.ui_messages.pop();
        if popped.is_some() {
            self.save_ui_messages().await?;
        }
        Ok(popped)
    }

    pub fn find_ui_position(&self, ts: i64) -> Option<usize> {
        self.ui_messages.iter().position(|m| m.ts == ts)
    }

    /// Persist the UI transcript as it currently is
    pub async fn save_ui_messages(&self) -> Result<()> {
        let storage = &self.storage;
        let task_id = self.task_id.as_str();
        let messages = self.ui_messages.as_slice();
        with_retry(&self.retry, "save ui messages", move || {
            storage.save_ui_messages(task_id, messages)
        })
        .await
    }
}

/// Collapse reasoning into a single block at the front of assistant content
fn fold_reasoning(content: Vec<ContentBlock>, reasoning: Option<ReasoningCapture>) -> Vec<ContentBlock> {
    let mut text = String::new();
    let mut signature = None;
    let mut rest = Vec::with_capacity(content.len());

    if let Some(capture) = reasoning {
        text.push_str(&capture.text);
        signature = capture.signature;
    }
    for block in content {
        match block {
            ContentBlock::Reasoning { text: t, signature: s } => {
                text.push_str(&t);
                if s.is_some() {
                    signature = s;
                }
            }
            other => rest.push(other),
        }
    }

    if text.is_empty() && signature.is_none() {
        return rest;
    }
    let mut folded = Vec::with_capacity(rest.len() + 1);
    folded.push(ContentBlock::Reasoning { text, signature });
    folded.extend(rest);
    folded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Say;
    use crate::storage::MemoryTaskStorage;

    fn manager() -> (MessageManager, MemoryTaskStorage) {
        let storage = MemoryTaskStorage::new();
        let manager = MessageManager::new(
            "t1",
            Arc::new(storage.clone()),
            RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
            },
        );
        (manager, storage)
    }

    #[tokio::test]
    async fn test_indexes_are_monotonic() {
        let (mut messages, _) = manager();
        for round in 0..3 {
            messages
                .add_to_api_conversation_history(Role::User, vec![ContentBlock::text(format!("q{round}"))], None)
                .await
                .unwrap();
            messages
                .add_to_api_conversation_history(Role::Assistant, vec![ContentBlock::text("a")], None)
                .await
                .unwrap();
        }
        let indexes: Vec<u64> = messages.api_history().iter().map(|m| m.conversation_index).collect();
        assert_eq!(indexes, vec![0, 0, 1, 1, 2, 2]);
        assert!(messages.api_history().windows(2).all(|w| w[0].ts < w[1].ts));
    }

    #[tokio::test]
    async fn test_reasoning_is_folded_into_one_block() {
        let (mut messages, _) = manager();
        messages
            .add_to_api_conversation_history(Role::User, vec![ContentBlock::text("q")], None)
            .await
            .unwrap();
        messages
            .add_to_api_conversation_history(
                Role::Assistant,
                vec![
                    ContentBlock::text("answer"),
                    ContentBlock::Reasoning {
                        text: " more".into(),
                        signature: Some("sig".into()),
                    },
                ],
                Some(ReasoningCapture {
                    text: "thinking".into(),
                    signature: None,
                }),
            )
            .await
            .unwrap();

        let content = &messages.api_history()[1].content;
        assert_eq!(content.len(), 2);
        assert_eq!(
            content[0],
            ContentBlock::Reasoning {
                text: "thinking more".into(),
                signature: Some("sig".into())
            }
        );
        assert_eq!(content[1], ContentBlock::text("answer"));
    }

    #[tokio::test]
    async fn test_every_write_persists() {
        let (mut messages, storage) = manager();
        messages
            .add_to_api_conversation_history(Role::User, vec![ContentBlock::text("q")], None)
            .await
            .unwrap();
        let ts = messages.next_ui_ts();
        messages
            .add_to_ui_messages(UiMessage::say(ts, Say::Text, Some("q".into())))
            .await
            .unwrap();

        assert_eq!(storage.read_api_messages("t1").await.unwrap().len(), 1);
        let ui = storage.read_ui_messages("t1").await.unwrap();
        assert_eq!(ui.len(), 1);
        assert_eq!(ui[0].conversation_history_index, Some(1));
    }

    #[tokio::test]
    async fn test_persistence_retries_then_rethrows() {
        let (mut messages, storage) = manager();
        storage.fail_next_writes(2);
        messages
            .add_to_api_conversation_history(Role::User, vec![ContentBlock::text("q")], None)
            .await
            .unwrap();

        storage.fail_next_writes(3);
        let result = messages
            .add_to_api_conversation_history(Role::User, vec![ContentBlock::text("q2")], None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_overwrite_rederives_caches() {
        let (mut messages, _) = manager();
        let far_future = now_ms() + 1_000_000;
        messages
            .overwrite_ui_messages(vec![UiMessage::say(far_future, Say::Text, None)])
            .await
            .unwrap();
        assert_eq!(messages.next_ui_ts(), far_future + 1);

        messages
            .overwrite_api_conversation_history(vec![ApiMessage::new(
                Role::User,
                vec![ContentBlock::text("x")],
                1,
                7,
            )])
            .await
            .unwrap();
        assert_eq!(messages.index_mut().start_new_api_request(), 8);
    }

    #[tokio::test]
    async fn test_load_restores_state() {
        let (mut messages, storage) = manager();
        messages
            .add_to_api_conversation_history(Role::User, vec![ContentBlock::text("q")], None)
            .await
            .unwrap();

        let mut reloaded = MessageManager::new("t1", Arc::new(storage), RetryPolicy::default());
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.api_history().len(), 1);
        reloaded
            .add_to_api_conversation_history(Role::User, vec![ContentBlock::text("q2")], None)
            .await
            .unwrap();
        assert_eq!(reloaded.api_history()[1].conversation_index, 1);
    }
}
