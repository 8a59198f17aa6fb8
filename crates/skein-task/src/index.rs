//! Conversation indexing
//!
//! Every API transcript entry carries a conversation index naming the
//! request round it belongs to. [`IndexManager`] owns the counter, the
//! in-flight request index and the checkpoint-to-index map;
//! [`ConversationIndexStrategy`] decides which index a new entry gets.

use std::sync::Arc;

use parking_lot::Mutex;
use skein_ai::Role;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::message::ApiMessage;
use crate::storage::{CheckpointIndexMap, TaskStorage};

pub struct IndexManager {
    task_id: String,
    storage: Arc<dyn TaskStorage>,
    next_index: u64,
    current_request_index: Option<u64>,
    checkpoints: Arc<Mutex<CheckpointIndexMap>>,
    pending_persist: Option<JoinHandle<()>>,
}

impl IndexManager {
    pub fn new(task_id: impl Into<String>, storage: Arc<dyn TaskStorage>) -> Self {
        Self {
            task_id: task_id.into(),
            storage,
            next_index: 0,
            current_request_index: None,
            checkpoints: Arc::new(Mutex::new(CheckpointIndexMap::new())),
            pending_persist: None,
        }
    }

    /// Allocate a fresh request index and make it current
    pub fn start_new_api_request(&mut self) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        self.current_request_index = Some(index);
        index
    }

    pub fn current_request_index(&self) -> Option<u64> {
        self.current_request_index
    }

    pub fn end_current_api_request(&mut self) {
        self.current_request_index = None;
    }

    /// The value the next allocation will return
    pub fn peek_next_index(&self) -> u64 {
        self.next_index
    }

    /// Re-derive the counter from a loaded or rewritten transcript so new
    /// entries never reuse an index already present.
    pub fn sync_with_history(&mut self, history: &[ApiMessage]) {
        let next = history
            .iter()
            .map(|m| m.conversation_index + 1)
            .max()
            .unwrap_or(0);
        self.next_index = self.next_index.max(next);
        if let Some(current) = self.current_request_index {
            if current >= self.next_index {
                self.current_request_index = None;
            }
        }
    }

    /// Load the persisted checkpoint map
    pub async fn load(&mut self) -> Result<()> {
        let map = self.storage.read_checkpoint_index(&self.task_id).await?;
        *self.checkpoints.lock() = map;
        Ok(())
    }

    /// Record that `commit` was taken at `request_index`.
    ///
    /// Persistence runs in the background; writes are chained so a slow
    /// earlier write never lands after a newer snapshot. Failures are logged.
    pub fn associate_checkpoint(&mut self, commit: impl Into<String>, request_index: u64) {
        let commit = commit.into();
        let snapshot = {
            let mut map = self.checkpoints.lock();
            map.insert(commit.clone(), request_index);
            map.clone()
        };

        let previous = self.pending_persist.take();
        let storage = Arc::clone(&self.storage);
        let task_id = self.task_id.clone();
        self.pending_persist = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if let Err(e) = storage.save_checkpoint_index(&task_id, &snapshot).await {
                tracing::warn!(
                    task_id = %task_id,
                    commit = %commit,
                    error = %e,
                    "failed to persist checkpoint index; restore for this checkpoint will skip context"
                );
            }
        }));
    }

    pub fn request_index_for(&self, commit: &str) -> Option<u64> {
        self.checkpoints.lock().get(commit).copied()
    }

    /// Wait for background checkpoint-map writes to finish
    pub async fn flush(&mut self) {
        if let Some(pending) = self.pending_persist.take() {
            if let Err(e) = pending.await {
                tracing::warn!(task_id = %self.task_id, error = %e, "checkpoint index write task failed");
            }
        }
    }
}

/// Assigns conversation indexes to new transcript entries
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationIndexStrategy;

impl ConversationIndexStrategy {
    /// User entries open a new request round; assistant entries belong to
    /// the round that produced them.
    pub fn assign(&self, role: Role, index: &mut IndexManager) -> u64 {
        match role {
            Role::User => index.start_new_api_request(),
            Role::Assistant | Role::System => match index.current_request_index() {
                Some(current) => current,
                None => {
                    let allocated = index.start_new_api_request();
                    tracing::warn!(
                        task_id = %index.task_id,
                        role = role.as_str(),
                        allocated,
                        "entry arrived with no request in flight; allocated a new index"
                    );
                    allocated
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryTaskStorage;
    use skein_ai::ContentBlock;

    fn manager() -> (IndexManager, MemoryTaskStorage) {
        let storage = MemoryTaskStorage::new();
        (IndexManager::new("t1", Arc::new(storage.clone())), storage)
    }

    #[tokio::test]
    async fn test_user_gets_fresh_assistant_inherits() {
        let (mut index, _) = manager();
        let strategy = ConversationIndexStrategy;

        let u0 = strategy.assign(Role::User, &mut index);
        let a0 = strategy.assign(Role::Assistant, &mut index);
        let u1 = strategy.assign(Role::User, &mut index);
        let a1 = strategy.assign(Role::Assistant, &mut index);

        assert_eq!((u0, a0, u1, a1), (0, 0, 1, 1));
        assert_eq!(index.current_request_index(), Some(1));
    }

    #[tokio::test]
    async fn test_assistant_without_request_allocates() {
        let (mut index, _) = manager();
        let strategy = ConversationIndexStrategy;
        strategy.assign(Role::User, &mut index);
        index.end_current_api_request();

        let anomalous = strategy.assign(Role::Assistant, &mut index);
        assert_eq!(anomalous, 1);
        assert_eq!(index.current_request_index(), Some(1));
    }

    #[tokio::test]
    async fn test_sync_with_history() {
        let (mut index, _) = manager();
        let history = vec![
            ApiMessage::new(Role::User, vec![ContentBlock::text("a")], 1, 3),
            ApiMessage::new(Role::Assistant, vec![ContentBlock::text("b")], 2, 3),
        ];
        index.sync_with_history(&history);
        assert_eq!(index.start_new_api_request(), 4);
    }

    #[tokio::test]
    async fn test_checkpoint_association_persists_in_background() {
        let (mut index, storage) = manager();
        index.associate_checkpoint("c1", 2);
        index.associate_checkpoint("c2", 5);
        assert_eq!(index.request_index_for("c1"), Some(2));

        index.flush().await;
        let persisted = storage.read_checkpoint_index("t1").await.unwrap();
        assert_eq!(persisted.get("c1"), Some(&2));
        assert_eq!(persisted.get("c2"), Some(&5));
    }

    #[tokio::test]
    async fn test_checkpoint_persist_failure_is_not_propagated() {
        let (mut index, storage) = manager();
        storage.fail_next_writes(1);
        index.associate_checkpoint("c1", 0);
        index.flush().await;
        // The live map still has it even though the write failed.
        assert_eq!(index.request_index_for("c1"), Some(0));
        assert!(storage.read_checkpoint_index("t1").await.unwrap().is_empty());
    }
}
