//! The say/ask protocol
//!
//! `say` narrates; `ask` narrates and, for blocking kinds, waits until the
//! operator answers. Answers are correlated by the ask's timestamp through
//! [`AskRegistry`], which a [`TaskHandle`](crate::TaskHandle) can reach
//! while the task itself is busy awaiting.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::events::{EventBus, TaskEvent};
use crate::message::{
    Ask, AskResponse, AskResponseKind, ContextCondense, ContextTruncation, Say, UiMessage, UiMessageKind,
};
use crate::messages::MessageManager;
use crate::queue::MessageQueueService;
use crate::state::TaskStateManager;

/// Pending asks keyed by ask timestamp
#[derive(Clone, Default)]
pub struct AskRegistry {
    pending: Arc<Mutex<HashMap<i64, oneshot::Sender<AskResponse>>>>,
}

impl AskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, ts: i64) -> oneshot::Receiver<AskResponse> {
        let (tx, rx) = oneshot::channel();
        if self.pending.lock().insert(ts, tx).is_some() {
            tracing::warn!(ts, "replaced an ask waiter with the same timestamp");
        }
        rx
    }

    fn forget(&self, ts: i64) {
        self.pending.lock().remove(&ts);
    }

    /// Answer the ask with timestamp `ts`. Returns `false` when nothing is
    /// waiting on it.
    pub fn respond(&self, ts: i64, response: AskResponse) -> bool {
        let Some(tx) = self.pending.lock().remove(&ts) else {
            tracing::trace!(ts, "ask response with no waiter");
            return false;
        };
        tx.send(response).is_ok()
    }

    /// Answer the most recent pending ask
    pub fn respond_latest(&self, response: AskResponse) -> bool {
        let latest = self.pending.lock().keys().max().copied();
        match latest {
            Some(ts) => self.respond(ts, response),
            None => false,
        }
    }

    pub fn pending_timestamps(&self) -> Vec<i64> {
        let mut pending: Vec<i64> = self.pending.lock().keys().copied().collect();
        pending.sort_unstable();
        pending
    }

    /// Drop every waiter; their asks fail as aborted
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

/// Extra fields for a say
#[derive(Debug, Clone, Default)]
pub struct SayOptions {
    pub images: Vec<String>,
    /// `Some(true)` creates or updates a trailing partial entry, `Some(false)`
    /// finalizes it, `None` writes a complete entry
    pub partial: Option<bool>,
    pub context_condense: Option<ContextCondense>,
    pub context_truncation: Option<ContextTruncation>,
    pub checkpoint: Option<Value>,
}

impl SayOptions {
    pub fn partial(partial: bool) -> Self {
        Self {
            partial: Some(partial),
            ..Default::default()
        }
    }
}

pub struct UserInteractionManager {
    task_id: String,
    events: EventBus,
    asks: AskRegistry,
    state: TaskStateManager,
    queue: MessageQueueService,
}

impl UserInteractionManager {
    pub fn new(
        task_id: impl Into<String>,
        events: EventBus,
        asks: AskRegistry,
        state: TaskStateManager,
        queue: MessageQueueService,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            events,
            asks,
            state,
            queue,
        }
    }

    pub fn asks(&self) -> &AskRegistry {
        &self.asks
    }

    /// Narrate a complete entry and return its timestamp
    pub async fn say_complete(&self, messages: &mut MessageManager, say: Say, text: Option<String>) -> Result<i64> {
        self.ensure_not_aborted()?;
        self.create(messages, UiMessageKind::Say { say }, text, SayOptions::default())
            .await
    }

    pub async fn say(
        &self,
        messages: &mut MessageManager,
        say: Say,
        text: Option<String>,
        partial: Option<bool>,
    ) -> Result<Option<i64>> {
        self.say_with(
            messages,
            say,
            text,
            SayOptions {
                partial,
                ..Default::default()
            },
        )
        .await
    }

    /// Narrate with the full set of options.
    ///
    /// Returns the timestamp of the entry written or updated, or `None` when
    /// a finalize found no pending partial entry.
    pub async fn say_with(
        &self,
        messages: &mut MessageManager,
        say: Say,
        text: Option<String>,
        options: SayOptions,
    ) -> Result<Option<i64>> {
        self.ensure_not_aborted()?;
        let kind = UiMessageKind::Say { say };
        match options.partial {
            Some(true) => self.upsert_partial(messages, kind, text, options).await.map(Some),
            Some(false) => self.finalize_partial(messages, kind, text, options).await,
            None => self.create(messages, kind, text, options).await.map(Some),
        }
    }

    /// Ask the operator. Blocking kinds wait for an answer (or abort);
    /// non-blocking kinds and partial updates return `None` at once.
    pub async fn ask(
        &self,
        messages: &mut MessageManager,
        ask: Ask,
        text: Option<String>,
        partial: Option<bool>,
    ) -> Result<Option<AskResponse>> {
        self.ensure_not_aborted()?;
        let kind = UiMessageKind::Ask { ask };
        let options = SayOptions {
            partial,
            ..Default::default()
        };
        let ts = match partial {
            Some(true) => {
                self.upsert_partial(messages, kind, text, options).await?;
                return Ok(None);
            }
            Some(false) => match self.finalize_partial(messages, kind, text.clone(), options).await? {
                Some(ts) => ts,
                None => self.create(messages, kind, text, SayOptions::default()).await?,
            },
            None => self.create(messages, kind, text, options).await?,
        };

        if !ask.is_blocking() {
            return Ok(None);
        }

        if let Some(queued) = self.queue.dequeue_message() {
            tracing::debug!(task_id = %self.task_id, ts, ask = ?ask, "answering ask from queued input");
            let response = match ask {
                Ask::Tool | Ask::Command => AskResponse {
                    kind: AskResponseKind::YesButtonClicked,
                    text: Some(queued.text).filter(|t| !t.is_empty()),
                    images: queued.images,
                },
                _ => AskResponse::message(queued.text, queued.images),
            };
            return Ok(Some(response));
        }

        let rx = self.asks.register(ts);
        self.events.emit(TaskEvent::TaskAskPending {
            task_id: self.task_id.clone(),
            ts,
            ask,
        });
        let abort = self.state.abort_token();
        tokio::select! {
            response = rx => response.map(Some).map_err(|_| Error::Aborted),
            _ = abort.cancelled() => {
                self.asks.forget(ts);
                Err(Error::Aborted)
            }
        }
    }

    /// Apply `f` to the UI entry with timestamp `ts` and announce it. When
    /// `persist` is set the transcript is saved too.
    pub async fn update_message<F>(&self, messages: &mut MessageManager, ts: i64, persist: bool, f: F) -> Result<bool>
    where
        F: FnOnce(&mut UiMessage),
    {
        let Some(position) = messages.find_ui_position(ts) else {
            return Ok(false);
        };
        if let Some(updated) = messages.update_ui_message(position, f) {
            self.events.emit(TaskEvent::MessageUpdated {
                message: updated.clone(),
            });
        }
        if persist {
            messages.save_ui_messages().await?;
        }
        Ok(true)
    }

    /// Remove a trailing partial entry of the given kind, if there is one
    pub async fn discard_partial(&self, messages: &mut MessageManager, say: Say) -> Result<bool> {
        let kind = UiMessageKind::Say { say };
        let is_pending = messages
            .last_ui_message()
            .is_some_and(|last| last.kind == kind && last.is_partial());
        if !is_pending {
            return Ok(false);
        }
        messages.pop_ui_message().await?;
        Ok(true)
    }

    fn ensure_not_aborted(&self) -> Result<()> {
        if self.state.is_aborted() {
            return Err(Error::Aborted);
        }
        Ok(())
    }

    async fn create(
        &self,
        messages: &mut MessageManager,
        kind: UiMessageKind,
        text: Option<String>,
        options: SayOptions,
    ) -> Result<i64> {
        let ts = messages.next_ui_ts();
        let mut message = match kind {
            UiMessageKind::Say { say } => UiMessage::say(ts, say, text),
            UiMessageKind::Ask { ask } => UiMessage::ask(ts, ask, text),
        };
        message.images = options.images;
        message.partial = options.partial.filter(|p| *p);
        message.context_condense = options.context_condense;
        message.context_truncation = options.context_truncation;
        message.checkpoint = options.checkpoint;
        messages.add_to_ui_messages(message).await?;
        if let Some(created) = messages.last_ui_message() {
            self.events.emit(TaskEvent::MessageCreated {
                message: created.clone(),
            });
        }
        Ok(ts)
    }

    async fn upsert_partial(
        &self,
        messages: &mut MessageManager,
        kind: UiMessageKind,
        text: Option<String>,
        options: SayOptions,
    ) -> Result<i64> {
        let trailing = messages
            .last_ui_message()
            .filter(|last| last.kind == kind && last.is_partial())
            .map(|last| last.ts);

        match trailing {
            Some(ts) => {
                let position = messages.ui_messages().len() - 1;
                if let Some(updated) = messages.update_ui_message(position, |m| {
                    m.text = text;
                    m.images = options.images;
                }) {
                    self.events.emit(TaskEvent::MessageUpdated {
                        message: updated.clone(),
                    });
                }
                Ok(ts)
            }
            None => {
                let options = SayOptions {
                    partial: Some(true),
                    ..options
                };
                self.create(messages, kind, text, options).await
            }
        }
    }

    async fn finalize_partial(
        &self,
        messages: &mut MessageManager,
        kind: UiMessageKind,
        text: Option<String>,
        options: SayOptions,
    ) -> Result<Option<i64>> {
        let trailing = messages
            .last_ui_message()
            .filter(|last| last.kind == kind && last.is_partial())
            .map(|last| last.ts);
        let Some(ts) = trailing else {
            tracing::trace!(task_id = %self.task_id, kind = ?kind, "finalize with no pending partial entry");
            return Ok(None);
        };

        let position = messages.ui_messages().len() - 1;
        if let Some(updated) = messages.update_ui_message(position, |m| {
            if text.is_some() {
                m.text = text;
            }
            if !options.images.is_empty() {
                m.images = options.images;
            }
            m.partial = None;
            if options.context_condense.is_some() {
                m.context_condense = options.context_condense;
            }
            if options.context_truncation.is_some() {
                m.context_truncation = options.context_truncation;
            }
            if options.checkpoint.is_some() {
                m.checkpoint = options.checkpoint;
            }
        }) {
            self.events.emit(TaskEvent::MessageUpdated {
                message: updated.clone(),
            });
        }
        messages.save_ui_messages().await?;
        Ok(Some(ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::storage::{MemoryTaskStorage, TaskStorage};
    use std::time::Duration;

    struct Fixture {
        messages: MessageManager,
        interaction: UserInteractionManager,
        state: TaskStateManager,
        queue: MessageQueueService,
        asks: AskRegistry,
        storage: MemoryTaskStorage,
    }

    fn fixture() -> Fixture {
        let storage = MemoryTaskStorage::new();
        let events = EventBus::new();
        let state = TaskStateManager::new("code");
        let queue = MessageQueueService::new(10, events.clone());
        let asks = AskRegistry::new();
        Fixture {
            messages: MessageManager::new("t1", Arc::new(storage.clone()), RetryPolicy::default()),
            interaction: UserInteractionManager::new("t1", events, asks.clone(), state.clone(), queue.clone()),
            state,
            queue,
            asks,
            storage,
        }
    }

    #[tokio::test]
    async fn test_partial_says_collapse_into_one_entry() {
        let mut f = fixture();
        for i in 0..5 {
            f.interaction
                .say(&mut f.messages, Say::Text, Some(format!("chunk {i}")), Some(true))
                .await
                .unwrap();
        }
        f.interaction
            .say(&mut f.messages, Say::Text, Some("final".into()), Some(false))
            .await
            .unwrap();

        let ui = f.messages.ui_messages();
        assert_eq!(ui.len(), 1);
        assert_eq!(ui[0].text.as_deref(), Some("final"));
        assert!(!ui[0].is_partial());

        let persisted = f.storage.read_ui_messages("t1").await.unwrap();
        assert_eq!(persisted[0].text.as_deref(), Some("final"));
    }

    #[tokio::test]
    async fn test_finalize_without_partial_is_noop() {
        let mut f = fixture();
        let result = f
            .interaction
            .say(&mut f.messages, Say::Text, Some("x".into()), Some(false))
            .await
            .unwrap();
        assert_eq!(result, None);
        assert!(f.messages.ui_messages().is_empty());
    }

    #[tokio::test]
    async fn test_partial_of_other_kind_starts_new_entry() {
        let mut f = fixture();
        f.interaction
            .say(&mut f.messages, Say::Reasoning, Some("hmm".into()), Some(true))
            .await
            .unwrap();
        f.interaction
            .say(&mut f.messages, Say::Text, Some("hi".into()), Some(true))
            .await
            .unwrap();
        assert_eq!(f.messages.ui_messages().len(), 2);
    }

    #[tokio::test]
    async fn test_blocking_ask_waits_for_response() {
        let mut f = fixture();
        let asks = f.asks.clone();
        tokio::spawn(async move {
            loop {
                if let Some(&ts) = asks.pending_timestamps().first() {
                    assert!(asks.respond(ts, AskResponse::yes()));
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let response = f
            .interaction
            .ask(&mut f.messages, Ask::Followup, Some("continue?".into()), None)
            .await
            .unwrap();
        assert!(response.unwrap().is_yes());
    }

    #[tokio::test]
    async fn test_non_blocking_ask_returns_immediately() {
        let mut f = fixture();
        let response = f
            .interaction
            .ask(&mut f.messages, Ask::CommandOutput, Some("line".into()), None)
            .await
            .unwrap();
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_queued_message_answers_ask() {
        let mut f = fixture();
        f.queue.add_message("use the other file", Vec::new());
        let response = f
            .interaction
            .ask(&mut f.messages, Ask::Followup, Some("which file?".into()), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.feedback(), Some("use the other file"));
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_abort_releases_waiting_ask() {
        let mut f = fixture();
        let state = f.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            state.abort(false);
        });
        let result = f
            .interaction
            .ask(&mut f.messages, Ask::Followup, None, None)
            .await;
        assert!(matches!(result, Err(Error::Aborted)));
        assert!(f.asks.pending_timestamps().is_empty());
    }

    #[test]
    fn test_response_without_waiter_is_noop() {
        let asks = AskRegistry::new();
        assert!(!asks.respond(42, AskResponse::no()));
        assert!(!asks.respond_latest(AskResponse::no()));
    }
}
