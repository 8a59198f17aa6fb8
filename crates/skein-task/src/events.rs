//! Task event types and the broadcast feed

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use skein_ai::ContentBlock;
use tokio::sync::broadcast;

use crate::message::{Ask, UiMessage};
use crate::metrics::ApiMetrics;

/// Events emitted while a task runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskStarted { task_id: String },

    TaskResumed { task_id: String },

    TaskAborted { task_id: String },

    TaskCompleted { task_id: String, metrics: ApiMetrics },

    /// The parent handed a sub-goal to a child task and keeps running
    TaskDelegated {
        parent_task_id: String,
        child_task_id: String,
    },

    TaskModeSwitched { task_id: String, mode: String },

    /// A blocking ask is waiting for an answer keyed by `ts`
    TaskAskPending { task_id: String, ts: i64, ask: Ask },

    MessageCreated { message: UiMessage },

    /// A UI entry changed in place (partial updates, request info)
    MessageUpdated { message: UiMessage },

    StreamingStateChanged { is_streaming: bool },

    /// Assistant content as parsed so far
    AssistantContentUpdated {
        content: Vec<ContentBlock>,
        partial: bool,
    },

    TokenUsageUpdated { task_id: String, metrics: ApiMetrics },

    /// Progress reported by a running tool
    ToolProgress {
        tool_use_id: String,
        tool_name: String,
        content: String,
    },

    QueueChanged { len: usize },

    CheckpointSaved { commit: String, request_index: u64 },

    TaskDisposed { task_id: String },
}

impl TaskEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEvent::TaskCompleted { .. } | TaskEvent::TaskAborted { .. } | TaskEvent::TaskDisposed { .. }
        )
    }
}

const EVENT_CAPACITY: usize = 256;

/// Cloneable broadcast feed. Closing it drops the sender so every receiver
/// sees the channel end.
#[derive(Clone)]
pub struct EventBus {
    tx: Arc<Mutex<Option<broadcast::Sender<TaskEvent>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub fn emit(&self, event: TaskEvent) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Subscribe to events. After [`close`](Self::close) the receiver is
    /// already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn close(&self) {
        self.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}
