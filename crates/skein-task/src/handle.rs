//! A cloneable handle for driving a task from outside its loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, broadcast};

use crate::events::{EventBus, TaskEvent};
use crate::interaction::AskRegistry;
use crate::message::AskResponse;
use crate::queue::{MessageQueueService, QueueAddResult};
use crate::state::TaskStateManager;

/// Tracks whether a task loop is running and wakes idle waiters
#[derive(Clone, Default)]
pub(crate) struct Activity {
    idle_notify: Arc<Notify>,
    is_running: Arc<AtomicBool>,
}

impl Activity {
    /// Mark the loop running until the guard drops
    pub(crate) fn begin(&self) -> RunGuard {
        self.is_running.store(true, Ordering::Release);
        RunGuard(self.clone())
    }

    pub(crate) fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }
}

pub(crate) struct RunGuard(Activity);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.is_running.store(false, Ordering::Release);
        self.0.idle_notify.notify_waiters();
    }
}

/// A cloneable handle for poking a task while its loop owns it.
///
/// All fields are shared, so cloning is cheap.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) task_id: String,
    pub(crate) state: TaskStateManager,
    pub(crate) asks: AskRegistry,
    pub(crate) queue: MessageQueueService,
    pub(crate) events: EventBus,
    pub(crate) activity: Activity,
    pub(crate) abort_wait: Duration,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Abort the task. Repeated calls are harmless.
    ///
    /// Waits up to the configured abort wait for the loop to settle and
    /// returns whether it did.
    pub async fn abort(&self) -> bool {
        if self.state.abort(false) {
            tracing::info!(task_id = %self.task_id, "task aborted");
            self.asks.clear();
            self.events.emit(TaskEvent::TaskAborted {
                task_id: self.task_id.clone(),
            });
        }
        let settled = self.wait_for_idle_timeout(self.abort_wait).await;
        if !settled {
            tracing::warn!(task_id = %self.task_id, "task loop did not settle after abort");
        }
        settled
    }

    pub fn is_aborted(&self) -> bool {
        self.state.is_aborted()
    }

    /// Answer the ask with timestamp `ts`. Returns false if nothing waits on it.
    pub fn respond(&self, ts: i64, response: AskResponse) -> bool {
        self.asks.respond(ts, response)
    }

    /// Answer the newest pending ask
    pub fn respond_latest(&self, response: AskResponse) -> bool {
        self.asks.respond_latest(response)
    }

    pub fn pending_asks(&self) -> Vec<i64> {
        self.asks.pending_timestamps()
    }

    /// Queue operator input for when the task is ready for it
    pub fn queue_message(&self, text: impl Into<String>, images: Vec<String>) -> QueueAddResult {
        self.queue.add_message(text, images)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Wait until the task loop becomes idle.
    pub async fn wait_for_idle(&self) {
        let notified = self.activity.idle_notify.notified();
        if !self.activity.is_running() {
            return;
        }
        notified.await;
    }

    /// Wait until the task loop becomes idle, with a timeout.
    /// Returns `true` if idle was reached, `false` on timeout.
    pub async fn wait_for_idle_timeout(&self, timeout: Duration) -> bool {
        if !self.activity.is_running() {
            return true;
        }
        tokio::time::timeout(timeout, self.wait_for_idle()).await.is_ok()
    }

    /// Whether the task loop is currently running.
    pub fn is_running(&self) -> bool {
        self.activity.is_running()
    }
}
