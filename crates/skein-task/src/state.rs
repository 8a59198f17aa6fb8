//! Task-scoped flags and cancellation
//!
//! [`TaskStateManager`] is cheap to clone; every clone observes the same
//! abort flag and the same task cancellation token. One request may be in
//! flight at a time and gets a child token of the task token, so aborting
//! the task always reaches the transport call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// How tool calls are written in the transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolProtocol {
    /// Provider tool-call blocks
    #[default]
    Native,
    /// XML tags in assistant text
    Xml,
}

struct StateInner {
    mode: Mutex<String>,
    tool_protocol: Mutex<ToolProtocol>,
    abort: AtomicBool,
    abandoned: AtomicBool,
    initialized: AtomicBool,
    consecutive_mistakes: AtomicU32,
    cancel: CancellationToken,
    current_request: Mutex<Option<CancellationToken>>,
}

#[derive(Clone)]
pub struct TaskStateManager {
    inner: Arc<StateInner>,
}

impl TaskStateManager {
    pub fn new(mode: impl Into<String>) -> Self {
        Self::with_token(mode, CancellationToken::new())
    }

    /// State whose abort token is a child of `parent`
    pub fn with_token(mode: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(StateInner {
                mode: Mutex::new(mode.into()),
                tool_protocol: Mutex::new(ToolProtocol::default()),
                abort: AtomicBool::new(false),
                abandoned: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                consecutive_mistakes: AtomicU32::new(0),
                cancel,
                current_request: Mutex::new(None),
            }),
        }
    }

    pub fn mode(&self) -> String {
        self.inner.mode.lock().clone()
    }

    pub fn set_mode(&self, mode: impl Into<String>) {
        *self.inner.mode.lock() = mode.into();
    }

    pub fn tool_protocol(&self) -> ToolProtocol {
        *self.inner.tool_protocol.lock()
    }

    pub fn set_tool_protocol(&self, protocol: ToolProtocol) {
        *self.inner.tool_protocol.lock() = protocol;
    }

    /// Set the abort flag and cancel everything in flight.
    ///
    /// Returns `true` only for the call that actually flipped the flag.
    pub fn abort(&self, abandoned: bool) -> bool {
        if abandoned {
            self.inner.abandoned.store(true, Ordering::Release);
        }
        let first = !self.inner.abort.swap(true, Ordering::AcqRel);
        self.cancel_current_request();
        self.inner.cancel.cancel();
        first
    }

    /// Set by [`abort`](Self::abort) here or by cancelling a parent token
    pub fn is_aborted(&self) -> bool {
        self.inner.abort.load(Ordering::Acquire) || self.inner.cancel.is_cancelled()
    }

    /// Aborted because the task was disposed rather than stopped by the operator
    pub fn is_abandoned(&self) -> bool {
        self.inner.abandoned.load(Ordering::Acquire)
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.inner.initialized.store(initialized, Ordering::Release);
    }

    /// Open the cancellation scope for one request
    pub fn begin_request(&self) -> CancellationToken {
        let token = self.inner.cancel.child_token();
        if let Some(previous) = self.inner.current_request.lock().replace(token.clone()) {
            tracing::warn!("request began while another was in flight; cancelling the older one");
            previous.cancel();
        }
        token
    }

    pub fn end_request(&self) {
        self.inner.current_request.lock().take();
    }

    pub fn has_request_in_flight(&self) -> bool {
        self.inner.current_request.lock().is_some()
    }

    /// Cancel the in-flight request without aborting the task
    pub fn cancel_current_request(&self) {
        if let Some(token) = self.inner.current_request.lock().take() {
            token.cancel();
        }
    }

    pub fn consecutive_mistakes(&self) -> u32 {
        self.inner.consecutive_mistakes.load(Ordering::Acquire)
    }

    pub fn record_mistake(&self) -> u32 {
        self.inner.consecutive_mistakes.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_mistakes(&self) {
        self.inner.consecutive_mistakes.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_is_idempotent() {
        let state = TaskStateManager::new("code");
        assert!(state.abort(false));
        assert!(!state.abort(true));
        assert!(state.is_aborted());
        assert!(state.is_abandoned());
        assert!(state.abort_token().is_cancelled());
    }

    #[test]
    fn test_abort_reaches_request_token() {
        let state = TaskStateManager::new("code");
        let request = state.begin_request();
        assert!(state.has_request_in_flight());
        state.abort(false);
        assert!(request.is_cancelled());
        assert!(!state.has_request_in_flight());
    }

    #[test]
    fn test_cancel_request_leaves_task_alive() {
        let state = TaskStateManager::new("code");
        let request = state.begin_request();
        state.cancel_current_request();
        assert!(request.is_cancelled());
        assert!(!state.is_aborted());
        assert!(!state.begin_request().is_cancelled());
    }

    #[test]
    fn test_clones_share_state() {
        let state = TaskStateManager::new("code");
        let other = state.clone();
        other.set_mode("architect");
        other.record_mistake();
        assert_eq!(state.mode(), "architect");
        assert_eq!(state.consecutive_mistakes(), 1);
        state.reset_mistakes();
        assert_eq!(other.consecutive_mistakes(), 0);
    }
}
