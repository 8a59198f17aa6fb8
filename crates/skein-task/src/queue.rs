//! Operator input queued while a request is in flight
//!
//! [`MessageQueueService`] is a bounded FIFO that rejects instead of
//! blocking once full. [`MessageQueueManager`] drains it into the task when
//! no request is running; delivery is best-effort.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::events::{EventBus, TaskEvent};
use crate::message::now_ms;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub ts: i64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueAddResult {
    pub success: bool,
    pub message: Option<QueuedMessage>,
}

#[derive(Clone)]
pub struct MessageQueueService {
    messages: Arc<Mutex<VecDeque<QueuedMessage>>>,
    max_size: usize,
    disposed: Arc<AtomicBool>,
    events: EventBus,
}

impl MessageQueueService {
    pub fn new(max_size: usize, events: EventBus) -> Self {
        Self {
            messages: Arc::new(Mutex::new(VecDeque::new())),
            max_size,
            disposed: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    /// Queue operator input. Fails without blocking once the queue is full.
    pub fn add_message(&self, text: impl Into<String>, images: Vec<String>) -> QueueAddResult {
        let text = text.into();
        if self.disposed.load(Ordering::Acquire) {
            return QueueAddResult {
                success: false,
                message: None,
            };
        }
        if text.trim().is_empty() && images.is_empty() {
            return QueueAddResult {
                success: false,
                message: None,
            };
        }

        let message = QueuedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            ts: now_ms(),
            text,
            images,
        };
        let len = {
            let mut messages = self.messages.lock();
            if messages.len() >= self.max_size {
                tracing::warn!(max_size = self.max_size, "message queue full; rejecting message");
                return QueueAddResult {
                    success: false,
                    message: None,
                };
            }
            messages.push_back(message.clone());
            messages.len()
        };
        self.events.emit(TaskEvent::QueueChanged { len });
        QueueAddResult {
            success: true,
            message: Some(message),
        }
    }

    pub fn remove_message(&self, id: &str) -> bool {
        let len = {
            let mut messages = self.messages.lock();
            let Some(position) = messages.iter().position(|m| m.id == id) else {
                return false;
            };
            messages.remove(position);
            messages.len()
        };
        self.events.emit(TaskEvent::QueueChanged { len });
        true
    }

    pub fn update_message(&self, id: &str, text: impl Into<String>, images: Vec<String>) -> bool {
        let mut messages = self.messages.lock();
        let Some(message) = messages.iter_mut().find(|m| m.id == id) else {
            return false;
        };
        message.text = text.into();
        message.images = images;
        true
    }

    pub fn dequeue_message(&self) -> Option<QueuedMessage> {
        let (message, len) = {
            let mut messages = self.messages.lock();
            let message = messages.pop_front()?;
            (message, messages.len())
        };
        self.events.emit(TaskEvent::QueueChanged { len });
        Some(message)
    }

    pub fn messages(&self) -> Vec<QueuedMessage> {
        self.messages.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
        self.events.emit(TaskEvent::QueueChanged { len: 0 });
    }

    /// Drop everything and refuse further input
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.messages.lock().clear();
    }
}

/// Receives drained queue messages
#[async_trait]
pub trait QueueSubmitter: Send {
    async fn submit(&mut self, message: &QueuedMessage) -> Result<()>;
}

#[derive(Clone)]
pub struct MessageQueueManager {
    service: MessageQueueService,
    processing: Arc<AtomicBool>,
    config: QueueConfig,
}

/// Clears the processing flag however the drain ends
/// Longest wait between submission attempts
const MAX_SUBMIT_RETRY_DELAY_MS: u64 = 30_000;

/// Exponential delay for `attempt`, capped
fn retry_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    2u64.checked_pow(attempt)
        .and_then(|factor| base_ms.checked_mul(factor))
        .map_or(MAX_SUBMIT_RETRY_DELAY_MS, |delay| delay.min(MAX_SUBMIT_RETRY_DELAY_MS))
}

struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl MessageQueueManager {
    pub fn new(service: MessageQueueService, config: QueueConfig) -> Self {
        Self {
            service,
            processing: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    pub fn service(&self) -> &MessageQueueService {
        &self.service
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Drain the queue into `submitter`, retrying each message with
    /// exponential backoff. Returns how many were delivered. A call made
    /// while another drain is running returns 0 immediately.
    pub async fn process_queued_messages(&self, submitter: &mut (dyn QueueSubmitter + Send)) -> usize {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("queue drain already in progress");
            return 0;
        }
        let _guard = ProcessingGuard(&self.processing);

        let mut delivered = 0;
        while let Some(message) = self.service.dequeue_message() {
            let mut attempt = 0;
            loop {
                match submitter.submit(&message).await {
                    Ok(()) => {
                        delivered += 1;
                        break;
                    }
                    Err(e) if attempt + 1 < self.config.max_submit_retries => {
                        let delay = retry_delay_ms(self.config.submit_retry_base_ms, attempt);
                        tracing::warn!(
                            message_id = %message.id,
                            attempt = attempt + 1,
                            error = %e,
                            "queued message submission failed, retrying in {}ms",
                            delay
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        tracing::error!(
                            message_id = %message.id,
                            attempts = attempt + 1,
                            error = %e,
                            "dropping queued message after repeated submission failures"
                        );
                        break;
                    }
                }
            }
        }
        delivered
    }
}
