//! skein-task: the task engine behind skein
//!
//! A [`Task`] drives one conversation with a model: it records both
//! transcripts, narrates progress to the operator, runs tools, keeps the
//! context inside the model's window, takes workspace checkpoints and hands
//! sub-goals to child tasks. Code outside the loop talks to a running task
//! through a [`TaskHandle`] and observes it through [`TaskEvent`]s.

pub mod api_request;
pub mod checkpoint;
pub mod condense;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod handle;
pub mod history;
pub mod index;
pub mod interaction;
pub mod lifecycle;
pub mod message;
pub mod messages;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod restore;
pub mod retry;
pub mod rewind;
pub mod state;
pub mod storage;
pub mod streaming;
pub mod subtask;
pub mod task;
pub mod tokens;
pub mod tool;
pub mod tools;

#[cfg(test)]
mod testing;

pub use checkpoint::{CheckpointService, ContextRestore, DiffMode, FileChange, RestoreOutcome};
pub use config::{ContextConfig, QueueConfig, TaskConfig};
pub use error::{Error, Result};
pub use events::{EventBus, TaskEvent};
pub use handle::TaskHandle;
pub use lifecycle::TaskExit;
pub use message::{ApiMessage, Ask, AskResponse, ContextCondense, Say, UiMessage};
pub use metrics::ApiMetrics;
pub use queue::{QueueAddResult, QueuedMessage};
pub use rate_limit::RateLimiter;
pub use rewind::RewindOutcome;
pub use state::ToolProtocol;
pub use storage::{FileTaskStorage, MemoryTaskStorage, TaskStorage};
pub use subtask::{DelegationRequest, TaskDelegator};
pub use task::{Task, TaskOptions, TaskResource};
pub use tool::{BoxedTool, ProgressSender, Tool, ToolEffect, ToolRegistry, ToolResult};
