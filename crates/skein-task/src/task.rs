//! The task: one conversation and the managers that run it

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use skein_ai::{ApiHandler, ContentBlock, ToolDefinition};
use tokio_util::sync::CancellationToken;

use crate::api_request::ApiRequestManager;
use crate::checkpoint::{CheckpointManager, CheckpointService};
use crate::config::TaskConfig;
use crate::context::ContextManager;
use crate::error::Result;
use crate::events::{EventBus, TaskEvent};
use crate::handle::{Activity, TaskHandle};
use crate::interaction::{AskRegistry, UserInteractionManager};
use crate::messages::MessageManager;
use crate::metrics::{ApiMetrics, get_api_metrics};
use crate::queue::{MessageQueueManager, MessageQueueService};
use crate::rate_limit::RateLimiter;
use crate::state::{TaskStateManager, ToolProtocol};
use crate::storage::TaskStorage;
use crate::streaming::StreamingManager;
use crate::subtask::{SubtaskManager, TaskDelegator};
use crate::tool::{BoxedTool, ToolRegistry};

/// Something a task holds that must be released on dispose, such as a
/// terminal or browser session
#[async_trait]
pub trait TaskResource: Send + Sync {
    fn name(&self) -> &str;

    async fn release(&mut self) -> Result<()>;
}

/// Everything needed to construct a [`Task`]
#[derive(Clone)]
pub struct TaskOptions {
    pub task_id: Option<String>,
    pub parent_task_id: Option<String>,
    pub root_task_id: Option<String>,
    pub config: TaskConfig,
    pub system_prompt: String,
    pub tool_protocol: ToolProtocol,
    pub api: Arc<dyn ApiHandler>,
    pub storage: Arc<dyn TaskStorage>,
    pub checkpoint_service: Option<Arc<dyn CheckpointService>>,
    pub delegator: Option<Arc<dyn TaskDelegator>>,
    pub rate_limiter: RateLimiter,
    pub tools: ToolRegistry,
    /// Lifetime of the parent task; cancelled when the parent is disposed
    pub parent_cancel: Option<CancellationToken>,
    numbering: Arc<AtomicU32>,
}

impl TaskOptions {
    pub fn new(api: Arc<dyn ApiHandler>, storage: Arc<dyn TaskStorage>) -> Self {
        Self {
            task_id: None,
            parent_task_id: None,
            root_task_id: None,
            config: TaskConfig::default(),
            system_prompt: String::new(),
            tool_protocol: ToolProtocol::default(),
            api,
            storage,
            checkpoint_service: None,
            delegator: None,
            rate_limiter: RateLimiter::global(),
            tools: ToolRegistry::with_builtins(),
            parent_cancel: None,
            numbering: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Reuse an existing id, for resuming from history
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_tool_protocol(mut self, protocol: ToolProtocol) -> Self {
        self.tool_protocol = protocol;
        self
    }

    pub fn with_checkpoints(mut self, service: Arc<dyn CheckpointService>) -> Self {
        self.checkpoint_service = Some(service);
        self
    }

    pub fn with_delegator(mut self, delegator: Arc<dyn TaskDelegator>) -> Self {
        self.delegator = Some(delegator);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool(mut self, tool: BoxedTool) -> Self {
        self.tools.register(tool);
        self
    }
}

/// One conversation with the model.
///
/// The task owns its managers outright. Code outside the loop talks to it
/// through a [`TaskHandle`].
pub struct Task {
    pub(crate) task_id: String,
    pub(crate) root_task_id: String,
    pub(crate) parent_task_id: Option<String>,
    pub(crate) task_number: u32,
    pub(crate) config: TaskConfig,
    pub(crate) system_prompt: String,
    pub(crate) events: EventBus,
    pub(crate) state: TaskStateManager,
    pub(crate) asks: AskRegistry,
    pub(crate) messages: MessageManager,
    pub(crate) streaming: StreamingManager,
    pub(crate) interaction: UserInteractionManager,
    pub(crate) context: ContextManager,
    pub(crate) requests: ApiRequestManager,
    pub(crate) checkpoints: CheckpointManager,
    pub(crate) subtasks: SubtaskManager,
    pub(crate) queue: MessageQueueManager,
    pub(crate) tools: ToolRegistry,
    pub(crate) tool_definitions: Vec<ToolDefinition>,
    pub(crate) tool_names: Vec<String>,
    pub(crate) resources: Vec<Box<dyn TaskResource>>,
    pub(crate) activity: Activity,
    /// Tool results held back while a child task runs
    pub(crate) pending_delegation: Option<PendingDelegation>,
    pub(crate) initial_checkpoint_taken: bool,
    pub(crate) disposed: bool,
    storage: Arc<dyn TaskStorage>,
    checkpoint_service: Option<Arc<dyn CheckpointService>>,
    delegator: Option<Arc<dyn TaskDelegator>>,
    numbering: Arc<AtomicU32>,
    lifetime: CancellationToken,
}

/// The round that opened a child task, waiting for the child's result
#[derive(Debug, Clone)]
pub(crate) struct PendingDelegation {
    pub child_task_id: String,
    pub tool_use_id: String,
    pub tool_name: String,
    /// Tool results of the round; the delegation's own result is replaced
    /// with the child's outcome
    pub results: Vec<ContentBlock>,
    pub position: usize,
}

impl Task {
    pub fn new(options: TaskOptions) -> Self {
        let TaskOptions {
            task_id,
            parent_task_id,
            root_task_id,
            config,
            system_prompt,
            tool_protocol,
            api,
            storage,
            checkpoint_service,
            delegator,
            rate_limiter,
            tools,
            parent_cancel,
            numbering,
        } = options;

        let task_id = task_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let root_task_id = root_task_id.unwrap_or_else(|| task_id.clone());
        let task_number = numbering.fetch_add(1, Ordering::AcqRel);

        let events = EventBus::new();
        // Aborting a turn cancels only the task's own token. Children hang off
        // the lifetime token, so they outlive a parent abort but not its dispose.
        let lifetime = match &parent_cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let state = TaskStateManager::with_token(config.mode.clone(), lifetime.child_token());
        state.set_tool_protocol(tool_protocol);
        let asks = AskRegistry::new();
        let queue_service = MessageQueueService::new(config.queue.max_size, events.clone());
        let interaction = UserInteractionManager::new(
            task_id.clone(),
            events.clone(),
            asks.clone(),
            state.clone(),
            queue_service.clone(),
        );

        tracing::debug!(
            task_id = %task_id,
            root_task_id = %root_task_id,
            parent_task_id = ?parent_task_id,
            task_number,
            "task created"
        );

        Self {
            messages: MessageManager::new(task_id.clone(), Arc::clone(&storage), config.persistence.clone()),
            streaming: StreamingManager::new(events.clone()),
            context: ContextManager::new(config.context.clone()),
            requests: ApiRequestManager::new(api, rate_limiter, config.clone()),
            checkpoints: CheckpointManager::new(
                task_id.clone(),
                checkpoint_service.clone(),
                config.enable_checkpoints,
                config.persistence.clone(),
                events.clone(),
            ),
            subtasks: SubtaskManager::new(task_id.clone(), delegator.clone(), events.clone()),
            queue: MessageQueueManager::new(queue_service, config.queue.clone()),
            tool_definitions: tools.definitions(),
            tool_names: tools.names(),
            tools,
            interaction,
            asks,
            state,
            events,
            resources: Vec::new(),
            activity: Activity::default(),
            pending_delegation: None,
            initial_checkpoint_taken: false,
            disposed: false,
            lifetime,
            task_id,
            root_task_id,
            parent_task_id,
            task_number,
            config,
            system_prompt,
            storage,
            checkpoint_service,
            delegator,
            numbering,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn root_task_id(&self) -> &str {
        &self.root_task_id
    }

    pub fn parent_task_id(&self) -> Option<&str> {
        self.parent_task_id.as_deref()
    }

    /// Ordinal of this task within its root's tree, starting at 1
    pub fn task_number(&self) -> u32 {
        self.task_number
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn mode(&self) -> String {
        self.state.mode()
    }

    pub fn messages(&self) -> &MessageManager {
        &self.messages
    }

    pub fn state(&self) -> &TaskStateManager {
        &self.state
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn subtasks(&self) -> &SubtaskManager {
        &self.subtasks
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn metrics(&self) -> ApiMetrics {
        get_api_metrics(self.messages.ui_messages())
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            task_id: self.task_id.clone(),
            state: self.state.clone(),
            asks: self.asks.clone(),
            queue: self.queue.service().clone(),
            events: self.events.clone(),
            activity: self.activity.clone(),
            abort_wait: self.config.abort_wait(),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Register something to release on dispose
    pub fn add_resource(&mut self, resource: Box<dyn TaskResource>) {
        self.resources.push(resource);
    }

    /// Options for a child of this task. The child shares the provider,
    /// storage, collaborators and rate limiter, and its abort token is a
    /// child of this task's token.
    pub fn child_options(&self) -> TaskOptions {
        TaskOptions {
            task_id: None,
            parent_task_id: Some(self.task_id.clone()),
            root_task_id: Some(self.root_task_id.clone()),
            config: self.config.clone(),
            system_prompt: self.system_prompt.clone(),
            tool_protocol: self.state.tool_protocol(),
            api: Arc::clone(self.requests.api()),
            storage: Arc::clone(&self.storage),
            checkpoint_service: self.checkpoint_service.clone(),
            delegator: self.delegator.clone(),
            rate_limiter: self.requests.limiter().clone(),
            tools: self.tools.clone(),
            parent_cancel: Some(self.lifetime.clone()),
            numbering: Arc::clone(&self.numbering),
        }
    }

    /// Release everything the task owns. Safe to call more than once; a
    /// failing step is logged and the rest still run.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        tracing::debug!(task_id = %self.task_id, "disposing task");

        self.state.abort(true);
        self.lifetime.cancel();
        self.asks.clear();
        self.queue.service().dispose();
        if self.streaming.is_streaming() {
            self.streaming.reset_streaming_state();
        }

        for resource in &mut self.resources {
            if let Err(e) = resource.release().await {
                tracing::warn!(
                    task_id = %self.task_id,
                    resource = %resource.name(),
                    error = %e,
                    "failed to release task resource"
                );
            }
        }
        self.resources.clear();

        self.messages.index_mut().flush().await;

        self.events.emit(TaskEvent::TaskDisposed {
            task_id: self.task_id.clone(),
        });
        self.events.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::MemoryTaskStorage;
    use crate::testing::ScriptedApi;
    use parking_lot::Mutex;

    struct Terminal {
        name: &'static str,
        fail: bool,
        released: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl TaskResource for Terminal {
        fn name(&self) -> &str {
            self.name
        }

        async fn release(&mut self) -> Result<()> {
            self.released.lock().push(self.name);
            if self.fail {
                return Err(Error::Other("terminal already gone".into()));
            }
            Ok(())
        }
    }

    fn options() -> TaskOptions {
        TaskOptions::new(Arc::new(ScriptedApi::new(Vec::new())), Arc::new(MemoryTaskStorage::new()))
            .with_rate_limiter(RateLimiter::new())
    }

    #[tokio::test]
    async fn test_dispose_twice_releases_everything_once() {
        let released = Arc::new(Mutex::new(Vec::new()));
        let mut task = Task::new(options());
        for (name, fail) in [("first", true), ("second", false)] {
            task.add_resource(Box::new(Terminal {
                name,
                fail,
                released: Arc::clone(&released),
            }));
        }
        let mut rx = task.subscribe();

        task.dispose().await;
        task.dispose().await;

        assert!(task.is_disposed());
        assert!(task.state().is_aborted());
        assert_eq!(*released.lock(), vec!["first", "second"]);
        assert!(matches!(rx.recv().await.unwrap(), TaskEvent::TaskDisposed { .. }));
        assert!(!task.handle().queue_message("late", Vec::new()).success);
    }

    #[tokio::test]
    async fn test_child_options_share_tree() {
        let parent = Task::new(options().with_system_prompt("be brief"));
        let child = Task::new(parent.child_options());
        let grandchild = Task::new(child.child_options());

        assert_eq!(child.parent_task_id(), Some(parent.task_id()));
        assert_eq!(grandchild.root_task_id(), parent.task_id());
        assert_eq!(parent.task_number(), 1);
        assert_eq!(child.task_number(), 2);
        assert_eq!(grandchild.task_number(), 3);

    }

    #[tokio::test]
    async fn test_child_outlives_parent_abort_but_not_dispose() {
        let mut parent = Task::new(options());
        let child = Task::new(parent.child_options());
        let grandchild = Task::new(child.child_options());

        parent.state().abort(false);
        assert!(parent.state().is_aborted());
        assert!(!child.state().is_aborted());
        assert!(!grandchild.state().is_aborted());

        parent.dispose().await;
        assert!(child.state().is_aborted());
        assert!(grandchild.state().is_aborted());
        assert!(!child.state().is_abandoned());
    }
}
