//! Built-in protocol tools
//!
//! These tools do no work themselves. Each returns a [`ToolEffect`](crate::tool::ToolEffect)
//! that the task loop applies once the round's tool calls have run.

mod attempt_completion;
mod new_task;
mod switch_mode;

use std::sync::Arc;

pub use attempt_completion::AttemptCompletionTool;
pub use new_task::NewTaskTool;
pub use switch_mode::SwitchModeTool;

use crate::tool::BoxedTool;

pub fn builtin() -> Vec<BoxedTool> {
    vec![
        Arc::new(AttemptCompletionTool::new()),
        Arc::new(NewTaskTool::new()),
        Arc::new(SwitchModeTool::new()),
    ]
}
