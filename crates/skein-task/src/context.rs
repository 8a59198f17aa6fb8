//! Context-window management
//!
//! Before every request [`ContextManager::manage_context`] checks how full
//! the window is. Condensation is preferred; sliding-window truncation is
//! the fallback when condensation is disabled, fails, or the context is
//! already past the hard limit. Either path leaves a tagged record in the
//! UI transcript so a later rewind can find and undo it.

use skein_ai::{ApiHandler, ContentBlock, Role};
use tokio_util::sync::CancellationToken;

use crate::condense::{SummarizeRequest, summarize_conversation};
use crate::config::ContextConfig;
use crate::error::Result;
use crate::history::{effective_history, effective_positions};
use crate::interaction::{SayOptions, UserInteractionManager};
use crate::message::{ApiMessage, ContextCondense, ContextTruncation, Say};
use crate::messages::MessageManager;
use crate::metrics::get_api_metrics;
use crate::tokens::{context_percent, estimate_context_tokens};

pub const TRUNCATION_NOTICE: &str = "[NOTE] Some previous conversation history with the assistant has been removed to keep the context within limits.";

/// Share of the visible history a regular truncation drops
const DEFAULT_TRUNCATION_FRACTION: f64 = 0.5;

/// Model-facing inputs a reduction needs
#[derive(Clone, Copy)]
pub struct ContextRequest<'a> {
    pub api: &'a dyn ApiHandler,
    pub task_id: &'a str,
    pub system_prompt: &'a str,
    /// Output tokens reserved for the response; the model maximum when unset
    pub max_tokens: Option<u32>,
}

/// What a context check did
#[derive(Debug, Clone, PartialEq)]
pub enum ContextAction {
    None,
    Condensed(ContextCondense),
    Truncated(ContextTruncation),
}

/// Result of a pure sliding-window truncation
#[derive(Debug, Clone)]
pub struct TruncationResult {
    pub history: Vec<ApiMessage>,
    pub truncation_id: String,
    pub messages_removed: usize,
}

pub struct ContextManager {
    config: ContextConfig,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Tokens the next request may use before the response reservation
    pub fn allowed_tokens(&self, request: &ContextRequest<'_>) -> u64 {
        let model = request.api.model();
        let window = u64::from(model.context_window);
        let reserved = u64::from(request.max_tokens.unwrap_or(model.max_tokens));
        let usable = window * u64::from(100 - self.config.token_buffer_percent.min(100)) / 100;
        usable.saturating_sub(reserved)
    }

    /// Context size of the last request, or an estimate when nothing has
    /// been reported yet
    pub fn current_context_tokens(&self, messages: &MessageManager, request: &ContextRequest<'_>) -> u64 {
        let reported = get_api_metrics(messages.ui_messages()).context_tokens;
        if reported > 0 {
            return reported;
        }
        estimate_context_tokens(
            request.api,
            request.system_prompt,
            effective_history(messages.api_history()),
        )
    }

    /// Reduce the context if it is close to the window
    pub async fn manage_context(
        &self,
        messages: &mut MessageManager,
        interaction: &UserInteractionManager,
        request: &ContextRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ContextAction> {
        let prev_tokens = self.current_context_tokens(messages, request);
        let allowed = self.allowed_tokens(request);
        let percent = context_percent(prev_tokens, request.api.model().context_window);
        let threshold = u64::from(self.config.effective_threshold());
        let over_limit = prev_tokens > allowed;

        tracing::debug!(
            task_id = %request.task_id,
            prev_tokens,
            allowed,
            percent,
            threshold,
            "context check"
        );

        if self.config.auto_condense && (percent >= threshold || over_limit) {
            match self.run_condense(messages, interaction, request, prev_tokens, cancel).await {
                Ok(condense) => return Ok(ContextAction::Condensed(condense)),
                Err(e) if e.is_abort() => return Err(e),
                Err(e) => {
                    tracing::warn!(task_id = %request.task_id, error = %e, "condensation failed");
                }
            }
        }

        if over_limit {
            let fraction = DEFAULT_TRUNCATION_FRACTION;
            if let Some(truncation) = self.truncate(messages, interaction, request, fraction, prev_tokens).await? {
                return Ok(ContextAction::Truncated(truncation));
            }
        }
        Ok(ContextAction::None)
    }

    /// Reduce the context after the provider rejected it as too long
    pub async fn force_reduction(
        &self,
        messages: &mut MessageManager,
        interaction: &UserInteractionManager,
        request: &ContextRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ContextAction> {
        let prev_tokens = self.current_context_tokens(messages, request);
        tracing::info!(task_id = %request.task_id, prev_tokens, "forcing context reduction");

        if self.config.auto_condense {
            match self.run_condense(messages, interaction, request, prev_tokens, cancel).await {
                Ok(condense) => return Ok(ContextAction::Condensed(condense)),
                Err(e) if e.is_abort() => return Err(e),
                Err(e) => {
                    tracing::warn!(task_id = %request.task_id, error = %e, "forced condensation failed, truncating");
                }
            }
        }

        let fraction = f64::from(100 - self.config.forced_reduction_percent.min(100)) / 100.0;
        match self.truncate(messages, interaction, request, fraction, prev_tokens).await? {
            Some(truncation) => Ok(ContextAction::Truncated(truncation)),
            None => Ok(ContextAction::None),
        }
    }

    /// Condense now, ignoring the threshold
    pub async fn condense_context(
        &self,
        messages: &mut MessageManager,
        interaction: &UserInteractionManager,
        request: &ContextRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ContextCondense> {
        let prev_tokens = self.current_context_tokens(messages, request);
        self.run_condense(messages, interaction, request, prev_tokens, cancel).await
    }

    async fn run_condense(
        &self,
        messages: &mut MessageManager,
        interaction: &UserInteractionManager,
        request: &ContextRequest<'_>,
        prev_tokens: u64,
        cancel: &CancellationToken,
    ) -> Result<ContextCondense> {
        interaction
            .say(messages, Say::CondenseContext, None, Some(true))
            .await?;

        let summarize = SummarizeRequest {
            api: request.api,
            task_id: request.task_id,
            system_prompt: request.system_prompt,
            custom_prompt: self.config.custom_condense_prompt.as_deref(),
            keep_recent: self.config.keep_recent_messages,
            prev_context_tokens: prev_tokens,
        };
        match summarize_conversation(messages.api_history(), &summarize, cancel).await {
            Ok(outcome) => {
                messages.overwrite_api_conversation_history(outcome.history).await?;
                interaction
                    .say_with(
                        messages,
                        Say::CondenseContext,
                        None,
                        SayOptions {
                            partial: Some(false),
                            context_condense: Some(outcome.condense.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(outcome.condense)
            }
            Err(e) if e.is_abort() => Err(e),
            Err(e) => {
                interaction.discard_partial(messages, Say::CondenseContext).await?;
                interaction
                    .say_complete(messages, Say::CondenseContextError, Some(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    async fn truncate(
        &self,
        messages: &mut MessageManager,
        interaction: &UserInteractionManager,
        request: &ContextRequest<'_>,
        fraction: f64,
        prev_tokens: u64,
    ) -> Result<Option<ContextTruncation>> {
        let Some(result) = truncate_conversation(messages.api_history(), fraction) else {
            tracing::warn!(task_id = %request.task_id, "nothing left to truncate");
            return Ok(None);
        };
        let new_tokens = estimate_context_tokens(
            request.api,
            request.system_prompt,
            effective_history(&result.history),
        );
        messages.overwrite_api_conversation_history(result.history).await?;

        let truncation = ContextTruncation {
            truncation_id: result.truncation_id,
            messages_removed: result.messages_removed,
            prev_context_tokens: prev_tokens,
            new_context_tokens: new_tokens,
        };
        tracing::info!(
            task_id = %request.task_id,
            removed = truncation.messages_removed,
            prev_tokens,
            new_tokens,
            "truncated conversation"
        );
        interaction
            .say_with(
                messages,
                Say::SlidingWindowTruncation,
                None,
                SayOptions {
                    context_truncation: Some(truncation.clone()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(Some(truncation))
    }
}

/// Hide a `fraction` of the visible history behind a truncation marker.
///
/// The first visible entry is always kept and an even number of entries is
/// removed so user and assistant turns stay paired. The kept range never
/// starts with tool results. Returns `None` when nothing can be removed.
pub fn truncate_conversation(history: &[ApiMessage], fraction: f64) -> Option<TruncationResult> {
    let visible = effective_positions(history);
    if visible.len() <= 2 {
        return None;
    }

    let mut remove = ((visible.len() - 1) as f64 * fraction.clamp(0.0, 1.0)) as usize;
    remove -= remove % 2;
    if remove == 0 {
        return None;
    }
    while 1 + remove < visible.len() && history[visible[1 + remove]].has_tool_result() {
        remove += 1;
    }
    if 1 + remove >= visible.len() {
        return None;
    }

    let truncation_id = uuid::Uuid::new_v4().to_string();
    let removed = &visible[1..1 + remove];
    let first_kept = &history[visible[1 + remove]];
    let mut marker = ApiMessage::new(
        Role::User,
        vec![ContentBlock::text(TRUNCATION_NOTICE)],
        first_kept.ts - 1,
        first_kept.conversation_index,
    );
    marker.is_truncation_marker = true;
    marker.truncation_id = Some(truncation_id.clone());

    let insert_at = visible[1 + remove];
    let mut new_history = Vec::with_capacity(history.len() + 1);
    for (position, entry) in history.iter().enumerate() {
        if position == insert_at {
            new_history.push(marker.clone());
        }
        let mut entry = entry.clone();
        if removed.contains(&position) {
            entry.truncation_parent = Some(truncation_id.clone());
        }
        new_history.push(entry);
    }

    Some(TruncationResult {
        history: new_history,
        truncation_id,
        messages_removed: remove,
    })
}
