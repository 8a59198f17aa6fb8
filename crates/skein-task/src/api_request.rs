//! The request/response round
//!
//! [`ApiRequestManager::run_round`] sends one user turn to the model and
//! records what comes back. It owns the retry ladder for a round: context
//! reduction for overflows, exponential backoff with a visible countdown for
//! transient failures, and finally an `api_req_failed` ask.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use skein_ai::{ApiHandler, ApiStreamChunk, ContentBlock, GroundingSource, Model, RequestMetadata, Role, ToolDefinition, Usage};

use crate::config::TaskConfig;
use crate::context::{ContextManager, ContextRequest};
use crate::error::{Error, Result};
use crate::events::{EventBus, TaskEvent};
use crate::history::{CleanOptions, ConversationHistoryManager};
use crate::interaction::UserInteractionManager;
use crate::message::{ApiReqInfo, Ask, CancelReason, Say};
use crate::messages::MessageManager;
use crate::metrics::get_api_metrics;
use crate::rate_limit::RateLimiter;
use crate::retry::ErrorCategorizer;
use crate::state::{TaskStateManager, ToolProtocol};
use crate::streaming::{StreamOutcome, StreamingManager};

const USER_INTERRUPTION_NOTE: &str = "[Response interrupted by user]";
const API_INTERRUPTION_NOTE: &str = "[Response interrupted by API Error]";
const REQUEST_PREVIEW_CHARS: usize = 500;

/// Everything a round borrows from its task
pub struct RoundContext<'a> {
    pub task_id: &'a str,
    pub system_prompt: &'a str,
    pub messages: &'a mut MessageManager,
    pub streaming: &'a mut StreamingManager,
    pub interaction: &'a UserInteractionManager,
    pub context: &'a ContextManager,
    pub state: &'a TaskStateManager,
    pub events: &'a EventBus,
    /// Native tool definitions, sent when the protocol is native
    pub tools: &'a [ToolDefinition],
    /// Tool names the xml parser recognizes
    pub tool_names: &'a [String],
}

/// A completed round
#[derive(Debug, Clone)]
pub struct RoundOutput {
    /// Parsed assistant content; tool calls appear as tool-use blocks in
    /// either protocol
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
    pub cost: f64,
    pub request_index: u64,
}

impl RoundOutput {
    pub fn tool_calls(&self) -> Vec<(String, String, serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some((id.clone(), name.clone(), input.clone())),
                _ => None,
            })
            .collect()
    }
}

enum AttemptFailure {
    /// Nothing was streamed; the round may be retried
    Retryable(Error),
    /// Already recorded in the transcripts; ends the round
    Fatal(Error),
}

/// Trailing partial UI entry being streamed into
#[derive(Default)]
struct Narration {
    current: Option<(Say, i64)>,
    reasoning: String,
}

pub struct ApiRequestManager {
    api: Arc<dyn ApiHandler>,
    limiter: RateLimiter,
    config: TaskConfig,
}

impl ApiRequestManager {
    pub fn new(api: Arc<dyn ApiHandler>, limiter: RateLimiter, config: TaskConfig) -> Self {
        Self { api, limiter, config }
    }

    pub fn api(&self) -> &Arc<dyn ApiHandler> {
        &self.api
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn context_request<'a>(&'a self, task_id: &'a str, system_prompt: &'a str) -> ContextRequest<'a> {
        ContextRequest {
            api: self.api.as_ref(),
            task_id,
            system_prompt,
            max_tokens: self.config.max_tokens,
        }
    }

    /// Send `user_content` and record the response
    pub async fn run_round(&self, ctx: &mut RoundContext<'_>, user_content: Vec<ContentBlock>) -> Result<RoundOutput> {
        if ctx.state.is_aborted() {
            return Err(Error::Aborted);
        }

        let info = ApiReqInfo {
            request: Some(request_preview(&user_content)),
            ..Default::default()
        };
        let req_ts = ctx
            .interaction
            .say_complete(ctx.messages, Say::ApiReqStarted, Some(info.to_text()))
            .await?;
        let request_index = ctx
            .messages
            .add_to_api_conversation_history(Role::User, user_content, None)
            .await?;

        let abort = ctx.state.abort_token();
        let context_request = self.context_request(ctx.task_id, ctx.system_prompt);
        ctx.context
            .manage_context(ctx.messages, ctx.interaction, &context_request, &abort)
            .await?;

        let mut api_retries = 0u32;
        let mut context_retries = 0u32;
        loop {
            self.wait_for_rate_limit(ctx).await?;

            let model = self.api.model();
            let attempt = self.attempt(ctx, &model, req_ts, &info, request_index).await;
            if ctx.streaming.is_streaming() {
                ctx.streaming.stop_streaming();
            }
            ctx.state.end_request();

            let error = match attempt {
                Ok(output) => return Ok(output),
                Err(AttemptFailure::Fatal(e)) => return Err(e),
                Err(AttemptFailure::Retryable(e)) => e,
            };
            if ctx.state.is_aborted() || error.is_abort() {
                return Err(Error::Aborted);
            }

            let guidance = ErrorCategorizer::guidance(&error);
            tracing::warn!(
                task_id = %ctx.task_id,
                category = ?guidance.category,
                api_retries,
                context_retries,
                error = %error,
                "request attempt failed"
            );

            if guidance.needs_context_management {
                if context_retries < self.config.max_context_window_retries {
                    context_retries += 1;
                    ctx.context
                        .force_reduction(ctx.messages, ctx.interaction, &context_request, &abort)
                        .await?;
                    continue;
                }
            } else if guidance.should_retry && self.config.auto_retry && api_retries < self.config.max_api_retries {
                let retry_after = match &error {
                    Error::Ai(ai) => ai.retry_after(),
                    _ => None,
                };
                let secs = self.config.backoff.countdown_secs(api_retries, retry_after);
                api_retries += 1;
                self.retry_countdown(ctx, &error, secs).await?;
                continue;
            }

            let response = ctx
                .interaction
                .ask(ctx.messages, Ask::ApiReqFailed, Some(error.to_string()), None)
                .await?;
            if response.is_some_and(|r| r.is_yes()) {
                ctx.interaction
                    .say_complete(ctx.messages, Say::ApiReqRetried, None)
                    .await?;
                api_retries = 0;
                context_retries = 0;
                continue;
            }
            return Err(error);
        }
    }

    /// Sleep out the shared rate limit one second at a time
    async fn wait_for_rate_limit(&self, ctx: &mut RoundContext<'_>) -> Result<()> {
        let interval = self.config.rate_limit_interval();
        let mut remaining = self.limiter.remaining(interval);
        if remaining.is_zero() {
            return Ok(());
        }
        let abort = ctx.state.abort_token();
        while !remaining.is_zero() {
            if abort.is_cancelled() {
                return Err(Error::Aborted);
            }
            let secs = remaining.as_secs_f64().ceil() as u64;
            ctx.interaction
                .say(
                    ctx.messages,
                    Say::ApiReqRetryDelayed,
                    Some(format!("Rate limiting for {secs} seconds...")),
                    Some(true),
                )
                .await?;
            let tick = remaining.min(Duration::from_secs(1));
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = abort.cancelled() => return Err(Error::Aborted),
            }
            remaining = self.limiter.remaining(interval);
        }
        ctx.interaction
            .discard_partial(ctx.messages, Say::ApiReqRetryDelayed)
            .await?;
        Ok(())
    }

    /// Count down before a retry. Aborting during the countdown rejects it.
    async fn retry_countdown(&self, ctx: &mut RoundContext<'_>, error: &Error, secs: u64) -> Result<()> {
        let abort = ctx.state.abort_token();
        for remaining in (1..=secs).rev() {
            if abort.is_cancelled() {
                return Err(Error::AbortedDuringRetry);
            }
            ctx.interaction
                .say(
                    ctx.messages,
                    Say::ApiReqRetryDelayed,
                    Some(format!("{error}\n\nRetrying in {remaining} seconds...")),
                    Some(true),
                )
                .await
                .map_err(|e| if e.is_abort() { Error::AbortedDuringRetry } else { e })?;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = abort.cancelled() => return Err(Error::AbortedDuringRetry),
            }
        }
        if abort.is_cancelled() {
            return Err(Error::AbortedDuringRetry);
        }
        ctx.interaction
            .say(
                ctx.messages,
                Say::ApiReqRetryDelayed,
                Some(format!("{error}\n\nRetrying now...")),
                Some(false),
            )
            .await?;
        Ok(())
    }

    async fn attempt(
        &self,
        ctx: &mut RoundContext<'_>,
        model: &Model,
        req_ts: i64,
        info: &ApiReqInfo,
        request_index: u64,
    ) -> std::result::Result<RoundOutput, AttemptFailure> {
        let prepared = ConversationHistoryManager::prepare(
            ctx.system_prompt,
            ctx.messages.api_history(),
            CleanOptions {
                preserve_reasoning: model.reasoning,
            },
        );
        let protocol = ctx.state.tool_protocol();
        let metadata = RequestMetadata {
            task_id: Some(ctx.task_id.to_string()),
            mode: Some(ctx.state.mode()),
            tools: match protocol {
                ToolProtocol::Native => ctx.tools.to_vec(),
                ToolProtocol::Xml => Vec::new(),
            },
            max_tokens: self.config.max_tokens,
            temperature: None,
            reasoning: self.config.reasoning,
        };

        let token = ctx.state.begin_request();
        self.limiter.mark_request();
        ctx.streaming.start_streaming(protocol, ctx.tool_names.to_vec());
        tracing::debug!(
            task_id = %ctx.task_id,
            request_index,
            messages = prepared.messages.len(),
            "opening model stream"
        );

        let opened = tokio::select! {
            opened = self.api.create_message(&prepared.system_prompt, &prepared.messages, &metadata) => opened,
            _ = token.cancelled() => {
                let outcome = ctx.streaming.stop_streaming();
                self.record_interruption(ctx, outcome, req_ts, info, CancelReason::UserCancelled, None)
                    .await
                    .map_err(AttemptFailure::Fatal)?;
                return Err(AttemptFailure::Fatal(Error::Aborted));
            }
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return Err(AttemptFailure::Retryable(e.into())),
        };

        let mut narration = Narration::default();
        let mut received_chunk = false;
        let failure = loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = token.cancelled() => break Some(None),
            };
            match next {
                None => break None,
                Some(Err(e)) => break Some(Some(e)),
                Some(Ok(chunk)) => {
                    received_chunk = true;
                    self.handle_chunk(ctx, chunk, &mut narration)
                        .await
                        .map_err(AttemptFailure::Fatal)?;
                }
            }
        };
        drop(stream);

        match failure {
            // Cancelled through the request token
            Some(None) => {
                self.finish_narration(ctx, &mut narration, None).await;
                let outcome = ctx.streaming.stop_streaming();
                self.record_interruption(ctx, outcome, req_ts, info, CancelReason::UserCancelled, None)
                    .await
                    .map_err(AttemptFailure::Fatal)?;
                Err(AttemptFailure::Fatal(Error::Aborted))
            }
            Some(Some(e)) if !received_chunk => {
                self.finish_narration(ctx, &mut narration, None).await;
                Err(AttemptFailure::Retryable(e.into()))
            }
            Some(Some(e)) => {
                self.finish_narration(ctx, &mut narration, None).await;
                let outcome = ctx.streaming.stop_streaming();
                let message = e.to_string();
                tracing::error!(task_id = %ctx.task_id, error = %message, "stream failed mid-response");
                self.record_interruption(ctx, outcome, req_ts, info, CancelReason::StreamingFailed, Some(message))
                    .await
                    .map_err(AttemptFailure::Fatal)?;
                Err(AttemptFailure::Fatal(e.into()))
            }
            None => {
                ctx.streaming.mark_stream_complete();
                let outcome = ctx.streaming.stop_streaming();
                if outcome.content.is_empty() {
                    self.finish_narration(ctx, &mut narration, None).await;
                    return Err(AttemptFailure::Retryable(Error::EmptyResponse));
                }
                let sources = (!outcome.grounding.is_empty()).then(|| format_sources(&outcome.grounding));
                self.finish_narration(ctx, &mut narration, sources).await;
                self.complete(ctx, model, outcome, req_ts, info, request_index, protocol)
                    .await
                    .map_err(AttemptFailure::Fatal)
            }
        }
    }

    async fn handle_chunk(&self, ctx: &mut RoundContext<'_>, chunk: ApiStreamChunk, narration: &mut Narration) -> Result<()> {
        match chunk {
            ApiStreamChunk::Text { text } => {
                ctx.streaming.append_text(&text);
                let current = ctx.streaming.current_text();
                if !current.trim().is_empty() {
                    self.narrate(ctx, narration, Say::Text, current).await?;
                }
            }
            ApiStreamChunk::Reasoning { text, signature } => {
                ctx.streaming.append_reasoning(&text, signature);
                narration.reasoning.push_str(&text);
                let current = narration.reasoning.clone();
                self.narrate(ctx, narration, Say::Reasoning, current).await?;
            }
            ApiStreamChunk::Usage(usage) => ctx.streaming.add_usage(&usage),
            ApiStreamChunk::ToolCallPartial {
                index,
                id,
                name,
                arguments,
            } => ctx
                .streaming
                .on_tool_call_partial(index, id.as_deref(), name.as_deref(), arguments.as_deref()),
            ApiStreamChunk::Grounding { sources } => ctx.streaming.add_grounding(sources),
            _ => tracing::trace!("ignoring unknown stream chunk"),
        }
        Ok(())
    }

    async fn narrate(&self, ctx: &mut RoundContext<'_>, narration: &mut Narration, say: Say, text: String) -> Result<()> {
        if let Some((previous, ts)) = narration.current {
            if previous != say {
                ctx.interaction
                    .update_message(ctx.messages, ts, true, |m| m.partial = None)
                    .await?;
                narration.current = None;
            }
        }
        if let Some(ts) = ctx.interaction.say(ctx.messages, say, Some(text), Some(true)).await? {
            narration.current = Some((say, ts));
        }
        Ok(())
    }

    /// Close the streamed entry. Runs during aborts too, so it bypasses the
    /// abort check in `say`.
    async fn finish_narration(&self, ctx: &mut RoundContext<'_>, narration: &mut Narration, sources: Option<String>) {
        let mut sources = sources;
        if let Some((say, ts)) = narration.current.take() {
            let appended = if say == Say::Text { sources.take() } else { None };
            let result = ctx
                .interaction
                .update_message(ctx.messages, ts, true, |m| {
                    m.partial = None;
                    if let Some(appended) = appended {
                        m.text = Some(format!("{}{}", m.text.as_deref().unwrap_or_default(), appended));
                    }
                })
                .await;
            if let Err(e) = result {
                tracing::warn!(task_id = %ctx.task_id, error = %e, "failed to finalize streamed message");
            }
        }
        if let Some(sources) = sources {
            let result = ctx
                .interaction
                .say_complete(ctx.messages, Say::Text, Some(sources.trim_start().to_string()))
                .await;
            if let Err(e) = result {
                tracing::warn!(task_id = %ctx.task_id, error = %e, "failed to narrate sources");
            }
        }
    }

    /// Persist partial output with an interruption note and terminate the
    /// request's `api_req_started` entry
    async fn record_interruption(
        &self,
        ctx: &mut RoundContext<'_>,
        outcome: StreamOutcome,
        req_ts: i64,
        info: &ApiReqInfo,
        reason: CancelReason,
        failure: Option<String>,
    ) -> Result<()> {
        let note = match reason {
            CancelReason::UserCancelled => USER_INTERRUPTION_NOTE,
            CancelReason::StreamingFailed => API_INTERRUPTION_NOTE,
        };
        let text = if outcome.text.trim().is_empty() {
            note.to_string()
        } else {
            format!("{}\n\n{}", outcome.text, note)
        };
        let reasoning = Some(outcome.reasoning).filter(|r| !r.is_empty());
        ctx.messages
            .add_to_api_conversation_history(Role::Assistant, vec![ContentBlock::text(text)], reasoning)
            .await?;

        let model = self.api.model();
        let info = ApiReqInfo {
            cancel_reason: Some(reason),
            streaming_failed_message: failure,
            ..with_usage(info, &outcome.usage, &model)
        };
        self.update_request_info(ctx, req_ts, info).await?;
        ctx.messages.index_mut().end_current_api_request();
        tracing::info!(task_id = %ctx.task_id, ?reason, "request interrupted");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete(
        &self,
        ctx: &mut RoundContext<'_>,
        model: &Model,
        outcome: StreamOutcome,
        req_ts: i64,
        info: &ApiReqInfo,
        request_index: u64,
        protocol: ToolProtocol,
    ) -> Result<RoundOutput> {
        // xml tool calls live in the raw text, so that is what gets stored
        let stored = match protocol {
            ToolProtocol::Native => outcome.content.clone(),
            ToolProtocol::Xml => vec![ContentBlock::text(outcome.text.clone())],
        };
        let reasoning = Some(outcome.reasoning.clone()).filter(|r| !r.is_empty());
        ctx.messages
            .add_to_api_conversation_history(Role::Assistant, stored, reasoning)
            .await?;

        let info = with_usage(info, &outcome.usage, model);
        let cost = info.cost.unwrap_or_default();
        self.update_request_info(ctx, req_ts, info).await?;
        ctx.messages.index_mut().end_current_api_request();

        ctx.events.emit(TaskEvent::TokenUsageUpdated {
            task_id: ctx.task_id.to_string(),
            metrics: get_api_metrics(ctx.messages.ui_messages()),
        });
        tracing::debug!(
            task_id = %ctx.task_id,
            request_index,
            tokens_in = outcome.usage.input,
            tokens_out = outcome.usage.output,
            cost,
            "round complete"
        );

        Ok(RoundOutput {
            content: outcome.content,
            usage: outcome.usage,
            cost,
            request_index,
        })
    }

    async fn update_request_info(&self, ctx: &mut RoundContext<'_>, req_ts: i64, info: ApiReqInfo) -> Result<()> {
        let text = info.to_text();
        ctx.interaction
            .update_message(ctx.messages, req_ts, true, |m| m.text = Some(text))
            .await?;
        Ok(())
    }
}

fn with_usage(info: &ApiReqInfo, usage: &Usage, model: &Model) -> ApiReqInfo {
    ApiReqInfo {
        tokens_in: Some(usage.input),
        tokens_out: Some(usage.output),
        cache_writes: Some(usage.cache_write),
        cache_reads: Some(usage.cache_read),
        cost: Some(usage.total_cost.unwrap_or_else(|| usage.calculate_cost(model).total)),
        ..info.clone()
    }
}

fn request_preview(content: &[ContentBlock]) -> String {
    let text: String = content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            ContentBlock::ToolResult { .. } => Some("[tool results]"),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    match text.char_indices().nth(REQUEST_PREVIEW_CHARS) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text,
    }
}

fn format_sources(sources: &[GroundingSource]) -> String {
    let lines: Vec<String> = sources
        .iter()
        .enumerate()
        .map(|(i, source)| format!("[{}] {} ({})", i + 1, source.title, source.url))
        .collect();
    format!("\n\nSources:\n{}", lines.join("\n"))
}
