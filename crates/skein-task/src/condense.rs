//! Summary-based condensation
//!
//! Older visible turns are summarized by the model and hidden behind a
//! summary entry. Nothing is deleted: summarized entries are tagged with the
//! summary's condense id, so removing the summary later brings them back.

use std::collections::HashMap;

use futures::StreamExt;
use skein_ai::{ApiHandler, ApiStreamChunk, ContentBlock, Message, RequestMetadata, Role, Usage};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::history::effective_positions;
use crate::message::{ApiMessage, ContextCondense};
use crate::tokens::estimate_context_tokens;

const SUMMARY_SYSTEM_PROMPT: &str = "\
You summarize software engineering conversations between a user and an AI assistant. \
Your summary replaces the conversation in the assistant's context, so it must keep \
everything the assistant needs to carry on with the task without asking again.";

const SUMMARY_PROMPT: &str = "\
Write a detailed summary of the conversation below. Use these sections:

1. **Task**: what the user asked for, in their words where it matters.
2. **Work done**: concrete changes made and results observed so far.
3. **Technical context**: files, commands, decisions and constraints that still apply.
4. **Open problems**: errors or questions that are not resolved.
5. **Next step**: what the assistant was about to do, quoting the latest instruction.

Do not continue the conversation. Only write the summary.

<conversation>
{conversation}
</conversation>";

const SUMMARY_UPDATE_PROMPT: &str = "\
An earlier part of this conversation was already summarized. Merge that summary with \
the newer messages into one updated summary, using the same sections:

1. **Task**
2. **Work done**
3. **Technical context**
4. **Open problems**
5. **Next step**

<previous-summary>
{previous_summary}
</previous-summary>

<new-messages>
{conversation}
</new-messages>";

/// Inputs shared by every condensation
pub struct SummarizeRequest<'a> {
    pub api: &'a dyn ApiHandler,
    pub task_id: &'a str,
    pub system_prompt: &'a str,
    /// Replaces the default summarizer instructions
    pub custom_prompt: Option<&'a str>,
    pub keep_recent: usize,
    pub prev_context_tokens: u64,
}

pub struct SummarizeOutcome {
    pub history: Vec<ApiMessage>,
    pub condense: ContextCondense,
}

/// Summarize all but the last `keep_recent` visible entries
pub async fn summarize_conversation(
    history: &[ApiMessage],
    request: &SummarizeRequest<'_>,
    cancel: &CancellationToken,
) -> Result<SummarizeOutcome> {
    let visible = effective_positions(history);
    if visible.len() <= request.keep_recent + 1 {
        return Err(Error::Context("Not enough messages to condense".into()));
    }

    // Kept entries must not open with tool results.
    let mut cut = visible.len() - request.keep_recent;
    while cut < visible.len() && history[visible[cut]].has_tool_result() {
        cut += 1;
    }
    if cut >= visible.len() {
        return Err(Error::Context("No valid point to condense at".into()));
    }
    if visible[cut..].iter().any(|&i| history[i].is_summary) {
        return Err(Error::Context("Context was condensed recently; nothing new to condense".into()));
    }

    let summarized = &visible[..cut];
    let previous_summary = summarized
        .iter()
        .rev()
        .map(|&i| &history[i])
        .find(|m| m.is_summary)
        .map(ApiMessage::text);
    let to_serialize: Vec<&ApiMessage> = summarized
        .iter()
        .map(|&i| &history[i])
        .filter(|m| !m.is_summary)
        .collect();

    let conversation = serialize_for_summary(&to_serialize);
    let prompt = match &previous_summary {
        Some(previous) => SUMMARY_UPDATE_PROMPT
            .replace("{previous_summary}", previous)
            .replace("{conversation}", &conversation),
        None => SUMMARY_PROMPT.replace("{conversation}", &conversation),
    };
    let system_prompt = request.custom_prompt.unwrap_or(SUMMARY_SYSTEM_PROMPT);

    let metadata = RequestMetadata {
        task_id: Some(request.task_id.to_string()),
        ..Default::default()
    };
    let messages = [Message::user(prompt)];
    let mut stream = tokio::select! {
        opened = request.api.create_message(system_prompt, &messages, &metadata) => opened?,
        _ = cancel.cancelled() => return Err(Error::Aborted),
    };

    let mut summary = String::new();
    let mut usage = Usage::default();
    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = cancel.cancelled() => return Err(Error::Aborted),
        };
        match chunk {
            Some(Ok(ApiStreamChunk::Text { text })) => summary.push_str(&text),
            Some(Ok(ApiStreamChunk::Usage(partial))) => usage.accumulate(&partial),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => break,
        }
    }
    let summary = summary.trim().to_string();
    if summary.is_empty() {
        return Err(Error::Context("Condensation produced an empty summary".into()));
    }
    let cost = usage.calculate_cost(&request.api.model()).total;

    let condense_id = uuid::Uuid::new_v4().to_string();
    let first_kept = &history[visible[cut]];
    let mut summary_entry = ApiMessage::new(
        Role::User,
        vec![ContentBlock::text(format!("## Conversation summary\n\n{summary}"))],
        first_kept.ts - 1,
        first_kept.conversation_index,
    );
    summary_entry.is_summary = true;
    summary_entry.condense_id = Some(condense_id.clone());

    let insert_at = visible[cut];
    let mut new_history = Vec::with_capacity(history.len() + 1);
    for (position, entry) in history.iter().enumerate() {
        if position == insert_at {
            new_history.push(summary_entry.clone());
        }
        let mut entry = entry.clone();
        if summarized.contains(&position) {
            entry.condense_parent = Some(condense_id.clone());
        }
        new_history.push(entry);
    }

    let kept = crate::history::effective_history(&new_history);
    let new_context_tokens = estimate_context_tokens(request.api, request.system_prompt, kept) + usage.output;
    if new_context_tokens >= request.prev_context_tokens {
        return Err(Error::Context(format!(
            "Condensation did not shrink the context ({} -> {} tokens)",
            request.prev_context_tokens, new_context_tokens
        )));
    }

    tracing::info!(
        task_id = %request.task_id,
        summarized = summarized.len(),
        prev_tokens = request.prev_context_tokens,
        new_tokens = new_context_tokens,
        iterative = previous_summary.is_some(),
        "condensed conversation"
    );

    Ok(SummarizeOutcome {
        history: new_history,
        condense: ContextCondense {
            condense_id,
            summary,
            cost,
            prev_context_tokens: request.prev_context_tokens,
            new_context_tokens,
        },
    })
}

/// Render entries as plain labelled text so the summarizer does not try
/// to continue the conversation.
fn serialize_for_summary(entries: &[&ApiMessage]) -> String {
    let mut tool_names: HashMap<&str, &str> = HashMap::new();
    let mut out = String::new();

    for entry in entries {
        match entry.role {
            Role::Assistant => {
                let mut text_parts = Vec::new();
                let mut tool_calls = Vec::new();
                for block in &entry.content {
                    match block {
                        ContentBlock::Text { text } => text_parts.push(text.as_str()),
                        ContentBlock::ToolUse { id, name, input } => {
                            tool_names.insert(id.as_str(), name.as_str());
                            tool_calls.push(format!("{}({})", name, format_tool_args(input)));
                        }
                        _ => {}
                    }
                }
                if !text_parts.is_empty() {
                    out.push_str("[Assistant]: ");
                    out.push_str(&text_parts.join(""));
                    out.push('\n');
                }
                if !tool_calls.is_empty() {
                    out.push_str("[Assistant tool calls]: ");
                    out.push_str(&tool_calls.join("; "));
                    out.push('\n');
                }
            }
            Role::User | Role::System => {
                for block in &entry.content {
                    match block {
                        ContentBlock::Text { text } if !text.trim().is_empty() => {
                            out.push_str("[User]: ");
                            out.push_str(text);
                            out.push('\n');
                        }
                        ContentBlock::Image { .. } => out.push_str("[User]: [image]\n"),
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            let name = tool_names.get(tool_use_id.as_str()).copied().unwrap_or("tool");
                            let text: String = content.iter().filter_map(ContentBlock::as_text).collect();
                            let label = if *is_error { "Tool error" } else { "Tool result" };
                            out.push_str(&format!("[{} ({})]: ", label, name));
                            out.push_str(truncate_chars(&text, 2000));
                            if text.chars().count() > 2000 {
                                out.push_str("...(truncated)");
                            }
                            out.push('\n');
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    out
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

fn format_tool_args(args: &serde_json::Value) -> String {
    match args {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    serde_json::Value::String(s) => format!("\"{}\"", s),
                    other => other.to_string(),
                };
                if rendered.chars().count() > 100 {
                    format!("{}={}...", key, truncate_chars(&rendered, 100))
                } else {
                    format!("{}={}", key, rendered)
                }
            })
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}
