//! Model-ready transcript preparation
//!
//! [`ConversationHistoryManager`] turns the stored API transcript into the
//! message list sent to a provider. It is a pure transform: entries hidden
//! by a live condensation or truncation are skipped, reasoning is folded or
//! dropped, engine metadata is stripped, tool pairs are repaired and
//! consecutive same-role messages are merged.

use std::collections::HashSet;

use skein_ai::{ContentBlock, Message, Role};

use crate::message::ApiMessage;
use crate::state::ToolProtocol;

const INTERRUPTED_TOOL_RESULT: &str =
    "Tool execution was interrupted before a result was recorded.";

/// Entries still visible to the model.
///
/// An entry is hidden while the summary or truncation marker it points at
/// is present. Once that marker is gone (for example after a rewind) the
/// entry becomes visible again.
pub fn effective_history(history: &[ApiMessage]) -> Vec<&ApiMessage> {
    let visible_positions = effective_positions(history);
    visible_positions.into_iter().map(|i| &history[i]).collect()
}

/// Positions of [`effective_history`] entries in the full transcript
pub fn effective_positions(history: &[ApiMessage]) -> Vec<usize> {
    let live_summaries: HashSet<&str> = history
        .iter()
        .filter(|m| m.is_summary)
        .filter_map(|m| m.condense_id.as_deref())
        .collect();
    let live_markers: HashSet<&str> = history
        .iter()
        .filter(|m| m.is_truncation_marker)
        .filter_map(|m| m.truncation_id.as_deref())
        .collect();

    history
        .iter()
        .enumerate()
        .filter(|(_, m)| {
            let condensed = m
                .condense_parent
                .as_deref()
                .is_some_and(|id| live_summaries.contains(id));
            let truncated = m
                .truncation_parent
                .as_deref()
                .is_some_and(|id| live_markers.contains(id));
            !condensed && !truncated
        })
        .map(|(i, _)| i)
        .collect()
}

/// Which tool-call protocol a transcript was written in, if any tool was used
pub fn detect_tool_protocol(history: &[ApiMessage]) -> Option<ToolProtocol> {
    let native = history
        .iter()
        .any(|m| m.content.iter().any(|b| b.is_tool_use() || b.is_tool_result()));
    if native {
        return Some(ToolProtocol::Native);
    }
    let xml = history.iter().any(|m| {
        m.role == Role::User
            && m.content
                .iter()
                .filter_map(ContentBlock::as_text)
                .any(|t| t.starts_with(crate::streaming::XML_TOOL_RESULT_PREFIX))
    });
    xml.then_some(ToolProtocol::Xml)
}

/// A transcript ready to hand to a provider
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedConversation {
    pub system_prompt: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanOptions {
    /// Replay signed reasoning blocks (models that require them)
    pub preserve_reasoning: bool,
}

pub struct ConversationHistoryManager;

impl ConversationHistoryManager {
    /// Build the request: visible entries, cleaned, with system-role entries
    /// hoisted into the system prompt.
    pub fn prepare(system_prompt: &str, history: &[ApiMessage], options: CleanOptions) -> PreparedConversation {
        let visible = effective_history(history);
        let mut system_prompt = system_prompt.to_string();
        for entry in visible.iter().filter(|m| m.role == Role::System) {
            let text = entry.text();
            if !text.is_empty() {
                system_prompt.push_str("\n\n");
                system_prompt.push_str(&text);
            }
        }
        let conversation: Vec<&ApiMessage> = visible.into_iter().filter(|m| m.role != Role::System).collect();
        PreparedConversation {
            system_prompt,
            messages: Self::clean(&conversation, options),
        }
    }

    /// Clean already-filtered entries into provider messages
    pub fn clean(entries: &[&ApiMessage], options: CleanOptions) -> Vec<Message> {
        let messages: Vec<Message> = entries
            .iter()
            .filter_map(|entry| {
                let content = match entry.role {
                    Role::Assistant => clean_assistant_content(&entry.content, options),
                    _ => entry
                        .content
                        .iter()
                        .filter(|b| !b.is_reasoning())
                        .filter(|b| !is_empty_text(b))
                        .cloned()
                        .collect(),
                };
                (!content.is_empty()).then_some(Message {
                    role: entry.role,
                    content,
                })
            })
            .collect();

        merge_consecutive(repair_tool_pairs(merge_consecutive(messages)))
    }
}

fn is_empty_text(block: &ContentBlock) -> bool {
    matches!(block, ContentBlock::Text { text } if text.trim().is_empty())
}

fn clean_assistant_content(content: &[ContentBlock], options: CleanOptions) -> Vec<ContentBlock> {
    let mut reasoning_text = String::new();
    let mut signature = None;
    let mut rest = Vec::new();

    for block in content {
        match block {
            ContentBlock::Reasoning { text, signature: s } => {
                reasoning_text.push_str(text);
                if s.is_some() {
                    signature = s.clone();
                }
            }
            block if is_empty_text(block) => {}
            other => rest.push(other.clone()),
        }
    }

    // Only signed reasoning can be replayed; anything else is dropped.
    match signature {
        Some(signature) if options.preserve_reasoning => {
            let mut folded = vec![ContentBlock::Reasoning {
                text: reasoning_text,
                signature: Some(signature),
            }];
            folded.extend(rest);
            folded
        }
        _ => rest,
    }
}

fn merge_consecutive(messages: Vec<Message>) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        match merged.last_mut() {
            Some(last) if last.role == message.role => {
                // Tool results must lead a user turn.
                if message.role == Role::User && message.content.iter().any(ContentBlock::is_tool_result) {
                    let (results, other): (Vec<_>, Vec<_>) =
                        message.content.into_iter().partition(ContentBlock::is_tool_result);
                    let (prev_results, prev_other): (Vec<_>, Vec<_>) =
                        std::mem::take(&mut last.content).into_iter().partition(ContentBlock::is_tool_result);
                    last.content = prev_results.into_iter().chain(results).chain(prev_other).chain(other).collect();
                } else {
                    last.content.extend(message.content);
                }
            }
            _ => merged.push(message),
        }
    }
    merged
}

/// Drop tool results that answer nothing and synthesize results for tool
/// uses that were never answered.
fn repair_tool_pairs(messages: Vec<Message>) -> Vec<Message> {
    let mut repaired: Vec<Message> = Vec::with_capacity(messages.len());
    let mut pending_uses: Vec<String> = Vec::new();

    for mut message in messages {
        match message.role {
            Role::Assistant => {
                if !pending_uses.is_empty() {
                    repaired.push(synthetic_results(std::mem::take(&mut pending_uses)));
                }
                pending_uses = message
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                        _ => None,
                    })
                    .collect();
                repaired.push(message);
            }
            _ => {
                let answerable: HashSet<String> = pending_uses.iter().cloned().collect();
                message.content.retain(|b| match b {
                    ContentBlock::ToolResult { tool_use_id, .. } => {
                        let keep = answerable.contains(tool_use_id);
                        if !keep {
                            tracing::debug!(tool_use_id = %tool_use_id, "dropping orphaned tool result");
                        }
                        keep
                    }
                    _ => true,
                });
                let answered: HashSet<String> = message
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                        _ => None,
                    })
                    .collect();
                let missing: Vec<String> = pending_uses.drain(..).filter(|id| !answered.contains(id)).collect();
                if !missing.is_empty() {
                    let mut content: Vec<ContentBlock> = missing
                        .into_iter()
                        .map(|id| ContentBlock::tool_result(id, INTERRUPTED_TOOL_RESULT, true))
                        .collect();
                    content.append(&mut message.content);
                    message.content = content;
                }
                if !message.content.is_empty() {
                    repaired.push(message);
                }
            }
        }
    }
    repaired
}

fn synthetic_results(ids: Vec<String>) -> Message {
    Message {
        role: Role::User,
        content: ids
            .into_iter()
            .map(|id| ContentBlock::tool_result(id, INTERRUPTED_TOOL_RESULT, true))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(role: Role, content: Vec<ContentBlock>, index: u64) -> ApiMessage {
        ApiMessage::new(role, content, index as i64 + 1, index)
    }

    #[test]
    fn test_effective_history_hides_condensed_entries() {
        let mut old = entry(Role::User, vec![ContentBlock::text("old")], 1);
        old.condense_parent = Some("c1".into());
        let mut summary = entry(Role::User, vec![ContentBlock::text("summary")], 2);
        summary.is_summary = true;
        summary.condense_id = Some("c1".into());
        let history = vec![entry(Role::User, vec![ContentBlock::text("first")], 0), old.clone(), summary];

        let visible = effective_history(&history);
        assert_eq!(visible.len(), 2);
        assert!(visible.iter().all(|m| m.condense_parent.is_none()));

        // Without the summary the tagged entry is visible again.
        let history = vec![entry(Role::User, vec![ContentBlock::text("first")], 0), old];
        assert_eq!(effective_history(&history).len(), 2);
    }

    #[test]
    fn test_unsigned_reasoning_is_dropped() {
        let history = vec![
            entry(Role::User, vec![ContentBlock::text("q")], 0),
            entry(
                Role::Assistant,
                vec![
                    ContentBlock::Reasoning {
                        text: "think".into(),
                        signature: None,
                    },
                    ContentBlock::text("a"),
                ],
                0,
            ),
        ];
        let prepared = ConversationHistoryManager::prepare(
            "sys",
            &history,
            CleanOptions {
                preserve_reasoning: true,
            },
        );
        assert_eq!(prepared.messages[1].content, vec![ContentBlock::text("a")]);
    }

    #[test]
    fn test_signed_reasoning_is_kept_when_requested() {
        let history = vec![
            entry(Role::User, vec![ContentBlock::text("q")], 0),
            entry(
                Role::Assistant,
                vec![
                    ContentBlock::Reasoning {
                        text: "think".into(),
                        signature: Some("sig".into()),
                    },
                    ContentBlock::text("a"),
                ],
                0,
            ),
        ];
        let kept = ConversationHistoryManager::prepare(
            "",
            &history,
            CleanOptions {
                preserve_reasoning: true,
            },
        );
        assert!(kept.messages[1].content[0].is_reasoning());

        let dropped = ConversationHistoryManager::prepare("", &history, CleanOptions::default());
        assert_eq!(dropped.messages[1].content.len(), 1);
    }

    #[test]
    fn test_consecutive_roles_merge_and_system_hoists() {
        let history = vec![
            entry(Role::User, vec![ContentBlock::text("a")], 0),
            entry(Role::System, vec![ContentBlock::text("be brief")], 0),
            entry(Role::User, vec![ContentBlock::text("b")], 1),
        ];
        let prepared = ConversationHistoryManager::prepare("base", &history, CleanOptions::default());
        assert_eq!(prepared.system_prompt, "base\n\nbe brief");
        assert_eq!(prepared.messages.len(), 1);
        assert_eq!(prepared.messages[0].content.len(), 2);
    }

    #[test]
    fn test_orphan_tool_result_is_dropped() {
        let history = vec![
            entry(Role::User, vec![ContentBlock::text("q")], 0),
            entry(Role::Assistant, vec![ContentBlock::text("a")], 0),
            entry(
                Role::User,
                vec![ContentBlock::tool_result("ghost", "x", false), ContentBlock::text("next")],
                1,
            ),
        ];
        let prepared = ConversationHistoryManager::prepare("", &history, CleanOptions::default());
        assert_eq!(prepared.messages[2].content, vec![ContentBlock::text("next")]);
    }

    #[test]
    fn test_unanswered_tool_use_gets_synthetic_result() {
        let history = vec![
            entry(Role::User, vec![ContentBlock::text("q")], 0),
            entry(Role::Assistant, vec![ContentBlock::tool_use("t1", "read", json!({}))], 0),
            entry(Role::User, vec![ContentBlock::text("never mind")], 1),
        ];
        let prepared = ConversationHistoryManager::prepare("", &history, CleanOptions::default());
        let last = &prepared.messages[2].content;
        assert!(matches!(&last[0], ContentBlock::ToolResult { tool_use_id, is_error: true, .. } if tool_use_id == "t1"));
        assert_eq!(last[1], ContentBlock::text("never mind"));
    }

    #[test]
    fn test_merged_user_turns_keep_tool_results_first() {
        let history = vec![
            entry(Role::User, vec![ContentBlock::text("q")], 0),
            entry(Role::Assistant, vec![ContentBlock::tool_use("t1", "read", json!({}))], 0),
            entry(Role::User, vec![ContentBlock::text("queued note")], 1),
            entry(Role::User, vec![ContentBlock::tool_result("t1", "ok", false)], 2),
        ];
        let prepared = ConversationHistoryManager::prepare("", &history, CleanOptions::default());
        assert_eq!(prepared.messages.len(), 3);
        assert!(prepared.messages[2].content[0].is_tool_result());
    }

    #[test]
    fn test_detect_tool_protocol() {
        assert_eq!(detect_tool_protocol(&[]), None);
        let native = vec![entry(Role::Assistant, vec![ContentBlock::tool_use("t", "x", json!({}))], 0)];
        assert_eq!(detect_tool_protocol(&native), Some(ToolProtocol::Native));
        let xml = vec![entry(
            Role::User,
            vec![ContentBlock::text(format!("{}read] Result:\nok", crate::streaming::XML_TOOL_RESULT_PREFIX))],
            0,
        )];
        assert_eq!(detect_tool_protocol(&xml), Some(ToolProtocol::Xml));
    }
}
