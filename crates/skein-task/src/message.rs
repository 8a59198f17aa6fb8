//! Transcript entry types
//!
//! A task keeps two transcripts. [`ApiMessage`] entries are what the model
//! sees; [`UiMessage`] entries are the say/ask log narrated to the operator.

use serde::{Deserialize, Serialize};
use skein_ai::{ContentBlock, Role};

/// Current time in milliseconds since the epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Marker left on an API entry when a checkpoint was saved at its request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub commit: String,
    pub request_index: u64,
}

/// One entry of the model-facing transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub ts: i64,
    #[serde(default)]
    pub conversation_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_metadata: Option<CheckpointMetadata>,
    /// This entry is a condensation summary
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_summary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condense_id: Option<String>,
    /// Hidden by the summary with this condense id while that summary exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condense_parent: Option<String>,
    /// This entry marks where a sliding-window truncation removed turns
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_truncation_marker: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncation_id: Option<String>,
    /// Hidden by the truncation marker with this id while that marker exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncation_parent: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ApiMessage {
    pub fn new(role: Role, content: Vec<ContentBlock>, ts: i64, conversation_index: u64) -> Self {
        Self {
            role,
            content,
            ts,
            conversation_index,
            checkpoint_metadata: None,
            is_summary: false,
            condense_id: None,
            condense_parent: None,
            is_truncation_marker: false,
            truncation_id: None,
            truncation_parent: None,
        }
    }

    pub fn has_tool_use(&self) -> bool {
        self.content.iter().any(ContentBlock::is_tool_use)
    }

    pub fn has_tool_result(&self) -> bool {
        self.content.iter().any(ContentBlock::is_tool_result)
    }

    /// Whether the entry carries nothing but reasoning blocks
    pub fn is_reasoning_only(&self) -> bool {
        !self.content.is_empty() && self.content.iter().all(ContentBlock::is_reasoning)
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Reasoning captured from the stream alongside an assistant response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReasoningCapture {
    pub text: String,
    pub signature: Option<String>,
}

impl ReasoningCapture {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.signature.is_none()
    }
}

/// Narration kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Say {
    Text,
    Reasoning,
    Error,
    /// Opens a request; text is a serialized [`ApiReqInfo`]
    ApiReqStarted,
    ApiReqRetried,
    /// Countdown before a retry or rate-limit wait
    ApiReqRetryDelayed,
    /// Cost of requests removed by a restore; text is a serialized [`ApiReqInfo`]
    ApiReqDeleted,
    Tool,
    CompletionResult,
    UserFeedback,
    CheckpointSaved,
    CondenseContext,
    CondenseContextError,
    SlidingWindowTruncation,
    SubtaskResult,
}

/// Question kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ask {
    Followup,
    Tool,
    Command,
    /// Streaming command output; the operator may answer but the turn does not wait
    CommandOutput,
    CompletionResult,
    ApiReqFailed,
    MistakeLimitReached,
    ResumeTask,
    ResumeCompletedTask,
}

impl Ask {
    /// Whether the turn waits for an answer
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Ask::CommandOutput)
    }

    /// Asks a task can be resumed from
    pub fn is_resumable(&self) -> bool {
        matches!(self, Ask::ResumeTask | Ask::ResumeCompletedTask)
    }
}

/// Discriminates say and ask entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiMessageKind {
    Say { say: Say },
    Ask { ask: Ask },
}

/// Summary-based context reduction record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextCondense {
    pub condense_id: String,
    pub summary: String,
    pub cost: f64,
    pub prev_context_tokens: u64,
    pub new_context_tokens: u64,
}

/// Window-based context reduction record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextTruncation {
    pub truncation_id: String,
    pub messages_removed: usize,
    pub prev_context_tokens: u64,
    pub new_context_tokens: u64,
}

/// One entry of the operator-facing transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    pub ts: i64,
    #[serde(flatten)]
    pub kind: UiMessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_condense: Option<ContextCondense>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_truncation: Option<ContextTruncation>,
    /// Length of the API transcript when this entry was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_history_index: Option<usize>,
}

impl UiMessage {
    pub fn say(ts: i64, say: Say, text: Option<String>) -> Self {
        Self::with_kind(ts, UiMessageKind::Say { say }, text)
    }

    pub fn ask(ts: i64, ask: Ask, text: Option<String>) -> Self {
        Self::with_kind(ts, UiMessageKind::Ask { ask }, text)
    }

    fn with_kind(ts: i64, kind: UiMessageKind, text: Option<String>) -> Self {
        Self {
            ts,
            kind,
            text,
            images: Vec::new(),
            partial: None,
            checkpoint: None,
            context_condense: None,
            context_truncation: None,
            conversation_history_index: None,
        }
    }

    pub fn say_kind(&self) -> Option<Say> {
        match self.kind {
            UiMessageKind::Say { say } => Some(say),
            UiMessageKind::Ask { .. } => None,
        }
    }

    pub fn ask_kind(&self) -> Option<Ask> {
        match self.kind {
            UiMessageKind::Ask { ask } => Some(ask),
            UiMessageKind::Say { .. } => None,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.partial == Some(true)
    }

    /// Request info when this is an `api_req_started` or `api_req_deleted` entry
    pub fn api_req_info(&self) -> Option<ApiReqInfo> {
        match self.say_kind() {
            Some(Say::ApiReqStarted | Say::ApiReqDeleted) => {
                self.text.as_deref().and_then(|t| serde_json::from_str(t).ok())
            }
            _ => None,
        }
    }
}

/// Why a request ended without completing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    StreamingFailed,
    UserCancelled,
}

/// Payload of an `api_req_started` entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiReqInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_writes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_reads: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_failed_message: Option<String>,
}

impl ApiReqInfo {
    /// A request is terminated once it has a cost or a cancel reason
    pub fn is_terminated(&self) -> bool {
        self.cost.is_some() || self.cancel_reason.is_some()
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Operator answer to an ask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskResponseKind {
    YesButtonClicked,
    NoButtonClicked,
    MessageResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskResponse {
    pub kind: AskResponseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl AskResponse {
    pub fn yes() -> Self {
        Self {
            kind: AskResponseKind::YesButtonClicked,
            text: None,
            images: Vec::new(),
        }
    }

    pub fn no() -> Self {
        Self {
            kind: AskResponseKind::NoButtonClicked,
            text: None,
            images: Vec::new(),
        }
    }

    pub fn message(text: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            kind: AskResponseKind::MessageResponse,
            text: Some(text.into()),
            images,
        }
    }

    pub fn is_yes(&self) -> bool {
        self.kind == AskResponseKind::YesButtonClicked
    }

    /// Operator text, if any was provided
    pub fn feedback(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ui_message_serde_flattens_kind() {
        let mut message = UiMessage::say(10, Say::ApiReqStarted, Some("{}".into()));
        message.partial = Some(true);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "say");
        assert_eq!(json["say"], "api_req_started");
        assert_eq!(json["partial"], true);

        let back: UiMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_api_req_info_termination() {
        let mut info = ApiReqInfo::default();
        assert!(!info.is_terminated());
        info.cancel_reason = Some(CancelReason::UserCancelled);
        assert!(info.is_terminated());

        let message = UiMessage::say(1, Say::ApiReqStarted, Some(info.to_text()));
        assert_eq!(message.api_req_info(), Some(info));
    }

    #[test]
    fn test_api_message_omits_default_flags() {
        let message = ApiMessage::new(Role::User, vec![ContentBlock::text("hi")], 5, 2);
        let json = serde_json::to_value(&message).unwrap();
        assert!(json.get("is_summary").is_none());
        assert!(json.get("condense_parent").is_none());
        assert_eq!(json["conversation_index"], 2);
    }

    #[test]
    fn test_blocking_asks() {
        assert!(Ask::Followup.is_blocking());
        assert!(Ask::CompletionResult.is_blocking());
        assert!(!Ask::CommandOutput.is_blocking());
    }
}
