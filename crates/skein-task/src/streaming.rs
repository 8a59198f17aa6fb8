//! Per-request streaming state
//!
//! [`AssistantMessageParser`] accumulates streamed assistant output into
//! ordered content buffers. [`StreamingManager`] owns one parser per request
//! plus the streaming flags, and is the only place a request's partial
//! output lives until the round finishes.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use skein_ai::{ContentBlock, GroundingSource, Usage};

use crate::events::{EventBus, TaskEvent};
use crate::message::ReasoningCapture;
use crate::state::ToolProtocol;

/// Tool results in the xml protocol are user text starting with this
pub const XML_TOOL_RESULT_PREFIX: &str = "[tool_result: ";

static XML_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<([A-Za-z_][A-Za-z0-9_]*)>(.*?)</([A-Za-z_][A-Za-z0-9_]*)>").expect("valid XML parameter pattern")
});

#[derive(Debug)]
enum ContentBuffer {
    Text(String),
    ToolCall {
        id: String,
        name: String,
        arguments_json: String,
    },
}

/// Builds assistant content from streamed chunks
#[derive(Debug)]
pub struct AssistantMessageParser {
    protocol: ToolProtocol,
    xml_tools: HashSet<String>,
    content_buffers: Vec<ContentBuffer>,
    /// Stream tool index to buffer position
    tool_positions: HashMap<u32, usize>,
}

impl AssistantMessageParser {
    pub fn new(protocol: ToolProtocol, tool_names: impl IntoIterator<Item = String>) -> Self {
        Self {
            protocol,
            xml_tools: tool_names.into_iter().collect(),
            content_buffers: Vec::new(),
            tool_positions: HashMap::new(),
        }
    }

    pub fn append_text(&mut self, delta: &str) {
        match self.content_buffers.last_mut() {
            Some(ContentBuffer::Text(text)) => text.push_str(delta),
            _ => self.content_buffers.push(ContentBuffer::Text(delta.to_string())),
        }
    }

    /// Fold a native tool-call fragment into the buffer for its stream index
    pub fn on_tool_call_partial(&mut self, index: u32, id: Option<&str>, name: Option<&str>, arguments: Option<&str>) {
        let position = match self.tool_positions.get(&index) {
            Some(&position) => position,
            None => {
                self.content_buffers.push(ContentBuffer::ToolCall {
                    id: String::new(),
                    name: String::new(),
                    arguments_json: String::new(),
                });
                let position = self.content_buffers.len() - 1;
                self.tool_positions.insert(index, position);
                position
            }
        };
        if let Some(ContentBuffer::ToolCall {
            id: buf_id,
            name: buf_name,
            arguments_json,
        }) = self.content_buffers.get_mut(position)
        {
            if let Some(id) = id {
                *buf_id = id.to_string();
            }
            if let Some(name) = name {
                *buf_name = name.to_string();
            }
            if let Some(arguments) = arguments {
                arguments_json.push_str(arguments);
            }
        }
    }

    pub fn has_content(&self) -> bool {
        self.content_buffers.iter().any(|buf| match buf {
            ContentBuffer::Text(text) => !text.trim().is_empty(),
            ContentBuffer::ToolCall { name, .. } => !name.is_empty(),
        })
    }

    /// Raw assistant text, concatenated
    pub fn text(&self) -> String {
        self.content_buffers
            .iter()
            .filter_map(|buf| match buf {
                ContentBuffer::Text(text) => Some(text.as_str()),
                ContentBuffer::ToolCall { .. } => None,
            })
            .collect()
    }

    /// Content parsed so far. Unfinished xml tool tags are left out.
    pub fn current_content(&self) -> Vec<ContentBlock> {
        self.parse(true)
    }

    /// Final content once the stream is done
    pub fn build(&self) -> Vec<ContentBlock> {
        self.parse(false)
    }

    fn parse(&self, partial: bool) -> Vec<ContentBlock> {
        let mut content = Vec::new();
        let mut xml_calls = 0usize;
        for buffer in &self.content_buffers {
            match buffer {
                ContentBuffer::Text(text) if self.protocol == ToolProtocol::Xml => {
                    self.parse_xml(text, partial, &mut xml_calls, &mut content);
                }
                ContentBuffer::Text(text) => {
                    if !text.is_empty() {
                        content.push(ContentBlock::text(text.clone()));
                    }
                }
                ContentBuffer::ToolCall {
                    id,
                    name,
                    arguments_json,
                } => {
                    if name.is_empty() {
                        continue;
                    }
                    let input = if arguments_json.trim().is_empty() {
                        serde_json::json!({})
                    } else {
                        match serde_json::from_str(arguments_json) {
                            Ok(value) => value,
                            Err(_) if partial => serde_json::json!({}),
                            // Left as a string so validation reports it
                            Err(_) => serde_json::Value::String(arguments_json.clone()),
                        }
                    };
                    content.push(ContentBlock::tool_use(id.clone(), name.clone(), input));
                }
            }
        }
        content
    }

    fn parse_xml(&self, text: &str, partial: bool, calls: &mut usize, out: &mut Vec<ContentBlock>) {
        let mut rest = text;
        loop {
            let next = self
                .xml_tools
                .iter()
                .filter_map(|name| rest.find(&format!("<{name}>")).map(|at| (at, name)))
                .min_by_key(|(at, _)| *at);

            let Some((start, name)) = next else {
                push_text(out, rest);
                return;
            };
            push_text(out, &rest[..start]);

            let open = format!("<{name}>");
            let close = format!("</{name}>");
            let body_start = start + open.len();
            match rest[body_start..].find(&close) {
                Some(body_len) => {
                    let body = &rest[body_start..body_start + body_len];
                    out.push(ContentBlock::tool_use(
                        format!("xml-{}", *calls),
                        name.clone(),
                        parse_xml_params(body),
                    ));
                    *calls += 1;
                    rest = &rest[body_start + body_len + close.len()..];
                }
                None if partial => return,
                None => {
                    // Unterminated tag at end of stream: take what is there.
                    out.push(ContentBlock::tool_use(
                        format!("xml-{}", *calls),
                        name.clone(),
                        parse_xml_params(&rest[body_start..]),
                    ));
                    *calls += 1;
                    return;
                }
            }
        }
    }
}

fn push_text(out: &mut Vec<ContentBlock>, text: &str) {
    if !text.trim().is_empty() {
        out.push(ContentBlock::text(text.trim().to_string()));
    }
}

fn parse_xml_params(body: &str) -> serde_json::Value {
    let mut params = serde_json::Map::new();
    for captures in XML_PARAM.captures_iter(body) {
        if captures[1] != captures[3] {
            continue;
        }
        let value = captures[2].trim();
        let value = match value.chars().next() {
            Some('[' | '{') => {
                serde_json::from_str::<serde_json::Value>(value).unwrap_or_else(|_| serde_json::Value::from(value))
            }
            _ => serde_json::Value::from(value),
        };
        params.insert(captures[1].to_string(), value);
    }
    serde_json::Value::Object(params)
}

/// Flags for the request currently streaming
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingState {
    pub is_streaming: bool,
    pub is_waiting_for_first_chunk: bool,
    /// Number of content blocks already presented
    pub current_streaming_content_index: usize,
    pub did_complete_reading_stream: bool,
}

/// What a finished (or interrupted) stream produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    pub content: Vec<ContentBlock>,
    pub text: String,
    pub reasoning: ReasoningCapture,
    pub usage: Usage,
    pub grounding: Vec<GroundingSource>,
    pub completed: bool,
}

pub struct StreamingManager {
    state: StreamingState,
    parser: Option<AssistantMessageParser>,
    reasoning: ReasoningCapture,
    usage: Usage,
    grounding: Vec<GroundingSource>,
    presenting: bool,
    presentation_pending: bool,
    events: EventBus,
}

impl StreamingManager {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: StreamingState::default(),
            parser: None,
            reasoning: ReasoningCapture::default(),
            usage: Usage::default(),
            grounding: Vec::new(),
            presenting: false,
            presentation_pending: false,
            events,
        }
    }

    pub fn state(&self) -> &StreamingState {
        &self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state.is_streaming
    }

    /// Enter the streaming state with a fresh parser
    pub fn start_streaming(&mut self, protocol: ToolProtocol, tool_names: Vec<String>) {
        if self.state.is_streaming {
            tracing::warn!("start_streaming called while already streaming; resetting");
        }
        self.reset_streaming_state();
        self.parser = Some(AssistantMessageParser::new(protocol, tool_names));
        self.state.is_streaming = true;
        self.state.is_waiting_for_first_chunk = true;
        self.events.emit(TaskEvent::StreamingStateChanged { is_streaming: true });
    }

    pub fn on_first_chunk(&mut self) {
        self.state.is_waiting_for_first_chunk = false;
    }

    pub fn append_text(&mut self, delta: &str) {
        self.on_first_chunk();
        if let Some(parser) = self.parser.as_mut() {
            parser.append_text(delta);
        }
        self.present_assistant_content();
    }

    pub fn append_reasoning(&mut self, delta: &str, signature: Option<String>) {
        self.on_first_chunk();
        self.reasoning.text.push_str(delta);
        if signature.is_some() {
            self.reasoning.signature = signature;
        }
    }

    pub fn on_tool_call_partial(&mut self, index: u32, id: Option<&str>, name: Option<&str>, arguments: Option<&str>) {
        self.on_first_chunk();
        if let Some(parser) = self.parser.as_mut() {
            parser.on_tool_call_partial(index, id, name, arguments);
        }
        self.present_assistant_content();
    }

    pub fn add_usage(&mut self, usage: &Usage) {
        self.usage.accumulate(usage);
    }

    pub fn add_grounding(&mut self, sources: Vec<GroundingSource>) {
        self.grounding.extend(sources);
    }

    pub fn has_content(&self) -> bool {
        self.parser.as_ref().is_some_and(AssistantMessageParser::has_content)
    }

    /// Narratable text parsed so far, without tool markup
    pub fn current_text(&self) -> String {
        self.parser
            .as_ref()
            .map(|parser| {
                parser
                    .current_content()
                    .iter()
                    .filter_map(ContentBlock::as_text)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default()
    }

    /// Announce the parsed content. A call arriving while a presentation is
    /// underway is folded into one more pass instead of running nested.
    pub fn present_assistant_content(&mut self) {
        if self.presenting {
            self.presentation_pending = true;
            return;
        }
        self.presenting = true;
        loop {
            self.presentation_pending = false;
            let content = self
                .parser
                .as_ref()
                .map(AssistantMessageParser::current_content)
                .unwrap_or_default();
            self.state.current_streaming_content_index = content.len();
            self.events.emit(TaskEvent::AssistantContentUpdated {
                content,
                partial: !self.state.did_complete_reading_stream,
            });
            if !self.presentation_pending {
                break;
            }
        }
        self.presenting = false;
    }

    pub fn mark_stream_complete(&mut self) {
        self.state.did_complete_reading_stream = true;
    }

    /// Leave the streaming state and hand back what was produced.
    ///
    /// An incomplete stream's content is flushed through a final content
    /// update first so partial output reaches the presenter.
    pub fn stop_streaming(&mut self) -> StreamOutcome {
        let completed = self.state.did_complete_reading_stream;
        let (content, text) = match self.parser.as_ref() {
            Some(parser) => (parser.build(), parser.text()),
            None => (Vec::new(), String::new()),
        };
        if !completed && !content.is_empty() {
            tracing::debug!(blocks = content.len(), "salvaging partially streamed content");
            self.events.emit(TaskEvent::AssistantContentUpdated {
                content: content.clone(),
                partial: false,
            });
        }
        let outcome = StreamOutcome {
            content,
            text,
            reasoning: std::mem::take(&mut self.reasoning),
            usage: std::mem::take(&mut self.usage),
            grounding: std::mem::take(&mut self.grounding),
            completed,
        };
        let was_streaming = self.state.is_streaming;
        self.reset_streaming_state();
        if was_streaming {
            self.events.emit(TaskEvent::StreamingStateChanged { is_streaming: false });
        }
        outcome
    }

    /// Zero all per-request state, parser included
    pub fn reset_streaming_state(&mut self) {
        self.state = StreamingState::default();
        self.parser = None;
        self.reasoning = ReasoningCapture::default();
        self.usage = Usage::default();
        self.grounding.clear();
        self.presenting = false;
        self.presentation_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_native_tool_call_fragments_accumulate() {
        let mut parser = AssistantMessageParser::new(ToolProtocol::Native, Vec::new());
        parser.append_text("Reading.");
        parser.on_tool_call_partial(1, Some("t1"), Some("read"), None);
        parser.on_tool_call_partial(1, None, None, Some("{\"path\":"));
        parser.on_tool_call_partial(1, None, None, Some("\"a.rs\"}"));

        let content = parser.build();
        assert_eq!(content.len(), 2);
        assert_eq!(content[1], ContentBlock::tool_use("t1", "read", json!({"path": "a.rs"})));
    }

    #[test]
    fn test_malformed_arguments_kept_as_string() {
        let mut parser = AssistantMessageParser::new(ToolProtocol::Native, Vec::new());
        parser.on_tool_call_partial(0, Some("t1"), Some("read"), Some("{\"path\""));
        assert!(matches!(
            &parser.current_content()[0],
            ContentBlock::ToolUse { input, .. } if *input == json!({})
        ));
        assert!(matches!(
            &parser.build()[0],
            ContentBlock::ToolUse { input: serde_json::Value::String(_), .. }
        ));
    }

    #[test]
    fn test_xml_tool_calls_are_extracted() {
        let mut parser = AssistantMessageParser::new(ToolProtocol::Xml, vec!["attempt_completion".to_string()]);
        parser.append_text("Done.\n<attempt_completion>\n<result>All good</result>\n");
        // Unfinished tag is withheld while streaming.
        assert_eq!(parser.current_content(), vec![ContentBlock::text("Done.")]);

        parser.append_text("</attempt_completion>");
        let content = parser.build();
        assert_eq!(content.len(), 2);
        assert_eq!(
            content[1],
            ContentBlock::tool_use("xml-0", "attempt_completion", json!({"result": "All good"}))
        );
    }

    #[test]
    fn test_xml_params_parse_values() {
        let params = parse_xml_params("<path>src/a.rs</path>\n<todos>[\"one\"]</todos>\n<bad>x</other>");
        assert_eq!(params, json!({"path": "src/a.rs", "todos": ["one"]}));
    }

    #[test]
    fn test_unregistered_xml_tags_stay_text() {
        let mut parser = AssistantMessageParser::new(ToolProtocol::Xml, vec!["read".to_string()]);
        parser.append_text("<thinking>hmm</thinking>");
        assert_eq!(parser.build(), vec![ContentBlock::text("<thinking>hmm</thinking>")]);
    }

    #[tokio::test]
    async fn test_interrupted_stream_is_salvaged() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let mut manager = StreamingManager::new(events);

        manager.start_streaming(ToolProtocol::Native, Vec::new());
        assert!(manager.state().is_waiting_for_first_chunk);
        manager.append_text("partial answer");
        assert!(!manager.state().is_waiting_for_first_chunk);

        let outcome = manager.stop_streaming();
        assert!(!outcome.completed);
        assert_eq!(outcome.text, "partial answer");

        let mut salvaged = false;
        while let Ok(event) = rx.try_recv() {
            if let TaskEvent::AssistantContentUpdated { partial: false, content } = event {
                salvaged = content == vec![ContentBlock::text("partial answer")];
            }
        }
        assert!(salvaged);
        assert_eq!(manager.state(), &StreamingState::default());
    }

    #[test]
    fn test_reset_clears_parser_between_requests() {
        let mut manager = StreamingManager::new(EventBus::new());
        manager.start_streaming(ToolProtocol::Native, Vec::new());
        manager.on_tool_call_partial(0, Some("t1"), Some("read"), Some("{}"));
        manager.append_reasoning("why", Some("sig".into()));
        manager.mark_stream_complete();
        let first = manager.stop_streaming();
        assert!(first.completed);
        assert_eq!(first.reasoning.signature.as_deref(), Some("sig"));

        manager.start_streaming(ToolProtocol::Native, Vec::new());
        manager.on_tool_call_partial(0, Some("t2"), Some("write"), Some("{}"));
        manager.mark_stream_complete();
        let second = manager.stop_streaming();
        assert_eq!(second.content, vec![ContentBlock::tool_use("t2", "write", json!({}))]);
        assert!(second.reasoning.is_empty());
    }
}
