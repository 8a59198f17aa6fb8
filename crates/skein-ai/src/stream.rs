//! Streaming chunk types

use crate::error::Result;
use crate::types::Usage;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// A web source a model cited while answering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub title: String,
    pub url: String,
}

/// One chunk of a model response.
///
/// Consumers must ignore kinds they do not recognize; new kinds may be added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ApiStreamChunk {
    /// Assistant text delta
    Text { text: String },
    /// Reasoning delta; the signature arrives once, usually on the last delta
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// Partial or final token usage
    Usage(Usage),
    /// Streamed fragment of a native tool call, keyed by the call's stream index
    ToolCallPartial {
        index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<String>,
    },
    /// Sources backing the answer
    Grounding { sources: Vec<GroundingSource> },
}

impl ApiStreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning {
            text: text.into(),
            signature: None,
        }
    }
}

/// A stream of response chunks. An `Err` item ends the response.
pub type ApiStream = Pin<Box<dyn Stream<Item = Result<ApiStreamChunk>> + Send>>;
