//! Model transcript types and the LLM backend capability.
//!
//! The transcript is the model-facing mirror of a channel's conversation:
//! an ordered sequence of user, assistant, and tool messages persisted to
//! `context.jsonl` one JSON object per line.

pub mod anthropic;
pub mod models;

use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use futures::Stream;

/// Streamed backend event sequence for one run.
pub type BackendStream = Pin<Box<dyn Stream<Item = BackendEvent> + Send>>;

/// Message roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One content part of a transcript message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Part {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    Image {
        mime_type: String,
        /// Base64-encoded bytes.
        data: String,
    },
    ToolUse {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Why the model stopped emitting an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Aborted,
    Error,
}

/// Token usage of one assistant message (or a whole run, accumulated).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
    }

    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_write
    }
}

/// User message content: plain text or structured parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Parts(Vec<Part>),
}

impl UserContent {
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    Part::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Result payload of one tool call, fed back to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: Vec<Part>,
    #[serde(default)]
    pub error: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Part::text(text)],
            error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![Part::text(text)],
            error: true,
        }
    }

    /// Concatenated text content, for thread summaries.
    pub fn as_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                Part::Thinking { thinking } => Some(thinking.as_str()),
                Part::Image { .. } => Some("[image]"),
                Part::ToolUse { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One transcript message. Serialized per line into `context.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TranscriptMessage {
    User {
        content: UserContent,
    },
    Assistant {
        content: Vec<Part>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<StopReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    Tool {
        tool_call_id: String,
        result: ToolResult,
    },
}

impl TranscriptMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: UserContent::Text(text.into()),
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: vec![Part::text(text)],
            stop_reason: Some(StopReason::EndTurn),
            usage: None,
            error_message: None,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::User { .. } => Role::User,
            Self::Assistant { .. } => Role::Assistant,
            Self::Tool { .. } => Role::Tool,
        }
    }
}

/// Events streamed by the backend while it drives the tool-use loop.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        is_error: bool,
        result: ToolResult,
    },
    MessageStart {
        role: Role,
    },
    MessageEnd {
        role: Role,
        content: Vec<Part>,
        stop_reason: Option<StopReason>,
        usage: Option<Usage>,
        error_message: Option<String>,
    },
    AutoCompactionStart,
    AutoCompactionEnd,
    AutoRetryStart {
        attempt: u32,
        max_attempts: u32,
    },
}

/// One prompt for the backend: system prompt, prior transcript, the new
/// user message, optional attached images, and the tool set to dispatch.
pub struct PromptRequest {
    pub system_prompt: String,
    pub transcript: Vec<TranscriptMessage>,
    pub user_message: TranscriptMessage,
    pub images: Vec<Part>,
    pub tools: Vec<Arc<dyn crate::tools::Tool>>,
}

/// The LLM backend capability: a streamed tool-use completion.
pub trait LLMBackend: Send + Sync {
    fn prompt(&self, request: PromptRequest, cancel: CancellationToken) -> BackendStream;
}

/// Diagnostic snapshot written to `last_prompt.jsonl` on every prompt.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextWindowSnapshot<'a> {
    pub system_prompt: &'a str,
    pub transcript: &'a [TranscriptMessage],
    pub user_message: &'a TranscriptMessage,
    pub attached_images: usize,
}
