//! Streaming messages-API backend.
//!
//! Drives the tool-use loop against an Anthropic-shaped HTTP endpoint
//! (`LLM_URL` may point at a local gateway speaking the same protocol).
//! Emits the backend event sequence: tool executions, message start/end,
//! and auto-retry notices. 429s and 5xxs retry with backoff; everything
//! else ends the run with an error message end.

use crate::llm::{
    BackendEvent, BackendStream, LLMBackend, Part, PromptRequest, Role, StopReason, ToolResult,
    TranscriptMessage, Usage, UserContent,
};
use crate::tools::Tool;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_RETRIES: u32 = 3;
/// Backstop on tool-call rounds within one run.
const MAX_TOOL_ROUNDS: usize = 50;
const DEFAULT_MAX_TOKENS: u32 = 8192;

#[derive(Clone)]
pub struct AnthropicBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

impl AnthropicBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// One streamed completion call. Retry classification happens here;
    /// the loop in `prompt` decides what to do with it.
    async fn stream_once(
        &self,
        system: &str,
        messages: &[TranscriptMessage],
        tool_defs: &[Value],
        cancel: &CancellationToken,
    ) -> std::result::Result<AssistantTurn, CallError> {
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "stream": true,
            "system": system,
            "messages": wire_messages(messages),
        });
        if !tool_defs.is_empty() {
            body["tools"] = Value::Array(tool_defs.to_vec());
        }

        let mut request = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = tokio::select! {
            result = request.send() => result.map_err(|error| CallError::Retryable(error.to_string()))?,
            () = cancel.cancelled() => return Err(CallError::Aborted),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("{status}: {}", body.trim());
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(CallError::Retryable(message))
            } else {
                Err(CallError::Fatal(message))
            };
        }

        let mut parser = SseParser::default();
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        loop {
            let chunk = tokio::select! {
                chunk = futures::StreamExt::next(&mut stream) => chunk,
                () = cancel.cancelled() => return Err(CallError::Aborted),
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|error| CallError::Retryable(error.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim_end_matches('\r').to_string();
                buffer.drain(..=newline);
                parser.feed_line(&line)?;
            }
        }
        Ok(parser.finish())
    }
}

impl LLMBackend for AnthropicBackend {
    fn prompt(&self, request: PromptRequest, cancel: CancellationToken) -> BackendStream {
        let backend = self.clone();
        Box::pin(async_stream::stream! {
            let tools_by_name: HashMap<String, Arc<dyn Tool>> = request
                .tools
                .iter()
                .map(|tool| (tool.name().to_string(), tool.clone()))
                .collect();
            let tool_defs: Vec<Value> = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name(),
                        "description": tool.description(),
                        "input_schema": tool.parameters(),
                    })
                })
                .collect();

            let mut messages = request.transcript.clone();
            messages.push(attach_images(request.user_message.clone(), &request.images));

            for _round in 0..MAX_TOOL_ROUNDS {
                if cancel.is_cancelled() {
                    yield aborted_end();
                    return;
                }

                let mut attempt: u32 = 0;
                let turn = loop {
                    match backend
                        .stream_once(&request.system_prompt, &messages, &tool_defs, &cancel)
                        .await
                    {
                        Ok(turn) => break turn,
                        Err(CallError::Aborted) => {
                            yield aborted_end();
                            return;
                        }
                        Err(CallError::Retryable(reason)) if attempt + 1 < MAX_RETRIES => {
                            attempt += 1;
                            tracing::warn!(%reason, attempt, "backend call failed, retrying");
                            yield BackendEvent::AutoRetryStart {
                                attempt,
                                max_attempts: MAX_RETRIES,
                            };
                            tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                        }
                        Err(CallError::Retryable(reason)) | Err(CallError::Fatal(reason)) => {
                            tracing::error!(%reason, "backend call failed");
                            yield error_end(reason);
                            return;
                        }
                    }
                };

                yield BackendEvent::MessageStart { role: Role::Assistant };
                yield BackendEvent::MessageEnd {
                    role: Role::Assistant,
                    content: turn.content.clone(),
                    stop_reason: turn.stop_reason,
                    usage: Some(turn.usage),
                    error_message: None,
                };

                let tool_uses: Vec<(String, String, Value)> = turn
                    .content
                    .iter()
                    .filter_map(|part| match part {
                        Part::ToolUse {
                            tool_call_id,
                            tool_name,
                            args,
                        } => Some((tool_call_id.clone(), tool_name.clone(), args.clone())),
                        _ => None,
                    })
                    .collect();

                messages.push(TranscriptMessage::Assistant {
                    content: turn.content,
                    stop_reason: turn.stop_reason,
                    usage: Some(turn.usage),
                    error_message: None,
                });

                if turn.stop_reason != Some(StopReason::ToolUse) || tool_uses.is_empty() {
                    return;
                }

                for (tool_call_id, tool_name, args) in tool_uses {
                    if cancel.is_cancelled() {
                        yield aborted_end();
                        return;
                    }
                    yield BackendEvent::ToolExecutionStart {
                        tool_call_id: tool_call_id.clone(),
                        tool_name: tool_name.clone(),
                        args: args.clone(),
                    };
                    let result = match tools_by_name.get(&tool_name) {
                        Some(tool) => tool.execute(&tool_call_id, args, &cancel).await,
                        None => ToolResult::error(format!("unknown tool: {tool_name}")),
                    };
                    yield BackendEvent::ToolExecutionEnd {
                        tool_call_id: tool_call_id.clone(),
                        is_error: result.error,
                        result: result.clone(),
                    };
                    messages.push(TranscriptMessage::Tool {
                        tool_call_id,
                        result,
                    });
                }
            }

            yield error_end(format!("tool loop exceeded {MAX_TOOL_ROUNDS} rounds"));
        })
    }
}

fn aborted_end() -> BackendEvent {
    BackendEvent::MessageEnd {
        role: Role::Assistant,
        content: vec![],
        stop_reason: Some(StopReason::Aborted),
        usage: None,
        error_message: None,
    }
}

fn error_end(message: String) -> BackendEvent {
    BackendEvent::MessageEnd {
        role: Role::Assistant,
        content: vec![],
        stop_reason: Some(StopReason::Error),
        usage: None,
        error_message: Some(message),
    }
}

/// Fold attached image parts into the user message content.
fn attach_images(message: TranscriptMessage, images: &[Part]) -> TranscriptMessage {
    if images.is_empty() {
        return message;
    }
    match message {
        TranscriptMessage::User { content } => {
            let mut parts = images.to_vec();
            match content {
                UserContent::Text(text) => parts.push(Part::text(text)),
                UserContent::Parts(existing) => parts.extend(existing),
            }
            TranscriptMessage::User {
                content: UserContent::Parts(parts),
            }
        }
        other => other,
    }
}

#[derive(Debug)]
enum CallError {
    Retryable(String),
    Fatal(String),
    Aborted,
}

/// Convert transcript messages into wire messages, merging consecutive
/// same-role entries (tool results ride in user messages).
fn wire_messages(messages: &[TranscriptMessage]) -> Vec<Value> {
    let mut wire: Vec<(String, Vec<Value>)> = Vec::new();
    for message in messages {
        let (role, blocks) = match message {
            TranscriptMessage::User { content } => {
                let blocks = match content {
                    UserContent::Text(text) => vec![json!({"type": "text", "text": text})],
                    UserContent::Parts(parts) => parts.iter().map(part_to_block).collect(),
                };
                ("user", blocks)
            }
            TranscriptMessage::Assistant { content, .. } => {
                let blocks: Vec<Value> = content
                    .iter()
                    .filter(|part| match part {
                        Part::Text { text } => !text.is_empty(),
                        _ => true,
                    })
                    .map(part_to_block)
                    .collect();
                if blocks.is_empty() {
                    continue;
                }
                ("assistant", blocks)
            }
            TranscriptMessage::Tool {
                tool_call_id,
                result,
            } => {
                let content: Vec<Value> = result.content.iter().map(part_to_block).collect();
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": tool_call_id,
                    "content": content,
                    "is_error": result.error,
                });
                ("user", vec![block])
            }
        };

        match wire.last_mut() {
            Some((last_role, last_blocks)) if last_role == role => {
                last_blocks.extend(blocks);
            }
            _ => wire.push((role.to_string(), blocks)),
        }
    }

    wire.into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect()
}

fn part_to_block(part: &Part) -> Value {
    match part {
        Part::Text { text } => json!({"type": "text", "text": text}),
        Part::Thinking { thinking } => json!({"type": "thinking", "thinking": thinking}),
        Part::Image { mime_type, data } => json!({
            "type": "image",
            "source": {"type": "base64", "media_type": mime_type, "data": data},
        }),
        Part::ToolUse {
            tool_call_id,
            tool_name,
            args,
        } => json!({
            "type": "tool_use",
            "id": tool_call_id,
            "name": tool_name,
            "input": args,
        }),
    }
}

/// One completed assistant message.
#[derive(Debug, Default)]
struct AssistantTurn {
    content: Vec<Part>,
    stop_reason: Option<StopReason>,
    usage: Usage,
}

/// Accumulates SSE events into an [`AssistantTurn`].
#[derive(Debug, Default)]
struct SseParser {
    blocks: Vec<BlockAcc>,
    stop_reason: Option<StopReason>,
    usage: Usage,
}

#[derive(Debug)]
enum BlockAcc {
    Text(String),
    Thinking(String),
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
}

impl SseParser {
    fn feed_line(&mut self, line: &str) -> std::result::Result<(), CallError> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Ok(());
        }
        let event: Value = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(error) => {
                tracing::debug!(%error, "unparseable SSE line, skipping");
                return Ok(());
            }
        };

        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                let usage = &event["message"]["usage"];
                self.usage.input = usage["input_tokens"].as_u64().unwrap_or(0);
                self.usage.cache_read = usage["cache_read_input_tokens"].as_u64().unwrap_or(0);
                self.usage.cache_write =
                    usage["cache_creation_input_tokens"].as_u64().unwrap_or(0);
            }
            Some("content_block_start") => {
                let block = &event["content_block"];
                let acc = match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => BlockAcc::ToolUse {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        input_json: String::new(),
                    },
                    Some("thinking") => BlockAcc::Thinking(
                        block["thinking"].as_str().unwrap_or_default().to_string(),
                    ),
                    _ => BlockAcc::Text(block["text"].as_str().unwrap_or_default().to_string()),
                };
                self.blocks.push(acc);
            }
            Some("content_block_delta") => {
                let delta = &event["delta"];
                if let Some(last) = self.blocks.last_mut() {
                    match (last, delta.get("type").and_then(Value::as_str)) {
                        (BlockAcc::Text(text), Some("text_delta")) => {
                            text.push_str(delta["text"].as_str().unwrap_or_default());
                        }
                        (BlockAcc::Thinking(thinking), Some("thinking_delta")) => {
                            thinking.push_str(delta["thinking"].as_str().unwrap_or_default());
                        }
                        (BlockAcc::ToolUse { input_json, .. }, Some("input_json_delta")) => {
                            input_json.push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                        _ => {}
                    }
                }
            }
            Some("message_delta") => {
                if let Some(stop) = event["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(parse_stop_reason(stop));
                }
                if let Some(output) = event["usage"]["output_tokens"].as_u64() {
                    self.usage.output = output;
                }
            }
            Some("error") => {
                let message = event["error"]["message"]
                    .as_str()
                    .unwrap_or("stream error")
                    .to_string();
                return Err(CallError::Retryable(message));
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> AssistantTurn {
        let content = self
            .blocks
            .into_iter()
            .map(|block| match block {
                BlockAcc::Text(text) => Part::Text { text },
                BlockAcc::Thinking(thinking) => Part::Thinking { thinking },
                BlockAcc::ToolUse {
                    id,
                    name,
                    input_json,
                } => Part::ToolUse {
                    tool_call_id: id,
                    tool_name: name,
                    args: serde_json::from_str(&input_json).unwrap_or_else(|_| json!({})),
                },
            })
            .collect();
        AssistantTurn {
            content,
            stop_reason: self.stop_reason,
            usage: self.usage,
        }
    }
}

fn parse_stop_reason(stop: &str) -> StopReason {
    match stop {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}
