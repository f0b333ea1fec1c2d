//! Per-channel agent runner.
//!
//! Owns the transcript, the tool set, and the per-run state. Consumes the
//! backend's event stream, dispatches every UI-visible action through an
//! ordered side-effect chain, and finalizes the working indicator according
//! to how the run ended.

use crate::agent::prompt::build_system_prompt;
use crate::error::Result;
use crate::llm::{
    BackendEvent, ContextWindowSnapshot, LLMBackend, Part, PromptRequest, Role, StopReason,
    ToolResult, TranscriptMessage, Usage,
};
use crate::sandbox::{Executor, truncate_tail};
use crate::session::{SessionContext, materialize_entries, trim_turns};
use crate::store::{ChannelStore, LogEntry};
use crate::tools::{self, Tool};
use crate::transport::ChatTransport;
use crate::{ChannelId, InboundEvent, MessageHandle};
use base64::Engine as _;
use chrono::Utc;
use futures::StreamExt as _;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Final messages longer than this are split across posts.
const FINAL_SPLIT: usize = 1900;
/// Headroom reserved for the continuation suffix.
const SPLIT_MARGIN: usize = 50;

/// Caps for tool output fences in thread posts.
const THREAD_FENCE_LINES: usize = 40;
const THREAD_FENCE_BYTES: usize = 2000;

/// A tool call in flight.
#[derive(Debug, Clone)]
pub struct PendingTool {
    pub tool_name: String,
    pub args: serde_json::Value,
    pub started_at: Instant,
}

/// Mutable run state, shared with the orchestrator for the stop protocol.
#[derive(Default)]
pub struct RunState {
    pub running: AtomicBool,
    pub stop_requested: AtomicBool,
    /// The `*Stopping...*` confirmation post, if any.
    pub stop_confirmation: Mutex<Option<MessageHandle>>,
    /// Capability bundle of the run in flight.
    pub current_context: Mutex<Option<Context>>,
    cancel: Mutex<Option<CancellationToken>>,
    pub pending_tools: Mutex<HashMap<String, PendingTool>>,
    pub accumulated_usage: Mutex<Usage>,
}

impl RunState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request a stop: flags the run and cancels every in-flight step.
    pub async fn abort(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(cancel) = self.cancel.lock().await.as_ref() {
            cancel.cancel();
        }
    }
}

/// Capability bundle handed to the runner for one call.
#[derive(Clone)]
pub struct Context {
    pub channel_id: ChannelId,
    pub transport: Arc<dyn ChatTransport>,
}

impl Context {
    pub async fn respond(&self, text: &str) -> Result<MessageHandle> {
        self.transport.post_message(&self.channel_id, text).await
    }

    pub async fn replace_message(&self, handle: &MessageHandle, text: &str) -> Result<()> {
        self.transport.update_message(handle, text).await
    }

    pub async fn respond_in_thread(
        &self,
        parent: &MessageHandle,
        text: &str,
    ) -> Result<MessageHandle> {
        self.transport.post_in_thread(parent, text).await
    }

    pub async fn set_typing(&self, typing: bool) {
        if let Err(error) = self.transport.set_typing(&self.channel_id, typing).await {
            tracing::debug!(%error, channel_id = %self.channel_id, "typing update failed");
        }
    }

    pub async fn upload_file(&self, path: &std::path::Path, title: Option<&str>) -> Result<()> {
        self.transport.upload_file(&self.channel_id, path, title).await
    }

    pub async fn set_working(&self, handle: &MessageHandle, caption: &str) -> Result<()> {
        self.transport.update_message(handle, caption).await
    }

    pub async fn delete_message(&self, handle: &MessageHandle) -> Result<()> {
        self.transport.delete_message(handle).await
    }
}

/// Shared dependencies for building runners.
#[derive(Clone)]
pub struct RunnerDeps {
    pub store: Arc<ChannelStore>,
    pub executor: Arc<Executor>,
    pub path_guard: Arc<crate::guard::PathGuard>,
    pub command_guard: Arc<crate::guard::CommandGuard>,
    pub backend: Arc<dyn LLMBackend>,
    pub transport: Arc<dyn ChatTransport>,
    pub models: Arc<crate::llm::models::ModelRegistry>,
    pub model_id: String,
    /// Coding-agent binary for the delegate tool; `None` disables it.
    pub delegate_bin: Option<String>,
}

/// One agent session, created on a channel's first message and cached for
/// the process lifetime.
pub struct AgentRunner {
    channel_id: ChannelId,
    deps: RunnerDeps,
    session: SessionContext,
    tools: Vec<Arc<dyn Tool>>,
    pub state: Arc<RunState>,
}

impl AgentRunner {
    pub fn new(channel_id: ChannelId, deps: RunnerDeps) -> Self {
        let mut tool_set: Vec<Arc<dyn Tool>> = vec![
            Arc::new(tools::ReadTool::new(
                deps.path_guard.clone(),
                deps.executor.clone(),
            )),
            Arc::new(tools::WriteTool::new(
                deps.path_guard.clone(),
                deps.executor.clone(),
            )),
            Arc::new(tools::EditTool::new(
                deps.path_guard.clone(),
                deps.executor.clone(),
            )),
            Arc::new(tools::BashTool::new(
                deps.command_guard.clone(),
                deps.executor.clone(),
            )),
            Arc::new(tools::AttachTool::new(
                deps.path_guard.clone(),
                deps.executor.clone(),
                deps.transport.clone(),
                channel_id.clone(),
            )),
        ];
        if let Some(bin) = &deps.delegate_bin {
            tool_set.push(Arc::new(tools::DelegateTool::new(
                bin.clone(),
                deps.executor.host_workspace().to_path_buf(),
            )));
        }

        let session = SessionContext::new(
            deps.store.workspace().to_path_buf(),
            channel_id.clone(),
        );

        Self {
            channel_id,
            deps,
            session,
            tools: tool_set,
            state: Arc::new(RunState::default()),
        }
    }

    /// Drive one run: sync the transcript, prompt the backend, relay events,
    /// finalize the working indicator, persist the transcript.
    #[tracing::instrument(skip(self, ctx, event), fields(channel_id = %self.channel_id, ts = %event.ts))]
    pub async fn run(&self, ctx: Context, event: InboundEvent) -> Result<()> {
        self.state.running.store(true, Ordering::SeqCst);
        *self.state.current_context.lock().await = Some(ctx.clone());
        let cancel = CancellationToken::new();
        *self.state.cancel.lock().await = Some(cancel.clone());

        let outcome = self.run_inner(&ctx, &event, cancel).await;

        // run teardown happens on every path
        ctx.set_typing(false).await;
        *self.state.cancel.lock().await = None;
        *self.state.current_context.lock().await = None;
        self.state.pending_tools.lock().await.clear();
        self.state.stop_requested.store(false, Ordering::SeqCst);
        *self.state.stop_confirmation.lock().await = None;
        self.state.running.store(false, Ordering::SeqCst);

        outcome
    }

    async fn run_inner(
        &self,
        ctx: &Context,
        event: &InboundEvent,
        cancel: CancellationToken,
    ) -> Result<()> {
        let entries = self.deps.store.entries(&self.channel_id).await?;
        let (last_ts, mut transcript) = self.session.load().await?;

        let mut new_messages = materialize_entries(&entries, last_ts.as_deref(), &event.ts);
        let user_message = match new_messages.pop() {
            Some(message @ TranscriptMessage::User { .. }) => message,
            Some(other) => {
                // the newest entry was assistant-authored; keep it and fall
                // back to the raw event text
                new_messages.push(other);
                TranscriptMessage::user(event.text.clone())
            }
            None => TranscriptMessage::user(event.text.clone()),
        };
        transcript.extend(new_messages);
        transcript = trim_turns(transcript);

        let system_prompt = build_system_prompt(
            self.deps.store.workspace(),
            self.deps.executor.workspace_path(),
            &self.channel_id,
            &entries,
        )
        .await;

        let images = self.load_attached_images(event).await;

        self.session
            .write_snapshot(&ContextWindowSnapshot {
                system_prompt: &system_prompt,
                transcript: &transcript,
                user_message: &user_message,
                attached_images: images.len(),
            })
            .await
            .ok();

        let working = ctx.respond("*...*").await?;
        ctx.set_typing(true).await;

        let effects = SideEffects::start(self.deps.transport.clone(), working.clone());
        let thread_handles: Arc<Mutex<Vec<MessageHandle>>> = Arc::new(Mutex::new(Vec::new()));

        let request = PromptRequest {
            system_prompt,
            transcript: transcript.clone(),
            user_message: user_message.clone(),
            images,
            tools: self.tools.clone(),
        };
        let mut stream = self.deps.backend.prompt(request, cancel.clone());

        let post_thinking = self.deps.models.get(&self.deps.model_id).post_thinking;

        let mut run_usage = Usage::default();
        let mut final_text = String::new();
        let mut final_stop: Option<StopReason> = None;
        let mut final_error: Option<String> = None;
        let mut saw_final = false;
        let mut run_messages: Vec<TranscriptMessage> = vec![user_message];

        while let Some(backend_event) = stream.next().await {
            match backend_event {
                BackendEvent::ToolExecutionStart {
                    tool_call_id,
                    tool_name,
                    args,
                } => {
                    let label = tools::label_of(&tool_name, &args);
                    self.state.pending_tools.lock().await.insert(
                        tool_call_id,
                        PendingTool {
                            tool_name,
                            args,
                            started_at: Instant::now(),
                        },
                    );
                    let transport = ctx.transport.clone();
                    let handle = working.clone();
                    effects.enqueue(Box::pin(async move {
                        transport
                            .update_message(&handle, &format!("*-> {label}*"))
                            .await
                            .map_err(Into::into)
                    }));
                }
                BackendEvent::ToolExecutionEnd {
                    tool_call_id,
                    is_error,
                    result,
                } => {
                    let pending = self
                        .state
                        .pending_tools
                        .lock()
                        .await
                        .remove(&tool_call_id);
                    let summary = tool_summary(pending.as_ref(), is_error, &result);
                    self.enqueue_thread_post(&effects, ctx, &working, &thread_handles, summary);
                    if is_error {
                        let error_note = format!(
                            "*Error: {}*",
                            sample_chars(&result.as_text(), 200)
                        );
                        self.enqueue_thread_post(
                            &effects,
                            ctx,
                            &working,
                            &thread_handles,
                            error_note,
                        );
                    }
                    run_messages.push(TranscriptMessage::Tool {
                        tool_call_id,
                        result,
                    });
                }
                BackendEvent::MessageStart { .. } => {}
                BackendEvent::MessageEnd {
                    role,
                    content,
                    stop_reason,
                    usage,
                    error_message,
                } => {
                    if role != Role::Assistant {
                        continue;
                    }
                    if let Some(usage) = usage {
                        if stop_reason != Some(StopReason::Aborted) {
                            run_usage.accumulate(&usage);
                        }
                    }

                    for part in &content {
                        if let Part::Thinking { thinking } = part {
                            tracing::info!(channel_id = %self.channel_id, thinking = %thinking, "model thinking");
                            if post_thinking {
                                let note = format!("*thinking*\n{thinking}");
                                self.enqueue_thread_post(
                                    &effects,
                                    ctx,
                                    &working,
                                    &thread_handles,
                                    note,
                                );
                            }
                        }
                    }

                    let text = text_of(&content);
                    if stop_reason == Some(StopReason::ToolUse) {
                        // intermediate text goes only to the thread
                        if !text.trim().is_empty() {
                            self.enqueue_thread_post(
                                &effects,
                                ctx,
                                &working,
                                &thread_handles,
                                text,
                            );
                        }
                    } else {
                        final_text = text;
                        final_stop = stop_reason;
                        final_error = error_message.clone();
                        saw_final = true;
                    }

                    run_messages.push(TranscriptMessage::Assistant {
                        content,
                        stop_reason,
                        usage,
                        error_message,
                    });
                }
                BackendEvent::AutoRetryStart {
                    attempt,
                    max_attempts,
                } => {
                    let note = format!("*Retrying ({attempt}/{max_attempts})...*");
                    self.enqueue_thread_post(&effects, ctx, &working, &thread_handles, note);
                }
                BackendEvent::AutoCompactionStart => {
                    tracing::debug!(channel_id = %self.channel_id, "auto compaction started");
                }
                BackendEvent::AutoCompactionEnd => {
                    tracing::debug!(channel_id = %self.channel_id, "auto compaction finished");
                }
            }
        }

        // every enqueued respond lands before the final replace
        effects.drain().await;

        let mut high_water = event.ts.clone();

        if self.state.stop_requested.load(Ordering::SeqCst)
            || final_stop == Some(StopReason::Aborted)
        {
            ctx.replace_message(&working, "*Stopped*").await.ok();
        } else if final_error.is_some() || final_stop == Some(StopReason::Error) {
            ctx.replace_message(&working, "*Sorry, something went wrong*")
                .await
                .ok();
            let details = final_error.unwrap_or_else(|| "backend error".to_string());
            ctx.respond_in_thread(&working, &format!("*Error: {details}*"))
                .await
                .ok();
        } else if is_silent(&final_text) {
            // nothing stays visible
            ctx.delete_message(&working).await.ok();
            for handle in thread_handles.lock().await.iter() {
                ctx.delete_message(handle).await.ok();
            }
        } else if !saw_final || final_text.trim().is_empty() {
            // no-op final (empty content, no stop reason): leave nothing
            ctx.delete_message(&working).await.ok();
        } else {
            let parts = split_final(&final_text);
            let mut parts = parts.into_iter();
            if let Some(first) = parts.next() {
                ctx.replace_message(&working, &first).await.ok();
            }
            for part in parts {
                ctx.respond(&part).await.ok();
            }
            ctx.respond_in_thread(&working, &final_text).await.ok();

            if let Some(ts) = self.log_bot_message(&final_text).await {
                high_water = ts;
            }
        }

        if !is_silent(&final_text) {
            self.post_usage_summary(ctx, &working, &run_usage, &transcript, &run_messages)
                .await;
        }

        {
            let mut accumulated = self.state.accumulated_usage.lock().await;
            accumulated.accumulate(&run_usage);
        }

        transcript.extend(run_messages);
        self.session.save(Some(&high_water), &transcript).await?;

        Ok(())
    }

    fn enqueue_thread_post(
        &self,
        effects: &SideEffects,
        ctx: &Context,
        working: &MessageHandle,
        thread_handles: &Arc<Mutex<Vec<MessageHandle>>>,
        text: String,
    ) {
        let transport = ctx.transport.clone();
        let parent = working.clone();
        let handles = thread_handles.clone();
        effects.enqueue(Box::pin(async move {
            let handle = transport.post_in_thread(&parent, &text).await?;
            handles.lock().await.push(handle);
            Ok(())
        }));
    }

    /// Read image attachments that the download queue already fetched.
    async fn load_attached_images(&self, event: &InboundEvent) -> Vec<Part> {
        let mut images = Vec::new();
        for file in &event.files {
            let sanitized = crate::store::sanitize_filename(&file.name);
            let mime = match sanitized.rsplit('.').next().map(str::to_ascii_lowercase) {
                Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
                Some(ext) if ext == "png" => "image/png",
                Some(ext) if ext == "gif" => "image/gif",
                Some(ext) if ext == "webp" => "image/webp",
                _ => continue,
            };
            let local = self
                .deps
                .store
                .workspace()
                .join(self.channel_id.as_ref())
                .join("attachments")
                .join(format!("{}_{sanitized}", event.ts));
            match tokio::fs::read(&local).await {
                Ok(bytes) => images.push(Part::Image {
                    mime_type: mime.to_string(),
                    data: base64::engine::general_purpose::STANDARD.encode(bytes),
                }),
                Err(error) => {
                    tracing::debug!(
                        channel_id = %self.channel_id,
                        file = %file.name,
                        %error,
                        "attachment not available yet, prompting without it"
                    );
                }
            }
        }
        images
    }

    /// Commit the bot's reply to `log.jsonl`. Returns the entry's ts so the
    /// sync high-water mark can move past it (the reply is already in the
    /// transcript; re-materializing it would duplicate).
    async fn log_bot_message(&self, text: &str) -> Option<String> {
        let now = Utc::now();
        let entry = LogEntry {
            date: now,
            ts: now.timestamp_micros().to_string(),
            user: "mother".to_string(),
            user_name: None,
            display_name: None,
            text: text.to_string(),
            attachments: Vec::new(),
            is_bot: true,
        };
        match self.deps.store.append(&self.channel_id, &entry).await {
            Ok(_) => Some(entry.ts),
            Err(error) => {
                tracing::warn!(channel_id = %self.channel_id, %error, "failed to log bot response");
                None
            }
        }
    }

    async fn post_usage_summary(
        &self,
        ctx: &Context,
        working: &MessageHandle,
        usage: &Usage,
        transcript: &[TranscriptMessage],
        run_messages: &[TranscriptMessage],
    ) {
        let info = self.deps.models.get(&self.deps.model_id);
        let cost = self.deps.models.cost(&self.deps.model_id, usage);
        if cost <= 0.0 && info.provider != "local" {
            return;
        }

        let tail_tokens = estimate_tokens(transcript) + estimate_tokens(run_messages);
        let ratio = tail_tokens as f64 / info.context_window as f64 * 100.0;
        let summary = format!(
            "Usage: {} in / {} out / {} cache read / {} cache write, ${cost:.4}\nContext tail: ~{tail_tokens} tokens ({ratio:.1}% of {})",
            usage.input, usage.output, usage.cache_read, usage.cache_write, info.context_window,
        );
        ctx.respond_in_thread(working, &summary).await.ok();
    }
}

/// Ordered, unbounded, single-consumer chain of fallible async side
/// effects. Errors become thread posts; the chain is drained before the
/// run returns.
struct SideEffects {
    tx: Option<mpsc::UnboundedSender<BoxFuture<'static, anyhow::Result<()>>>>,
    worker: tokio::task::JoinHandle<()>,
}

impl SideEffects {
    fn start(transport: Arc<dyn ChatTransport>, working: MessageHandle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, anyhow::Result<()>>>();
        let worker = tokio::spawn(async move {
            while let Some(effect) = rx.recv().await {
                if let Err(error) = effect.await {
                    tracing::warn!(%error, "queued side effect failed");
                    let _ = transport
                        .post_in_thread(&working, &format!("*Error: {error}*"))
                        .await;
                }
            }
        });
        Self {
            tx: Some(tx),
            worker,
        }
    }

    fn enqueue(&self, effect: BoxFuture<'static, anyhow::Result<()>>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(effect);
        }
    }

    async fn drain(mut self) {
        self.tx.take();
        let _ = self.worker.await;
    }
}

fn text_of(content: &[Part]) -> String {
    content
        .iter()
        .filter_map(|part| match part {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// A final reply of exactly `[SILENT]` (at the head) removes everything.
fn is_silent(text: &str) -> bool {
    text.trim_start().starts_with("[SILENT]")
}

/// Split final text at `FINAL_SPLIT − SPLIT_MARGIN` boundaries with
/// continuation suffixes between parts.
fn split_final(text: &str) -> Vec<String> {
    let chunks = crate::transport::split_message(text, FINAL_SPLIT - SPLIT_MARGIN);
    let count = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            if index + 1 < count {
                format!("{chunk}\n*(continued {}...)*", index + 2)
            } else {
                chunk
            }
        })
        .collect()
}

fn sample_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Rough tail size: serialized bytes over four.
fn estimate_tokens(messages: &[TranscriptMessage]) -> u64 {
    messages
        .iter()
        .map(|message| {
            serde_json::to_string(message)
                .map(|line| line.len() as u64)
                .unwrap_or(0)
        })
        .sum::<u64>()
        / 4
}

/// Thread summary for one finished tool call.
fn tool_summary(pending: Option<&PendingTool>, is_error: bool, result: &ToolResult) -> String {
    let status = if is_error { "X" } else { "OK" };
    let (name, label, secs, args) = match pending {
        Some(pending) => (
            pending.tool_name.as_str(),
            tools::label_of(&pending.tool_name, &pending.args),
            pending.started_at.elapsed().as_secs(),
            serde_json::to_string_pretty(&pending.args).unwrap_or_default(),
        ),
        None => ("tool", "tool".to_string(), 0, String::new()),
    };
    let (result_text, _) = truncate_tail(&result.as_text(), THREAD_FENCE_LINES, THREAD_FENCE_BYTES);
    format!("{status} {name}: {label} ({secs}s)\n```json\n{args}\n```\n```\n{result_text}\n```")
}
