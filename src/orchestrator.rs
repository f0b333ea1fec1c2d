//! Top-level routing: inbound messages, the stop protocol, and scheduler
//! firings, all funneled into per-channel serial queues.

use crate::agent::{AgentRunner, Context, RunnerDeps};
use crate::queue::ChannelQueue;
use crate::scheduler::EventSink;
use crate::store::{Attachment, DownloadRequest, LogEntry};
use crate::{ChannelId, InboundEvent};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The user command that aborts an active run.
const STOP_COMMAND: &str = "stop";

pub struct Orchestrator {
    deps: RunnerDeps,
    runners: Mutex<HashMap<String, Arc<AgentRunner>>>,
    queues: Mutex<HashMap<String, Arc<ChannelQueue>>>,
    started_at: DateTime<Utc>,
    /// Bot user id, for stripping mention tokens. Set once the gateway is up.
    bot_user_id: Mutex<Option<String>>,
}

impl Orchestrator {
    pub fn new(deps: RunnerDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            runners: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            started_at: Utc::now(),
            bot_user_id: Mutex::new(None),
        })
    }

    pub async fn set_bot_user_id(&self, id: Option<String>) {
        *self.bot_user_id.lock().await = id;
    }

    async fn runner(&self, channel_id: &ChannelId) -> Arc<AgentRunner> {
        let mut runners = self.runners.lock().await;
        runners
            .entry(channel_id.to_string())
            .or_insert_with(|| {
                Arc::new(AgentRunner::new(channel_id.clone(), self.deps.clone()))
            })
            .clone()
    }

    async fn queue(&self, channel_id: &ChannelId) -> Arc<ChannelQueue> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(channel_id.to_string())
            .or_insert_with(|| ChannelQueue::new(channel_id.clone()))
            .clone()
    }

    /// Handle one inbound chat message.
    #[tracing::instrument(skip(self, event), fields(channel_id = %event.channel_id, ts = %event.ts))]
    pub async fn handle_inbound(self: &Arc<Self>, mut event: InboundEvent) {
        let bot_id = self.bot_user_id.lock().await.clone();
        event.text = strip_mention(&event.text, bot_id.as_deref());

        let attachments: Vec<Attachment> = event
            .files
            .iter()
            .map(|file| Attachment {
                original: file.name.clone(),
                local: format!(
                    "{}/attachments/{}_{}",
                    event.channel_id,
                    event.ts,
                    crate::store::sanitize_filename(&file.name)
                ),
            })
            .collect();

        let entry = LogEntry {
            date: event.timestamp,
            ts: event.ts.clone(),
            user: event.user_id.clone(),
            user_name: event.user_name.clone(),
            display_name: event.display_name.clone(),
            text: event.text.clone(),
            attachments: attachments.clone(),
            is_bot: false,
        };
        match self.deps.store.append(&event.channel_id, &entry).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(channel_id = %event.channel_id, ts = %event.ts, "duplicate inbound, ignoring");
                return;
            }
            Err(error) => {
                tracing::error!(channel_id = %event.channel_id, %error, "failed to log inbound message");
                return;
            }
        }

        let downloads: Vec<DownloadRequest> = attachments
            .iter()
            .zip(&event.files)
            .map(|(attachment, file)| DownloadRequest {
                channel_id: event.channel_id.to_string(),
                local: attachment.local.clone(),
                url: file.url.clone(),
            })
            .collect();
        if !downloads.is_empty() {
            self.deps.store.queue_downloads(downloads);
        }

        // messages from before this process started are logged but never
        // trigger a run
        if event.timestamp < self.started_at {
            tracing::debug!(channel_id = %event.channel_id, ts = %event.ts, "pre-startup message, not running");
            return;
        }

        let runner = self.runner(&event.channel_id).await;

        if event.text.trim().eq_ignore_ascii_case(STOP_COMMAND) {
            if runner.state.is_running() {
                runner.state.abort().await;
                let confirmation = self
                    .deps
                    .transport
                    .post_message(&event.channel_id, "*Stopping...*")
                    .await
                    .ok();
                *runner.state.stop_confirmation.lock().await = confirmation;
            } else {
                self.deps
                    .transport
                    .post_message(&event.channel_id, "*Nothing running*")
                    .await
                    .ok();
            }
            return;
        }

        if runner.state.is_running() {
            self.deps
                .transport
                .post_message(
                    &event.channel_id,
                    &format!("*Already working. Say {STOP_COMMAND} to cancel.*"),
                )
                .await
                .ok();
            return;
        }

        self.enqueue_run(runner, event).await;
    }

    /// Queue one run for a channel. Drops (with a warning from the queue)
    /// when the channel already has 5 pending items.
    async fn enqueue_run(self: &Arc<Self>, runner: Arc<AgentRunner>, event: InboundEvent) -> bool {
        let queue = self.queue(&event.channel_id).await;
        let ctx = Context {
            channel_id: event.channel_id.clone(),
            transport: self.deps.transport.clone(),
        };
        let channel_id = event.channel_id.clone();
        queue.enqueue(Box::pin(async move {
            if let Err(error) = runner.run(ctx, event).await {
                // a single run's failure never crosses channels or kills the
                // process; the next inbound message starts fresh
                tracing::error!(channel_id = %channel_id, %error, "run failed");
            }
        }))
    }

    /// Sink for the event scheduler: log the synthesized message and queue a
    /// run, reporting whether the channel queue accepted it.
    pub fn event_sink(self: &Arc<Self>) -> EventSink {
        let orchestrator = self.clone();
        Arc::new(move |channel_id: String, text: String| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                let now = Utc::now();
                let event = InboundEvent {
                    channel_id: Arc::from(channel_id.as_str()),
                    ts: format!("evt-{}", now.timestamp_millis()),
                    user_id: "scheduler".to_string(),
                    user_name: Some("scheduler".to_string()),
                    display_name: None,
                    text,
                    files: Vec::new(),
                    timestamp: now,
                };

                let entry = LogEntry {
                    date: event.timestamp,
                    ts: event.ts.clone(),
                    user: event.user_id.clone(),
                    user_name: event.user_name.clone(),
                    display_name: None,
                    text: event.text.clone(),
                    attachments: Vec::new(),
                    is_bot: false,
                };
                if let Err(error) = orchestrator
                    .deps
                    .store
                    .append(&event.channel_id, &entry)
                    .await
                {
                    tracing::error!(channel_id = %event.channel_id, %error, "failed to log event firing");
                }

                let runner = orchestrator.runner(&event.channel_id).await;
                orchestrator.enqueue_run(runner, event).await
            })
        })
    }
}

/// Remove the bot's mention tokens (`<@id>` / `<@!id>`) from message text.
fn strip_mention(text: &str, bot_user_id: Option<&str>) -> String {
    let stripped = match bot_user_id {
        Some(id) => {
            let pattern = format!("<@!?{}>", regex::escape(id));
            match regex::Regex::new(&pattern) {
                Ok(re) => re.replace_all(text, "").into_owned(),
                Err(_) => text.to_string(),
            }
        }
        None => text.to_string(),
    };
    stripped.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::guard::{CommandGuard, PathGuard};
    use crate::llm::models::ModelRegistry;
    use crate::llm::{BackendEvent, BackendStream, LLMBackend, PromptRequest, Role, StopReason};
    use crate::sandbox::Executor;
    use crate::store::ChannelStore;
    use crate::transport::ChatTransport;
    use crate::MessageHandle;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_strip_mention() {
        assert_eq!(strip_mention("<@123> hello", Some("123")), "hello");
        assert_eq!(strip_mention("<@!123> hi <@123>", Some("123")), "hi");
        // other users' mentions survive
        assert_eq!(strip_mention("<@999> hello", Some("123")), "<@999> hello");
        assert_eq!(strip_mention("plain", None), "plain");
    }

    /// Minimal transport double recording posted/updated text.
    #[derive(Default)]
    struct PostLog {
        next_id: AtomicU64,
        posts: std::sync::Mutex<Vec<String>>,
        updates: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ChatTransport for PostLog {
        async fn post_message(&self, channel_id: &str, text: &str) -> Result<MessageHandle> {
            self.posts.lock().unwrap().push(text.to_string());
            Ok(MessageHandle {
                channel_id: channel_id.to_string(),
                message_id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            })
        }

        async fn update_message(&self, _handle: &MessageHandle, text: &str) -> Result<()> {
            self.updates.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn delete_message(&self, _handle: &MessageHandle) -> Result<()> {
            Ok(())
        }

        async fn post_in_thread(
            &self,
            parent: &MessageHandle,
            _text: &str,
        ) -> Result<MessageHandle> {
            Ok(MessageHandle {
                channel_id: parent.channel_id.clone(),
                message_id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            })
        }

        async fn upload_file(
            &self,
            _channel_id: &str,
            _path: &std::path::Path,
            _title: Option<&str>,
        ) -> Result<()> {
            Ok(())
        }

        async fn set_typing(&self, _channel_id: &str, _typing: bool) -> Result<()> {
            Ok(())
        }
    }

    /// Backend that answers instantly unless cancelled first.
    struct SlowBackend;

    impl LLMBackend for SlowBackend {
        fn prompt(&self, _request: PromptRequest, cancel: CancellationToken) -> BackendStream {
            Box::pin(async_stream::stream! {
                tokio::select! {
                    () = cancel.cancelled() => {
                        yield BackendEvent::MessageEnd {
                            role: Role::Assistant,
                            content: vec![],
                            stop_reason: Some(StopReason::Aborted),
                            usage: None,
                            error_message: None,
                        };
                    }
                    () = tokio::time::sleep(Duration::from_secs(30)) => {
                        yield BackendEvent::MessageEnd {
                            role: Role::Assistant,
                            content: vec![crate::llm::Part::text("too late")],
                            stop_reason: Some(StopReason::EndTurn),
                            usage: None,
                            error_message: None,
                        };
                    }
                }
            })
        }
    }

    fn fixture(backend: Arc<dyn LLMBackend>) -> (tempfile::TempDir, Arc<Orchestrator>, Arc<PostLog>) {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().to_path_buf();
        let transport = Arc::new(PostLog::default());
        let deps = RunnerDeps {
            store: ChannelStore::new(workspace.clone(), reqwest::Client::new()),
            executor: Arc::new(Executor::host(workspace.clone())),
            path_guard: Arc::new(PathGuard::new(&workspace, &[])),
            command_guard: Arc::new(CommandGuard::default()),
            backend,
            transport: transport.clone(),
            models: Arc::new(ModelRegistry::builtin()),
            model_id: "claude-sonnet-4-20250514".to_string(),
            delegate_bin: None,
        };
        (dir, Orchestrator::new(deps), transport)
    }

    fn inbound(ts: &str, text: &str) -> InboundEvent {
        InboundEvent {
            channel_id: Arc::from("c1"),
            ts: ts.to_string(),
            user_id: "u1".to_string(),
            user_name: Some("alice".to_string()),
            display_name: None,
            text: text.to_string(),
            files: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_stop_with_nothing_running() {
        let (_dir, orchestrator, transport) = fixture(Arc::new(SlowBackend));
        orchestrator.handle_inbound(inbound("100", "stop")).await;
        assert_eq!(
            transport.posts.lock().unwrap().as_slice(),
            ["*Nothing running*"]
        );
    }

    #[tokio::test]
    async fn test_stop_aborts_active_run() {
        let (_dir, orchestrator, transport) = fixture(Arc::new(SlowBackend));
        orchestrator
            .handle_inbound(inbound("100", "long task"))
            .await;

        // wait for the run to pick up
        for _ in 0..50 {
            let runner = orchestrator.runner(&Arc::from("c1")).await;
            if runner.state.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        orchestrator.handle_inbound(inbound("101", "STOP")).await;

        // the run surrenders and the working indicator becomes *Stopped*
        for _ in 0..100 {
            if transport
                .updates
                .lock()
                .unwrap()
                .iter()
                .any(|text| text == "*Stopped*")
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let posts = transport.posts.lock().unwrap().clone();
        assert!(posts.iter().any(|text| text == "*Stopping...*"), "{posts:?}");
        let updates = transport.updates.lock().unwrap().clone();
        assert!(updates.iter().any(|text| text == "*Stopped*"), "{updates:?}");
    }

    #[tokio::test]
    async fn test_busy_channel_gets_already_working() {
        let (_dir, orchestrator, transport) = fixture(Arc::new(SlowBackend));
        orchestrator.handle_inbound(inbound("100", "task one")).await;

        for _ in 0..50 {
            let runner = orchestrator.runner(&Arc::from("c1")).await;
            if runner.state.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        orchestrator.handle_inbound(inbound("101", "task two")).await;
        let posts = transport.posts.lock().unwrap().clone();
        assert!(
            posts
                .iter()
                .any(|text| text.starts_with("*Already working.")),
            "{posts:?}"
        );
    }

    #[tokio::test]
    async fn test_duplicate_inbound_is_dropped() {
        let (_dir, orchestrator, transport) = fixture(Arc::new(SlowBackend));
        let mut old = inbound("100", "hello");
        // pre-startup: logged but never runs
        old.timestamp = Utc::now() - chrono::Duration::hours(1);
        orchestrator.handle_inbound(old.clone()).await;
        assert!(transport.posts.lock().unwrap().is_empty());

        // the same ts again inside the dedup window is ignored entirely
        orchestrator.handle_inbound(old).await;
        let entries = orchestrator.deps.store.entries("c1").await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_event_sink_logs_and_enqueues() {
        let (_dir, orchestrator, _transport) = fixture(Arc::new(SlowBackend));
        let sink = orchestrator.event_sink();
        let accepted = sink("c9".to_string(), "[EVENT:x.json:immediate:now] ping".to_string()).await;
        assert!(accepted);
        let entries = orchestrator.deps.store.entries("c9").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].text.starts_with("[EVENT:x.json:immediate:"));
    }
}
