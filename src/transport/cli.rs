//! Stdin/stdout transport for `--cli` mode.
//!
//! Drives the same orchestrator as Discord with a fixed synthetic channel.
//! Posts render as prefixed lines; edits re-print with the message id so a
//! scrollback reader can follow the working indicator.

use crate::error::Result;
use crate::transport::{ChatTransport, InboundReceiver};
use crate::{InboundEvent, MessageHandle};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::sync::mpsc;

/// The synthetic channel id used by CLI mode.
pub const CLI_CHANNEL_ID: &str = "cli";

pub struct CliTransport {
    next_id: AtomicU64,
}

impl CliTransport {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Spawn the stdin reader and return the inbound event stream.
    pub fn start(&self) -> InboundReceiver {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut counter: u64 = 0;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let text = line.trim().to_string();
                        if text.is_empty() {
                            continue;
                        }
                        counter += 1;
                        let now = chrono::Utc::now();
                        let event = InboundEvent {
                            channel_id: Arc::from(CLI_CHANNEL_ID),
                            ts: format!("{}-{counter}", now.timestamp_millis()),
                            user_id: "local".to_string(),
                            user_name: Some("local".to_string()),
                            display_name: None,
                            text,
                            files: Vec::new(),
                            timestamp: now,
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        tracing::warn!(%error, "stdin read failed");
                        break;
                    }
                }
            }
        });
        rx
    }

    fn handle(&self, channel_id: &str) -> MessageHandle {
        MessageHandle {
            channel_id: channel_id.to_string(),
            message_id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for CliTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for CliTransport {
    async fn post_message(&self, channel_id: &str, text: &str) -> Result<MessageHandle> {
        let handle = self.handle(channel_id);
        println!("[bot #{}] {}", handle.message_id, text);
        Ok(handle)
    }

    async fn update_message(&self, handle: &MessageHandle, text: &str) -> Result<()> {
        println!("[bot #{} edit] {}", handle.message_id, text);
        Ok(())
    }

    async fn delete_message(&self, handle: &MessageHandle) -> Result<()> {
        println!("[bot #{} deleted]", handle.message_id);
        Ok(())
    }

    async fn post_in_thread(&self, parent: &MessageHandle, text: &str) -> Result<MessageHandle> {
        let handle = self.handle(&parent.channel_id);
        println!("[thread of #{}] {}", parent.message_id, text);
        Ok(handle)
    }

    async fn upload_file(&self, _channel_id: &str, path: &Path, title: Option<&str>) -> Result<()> {
        match title {
            Some(title) => println!("[upload] {} ({title})", path.display()),
            None => println!("[upload] {}", path.display()),
        }
        Ok(())
    }

    async fn set_typing(&self, _channel_id: &str, _typing: bool) -> Result<()> {
        Ok(())
    }
}
