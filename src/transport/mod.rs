//! Chat transport capability and its adapters.
//!
//! The core depends on this narrow surface only; the adapters own
//! rate-limiting (at least one second between edits of a given message) and
//! retries of transient HTTP failures.

pub mod cli;
pub mod discord;

pub use cli::CliTransport;
pub use discord::DiscordTransport;

use crate::error::Result;
use crate::{InboundEvent, MessageHandle};
use async_trait::async_trait;
use std::path::Path;

/// Everything the bot needs from the chat system.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn post_message(&self, channel_id: &str, text: &str) -> Result<MessageHandle>;
    async fn update_message(&self, handle: &MessageHandle, text: &str) -> Result<()>;
    async fn delete_message(&self, handle: &MessageHandle) -> Result<()>;
    /// Post under `parent`, creating the thread on first use.
    async fn post_in_thread(&self, parent: &MessageHandle, text: &str) -> Result<MessageHandle>;
    async fn upload_file(&self, channel_id: &str, path: &Path, title: Option<&str>) -> Result<()>;
    async fn set_typing(&self, channel_id: &str, typing: bool) -> Result<()>;
}

/// Inbound event stream handed to the orchestrator at startup.
pub type InboundReceiver = tokio::sync::mpsc::Receiver<InboundEvent>;

/// Split text into chunks no longer than `max` characters, on char
/// boundaries, preferring newlines.
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    if text.len() <= max {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > max {
        let mut cut = max;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        // prefer breaking on the last newline inside the window
        let window = &rest[..cut];
        if let Some(newline) = window.rfind('\n') {
            if newline > 0 {
                cut = newline;
            }
        }
        chunks.push(rest[..cut].to_string());
        rest = rest[cut..].trim_start_matches('\n');
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_message_short_untouched() {
        assert_eq!(split_message("hello", 100), vec!["hello".to_string()]);
    }

    #[test]
    fn test_split_message_prefers_newlines() {
        let text = format!("{}\n{}", "a".repeat(80), "b".repeat(80));
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(80));
        assert_eq!(chunks[1], "b".repeat(80));
    }

    #[test]
    fn test_split_message_hard_cut_without_newlines() {
        let text = "x".repeat(250);
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|chunk| chunk.len() <= 100));
        assert_eq!(chunks.concat(), text);
    }
}
