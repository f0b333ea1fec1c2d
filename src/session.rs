//! Bridges the human-readable channel log and the model transcript.
//!
//! `context.jsonl` mirrors the transcript one message per line, headed by a
//! meta line recording the sync high-water `ts`. On every run start the
//! session appends log entries newer than the high-water mark, then trims
//! the transcript to the last [`MAX_TURNS`] logical turns.

use crate::ChannelId;
use crate::error::Result;
use crate::llm::{ContextWindowSnapshot, Role, TranscriptMessage};
use crate::store::LogEntry;
use anyhow::Context as _;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Transcript turns kept after trimming.
pub const MAX_TURNS: usize = 10;

/// Characters of the last dropped user message sampled into the trim notice.
const TOPIC_SAMPLE_CHARS: usize = 100;

/// High-water record at the head of `context.jsonl`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_ts: Option<String>,
}

/// Per-channel transcript persistence.
pub struct SessionContext {
    workspace: PathBuf,
    channel_id: ChannelId,
}

impl SessionContext {
    pub fn new(workspace: PathBuf, channel_id: ChannelId) -> Self {
        Self {
            workspace,
            channel_id,
        }
    }

    fn context_path(&self) -> PathBuf {
        self.workspace
            .join(self.channel_id.as_ref())
            .join("context.jsonl")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.workspace
            .join(self.channel_id.as_ref())
            .join("last_prompt.jsonl")
    }

    /// Load the persisted transcript and its high-water ts.
    pub async fn load(&self) -> Result<(Option<String>, Vec<TranscriptMessage>)> {
        let path = self.context_path();
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok((None, Vec::new()));
            }
            Err(error) => return Err(error.into()),
        };

        let mut last_ts = None;
        let mut transcript = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            if index == 0 {
                if let Ok(meta) = serde_json::from_str::<Meta>(line) {
                    if meta.last_ts.is_some() {
                        last_ts = meta.last_ts;
                        continue;
                    }
                }
            }
            match serde_json::from_str::<TranscriptMessage>(line) {
                Ok(message) => transcript.push(message),
                Err(error) => {
                    tracing::warn!(
                        channel_id = %self.channel_id,
                        line = index + 1,
                        %error,
                        "skipping bad transcript line"
                    );
                }
            }
        }
        Ok((last_ts, transcript))
    }

    /// Persist the transcript, replacing the previous mirror.
    pub async fn save(
        &self,
        last_ts: Option<&str>,
        transcript: &[TranscriptMessage],
    ) -> Result<()> {
        let mut out = String::new();
        let meta = Meta {
            last_ts: last_ts.map(str::to_string),
        };
        out.push_str(&serde_json::to_string(&meta)?);
        out.push('\n');
        for message in transcript {
            out.push_str(&serde_json::to_string(message)?);
            out.push('\n');
        }
        let path = self.context_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(&path, out)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Overwrite the diagnostic prompt snapshot.
    pub async fn write_snapshot(&self, snapshot: &ContextWindowSnapshot<'_>) -> Result<()> {
        let line = serde_json::to_string(snapshot)?;
        tokio::fs::write(self.snapshot_path(), line).await.ok();
        Ok(())
    }
}

/// `a` strictly newer than `b`? Snowflakes compare numerically, anything
/// else lexicographically.
pub fn ts_newer(a: &str, b: &str) -> bool {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(a), Ok(b)) => a > b,
        _ => a > b,
    }
}

/// Render a log entry as the model-facing user line:
/// `[<RFC3339> @<local-offset>] [<userName>]: <text>`.
pub fn format_user_line(entry: &LogEntry) -> String {
    let local = entry.date.with_timezone(&chrono::Local);
    let name = entry
        .user_name
        .as_deref()
        .or(entry.display_name.as_deref())
        .unwrap_or(&entry.user);
    format!(
        "[{} @{}] [{}]: {}",
        local.to_rfc3339_opts(SecondsFormat::Secs, true),
        local.format("%:z"),
        name,
        entry.text
    )
}

/// Strip the timestamp-and-username header off a formatted user line.
pub fn strip_user_header(text: &str) -> &str {
    let Some(rest) = text.strip_prefix('[') else {
        return text;
    };
    let Some(close) = rest.find("] [") else {
        return text;
    };
    let after_name = &rest[close + 3..];
    match after_name.find("]: ") {
        Some(end) => &after_name[end + 3..],
        None => text,
    }
}

/// Materialize log entries newer than `last_ts` (and at or before
/// `up_to_ts`) as transcript messages. Assistant-authored lines become
/// plain assistant text messages.
pub fn materialize_entries(
    entries: &[LogEntry],
    last_ts: Option<&str>,
    up_to_ts: &str,
) -> Vec<TranscriptMessage> {
    entries
        .iter()
        .filter(|entry| match last_ts {
            Some(last) => ts_newer(&entry.ts, last),
            None => true,
        })
        .filter(|entry| !ts_newer(&entry.ts, up_to_ts))
        .map(|entry| {
            if entry.is_bot {
                TranscriptMessage::assistant_text(entry.text.clone())
            } else {
                TranscriptMessage::user(format_user_line(entry))
            }
        })
        .collect()
}

/// Partition a transcript into logical turns: each turn begins with a user
/// message and runs until the next one. Leading non-user messages form
/// their own head group.
pub fn partition_turns(transcript: &[TranscriptMessage]) -> Vec<Vec<TranscriptMessage>> {
    let mut turns: Vec<Vec<TranscriptMessage>> = Vec::new();
    for message in transcript {
        let starts_turn = message.role() == Role::User;
        if starts_turn || turns.is_empty() {
            turns.push(vec![message.clone()]);
        } else {
            turns
                .last_mut()
                .expect("turns is non-empty here")
                .push(message.clone());
        }
    }
    turns
}

/// Keep the last [`MAX_TURNS`] turns. When anything is dropped, a synthetic
/// user message records the last dropped topic.
pub fn trim_turns(transcript: Vec<TranscriptMessage>) -> Vec<TranscriptMessage> {
    let turns = partition_turns(&transcript);
    if turns.len() <= MAX_TURNS {
        return transcript;
    }

    let split = turns.len() - MAX_TURNS;
    let (dropped, kept) = turns.split_at(split);

    let topic = dropped
        .iter()
        .rev()
        .flat_map(|turn| turn.iter().rev())
        .find_map(|message| match message {
            TranscriptMessage::User { content } => Some(content.as_text()),
            _ => None,
        })
        .map(|text| sample_chars(strip_user_header(&text), TOPIC_SAMPLE_CHARS))
        .unwrap_or_default();

    let mut trimmed = vec![TranscriptMessage::user(format!(
        "[Prior context trimmed. Last topic before trim: {topic}]"
    ))];
    trimmed.extend(kept.iter().flatten().cloned());
    trimmed
}

fn sample_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{StopReason, ToolResult, UserContent};
    use chrono::Utc;

    fn user(text: &str) -> TranscriptMessage {
        TranscriptMessage::user(text)
    }

    fn assistant(text: &str) -> TranscriptMessage {
        TranscriptMessage::assistant_text(text)
    }

    fn tool(id: &str) -> TranscriptMessage {
        TranscriptMessage::Tool {
            tool_call_id: id.to_string(),
            result: ToolResult::text("ok"),
        }
    }

    fn entry(ts: &str, text: &str, is_bot: bool) -> LogEntry {
        LogEntry {
            date: Utc::now(),
            ts: ts.to_string(),
            user: "u1".to_string(),
            user_name: Some("alice".to_string()),
            display_name: None,
            text: text.to_string(),
            attachments: Vec::new(),
            is_bot,
        }
    }

    #[test]
    fn test_ts_ordering() {
        assert!(ts_newer("101", "100"));
        assert!(!ts_newer("100", "100"));
        // snowflakes of different digit counts compare numerically
        assert!(ts_newer("1000000000000000000", "999999999999999999"));
    }

    #[test]
    fn test_partition_turns() {
        let transcript = vec![
            user("a"),
            assistant("ra"),
            tool("t1"),
            user("b"),
            assistant("rb"),
        ];
        let turns = partition_turns(&transcript);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].len(), 3);
        assert_eq!(turns[1].len(), 2);
    }

    #[test]
    fn test_trim_noop_at_or_under_limit() {
        let mut transcript = Vec::new();
        for i in 0..MAX_TURNS {
            transcript.push(user(&format!("q{i}")));
            transcript.push(assistant(&format!("a{i}")));
        }
        let trimmed = trim_turns(transcript.clone());
        assert_eq!(trimmed, transcript);
    }

    #[test]
    fn test_trim_keeps_last_ten_turns_with_notice() {
        let mut transcript = Vec::new();
        for i in 0..15 {
            transcript.push(user(&format!(
                "[2026-08-01T10:00:00Z @+00:00] [alice]: question number {i}"
            )));
            transcript.push(assistant(&format!("answer {i}")));
        }
        let trimmed = trim_turns(transcript);

        // one synthetic notice, then exactly MAX_TURNS real turns
        match &trimmed[0] {
            TranscriptMessage::User { content } => {
                let text = content.as_text();
                assert!(text.starts_with("[Prior context trimmed."));
                // header is stripped before sampling
                assert!(text.contains("question number 4"));
                assert!(!text.contains("alice"));
            }
            other => panic!("expected synthetic user message, got {other:?}"),
        }
        let real = &trimmed[1..];
        assert_eq!(partition_turns(real).len(), MAX_TURNS);
        match &real[0] {
            TranscriptMessage::User { content } => {
                assert!(content.as_text().contains("question number 5"));
            }
            other => panic!("expected user message, got {other:?}"),
        }
    }

    #[test]
    fn test_trim_topic_sample_is_capped() {
        let mut transcript = Vec::new();
        let long = "x".repeat(500);
        for _ in 0..12 {
            transcript.push(user(&long));
            transcript.push(assistant("a"));
        }
        let trimmed = trim_turns(transcript);
        let TranscriptMessage::User { content } = &trimmed[0] else {
            panic!("expected user message");
        };
        let notice = content.as_text();
        let sample_len = notice
            .strip_prefix("[Prior context trimmed. Last topic before trim: ")
            .and_then(|rest| rest.strip_suffix(']'))
            .map(|sample| sample.chars().count())
            .unwrap();
        assert_eq!(sample_len, 100);
    }

    #[test]
    fn test_strip_user_header() {
        assert_eq!(
            strip_user_header("[2026-08-01T10:00:00Z @+00:00] [alice]: hi there"),
            "hi there"
        );
        assert_eq!(strip_user_header("no header"), "no header");
        assert_eq!(strip_user_header("[odd"), "[odd");
    }

    #[test]
    fn test_materialize_entries_respects_high_water() {
        let entries = vec![
            entry("100", "old", false),
            entry("101", "reply", true),
            entry("102", "new question", false),
            entry("103", "future", false),
        ];
        let messages = materialize_entries(&entries, Some("100"), "102");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role(), Role::Assistant);
        match &messages[1] {
            TranscriptMessage::User { content } => {
                let text = content.as_text();
                assert!(text.ends_with("new question"));
                assert!(text.contains("[alice]:"));
            }
            other => panic!("expected user message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionContext::new(dir.path().to_path_buf(), Arc::from("c1"));
        let transcript = vec![user("hello"), assistant("hi")];
        session.save(Some("123"), &transcript).await.unwrap();

        let (last_ts, loaded) = session.load().await.unwrap();
        assert_eq!(last_ts.as_deref(), Some("123"));
        assert_eq!(loaded, transcript);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionContext::new(dir.path().to_path_buf(), Arc::from("c1"));
        let (last_ts, loaded) = session.load().await.unwrap();
        assert!(last_ts.is_none());
        assert!(loaded.is_empty());
    }

    use std::sync::Arc;

    #[test]
    fn test_user_content_kept_through_trim() {
        // parts-based user content still counts as a turn head
        let transcript = vec![
            TranscriptMessage::User {
                content: UserContent::Parts(vec![crate::llm::Part::text("with image")]),
            },
            TranscriptMessage::Assistant {
                content: vec![crate::llm::Part::text("seen")],
                stop_reason: Some(StopReason::EndTurn),
                usage: None,
                error_message: None,
            },
        ];
        assert_eq!(partition_turns(&transcript).len(), 1);
    }
}
