//! Filesystem-backed event scheduler.
//!
//! Watches `<workspace>/events/` for JSON event files and runs a 60-second
//! tick loop. Three firing modes: immediate (on first observation),
//! one-shot (at a timestamp with offset), periodic (5-field cron evaluated
//! in the event's IANA timezone, at most once per minute per file).
//! Firings enqueue synthesized messages into the channel queues; a full
//! queue drops the firing with a warning.

use crate::error::Result;
use anyhow::Context as _;
use chrono::{DateTime, FixedOffset, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use futures::future::BoxFuture;
use notify::Watcher as _;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// Accepts a synthesized event message for a channel; returns whether the
/// channel queue took it.
pub type EventSink = Arc<dyn Fn(String, String) -> BoxFuture<'static, bool> + Send + Sync>;

/// One event file in `<workspace>/events/`. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSpec {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub channel_id: String,
    pub text: String,
    /// One-shot firing time; must carry a UTC offset.
    #[serde(default)]
    pub at: Option<DateTime<FixedOffset>>,
    /// 5-field cron expression for periodic events.
    #[serde(default)]
    pub schedule: Option<String>,
    /// IANA timezone name for cron evaluation (default UTC).
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Immediate,
    OneShot,
    Periodic,
}

#[derive(Default)]
struct SchedState {
    /// Immediate/one-shot files already fired (at-most-once even when the
    /// file deletion fails).
    fired: HashSet<String>,
    /// Minute-of-epoch of the last firing per periodic file.
    last_fired_minute: HashMap<String, i64>,
    /// Files already warned about, to keep tick logs quiet.
    warned: HashSet<String>,
}

pub struct EventScheduler {
    events_dir: PathBuf,
    sink: EventSink,
    state: Mutex<SchedState>,
}

impl EventScheduler {
    pub fn new(workspace: &Path, sink: EventSink) -> Arc<Self> {
        Arc::new(Self {
            events_dir: workspace.join("events"),
            sink,
            state: Mutex::new(SchedState::default()),
        })
    }

    /// Run the watcher and tick loop until the process exits.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tokio::fs::create_dir_all(&self.events_dir)
            .await
            .context("failed to create events directory")?;

        // notify delivers on its own thread; the unbounded sender forwards
        // into the async loop without blocking it
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                if let Ok(event) = result {
                    if matches!(event.kind, notify::EventKind::Create(_)) {
                        let _ = notify_tx.send(());
                    }
                }
            })
            .context("failed to create events watcher")?;
        watcher
            .watch(&self.events_dir, notify::RecursiveMode::NonRecursive)
            .context("failed to watch events directory")?;

        let mut tick = tokio::time::interval(Duration::from_secs(60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(dir = %self.events_dir.display(), "event scheduler started");
        loop {
            tokio::select! {
                _ = tick.tick() => self.scan(Utc::now()).await,
                Some(()) = notify_rx.recv() => self.scan(Utc::now()).await,
            }
        }
    }

    /// One pass over the events directory.
    async fn scan(&self, now: DateTime<Utc>) {
        let mut read = match tokio::fs::read_dir(&self.events_dir).await {
            Ok(read) => read,
            Err(error) => {
                tracing::warn!(%error, "failed to read events directory");
                return;
            }
        };

        while let Ok(Some(entry)) = read.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let name = name.to_string();

            let spec = match tokio::fs::read_to_string(&path).await {
                Ok(text) => match serde_json::from_str::<EventSpec>(&text) {
                    Ok(spec) => spec,
                    Err(error) => {
                        self.warn_once(&name, &format!("invalid event file: {error}")).await;
                        continue;
                    }
                },
                Err(error) => {
                    tracing::warn!(event = %name, %error, "failed to read event file");
                    continue;
                }
            };

            self.process(&name, &path, &spec, now).await;
        }
    }

    async fn process(&self, name: &str, path: &Path, spec: &EventSpec, now: DateTime<Utc>) {
        match spec.kind {
            EventKind::Immediate => {
                if self.already_fired(name).await {
                    return;
                }
                let text = format!(
                    "[EVENT:{name}:immediate:{}] {}",
                    now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    spec.text
                );
                self.fire_once(name, path, &spec.channel_id, text).await;
            }
            EventKind::OneShot => {
                let Some(at) = spec.at else {
                    self.warn_once(name, "one-shot event has no 'at' timestamp").await;
                    return;
                };
                if self.already_fired(name).await {
                    return;
                }
                // past timestamps fire immediately; future ones wait for
                // the tick that reaches them (±1 minute precision)
                if at.with_timezone(&Utc) > now {
                    return;
                }
                let text = format!("[EVENT:{name}:one-shot:{}] {}", at.to_rfc3339(), spec.text);
                self.fire_once(name, path, &spec.channel_id, text).await;
            }
            EventKind::Periodic => {
                let Some(schedule) = spec.schedule.as_deref() else {
                    self.warn_once(name, "periodic event has no 'schedule'").await;
                    return;
                };
                let last = {
                    let state = self.state.lock().await;
                    state.last_fired_minute.get(name).copied()
                };
                let due = match periodic_due(schedule, spec.timezone.as_deref(), now, last) {
                    Ok(due) => due,
                    Err(reason) => {
                        self.warn_once(name, &reason).await;
                        return;
                    }
                };
                let Some((minute, local_iso)) = due else {
                    return;
                };
                let text = format!("[EVENT:{name}:periodic:{local_iso}] {}", spec.text);
                let accepted = (self.sink)(spec.channel_id.clone(), text).await;
                if !accepted {
                    tracing::warn!(event = %name, channel_id = %spec.channel_id, "channel queue rejected periodic firing");
                }
                let mut state = self.state.lock().await;
                state.last_fired_minute.insert(name.to_string(), minute);
            }
        }
    }

    async fn already_fired(&self, name: &str) -> bool {
        self.state.lock().await.fired.contains(name)
    }

    /// Fire an immediate/one-shot event and delete its file.
    async fn fire_once(&self, name: &str, path: &Path, channel_id: &str, text: String) {
        {
            let mut state = self.state.lock().await;
            if !state.fired.insert(name.to_string()) {
                return;
            }
        }

        let accepted = (self.sink)(channel_id.to_string(), text).await;
        if !accepted {
            tracing::warn!(event = %name, channel_id, "channel queue rejected event firing");
        }

        if let Err(error) = tokio::fs::remove_file(path).await {
            tracing::warn!(event = %name, %error, "failed to delete fired event file");
        } else {
            tracing::info!(event = %name, channel_id, "event fired");
        }
    }

    async fn warn_once(&self, name: &str, reason: &str) {
        let mut state = self.state.lock().await;
        if state.warned.insert(name.to_string()) {
            tracing::warn!(event = %name, reason, "skipping event file");
        }
    }
}

/// Evaluate a 5-field cron expression against the current minute in the
/// given timezone. Returns the minute-of-epoch key and local ISO time when
/// the event is due and has not fired this minute.
fn periodic_due(
    schedule: &str,
    timezone: Option<&str>,
    now: DateTime<Utc>,
    last_fired_minute: Option<i64>,
) -> std::result::Result<Option<(i64, String)>, String> {
    // the cron crate wants a seconds field; pin it to 0
    let expression = format!("0 {}", schedule.trim());
    let schedule = Schedule::from_str(&expression)
        .map_err(|error| format!("invalid cron expression: {error}"))?;

    let tz: Tz = match timezone {
        Some(name) => name
            .parse()
            .map_err(|_| format!("invalid timezone: {name}"))?,
        None => chrono_tz::UTC,
    };

    let local = now.with_timezone(&tz);
    let minute = local
        .with_second(0)
        .and_then(|dt| dt.with_nanosecond(0))
        .unwrap_or(local);

    let minute_key = now.timestamp() / 60;
    if last_fired_minute == Some(minute_key) {
        return Ok(None);
    }
    if !schedule.includes(minute) {
        return Ok(None);
    }
    Ok(Some((minute_key, minute.to_rfc3339())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 30).unwrap()
    }

    #[test]
    fn test_event_spec_parsing() {
        let spec: EventSpec = serde_json::from_str(
            r#"{"type": "one-shot", "channelId": "c1", "text": "ping",
                "at": "2026-08-01T09:00:00+02:00", "ignored": true}"#,
        )
        .unwrap();
        assert_eq!(spec.kind, EventKind::OneShot);
        assert_eq!(spec.channel_id, "c1");
        assert!(spec.at.is_some());

        let periodic: EventSpec = serde_json::from_str(
            r#"{"type": "periodic", "channelId": "c1", "text": "daily",
                "schedule": "0 9 * * *", "timezone": "Europe/Stockholm"}"#,
        )
        .unwrap();
        assert_eq!(periodic.kind, EventKind::Periodic);
        assert_eq!(periodic.schedule.as_deref(), Some("0 9 * * *"));
    }

    #[test]
    fn test_event_spec_rejects_missing_offset() {
        let result = serde_json::from_str::<EventSpec>(
            r#"{"type": "one-shot", "channelId": "c1", "text": "x", "at": "2026-08-01T09:00:00"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_periodic_due_matches_minute_in_timezone() {
        // 07:00 UTC is 09:00 in Stockholm (CEST)
        let now = utc(2026, 8, 1, 7, 0);
        let due = periodic_due("0 9 * * *", Some("Europe/Stockholm"), now, None).unwrap();
        assert!(due.is_some());
        let (_, iso) = due.unwrap();
        assert!(iso.starts_with("2026-08-01T09:00:00"));

        // same wall time evaluated in UTC does not match
        let due = periodic_due("0 9 * * *", None, now, None).unwrap();
        assert!(due.is_none());
    }

    #[test]
    fn test_periodic_fires_at_most_once_per_minute() {
        let now = utc(2026, 8, 1, 9, 0);
        let first = periodic_due("0 9 * * *", None, now, None).unwrap().unwrap();
        let again = periodic_due("0 9 * * *", None, now, Some(first.0)).unwrap();
        assert!(again.is_none());

        // the next day's firing has a different minute key
        let tomorrow = utc(2026, 8, 2, 9, 0);
        let due = periodic_due("0 9 * * *", None, tomorrow, Some(first.0)).unwrap();
        assert!(due.is_some());
    }

    #[test]
    fn test_periodic_every_minute_expression() {
        let due = periodic_due("* * * * *", None, utc(2026, 8, 1, 13, 37), None).unwrap();
        assert!(due.is_some());
    }

    #[test]
    fn test_periodic_bad_inputs() {
        assert!(periodic_due("not cron", None, Utc::now(), None).is_err());
        assert!(periodic_due("* * * * *", Some("Mars/Olympus"), Utc::now(), None).is_err());
    }

    #[tokio::test]
    async fn test_immediate_event_fires_once_and_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("events"))
            .await
            .unwrap();
        let file = dir.path().join("events/hello.json");
        tokio::fs::write(
            &file,
            r#"{"type": "immediate", "channelId": "c1", "text": "wake up"}"#,
        )
        .await
        .unwrap();

        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink_fired = fired.clone();
        let sink: EventSink = Arc::new(move |channel_id, text| {
            let fired = sink_fired.clone();
            Box::pin(async move {
                fired.lock().await.push((channel_id, text));
                true
            })
        });

        let scheduler = EventScheduler::new(dir.path(), sink);
        scheduler.scan(Utc::now()).await;
        scheduler.scan(Utc::now()).await;

        let fired = fired.lock().await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, "c1");
        assert!(fired[0].1.starts_with("[EVENT:hello.json:immediate:"));
        assert!(fired[0].1.ends_with("] wake up"));
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_one_shot_in_past_fires_now_future_waits() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("events"))
            .await
            .unwrap();
        tokio::fs::write(
            dir.path().join("events/past.json"),
            r#"{"type": "one-shot", "channelId": "c1", "text": "late",
                "at": "2020-01-01T00:00:00+00:00"}"#,
        )
        .await
        .unwrap();
        tokio::fs::write(
            dir.path().join("events/future.json"),
            r#"{"type": "one-shot", "channelId": "c1", "text": "later",
                "at": "2099-01-01T00:00:00+00:00"}"#,
        )
        .await
        .unwrap();

        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink_fired = fired.clone();
        let sink: EventSink = Arc::new(move |channel_id, text| {
            let fired = sink_fired.clone();
            Box::pin(async move {
                fired.lock().await.push((channel_id, text));
                true
            })
        });

        let scheduler = EventScheduler::new(dir.path(), sink);
        scheduler.scan(Utc::now()).await;

        let fired = fired.lock().await;
        assert_eq!(fired.len(), 1);
        assert!(fired[0].1.contains(":one-shot:2020-01-01T00:00:00+00:00]"));
        assert!(!dir.path().join("events/past.json").exists());
        assert!(dir.path().join("events/future.json").exists());
    }

    #[tokio::test]
    async fn test_invalid_event_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("events"))
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("events/bad.json"), "{not json")
            .await
            .unwrap();

        let sink: EventSink = Arc::new(|_, _| Box::pin(async { true }));
        let scheduler = EventScheduler::new(dir.path(), sink);
        scheduler.scan(Utc::now()).await;
        // file stays; it is just skipped
        assert!(dir.path().join("events/bad.json").exists());
    }

    #[tokio::test]
    async fn test_periodic_file_is_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("events"))
            .await
            .unwrap();
        let file = dir.path().join("events/minutely.json");
        tokio::fs::write(
            &file,
            r#"{"type": "periodic", "channelId": "c1", "text": "tick", "schedule": "* * * * *"}"#,
        )
        .await
        .unwrap();

        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink_fired = fired.clone();
        let sink: EventSink = Arc::new(move |channel_id, text| {
            let fired = sink_fired.clone();
            Box::pin(async move {
                fired.lock().await.push((channel_id, text));
                true
            })
        });

        let scheduler = EventScheduler::new(dir.path(), sink);
        let now = Utc::now();
        scheduler.scan(now).await;
        scheduler.scan(now).await; // same minute: no second firing

        assert_eq!(fired.lock().await.len(), 1);
        assert!(file.exists());
    }
}
