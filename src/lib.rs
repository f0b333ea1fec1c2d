//! Mother: a Discord-connected autonomous agent host.
//!
//! Every chat channel maps to one persistent agent session that drives an
//! LLM tool-use loop against a sandboxed workspace. Channels are processed
//! serially through per-channel queues; across channels, work runs
//! concurrently.

pub mod agent;
pub mod config;
pub mod error;
pub mod guard;
pub mod llm;
pub mod orchestrator;
pub mod queue;
pub mod sandbox;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod tools;
pub mod transport;
pub mod workspace;

pub use error::{Error, Result};

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Channel identifier type. One chat channel or DM becomes one channel id.
pub type ChannelId = Arc<str>;

/// A normalized inbound chat event, produced by the transport.
///
/// The transport only forwards messages addressed to the bot (DMs or
/// mentions); the orchestrator strips the mention token before logging.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub channel_id: ChannelId,
    /// Monotonic-or-snowflake message id, unique per `(channel_id, ts)`.
    pub ts: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub display_name: Option<String>,
    pub text: String,
    pub files: Vec<InboundFile>,
    pub timestamp: DateTime<Utc>,
}

/// An attachment reference carried on an inbound event.
#[derive(Debug, Clone)]
pub struct InboundFile {
    pub name: String,
    pub url: String,
}

/// Handle to a message the bot has posted, usable for later edits,
/// thread posts, and deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    pub channel_id: String,
    pub message_id: u64,
}

impl std::fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.message_id)
    }
}
