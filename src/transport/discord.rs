//! Discord transport adapter using serenity.

use crate::error::{Error, Result};
use crate::transport::{ChatTransport, InboundReceiver, split_message};
use crate::{InboundEvent, InboundFile, MessageHandle};

use anyhow::Context as _;
use async_trait::async_trait;
use serenity::all::{
    ChannelId, ChannelType, Context, CreateAttachment, CreateMessage, CreateThread, EditMessage,
    EventHandler, GatewayIntents, Http, Message, MessageId, Ready, UserId,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, mpsc};

/// Discord caps messages at 2000 characters.
const DISCORD_MAX_MESSAGE: usize = 2000;

/// Minimum spacing between edits of the same message.
const EDIT_PACING: Duration = Duration::from_secs(1);

/// Discord adapter state.
pub struct DiscordTransport {
    token: String,
    guild_id: Option<u64>,
    http: Arc<RwLock<Option<Arc<Http>>>>,
    bot_user_id: Arc<RwLock<Option<UserId>>>,
    /// Thread channel created for each parent message, keyed by message id.
    threads: Arc<RwLock<HashMap<u64, ChannelId>>>,
    /// Last edit instant per message, for the 1 s pacing rule.
    edit_pacing: Arc<Mutex<HashMap<u64, Instant>>>,
    /// Typing handles per channel. Typing stops when the handle is dropped.
    typing_tasks: Arc<RwLock<HashMap<String, serenity::http::Typing>>>,
}

impl DiscordTransport {
    pub fn new(token: impl Into<String>, guild_id: Option<u64>) -> Self {
        Self {
            token: token.into(),
            guild_id,
            http: Arc::new(RwLock::new(None)),
            bot_user_id: Arc::new(RwLock::new(None)),
            threads: Arc::new(RwLock::new(HashMap::new())),
            edit_pacing: Arc::new(Mutex::new(HashMap::new())),
            typing_tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Connect the gateway and return the inbound event stream.
    pub async fn start(&self) -> Result<InboundReceiver> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        let handler = Handler {
            inbound_tx,
            guild_id: self.guild_id,
            bot_user_id_slot: self.bot_user_id.clone(),
        };

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
            | GatewayIntents::GUILDS;

        let mut client = serenity::Client::builder(&self.token, intents)
            .event_handler(handler)
            .await
            .context("failed to build discord client")?;

        *self.http.write().await = Some(client.http.clone());

        tokio::spawn(async move {
            if let Err(error) = client.start().await {
                tracing::error!(%error, "discord gateway error");
            }
        });

        Ok(inbound_rx)
    }

    pub async fn bot_user_id(&self) -> Option<u64> {
        self.bot_user_id.read().await.map(|id| id.get())
    }

    async fn get_http(&self) -> Result<Arc<Http>> {
        Ok(self
            .http
            .read()
            .await
            .clone()
            .context("discord not connected")?)
    }

    fn parse_channel(channel_id: &str) -> Result<ChannelId> {
        let id: u64 = channel_id
            .parse()
            .map_err(|_| Error::Transport(format!("bad channel id: {channel_id}")))?;
        Ok(ChannelId::new(id))
    }

    /// Sleep as needed so edits of one message stay ≥1 s apart.
    async fn pace_edit(&self, message_id: u64) {
        let wait = {
            let mut pacing = self.edit_pacing.lock().await;
            let now = Instant::now();
            match pacing.get(&message_id) {
                Some(last) if now.duration_since(*last) < EDIT_PACING => {
                    EDIT_PACING - now.duration_since(*last)
                }
                _ => {
                    pacing.insert(message_id, now);
                    return;
                }
            }
        };
        tokio::time::sleep(wait).await;
        self.edit_pacing
            .lock()
            .await
            .insert(message_id, Instant::now());
    }
}

#[async_trait]
impl ChatTransport for DiscordTransport {
    async fn post_message(&self, channel_id: &str, text: &str) -> Result<MessageHandle> {
        let http = self.get_http().await?;
        let channel = Self::parse_channel(channel_id)?;

        let mut first: Option<Message> = None;
        for chunk in split_message(text, DISCORD_MAX_MESSAGE) {
            let message = channel
                .say(&*http, &chunk)
                .await
                .context("failed to send discord message")?;
            first.get_or_insert(message);
        }
        let message = first.context("empty message")?;
        Ok(MessageHandle {
            channel_id: channel_id.to_string(),
            message_id: message.id.get(),
        })
    }

    async fn update_message(&self, handle: &MessageHandle, text: &str) -> Result<()> {
        let http = self.get_http().await?;
        let channel = Self::parse_channel(&handle.channel_id)?;

        self.pace_edit(handle.message_id).await;

        let mut content = text.to_string();
        if content.len() > DISCORD_MAX_MESSAGE {
            content = split_message(&content, DISCORD_MAX_MESSAGE)
                .into_iter()
                .next()
                .unwrap_or_default();
        }
        channel
            .edit_message(
                &*http,
                MessageId::new(handle.message_id),
                EditMessage::new().content(content),
            )
            .await
            .context("failed to edit discord message")?;
        Ok(())
    }

    async fn delete_message(&self, handle: &MessageHandle) -> Result<()> {
        let http = self.get_http().await?;
        let channel = Self::parse_channel(&handle.channel_id)?;
        channel
            .delete_message(&*http, MessageId::new(handle.message_id))
            .await
            .context("failed to delete discord message")?;
        self.threads.write().await.remove(&handle.message_id);
        Ok(())
    }

    async fn post_in_thread(&self, parent: &MessageHandle, text: &str) -> Result<MessageHandle> {
        let http = self.get_http().await?;

        let thread = {
            let threads = self.threads.read().await;
            threads.get(&parent.message_id).copied()
        };
        let thread = match thread {
            Some(thread) => thread,
            None => {
                let channel = Self::parse_channel(&parent.channel_id)?;
                let created = channel
                    .create_thread_from_message(
                        &*http,
                        MessageId::new(parent.message_id),
                        CreateThread::new("agent log").kind(ChannelType::PublicThread),
                    )
                    .await
                    .context("failed to create thread")?;
                self.threads
                    .write()
                    .await
                    .insert(parent.message_id, created.id);
                created.id
            }
        };

        let mut first: Option<Message> = None;
        for chunk in split_message(text, DISCORD_MAX_MESSAGE) {
            let message = thread
                .say(&*http, &chunk)
                .await
                .context("failed to send message in thread")?;
            first.get_or_insert(message);
        }
        let message = first.context("empty thread message")?;
        Ok(MessageHandle {
            channel_id: thread.get().to_string(),
            message_id: message.id.get(),
        })
    }

    async fn upload_file(&self, channel_id: &str, path: &Path, title: Option<&str>) -> Result<()> {
        let http = self.get_http().await?;
        let channel = Self::parse_channel(channel_id)?;

        let attachment = CreateAttachment::path(path)
            .await
            .with_context(|| format!("failed to read upload: {}", path.display()))?;
        let mut builder = CreateMessage::new().add_file(attachment);
        if let Some(title) = title {
            builder = builder.content(title.to_string());
        }
        channel
            .send_message(&*http, builder)
            .await
            .context("failed to send file attachment")?;
        Ok(())
    }

    async fn set_typing(&self, channel_id: &str, typing: bool) -> Result<()> {
        if typing {
            let http = self.get_http().await?;
            let channel = Self::parse_channel(channel_id)?;
            let handle = channel.start_typing(&http);
            self.typing_tasks
                .write()
                .await
                .insert(channel_id.to_string(), handle);
        } else {
            // dropping the handle stops the typing indicator
            self.typing_tasks.write().await.remove(channel_id);
        }
        Ok(())
    }
}

struct Handler {
    inbound_tx: mpsc::Sender<InboundEvent>,
    guild_id: Option<u64>,
    bot_user_id_slot: Arc<RwLock<Option<UserId>>>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(bot = %ready.user.name, "discord gateway connected");
        *self.bot_user_id_slot.write().await = Some(ready.user.id);
    }

    async fn message(&self, _ctx: Context, message: Message) {
        if message.author.bot {
            return;
        }

        let is_dm = message.guild_id.is_none();
        if let (Some(filter), Some(guild_id)) = (self.guild_id, message.guild_id) {
            if guild_id.get() != filter {
                return;
            }
        }

        let bot_id = *self.bot_user_id_slot.read().await;
        let mentioned = bot_id.is_some_and(|id| message.mentions_user_id(id));
        if !is_dm && !mentioned {
            return;
        }

        let files = message
            .attachments
            .iter()
            .map(|attachment| InboundFile {
                name: attachment.filename.clone(),
                url: attachment.url.clone(),
            })
            .collect();

        let event = InboundEvent {
            channel_id: Arc::from(message.channel_id.get().to_string().as_str()),
            ts: message.id.get().to_string(),
            user_id: message.author.id.get().to_string(),
            user_name: Some(message.author.name.clone()),
            display_name: message.author.global_name.clone(),
            text: message.content.clone(),
            files,
            timestamp: *message.timestamp,
        };

        if let Err(error) = self.inbound_tx.send(event).await {
            tracing::warn!(%error, "failed to forward inbound discord message");
        }
    }
}
