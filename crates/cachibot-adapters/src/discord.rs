//! Discord adapter.
//!
//! Wraps a serenity `Client` and drives the gateway WebSocket on a
//! background task. The gateway loop reconnects with exponential backoff
//! (5 s base, 120 s cap) up to a fixed retry budget; exhaustion parks the
//! connection in `error` until a manual reconnect. The budget resets only
//! after a successful re-entry to the gateway.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serenity::builder::{CreateAttachment, CreateMessage};
use serenity::model::channel::Message;
use serenity::model::gateway::{GatewayIntents, Ready};
use serenity::model::id::ChannelId;
use serenity::prelude::{Context, EventHandler};
use serenity::Client;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use cachibot_core::types::{
    ConnectionStatus, InboundMeta, IncomingMedia, PlatformKind, PlatformResponse,
};

use crate::adapter::{AdapterEvents, AdapterHealth, PlatformAdapter};
use crate::error::{AdapterError, Result};

const MAX_MESSAGE_LENGTH: usize = 2000;
const READY_TIMEOUT: Duration = Duration::from_secs(30);

const BACKOFF_BASE_SECS: u64 = 5;
const BACKOFF_MAX_SECS: u64 = 120;
const MAX_RETRIES: u32 = 5;

pub struct DiscordAdapter {
    connection_id: String,
    token: String,
    strip_md: bool,
    events: Arc<dyn AdapterEvents>,
    running: Arc<AtomicBool>,
    intentional_disconnect: Arc<AtomicBool>,
    http: std::sync::Mutex<Option<Arc<serenity::http::Http>>>,
    shard_manager: std::sync::Mutex<Option<Arc<serenity::gateway::ShardManager>>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DiscordAdapter {
    pub fn new(
        connection_id: &str,
        config: &serde_json::Value,
        events: Arc<dyn AdapterEvents>,
    ) -> Result<Self> {
        let token = config
            .get("bot_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::Config("Discord bot_token is required".to_string()))?
            .to_string();
        Ok(Self {
            connection_id: connection_id.to_string(),
            token,
            strip_md: config
                .get("strip_markdown")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            events,
            running: Arc::new(AtomicBool::new(false)),
            intentional_disconnect: Arc::new(AtomicBool::new(false)),
            http: std::sync::Mutex::new(None),
            shard_manager: std::sync::Mutex::new(None),
            task: std::sync::Mutex::new(None),
        })
    }

    fn intents() -> GatewayIntents {
        GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
    }

    fn current_http(&self) -> Result<Arc<serenity::http::Http>> {
        self.http
            .lock()
            .unwrap()
            .as_ref()
            .map(Arc::clone)
            .ok_or(AdapterError::NotRunning)
    }

    async fn build_client(
        &self,
        ready_tx: Option<tokio::sync::oneshot::Sender<()>>,
    ) -> std::result::Result<Client, serenity::Error> {
        let handler = DiscordHandler {
            connection_id: self.connection_id.clone(),
            events: Arc::clone(&self.events),
            running: Arc::clone(&self.running),
            strip_md: self.strip_md,
            ready_tx: std::sync::Mutex::new(ready_tx),
        };
        Client::builder(&self.token, Self::intents())
            .event_handler(handler)
            .await
    }

    fn parse_channel(chat_id: &str) -> Result<ChannelId> {
        chat_id
            .parse::<u64>()
            .map(ChannelId::new)
            .map_err(|_| AdapterError::Payload(format!("invalid Discord channel ID: {chat_id}")))
    }
}

#[async_trait::async_trait]
impl PlatformAdapter for DiscordAdapter {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Discord
    }

    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn max_message_length(&self) -> usize {
        MAX_MESSAGE_LENGTH
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn strip_markdown(&self) -> bool {
        self.strip_md
    }

    async fn connect(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.intentional_disconnect.store(false, Ordering::SeqCst);

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let mut client = self
            .build_client(Some(ready_tx))
            .await
            .map_err(|e| AdapterError::Api(format!("Discord client build failed: {e}")))?;

        *self.http.lock().unwrap() = Some(Arc::clone(&client.http));
        *self.shard_manager.lock().unwrap() = Some(Arc::clone(&client.shard_manager));

        // Gateway loop with reconnect backoff.
        let connection_id = self.connection_id.clone();
        let events = Arc::clone(&self.events);
        let running = Arc::clone(&self.running);
        let intentional = Arc::clone(&self.intentional_disconnect);
        let adapter_token = self.token.clone();
        let strip_md = self.strip_md;
        let intents = Self::intents();

        let task = tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let result = client.start().await;
                // The retry budget resets only when the session actually
                // reached the gateway (ready fired) before dropping.
                let was_connected = running.swap(false, Ordering::SeqCst);
                if was_connected {
                    attempt = 0;
                }

                if intentional.load(Ordering::SeqCst) {
                    info!(connection = %connection_id, "Discord: gateway stopped");
                    return;
                }
                if let Err(e) = &result {
                    warn!(connection = %connection_id, error = %e, "Discord: gateway error");
                }

                attempt += 1;
                if attempt > MAX_RETRIES {
                    warn!(connection = %connection_id,
                          "Discord: retries exhausted, entering error state");
                    events
                        .on_status_change(&connection_id, ConnectionStatus::Error)
                        .await;
                    return;
                }

                let delay = (BACKOFF_BASE_SECS * 2u64.pow(attempt - 1)).min(BACKOFF_MAX_SECS);
                info!(connection = %connection_id, attempt, delay,
                      "Discord: reconnecting after backoff");
                tokio::time::sleep(Duration::from_secs(delay)).await;

                // Rebuild the client for the next attempt.
                let handler = DiscordHandler {
                    connection_id: connection_id.clone(),
                    events: Arc::clone(&events),
                    running: Arc::clone(&running),
                    strip_md,
                    ready_tx: std::sync::Mutex::new(None),
                };
                match Client::builder(&adapter_token, intents)
                    .event_handler(handler)
                    .await
                {
                    Ok(c) => client = c,
                    Err(e) => {
                        warn!(connection = %connection_id, error = %e,
                              "Discord: client rebuild failed");
                    }
                }
            }
        });
        *self.task.lock().unwrap() = Some(task);

        // Wait for the gateway to report ready before declaring connected.
        match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                self.disconnect().await;
                Err(AdapterError::Api(
                    "Discord gateway did not become ready in time".to_string(),
                ))
            }
        }
    }

    async fn disconnect(&self) {
        self.intentional_disconnect.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);

        let manager = self.shard_manager.lock().unwrap().take();
        if let Some(manager) = manager {
            manager.shutdown_all().await;
        }
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        *self.http.lock().unwrap() = None;
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        if !self.is_running() {
            return Err(AdapterError::NotRunning);
        }
        let http = self.current_http()?;
        let channel = Self::parse_channel(chat_id)?;
        let formatted = self.format_outgoing(text);
        for chunk in self.chunk_message(&formatted) {
            channel
                .say(&http, chunk)
                .await
                .map_err(|e| AdapterError::Api(e.to_string()))?;
        }
        Ok(())
    }

    async fn send_typing(&self, chat_id: &str) {
        let Ok(http) = self.current_http() else { return };
        let Ok(channel) = Self::parse_channel(chat_id) else {
            return;
        };
        if let Err(e) = channel.broadcast_typing(&http).await {
            tracing::debug!(error = %e, "Discord: broadcast_typing failed");
        }
    }

    async fn send_response(&self, chat_id: &str, response: &PlatformResponse) -> Result<()> {
        if !self.is_running() {
            return Err(AdapterError::NotRunning);
        }
        let http = self.current_http()?;
        let channel = Self::parse_channel(chat_id)?;
        send_response_inner(&http, channel, self.strip_md, response).await
    }

    async fn health_check(&self) -> AdapterHealth {
        if !self.is_running() {
            return AdapterHealth::down(serde_json::json!({"running": false}));
        }
        let Ok(http) = self.current_http() else {
            return AdapterHealth::down(serde_json::json!({"running": false}));
        };
        let start = Instant::now();
        match http.get_current_user().await {
            Ok(_) => AdapterHealth {
                healthy: true,
                latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
                details: serde_json::json!({"running": true}),
            },
            Err(e) => AdapterHealth::down(serde_json::json!({
                "running": true,
                "error": e.to_string(),
            })),
        }
    }
}

/// Deliver text + media to one channel. With media present, the first text
/// chunk rides as the content of the first file message and the remaining
/// chunks follow in order.
async fn send_response_inner(
    http: &serenity::http::Http,
    channel: ChannelId,
    strip_md: bool,
    response: &PlatformResponse,
) -> Result<()> {
    let formatted = if strip_md {
        crate::chunk::strip_markdown(&response.text)
    } else {
        response.text.clone()
    };
    let mut chunks = crate::chunk::chunk_message(&formatted, MAX_MESSAGE_LENGTH);
    chunks.retain(|c| !c.is_empty());

    if response.media.is_empty() {
        for chunk in &chunks {
            channel
                .say(http, chunk)
                .await
                .map_err(|e| AdapterError::Api(e.to_string()))?;
        }
        return Ok(());
    }

    let mut remaining = chunks.into_iter();
    for (i, item) in response.media.iter().enumerate() {
        let filename = filename_for(&item.media_type);
        let attachment = CreateAttachment::bytes(item.data.clone(), filename);
        let mut message = CreateMessage::new().add_file(attachment);
        if i == 0 {
            if let Some(first) = remaining.next() {
                message = message.content(first);
            }
        }
        channel
            .send_message(http, message)
            .await
            .map_err(|e| AdapterError::Api(e.to_string()))?;
    }
    for chunk in remaining {
        channel
            .say(http, chunk)
            .await
            .map_err(|e| AdapterError::Api(e.to_string()))?;
    }
    Ok(())
}

fn filename_for(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => "image.png",
        "image/jpeg" => "image.jpg",
        "image/gif" => "image.gif",
        t if t.starts_with("audio/") => "audio.mp3",
        _ => "file.bin",
    }
}

/// Serenity event handler wired to the manager callbacks.
struct DiscordHandler {
    connection_id: String,
    events: Arc<dyn AdapterEvents>,
    running: Arc<AtomicBool>,
    strip_md: bool,
    ready_tx: std::sync::Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

#[serenity::async_trait]
impl EventHandler for DiscordHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        self.running.store(true, Ordering::SeqCst);
        if let Some(tx) = self.ready_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        info!(connection = %self.connection_id, bot = %ready.user.name, "Discord bot connected");
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let content = msg.content.trim().to_string();
        if content.is_empty() && msg.attachments.is_empty() {
            return;
        }

        let mut meta = InboundMeta {
            platform: Some(PlatformKind::Discord),
            user_id: Some(msg.author.id.to_string()),
            username: Some(msg.author.name.clone()),
            message_id: Some(msg.id.to_string()),
            reply_to_text: msg
                .referenced_message
                .as_ref()
                .map(|r| r.content.clone())
                .filter(|c| !c.is_empty()),
            ..Default::default()
        };

        for attachment in &msg.attachments {
            match attachment.download().await {
                Ok(data) => meta.attachments.push(IncomingMedia {
                    media_type: attachment
                        .content_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    filename: attachment.filename.clone(),
                    data,
                }),
                Err(e) => {
                    warn!(error = %e, filename = %attachment.filename,
                          "Discord: attachment download failed");
                }
            }
        }

        let chat_id = msg.channel_id.to_string();
        let response = self
            .events
            .on_message(&self.connection_id, &chat_id, &content, meta)
            .await;
        if response.is_empty() {
            return;
        }

        if let Err(e) =
            send_response_inner(&ctx.http, msg.channel_id, self.strip_md, &response).await
        {
            warn!(connection = %self.connection_id, error = %e, "Discord: send failed");
        }
    }
}
