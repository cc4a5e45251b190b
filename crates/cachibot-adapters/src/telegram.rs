//! Telegram adapter — long polling over the Bot API.
//!
//! No public URL required: `connect` validates the token with `getMe` and
//! spawns a `getUpdates` loop. Transport errors back off exponentially
//! (5 s base, 120 s cap) up to a fixed retry budget; the budget resets only
//! once polling succeeds again, so persistent flapping eventually parks the
//! connection in `error` until a manual reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cachibot_core::types::{
    ConnectionStatus, InboundMeta, IncomingMedia, PlatformKind, PlatformResponse,
};

use crate::adapter::{AdapterEvents, AdapterHealth, PlatformAdapter};
use crate::error::{AdapterError, Result};

const API_BASE: &str = "https://api.telegram.org";
const MAX_MESSAGE_LENGTH: usize = 4096;
/// Telegram caps media captions well below the message limit.
const CAPTION_MAX: usize = 1024;

const BACKOFF_BASE_SECS: u64 = 5;
const BACKOFF_MAX_SECS: u64 = 120;
const MAX_RETRIES: u32 = 5;

pub struct TelegramAdapter {
    connection_id: String,
    token: String,
    strip_md: bool,
    events: Arc<dyn AdapterEvents>,
    client: reqwest::Client,
    running: Arc<AtomicBool>,
    cancel: std::sync::Mutex<Option<CancellationToken>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TelegramAdapter {
    pub fn new(
        connection_id: &str,
        config: &serde_json::Value,
        events: Arc<dyn AdapterEvents>,
    ) -> Result<Self> {
        let token = config
            .get("bot_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::Config("Telegram bot_token is required".to_string()))?
            .to_string();
        let strip_md = config
            .get("strip_markdown")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Ok(Self {
            connection_id: connection_id.to_string(),
            token,
            strip_md,
            events,
            client: reqwest::Client::new(),
            running: Arc::new(AtomicBool::new(false)),
            cancel: std::sync::Mutex::new(None),
            task: std::sync::Mutex::new(None),
        })
    }

    fn api_url(token: &str, method: &str) -> String {
        format!("{API_BASE}/bot{token}/{method}")
    }

    async fn call_api(
        client: &reqwest::Client,
        token: &str,
        method: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let resp: TgResponse<serde_json::Value> = client
            .post(Self::api_url(token, method))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        if !resp.ok {
            return Err(AdapterError::Api(format!(
                "{method}: {}",
                resp.description.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        Ok(resp.result.unwrap_or(serde_json::Value::Null))
    }

    async fn download_file(
        client: &reqwest::Client,
        token: &str,
        file_id: &str,
    ) -> Result<Vec<u8>> {
        let info = Self::call_api(
            client,
            token,
            "getFile",
            serde_json::json!({"file_id": file_id}),
        )
        .await?;
        let path = info
            .get("file_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::Payload("getFile returned no file_path".to_string()))?;
        let bytes = client
            .get(format!("{API_BASE}/file/bot{token}/{path}"))
            .send()
            .await?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }

    /// The long-poll loop. Runs until cancelled or retries are exhausted.
    async fn poll_loop(
        connection_id: String,
        token: String,
        strip_md: bool,
        client: reqwest::Client,
        events: Arc<dyn AdapterEvents>,
        running: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) {
        info!(connection = %connection_id, "Telegram: starting long-polling loop");

        let mut offset: i64 = 0;
        let mut retries: u32 = 0;
        let mut delay_secs = BACKOFF_BASE_SECS;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let poll = client
                .post(Self::api_url(&token, "getUpdates"))
                .json(&serde_json::json!({
                    "offset": offset,
                    "timeout": 30,
                    "allowed_updates": ["message"],
                }))
                .send();

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                r = poll => r,
            };

            let updates: Option<Vec<TgUpdate>> = match result {
                Ok(resp) => match resp.json::<TgResponse<Vec<TgUpdate>>>().await {
                    Ok(parsed) if parsed.ok => parsed.result,
                    Ok(parsed) => {
                        warn!(connection = %connection_id,
                              error = parsed.description.as_deref().unwrap_or("unknown"),
                              "Telegram: getUpdates rejected");
                        None
                    }
                    Err(e) => {
                        warn!(connection = %connection_id, error = %e, "Telegram: parse error");
                        None
                    }
                },
                Err(e) => {
                    warn!(connection = %connection_id, error = %e, "Telegram: poll error");
                    None
                }
            };

            match updates {
                Some(updates) => {
                    // Successful re-entry — the retry budget resets here and
                    // only here.
                    retries = 0;
                    delay_secs = BACKOFF_BASE_SECS;

                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        if let Some(message) = update.message {
                            Self::handle_update(
                                &connection_id,
                                &token,
                                strip_md,
                                &client,
                                &events,
                                message,
                            )
                            .await;
                        }
                    }
                }
                None => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        warn!(connection = %connection_id,
                              "Telegram: retries exhausted, entering error state");
                        running.store(false, Ordering::SeqCst);
                        events
                            .on_status_change(&connection_id, ConnectionStatus::Error)
                            .await;
                        break;
                    }
                    debug!(connection = %connection_id, retries, delay_secs,
                           "Telegram: backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(delay_secs)) => {}
                    }
                    delay_secs = (delay_secs * 2).min(BACKOFF_MAX_SECS);
                }
            }
        }

        info!(connection = %connection_id, "Telegram: long-polling loop ended");
    }

    async fn handle_update(
        connection_id: &str,
        token: &str,
        strip_md: bool,
        client: &reqwest::Client,
        events: &Arc<dyn AdapterEvents>,
        message: TgMessage,
    ) {
        let chat_id = message.chat.id.to_string();
        let text = message
            .text
            .or(message.caption)
            .unwrap_or_default();

        let mut meta = InboundMeta {
            platform: Some(PlatformKind::Telegram),
            message_id: Some(message.message_id.to_string()),
            ..Default::default()
        };
        if let Some(from) = &message.from {
            meta.user_id = Some(from.id.to_string());
            meta.username = from.username.clone();
            meta.first_name = Some(from.first_name.clone());
        }
        if let Some(reply) = &message.reply_to_message {
            meta.reply_to_text = reply.text.clone().or_else(|| reply.caption.clone());
        }

        // Fetch attachments. A failed download drops that attachment only.
        if let Some(photos) = &message.photo {
            if let Some(largest) = photos.last() {
                match Self::download_file(client, token, &largest.file_id).await {
                    Ok(data) => meta.attachments.push(IncomingMedia {
                        media_type: "image/jpeg".to_string(),
                        filename: "photo.jpg".to_string(),
                        data,
                    }),
                    Err(e) => warn!(error = %e, "Telegram: photo download failed"),
                }
            }
        }
        if let Some(doc) = &message.document {
            match Self::download_file(client, token, &doc.file_id).await {
                Ok(data) => meta.attachments.push(IncomingMedia {
                    media_type: doc
                        .mime_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    filename: doc
                        .file_name
                        .clone()
                        .unwrap_or_else(|| "document".to_string()),
                    data,
                }),
                Err(e) => warn!(error = %e, "Telegram: document download failed"),
            }
        }
        if let Some(voice) = &message.voice {
            match Self::download_file(client, token, &voice.file_id).await {
                Ok(data) => meta.attachments.push(IncomingMedia {
                    media_type: "audio/ogg".to_string(),
                    filename: "voice.ogg".to_string(),
                    data,
                }),
                Err(e) => warn!(error = %e, "Telegram: voice download failed"),
            }
        }

        if text.is_empty() && meta.attachments.is_empty() {
            return;
        }

        let response = events
            .on_message(connection_id, &chat_id, &text, meta)
            .await;
        if response.is_empty() {
            return;
        }

        if let Err(e) =
            Self::deliver_response(client, token, strip_md, &chat_id, &response).await
        {
            warn!(connection = %connection_id, error = %e, "Telegram: send failed");
        }
    }

    /// Send a full response: text chunks plus media. When media is present,
    /// the first text chunk rides along as the first item's caption and the
    /// remaining chunks follow as ordinary messages.
    async fn deliver_response(
        client: &reqwest::Client,
        token: &str,
        strip_md: bool,
        chat_id: &str,
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
            for (i, chunk) in chunks.iter().enumerate() {
                Self::send_text(client, token, chat_id, chunk).await?;
                if i + 1 < chunks.len() {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
            return Ok(());
        }

        let mut remaining = chunks.into_iter();
        let caption: Option<String> = remaining
            .next()
            .map(|c| c.chars().take(CAPTION_MAX).collect());

        for (i, item) in response.media.iter().enumerate() {
            let caption = if i == 0 { caption.as_deref() } else { None };
            Self::send_media(client, token, chat_id, &item.media_type, &item.data, caption)
                .await?;
        }
        for chunk in remaining {
            Self::send_text(client, token, chat_id, &chunk).await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    async fn send_text(
        client: &reqwest::Client,
        token: &str,
        chat_id: &str,
        text: &str,
    ) -> Result<()> {
        Self::call_api(
            client,
            token,
            "sendMessage",
            serde_json::json!({"chat_id": chat_id, "text": text}),
        )
        .await
        .map(|_| ())
    }

    async fn send_media(
        client: &reqwest::Client,
        token: &str,
        chat_id: &str,
        media_type: &str,
        data: &[u8],
        caption: Option<&str>,
    ) -> Result<()> {
        let (method, field, filename) = if media_type.starts_with("image/") {
            ("sendPhoto", "photo", "image.png")
        } else if media_type.starts_with("audio/") {
            ("sendAudio", "audio", "audio.mp3")
        } else {
            ("sendDocument", "document", "file.bin")
        };

        let part = reqwest::multipart::Part::bytes(data.to_vec())
            .file_name(filename.to_string())
            .mime_str(media_type)
            .map_err(|e| AdapterError::Payload(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field.to_string(), part);
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }

        let resp: TgResponse<serde_json::Value> = client
            .post(Self::api_url(token, method))
            .multipart(form)
            .send()
            .await?
            .json()
            .await?;
        if !resp.ok {
            return Err(AdapterError::Api(format!(
                "{method}: {}",
                resp.description.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PlatformAdapter for TelegramAdapter {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Telegram
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

        // Validate the token before declaring the connection ready.
        Self::call_api(
            &self.client,
            &self.token,
            "getMe",
            serde_json::json!({}),
        )
        .await?;

        let cancel = CancellationToken::new();
        self.running.store(true, Ordering::SeqCst);

        let task = tokio::spawn(Self::poll_loop(
            self.connection_id.clone(),
            self.token.clone(),
            self.strip_md,
            self.client.clone(),
            Arc::clone(&self.events),
            Arc::clone(&self.running),
            cancel.clone(),
        ));

        *self.cancel.lock().unwrap() = Some(cancel);
        *self.task.lock().unwrap() = Some(task);
        Ok(())
    }

    async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        if !self.is_running() {
            return Err(AdapterError::NotRunning);
        }
        let formatted = self.format_outgoing(text);
        for chunk in self.chunk_message(&formatted) {
            Self::send_text(&self.client, &self.token, chat_id, &chunk).await?;
        }
        Ok(())
    }

    async fn send_typing(&self, chat_id: &str) {
        let result = Self::call_api(
            &self.client,
            &self.token,
            "sendChatAction",
            serde_json::json!({"chat_id": chat_id, "action": "typing"}),
        )
        .await;
        if let Err(e) = result {
            debug!(error = %e, "Telegram: sendChatAction failed");
        }
    }

    async fn send_response(&self, chat_id: &str, response: &PlatformResponse) -> Result<()> {
        if !self.is_running() {
            return Err(AdapterError::NotRunning);
        }
        Self::deliver_response(&self.client, &self.token, self.strip_md, chat_id, response).await
    }

    async fn health_check(&self) -> AdapterHealth {
        if !self.is_running() {
            return AdapterHealth::down(serde_json::json!({"running": false}));
        }
        let start = Instant::now();
        match Self::call_api(&self.client, &self.token, "getMe", serde_json::json!({})).await {
            Ok(_) => AdapterHealth {
                healthy: true,
                latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
                details: serde_json::json!({"running": true}),
            },
            Err(e) => AdapterHealth::down(
                serde_json::json!({"running": true, "error": e.to_string()}),
            ),
        }
    }
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    chat: TgChat,
    from: Option<TgUser>,
    text: Option<String>,
    caption: Option<String>,
    photo: Option<Vec<TgPhotoSize>>,
    document: Option<TgDocument>,
    voice: Option<TgVoice>,
    reply_to_message: Option<Box<TgMessage>>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    username: Option<String>,
    first_name: String,
}

#[derive(Debug, Deserialize)]
struct TgPhotoSize {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct TgDocument {
    file_id: String,
    file_name: Option<String>,
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgVoice {
    file_id: String,
}
