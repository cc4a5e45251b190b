//! WhatsApp Cloud API adapter (Meta Graph API).
//!
//! Webhook-based: `connect` only validates config and opens an outbound
//! HTTP session. Inbound events arrive through the webhook ingress, which
//! calls `process_webhook` with the raw body and `X-Hub-Signature-256`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};

use cachibot_core::types::{InboundMeta, IncomingMedia, PlatformKind, PlatformResponse};

use crate::adapter::{AdapterEvents, AdapterHealth, PlatformAdapter};
use crate::error::{AdapterError, Result};

type HmacSha256 = Hmac<Sha256>;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v21.0";
const MAX_MESSAGE_LENGTH: usize = 4096;

pub struct WhatsAppAdapter {
    connection_id: String,
    phone_number_id: String,
    access_token: String,
    app_secret: String,
    strip_md: bool,
    events: Arc<dyn AdapterEvents>,
    client: reqwest::Client,
    running: AtomicBool,
}

impl WhatsAppAdapter {
    pub fn new(
        connection_id: &str,
        config: &serde_json::Value,
        events: Arc<dyn AdapterEvents>,
    ) -> Result<Self> {
        let get = |key: &str| {
            config
                .get(key)
                .and_then(|v| v.as_str())
                .map(String::from)
                .ok_or_else(|| AdapterError::Config(format!("WhatsApp {key} is required")))
        };
        Ok(Self {
            connection_id: connection_id.to_string(),
            phone_number_id: get("phone_number_id")?,
            access_token: get("access_token")?,
            app_secret: get("app_secret")?,
            strip_md: config
                .get("strip_markdown")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            events,
            client: reqwest::Client::new(),
            running: AtomicBool::new(false),
        })
    }

    /// Validate `X-Hub-Signature-256` (`sha256=<hex>`) over the raw body.
    fn validate_signature(&self, raw_body: &[u8], signature: &str) -> bool {
        let Some(hex_sig) = signature.strip_prefix("sha256=") else {
            return false;
        };
        let Ok(expected) = hex::decode(hex_sig) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.app_secret.as_bytes()) else {
            return false;
        };
        mac.update(raw_body);
        // verify_slice is a constant-time comparison.
        mac.verify_slice(&expected).is_ok()
    }

    async fn graph_post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .client
            .post(format!("{GRAPH_API_BASE}/{path}"))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let value: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        if !status.is_success() {
            return Err(AdapterError::Api(format!(
                "Graph API HTTP {status}: {value}"
            )));
        }
        Ok(value)
    }

    /// Resolve a media ID to bytes: GET /{media_id} → url → authorized GET.
    async fn download_media(&self, media_id: &str) -> Result<Vec<u8>> {
        let info: serde_json::Value = self
            .client
            .get(format!("{GRAPH_API_BASE}/{media_id}"))
            .bearer_auth(&self.access_token)
            .send()
            .await?
            .json()
            .await?;
        let url = info
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::Payload("media lookup returned no url".to_string()))?;
        let bytes = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }

    /// Upload media bytes, returning the Graph media ID for outbound sends.
    async fn upload_media(&self, media_type: &str, data: &[u8]) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(data.to_vec())
            .file_name("media")
            .mime_str(media_type)
            .map_err(|e| AdapterError::Payload(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("messaging_product", "whatsapp")
            .part("file", part);

        let resp: serde_json::Value = self
            .client
            .post(format!("{GRAPH_API_BASE}/{}/media", self.phone_number_id))
            .bearer_auth(&self.access_token)
            .multipart(form)
            .send()
            .await?
            .json()
            .await?;
        resp.get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| AdapterError::Api(format!("media upload failed: {resp}")))
    }

    async fn send_text_chunks(&self, chat_id: &str, text: &str) -> Result<()> {
        let formatted = self.format_outgoing(text);
        for chunk in self.chunk_message(&formatted) {
            if chunk.is_empty() {
                continue;
            }
            self.graph_post(
                &format!("{}/messages", self.phone_number_id),
                serde_json::json!({
                    "messaging_product": "whatsapp",
                    "to": chat_id,
                    "type": "text",
                    "text": {"body": chunk},
                }),
            )
            .await?;
        }
        Ok(())
    }

    /// Mark a specific inbound message as read — WhatsApp has no true
    /// typing API, so this doubles as the activity signal.
    pub async fn mark_as_read(&self, message_id: &str) {
        let result = self
            .graph_post(
                &format!("{}/messages", self.phone_number_id),
                serde_json::json!({
                    "messaging_product": "whatsapp",
                    "status": "read",
                    "message_id": message_id,
                }),
            )
            .await;
        if let Err(e) = result {
            warn!(error = %e, "WhatsApp: mark-as-read failed");
        }
    }

    async fn handle_message(&self, message: &serde_json::Value, profile_name: Option<&str>) {
        let Some(from) = message.get("from").and_then(|v| v.as_str()) else {
            return;
        };
        let message_id = message.get("id").and_then(|v| v.as_str());

        let mut meta = InboundMeta {
            platform: Some(PlatformKind::Whatsapp),
            user_id: Some(from.to_string()),
            username: profile_name.map(String::from),
            message_id: message_id.map(String::from),
            ..Default::default()
        };

        let mut text = message
            .pointer("/text/body")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        // Media messages: caption becomes the text, bytes become attachments.
        for (kind, mime_fallback, filename) in [
            ("image", "image/jpeg", "image.jpg"),
            ("audio", "audio/ogg", "audio.ogg"),
            ("document", "application/octet-stream", "document"),
        ] {
            let Some(media) = message.get(kind) else {
                continue;
            };
            if text.is_empty() {
                if let Some(caption) = media.get("caption").and_then(|v| v.as_str()) {
                    text = caption.to_string();
                }
            }
            let Some(media_id) = media.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            match self.download_media(media_id).await {
                Ok(data) => meta.attachments.push(IncomingMedia {
                    media_type: media
                        .get("mime_type")
                        .and_then(|v| v.as_str())
                        .unwrap_or(mime_fallback)
                        .to_string(),
                    filename: media
                        .get("filename")
                        .and_then(|v| v.as_str())
                        .unwrap_or(filename)
                        .to_string(),
                    data,
                }),
                Err(e) => warn!(error = %e, media_id, "WhatsApp: media download failed"),
            }
        }

        if text.is_empty() && meta.attachments.is_empty() {
            return;
        }

        // Ack the inbound message before the (slow) agent run.
        if let Some(id) = message_id {
            self.mark_as_read(id).await;
        }

        let response = self
            .events
            .on_message(&self.connection_id, from, &text, meta)
            .await;
        if response.is_empty() {
            return;
        }
        if let Err(e) = self.send_response(from, &response).await {
            warn!(connection = %self.connection_id, error = %e, "WhatsApp: send failed");
        }
    }
}

#[async_trait::async_trait]
impl PlatformAdapter for WhatsAppAdapter {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Whatsapp
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

    /// Webhook platforms don't open a socket — mark ready for outbound REST.
    async fn connect(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(connection = %self.connection_id, "WhatsApp adapter started");
        Ok(())
    }

    async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(connection = %self.connection_id, "WhatsApp adapter stopped");
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        if !self.is_running() {
            return Err(AdapterError::NotRunning);
        }
        self.send_text_chunks(chat_id, text).await
    }

    /// WhatsApp has no typing indicator; mark-as-read (which needs a message
    /// ID) is issued from the webhook path instead.
    async fn send_typing(&self, _chat_id: &str) {}

    async fn send_response(&self, chat_id: &str, response: &PlatformResponse) -> Result<()> {
        if !self.is_running() {
            return Err(AdapterError::NotRunning);
        }
        self.send_text_chunks(chat_id, &response.text).await?;

        for item in &response.media {
            let media_id = self.upload_media(&item.media_type, &item.data).await?;
            let kind = if item.media_type.starts_with("image/") {
                "image"
            } else if item.media_type.starts_with("audio/") {
                "audio"
            } else {
                "document"
            };
            self.graph_post(
                &format!("{}/messages", self.phone_number_id),
                serde_json::json!({
                    "messaging_product": "whatsapp",
                    "to": chat_id,
                    "type": kind,
                    kind: {"id": media_id},
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> AdapterHealth {
        if !self.is_running() {
            return AdapterHealth::down(serde_json::json!({"running": false}));
        }
        let start = Instant::now();
        let result = self
            .client
            .get(format!("{GRAPH_API_BASE}/{}", self.phone_number_id))
            .bearer_auth(&self.access_token)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => AdapterHealth {
                healthy: true,
                latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
                details: serde_json::json!({"running": true, "api_status": resp.status().as_u16()}),
            },
            Ok(resp) => AdapterHealth::down(serde_json::json!({
                "running": true,
                "api_status": resp.status().as_u16(),
            })),
            Err(e) => AdapterHealth::down(serde_json::json!({
                "running": true,
                "error": e.to_string(),
            })),
        }
    }

    async fn process_webhook(
        &self,
        body: &serde_json::Value,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<()> {
        let signature = signature.ok_or(AdapterError::Signature)?;
        if !self.validate_signature(raw_body, signature) {
            return Err(AdapterError::Signature);
        }

        let entries = body.get("entry").and_then(|v| v.as_array());
        for entry in entries.into_iter().flatten() {
            let changes = entry.get("changes").and_then(|v| v.as_array());
            for change in changes.into_iter().flatten() {
                let value = change.pointer("/value");
                let profile_name = value
                    .and_then(|v| v.pointer("/contacts/0/profile/name"))
                    .and_then(|v| v.as_str());
                let messages = value
                    .and_then(|v| v.get("messages"))
                    .and_then(|v| v.as_array());
                for message in messages.into_iter().flatten() {
                    self.handle_message(message, profile_name).await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cachibot_core::types::ConnectionStatus;

    struct NullEvents;

    #[async_trait]
    impl AdapterEvents for NullEvents {
        async fn on_message(
            &self,
            _connection_id: &str,
            _chat_id: &str,
            _text: &str,
            _meta: InboundMeta,
        ) -> PlatformResponse {
            PlatformResponse::empty()
        }

        async fn on_status_change(&self, _connection_id: &str, _status: ConnectionStatus) {}
    }

    fn adapter() -> WhatsAppAdapter {
        WhatsAppAdapter::new(
            "c-1",
            &serde_json::json!({
                "phone_number_id": "1234567890",
                "access_token": "token",
                "verify_token": "verify",
                "app_secret": "topsecret",
            }),
            Arc::new(NullEvents),
        )
        .unwrap()
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_accepted() {
        let adapter = adapter();
        let body = br#"{"entry":[]}"#;
        let sig = sign("topsecret", body);
        assert!(adapter.validate_signature(body, &sig));
    }

    #[test]
    fn wrong_digest_rejected() {
        let adapter = adapter();
        let body = br#"{"entry":[]}"#;
        assert!(!adapter.validate_signature(body, "sha256=deadbeef"));
    }

    #[test]
    fn wrong_secret_rejected() {
        let adapter = adapter();
        let body = br#"{"entry":[]}"#;
        let sig = sign("othersecret", body);
        assert!(!adapter.validate_signature(body, &sig));
    }

    #[test]
    fn missing_prefix_rejected() {
        let adapter = adapter();
        assert!(!adapter.validate_signature(b"{}", "deadbeef"));
    }

    #[tokio::test]
    async fn webhook_without_signature_is_rejected() {
        let adapter = adapter();
        adapter.connect().await.unwrap();
        let err = adapter
            .process_webhook(&serde_json::json!({"entry": []}), b"{\"entry\":[]}", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Signature));
    }
}
