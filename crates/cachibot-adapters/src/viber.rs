//! Viber Bot API adapter.
//!
//! Webhook-based. Inbound events carry `X-Viber-Content-Signature`, an
//! HMAC-SHA256 hex digest of the raw body keyed by the bot auth token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};

use cachibot_core::types::{InboundMeta, PlatformKind, PlatformResponse};

use crate::adapter::{AdapterEvents, AdapterHealth, PlatformAdapter};
use crate::error::{AdapterError, Result};

type HmacSha256 = Hmac<Sha256>;

const API_BASE: &str = "https://chatapi.viber.com/pa";
const MAX_MESSAGE_LENGTH: usize = 7000;

pub struct ViberAdapter {
    connection_id: String,
    auth_token: String,
    bot_name: String,
    strip_md: bool,
    events: Arc<dyn AdapterEvents>,
    client: reqwest::Client,
    running: AtomicBool,
}

impl ViberAdapter {
    pub fn new(
        connection_id: &str,
        config: &serde_json::Value,
        events: Arc<dyn AdapterEvents>,
    ) -> Result<Self> {
        let auth_token = config
            .get("auth_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::Config("Viber auth_token is required".to_string()))?
            .to_string();
        Ok(Self {
            connection_id: connection_id.to_string(),
            auth_token,
            bot_name: config
                .get("bot_name")
                .and_then(|v| v.as_str())
                .unwrap_or("CachiBot")
                .to_string(),
            strip_md: config
                .get("strip_markdown")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            events,
            client: reqwest::Client::new(),
            running: AtomicBool::new(false),
        })
    }

    fn validate_signature(&self, raw_body: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.auth_token.as_bytes()) else {
            return false;
        };
        mac.update(raw_body);
        mac.verify_slice(&expected).is_ok()
    }

    async fn api_post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let resp: serde_json::Value = self
            .client
            .post(format!("{API_BASE}{path}"))
            .header("X-Viber-Auth-Token", &self.auth_token)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        // Viber signals errors in-band: status 0 means ok.
        if resp.get("status").and_then(|v| v.as_i64()) != Some(0) {
            return Err(AdapterError::Api(format!("Viber API error: {resp}")));
        }
        Ok(resp)
    }

    async fn send_text_chunks(&self, receiver: &str, text: &str) -> Result<()> {
        let formatted = self.format_outgoing(text);
        for chunk in self.chunk_message(&formatted) {
            if chunk.is_empty() {
                continue;
            }
            self.api_post(
                "/send_message",
                serde_json::json!({
                    "receiver": receiver,
                    "type": "text",
                    "text": chunk,
                    "sender": {"name": self.bot_name},
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_message_event(&self, body: &serde_json::Value) {
        let Some(sender_id) = body.pointer("/sender/id").and_then(|v| v.as_str()) else {
            return;
        };
        if body.pointer("/message/type").and_then(|v| v.as_str()) != Some("text") {
            return;
        }
        let text = body
            .pointer("/message/text")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if text.is_empty() {
            return;
        }

        let meta = InboundMeta {
            platform: Some(PlatformKind::Viber),
            user_id: Some(sender_id.to_string()),
            username: body
                .pointer("/sender/name")
                .and_then(|v| v.as_str())
                .map(String::from),
            message_id: body
                .get("message_token")
                .map(|v| v.to_string()),
            ..Default::default()
        };

        let response = self
            .events
            .on_message(&self.connection_id, sender_id, text, meta)
            .await;
        if response.is_empty() {
            return;
        }
        if let Err(e) = self.send_text_chunks(sender_id, &response.text).await {
            warn!(connection = %self.connection_id, error = %e, "Viber: send failed");
        }
    }
}

#[async_trait::async_trait]
impl PlatformAdapter for ViberAdapter {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Viber
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
        self.running.store(true, Ordering::SeqCst);
        info!(connection = %self.connection_id, "Viber adapter started");
        Ok(())
    }

    async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(connection = %self.connection_id, "Viber adapter stopped");
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        if !self.is_running() {
            return Err(AdapterError::NotRunning);
        }
        self.send_text_chunks(chat_id, text).await
    }

    /// Viber has no typing indicator API.
    async fn send_typing(&self, _chat_id: &str) {}

    async fn send_response(&self, chat_id: &str, response: &PlatformResponse) -> Result<()> {
        self.send_message(chat_id, &response.text).await
    }

    async fn health_check(&self) -> AdapterHealth {
        if !self.is_running() {
            return AdapterHealth::down(serde_json::json!({"running": false}));
        }
        let start = Instant::now();
        match self.api_post("/get_account_info", serde_json::json!({})).await {
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

        match body.get("event").and_then(|v| v.as_str()) {
            Some("message") => self.handle_message_event(body).await,
            // webhook/subscribed/seen/delivered events need no response.
            _ => {}
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

    #[test]
    fn hex_signature_roundtrip() {
        let adapter = ViberAdapter::new(
            "c-1",
            &serde_json::json!({"auth_token": "vibertoken"}),
            Arc::new(NullEvents),
        )
        .unwrap();

        let body = br#"{"event":"message"}"#;
        let mut mac = HmacSha256::new_from_slice(b"vibertoken").unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());

        assert!(adapter.validate_signature(body, &sig));
        assert!(!adapter.validate_signature(body, "deadbeef"));
        assert!(!adapter.validate_signature(br#"{"event":"other"}"#, &sig));
    }
}
