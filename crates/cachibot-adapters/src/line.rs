//! LINE Messaging API adapter.
//!
//! Webhook-based. Inbound events are validated against `X-Line-Signature`
//! (base64 HMAC-SHA256 of the raw body, keyed by the channel secret).
//! Replies use the reply token when available and fall back to the push API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};

use cachibot_core::types::{InboundMeta, PlatformKind, PlatformResponse};

use crate::adapter::{AdapterEvents, AdapterHealth, PlatformAdapter};
use crate::error::{AdapterError, Result};

type HmacSha256 = Hmac<Sha256>;

const API_BASE: &str = "https://api.line.me/v2/bot";
const MAX_MESSAGE_LENGTH: usize = 5000;
/// LINE accepts at most five message objects per reply/push call.
const MESSAGES_PER_CALL: usize = 5;

pub struct LineAdapter {
    connection_id: String,
    access_token: String,
    channel_secret: String,
    strip_md: bool,
    events: Arc<dyn AdapterEvents>,
    client: reqwest::Client,
    running: AtomicBool,
}

impl LineAdapter {
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
                .ok_or_else(|| AdapterError::Config(format!("LINE {key} is required")))
        };
        Ok(Self {
            connection_id: connection_id.to_string(),
            access_token: get("channel_access_token")?,
            channel_secret: get("channel_secret")?,
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
        let Ok(expected) = B64.decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.channel_secret.as_bytes()) else {
            return false;
        };
        mac.update(raw_body);
        mac.verify_slice(&expected).is_ok()
    }

    async fn api_post(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let resp = self
            .client
            .post(format!("{API_BASE}{path}"))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Api(format!("LINE HTTP {status}: {detail}")));
        }
        Ok(())
    }

    fn text_messages(chunks: &[String]) -> Vec<serde_json::Value> {
        chunks
            .iter()
            .map(|c| serde_json::json!({"type": "text", "text": c}))
            .collect()
    }

    /// Reply with as many chunks as one reply call allows; push the rest.
    async fn deliver(&self, chat_id: &str, reply_token: Option<&str>, text: &str) -> Result<()> {
        let formatted = self.format_outgoing(text);
        let mut chunks = self.chunk_message(&formatted);
        chunks.retain(|c| !c.is_empty());
        if chunks.is_empty() {
            return Ok(());
        }
        let messages = Self::text_messages(&chunks);

        let mut rest = &messages[..];
        if let Some(token) = reply_token {
            let first = &messages[..messages.len().min(MESSAGES_PER_CALL)];
            let replied = self
                .api_post(
                    "/message/reply",
                    serde_json::json!({"replyToken": token, "messages": first}),
                )
                .await;
            match replied {
                Ok(()) => rest = &messages[first.len()..],
                // Reply token expired or already used — push everything.
                Err(e) => warn!(error = %e, "LINE: reply failed, falling back to push"),
            }
        }

        for batch in rest.chunks(MESSAGES_PER_CALL) {
            self.api_post(
                "/message/push",
                serde_json::json!({"to": chat_id, "messages": batch}),
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_event(&self, event: &serde_json::Value) {
        if event.get("type").and_then(|v| v.as_str()) != Some("message") {
            return;
        }
        if event.pointer("/message/type").and_then(|v| v.as_str()) != Some("text") {
            return;
        }
        let Some(user_id) = event.pointer("/source/userId").and_then(|v| v.as_str()) else {
            return;
        };
        let text = event
            .pointer("/message/text")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if text.is_empty() {
            return;
        }
        let reply_token = event
            .get("replyToken")
            .and_then(|v| v.as_str())
            .map(String::from);

        let meta = InboundMeta {
            platform: Some(PlatformKind::Line),
            user_id: Some(user_id.to_string()),
            message_id: event
                .pointer("/message/id")
                .and_then(|v| v.as_str())
                .map(String::from),
            ..Default::default()
        };

        let response = self
            .events
            .on_message(&self.connection_id, user_id, text, meta)
            .await;
        if response.is_empty() {
            return;
        }
        if let Err(e) = self
            .deliver(user_id, reply_token.as_deref(), &response.text)
            .await
        {
            warn!(connection = %self.connection_id, error = %e, "LINE: send failed");
        }
        if !response.media.is_empty() {
            // LINE media messages require externally hosted URLs.
            warn!(connection = %self.connection_id,
                  "LINE: dropping outbound media (hosted URLs required)");
        }
    }
}

#[async_trait::async_trait]
impl PlatformAdapter for LineAdapter {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Line
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
        info!(connection = %self.connection_id, "LINE adapter started");
        Ok(())
    }

    async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(connection = %self.connection_id, "LINE adapter stopped");
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        if !self.is_running() {
            return Err(AdapterError::NotRunning);
        }
        self.deliver(chat_id, None, text).await
    }

    async fn send_typing(&self, chat_id: &str) {
        // LINE's closest equivalent: the loading animation.
        let result = self
            .api_post(
                "/chat/loading/start",
                serde_json::json!({"chatId": chat_id}),
            )
            .await;
        if let Err(e) = result {
            tracing::debug!(error = %e, "LINE: loading indicator failed");
        }
    }

    async fn send_response(&self, chat_id: &str, response: &PlatformResponse) -> Result<()> {
        self.send_message(chat_id, &response.text).await
    }

    async fn health_check(&self) -> AdapterHealth {
        if !self.is_running() {
            return AdapterHealth::down(serde_json::json!({"running": false}));
        }
        let start = Instant::now();
        let result = self
            .client
            .get(format!("{API_BASE}/info"))
            .bearer_auth(&self.access_token)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => AdapterHealth {
                healthy: true,
                latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
                details: serde_json::json!({"running": true}),
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

        let events = body.get("events").and_then(|v| v.as_array());
        for event in events.into_iter().flatten() {
            self.handle_event(event).await;
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

    fn adapter() -> LineAdapter {
        LineAdapter::new(
            "c-1",
            &serde_json::json!({
                "channel_access_token": "token",
                "channel_secret": "linesecret",
            }),
            Arc::new(NullEvents),
        )
        .unwrap()
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        B64.encode(mac.finalize().into_bytes())
    }

    #[test]
    fn base64_signature_roundtrip() {
        let adapter = adapter();
        let body = br#"{"events":[]}"#;
        assert!(adapter.validate_signature(body, &sign("linesecret", body)));
        assert!(!adapter.validate_signature(body, &sign("wrong", body)));
        assert!(!adapter.validate_signature(body, "not-base64!!!"));
    }

    #[tokio::test]
    async fn tampered_body_fails_signature() {
        let adapter = adapter();
        let body = br#"{"events":[]}"#;
        let sig = sign("linesecret", body);
        let err = adapter
            .process_webhook(
                &serde_json::json!({"events": []}),
                br#"{"events":[{}]}"#,
                Some(&sig),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Signature));
    }
}
