//! Custom HTTP platform adapter.
//!
//! For user-provided platforms: inbound messages POST to the webhook
//! ingress (authenticated by a shared API key), outbound responses POST to
//! the configured callback URL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use tracing::{info, warn};

use cachibot_core::types::{InboundMeta, PlatformKind, PlatformResponse};

use crate::adapter::{AdapterEvents, AdapterHealth, PlatformAdapter};
use crate::error::{AdapterError, Result};

const MAX_MESSAGE_LENGTH: usize = 16000;

pub struct CustomAdapter {
    connection_id: String,
    callback_url: String,
    api_key: Option<String>,
    strip_md: bool,
    events: Arc<dyn AdapterEvents>,
    client: reqwest::Client,
    running: AtomicBool,
}

impl CustomAdapter {
    pub fn new(
        connection_id: &str,
        config: &serde_json::Value,
        events: Arc<dyn AdapterEvents>,
    ) -> Result<Self> {
        let callback_url = config
            .get("callback_url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::Config("Custom callback_url is required".to_string()))?
            .to_string();
        Ok(Self {
            connection_id: connection_id.to_string(),
            callback_url,
            api_key: config
                .get("api_key")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(String::from),
            strip_md: config
                .get("strip_markdown")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            events,
            client: reqwest::Client::new(),
            running: AtomicBool::new(false),
        })
    }

    async fn post_callback(&self, body: serde_json::Value) -> Result<()> {
        let mut req = self.client.post(&self.callback_url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("X-API-Key", key);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(AdapterError::Api(format!(
                "callback returned HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PlatformAdapter for CustomAdapter {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Custom
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
        info!(connection = %self.connection_id, "Custom adapter started");
        Ok(())
    }

    async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(connection = %self.connection_id, "Custom adapter stopped");
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        if !self.is_running() {
            return Err(AdapterError::NotRunning);
        }
        let formatted = self.format_outgoing(text);
        for chunk in self.chunk_message(&formatted) {
            self.post_callback(serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
            }))
            .await?;
        }
        Ok(())
    }

    /// Custom platforms define no typing protocol.
    async fn send_typing(&self, _chat_id: &str) {}

    async fn send_response(&self, chat_id: &str, response: &PlatformResponse) -> Result<()> {
        self.send_message(chat_id, &response.text).await?;
        for item in &response.media {
            self.post_callback(serde_json::json!({
                "chat_id": chat_id,
                "media": {
                    "type": item.media_type,
                    "data_base64": B64.encode(&item.data),
                },
            }))
            .await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> AdapterHealth {
        if !self.is_running() {
            return AdapterHealth::down(serde_json::json!({"running": false}));
        }
        // No probe protocol for arbitrary callbacks — running means healthy.
        AdapterHealth {
            healthy: true,
            latency_ms: None,
            details: serde_json::json!({"running": true}),
        }
    }

    /// Inbound payload shape: `{chat_id, message, user_id?, display_name?}`.
    /// `signature` carries the caller's API key (from `X-API-Key` or a
    /// bearer header); it must equal the configured key when one is set.
    async fn process_webhook(
        &self,
        body: &serde_json::Value,
        _raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<()> {
        if let Some(expected) = &self.api_key {
            if signature != Some(expected.as_str()) {
                return Err(AdapterError::Signature);
            }
        }

        let chat_id = body
            .get("chat_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::Payload("chat_id is required".to_string()))?;
        let text = body
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::Payload("message is required".to_string()))?;

        let meta = InboundMeta {
            platform: Some(PlatformKind::Custom),
            user_id: body
                .get("user_id")
                .and_then(|v| v.as_str())
                .map(String::from)
                .or_else(|| Some(chat_id.to_string())),
            username: body
                .get("display_name")
                .and_then(|v| v.as_str())
                .map(String::from),
            ..Default::default()
        };

        let response = self
            .events
            .on_message(&self.connection_id, chat_id, text, meta)
            .await;
        if response.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.send_response(chat_id, &response).await {
            warn!(connection = %self.connection_id, error = %e, "Custom: callback send failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cachibot_core::types::ConnectionStatus;
    use std::sync::Mutex;

    struct RecordingEvents {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl AdapterEvents for RecordingEvents {
        async fn on_message(
            &self,
            _connection_id: &str,
            chat_id: &str,
            text: &str,
            _meta: InboundMeta,
        ) -> PlatformResponse {
            self.seen
                .lock()
                .unwrap()
                .push((chat_id.to_string(), text.to_string()));
            PlatformResponse::empty()
        }

        async fn on_status_change(&self, _connection_id: &str, _status: ConnectionStatus) {}
    }

    fn adapter_with(events: Arc<RecordingEvents>, api_key: Option<&str>) -> CustomAdapter {
        let mut config = serde_json::json!({"callback_url": "https://example.com/cb"});
        if let Some(key) = api_key {
            config["api_key"] = serde_json::json!(key);
        }
        CustomAdapter::new("c-1", &config, events).unwrap()
    }

    #[tokio::test]
    async fn api_key_mismatch_is_rejected_without_dispatch() {
        let events = Arc::new(RecordingEvents {
            seen: Mutex::new(Vec::new()),
        });
        let adapter = adapter_with(Arc::clone(&events), Some("good-key"));
        adapter.connect().await.unwrap();

        let body = serde_json::json!({"chat_id": "u1", "message": "hi"});
        let err = adapter
            .process_webhook(&body, b"{}", Some("bad-key"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Signature));
        assert!(events.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn matching_key_dispatches_message() {
        let events = Arc::new(RecordingEvents {
            seen: Mutex::new(Vec::new()),
        });
        let adapter = adapter_with(Arc::clone(&events), Some("good-key"));
        adapter.connect().await.unwrap();

        let body = serde_json::json!({"chat_id": "u1", "message": "hi"});
        adapter
            .process_webhook(&body, b"{}", Some("good-key"))
            .await
            .unwrap();
        assert_eq!(
            events.seen.lock().unwrap().as_slice(),
            &[("u1".to_string(), "hi".to_string())]
        );
    }

    #[tokio::test]
    async fn missing_payload_fields_error() {
        let events = Arc::new(RecordingEvents {
            seen: Mutex::new(Vec::new()),
        });
        let adapter = adapter_with(events, None);
        adapter.connect().await.unwrap();

        let err = adapter
            .process_webhook(&serde_json::json!({"message": "hi"}), b"{}", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Payload(_)));
    }
}
