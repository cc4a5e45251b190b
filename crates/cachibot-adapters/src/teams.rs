//! Microsoft Teams adapter (Bot Framework).
//!
//! Webhook-based. `connect` acquires a client-credentials token from the
//! Bot Framework login endpoint; inbound activities arrive through the
//! webhook ingress. Caller authentication for inbound activities is the Bot
//! Framework JWT exchange, which the ingress trusts the reverse proxy /
//! App Service layer to have enforced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

use cachibot_core::types::{InboundMeta, PlatformKind, PlatformResponse};

use crate::adapter::{AdapterEvents, AdapterHealth, PlatformAdapter};
use crate::error::{AdapterError, Result};

const LOGIN_URL: &str =
    "https://login.microsoftonline.com/botframework.com/oauth2/v2.0/token";
const TOKEN_SCOPE: &str = "https://api.botframework.com/.default";
const MAX_MESSAGE_LENGTH: usize = 4000;

struct CachedToken {
    token: String,
    expires_at: Instant,
}

pub struct TeamsAdapter {
    connection_id: String,
    app_id: String,
    app_password: String,
    strip_md: bool,
    events: Arc<dyn AdapterEvents>,
    client: reqwest::Client,
    running: AtomicBool,
    token: RwLock<Option<CachedToken>>,
    /// conversation id → serviceUrl, learned from inbound activities.
    service_urls: DashMap<String, String>,
}

impl TeamsAdapter {
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
                .ok_or_else(|| AdapterError::Config(format!("Teams {key} is required")))
        };
        Ok(Self {
            connection_id: connection_id.to_string(),
            app_id: get("app_id")?,
            app_password: get("app_password")?,
            strip_md: config
                .get("strip_markdown")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            events,
            client: reqwest::Client::new(),
            running: AtomicBool::new(false),
            token: RwLock::new(None),
            service_urls: DashMap::new(),
        })
    }

    /// Return a valid bearer token, refreshing through the login endpoint
    /// when the cached one is near expiry.
    async fn ensure_token(&self) -> Result<String> {
        {
            let cached = self.token.read().await;
            if let Some(t) = cached.as_ref() {
                if t.expires_at > Instant::now() + Duration::from_secs(60) {
                    return Ok(t.token.clone());
                }
            }
        }

        let resp: serde_json::Value = self
            .client
            .post(LOGIN_URL)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.app_id.as_str()),
                ("client_secret", self.app_password.as_str()),
                ("scope", TOKEN_SCOPE),
            ])
            .send()
            .await?
            .json()
            .await?;

        let token = resp
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::Api(format!("token exchange failed: {resp}")))?
            .to_string();
        let expires_in = resp
            .get("expires_in")
            .and_then(|v| v.as_u64())
            .unwrap_or(3600);

        *self.token.write().await = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        Ok(token)
    }

    async fn post_activity(
        &self,
        conversation_id: &str,
        activity: serde_json::Value,
    ) -> Result<()> {
        let service_url = self
            .service_urls
            .get(conversation_id)
            .map(|e| e.clone())
            .ok_or_else(|| {
                AdapterError::Api(format!(
                    "no known service URL for conversation {conversation_id}"
                ))
            })?;
        let token = self.ensure_token().await?;

        let url = format!(
            "{}/v3/conversations/{}/activities",
            service_url.trim_end_matches('/'),
            conversation_id
        );
        let resp = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&activity)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Api(format!("Teams HTTP {status}: {detail}")));
        }
        Ok(())
    }

    async fn handle_activity(&self, activity: &serde_json::Value) {
        if activity.get("type").and_then(|v| v.as_str()) != Some("message") {
            return;
        }
        let Some(conversation_id) = activity
            .pointer("/conversation/id")
            .and_then(|v| v.as_str())
        else {
            return;
        };
        if let Some(service_url) = activity.get("serviceUrl").and_then(|v| v.as_str()) {
            self.service_urls
                .insert(conversation_id.to_string(), service_url.to_string());
        }

        let text = activity
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim();
        if text.is_empty() {
            return;
        }

        let meta = InboundMeta {
            platform: Some(PlatformKind::Teams),
            user_id: activity
                .pointer("/from/id")
                .and_then(|v| v.as_str())
                .map(String::from),
            username: activity
                .pointer("/from/name")
                .and_then(|v| v.as_str())
                .map(String::from),
            message_id: activity.get("id").and_then(|v| v.as_str()).map(String::from),
            ..Default::default()
        };

        let response = self
            .events
            .on_message(&self.connection_id, conversation_id, text, meta)
            .await;
        if response.is_empty() {
            return;
        }
        if let Err(e) = self.send_response(conversation_id, &response).await {
            warn!(connection = %self.connection_id, error = %e, "Teams: send failed");
        }
    }
}

#[async_trait::async_trait]
impl PlatformAdapter for TeamsAdapter {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Teams
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

    /// Validates the app credentials by performing the token exchange.
    async fn connect(&self) -> Result<()> {
        self.ensure_token().await?;
        self.running.store(true, Ordering::SeqCst);
        info!(connection = %self.connection_id, "Teams adapter started");
        Ok(())
    }

    async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.token.write().await = None;
        info!(connection = %self.connection_id, "Teams adapter stopped");
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        if !self.is_running() {
            return Err(AdapterError::NotRunning);
        }
        let formatted = self.format_outgoing(text);
        for chunk in self.chunk_message(&formatted) {
            self.post_activity(
                chat_id,
                serde_json::json!({"type": "message", "text": chunk}),
            )
            .await?;
        }
        Ok(())
    }

    async fn send_typing(&self, chat_id: &str) {
        let result = self
            .post_activity(chat_id, serde_json::json!({"type": "typing"}))
            .await;
        if let Err(e) = result {
            tracing::debug!(error = %e, "Teams: typing activity failed");
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
        match self.ensure_token().await {
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
        _raw_body: &[u8],
        _signature: Option<&str>,
    ) -> Result<()> {
        self.handle_activity(body).await;
        Ok(())
    }
}
