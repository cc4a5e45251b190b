//! Outbound webhook fan-out.
//!
//! Bot events are delivered to registered subscribers as fire-and-forget
//! tasks: the hot path schedules and moves on. Deliveries are HMAC-signed
//! when the subscriber holds a shared secret and retried on failure with
//! fixed backoff.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{error, warn};

use cachibot_store::webhooks::WebhookSubscriber;
use cachibot_store::Store;

type HmacSha256 = Hmac<Sha256>;

/// Waits between delivery attempts.
const RETRY_DELAYS: [u64; 3] = [1, 2, 4];
/// Per-attempt HTTP timeout.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookDispatcher {
    store: Arc<Store>,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<Store>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { store, client }
    }

    /// Fire-and-forget delivery of one bot event to all matching
    /// subscribers. Never blocks and never raises into the caller.
    pub fn emit(&self, bot_id: &str, event: &str, data: serde_json::Value) {
        let store = Arc::clone(&self.store);
        let client = self.client.clone();
        let bot_id = bot_id.to_string();
        let event = event.to_string();
        tokio::spawn(async move {
            deliver_event(store, client, bot_id, event, data).await;
        });
    }
}

impl cachibot_adapters::manager::EventSink for WebhookDispatcher {
    fn emit(&self, bot_id: &str, event: &str, data: serde_json::Value) {
        WebhookDispatcher::emit(self, bot_id, event, data);
    }
}

async fn deliver_event(
    store: Arc<Store>,
    client: reqwest::Client,
    bot_id: String,
    event: String,
    data: serde_json::Value,
) {
    let subscribers = match store.webhooks_for_event(&bot_id, &event) {
        Ok(s) => s,
        Err(e) => {
            warn!(bot_id = %bot_id, event = %event, error = %e,
                  "failed to fetch webhook subscribers");
            return;
        }
    };
    if subscribers.is_empty() {
        return;
    }

    let body = serde_json::json!({
        "event": event,
        "bot_id": bot_id,
        "timestamp": chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        "data": data,
    });
    let body_bytes = match serde_json::to_vec(&body) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "failed to serialise webhook body");
            return;
        }
    };

    for subscriber in subscribers {
        let store = Arc::clone(&store);
        let client = client.clone();
        let event = event.clone();
        let body_bytes = body_bytes.clone();
        tokio::spawn(async move {
            deliver_single(store, client, subscriber, event, body_bytes).await;
        });
    }
}

/// Deliver one payload to one subscriber with retries. On success the
/// failure counter resets; on exhaustion it is incremented, which
/// eventually excludes the subscriber from dispatch.
async fn deliver_single(
    store: Arc<Store>,
    client: reqwest::Client,
    subscriber: WebhookSubscriber,
    event: String,
    body: Vec<u8>,
) {
    let signature = subscriber
        .secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .and_then(|secret| {
            HmacSha256::new_from_slice(secret.as_bytes())
                .ok()
                .map(|mut mac| {
                    mac.update(&body);
                    hex::encode(mac.finalize().into_bytes())
                })
        });

    for (attempt, delay) in RETRY_DELAYS.iter().enumerate() {
        let mut request = client
            .post(&subscriber.url)
            .header("Content-Type", "application/json")
            .header("X-CachiBot-Event", &event)
            .body(body.clone());
        if let Some(sig) = &signature {
            request = request.header("X-CachiBot-Signature", sig.clone());
        }

        match request.send().await {
            Ok(resp) if resp.status().as_u16() < 400 => {
                if let Err(e) = store.record_webhook_success(&subscriber.id) {
                    warn!(webhook = %subscriber.id, error = %e,
                          "failed to record webhook success");
                }
                return;
            }
            Ok(resp) => {
                warn!(webhook = %subscriber.id, attempt = attempt + 1,
                      status = resp.status().as_u16(), "webhook delivery rejected");
            }
            Err(e) => {
                warn!(webhook = %subscriber.id, attempt = attempt + 1, error = %e,
                      "webhook delivery failed");
            }
        }

        if attempt + 1 < RETRY_DELAYS.len() {
            tokio::time::sleep(Duration::from_secs(*delay)).await;
        }
    }

    error!(webhook = %subscriber.id, attempts = RETRY_DELAYS.len(),
           "webhook delivery exhausted retries");
    if let Err(e) = store.record_webhook_failure(&subscriber.id) {
        warn!(webhook = %subscriber.id, error = %e, "failed to record webhook failure");
    }
}
