use async_trait::async_trait;

use cachibot_core::types::{ConnectionStatus, InboundMeta, PlatformKind, PlatformResponse};

use crate::chunk;
use crate::error::{AdapterError, Result};

/// Result of one health probe.
#[derive(Debug, Clone)]
pub struct AdapterHealth {
    pub healthy: bool,
    pub latency_ms: Option<f64>,
    pub details: serde_json::Value,
}

impl AdapterHealth {
    pub fn down(details: serde_json::Value) -> Self {
        Self {
            healthy: false,
            latency_ms: None,
            details,
        }
    }
}

/// Callbacks an adapter invokes for inbound traffic and lifecycle changes.
///
/// The platform manager provides the single implementation; adapters receive
/// it at construction so they stay decoupled from routing and persistence.
#[async_trait]
pub trait AdapterEvents: Send + Sync {
    /// An inbound message arrived. Returns what the adapter should deliver
    /// back to the same chat (possibly empty — send nothing then).
    async fn on_message(
        &self,
        connection_id: &str,
        chat_id: &str,
        text: &str,
        meta: InboundMeta,
    ) -> PlatformResponse;

    /// The adapter's connection state changed outside an explicit
    /// connect/disconnect call (reconnect exhaustion, gateway drop, …).
    async fn on_status_change(&self, connection_id: &str, status: ConnectionStatus);
}

/// Common interface implemented by every platform adapter.
///
/// Implementations use interior mutability (`&self` throughout) so one
/// `Arc<dyn PlatformAdapter>` can serve concurrent sends, health probes,
/// and webhook ingress.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> PlatformKind;

    fn connection_id(&self) -> &str;

    /// Hard per-message character limit of the platform.
    fn max_message_length(&self) -> usize;

    fn is_running(&self) -> bool;

    /// Establish the connection: open the socket / start the poll loop /
    /// validate credentials, depending on the platform style.
    async fn connect(&self) -> Result<()>;

    /// Gracefully close the connection. Never fails.
    async fn disconnect(&self);

    /// Deliver plain text, chunked to the platform limit.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()>;

    /// Best-effort typing indicator (or the platform's closest equivalent).
    async fn send_typing(&self, chat_id: &str);

    /// Deliver a full pipeline response: text plus extracted media.
    async fn send_response(&self, chat_id: &str, response: &PlatformResponse) -> Result<()>;

    async fn health_check(&self) -> AdapterHealth;

    /// Whether outbound text should have markdown stripped (per-connection
    /// `strip_markdown` config flag).
    fn strip_markdown(&self) -> bool {
        false
    }

    /// Apply outbound formatting rules.
    fn format_outgoing(&self, text: &str) -> String {
        if self.strip_markdown() {
            chunk::strip_markdown(text)
        } else {
            text.to_string()
        }
    }

    /// Split text into platform-sized chunks on natural boundaries.
    fn chunk_message(&self, text: &str) -> Vec<String> {
        chunk::chunk_message(text, self.max_message_length())
    }

    /// Push-style platforms: process one webhook delivery (already routed to
    /// this connection). `signature` is the platform's signature header.
    async fn process_webhook(
        &self,
        _body: &serde_json::Value,
        _raw_body: &[u8],
        _signature: Option<&str>,
    ) -> Result<()> {
        Err(AdapterError::Unsupported("webhook ingress"))
    }
}
