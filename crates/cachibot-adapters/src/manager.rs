//! Platform adapter manager — lifecycle, dispatch routing, health monitoring.
//!
//! Owns the live adapter handles keyed by connection ID. Mutations of the
//! handle table go through one coarse lock; reads (dispatch, webhook
//! ingress, health probes) are lock-free through the DashMap.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cachibot_core::config::HealthConfig;
use cachibot_core::types::{ConnectionStatus, InboundMeta, PlatformKind, PlatformResponse};
use cachibot_crypto::EncryptionService;
use cachibot_store::Store;

use crate::adapter::{AdapterEvents, PlatformAdapter};
use crate::error::{AdapterError, Result};
use crate::registry;

/// Processes one inbound message end-to-end (the message pipeline).
#[async_trait]
pub trait InboundProcessor: Send + Sync {
    async fn process(
        &self,
        bot_id: &str,
        platform_chat_id: &str,
        text: &str,
        meta: InboundMeta,
    ) -> PlatformResponse;
}

/// Fire-and-forget sink for bot events (outbound webhook fan-out).
pub trait EventSink: Send + Sync {
    fn emit(&self, bot_id: &str, event: &str, data: serde_json::Value);
}

pub struct PlatformManager {
    store: Arc<Store>,
    crypto: Arc<EncryptionService>,
    health: HealthConfig,
    adapters: DashMap<String, Arc<dyn PlatformAdapter>>,
    /// Serialises connect/disconnect; reads stay lock-free.
    mutate_lock: tokio::sync::Mutex<()>,
    processor: OnceLock<Arc<dyn InboundProcessor>>,
    event_sink: OnceLock<Arc<dyn EventSink>>,
    probe_failures: DashMap<String, u32>,
    monitor_cancel: CancellationToken,
    monitor_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PlatformManager {
    pub fn new(store: Arc<Store>, crypto: Arc<EncryptionService>, health: HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            crypto,
            health,
            adapters: DashMap::new(),
            mutate_lock: tokio::sync::Mutex::new(()),
            processor: OnceLock::new(),
            event_sink: OnceLock::new(),
            probe_failures: DashMap::new(),
            monitor_cancel: CancellationToken::new(),
            monitor_task: std::sync::Mutex::new(None),
        })
    }

    /// Bind the message pipeline. Called once at startup, after both the
    /// manager and the pipeline exist.
    pub fn set_processor(&self, processor: Arc<dyn InboundProcessor>) {
        let _ = self.processor.set(processor);
    }

    pub fn set_event_sink(&self, sink: Arc<dyn EventSink>) {
        let _ = self.event_sink.set(sink);
    }

    pub fn get_adapter(&self, connection_id: &str) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(connection_id).map(|e| Arc::clone(&e))
    }

    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.get_adapter(connection_id)
            .map(|a| a.is_running())
            .unwrap_or(false)
    }

    /// Start a platform connection.
    pub async fn connect(self: &Arc<Self>, connection_id: &str) -> Result<()> {
        let _guard = self.mutate_lock.lock().await;

        if let Some(existing) = self.get_adapter(connection_id) {
            if existing.is_running() {
                return Ok(());
            }
            self.adapters.remove(connection_id);
        }

        let connection = self
            .store
            .get_connection(connection_id)
            .map_err(|e| AdapterError::Api(e.to_string()))?
            .ok_or_else(|| AdapterError::NotFound(connection_id.to_string()))?;

        // At most one connected adapter per (bot, platform kind).
        let siblings = self
            .store
            .connections_for_bot(&connection.bot_id)
            .map_err(|e| AdapterError::Api(e.to_string()))?;
        for sibling in siblings {
            if sibling.id != connection.id
                && sibling.platform == connection.platform
                && self.is_connected(&sibling.id)
            {
                return Err(AdapterError::Config(format!(
                    "bot already has a connected {} connection ({})",
                    connection.platform, sibling.id
                )));
            }
        }

        let config = self
            .crypto
            .decrypt_connection_config(&connection.config, &connection.bot_id)
            .map_err(|_| AdapterError::Config("failed to decrypt connection config".to_string()))?;

        self.persist_status(connection_id, ConnectionStatus::Connecting, None);

        let events: Arc<dyn AdapterEvents> = Arc::new(ManagerEvents {
            manager: Arc::downgrade(self),
        });
        let adapter =
            registry::build_adapter(connection.platform, connection_id, config, events)?;

        match adapter.connect().await {
            Ok(()) => {
                self.adapters.insert(connection_id.to_string(), adapter);
                self.persist_status(connection_id, ConnectionStatus::Connected, None);
                self.emit_status_event(&connection.bot_id, connection_id, ConnectionStatus::Connected);
                info!(connection = %connection_id, platform = %connection.platform, "adapter connected");
                Ok(())
            }
            Err(e) => {
                self.persist_status(connection_id, ConnectionStatus::Error, Some(&e.to_string()));
                self.emit_status_event(&connection.bot_id, connection_id, ConnectionStatus::Error);
                Err(e)
            }
        }
    }

    /// Stop a platform connection.
    pub async fn disconnect(&self, connection_id: &str) -> Result<()> {
        let _guard = self.mutate_lock.lock().await;

        if let Some((_, adapter)) = self.adapters.remove(connection_id) {
            adapter.disconnect().await;
        }
        self.probe_failures.remove(connection_id);
        self.persist_status(connection_id, ConnectionStatus::Disconnected, None);
        info!(connection = %connection_id, "adapter disconnected");
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let _guard = self.mutate_lock.lock().await;
        let ids: Vec<String> = self.adapters.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, adapter)) = self.adapters.remove(&id) {
                adapter.disconnect().await;
            }
            self.persist_status(&id, ConnectionStatus::Disconnected, None);
        }
    }

    /// Send plain text through a connection. Returns false when the
    /// connection is not running or the platform send fails.
    pub async fn send_message(&self, connection_id: &str, chat_id: &str, text: &str) -> bool {
        let Some(adapter) = self.get_adapter(connection_id) else {
            return false;
        };
        if !adapter.is_running() {
            return false;
        }
        match adapter.send_message(chat_id, text).await {
            Ok(()) => true,
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "send failed");
                false
            }
        }
    }

    /// Send to whichever of the bot's connections speaks `platform`.
    pub async fn send_to_bot_connection(
        &self,
        bot_id: &str,
        platform: PlatformKind,
        chat_id: &str,
        text: &str,
    ) -> bool {
        let connections = match self.store.connections_for_bot(bot_id) {
            Ok(c) => c,
            Err(e) => {
                warn!(bot_id = %bot_id, error = %e, "failed to list connections");
                return false;
            }
        };
        for conn in connections {
            if conn.platform == platform && self.is_connected(&conn.id) {
                return self.send_message(&conn.id, chat_id, text).await;
            }
        }
        false
    }

    /// Post-restart recovery: stored statuses are stale, so reset them all
    /// and reconnect every `auto_connect` connection. Failures are logged
    /// and never abort startup.
    pub async fn reconnect_all(self: &Arc<Self>) {
        if let Err(e) = self.store.reset_connection_statuses() {
            error!(error = %e, "failed to reset connection statuses");
        }

        let connections = match self.store.auto_connect_connections() {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to list auto-connect connections");
                return;
            }
        };

        for conn in connections {
            if let Err(e) = self.connect(&conn.id).await {
                error!(connection = %conn.id, platform = %conn.platform, error = %e,
                       "auto-connect failed");
            }
        }
    }

    /// Route one inbound message from an adapter into the pipeline.
    ///
    /// Resolves the owning bot, bumps the connection's activity counters,
    /// and invokes the bound processor.
    pub async fn handle_inbound(
        &self,
        connection_id: &str,
        chat_id: &str,
        text: &str,
        mut meta: InboundMeta,
    ) -> PlatformResponse {
        let connection = match self.store.get_connection(connection_id) {
            Ok(Some(c)) => c,
            Ok(None) => {
                warn!(connection = %connection_id, "inbound message for unknown connection");
                return PlatformResponse::text("Connection not found.");
            }
            Err(e) => {
                error!(connection = %connection_id, error = %e, "connection lookup failed");
                return PlatformResponse::text("Sorry, I encountered an error.");
            }
        };

        let Some(processor) = self.processor.get() else {
            return PlatformResponse::text("Bot is not configured to respond.");
        };

        if let Err(e) = self.store.record_connection_activity(connection_id) {
            warn!(connection = %connection_id, error = %e, "failed to record activity");
        }

        meta.platform = Some(connection.platform);
        meta.connection_id = Some(connection_id.to_string());

        processor
            .process(&connection.bot_id, chat_id, text, meta)
            .await
    }

    // ── Health monitor ────────────────────────────────────────────────────

    /// Start the per-process probe loop. Each connected adapter is probed
    /// every `interval_secs`; after `failure_threshold` consecutive
    /// failures the connection is forced through a reconnect.
    pub fn start_health_monitor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let cancel = self.monitor_cancel.clone();
        let interval = Duration::from_secs(self.health.interval_secs);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(manager) = weak.upgrade() else { break };
                manager.run_health_pass().await;
            }
        });

        *self.monitor_task.lock().unwrap() = Some(task);
    }

    pub fn stop_health_monitor(&self) {
        self.monitor_cancel.cancel();
        if let Some(task) = self.monitor_task.lock().unwrap().take() {
            task.abort();
        }
    }

    async fn run_health_pass(self: &Arc<Self>) {
        let probe_timeout = Duration::from_secs(self.health.probe_timeout_secs);
        let snapshot: Vec<(String, Arc<dyn PlatformAdapter>)> = self
            .adapters
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(&e)))
            .collect();

        for (id, adapter) in snapshot {
            if !adapter.is_running() {
                continue;
            }

            // A slow adapter must not stall the whole pass.
            let healthy = match tokio::time::timeout(probe_timeout, adapter.health_check()).await {
                Ok(health) => health.healthy,
                Err(_) => false,
            };

            if healthy {
                self.probe_failures.remove(&id);
                continue;
            }

            let failures = {
                let mut entry = self.probe_failures.entry(id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            warn!(connection = %id, failures, "health probe failed");

            if failures >= self.health.failure_threshold {
                warn!(connection = %id, "health threshold reached, forcing reconnect");
                self.probe_failures.remove(&id);
                let _ = self.disconnect(&id).await;
                if let Err(e) = self.connect(&id).await {
                    error!(connection = %id, error = %e, "health-triggered reconnect failed");
                }
            }
        }
    }

    // ── Internal helpers ──────────────────────────────────────────────────

    fn persist_status(&self, connection_id: &str, status: ConnectionStatus, error: Option<&str>) {
        if let Err(e) = self
            .store
            .update_connection_status(connection_id, status, error)
        {
            warn!(connection = %connection_id, error = %e, "failed to persist status");
        }
    }

    fn emit_status_event(&self, bot_id: &str, connection_id: &str, status: ConnectionStatus) {
        if let Some(sink) = self.event_sink.get() {
            sink.emit(
                bot_id,
                "connection.status_changed",
                serde_json::json!({
                    "connection_id": connection_id,
                    "status": status.as_str(),
                }),
            );
        }
    }
}

/// The adapter-facing callback surface, backed by the manager.
struct ManagerEvents {
    manager: Weak<PlatformManager>,
}

#[async_trait]
impl AdapterEvents for ManagerEvents {
    async fn on_message(
        &self,
        connection_id: &str,
        chat_id: &str,
        text: &str,
        meta: InboundMeta,
    ) -> PlatformResponse {
        let Some(manager) = self.manager.upgrade() else {
            return PlatformResponse::empty();
        };
        manager
            .handle_inbound(connection_id, chat_id, text, meta)
            .await
    }

    async fn on_status_change(&self, connection_id: &str, status: ConnectionStatus) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        manager.persist_status(connection_id, status, None);

        if let Ok(Some(conn)) = manager.store.get_connection(connection_id) {
            manager.emit_status_event(&conn.bot_id, connection_id, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachibot_core::types::Connection;

    struct EchoProcessor;

    #[async_trait]
    impl InboundProcessor for EchoProcessor {
        async fn process(
            &self,
            bot_id: &str,
            chat_id: &str,
            text: &str,
            meta: InboundMeta,
        ) -> PlatformResponse {
            let platform = meta.platform.map(|p| p.to_string()).unwrap_or_default();
            PlatformResponse::text(format!("{bot_id}/{chat_id}/{platform}: {text}"))
        }
    }

    fn manager_with_connection() -> Arc<PlatformManager> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .create_connection(&Connection {
                id: "c-1".to_string(),
                bot_id: "b-1".to_string(),
                platform: PlatformKind::Telegram,
                display_name: "Main".to_string(),
                status: ConnectionStatus::Disconnected,
                config: serde_json::json!({}),
                message_count: 0,
                last_activity: None,
                error_message: None,
                auto_connect: false,
            })
            .unwrap();
        let crypto = Arc::new(EncryptionService::new([0x42u8; 32]));
        PlatformManager::new(store, crypto, HealthConfig::default())
    }

    #[tokio::test]
    async fn inbound_routes_to_processor_with_platform_meta() {
        let manager = manager_with_connection();
        manager.set_processor(Arc::new(EchoProcessor));

        let response = manager
            .handle_inbound("c-1", "chat-9", "hello", InboundMeta::default())
            .await;
        assert_eq!(response.text, "b-1/chat-9/telegram: hello");
    }

    #[tokio::test]
    async fn inbound_counts_activity() {
        let manager = manager_with_connection();
        manager.set_processor(Arc::new(EchoProcessor));

        manager
            .handle_inbound("c-1", "chat-9", "one", InboundMeta::default())
            .await;
        manager
            .handle_inbound("c-1", "chat-9", "two", InboundMeta::default())
            .await;

        let conn = manager.store.get_connection("c-1").unwrap().unwrap();
        assert_eq!(conn.message_count, 2);
    }

    #[tokio::test]
    async fn unknown_connection_gets_static_reply() {
        let manager = manager_with_connection();
        manager.set_processor(Arc::new(EchoProcessor));

        let response = manager
            .handle_inbound("nope", "chat-9", "hello", InboundMeta::default())
            .await;
        assert_eq!(response.text, "Connection not found.");
    }

    #[tokio::test]
    async fn unbound_processor_gets_static_reply() {
        let manager = manager_with_connection();
        let response = manager
            .handle_inbound("c-1", "chat-9", "hello", InboundMeta::default())
            .await;
        assert_eq!(response.text, "Bot is not configured to respond.");
    }

    #[tokio::test]
    async fn connect_unknown_connection_errors() {
        let manager = manager_with_connection();
        let err = manager.connect("missing").await.unwrap_err();
        assert!(matches!(err, AdapterError::NotFound(_)));
    }
}
