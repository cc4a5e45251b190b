use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Messaging platform a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    Telegram,
    Discord,
    Whatsapp,
    Line,
    Viber,
    Teams,
    Custom,
    /// Control-plane chat (browser UI) — no adapter, no connection row.
    Web,
}

impl PlatformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKind::Telegram => "telegram",
            PlatformKind::Discord => "discord",
            PlatformKind::Whatsapp => "whatsapp",
            PlatformKind::Line => "line",
            PlatformKind::Viber => "viber",
            PlatformKind::Teams => "teams",
            PlatformKind::Custom => "custom",
            PlatformKind::Web => "web",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "telegram" => Some(PlatformKind::Telegram),
            "discord" => Some(PlatformKind::Discord),
            "whatsapp" => Some(PlatformKind::Whatsapp),
            "line" => Some(PlatformKind::Line),
            "viber" => Some(PlatformKind::Viber),
            "teams" => Some(PlatformKind::Teams),
            "custom" => Some(PlatformKind::Custom),
            "web" => Some(PlatformKind::Web),
            _ => None,
        }
    }

    /// Human-facing name used in auto-generated chat titles.
    pub fn display_name(&self) -> &'static str {
        match self {
            PlatformKind::Telegram => "Telegram",
            PlatformKind::Discord => "Discord",
            PlatformKind::Whatsapp => "WhatsApp",
            PlatformKind::Line => "LINE",
            PlatformKind::Viber => "Viber",
            PlatformKind::Teams => "Teams",
            PlatformKind::Custom => "Custom",
            PlatformKind::Web => "Web",
        }
    }
}

impl std::fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime state of a platform connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disconnected" => Some(ConnectionStatus::Disconnected),
            "connecting" => Some(ConnectionStatus::Connecting),
            "connected" => Some(ConnectionStatus::Connected),
            "error" => Some(ConnectionStatus::Error),
            _ => None,
        }
    }
}

/// A user-owned bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    pub name: String,
    /// Default model in `provider/model` form (e.g. "openai/gpt-4o").
    pub model: String,
    pub system_prompt: String,
    /// Coarse feature toggles: "contacts", "notes", …
    #[serde(default)]
    pub capabilities: HashMap<String, bool>,
    /// Optional per-slot model overrides ("default", "utility", …).
    #[serde(default)]
    pub models: Option<HashMap<String, String>>,
    pub owner_user_id: String,
    pub created_at: String,
}

impl Bot {
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.get(name).copied().unwrap_or(false)
    }
}

/// A persistent binding between a bot and a platform account.
///
/// `config` holds the envelope-encrypted credential blob
/// (`{_encrypted, _nonce, _salt}`) exactly as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub bot_id: String,
    pub platform: PlatformKind,
    pub display_name: String,
    pub status: ConnectionStatus,
    pub config: serde_json::Value,
    pub message_count: i64,
    pub last_activity: Option<String>,
    pub error_message: Option<String>,
    pub auto_connect: bool,
}

/// A conversation between a bot and one platform chat (or a web session).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub bot_id: String,
    pub title: String,
    pub platform: Option<PlatformKind>,
    pub platform_chat_id: Option<String>,
    pub pinned: bool,
    pub archived: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// A persisted chat message.
///
/// `metadata` carries observability only (token counts, tool-call trace,
/// media descriptors) — never raw media bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub bot_id: String,
    pub chat_id: String,
    pub role: String,
    pub content: String,
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: String,
}

/// A media attachment arriving with an inbound platform message.
#[derive(Debug, Clone)]
pub struct IncomingMedia {
    /// MIME type as reported by the platform (e.g. "image/png").
    pub media_type: String,
    pub filename: String,
    pub data: Vec<u8>,
}

/// A media item produced by the agent (decoded from a tool's data URI).
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItem {
    pub media_type: String,
    pub data: Vec<u8>,
}

/// Platform-agnostic metadata travelling with one inbound message.
#[derive(Debug, Clone, Default)]
pub struct InboundMeta {
    pub platform: Option<PlatformKind>,
    pub connection_id: Option<String>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    /// Platform message ID, when the platform provides an idempotency token.
    pub message_id: Option<String>,
    /// Text of the message being replied to, if the platform delivered one.
    pub reply_to_text: Option<String>,
    pub attachments: Vec<IncomingMedia>,
}

/// What the pipeline hands back to the adapter for delivery.
#[derive(Debug, Clone, Default)]
pub struct PlatformResponse {
    pub text: String,
    pub media: Vec<MediaItem>,
}

impl PlatformResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media: Vec::new(),
        }
    }

    /// Empty response — the adapter sends nothing (archived chats).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.media.is_empty()
    }
}

/// Current UTC timestamp in RFC 3339 — the storage format for all rows.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
