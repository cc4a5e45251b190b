use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18750;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Top-level config (cachibot.toml + CACHIBOT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachibotConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub health: HealthConfig,
    /// When false, the resolver serves Layer 1 (global) only.
    /// Override with env var: CACHIBOT_PER_BOT_ENV=0
    #[serde(default = "bool_true")]
    pub per_bot_env: bool,
}

impl Default for CachibotConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            agent: AgentConfig::default(),
            auth: AuthConfig::default(),
            health: HealthConfig::default(),
            per_bot_env: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Global agent defaults — Layer 1 of the environment resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub utility_model: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_iterations: default_max_iterations(),
            utility_model: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for access/refresh tokens. Auto-generated when empty.
    #[serde(default)]
    pub token_secret: String,
    #[serde(default = "default_access_ttl")]
    pub access_ttl_secs: u64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: String::new(),
            access_ttl_secs: default_access_ttl(),
            refresh_ttl_secs: default_refresh_ttl(),
        }
    }
}

/// Adapter health-monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    /// Consecutive probe failures before the manager forces a reconnect.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Hard timeout per probe so one slow adapter can't stall the loop.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            failure_threshold: default_failure_threshold(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_model() -> String {
    "openai/gpt-4o".to_string()
}
fn default_temperature() -> f64 {
    0.6
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_max_iterations() -> u32 {
    20
}
fn default_access_ttl() -> u64 {
    3600
}
fn default_refresh_ttl() -> u64 {
    30 * 24 * 3600
}
fn default_health_interval() -> u64 {
    60
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_probe_timeout() -> u64 {
    5
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cachibot/cachibot.db", home)
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cachibot/cachibot.toml", home)
}

impl CachibotConfig {
    /// Load config from a TOML file with CACHIBOT_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cachibot/cachibot.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let mut config: CachibotConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CACHIBOT_").split("_"))
            .extract()
            .map_err(|e| crate::error::CachibotError::Config(e.to_string()))?;

        // Flat env vars that figment's "_" splitting can't reach.
        if let Ok(v) = std::env::var("CACHIBOT_PER_BOT_ENV") {
            config.per_bot_env = v != "0";
        }
        if let Ok(url) = std::env::var("CACHIBOT_DATABASE_URL") {
            if !url.is_empty() {
                config.database.path = url;
            }
        }

        Ok(config)
    }
}
