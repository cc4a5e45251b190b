use thiserror::Error;

#[derive(Debug, Error)]
pub enum CachibotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Access denied: {reason}")]
    Forbidden { reason: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Adapter error ({platform}): {reason}")]
    Adapter { platform: String, reason: String },

    #[error("Decryption failed")]
    Crypto,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CachibotError {
    /// Short error code string surfaced in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CachibotError::Config(_) => "CONFIG_ERROR",
            CachibotError::AuthFailed(_) => "AUTH_FAILED",
            CachibotError::NotFound { .. } => "NOT_FOUND",
            CachibotError::Forbidden { .. } => "FORBIDDEN",
            CachibotError::Conflict(_) => "CONFLICT",
            CachibotError::Validation(_) => "VALIDATION_ERROR",
            CachibotError::Adapter { .. } => "ADAPTER_ERROR",
            CachibotError::Crypto => "CRYPTO_ERROR",
            CachibotError::RateLimited => "RATE_LIMITED",
            CachibotError::Database(_) => "DATABASE_ERROR",
            CachibotError::Serialization(_) => "SERIALIZATION_ERROR",
            CachibotError::Io(_) => "IO_ERROR",
            CachibotError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the control plane maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            CachibotError::AuthFailed(_) => 401,
            CachibotError::Forbidden { .. } => 403,
            CachibotError::NotFound { .. } => 404,
            CachibotError::Conflict(_) => 409,
            CachibotError::Validation(_) => 400,
            CachibotError::RateLimited => 429,
            _ => 500,
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CachibotError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CachibotError>;
