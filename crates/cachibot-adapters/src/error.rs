use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Missing or invalid config: {0}")]
    Config(String),

    #[error("Signature validation failed")]
    Signature,

    #[error("Connection is not running")]
    NotRunning,

    #[error("Connection not found: {0}")]
    NotFound(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Platform API error: {0}")]
    Api(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid payload: {0}")]
    Payload(String),
}

pub type Result<T> = std::result::Result<T, AdapterError>;
