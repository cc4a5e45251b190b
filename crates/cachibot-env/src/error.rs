use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Store error: {0}")]
    Store(#[from] cachibot_store::StoreError),

    #[error("Scoped environment is not active")]
    NotActive,
}

pub type Result<T> = std::result::Result<T, EnvError>;
