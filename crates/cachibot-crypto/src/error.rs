use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Master key error: {0}")]
    MasterKey(String),

    #[error("Encryption failed")]
    Encrypt,

    /// AEAD tag mismatch — wrong key, wrong AAD scope, or tampered data.
    #[error("Decryption failed")]
    Decrypt,

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
