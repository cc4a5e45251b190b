pub mod error;
pub mod master;
pub mod service;

pub use error::{CryptoError, Result};
pub use master::load_master_key;
pub use service::{EncryptedValue, EncryptionService};
