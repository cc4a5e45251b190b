pub mod audit;
pub mod bots;
pub mod chats;
pub mod connections;
pub mod db;
pub mod env;
pub mod error;
pub mod knowledge;
pub mod store;
pub mod webhooks;

pub use error::{Result, StoreError};
pub use store::Store;
