pub mod adapter;
pub mod chunk;
pub mod custom;
pub mod discord;
pub mod error;
pub mod line;
pub mod manager;
pub mod registry;
pub mod teams;
pub mod telegram;
pub mod viber;
pub mod whatsapp;

pub use adapter::{AdapterEvents, AdapterHealth, PlatformAdapter};
pub use error::AdapterError;
pub use manager::{InboundProcessor, PlatformManager};
