pub mod context;
pub mod processor;
pub mod webhook;

pub use context::{ContextBuilder, CosineSearch, Embedder, KnowledgeHit, KnowledgeSearch};
pub use processor::{Broadcaster, MessageProcessor};
pub use webhook::WebhookDispatcher;
