//! Seams to the external LLM/agent machinery.
//!
//! Driver implementations, the agent loop, STT, and document parsing live
//! outside this workspace; these traits are the contracts the pipeline
//! composes against.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::types::{AgentRequest, AgentResult};

/// An LLM driver instance, already bound to its credential.
pub trait LlmDriver: Send + Sync {
    /// Provider name (e.g. "openai").
    fn provider(&self) -> &str;
}

/// A resolved credential for building a per-request driver.
#[derive(Clone)]
pub enum Credential {
    ApiKey(String),
    Endpoint(String),
}

/// Builds driver instances bound to per-request credentials. Keys flow only
/// as constructor arguments, never through process environment.
pub trait DriverFactory: Send + Sync {
    fn build(&self, model: &str, credential: Credential) -> Option<std::sync::Arc<dyn LlmDriver>>;
}

/// The agent loop.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one agentic turn. Cancelling the token stops the loop
    /// cooperatively at its next suspension point.
    async fn run(&self, request: AgentRequest, cancel: CancellationToken)
        -> anyhow::Result<AgentResult>;
}

/// Speech-to-text driver for audio attachments.
#[async_trait]
pub trait SttDriver: Send + Sync {
    async fn transcribe(&self, audio: &[u8], filename: &str) -> anyhow::Result<String>;
}

/// Document text extraction (PDF parsing runs in a bounded worker pool on
/// the implementor's side).
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_pdf_text(&self, data: &[u8]) -> anyhow::Result<String>;
}
