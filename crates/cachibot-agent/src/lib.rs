pub mod driver;
pub mod media;
pub mod toolcalls;
pub mod types;

pub use driver::{AgentRunner, Credential, DriverFactory, LlmDriver, SttDriver, TextExtractor};
pub use types::{AgentRequest, AgentResult, AgentStep, RunUsage, StepType};
