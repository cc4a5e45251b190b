//! The pipeline-facing shape of one agent run.
//!
//! The agent loop itself is an external collaborator: the pipeline hands it
//! an [`AgentRequest`] and consumes the `{output_text, steps, run_usage}`
//! it returns. Steps are the raw trace the media extractor and tool-call
//! projection walk afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Thought,
    ToolCall,
    ToolResult,
    Output,
}

/// One step of the agent's run trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    pub step_type: StepType,
    #[serde(default)]
    pub content: String,
    pub tool_name: Option<String>,
    pub tool_args: Option<serde_json::Value>,
    pub tool_result: Option<String>,
    /// Unix epoch seconds (fractional).
    #[serde(default)]
    pub timestamp: f64,
}

impl AgentStep {
    pub fn tool_call(name: &str, args: serde_json::Value, timestamp: f64) -> Self {
        Self {
            step_type: StepType::ToolCall,
            content: String::new(),
            tool_name: Some(name.to_string()),
            tool_args: Some(args),
            tool_result: None,
            timestamp,
        }
    }

    pub fn tool_result(result: &str, timestamp: f64) -> Self {
        Self {
            step_type: StepType::ToolResult,
            content: String::new(),
            tool_name: None,
            tool_args: None,
            tool_result: Some(result.to_string()),
            timestamp,
        }
    }
}

/// Aggregate usage for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunUsage {
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    pub total_elapsed_ms: f64,
    pub tokens_per_second: f64,
    pub call_count: u32,
    pub errors: u32,
}

#[derive(Debug, Clone, Default)]
pub struct AgentResult {
    pub output_text: String,
    pub steps: Vec<AgentStep>,
    pub run_usage: RunUsage,
}

/// Everything the pipeline passes into one agent run. Credentials travel
/// only through the pre-built `driver` — never as loose strings.
pub struct AgentRequest {
    pub system_prompt: String,
    pub user_text: String,
    /// Raw image bytes for vision input.
    pub images: Vec<Vec<u8>>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub max_iterations: u32,
    pub skill_configs: HashMap<String, serde_json::Value>,
    /// Per-request driver bound to a resolved credential; `None` falls back
    /// to the process-global driver.
    pub driver: Option<Arc<dyn crate::driver::LlmDriver>>,
}
