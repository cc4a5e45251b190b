//! Projection of agent steps into frontend-facing tool-call records.

use crate::types::{AgentStep, StepType};

/// Plain-text tool results are truncated past this length; results carrying
/// media data URIs are kept whole so the UI can render them inline.
const MAX_TOOL_RESULT: usize = 2000;

/// Pair `tool_call` steps with their subsequent `tool_result` steps (FIFO)
/// and shape them for the web UI.
pub fn project_tool_calls(steps: &[AgentStep]) -> Vec<serde_json::Value> {
    let mut tool_calls: Vec<serde_json::Value> = Vec::new();
    // Indexes into `tool_calls` still waiting for their result.
    let mut pending: std::collections::VecDeque<usize> = std::collections::VecDeque::new();

    for step in steps {
        match step.step_type {
            StepType::ToolCall => {
                let args = match &step.tool_args {
                    Some(serde_json::Value::String(raw)) => serde_json::from_str(raw)
                        .unwrap_or_else(|_| serde_json::json!({"raw": raw})),
                    Some(v) => v.clone(),
                    None => serde_json::json!({}),
                };
                let entry = serde_json::json!({
                    "id": format!("tc-{}", tool_calls.len()),
                    "tool": step.tool_name.as_deref().unwrap_or("unknown"),
                    "args": args,
                    "startTime": (step.timestamp * 1000.0) as i64,
                });
                pending.push_back(tool_calls.len());
                tool_calls.push(entry);
            }
            StepType::ToolResult => {
                let mut result = step
                    .tool_result
                    .clone()
                    .unwrap_or_else(|| step.content.clone());

                let has_media =
                    result.contains("data:image/") || result.contains("data:audio/");
                if !has_media && result.chars().count() > MAX_TOOL_RESULT {
                    let truncated: String = result.chars().take(MAX_TOOL_RESULT).collect();
                    result = format!("{truncated}\n[... truncated ...]");
                }

                if let Some(index) = pending.pop_front() {
                    let entry = &mut tool_calls[index];
                    entry["success"] = serde_json::json!(!result.starts_with("Error:"));
                    entry["result"] = serde_json::json!(result);
                    entry["endTime"] = serde_json::json!((step.timestamp * 1000.0) as i64);
                }
            }
            _ => {}
        }
    }

    tool_calls
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_calls_with_results_in_order() {
        let steps = vec![
            AgentStep::tool_call("search", serde_json::json!({"q": "rust"}), 1.0),
            AgentStep::tool_call("fetch", serde_json::json!({"url": "x"}), 1.5),
            AgentStep::tool_result("search result", 2.0),
            AgentStep::tool_result("Error: fetch failed", 2.5),
        ];
        let calls = project_tool_calls(&steps);
        assert_eq!(calls.len(), 2);

        assert_eq!(calls[0]["tool"], "search");
        assert_eq!(calls[0]["result"], "search result");
        assert_eq!(calls[0]["success"], true);
        assert_eq!(calls[0]["startTime"], 1000);
        assert_eq!(calls[0]["endTime"], 2000);

        assert_eq!(calls[1]["tool"], "fetch");
        assert_eq!(calls[1]["success"], false);
    }

    #[test]
    fn long_plain_results_are_truncated() {
        let steps = vec![
            AgentStep::tool_call("read", serde_json::json!({}), 0.0),
            AgentStep::tool_result(&"x".repeat(5000), 0.0),
        ];
        let calls = project_tool_calls(&steps);
        let result = calls[0]["result"].as_str().unwrap();
        assert!(result.len() < 2100);
        assert!(result.ends_with("[... truncated ...]"));
    }

    #[test]
    fn media_results_are_not_truncated() {
        let big_uri = format!("data:image/png;base64,{}", "A".repeat(5000));
        let steps = vec![
            AgentStep::tool_call("generate", serde_json::json!({}), 0.0),
            AgentStep::tool_result(&big_uri, 0.0),
        ];
        let calls = project_tool_calls(&steps);
        assert_eq!(calls[0]["result"].as_str().unwrap(), big_uri);
    }

    #[test]
    fn string_args_are_parsed_as_json() {
        let steps = vec![AgentStep::tool_call(
            "calc",
            serde_json::Value::String(r#"{"x": 1}"#.to_string()),
            0.0,
        )];
        let calls = project_tool_calls(&steps);
        assert_eq!(calls[0]["args"]["x"], 1);
    }

    #[test]
    fn unparsable_string_args_become_raw() {
        let steps = vec![AgentStep::tool_call(
            "calc",
            serde_json::Value::String("not json".to_string()),
            0.0,
        )];
        let calls = project_tool_calls(&steps);
        assert_eq!(calls[0]["args"]["raw"], "not json");
    }

    #[test]
    fn orphan_result_is_ignored() {
        let steps = vec![AgentStep::tool_result("no call", 0.0)];
        assert!(project_tool_calls(&steps).is_empty());
    }
}
