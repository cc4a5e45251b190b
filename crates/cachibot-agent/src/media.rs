//! Extraction of tool-emitted media from an agent run.
//!
//! Tools emit generated media as base64 data URIs inside their results.
//! The pipeline pulls those out into structured media items for the
//! adapter and strips the URIs from the textual output so users never see
//! kilobytes of base64.

use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use regex::Regex;

use cachibot_core::types::MediaItem;

use crate::types::{AgentStep, StepType};

static DATA_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"data:((?:image|audio)/[a-zA-Z0-9.+-]+);base64,([A-Za-z0-9+/=]+)")
        .expect("data URI pattern")
});

/// Collect every image/audio data URI emitted by tool results, decoded.
pub fn extract_media_from_steps(steps: &[AgentStep]) -> Vec<MediaItem> {
    let mut items = Vec::new();
    for step in steps {
        if step.step_type != StepType::ToolResult {
            continue;
        }
        let Some(result) = &step.tool_result else {
            continue;
        };
        for capture in DATA_URI.captures_iter(result) {
            let media_type = capture[1].to_string();
            match B64.decode(&capture[2]) {
                Ok(data) => items.push(MediaItem { media_type, data }),
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable data URI in tool result");
                }
            }
        }
    }
    items
}

/// Remove data URIs from output text, returning the cleaned text and the
/// media that was embedded in it.
pub fn extract_media_from_text(text: &str) -> (String, Vec<MediaItem>) {
    let mut items = Vec::new();
    for capture in DATA_URI.captures_iter(text) {
        if let Ok(data) = B64.decode(&capture[2]) {
            items.push(MediaItem {
                media_type: capture[1].to_string(),
                data,
            });
        }
    }
    let cleaned = DATA_URI.replace_all(text, "").trim().to_string();
    (cleaned, items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_uri() -> String {
        format!("data:image/png;base64,{}", B64.encode(b"fake-png-bytes"))
    }

    #[test]
    fn extracts_media_from_tool_results() {
        let steps = vec![
            AgentStep::tool_call("generate_image", serde_json::json!({}), 1.0),
            AgentStep::tool_result(&format!("Here you go: {}", png_uri()), 2.0),
        ];
        let items = extract_media_from_steps(&steps);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].media_type, "image/png");
        assert_eq!(items[0].data, b"fake-png-bytes");
    }

    #[test]
    fn ignores_non_result_steps() {
        let steps = vec![AgentStep {
            step_type: StepType::Output,
            content: png_uri(),
            tool_name: None,
            tool_args: None,
            tool_result: None,
            timestamp: 0.0,
        }];
        assert!(extract_media_from_steps(&steps).is_empty());
    }

    #[test]
    fn strips_uris_from_text() {
        let text = format!("The image is ready:\n{}\nEnjoy!", png_uri());
        let (cleaned, items) = extract_media_from_text(&text);
        assert_eq!(items.len(), 1);
        assert!(!cleaned.contains("base64"));
        assert!(cleaned.contains("The image is ready:"));
        assert!(cleaned.contains("Enjoy!"));
    }

    #[test]
    fn text_without_media_is_untouched() {
        let (cleaned, items) = extract_media_from_text("plain answer");
        assert_eq!(cleaned, "plain answer");
        assert!(items.is_empty());
    }

    #[test]
    fn audio_uris_are_extracted() {
        let uri = format!("data:audio/mpeg;base64,{}", B64.encode(b"mp3"));
        let steps = vec![AgentStep::tool_result(&uri, 0.0)];
        let items = extract_media_from_steps(&steps);
        assert_eq!(items[0].media_type, "audio/mpeg");
    }
}
