//! Outbound text helpers shared by all adapters.
//!
//! `chunk_message` splits at the platform limit preferring paragraph, then
//! sentence, then word boundaries — and never splits a UTF-8 scalar, since
//! all indices come from `char_indices`.

use std::sync::LazyLock;

use regex::Regex;

/// Split `text` into chunks of at most `max_len` characters.
///
/// Boundary preference inside each window: last blank line, last sentence
/// end, last space, hard cut. Trailing whitespace is trimmed at each seam;
/// leading whitespace of the following chunk is dropped with it.
pub fn chunk_message(text: &str, max_len: usize) -> Vec<String> {
    if max_len == 0 || text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > max_len {
        // Byte offset of the character just past the window.
        let window_end = rest
            .char_indices()
            .nth(max_len)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let window = &rest[..window_end];

        let split_at = find_paragraph_break(window)
            .or_else(|| find_sentence_break(window))
            .or_else(|| window.rfind(' '))
            .unwrap_or(window_end);

        let chunk = rest[..split_at].trim_end();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        rest = rest[split_at..].trim_start();
    }

    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }

    chunks
}

fn find_paragraph_break(window: &str) -> Option<usize> {
    window.rfind("\n\n")
}

fn find_sentence_break(window: &str) -> Option<usize> {
    let by_punct = [". ", "! ", "? "]
        .iter()
        .filter_map(|p| window.rfind(p).map(|i| i + 1))
        .max();
    let by_newline = window.rfind('\n');
    by_punct.max(by_newline)
}

static MARKDOWN_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        // Links first so their inner text survives the emphasis passes.
        (r"\[([^\]]+)\]\([^)]*\)", "$1"),
        (r"```[a-zA-Z0-9]*\n?", ""),
        (r"`([^`]*)`", "$1"),
        (r"\*\*([^*]+)\*\*", "$1"),
        (r"__([^_]+)__", "$1"),
        (r"\*([^*]+)\*", "$1"),
        (r"(?m)^#{1,6}\s+", ""),
        (r"(?m)^>\s?", ""),
    ]
    .iter()
    .filter_map(|(p, r)| Regex::new(p).ok().map(|re| (re, *r)))
    .collect()
});

/// Remove common markdown syntax for platforms that render it literally.
pub fn strip_markdown(text: &str) -> String {
    let mut out = text.to_string();
    for (re, replacement) in MARKDOWN_PATTERNS.iter() {
        out = re.replace_all(&out, *replacement).to_string();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_chunk() {
        assert_eq!(chunk_message("hello", 100), vec!["hello"]);
    }

    #[test]
    fn no_chunk_exceeds_limit() {
        let text = "word ".repeat(500);
        for chunk in chunk_message(&text, 100) {
            assert!(chunk.chars().count() <= 100, "chunk too long: {}", chunk.len());
        }
    }

    #[test]
    fn prefers_paragraph_boundaries() {
        let para = "a".repeat(60);
        let text = format!("{para}\n\n{para}\n\n{para}");
        let chunks = chunk_message(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.trim() == para));
    }

    #[test]
    fn falls_back_to_sentence_boundaries() {
        let text = "First sentence here. Second sentence here. Third sentence is long.";
        let chunks = chunk_message(text, 45);
        assert!(chunks[0].ends_with('.'));
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 45);
        }
    }

    #[test]
    fn content_survives_chunking() {
        let text = "The quick brown fox. Jumps over the lazy dog!\n\nAnd then some more text follows here.";
        let chunks = chunk_message(text, 30);
        let rejoined: String = chunks.join(" ");
        let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(normalize(&rejoined), normalize(text));
    }

    #[test]
    fn multibyte_text_never_splits_scalars() {
        // Each char is multi-byte; a naive byte slice would panic.
        let text = "ありがとうございます。".repeat(40);
        let chunks = chunk_message(&text, 50);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 50);
        }
        assert_eq!(
            chunks.concat().chars().count(),
            text.chars().count()
        );
    }

    #[test]
    fn hard_cut_for_unbroken_run() {
        let text = "x".repeat(250);
        let chunks = chunk_message(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn strip_markdown_removes_emphasis_and_links() {
        let text = "**bold** and *italic* and [a link](https://example.com) and `code`";
        assert_eq!(strip_markdown(text), "bold and italic and a link and code");
    }

    #[test]
    fn strip_markdown_removes_headers_and_fences() {
        let text = "# Title\n```rust\nlet x = 1;\n```\n> quoted";
        let stripped = strip_markdown(text);
        assert!(!stripped.contains('#'));
        assert!(!stripped.contains("```"));
        assert!(stripped.contains("let x = 1;"));
        assert!(stripped.contains("quoted"));
    }
}
