//! Secret redaction — pattern-based masking for log records and error surfaces.
//!
//! Every log line and every audit `details` payload passes through [`scrub`]
//! before it leaves the process. Credential previews use [`mask_value`].

use std::io::{self, Write};
use std::sync::LazyLock;

use regex::Regex;

/// Patterns that match known credential shapes (provider API keys, bot tokens).
static SECRET_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    let patterns = [
        // Anthropic keys first — the OpenAI pattern would otherwise eat the prefix.
        r"sk-ant-[A-Za-z0-9_-]{8,}",
        // OpenAI-style keys (also covers sk-proj-…).
        r"sk-[A-Za-z0-9_-]{8,}",
        // Groq.
        r"gsk_[A-Za-z0-9]{8,}",
        // Google API keys.
        r"AIza[A-Za-z0-9_-]{10,}",
        // Telegram bot tokens: <numeric id>:<35-char secret>.
        r"\d{6,}:[A-Za-z0-9_-]{30,}",
    ];
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
});

/// Replace every secret-shaped substring with `[REDACTED]`.
pub fn scrub(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in SECRET_PATTERNS.iter() {
        if pattern.is_match(&out) {
            out = pattern.replace_all(&out, "[REDACTED]").to_string();
        }
    }
    out
}

/// Mask a secret for display: values of 4 chars or fewer render as `****`,
/// longer values keep only their last 4 chars. URLs (endpoint values) are
/// not secrets and render verbatim.
pub fn mask_value(value: &str) -> String {
    if value.starts_with("http://") || value.starts_with("https://") {
        return value.to_string();
    }
    let len = value.chars().count();
    if len <= 4 {
        return "****".to_string();
    }
    let tail: String = value.chars().skip(len - 4).collect();
    format!("{}{}", "*".repeat(len - 4), tail)
}

/// An `io::Write` wrapper that scrubs secrets from each buffer before
/// forwarding. Installed as the tracing-subscriber writer so no log record
/// can carry a raw credential.
pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl RedactingWriter<io::Stdout> {
    pub fn stdout() -> Self {
        Self {
            inner: io::stdout(),
        }
    }
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let scrubbed = scrub(&text);
        self.inner.write_all(scrubbed.as_bytes())?;
        // Report the original length — the caller tracks its own buffer.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrub_removes_openai_key() {
        let scrubbed = scrub("key is sk-proj-abcdefghij1234567890WXYZ ok");
        assert!(!scrubbed.contains("sk-proj-abcdefghij1234567890WXYZ"));
        assert!(scrubbed.contains("[REDACTED]"));
    }

    #[test]
    fn scrub_removes_anthropic_key_fully() {
        let scrubbed = scrub("sk-ant-REDACTED");
        assert_eq!(scrubbed, "[REDACTED]");
    }

    #[test]
    fn scrub_removes_telegram_token() {
        let scrubbed = scrub("token=123456789:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw2");
        assert!(!scrubbed.contains("AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw2"));
    }

    #[test]
    fn scrub_removes_groq_and_google_keys() {
        let scrubbed = scrub("gsk_abc12345DEF and AIzaSyB1234567890abc");
        assert!(!scrubbed.contains("gsk_abc12345DEF"));
        assert!(!scrubbed.contains("AIzaSyB1234567890abc"));
    }

    #[test]
    fn scrub_leaves_plain_text() {
        let input = "connected telegram adapter for bot b-1";
        assert_eq!(scrub(input), input);
    }

    #[test]
    fn mask_short_value() {
        assert_eq!(mask_value("abc"), "****");
        assert_eq!(mask_value("abcd"), "****");
    }

    #[test]
    fn mask_keeps_last_four() {
        assert_eq!(
            mask_value("sk-proj-abcdefghij1234567890WXYZ"),
            format!("{}WXYZ", "*".repeat(28))
        );
    }

    #[test]
    fn mask_leaves_endpoints_verbatim() {
        assert_eq!(
            mask_value("https://api.example.com/v1"),
            "https://api.example.com/v1"
        );
    }

    #[test]
    fn redacting_writer_scrubs_output() {
        let mut buf = Vec::new();
        {
            let mut w = RedactingWriter::new(&mut buf);
            w.write_all(b"leaked sk-abcdefgh123456 in log").unwrap();
        }
        let written = String::from_utf8(buf).unwrap();
        assert!(!written.contains("sk-abcdefgh123456"));
        assert!(written.contains("[REDACTED]"));
    }
}
