//! Shared utility functions for the conductor crate.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+.-]*[ \t]*\r?\n(.*?)\r?\n?```").expect("valid fence regex")
});

/// Extract a JSON object from text that may contain other content.
///
/// Every `{` is tried as a start; the first balanced span that parses as a
/// JSON object wins, so stray braces in surrounding prose are skipped.
pub fn extract_json_object(text: &str) -> Option<String> {
    text.match_indices('{').find_map(|(start, _)| {
        let candidate = balanced_object(&text[start..])?;
        serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(candidate)
            .is_ok()
            .then(|| candidate.to_string())
    })
}

/// The brace-balanced span at the start of `text`, if it closes.
fn balanced_object(text: &str) -> Option<&str> {
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..i + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Hex-encoded SHA-256 digest of the given content.
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Return the body of the first fenced code block, or the trimmed text when
/// the output is not fenced.
pub fn strip_code_fence(text: &str) -> String {
    match CODE_FENCE.captures(text).and_then(|c| c.get(1)) {
        Some(body) => format!("{}\n", body.as_str().trim_end()),
        None => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                String::new()
            } else {
                format!("{}\n", trimmed)
            }
        }
    }
}

/// Truncate text to at most `max` characters, appending a marker when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}\n[... truncated]", cut)
}
