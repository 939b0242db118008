//! Transcript rendering.

use regex::Regex;
use std::sync::LazyLock;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").unwrap());

/// Remove terminal escape sequences (colors, cursor movement).
pub fn strip_ansi(input: &str) -> String {
    ANSI_ESCAPE.replace_all(input, "").into_owned()
}

/// Prefix every line with a right-aligned line number. Carriage returns from the
/// pseudo-terminal are dropped.
pub fn number_lines(input: &str) -> String {
    input
        .replace("\r\n", "\n")
        .split('\n')
        .enumerate()
        .map(|(i, line)| format!("{:>6}:  {}", i + 1, line.trim_end_matches('\r')))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Transcript as shown to people: escapes stripped, lines numbered. Empty
/// transcripts render as `None`.
pub fn render(input: &str) -> Option<String> {
    let stripped = strip_ansi(input);
    if stripped.trim().is_empty() {
        return None;
    }
    Some(number_lines(&stripped))
}
