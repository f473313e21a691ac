//! Secret scanning for diffs.
//!
//! Looks for credential-shaped values in lines a diff adds. Matched values
//! are never returned or logged; violations carry the pattern name, the
//! location and a context line with every match replaced by
//! `[REDACTED:<pattern>]`.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::diff;

/// Longest context line kept in a violation.
const MAX_CONTEXT_CHARS: usize = 160;

/// A named credential shape.
pub struct SecretPattern {
    /// Stable pattern name reported in violations.
    pub name: &'static str,
    /// Compiled expression.
    pub regex: Regex,
}

/// A credential-like value found in an added line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Which catalog entry matched.
    pub pattern_name: String,
    /// File the line is added to, if known.
    pub file: Option<String>,
    /// Line number in the new file, if known.
    pub line: Option<usize>,
    /// The added line with all matches redacted.
    pub redacted_context: String,
}

const CATALOG: &[(&str, &str)] = &[
    ("openai-key", r"sk-[A-Za-z0-9_\-]{16,}"),
    ("github-token", r"ghp_[A-Za-z0-9]{20,}"),
    ("slack-token", r"xox[baprs]-[A-Za-z0-9\-]{10,}"),
    ("google-api-key", r"AIza[0-9A-Za-z\-_]{35}"),
    (
        "generic-assignment",
        r#"(?i)(?:api[-_]?key|api|token|secret|key)["']?\s*[=:]\s*["'][A-Za-z0-9_\-]{16,}["']"#,
    ),
];

/// Returns the fixed pattern catalog, compiled once.
pub fn catalog() -> &'static [SecretPattern] {
    static PATTERNS: OnceLock<Vec<SecretPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        CATALOG
            .iter()
            .filter_map(|(name, pattern)| match Regex::new(pattern) {
                Ok(regex) => Some(SecretPattern { name, regex }),
                Err(e) => {
                    tracing::error!(pattern = name, error = %e, "invalid secret pattern");
                    None
                }
            })
            .collect()
    })
}

/// Scanner over the fixed catalog.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretScanner;

impl SecretScanner {
    /// Creates a scanner.
    pub fn new() -> Self {
        Self
    }

    /// See [`scan`].
    pub fn scan(&self, diff_text: &str) -> Vec<Violation> {
        scan(diff_text)
    }
}

/// Scans the lines a diff adds.
///
/// Removed lines, context lines and `+++` headers are ignored. Results are
/// ordered by line, then by catalog order.
pub fn scan(diff_text: &str) -> Vec<Violation> {
    let patterns = catalog();
    let mut violations = Vec::new();

    for added in diff::added_lines(diff_text) {
        for pattern in patterns {
            if pattern.regex.is_match(added.text) {
                violations.push(Violation {
                    pattern_name: pattern.name.to_string(),
                    file: added.file.clone(),
                    line: added.line,
                    redacted_context: redact(added.text, patterns),
                });
            }
        }
    }

    if !violations.is_empty() {
        tracing::warn!(count = violations.len(), "secret scan found violations");
    }
    violations
}

/// Replaces every catalog match in `text` with `[REDACTED:<pattern>]`.
pub fn redact(text: &str, patterns: &[SecretPattern]) -> String {
    let mut result = text.trim().to_string();
    for pattern in patterns {
        let replacement = format!("[REDACTED:{}]", pattern.name);
        result = pattern
            .regex
            .replace_all(&result, replacement.as_str())
            .into_owned();
    }
    truncate_chars(&result, MAX_CONTEXT_CHARS)
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
