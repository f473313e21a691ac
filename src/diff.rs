//! Unified diff inspection.
//!
//! Only the parts of the format the fortress needs: header/hunk shape,
//! added and removed line counts, touched paths, and added-line positions.

use serde::{Deserialize, Serialize};

/// Line statistics for one diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    /// Lines added (excluding `+++` headers).
    pub added: usize,
    /// Lines removed (excluding `---` headers).
    pub removed: usize,
    /// Files touched, in order of appearance.
    pub files: Vec<String>,
}

impl DiffStats {
    /// Added plus removed lines.
    pub fn line_count(&self) -> usize {
        self.added + self.removed
    }
}

/// One line added by a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedLine<'a> {
    /// Target file, if a `+++` header was seen.
    pub file: Option<String>,
    /// Line number in the new file, if a hunk header was seen.
    pub line: Option<usize>,
    /// Text without the leading `+`.
    pub text: &'a str,
}

/// One diff line, classified with hunk boundaries taken into account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Line<'a> {
    OldHeader(&'a str),
    NewHeader(&'a str),
    Hunk(&'a str),
    Added(&'a str),
    Removed,
    Context,
    Meta(&'a str),
}

/// Walks a diff, treating `---`/`+++` as headers only outside a hunk.
///
/// Inside a hunk the `@@ -a,b +c,d @@` counts decide where the hunk ends, so
/// an added line whose text starts with `++ ` is still an added line.
fn classify(diff: &str) -> Vec<Line<'_>> {
    let mut out = Vec::new();
    let mut old_left = 0usize;
    let mut new_left = 0usize;

    for line in diff.lines() {
        if old_left > 0 || new_left > 0 {
            if let Some(text) = line.strip_prefix('+') {
                new_left = new_left.saturating_sub(1);
                out.push(Line::Added(text));
                continue;
            }
            if line.starts_with('-') {
                old_left = old_left.saturating_sub(1);
                out.push(Line::Removed);
                continue;
            }
            if line.is_empty() || line.starts_with(' ') {
                old_left = old_left.saturating_sub(1);
                new_left = new_left.saturating_sub(1);
                out.push(Line::Context);
                continue;
            }
            if line.starts_with('\\') {
                out.push(Line::Meta(line));
                continue;
            }
            // a short hunk; fall through and read the line as a header
            old_left = 0;
            new_left = 0;
        }

        if line.starts_with("+++ ") || line == "+++" {
            out.push(Line::NewHeader(line));
        } else if line.starts_with("--- ") || line == "---" {
            out.push(Line::OldHeader(line));
        } else if line.starts_with("@@") {
            if let Some((old_len, new_len)) = hunk_lengths(line) {
                old_left = old_len;
                new_left = new_len;
            }
            out.push(Line::Hunk(line));
        } else if let Some(text) = line.strip_prefix('+') {
            out.push(Line::Added(text));
        } else if line.starts_with('-') {
            out.push(Line::Removed);
        } else {
            out.push(Line::Meta(line));
        }
    }
    out
}

/// Counts added/removed lines and collects touched files.
pub fn stats(diff: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in classify(diff) {
        match line {
            Line::NewHeader(header) => {
                if let Some(path) = header_path(header) {
                    push_unique(&mut stats.files, &path);
                }
            }
            Line::Added(_) => stats.added += 1,
            Line::Removed => stats.removed += 1,
            _ => {}
        }
    }
    stats
}

/// Cheap shape check: file headers plus at least one hunk or change line.
pub fn is_unified_diff(diff: &str) -> bool {
    let lines = classify(diff);
    let has_old = lines.iter().any(|l| matches!(l, Line::OldHeader(_)));
    let has_new = lines.iter().any(|l| matches!(l, Line::NewHeader(_)));
    let has_body = lines
        .iter()
        .any(|l| matches!(l, Line::Hunk(_) | Line::Added(_) | Line::Removed));
    has_old && has_new && has_body
}

/// Every repository-relative path named by either header of each file.
///
/// `/dev/null` sides are skipped.
pub fn touched_paths(diff: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in classify(diff) {
        match line {
            Line::OldHeader(header) | Line::NewHeader(header) => {
                if let Some(path) = header_path(header) {
                    push_unique(&mut paths, &path);
                }
            }
            Line::Meta(meta) => {
                if let Some(rest) = meta
                    .strip_prefix("rename from ")
                    .or_else(|| meta.strip_prefix("rename to "))
                {
                    push_unique(&mut paths, rest.trim());
                }
            }
            _ => {}
        }
    }
    paths
}

/// Lines added by the diff with their file and new-file line number.
pub fn added_lines(diff: &str) -> Vec<AddedLine<'_>> {
    let mut out = Vec::new();
    let mut file: Option<String> = None;
    let mut next_line: Option<usize> = None;

    for line in classify(diff) {
        match line {
            Line::NewHeader(header) => {
                file = header_path(header);
                next_line = None;
            }
            Line::Hunk(header) => next_line = hunk_new_start(header),
            Line::Added(text) => {
                out.push(AddedLine {
                    file: file.clone(),
                    line: next_line,
                    text,
                });
                next_line = next_line.map(|n| n + 1);
            }
            Line::Context => next_line = next_line.map(|n| n + 1),
            Line::OldHeader(_) | Line::Removed | Line::Meta(_) => {}
        }
    }
    out
}

/// Extracts `<path>` from `--- a/<path>` / `+++ b/<path>` headers.
fn header_path(line: &str) -> Option<String> {
    let rest = line.get(4..)?.trim_end();
    // git appends a tab and timestamp in some modes
    let rest = rest.split('\t').next().unwrap_or(rest);
    if rest.is_empty() || rest == "/dev/null" {
        return None;
    }
    let path = rest
        .strip_prefix("a/")
        .or_else(|| rest.strip_prefix("b/"))
        .unwrap_or(rest);
    Some(path.to_string())
}

fn push_unique(paths: &mut Vec<String>, path: &str) {
    if !path.is_empty() && !paths.iter().any(|p| p == path) {
        paths.push(path.to_string());
    }
}

/// Parses the `+c` start of `@@ -a,b +c,d @@`.
fn hunk_new_start(line: &str) -> Option<usize> {
    let plus = line.split_whitespace().find(|t| t.starts_with('+'))?;
    let start = plus[1..].split(',').next()?;
    start.parse().ok()
}

/// Parses `(b, d)` from `@@ -a,b +c,d @@`; an omitted length means 1.
fn hunk_lengths(line: &str) -> Option<(usize, usize)> {
    let mut ranges = line
        .trim_start_matches('@')
        .split_whitespace()
        .take_while(|t| !t.starts_with('@'));
    let old = ranges.next()?.strip_prefix('-')?;
    let new = ranges.next()?.strip_prefix('+')?;
    Some((range_len(old)?, range_len(new)?))
}

fn range_len(range: &str) -> Option<usize> {
    match range.split_once(',') {
        Some((_, len)) => len.parse().ok(),
        None => Some(1),
    }
}
