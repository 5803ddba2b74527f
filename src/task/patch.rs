//! Candidate fix representation and unified-diff application.
//!
//! A patch is either a unified diff against one file or a full replacement
//! of one file. Diffs are applied with strict context verification: any
//! mismatch between the hunk and the base file is a [`PatchError`], which the
//! caller reports as a malformed patch rather than applying a partial edit.

use serde::{Deserialize, Serialize};

/// The change a patch makes to its target file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatchChange {
    /// Unified diff against the current contents of `path`
    Diff { path: String, diff: String },
    /// Full replacement of `path`
    Replace { path: String, contents: String },
}

/// A candidate fix, tagged with the iteration that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub change: PatchChange,
    pub iteration: u32,
}

impl Patch {
    /// Target path of this patch.
    pub fn path(&self) -> &str {
        match &self.change {
            PatchChange::Diff { path, .. } => path,
            PatchChange::Replace { path, .. } => path,
        }
    }

    /// Compute the patched file contents given the current base contents.
    ///
    /// `base` is `None` when the target file does not exist yet; only a
    /// replacement (or a diff with no deletions or context) can create a
    /// new file.
    pub fn apply(&self, base: Option<&str>) -> Result<String, PatchError> {
        match &self.change {
            PatchChange::Replace { contents, .. } => Ok(contents.clone()),
            PatchChange::Diff { diff, .. } => apply_unified_diff(base.unwrap_or(""), diff),
        }
    }
}

/// Errors from parsing or applying a patch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PatchError {
    #[error("invalid hunk header: {0}")]
    InvalidHunkHeader(String),

    #[error("invalid diff line (expected ' ', '+', or '-' prefix): {0}")]
    InvalidLine(String),

    #[error("hunk does not apply at line {line}: expected {expected:?}, found {found:?}")]
    ContextMismatch {
        line: usize,
        expected: String,
        found: Option<String>,
    },

    #[error("diff contains no hunks")]
    Empty,
}

struct Hunk {
    /// 1-based start line in the base file (0 means insert at top)
    old_start: usize,
    lines: Vec<HunkLine>,
}

enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

fn parse_hunk_header(header: &str) -> Result<usize, PatchError> {
    // "@@ -l[,n] +l[,n] @@"
    let body = header
        .trim_start_matches('@')
        .trim_end_matches(|c| c != '@')
        .trim_matches('@')
        .trim();
    let old_part = body
        .split_whitespace()
        .find(|p| p.starts_with('-'))
        .ok_or_else(|| PatchError::InvalidHunkHeader(header.to_string()))?;
    let old_start = old_part[1..]
        .split(',')
        .next()
        .unwrap_or("")
        .parse::<usize>()
        .map_err(|_| PatchError::InvalidHunkHeader(header.to_string()))?;
    Ok(old_start)
}

fn parse_hunks(diff: &str) -> Result<Vec<Hunk>, PatchError> {
    let mut hunks: Vec<Hunk> = Vec::new();

    for raw in diff.lines() {
        // File headers and metadata before the first hunk are ignored.
        if raw.starts_with("--- ") || raw.starts_with("+++ ") || raw.starts_with("diff ") {
            continue;
        }
        if raw.starts_with("@@") {
            hunks.push(Hunk {
                old_start: parse_hunk_header(raw)?,
                lines: Vec::new(),
            });
            continue;
        }
        let Some(hunk) = hunks.last_mut() else {
            continue;
        };
        if raw == "\\ No newline at end of file" {
            continue;
        }
        match raw.chars().next() {
            Some(' ') => hunk.lines.push(HunkLine::Context(raw[1..].to_string())),
            Some('-') => hunk.lines.push(HunkLine::Remove(raw[1..].to_string())),
            Some('+') => hunk.lines.push(HunkLine::Add(raw[1..].to_string())),
            // An empty line inside a hunk is an empty context line.
            None => hunk.lines.push(HunkLine::Context(String::new())),
            Some(_) => return Err(PatchError::InvalidLine(raw.to_string())),
        }
    }

    if hunks.is_empty() {
        return Err(PatchError::Empty);
    }
    Ok(hunks)
}

/// Apply a unified diff to `base`, verifying every context and removal line.
pub fn apply_unified_diff(base: &str, diff: &str) -> Result<String, PatchError> {
    let hunks = parse_hunks(diff)?;
    let base_lines: Vec<&str> = base.lines().collect();
    let mut out: Vec<String> = Vec::new();
    // Index of the next unconsumed base line (0-based).
    let mut cursor = 0usize;

    for hunk in &hunks {
        let hunk_start = hunk.old_start.saturating_sub(1);
        if hunk_start < cursor || hunk_start > base_lines.len() {
            return Err(PatchError::ContextMismatch {
                line: hunk.old_start,
                expected: "hunk start within file".to_string(),
                found: None,
            });
        }
        // Copy unchanged lines up to the hunk.
        for line in &base_lines[cursor..hunk_start] {
            out.push((*line).to_string());
        }
        cursor = hunk_start;

        for hunk_line in &hunk.lines {
            match hunk_line {
                HunkLine::Add(text) => out.push(text.clone()),
                HunkLine::Context(expected) | HunkLine::Remove(expected) => {
                    let found = base_lines.get(cursor).copied();
                    if found != Some(expected.as_str()) {
                        return Err(PatchError::ContextMismatch {
                            line: cursor + 1,
                            expected: expected.clone(),
                            found: found.map(|s| s.to_string()),
                        });
                    }
                    if matches!(hunk_line, HunkLine::Context(_)) {
                        out.push(expected.clone());
                    }
                    cursor += 1;
                }
            }
        }
    }

    // Copy the remainder of the file.
    for line in &base_lines[cursor..] {
        out.push((*line).to_string());
    }

    let mut result = out.join("\n");
    if base.ends_with('\n') || base.is_empty() {
        result.push('\n');
    }
    Ok(result)
}
