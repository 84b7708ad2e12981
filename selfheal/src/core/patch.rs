//! Extraction of whole-file patches from an oracle response.
//!
//! A patch is a fenced code block labelled with a relative file path. The
//! label is taken from the fence info string (`python:src/app.py`, or a bare
//! `src/app.py`) or, failing that, from the nearest preceding non-empty line
//! naming a path (`**src/app.py**`, `### run.sh`, `` `index.html`: ``).
//! Blocks that cannot be attributed to a safe path are skipped with a warning.

use std::path::{Component, Path};
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::FilePatch;

static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.@+\-/]+$").expect("path regex is valid"));

/// A block that was skipped instead of applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchWarning {
    /// 1-indexed line of the opening fence.
    pub line: usize,
    pub reason: String,
}

/// Patches in response order plus anything that had to be skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSet {
    pub patches: Vec<FilePatch>,
    pub warnings: Vec<PatchWarning>,
}

/// Parse every labelled fenced block in `response`.
///
/// Fences nest: inside a block, a fence with an info string opens an inner
/// block and a bare fence closes the innermost one, so a README carrying its
/// own ```` ```bash ```` example survives intact. Fences shorter than the
/// opener are plain content. A block that never balances is skipped.
///
/// The patch content is the block body verbatim, up to the start of the
/// closing fence line.
///
/// Later blocks for the same path are kept; applying them in order makes the
/// last one win.
pub fn extract_patches(response: &str) -> PatchSet {
    let mut set = PatchSet::default();
    let lines = split_lines(response);
    let mut i = 0;

    while i < lines.len() {
        let Some(fence) = parse_fence(lines[i].text) else {
            i += 1;
            continue;
        };
        let open_line = i + 1;
        let Some(close) = find_close(&lines, i, fence.ticks) else {
            set.warnings.push(PatchWarning {
                line: open_line,
                reason: "unterminated code block".to_string(),
            });
            break;
        };

        let preceding: Vec<&str> = lines[..i].iter().map(|line| line.text).collect();
        let label = path_from_info(fence.info).or_else(|| path_from_preceding(&preceding));
        match label {
            Some(path) => match validate_path(&path) {
                Ok(()) => {
                    let body = &response[lines[i].end..lines[close].start];
                    set.patches.push(FilePatch {
                        path,
                        content: body.to_string(),
                    });
                }
                Err(reason) => set.warnings.push(PatchWarning {
                    line: open_line,
                    reason,
                }),
            },
            None => set.warnings.push(PatchWarning {
                line: open_line,
                reason: "code block is not labelled with a file path".to_string(),
            }),
        }
        i = close + 1;
    }

    set
}

/// One response line: text without its terminator, plus byte offsets of the
/// line start and of the start of the next line.
struct Line<'a> {
    text: &'a str,
    start: usize,
    end: usize,
}

fn split_lines(text: &str) -> Vec<Line<'_>> {
    let mut offset = 0;
    text.split_inclusive('\n')
        .map(|raw| {
            let line = Line {
                text: raw.trim_end_matches(['\n', '\r']),
                start: offset,
                end: offset + raw.len(),
            };
            offset += raw.len();
            line
        })
        .collect()
}

struct Fence<'a> {
    ticks: usize,
    info: &'a str,
}

fn parse_fence(line: &str) -> Option<Fence<'_>> {
    let trimmed = line.trim_start();
    let ticks = trimmed.len() - trimmed.trim_start_matches('`').len();
    (ticks >= 3).then(|| Fence {
        ticks,
        info: trimmed[ticks..].trim(),
    })
}

/// Index of the fence closing the block opened at `open`.
fn find_close(lines: &[Line<'_>], open: usize, ticks: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (j, line) in lines.iter().enumerate().skip(open + 1) {
        let Some(fence) = parse_fence(line.text) else {
            continue;
        };
        if fence.ticks < ticks {
            continue;
        }
        if !fence.info.is_empty() {
            depth += 1;
        } else if depth == 0 {
            return Some(j);
        } else {
            depth -= 1;
        }
    }
    None
}

fn path_from_info(info: &str) -> Option<String> {
    if info.is_empty() {
        return None;
    }
    if let Some((_, path)) = info.split_once(':') {
        let path = path.trim();
        return (!path.is_empty() && PATH_RE.is_match(path)).then(|| path.to_string());
    }
    let token = info.split_whitespace().last()?;
    looks_like_path(token).then(|| token.to_string())
}

fn path_from_preceding(before: &[&str]) -> Option<String> {
    let line = before.iter().rev().find(|line| !line.trim().is_empty())?;
    let cleaned = line
        .trim()
        .trim_start_matches(['#', '-', '*', '>', ' '])
        .trim_end_matches(':')
        .trim_matches(['*', '`', '"', '\'', ' '])
        .trim_end_matches(':')
        .trim();
    let cleaned = cleaned
        .strip_prefix("File:")
        .or_else(|| cleaned.strip_prefix("file:"))
        .map(|rest| rest.trim().trim_matches('`'))
        .unwrap_or(cleaned);
    looks_like_path(cleaned).then(|| cleaned.to_string())
}

fn looks_like_path(token: &str) -> bool {
    PATH_RE.is_match(token) && (token.contains('.') || token.contains('/')) && token != "..."
}

fn validate_path(path: &str) -> Result<(), String> {
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(format!("absolute path rejected: {path}"));
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(format!("path escapes project root: {path}"));
    }
    Ok(())
}
