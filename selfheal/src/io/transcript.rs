//! Session-scoped, append-only conversation transcript.
//!
//! Every oracle exchange (prompt and response) is appended here and, when a
//! journal path is set, to `.selfheal/transcript.jsonl`. Entries are never
//! removed; the optional window only limits what is sent to the oracle.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Prompt,
    Response,
}

/// What an exchange was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Plan,
    Task,
    CommitMessage,
    BranchName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub kind: ExchangeKind,
    pub content: String,
    pub at: String,
}

#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    window: Option<usize>,
    journal: Option<PathBuf>,
}

impl Transcript {
    pub fn new(window: Option<usize>) -> Self {
        Self {
            entries: Vec::new(),
            window,
            journal: None,
        }
    }

    /// Also append every entry as a JSON line to `path`.
    pub fn with_journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal = Some(path.into());
        self
    }

    pub fn push(&mut self, role: Role, kind: ExchangeKind, content: impl Into<String>) -> Result<()> {
        let entry = TranscriptEntry {
            role,
            kind,
            content: content.into(),
            at: Utc::now().to_rfc3339(),
        };
        if let Some(path) = &self.journal {
            append_json_line(path, &entry)?;
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries the oracle should see: the last `window`, or all of them.
    pub fn window_entries(&self) -> &[TranscriptEntry] {
        match self.window {
            Some(n) if n < self.entries.len() => &self.entries[self.entries.len() - n..],
            _ => &self.entries,
        }
    }

    /// Plain-text rendering of the window for text-only oracle transports.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in self.window_entries() {
            let heading = match entry.role {
                Role::Prompt => "## Request",
                Role::Response => "## Your previous answer",
            };
            out.push_str(heading);
            out.push_str("\n\n");
            out.push_str(entry.content.trim_end());
            out.push_str("\n\n");
        }
        out
    }

    /// Content of the most recent response, if any.
    pub fn latest_response(&self) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.role == Role::Response)
            .map(|entry| entry.content.as_str())
    }
}

fn append_json_line(path: &Path, entry: &TranscriptEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create transcript dir {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(entry).context("serialize transcript entry")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open transcript {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append transcript {}", path.display()))
}
