//! Attempt logging helpers for `.selfheal/attempts/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, SecondsFormat};
use serde::Serialize;

use crate::core::types::{CapturedOutput, FailureReport, LogEntry, ProbeStatus, ProcessExit};
use crate::io::config::STATE_DIR;

/// Session identifier used to group attempt logs, e.g. `20240501-142233`.
pub fn new_session_id(now: DateTime<Local>) -> String {
    now.format("%Y%m%d-%H%M%S").to_string()
}

pub fn timestamp(now: DateTime<Local>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta {
    pub session_id: String,
    pub attempt: u32,
    pub command: String,
    /// `None` when the attempt was cancelled.
    pub exit: Option<ProcessExit>,
    pub probe: ProbeStatus,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub runtime_errors_path: PathBuf,
    pub report_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(root: &Path, session_id: &str, attempt: u32) -> Self {
        let dir = root
            .join(STATE_DIR)
            .join("attempts")
            .join(session_id)
            .join(attempt.to_string());
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            stdout_path: dir.join("stdout.log"),
            stderr_path: dir.join("stderr.log"),
            runtime_errors_path: dir.join("runtime_errors.log"),
            report_path: dir.join("report.json"),
        }
    }
}

pub struct AttemptWriteRequest<'a> {
    pub root: &'a Path,
    pub meta: &'a AttemptMeta,
    pub output: &'a CapturedOutput,
    pub severe_logs: &'a [LogEntry],
    pub report: Option<&'a FailureReport>,
}

pub fn write_attempt(request: &AttemptWriteRequest<'_>) -> Result<AttemptPaths> {
    let paths = AttemptPaths::new(request.root, &request.meta.session_id, request.meta.attempt);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;

    write_json(&paths.meta_path, request.meta)?;
    write_lines(&paths.stdout_path, &request.output.stdout)?;
    write_lines(&paths.stderr_path, &request.output.stderr)?;
    if !request.severe_logs.is_empty() {
        let lines: Vec<String> = request
            .severe_logs
            .iter()
            .map(|entry| entry.message.clone())
            .collect();
        write_lines(&paths.runtime_errors_path, &lines)?;
    }
    if let Some(report) = request.report {
        write_json(&paths.report_path, report)?;
    }

    Ok(paths)
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut buf = lines.join("\n");
    if !buf.is_empty() {
        buf.push('\n');
    }
    write_text(path, &buf)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
