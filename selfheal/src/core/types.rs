//! Shared deterministic types for the execution engine.
//!
//! These types define the contracts between the process runner, the probe, the
//! classifier and the repair negotiator. They hold no handles and do no I/O.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which pipe a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// The command launched for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommand {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
}

impl RunCommand {
    /// `<shell> <script>` inside the project root.
    pub fn script(shell: &str, script: &str, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: shell.to_string(),
            args: vec![script.to_string()],
            workdir: workdir.into(),
        }
    }
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Lines captured from one attempt, one container per stream.
///
/// Each sequence is filled by exactly one reader thread and handed back on
/// join, so the two never share storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CapturedOutput {
    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }
}

/// How a launched process finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessExit {
    /// Exited on its own. `code` is `None` when killed by a signal.
    Exited { code: Option<i32> },
    /// Still running after the probe finished with it; stopped by the engine.
    Stopped,
    /// Exceeded the attempt timeout and was killed.
    TimedOut,
}

impl ProcessExit {
    /// Exit status 0, or a server the engine stopped on purpose.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited { code: Some(0) } | Self::Stopped)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited { code } => *code,
            Self::Stopped | Self::TimedOut => None,
        }
    }
}

/// Result of supervising one process until it is done or interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Finished(ProcessExit),
    /// Keyboard interrupt observed; the child was terminated.
    Cancelled,
}

/// What the health probe concluded about a launched server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    /// Probe disabled, or the process exited before it answered.
    Skipped,
    Ready,
    /// No response within the probe budget.
    NotReady,
}

/// Browser console severity, as reported by WebDriver logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Severe,
    Warning,
    Info,
    Debug,
    #[serde(other)]
    Other,
}

/// One browser console message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn severe(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Severe,
            message: message.into(),
        }
    }

    pub fn is_severe(&self) -> bool {
        self.level == LogLevel::Severe
    }
}

/// Keep only `SEVERE` entries, preserving order.
pub fn severe_only(entries: Vec<LogEntry>) -> Vec<LogEntry> {
    entries.into_iter().filter(LogEntry::is_severe).collect()
}

/// Structured failure for one attempt. At most one flows into a repair cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReport {
    /// The process exited unsuccessfully.
    ProcessExit { stdout: String, stderr: String },
    /// The process was healthy but the browser console logged severe entries.
    RuntimeLog { browser_errors: String },
}

impl FailureReport {
    /// Text shown to the operator and sent to the oracle.
    pub fn render(&self) -> String {
        match self {
            Self::ProcessExit { stdout, stderr } => {
                format!("stdout:\n{stdout}\n\nstderr:\n{stderr}")
            }
            Self::RuntimeLog { browser_errors } => format!("browser errors:\n{browser_errors}"),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::ProcessExit { .. } => "process exit failure",
            Self::RuntimeLog { .. } => "runtime log failure",
        }
    }
}

/// One step of a repair plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepairTask {
    pub todo: String,
    pub goal: String,
}

/// Ordered repair plan. Tasks run sequentially, each after the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepairPlan {
    pub plan: Vec<RepairTask>,
}

/// Whole-file replacement for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub path: String,
    pub content: String,
}

/// Working-tree changes awaiting review. Recomputed for every review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffSnapshot {
    pub files: Vec<String>,
    pub diff: String,
}
