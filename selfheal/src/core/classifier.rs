//! Deterministic classification of an attempt into a failure report.

use crate::core::types::{CapturedOutput, FailureReport, LogEntry, ProcessExit};

/// Merge exit status, captured streams and severe browser logs into at most
/// one failure report.
///
/// - Unsuccessful exit: stdout/stderr report. Browser errors are ignored here,
///   a crash is the stronger signal for the same root cause.
/// - Successful exit with severe log entries: browser-errors report.
/// - Otherwise `None` (success).
pub fn classify(
    exit: &ProcessExit,
    output: &CapturedOutput,
    severe_logs: &[LogEntry],
) -> Option<FailureReport> {
    if !exit.is_success() {
        let mut stderr = output.stderr_text();
        if *exit == ProcessExit::TimedOut {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str("[process timed out and was killed]");
        }
        return Some(FailureReport::ProcessExit {
            stdout: output.stdout_text(),
            stderr,
        });
    }

    let browser_errors: Vec<&str> = severe_logs
        .iter()
        .filter(|entry| entry.is_severe())
        .map(|entry| entry.message.as_str())
        .collect();
    if browser_errors.is_empty() {
        return None;
    }
    Some(FailureReport::RuntimeLog {
        browser_errors: browser_errors.join("\n"),
    })
}
