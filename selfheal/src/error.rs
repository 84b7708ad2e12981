//! Typed failures that orchestration must tell apart.
//!
//! Everything else travels as plain `anyhow::Error` with context. These
//! variants are raised through `anyhow` and recovered with `downcast_ref`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The child process could not be started at all. Never repaired.
    #[error("failed to launch `{command}` in {workdir}: {source}")]
    ProcessLaunch {
        command: String,
        workdir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The oracle's repair plan did not decode. Aborts the repair cycle.
    #[error("repair plan is not valid: {reason}\n--- oracle response ---\n{response}")]
    PlanParse { reason: String, response: String },

    /// The project has no run script to execute.
    #[error("run script {0} not found in file store")]
    NoRunScript(String),
}
