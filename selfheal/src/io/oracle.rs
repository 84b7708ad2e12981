//! Oracle transport: the code-generation service the engine negotiates with.
//!
//! The [`Oracle`] trait decouples repair and review orchestration from the
//! actual backend. [`CommandOracle`] pipes the rendered conversation into a
//! configured command (e.g. `codex exec -`) and reads the answer from stdout.
//! Tests use scripted oracles that return predetermined responses.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{ProcessExit, RunCommand};
use crate::io::config::OracleConfig;
use crate::io::process::run_helper;
use crate::io::transcript::{ExchangeKind, Role, Transcript};

/// A stateful conversation partner. Sees the whole (windowed) transcript.
pub trait Oracle {
    fn send(&self, transcript: &Transcript) -> Result<String>;
}

/// Append `prompt`, ask the oracle, append and return its answer.
///
/// Calls are synchronous; the engine never has two exchanges in flight.
#[instrument(skip_all, fields(kind = ?kind, prompt_bytes = prompt.len()))]
pub fn exchange<O: Oracle + ?Sized>(
    oracle: &O,
    transcript: &mut Transcript,
    kind: ExchangeKind,
    prompt: String,
) -> Result<String> {
    transcript.push(Role::Prompt, kind, prompt)?;
    let response = oracle.send(transcript)?;
    debug!(response_bytes = response.len(), "oracle responded");
    transcript.push(Role::Response, kind, response.clone())?;
    Ok(response)
}

/// Oracle that spawns a command per exchange.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandOracle {
    pub fn new(config: &OracleConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: config.command.clone(),
            workdir: workdir.into(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

impl Oracle for CommandOracle {
    #[instrument(skip_all, fields(program = %self.command.first().map(String::as_str).unwrap_or_default()))]
    fn send(&self, transcript: &Transcript) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("oracle command is empty"))?;
        info!(entries = transcript.window_entries().len(), "asking oracle");

        let command = RunCommand {
            program: program.clone(),
            args: args.to_vec(),
            workdir: self.workdir.clone(),
        };
        let output = run_helper(
            &command,
            &transcript.render(),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run oracle command")?;

        match output.exit {
            ProcessExit::Exited { code: Some(0) } => {}
            ProcessExit::TimedOut => {
                warn!(timeout_secs = self.timeout.as_secs(), "oracle timed out");
                return Err(anyhow!("oracle timed out after {:?}", self.timeout));
            }
            exit => {
                warn!(?exit, "oracle command failed");
                return Err(anyhow!(
                    "oracle command failed ({exit:?}): {}",
                    output.stderr.trim()
                ));
            }
        }
        if output.stdout.trim().is_empty() {
            return Err(anyhow!("oracle returned an empty response"));
        }
        Ok(output.stdout)
    }
}
