//! Operator-facing terminal interaction.

use std::io::Write;

use anyhow::{Context, Result};
use colored::Colorize;
use dialoguer::Confirm;
use dialoguer::theme::ColorfulTheme;

use crate::core::types::Stream;
use crate::io::process::OutputObserver;

/// The human at the terminal: yes/no decisions and progress messages.
pub trait Operator {
    /// Ask a yes/no question. Pressing enter answers yes.
    fn confirm(&self, prompt: &str) -> Result<bool>;
    /// Present a titled block of text.
    fn show(&self, title: &str, body: &str);
    fn warn(&self, message: &str);
}

/// Interactive operator on the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalOperator;

impl Operator for TerminalOperator {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(true)
            .interact()
            .with_context(|| format!("read answer to '{prompt}'"))
    }

    fn show(&self, title: &str, body: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "\n{}", format!("== {title} ==").cyan().bold());
        let body = body.trim_end();
        if !body.is_empty() {
            let _ = writeln!(out, "{body}");
        }
        let _ = out.flush();
    }

    fn warn(&self, message: &str) {
        eprintln!("{} {message}", "warning:".yellow().bold());
    }
}

/// Mirrors child output to the terminal as it arrives.
///
/// Stdout passes through untouched; stderr is shown in red so failures stand
/// out in the interleaved stream. `NO_COLOR` disables styling.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoObserver;

impl OutputObserver for EchoObserver {
    fn on_line(&self, stream: Stream, line: &str) {
        let styled = echo_line(stream, line);
        match stream {
            Stream::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{styled}");
                let _ = out.flush();
            }
            Stream::Stderr => {
                let mut err = std::io::stderr().lock();
                let _ = writeln!(err, "{styled}");
            }
        }
    }
}

fn echo_line(stream: Stream, line: &str) -> String {
    match stream {
        Stream::Stdout => line.to_string(),
        Stream::Stderr => line.red().to_string(),
    }
}
