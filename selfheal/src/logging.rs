//! Diagnostic tracing for the engine itself.
//!
//! This is separate from what a session records for the user: attempt logs
//! under `.selfheal/attempts/` and the transcript are written regardless of
//! the filter chosen here.
//!
//! The filter comes from `SELFHEAL_LOG`, then `RUST_LOG`, then the `-v` count
//! given on the command line.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "SELFHEAL_LOG";

/// Filter directive for a `-v` count when no variable is set.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "warn,selfheal=info",
        _ => "warn,selfheal=debug",
    }
}

fn filter_for(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)))
}

/// Install the stderr subscriber. Later calls are ignored.
///
/// ```bash
/// SELFHEAL_LOG=selfheal::io::process=debug selfheal run
/// selfheal -vv run
/// ```
pub fn init(verbosity: u8) {
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbosity > 1)
        .compact();
    // Fails only when a subscriber is already installed.
    let _ = tracing_subscriber::registry()
        .with(filter_for(verbosity))
        .with(layer)
        .try_init();
}
