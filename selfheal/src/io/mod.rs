//! Side-effecting adapters used by the engine.

pub mod attempt_log;
pub mod config;
pub mod console;
pub mod git;
pub mod oracle;
pub mod probe;
pub mod process;
pub mod prompt;
pub mod signal;
pub mod store;
pub mod transcript;
