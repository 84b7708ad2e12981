//! Execution-and-self-healing engine for generated programs.
//!
//! The engine launches a project's run script, watches its output and a runtime
//! health probe, and when the program fails it negotiates a repair with an
//! oracle, overwrites the affected files and tries again within a bounded
//! retry budget. A separate review gate commits and pushes the result only
//! after the diff has been approved.
//!
//! - **[`core`]**: Pure, deterministic logic (classification, plan decoding,
//!   patch extraction, budgets). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (child processes, HTTP probes, file
//!   store, oracle transport, git, terminal prompts).
//!
//! Orchestration modules ([`attempt`], [`repair`], [`supervise`], [`review`])
//! coordinate core logic with I/O to implement the CLI commands.

pub mod attempt;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod repair;
pub mod review;
pub mod supervise;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
