//! Keyboard-interrupt cancellation shared between the handler and the engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::info;

/// Cloneable flag raised once by the interrupt handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Route Ctrl+C into a [`CancelToken`] instead of killing the engine.
///
/// Children run in their own process group, so the signal reaches only the
/// engine, which then terminates the child itself.
pub fn install_interrupt_handler() -> Result<CancelToken> {
    let token = CancelToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        info!("interrupt received, cancelling session");
        handler_token.cancel();
    })
    .context("install ctrl+c handler")?;
    Ok(token)
}
