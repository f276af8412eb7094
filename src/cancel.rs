//! Process-wide cancellation signal.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared flag checked by every long-running transfer.
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that is cancelled when the process receives Ctrl-C.
    pub fn from_ctrlc() -> Result<Self, ctrlc::Error> {
        let token = Self::new();
        let handler_token = token.clone();
        ctrlc::set_handler(move || {
            log::warn!("Interrupt received, stopping after the current operation...");
            handler_token.cancel();
        })?;
        Ok(token)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// IO error used to unwind a read or write loop after cancellation.
    pub fn io_error() -> io::Error {
        io::Error::other("operation cancelled")
    }
}
