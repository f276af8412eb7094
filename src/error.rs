//! Error classification shared by every component.

use std::fmt;

use thiserror::Error;

use crate::cache::CacheError;
use crate::pull::PullError;
use crate::push::PushError;
use crate::transport::TransportError;

/// How an error should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid input, credentials, scopes or cache state. Needs operator action.
    User,
    /// Server-side or network failure. Re-running is expected to succeed.
    Transient,
    /// Local failure (filesystem, corrupt data, cancellation).
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user error",
            Self::Transient => "transient error",
            Self::Fatal => "fatal error",
        })
    }
}

/// Top-level error for a `pull`, `push` or `sync` invocation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Pull(#[from] PullError),
    #[error(transparent)]
    Push(#[from] PushError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cache(e) => e.kind(),
            Self::Pull(e) => e.kind(),
            Self::Push(e) => e.kind(),
            Self::Transport(_) => ErrorKind::Fatal,
        }
    }
}
