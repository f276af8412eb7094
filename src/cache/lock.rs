//! Advisory lock marker for interrupted pulls.
//!
//! The lock is a presence-only file. It records that a pull started and did
//! not finish, so that a later push refuses to mirror a half-downloaded cache.
//! There is no owner tracking or expiry: the tool targets one operator on one
//! host, and concurrent invocations against the same cache are unsupported.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;

/// Create the marker. Re-acquiring an existing lock succeeds.
pub fn acquire(lock_path: &Path) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)?;
    Ok(())
}

/// Remove the marker.
pub fn release(lock_path: &Path) -> io::Result<()> {
    std::fs::remove_file(lock_path)
}

/// Returns true when the marker is present.
pub fn is_locked(lock_path: &Path) -> io::Result<bool> {
    match std::fs::metadata(lock_path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
