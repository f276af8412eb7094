//! Cache directory path management
//!
//! This module provides the `CachePaths` struct which names every file in the
//! cache directory layout:
//!
//! ```text
//! <cache>/
//! ├── .version                      # tool version that created the cache
//! ├── .lock                         # present while a pull is in progress
//! ├── git/                          # bare repo, refs under refs/remotes/origin/
//! └── releases/
//!     └── <release-id>/
//!         ├── metadata.json         # release description, target commit removed
//!         └── assets/
//!             └── <asset-name>      # downloaded payload
//! ```
//!
//! The layout is a persisted format: changing it requires a version bump so
//! that old caches are rebuilt on the next pull.

use std::path::{Path, PathBuf};

const VERSION_FILE: &str = ".version";
const LOCK_FILE: &str = ".lock";

/// Names all filesystem paths inside one cache directory. Pure; never touches disk.
#[derive(Debug, Clone)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    /// Creates a new CachePaths with the specified root directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{root}/.version`
    pub fn version_file(&self) -> PathBuf {
        self.root.join(VERSION_FILE)
    }

    /// `{root}/.lock`
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// `{root}/git`
    pub fn git_dir(&self) -> PathBuf {
        self.root.join("git")
    }

    /// `{root}/releases`
    pub fn releases_dir(&self) -> PathBuf {
        self.root.join("releases")
    }

    /// `{root}/releases/{release}`
    pub fn release_dir(&self, release: &str) -> PathBuf {
        self.releases_dir().join(release)
    }

    /// `{root}/releases/{release}/metadata.json`
    pub fn metadata_file(&self, release: &str) -> PathBuf {
        self.release_dir(release).join("metadata.json")
    }

    /// `{root}/releases/{release}/assets`
    pub fn assets_dir(&self, release: &str) -> PathBuf {
        self.release_dir(release).join("assets")
    }

    /// `{root}/releases/{release}/assets/{asset}`
    pub fn asset_file(&self, release: &str, asset: &str) -> PathBuf {
        self.assets_dir(release).join(asset)
    }
}

impl Default for CachePaths {
    /// Creates a CachePaths using the system cache directory + "action-sync"
    ///
    /// Uses `dirs::cache_dir()` which resolves to:
    /// - Linux: `~/.cache`
    /// - macOS: `~/Library/Caches`
    /// - Windows: `C:\Users\<user>\AppData\Local`
    fn default() -> Self {
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));
        Self::new(cache_dir.join("action-sync"))
    }
}
