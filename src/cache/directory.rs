//! Cache directory lifecycle
//!
//! `CacheDirectory` owns one mirror's on-disk state. It validates the version
//! marker before every pull and push, manages the lock marker, and lists the
//! cached releases and assets.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::{CachePaths, lock};
use crate::error::ErrorKind;

/// Errors returned by cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Push found a cache written by another tool version.
    #[error(
        "The cache you are trying to push was created with a different version of this tool ({found}). Please re-pull it with this version of the tool."
    )]
    WrongVersion { found: String },
    /// Pull found a non-empty directory that is not a cache.
    #[error(
        "The cache directory {0} is not empty, but was not created by this tool. If you are sure you want to use this directory, please delete it and run the tool again."
    )]
    NotACache(PathBuf),
    /// The cache would need more than one directory level created.
    #[error("Cannot create cache directory {0} because its parent does not exist.")]
    ParentMissing(PathBuf),
    /// Push was pointed at something that was never pulled into.
    #[error(
        "The directory {0} does not appear to be a valid cache. Please check it exists and that you have run the `pull` command to populate it."
    )]
    NotPopulated(PathBuf),
    /// A previous pull did not finish.
    #[error(
        "The cache directory is locked, likely due to a `pull` command being interrupted. Please run `pull` again to ensure all required data is downloaded."
    )]
    Locked,
    /// An underlying IO operation failed.
    #[error("{context} ({path}): {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    fn io(context: &'static str, path: &Path, source: io::Error) -> Self {
        CacheError::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Io { .. } => ErrorKind::Fatal,
            _ => ErrorKind::User,
        }
    }
}

/// A cached release asset as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAsset {
    pub name: String,
    pub size: u64,
    pub path: PathBuf,
}

/// Handle on a cache directory.
#[derive(Debug, Clone)]
pub struct CacheDirectory {
    paths: CachePaths,
}

fn is_empty_or_missing(path: &Path) -> Result<bool, CacheError> {
    match std::fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(CacheError::io("could not read cache directory", path, e)),
    }
}

impl CacheDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            paths: CachePaths::new(root),
        }
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    pub fn root(&self) -> &Path {
        self.paths.root()
    }

    fn read_version(&self) -> Result<Option<String>, CacheError> {
        let path = self.paths.version_file();
        match std::fs::read_to_string(&path) {
            Ok(version) => Ok(Some(version)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io("could not read cache version file", &path, e)),
        }
    }

    /// Validate (and for a pull, create or rebuild) the cache for `version`.
    ///
    /// Pull accepts a missing or matching marker. A mismatching marker destroys
    /// and recreates the cache. A non-empty directory without a marker is never
    /// adopted. Push requires an exact match.
    pub fn ensure(&self, for_pull: bool, version: &str) -> Result<(), CacheError> {
        let existing = self.read_version()?;
        if existing.as_deref() == Some(version) {
            return Ok(());
        }

        if !for_pull {
            return Err(match existing {
                Some(found) => CacheError::WrongVersion { found },
                None => CacheError::NotPopulated(self.root().to_path_buf()),
            });
        }

        let root = self.root();
        let parent = match root.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        match std::fs::metadata(parent) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::ParentMissing(root.to_path_buf()));
            }
            Err(e) => {
                return Err(CacheError::io(
                    "could not access parent of cache directory",
                    parent,
                    e,
                ));
            }
        }

        if let Some(found) = existing {
            log::info!(
                "Cache was created by version {}, rebuilding it for version {}...",
                found,
                version
            );
            std::fs::remove_dir_all(root)
                .map_err(|e| CacheError::io("error removing outdated cache directory", root, e))?;
        }

        if !is_empty_or_missing(root)? {
            return Err(CacheError::NotACache(root.to_path_buf()));
        }
        if !root.exists() {
            std::fs::create_dir(root)
                .map_err(|e| CacheError::io("could not create cache directory", root, e))?;
        }
        let version_file = self.paths.version_file();
        std::fs::write(&version_file, version)
            .map_err(|e| CacheError::io("could not create cache version file", &version_file, e))?;
        Ok(())
    }

    /// Mark a pull as in progress.
    pub fn lock(&self) -> Result<(), CacheError> {
        let path = self.paths.lock_file();
        lock::acquire(&path).map_err(|e| CacheError::io("error locking cache directory", &path, e))
    }

    /// Mark a pull as finished.
    pub fn unlock(&self) -> Result<(), CacheError> {
        let path = self.paths.lock_file();
        lock::release(&path)
            .map_err(|e| CacheError::io("error unlocking cache directory", &path, e))
    }

    /// Fails with [`CacheError::Locked`] while the lock marker exists.
    pub fn check_lock(&self) -> Result<(), CacheError> {
        let path = self.paths.lock_file();
        match lock::is_locked(&path) {
            Ok(false) => Ok(()),
            Ok(true) => Err(CacheError::Locked),
            Err(e) => Err(CacheError::io(
                "error checking if cache directory is locked",
                &path,
                e,
            )),
        }
    }

    /// Release identifiers present in the cache, sorted by name.
    pub fn release_ids(&self) -> Result<Vec<String>, CacheError> {
        let releases_dir = self.paths.releases_dir();
        let entries = match std::fs::read_dir(&releases_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::io("error reading releases", &releases_dir, e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| CacheError::io("error reading releases", &releases_dir, e))?;
            let is_dir = entry
                .file_type()
                .map_err(|e| CacheError::io("error reading releases", &entry.path(), e))?
                .is_dir();
            if is_dir {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Assets cached for a release, sorted by name.
    pub fn assets(&self, release: &str) -> Result<Vec<CachedAsset>, CacheError> {
        let assets_dir = self.paths.assets_dir(release);
        let entries = match std::fs::read_dir(&assets_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::io("error reading release assets", &assets_dir, e)),
        };

        let mut assets = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| CacheError::io("error reading release assets", &assets_dir, e))?;
            let path = entry.path();
            let metadata = entry
                .metadata()
                .map_err(|e| CacheError::io("error reading release asset", &path, e))?;
            if metadata.is_file() {
                assets.push(CachedAsset {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: metadata.len(),
                    path,
                });
            }
        }
        assets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(assets)
    }
}
