//! Pull engine: mirror the upstream Action repository and its bundle
//! releases into the local cache.
//!
//! A pull runs three steps against a locked cache:
//!
//! 1. **FetchGit**: incremental fetch of every branch and tag into the private
//!    `refs/remotes/origin/` namespace, then pruning of references the source
//!    no longer advertises. If the incremental fetch fails for any reason the
//!    Git store is rebuilt from scratch.
//! 2. **DiscoverReleases**: every release branch or tag (`main`, `vN`) names
//!    a bundle in its `src/defaults.json`.
//! 3. **DownloadReleases**: release metadata and assets for each bundle.
//!    Assets whose size already matches are not downloaded again.
//!    Cached releases no bundle refers to any more are removed.
//!
//! The lock is only released when all three steps succeed.

use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::action_config::{self, ConfigError, DEFAULT_CONFIGURATION_PATH};
use crate::api::{ApiError, Asset, AssetDownload, Hosting};
use crate::cache::{CACHE_REFERENCE_PREFIX, CacheDirectory, CacheError};
use crate::cancel::CancellationToken;
use crate::error::ErrorKind;
use crate::git::{GitError, GitRemote, GitStore, RemoteRef, validate_name};
use crate::progress::ProgressReader;
use crate::types::RepoKey;

/// Clone URL of the upstream Action repository.
pub const SOURCE_GIT_URL: &str = "https://github.com/github/codeql-action.git";

static RELEVANT_REFERENCES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^refs/remotes/origin/(heads|tags)/(main|v\d+)$").expect("valid pattern")
});

/// Errors returned by the pull engine.
#[derive(Debug, Error)]
pub enum PullError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("{context}: {source}")]
    Git {
        context: &'static str,
        #[source]
        source: GitError,
    },
    #[error("error loading default configuration for reference {reference}: {source}")]
    Config {
        reference: String,
        #[source]
        source: ConfigError,
    },
    #[error("{context}: {source}")]
    Api {
        context: &'static str,
        #[source]
        source: ApiError,
    },
    #[error("the source repository has no release for the bundle {0}")]
    ReleaseNotFound(String),
    #[error("{context} ({path}): {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("error converting release to JSON: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("downloaded {actual} bytes of asset {name}, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("pull cancelled")]
    Cancelled,
}

impl PullError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PullError::Cache(e) => e.kind(),
            PullError::Git { source, .. } => source.kind(),
            PullError::Config { source, .. } => source.kind(),
            PullError::Api { source, .. } => source.kind(),
            PullError::SizeMismatch { .. } => ErrorKind::Transient,
            PullError::ReleaseNotFound(_)
            | PullError::Io { .. }
            | PullError::Metadata(_)
            | PullError::Cancelled => ErrorKind::Fatal,
        }
    }

    fn git(context: &'static str) -> impl FnOnce(GitError) -> Self {
        move |source| match source {
            GitError::Cancelled => PullError::Cancelled,
            source => PullError::Git { context, source },
        }
    }

    fn api(context: &'static str) -> impl FnOnce(ApiError) -> Self {
        move |source| match source {
            ApiError::Cancelled => PullError::Cancelled,
            source => PullError::Api { context, source },
        }
    }

    fn io(context: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| PullError::Io {
            context,
            path,
            source,
        }
    }
}

/// Refspecs mapping every source branch and tag into the cache namespace.
pub fn fetch_refspecs() -> Vec<String> {
    vec![
        format!("+refs/heads/*:{}heads/*", CACHE_REFERENCE_PREFIX),
        format!("+refs/tags/*:{}tags/*", CACHE_REFERENCE_PREFIX),
    ]
}

/// Cache reference a fetched remote reference is stored under.
fn cached_name(remote_name: &str) -> Option<String> {
    if let Some(branch) = remote_name.strip_prefix("refs/heads/") {
        Some(format!("{}heads/{}", CACHE_REFERENCE_PREFIX, branch))
    } else {
        remote_name
            .strip_prefix("refs/tags/")
            .map(|tag| format!("{}tags/{}", CACHE_REFERENCE_PREFIX, tag))
    }
}

/// Pulls from one source into one cache.
pub struct PullService<H> {
    cache: CacheDirectory,
    remote: GitRemote,
    api: H,
    source: RepoKey,
    cancel: CancellationToken,
}

impl<H: Hosting> PullService<H> {
    pub fn new(cache: CacheDirectory, remote: GitRemote, api: H, cancel: CancellationToken) -> Self {
        Self {
            cache,
            remote,
            api,
            source: RepoKey::source(),
            cancel,
        }
    }

    fn check_cancelled(&self) -> Result<(), PullError> {
        if self.cancel.is_cancelled() {
            Err(PullError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Fetch into the Git store, or rebuild it first when `fresh`.
    pub fn pull_git(&self, fresh: bool) -> Result<(), PullError> {
        let git_dir = self.cache.paths().git_dir();
        let store = if fresh {
            log::info!("Pulling Git contents fresh...");
            GitStore::init_bare(&git_dir)
                .map_err(PullError::git("error initializing Git repository cache"))?
        } else {
            log::info!("Updating Git contents...");
            GitStore::open(&git_dir).map_err(PullError::git("error opening Git repository cache"))?
        };

        store
            .fetch(&self.remote, &fetch_refspecs())
            .map_err(PullError::git("error doing Git fetch"))?;
        let advertised = store
            .list_remote_refs(&self.remote)
            .map_err(PullError::git("error listing source references"))?;
        self.prune(&store, &advertised)
    }

    /// Delete cached references whose source counterpart is gone.
    fn prune(&self, store: &GitStore, advertised: &[RemoteRef]) -> Result<(), PullError> {
        let expected: BTreeSet<String> = advertised
            .iter()
            .filter(|r| !r.is_peeled())
            .filter_map(|r| cached_name(&r.name))
            .collect();
        let local = store
            .references()
            .map_err(PullError::git("error reading references from Git repository cache"))?;
        for (name, _) in local {
            if expected.contains(&name) {
                continue;
            }
            log::info!("Removing {} as it no longer exists in the source repository.", name);
            store
                .delete_reference(&name)
                .map_err(PullError::git("error removing stale reference"))?;
        }
        Ok(())
    }

    /// Bundle versions referenced by the release branches and tags, first-seen order.
    pub fn find_relevant_releases(&self) -> Result<Vec<String>, PullError> {
        log::info!("Finding release references...");
        let store = GitStore::open(&self.cache.paths().git_dir())
            .map_err(PullError::git("error opening Git repository cache"))?;
        let references = store
            .references()
            .map_err(PullError::git("error reading references from Git repository cache"))?;

        let mut releases: Vec<String> = Vec::new();
        for (name, _) in references {
            if !RELEVANT_REFERENCES.is_match(&name) {
                continue;
            }
            log::info!("Found {}.", name);
            let commit = store
                .resolve_commit(&name)
                .map_err(PullError::git("error loading commit for reference"))?;
            let contents = store
                .read_file_at_commit(commit, DEFAULT_CONFIGURATION_PATH)
                .map_err(PullError::git("error loading default configuration file"))?;
            let Some(contents) = contents else {
                log::info!(
                    "Ignoring reference {} as it does not have a default configuration.",
                    name
                );
                continue;
            };
            let configuration =
                action_config::parse(&contents).map_err(|source| PullError::Config {
                    reference: name.clone(),
                    source,
                })?;
            if !releases.contains(&configuration.bundle_version) {
                releases.push(configuration.bundle_version);
            }
        }
        Ok(releases)
    }

    /// Download metadata and assets for every relevant release.
    pub fn pull_releases(&self) -> Result<(), PullError> {
        log::info!("Pulling CodeQL bundles...");
        let releases = self.find_relevant_releases()?;

        for (index, tag) in releases.iter().enumerate() {
            self.check_cancelled()?;
            validate_name(tag, "bundle version")
                .map_err(PullError::git("invalid bundle version"))?;
            log::info!(
                "Pulling CodeQL bundle {} ({}/{})...",
                tag,
                index + 1,
                releases.len()
            );

            let mut release = self
                .api
                .get_release_by_tag(&self.source, tag)
                .map_err(PullError::api("error loading CodeQL release information"))?
                .ok_or_else(|| PullError::ReleaseNotFound(tag.clone()))?;
            // The commitish may name a branch the destination does not have yet.
            release.target_commitish = None;

            let paths = self.cache.paths();
            let assets_dir = paths.assets_dir(tag);
            std::fs::create_dir_all(&assets_dir)
                .map_err(PullError::io("error creating assets directory", &assets_dir))?;
            let metadata_path = paths.metadata_file(tag);
            let metadata = serde_json::to_vec_pretty(&release)?;
            std::fs::write(&metadata_path, metadata)
                .map_err(PullError::io("error writing release metadata", &metadata_path))?;

            for asset in &release.assets {
                self.pull_asset(tag, asset)?;
            }
        }

        for id in self.cache.release_ids()? {
            if releases.contains(&id) {
                continue;
            }
            log::info!("Removing CodeQL bundle {} as it is no longer referenced.", id);
            let release_dir = self.cache.paths().release_dir(&id);
            std::fs::remove_dir_all(&release_dir)
                .map_err(PullError::io("error removing stale release", &release_dir))?;
        }
        Ok(())
    }

    fn pull_asset(&self, tag: &str, asset: &Asset) -> Result<(), PullError> {
        self.check_cancelled()?;
        validate_name(&asset.name, "asset name").map_err(PullError::git("invalid asset name"))?;
        let path = self.cache.paths().asset_file(tag, &asset.name);

        match std::fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() && metadata.len() == asset.size => {
                log::info!("Asset {} is already in cache.", asset.name);
                return Ok(());
            }
            Ok(metadata) if metadata.is_dir() => std::fs::remove_dir_all(&path)
                .map_err(PullError::io("error removing existing cached asset", &path))?,
            Ok(_) => std::fs::remove_file(&path)
                .map_err(PullError::io("error removing existing cached asset", &path))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(PullError::io("error reading cached asset", &path)(e)),
        }

        log::info!("Downloading asset {}...", asset.name);
        let download = self
            .api
            .download_release_asset(&self.source, asset.id)
            .map_err(PullError::api("error downloading asset"))?;
        let reader = match download {
            AssetDownload::Content(reader) => reader,
            AssetDownload::Redirect(url) => {
                log::debug!("Following asset redirect to {}", url);
                self.api
                    .fetch_url(&url)
                    .map_err(PullError::api("error downloading asset"))?
            }
        };

        let mut reader = ProgressReader::new(reader, &asset.name, asset.size, self.cancel.clone());
        let mut file =
            File::create(&path).map_err(PullError::io("error creating cached asset file", &path))?;
        let copied = io::copy(&mut reader, &mut file);
        if self.cancel.is_cancelled() {
            return Err(PullError::Cancelled);
        }
        let written = copied.map_err(PullError::io("error downloading asset", &path))?;
        if written != asset.size {
            drop(file);
            std::fs::remove_file(&path)
                .map_err(PullError::io("error removing incomplete asset", &path))?;
            return Err(PullError::SizeMismatch {
                name: asset.name.clone(),
                expected: asset.size,
                actual: written,
            });
        }
        Ok(())
    }
}

/// Bring the cache up to date with the source.
///
/// An incremental fetch failure is logged and answered with a fresh clone;
/// any other failure aborts and leaves the cache locked.
pub fn pull<H: Hosting>(
    cache: &CacheDirectory,
    remote: GitRemote,
    api: H,
    cancel: CancellationToken,
) -> Result<(), PullError> {
    cache.ensure(true, crate::VERSION)?;
    cache.lock()?;

    let service = PullService::new(cache.clone(), remote, api, cancel);
    if cache.paths().git_dir().exists() {
        if let Err(e) = service.pull_git(false) {
            if matches!(e, PullError::Cancelled) {
                return Err(e);
            }
            log::warn!("Updating the existing Git cache failed ({}), pulling fresh instead.", e);
            service.pull_git(true)?;
        }
    } else {
        service.pull_git(true)?;
    }
    service.pull_releases()?;

    cache.unlock()?;
    log::info!("Finished pulling the CodeQL Action repository and bundles!");
    Ok(())
}
