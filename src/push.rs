//! Push engine: publish a populated cache to a GitHub Enterprise Server
//! repository.
//!
//! The destination is written in stages. Releases cannot be created before
//! their tags exist, and the branches must not reference releases that are not
//! there yet, so a push runs:
//!
//! 1. connectivity probe
//! 2. organization, membership and repository setup
//! 3. the tags backing each cached release
//! 4. releases and their assets
//! 5. `main`, then every other branch and tag, after deleting destination
//!    references the cache no longer has

use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::api::{ApiError, Asset, Hosting, Release, ReleaseRequest, Repository, RepositorySettings};
use crate::cache::{CACHE_REFERENCE_PREFIX, CacheDirectory, CacheError, CachedAsset};
use crate::cancel::CancellationToken;
use crate::error::ErrorKind;
use crate::git::{GitError, GitRemote, GitStore, validate_name};
use crate::progress::ProgressReader;
use crate::types::{RepoKey, Visibility};

/// Homepage marking a repository as managed by this tool.
pub const REPOSITORY_HOMEPAGE: &str = "https://github.com/github/codeql-action-sync-tool/";

const DEFAULT_BRANCH: &str = "main";
const MAX_UPLOAD_ATTEMPTS: usize = 3;
const SITE_ADMIN_SCOPE: &str = "site_admin";
const WORKFLOW_SCOPE: &str = "workflow";

/// Where and how to push.
#[derive(Debug, Clone)]
pub struct PushSettings {
    pub destination: RepoKey,
    pub token: String,
    pub visibility: Visibility,
    pub force: bool,
    /// User to impersonate when the token's owner cannot write to the organization.
    pub actions_admin_user: Option<String>,
    pub insecure: bool,
}

/// Errors returned by the push engine.
#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(
        "The destination repository already exists, but it was not created with the CodeQL Action sync tool. If you are sure you want to push the CodeQL Action to it, re-run this command with the `--force` flag."
    )]
    RepositoryNotManaged,
    #[error(
        "The organization {0} does not exist and could not be created. Creating organizations requires a token with the `site_admin` scope."
    )]
    MissingSiteAdminScope(String),
    #[error(
        "The destination repository could not be created. Please check that the destination token has the `{0}` scope."
    )]
    MissingRepositoryScope(&'static str),
    #[error(
        "The user {user} is not a member of the organization {org}. Re-run this command with `--actions-admin-user` naming a user that can write to it."
    )]
    MissingActionsAdminUser { user: String, org: String },
    #[error(
        "The destination API redirected to {0}. Please check the destination URL and re-run this command."
    )]
    DestinationRedirect(String),
    #[error("{context}: {source}")]
    Api {
        context: &'static str,
        #[source]
        source: ApiError,
    },
    #[error("{context}: {source}")]
    Git {
        context: &'static str,
        #[source]
        source: GitError,
    },
    #[error("{context} ({path}): {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("error reading release metadata ({path}): {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("push cancelled")]
    Cancelled,
}

impl PushError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PushError::Cache(e) => e.kind(),
            PushError::RepositoryNotManaged
            | PushError::MissingSiteAdminScope(_)
            | PushError::MissingRepositoryScope(_)
            | PushError::MissingActionsAdminUser { .. }
            | PushError::DestinationRedirect(_) => ErrorKind::User,
            PushError::Api { source, .. } => source.kind(),
            PushError::Git { source, .. } => source.kind(),
            PushError::Io { .. } | PushError::Metadata { .. } | PushError::Cancelled => {
                ErrorKind::Fatal
            }
        }
    }

    fn api(context: &'static str) -> impl FnOnce(ApiError) -> Self {
        move |source| match source {
            ApiError::Cancelled => PushError::Cancelled,
            source => PushError::Api { context, source },
        }
    }

    fn git(context: &'static str) -> impl FnOnce(GitError) -> Self {
        move |source| match source {
            GitError::Cancelled => PushError::Cancelled,
            source => PushError::Git { context, source },
        }
    }

    fn io(context: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| PushError::Io {
            context,
            path,
            source,
        }
    }
}

/// Pushes one cache to one destination repository.
pub struct PushService<H> {
    cache: CacheDirectory,
    api: H,
    settings: PushSettings,
    git_token: String,
    cancel: CancellationToken,
}

impl<H: Hosting> PushService<H> {
    pub fn new(
        cache: CacheDirectory,
        api: H,
        settings: PushSettings,
        cancel: CancellationToken,
    ) -> Self {
        let git_token = settings.token.clone();
        Self {
            cache,
            api,
            settings,
            git_token,
            cancel,
        }
    }

    fn check_cancelled(&self) -> Result<(), PushError> {
        if self.cancel.is_cancelled() {
            Err(PushError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn destination(&self) -> &RepoKey {
        &self.settings.destination
    }

    /// Make sure the destination answers as an API root rather than redirecting elsewhere.
    pub fn probe(&self) -> Result<(), PushError> {
        let meta = self
            .api
            .probe()
            .map_err(PushError::api("error connecting to the destination"))?;
        if meta.is_redirect() {
            let target = meta.location.unwrap_or_else(|| "an unknown location".to_string());
            return Err(PushError::DestinationRedirect(target));
        }
        match meta.enterprise_version {
            Some(version) => log::info!("Destination is GitHub Enterprise Server {}.", version),
            None => log::warn!(
                "The destination did not report a GitHub Enterprise Server version. Is the destination URL correct?"
            ),
        }
        Ok(())
    }

    fn ensure_organization(&self, org: &str, login: &str) -> Result<(), PushError> {
        let existing = self
            .api
            .get_organization(org)
            .map_err(PushError::api("error checking if destination organization exists"))?;
        if existing.is_some() {
            return Ok(());
        }

        log::info!("The organization {} does not exist. Creating it...", org);
        match self.api.create_organization(org, login) {
            Ok(_) => Ok(()),
            Err(e)
                if e.status() == Some(404)
                    && !e.meta().is_some_and(|m| m.has_any_scope(&[SITE_ADMIN_SCOPE])) =>
            {
                Err(PushError::MissingSiteAdminScope(org.to_string()))
            }
            Err(e) => Err(PushError::api("error creating organization")(e)),
        }
    }

    /// Switch to an impersonation token when the current user cannot write to `org`.
    fn ensure_membership(&mut self, org: &str, login: &str) -> Result<(), PushError> {
        let meta = self
            .api
            .membership_status(org, login)
            .map_err(PushError::api("error checking organization membership"))?;
        let is_member = !matches!(meta.status, 302 | 404);
        if is_member || !meta.has_any_scope(&[SITE_ADMIN_SCOPE]) {
            return Ok(());
        }

        let Some(admin) = self.settings.actions_admin_user.clone() else {
            return Err(PushError::MissingActionsAdminUser {
                user: login.to_string(),
                org: org.to_string(),
            });
        };
        log::info!(
            "{} is not a member of {}, impersonating {} instead...",
            login,
            org,
            admin
        );
        let scopes = [self.settings.visibility.minimum_scope(), WORKFLOW_SCOPE];
        let token = self
            .api
            .create_impersonation_token(&admin, &scopes)
            .map_err(PushError::api("error creating impersonation token"))?;
        self.api.set_token(token.clone());
        self.git_token = token;
        Ok(())
    }

    fn desired_settings(&self, visibility: Option<Visibility>) -> RepositorySettings {
        RepositorySettings {
            name: self.destination().repo.to_string(),
            homepage: REPOSITORY_HOMEPAGE.to_string(),
            has_issues: false,
            has_projects: false,
            has_wiki: false,
            has_pages: false,
            has_downloads: false,
            archived: false,
            visibility: visibility.map(|v| v.as_str().to_string()),
        }
    }

    /// Create or update the destination repository, creating its organization if needed.
    pub fn ensure_repository(&mut self) -> Result<Repository, PushError> {
        log::info!("Ensuring repository exists...");
        let user = self
            .api
            .current_user()
            .map_err(PushError::api("error getting current user"))?;
        let owner = self.destination().owner.to_string();
        let organization = (owner != user.login).then_some(owner);

        if let Some(org) = &organization {
            self.ensure_organization(org, &user.login)?;
            self.ensure_membership(org, &user.login)?;
        }

        let destination = self.destination().clone();
        let existing = self
            .api
            .get_repository(&destination)
            .map_err(PushError::api("error checking if destination repository exists"))?;
        let visibility = self.settings.visibility;

        match existing {
            Some(repository) => {
                if repository.homepage.as_deref() != Some(REPOSITORY_HOMEPAGE) && !self.settings.force {
                    return Err(PushError::RepositoryNotManaged);
                }
                let changed = (repository.visibility() != visibility.as_str()).then_some(visibility);
                self.api
                    .edit_repository(&destination, &self.desired_settings(changed))
                    .map_err(PushError::api("error updating destination repository"))
            }
            None => {
                let settings = self.desired_settings(Some(visibility));
                match self.api.create_repository(organization.as_deref(), &settings) {
                    Ok(repository) => Ok(repository),
                    Err(e)
                        if e.status() == Some(404)
                            && !e
                                .meta()
                                .is_some_and(|m| m.has_any_scope(visibility.acceptable_scopes())) =>
                    {
                        Err(PushError::MissingRepositoryScope(visibility.minimum_scope()))
                    }
                    Err(e) => Err(PushError::api("error creating destination repository")(e)),
                }
            }
        }
    }

    fn remote(&self, repository: &Repository) -> GitRemote {
        GitRemote::new(repository.clone_url.clone(), self.cancel.clone())
            .with_token(Some(self.git_token.clone()))
            .insecure(self.settings.insecure)
    }

    /// Push the release tags (`initial`) or everything else (`!initial`).
    /// Short names (`heads/x`, `tags/y`) of every reference in the cache.
    fn cached_references(&self) -> Result<(GitStore, BTreeSet<String>), PushError> {
        let store = GitStore::open(&self.cache.paths().git_dir())
            .map_err(PushError::git("error reading Git repository from cache"))?;
        let cached = store
            .references()
            .map_err(PushError::git("error reading references from Git repository cache"))?
            .into_iter()
            .filter_map(|(name, _)| name.strip_prefix(CACHE_REFERENCE_PREFIX).map(str::to_string))
            .collect();
        Ok((store, cached))
    }

    /// Cached releases split into those with a cached tag and those without.
    fn tagged_releases(
        &self,
        cached: &BTreeSet<String>,
    ) -> Result<(Vec<String>, Vec<String>), PushError> {
        Ok(self
            .cache
            .release_ids()?
            .into_iter()
            .partition(|id| cached.contains(&format!("tags/{}", id))))
    }

    /// Push cached references to the destination.
    ///
    /// The initial push sends only release tags, so releases can be created
    /// against them. The final push removes stale references, then sends
    /// `main` on its own, then everything else. Returns the non-empty refspec
    /// batches in the order they were pushed.
    pub fn push_git(
        &self,
        repository: &Repository,
        initial: bool,
    ) -> Result<Vec<Vec<String>>, PushError> {
        self.check_cancelled()?;
        let (store, cached) = self.cached_references()?;
        let remote = self.remote(repository);
        let mut batches = Vec::new();
        let mut push = |refspecs: Vec<String>, context: &'static str| -> Result<(), PushError> {
            if refspecs.is_empty() {
                return Ok(());
            }
            store.push(&remote, &refspecs).map_err(PushError::git(context))?;
            batches.push(refspecs);
            Ok(())
        };

        if initial {
            log::info!("Pushing Git releases to {}...", repository.clone_url);
            let (tagged, untagged) = self.tagged_releases(&cached)?;
            for id in untagged {
                log::warn!("Release {} has no tag in the cache, so it is not pushed.", id);
            }
            let refspecs = tagged
                .iter()
                .map(|id| format!("+{}tags/{}:refs/tags/{}", CACHE_REFERENCE_PREFIX, id, id))
                .collect();
            push(refspecs, "error pushing release tags")?;
            return Ok(batches);
        }

        log::info!("Pushing Git references to {}...", repository.clone_url);
        let advertised = store
            .list_remote_refs(&remote)
            .map_err(PushError::git("error listing destination references"))?;
        let deletions: Vec<String> = advertised
            .iter()
            .filter(|r| !r.is_peeled())
            .filter_map(|r| {
                let short = r.name.strip_prefix("refs/")?;
                let managed = short.starts_with("heads/") || short.starts_with("tags/");
                (managed && !cached.contains(short)).then(|| format!(":{}", r.name))
            })
            .collect();
        for deletion in &deletions {
            log::info!("Removing {} as it no longer exists in the cache.", &deletion[1..]);
        }
        push(deletions, "error removing stale destination references")?;

        // `main` goes first so a new repository picks it as the default branch.
        let main = format!("heads/{}", DEFAULT_BRANCH);
        if cached.contains(&main) {
            let refspec = format!("+{}{}:refs/{}", CACHE_REFERENCE_PREFIX, main, main);
            push(vec![refspec], "error pushing default branch")?;
        }

        let refspecs = cached
            .iter()
            .filter(|name| **name != main)
            .filter(|name| name.starts_with("heads/") || name.starts_with("tags/"))
            .map(|name| format!("+{}{}:refs/{}", CACHE_REFERENCE_PREFIX, name, name))
            .collect();
        push(refspecs, "error pushing Git references")?;
        Ok(batches)
    }

    fn read_metadata(&self, id: &str) -> Result<Release, PushError> {
        let path = self.cache.paths().metadata_file(id);
        let contents =
            std::fs::read(&path).map_err(PushError::io("error reading release metadata", &path))?;
        let mut release: Release =
            serde_json::from_slice(&contents).map_err(|source| PushError::Metadata {
                path: path.clone(),
                source,
            })?;
        release.target_commitish = None;
        Ok(release)
    }

    fn create_or_update_release(&self, id: &str) -> Result<Release, PushError> {
        let metadata = self.read_metadata(id)?;
        let request = ReleaseRequest::from(&metadata);
        let existing = self
            .api
            .get_release_by_tag(self.destination(), &metadata.tag_name)
            .map_err(PushError::api("error checking for existing CodeQL release"))?;
        match existing {
            None => {
                log::info!("Creating release {}...", metadata.tag_name);
                self.api
                    .create_release(self.destination(), &request)
                    .map_err(PushError::api("error creating release"))
            }
            Some(release) => {
                log::info!("Updating release {}...", metadata.tag_name);
                self.api
                    .edit_release(self.destination(), release.id, &request)
                    .map_err(PushError::api("error updating release"))
            }
        }
    }

    fn upload_asset(&self, release: &Release, asset: &CachedAsset) -> Result<(), PushError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.check_cancelled()?;
            log::info!(
                "Uploading release asset {} (attempt {}/{})...",
                asset.name,
                attempt,
                MAX_UPLOAD_ATTEMPTS
            );
            let file = File::open(&asset.path)
                .map_err(PushError::io("error opening release asset", &asset.path))?;
            let mut reader = ProgressReader::new(file, &asset.name, asset.size, self.cancel.clone());
            let result = self.api.upload_release_asset(
                self.destination(),
                release.id,
                &asset.name,
                asset.size,
                &mut reader,
            );
            self.check_cancelled()?;
            match result {
                Ok(_) => return Ok(()),
                Err(e) if e.is_already_exists() => {
                    log::info!("Asset {} was already uploaded.", asset.name);
                    return Ok(());
                }
                Err(e) if e.is_server_error() && attempt < MAX_UPLOAD_ATTEMPTS => {
                    log::warn!("Uploading {} failed ({}), retrying...", asset.name, e);
                }
                Err(e) => return Err(PushError::api("error uploading release asset")(e)),
            }
        }
    }

    fn create_or_update_asset(
        &self,
        release: &Release,
        existing: &[Asset],
        asset: &CachedAsset,
    ) -> Result<(), PushError> {
        validate_name(&asset.name, "asset name").map_err(PushError::git("invalid asset name"))?;
        if let Some(remote) = existing.iter().find(|a| a.name == asset.name) {
            if remote.size == asset.size {
                log::debug!("Asset {} is already up to date.", asset.name);
                return Ok(());
            }
            log::info!(
                "Replacing asset {} ({} bytes on the destination, {} cached)...",
                asset.name,
                remote.size,
                asset.size
            );
            self.api
                .delete_release_asset(self.destination(), remote.id)
                .map_err(PushError::api("error deleting outdated release asset"))?;
        }
        self.upload_asset(release, asset)
    }

    /// Create or update every cached release and upload missing assets.
    pub fn push_releases(&self) -> Result<(), PushError> {
        log::info!("Pushing CodeQL bundles...");
        let (_, cached) = self.cached_references()?;
        let (tagged, untagged) = self.tagged_releases(&cached)?;
        for id in untagged {
            log::warn!("Skipping release {} as its tag is not in the cache.", id);
        }
        for id in tagged {
            self.check_cancelled()?;
            validate_name(&id, "release").map_err(PushError::git("invalid release"))?;
            let release = self.create_or_update_release(&id)?;
            let existing = self
                .api
                .list_release_assets(self.destination(), release.id)
                .map_err(PushError::api("error fetching existing release assets"))?;
            for asset in self.cache.assets(&id)? {
                self.create_or_update_asset(&release, &existing, &asset)?;
            }
        }
        Ok(())
    }
}

/// Publish the cache to the destination described by `settings`.
pub fn push<H: Hosting>(
    cache: &CacheDirectory,
    api: H,
    settings: PushSettings,
    cancel: CancellationToken,
) -> Result<(), PushError> {
    cache.ensure(false, crate::VERSION)?;
    cache.check_lock()?;

    let destination = settings.destination.clone();
    let mut service = PushService::new(cache.clone(), api, settings, cancel);
    service.probe()?;
    let repository = service.ensure_repository()?;

    // Tags first so releases can be created, branches last so they never
    // point at releases that are missing.
    service.push_git(&repository, true)?;
    service.push_releases()?;
    service.push_git(&repository, false)?;

    log::info!("Finished pushing CodeQL Action to {}!", destination);
    Ok(())
}
