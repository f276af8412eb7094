//! Fixtures shared by the engine tests: throwaway Git repositories and an
//! in-memory [`Hosting`] implementation.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use git2::{Oid, Repository, RepositoryInitOptions, Signature, Time};
use tempfile::TempDir;

use crate::api::Repository as ApiRepository;
use crate::api::{
    ApiError, Asset, AssetDownload, Hosting, Organization, Release, ReleaseRequest,
    RepositorySettings, ResponseMeta, User,
};
use crate::types::RepoKey;

pub fn signature() -> Signature<'static> {
    Signature::new("Test", "test@example.com", &Time::new(1_600_000_000, 0)).unwrap()
}

fn write_tree(repo: &Repository, files: &[(Vec<&str>, &str)]) -> Oid {
    let mut builder = repo.treebuilder(None).unwrap();
    let mut directories: BTreeMap<&str, Vec<(Vec<&str>, &str)>> = BTreeMap::new();
    for (components, contents) in files {
        if components.len() == 1 {
            let blob = repo.blob(contents.as_bytes()).unwrap();
            builder.insert(components[0], blob, 0o100644).unwrap();
        } else {
            directories
                .entry(components[0])
                .or_default()
                .push((components[1..].to_vec(), *contents));
        }
    }
    for (name, children) in directories {
        let tree = write_tree(repo, &children);
        builder.insert(name, tree, 0o040000).unwrap();
    }
    builder.write().unwrap()
}

/// Create a commit holding exactly `files` (slash-separated paths). No reference is updated.
pub fn commit(repo: &Repository, files: &[(&str, &str)], parents: &[Oid], message: &str) -> Oid {
    let split: Vec<(Vec<&str>, &str)> = files
        .iter()
        .map(|(path, contents)| (path.split('/').collect(), *contents))
        .collect();
    let tree = repo.find_tree(write_tree(repo, &split)).unwrap();
    let parents: Vec<git2::Commit<'_>> = parents
        .iter()
        .map(|oid| repo.find_commit(*oid).unwrap())
        .collect();
    let parents: Vec<&git2::Commit<'_>> = parents.iter().collect();
    let signature = signature();
    repo.commit(None, &signature, &signature, message, &tree, &parents)
        .unwrap()
}

/// Empty bare repository whose HEAD points at `main`.
pub fn init_bare_main(path: &Path) -> Repository {
    let mut options = RepositoryInitOptions::new();
    options.bare(true).initial_head("main");
    Repository::init_opts(path, &options).unwrap()
}

pub fn defaults(bundle: &str) -> String {
    format!(r#"{{"bundleVersion": "{}"}}"#, bundle)
}

/// A local stand-in for the upstream Action repository.
///
/// - `main` configures `codeql-bundle-main`
/// - `v1` (and the tag `v2`, pointing at the same commit) configure `codeql-bundle-v1`
/// - `v3` has no default configuration
/// - `very-ignored-branch` and `an-ignored-tag-too` configure a bundle but do not
///   match the release reference pattern
/// - the tags `codeql-bundle-main` and `codeql-bundle-v1` hold the bundle releases
pub struct SourceFixture {
    pub dir: TempDir,
    pub main: Oid,
    pub v1: Oid,
    pub v3: Oid,
    pub ignored: Oid,
}

impl SourceFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_bare_main(dir.path());
        let main_defaults = defaults("codeql-bundle-main");
        let v1_defaults = defaults("codeql-bundle-v1");
        let ignored_defaults = defaults("codeql-bundle-ignored");

        let main = commit(
            &repo,
            &[("README.md", "main"), ("src/defaults.json", &main_defaults)],
            &[],
            "main",
        );
        let v1 = commit(
            &repo,
            &[("README.md", "v1"), ("src/defaults.json", &v1_defaults)],
            &[main],
            "v1",
        );
        let v3 = commit(&repo, &[("README.md", "v3")], &[main], "v3");
        let ignored = commit(
            &repo,
            &[("README.md", "ignored"), ("src/defaults.json", &ignored_defaults)],
            &[main],
            "ignored",
        );

        for (name, oid) in [
            ("refs/heads/main", main),
            ("refs/heads/v1", v1),
            ("refs/heads/v3", v3),
            ("refs/heads/very-ignored-branch", ignored),
            ("refs/tags/v2", v1),
            ("refs/tags/an-ignored-tag-too", ignored),
            ("refs/tags/codeql-bundle-main", main),
            ("refs/tags/codeql-bundle-v1", v1),
        ] {
            repo.reference(name, oid, true, "fixture").unwrap();
        }

        Self {
            dir,
            main,
            v1,
            v3,
            ignored,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn url(&self) -> String {
        self.dir.path().to_string_lossy().into_owned()
    }

    pub fn repository(&self) -> Repository {
        Repository::open_bare(self.dir.path()).unwrap()
    }

    pub fn set_reference(&self, name: &str, oid: Oid) {
        self.repository().reference(name, oid, true, "fixture").unwrap();
    }

    pub fn delete_reference(&self, name: &str) {
        self.repository()
            .find_reference(name)
            .unwrap()
            .delete()
            .unwrap();
    }
}

/// Everything the fake host knows and records.
pub struct FakeState {
    pub login: String,
    pub scopes: Vec<String>,
    pub token: String,
    pub probe_status: u16,
    pub probe_location: Option<String>,
    pub enterprise_version: Option<String>,
    pub organizations: BTreeSet<String>,
    /// `(org, user)` pairs.
    pub members: BTreeSet<(String, String)>,
    /// `(user, scopes)` per issued impersonation token.
    pub impersonations: Vec<(String, Vec<String>)>,
    pub repositories: BTreeMap<String, ApiRepository>,
    /// Clone URL given to created repositories.
    pub clone_url: String,
    pub created_repositories: Vec<(Option<String>, RepositorySettings)>,
    pub edited_repositories: Vec<RepositorySettings>,
    pub releases: Vec<Release>,
    pub created_releases: Vec<String>,
    pub edited_releases: Vec<String>,
    /// For each created release: whether its tag and `main` existed in the
    /// destination Git repository at that moment.
    pub release_creation_git_state: Vec<(String, bool, bool)>,
    pub contents: BTreeMap<u64, Vec<u8>>,
    pub downloads: BTreeMap<u64, usize>,
    pub redirect_downloads: bool,
    pub fetched_urls: Vec<String>,
    /// Statuses returned by the next upload attempts, in order.
    pub upload_failures: VecDeque<u16>,
    pub upload_attempts: usize,
    pub deleted_assets: Vec<u64>,
    next_id: u64,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            login: "octocat".to_string(),
            scopes: vec!["repo".to_string()],
            token: "token".to_string(),
            probe_status: 200,
            probe_location: None,
            enterprise_version: Some("3.9.0".to_string()),
            organizations: BTreeSet::new(),
            members: BTreeSet::new(),
            impersonations: Vec::new(),
            repositories: BTreeMap::new(),
            clone_url: String::new(),
            created_repositories: Vec::new(),
            edited_repositories: Vec::new(),
            releases: Vec::new(),
            created_releases: Vec::new(),
            edited_releases: Vec::new(),
            release_creation_git_state: Vec::new(),
            contents: BTreeMap::new(),
            downloads: BTreeMap::new(),
            redirect_downloads: false,
            fetched_urls: Vec::new(),
            upload_failures: VecDeque::new(),
            upload_attempts: 0,
            deleted_assets: Vec::new(),
            next_id: 1,
        }
    }
}

impl FakeState {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn meta(&self, status: u16) -> ResponseMeta {
        ResponseMeta {
            status,
            scopes: Some(self.scopes.clone()),
            request_id: Some("FAKE:REQUEST".to_string()),
            enterprise_version: self.enterprise_version.clone(),
            location: None,
        }
    }

    fn error(&self, method: &'static str, status: u16, codes: &[&str]) -> ApiError {
        ApiError::Status {
            method,
            url: "fake://api".to_string(),
            status,
            meta: self.meta(status),
            message: format!("fake status {}", status),
            codes: codes.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn release_mut(&mut self, id: u64) -> Result<&mut Release, ApiError> {
        let missing = self.error("GET", 404, &[]);
        self.releases.iter_mut().find(|r| r.id == id).ok_or(missing)
    }
}

/// In-memory hosting service. Clones share state so tests can inspect it
/// after handing a copy to an engine.
#[derive(Clone, Default)]
pub struct FakeHost {
    pub state: Rc<RefCell<FakeState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a release with the given assets and return it.
    pub fn add_release(&self, tag: &str, assets: &[(&str, &[u8])]) -> Release {
        let mut state = self.state.borrow_mut();
        let id = state.next_id();
        let mut release = Release {
            id,
            tag_name: tag.to_string(),
            name: Some(format!("Release {}", tag)),
            body: Some(format!("Bundle {}", tag)),
            draft: false,
            prerelease: false,
            target_commitish: Some("main".to_string()),
            assets: Vec::new(),
            other: serde_json::Map::new(),
        };
        release.other.insert(
            "html_url".to_string(),
            serde_json::Value::String(format!("https://github.com/releases/{}", tag)),
        );
        for (name, contents) in assets {
            let asset_id = state.next_id();
            state.contents.insert(asset_id, contents.to_vec());
            release.assets.push(Asset {
                id: asset_id,
                name: name.to_string(),
                size: contents.len() as u64,
                content_type: None,
                other: serde_json::Map::new(),
            });
        }
        state.releases.push(release.clone());
        release
    }

    /// Add a repository as if it already existed on the server.
    pub fn add_repository(&self, key: &str, homepage: Option<&str>, visibility: &str) {
        let mut state = self.state.borrow_mut();
        let name = key.rsplit('/').next().unwrap_or(key).to_string();
        let clone_url = state.clone_url.clone();
        state.repositories.insert(
            key.to_string(),
            ApiRepository {
                name,
                homepage: homepage.map(str::to_string),
                clone_url,
                visibility: Some(visibility.to_string()),
                private: visibility != "public",
            },
        );
    }

    pub fn release(&self, tag: &str) -> Option<Release> {
        self.state
            .borrow()
            .releases
            .iter()
            .find(|r| r.tag_name == tag)
            .cloned()
    }

    pub fn total_downloads(&self) -> usize {
        self.state.borrow().downloads.values().sum()
    }
}

fn git_has_reference(path: &str, name: &str) -> bool {
    Repository::open_bare(path)
        .map(|repo| repo.find_reference(name).is_ok())
        .unwrap_or(false)
}

impl Hosting for FakeHost {
    fn probe(&self) -> Result<ResponseMeta, ApiError> {
        let state = self.state.borrow();
        let mut meta = state.meta(state.probe_status);
        meta.location = state.probe_location.clone();
        Ok(meta)
    }

    fn current_user(&self) -> Result<User, ApiError> {
        Ok(User {
            login: self.state.borrow().login.clone(),
        })
    }

    fn get_organization(&self, login: &str) -> Result<Option<Organization>, ApiError> {
        let state = self.state.borrow();
        Ok(state.organizations.contains(login).then(|| Organization {
            login: login.to_string(),
        }))
    }

    fn create_organization(&self, login: &str, admin: &str) -> Result<Organization, ApiError> {
        let mut state = self.state.borrow_mut();
        if !state.scopes.iter().any(|s| s == "site_admin") {
            return Err(state.error("POST", 404, &[]));
        }
        state.organizations.insert(login.to_string());
        state
            .members
            .insert((login.to_string(), admin.to_string()));
        Ok(Organization {
            login: login.to_string(),
        })
    }

    fn membership_status(&self, org: &str, user: &str) -> Result<ResponseMeta, ApiError> {
        let state = self.state.borrow();
        let member = state
            .members
            .contains(&(org.to_string(), user.to_string()));
        Ok(state.meta(if member { 204 } else { 404 }))
    }

    fn create_impersonation_token(&self, user: &str, scopes: &[&str]) -> Result<String, ApiError> {
        let mut state = self.state.borrow_mut();
        if !state.scopes.iter().any(|s| s == "site_admin") {
            return Err(state.error("POST", 403, &[]));
        }
        state.impersonations.push((
            user.to_string(),
            scopes.iter().map(|s| s.to_string()).collect(),
        ));
        Ok(format!("impersonation-{}", user))
    }

    fn set_token(&mut self, token: String) {
        let mut state = self.state.borrow_mut();
        let impersonated = token.strip_prefix("impersonation-").map(str::to_string);
        if let Some(user) = impersonated {
            let scopes = state
                .impersonations
                .iter()
                .rev()
                .find(|(login, _)| *login == user)
                .map(|(_, scopes)| scopes.clone())
                .unwrap_or_default();
            state.login = user;
            state.scopes = scopes;
        }
        state.token = token;
    }

    fn get_repository(&self, repo: &RepoKey) -> Result<Option<ApiRepository>, ApiError> {
        Ok(self
            .state
            .borrow()
            .repositories
            .get(&repo.to_string())
            .cloned())
    }

    fn create_repository(
        &self,
        org: Option<&str>,
        settings: &RepositorySettings,
    ) -> Result<ApiRepository, ApiError> {
        let mut state = self.state.borrow_mut();
        let visibility = settings.visibility.clone().unwrap_or_else(|| "public".to_string());
        let acceptable: &[&str] = if visibility == "public" {
            &["public_repo", "repo"]
        } else {
            &["repo"]
        };
        if !state.scopes.iter().any(|s| acceptable.contains(&s.as_str())) {
            return Err(state.error("POST", 404, &[]));
        }
        let owner = org.map(str::to_string).unwrap_or_else(|| state.login.clone());
        let repository = ApiRepository {
            name: settings.name.clone(),
            homepage: Some(settings.homepage.clone()),
            clone_url: state.clone_url.clone(),
            private: visibility != "public",
            visibility: Some(visibility),
        };
        state
            .repositories
            .insert(format!("{}/{}", owner, settings.name), repository.clone());
        state
            .created_repositories
            .push((org.map(str::to_string), settings.clone()));
        Ok(repository)
    }

    fn edit_repository(
        &self,
        repo: &RepoKey,
        settings: &RepositorySettings,
    ) -> Result<ApiRepository, ApiError> {
        let mut state = self.state.borrow_mut();
        state.edited_repositories.push(settings.clone());
        let missing = state.error("PATCH", 404, &[]);
        let repository = state
            .repositories
            .get_mut(&repo.to_string())
            .ok_or(missing)?;
        repository.homepage = Some(settings.homepage.clone());
        if let Some(visibility) = &settings.visibility {
            repository.private = visibility != "public";
            repository.visibility = Some(visibility.clone());
        }
        Ok(repository.clone())
    }

    fn get_release_by_tag(&self, _repo: &RepoKey, tag: &str) -> Result<Option<Release>, ApiError> {
        Ok(self.release(tag))
    }

    fn create_release(&self, _repo: &RepoKey, request: &ReleaseRequest) -> Result<Release, ApiError> {
        let mut state = self.state.borrow_mut();
        if state.releases.iter().any(|r| r.tag_name == request.tag_name) {
            return Err(state.error("POST", 422, &["already_exists"]));
        }
        let tag_present =
            git_has_reference(&state.clone_url, &format!("refs/tags/{}", request.tag_name));
        let main_present = git_has_reference(&state.clone_url, "refs/heads/main");
        state
            .release_creation_git_state
            .push((request.tag_name.clone(), tag_present, main_present));
        state.created_releases.push(request.tag_name.clone());

        let id = state.next_id();
        let release = Release {
            id,
            tag_name: request.tag_name.clone(),
            name: request.name.clone(),
            body: request.body.clone(),
            draft: request.draft,
            prerelease: request.prerelease,
            target_commitish: None,
            assets: Vec::new(),
            other: serde_json::Map::new(),
        };
        state.releases.push(release.clone());
        Ok(release)
    }

    fn edit_release(
        &self,
        _repo: &RepoKey,
        release_id: u64,
        request: &ReleaseRequest,
    ) -> Result<Release, ApiError> {
        let mut state = self.state.borrow_mut();
        state.edited_releases.push(request.tag_name.clone());
        let release = state.release_mut(release_id)?;
        release.tag_name = request.tag_name.clone();
        release.name = request.name.clone();
        release.body = request.body.clone();
        release.draft = request.draft;
        release.prerelease = request.prerelease;
        Ok(release.clone())
    }

    fn list_release_assets(&self, _repo: &RepoKey, release_id: u64) -> Result<Vec<Asset>, ApiError> {
        let mut state = self.state.borrow_mut();
        Ok(state.release_mut(release_id)?.assets.clone())
    }

    fn upload_release_asset(
        &self,
        _repo: &RepoKey,
        release_id: u64,
        name: &str,
        size: u64,
        body: &mut dyn Read,
    ) -> Result<Asset, ApiError> {
        let mut contents = Vec::new();
        body.read_to_end(&mut contents)?;
        assert_eq!(contents.len() as u64, size);

        let mut state = self.state.borrow_mut();
        state.upload_attempts += 1;
        let failure = state.upload_failures.pop_front();
        let duplicate = state
            .release_mut(release_id)?
            .assets
            .iter()
            .any(|a| a.name == name);

        let store = |state: &mut FakeState| -> Result<Asset, ApiError> {
            let id = state.next_id();
            state.contents.insert(id, contents.clone());
            let asset = Asset {
                id,
                name: name.to_string(),
                size,
                content_type: None,
                other: serde_json::Map::new(),
            };
            state.release_mut(release_id)?.assets.push(asset.clone());
            Ok(asset)
        };

        match failure {
            // A previous attempt got through even though its response was lost.
            Some(422) => {
                if !duplicate {
                    store(&mut *state)?;
                }
                Err(state.error("POST", 422, &["already_exists"]))
            }
            Some(status) => Err(state.error("POST", status, &[])),
            None if duplicate => Err(state.error("POST", 422, &["already_exists"])),
            None => store(&mut *state),
        }
    }

    fn delete_release_asset(&self, _repo: &RepoKey, asset_id: u64) -> Result<(), ApiError> {
        let mut state = self.state.borrow_mut();
        state.deleted_assets.push(asset_id);
        for release in &mut state.releases {
            release.assets.retain(|a| a.id != asset_id);
        }
        Ok(())
    }

    fn download_release_asset(
        &self,
        _repo: &RepoKey,
        asset_id: u64,
    ) -> Result<AssetDownload, ApiError> {
        let mut state = self.state.borrow_mut();
        *state.downloads.entry(asset_id).or_default() += 1;
        if state.redirect_downloads {
            return Ok(AssetDownload::Redirect(format!("fake://storage/{}", asset_id)));
        }
        let contents = state.contents.get(&asset_id).cloned().unwrap_or_default();
        Ok(AssetDownload::Content(Box::new(Cursor::new(contents))))
    }

    fn fetch_url(&self, url: &str) -> Result<Box<dyn Read + Send>, ApiError> {
        let mut state = self.state.borrow_mut();
        state.fetched_urls.push(url.to_string());
        let contents = url
            .strip_prefix("fake://storage/")
            .and_then(|id| id.parse::<u64>().ok())
            .and_then(|id| state.contents.get(&id).cloned())
            .unwrap_or_default();
        Ok(Box::new(Cursor::new(contents)))
    }
}

/// A temporary directory holding a cache path and a destination path.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn cache_path(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    pub fn destination_path(&self) -> PathBuf {
        self.dir.path().join("destination.git")
    }
}
