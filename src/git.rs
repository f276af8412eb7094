//! Git operations on the cache's bare repository, built on libgit2.
//!
//! Everything that talks to a remote (listing, fetching, pushing) goes through
//! [`GitRemote`], which carries the URL, the token, the TLS policy and the
//! cancellation flag so that every transfer uses the same callbacks:
//!
//! - `credentials` answers with `x-access-token:<token>` once, then gives up
//! - `certificate_check` accepts any certificate when insecure mode is on
//! - `transfer_progress` / `sideband_progress` abort when cancelled

use std::cell::RefCell;
use std::path::Path;

use git2::{
    AutotagOption, CertificateCheckStatus, Cred, CredentialType, Direction, ErrorClass, ErrorCode,
    FetchOptions, Oid, PushOptions, RemoteCallbacks, Repository, RepositoryInitOptions,
};
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::error::ErrorKind;

/// Username sent alongside a token over HTTPS.
const TOKEN_USERNAME: &str = "x-access-token";

/// Errors returned by git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// libgit2 reported an error.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    /// Repository path does not contain a git repo.
    #[error("repository not found at {0}")]
    NotFound(String),
    /// Output parsing or unexpected git data.
    #[error("failed to parse git data: {0}")]
    ParseError(String),
    /// The remote refused one or more reference updates.
    #[error("the remote rejected the update of {reference}: {reason}")]
    Rejected { reference: String, reason: String },
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The transfer was interrupted.
    #[error("git transfer cancelled")]
    Cancelled,
}

impl GitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GitError::Git(e) if e.code() == ErrorCode::Auth => ErrorKind::User,
            GitError::Git(e) => match e.class() {
                ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssl => ErrorKind::Transient,
                _ => ErrorKind::Fatal,
            },
            GitError::Rejected { .. } | GitError::InvalidInput(_) => ErrorKind::User,
            GitError::NotFound(_)
            | GitError::ParseError(_)
            | GitError::Io(_)
            | GitError::Cancelled => ErrorKind::Fatal,
        }
    }
}

/// Validate that a git ref (branch name, tag or release id) does not contain dangerous patterns.
///
/// Rejects:
/// - Empty strings
/// - Strings containing `..` (path traversal)
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes or control characters
pub fn validate_git_ref(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.contains("..") {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain '..'",
            name
        )));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot start with '-'",
            name
        )));
    }
    if value.bytes().any(|b| b == 0 || b < 0x20) {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain null or control characters",
            name
        )));
    }
    Ok(())
}

/// Validate that a value is safe to use as a single path component
/// (release ids and asset names end up as cache directory entries).
pub fn validate_name(value: &str, name: &str) -> Result<(), GitError> {
    validate_git_ref(value, name)?;
    if value.contains('/') || value.contains('\\') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain path separators",
            name
        )));
    }
    Ok(())
}

/// Open an existing repository at the given path.
pub fn open_repository(path: &Path) -> Result<Repository, GitError> {
    let repo = Repository::open(path).map_err(|e| {
        if e.code() == git2::ErrorCode::NotFound {
            GitError::NotFound(path.display().to_string())
        } else {
            GitError::Git(e)
        }
    })?;
    Ok(repo)
}

/// A reference advertised by a remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    pub name: String,
    pub oid: Oid,
}

impl RemoteRef {
    /// Peeled annotated-tag entries (`refs/tags/x^{}`) are advertisement artefacts.
    pub fn is_peeled(&self) -> bool {
        self.name.ends_with("^{}")
    }
}

/// Connection settings for one remote.
#[derive(Debug, Clone)]
pub struct GitRemote {
    pub url: String,
    pub token: Option<String>,
    pub insecure: bool,
    pub cancel: CancellationToken,
}

impl GitRemote {
    pub fn new(url: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            url: url.into(),
            token: None,
            insecure: false,
            cancel,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    fn callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();

        if let Some(token) = self.token.as_deref() {
            let mut attempts = 0u32;
            callbacks.credentials(move |_url, _username, allowed| {
                attempts += 1;
                if attempts > 1 {
                    return Err(git2::Error::new(
                        ErrorCode::Auth,
                        ErrorClass::Http,
                        "the remote rejected the provided token",
                    ));
                }
                if !allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
                    return Err(git2::Error::from_str(
                        "remote does not accept username/password credentials",
                    ));
                }
                Cred::userpass_plaintext(TOKEN_USERNAME, token)
            });
        }

        if self.insecure {
            callbacks.certificate_check(|_cert, host| {
                log::debug!("Skipping certificate verification for {}", host);
                Ok(CertificateCheckStatus::CertificateOk)
            });
        }

        let cancel = self.cancel.clone();
        callbacks.transfer_progress(move |_| !cancel.is_cancelled());
        let cancel = self.cancel.clone();
        callbacks.sideband_progress(move |data| {
            let line = String::from_utf8_lossy(data);
            let line = line.trim_end();
            if !line.is_empty() {
                log::debug!("remote: {}", line);
            }
            !cancel.is_cancelled()
        });
        callbacks
    }

    fn check_cancelled(&self, err: git2::Error) -> GitError {
        if self.cancel.is_cancelled() {
            GitError::Cancelled
        } else {
            GitError::Git(err)
        }
    }
}

/// A bare repository owned by the cache.
pub struct GitStore {
    repo: Repository,
}

impl GitStore {
    /// Open the store at `path`.
    pub fn open(path: &Path) -> Result<Self, GitError> {
        Ok(Self {
            repo: open_repository(path)?,
        })
    }

    /// Create an empty bare repository at `path`, discarding anything already there.
    pub fn init_bare(path: &Path) -> Result<Self, GitError> {
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        let mut options = RepositoryInitOptions::new();
        options.bare(true).initial_head("main");
        let repo = Repository::init_opts(path, &options)?;
        Ok(Self { repo })
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// All direct references under `refs/`, sorted by name.
    pub fn references(&self) -> Result<Vec<(String, Oid)>, GitError> {
        let mut refs = Vec::new();
        for reference in self.repo.references()? {
            let reference = reference?;
            let (Some(name), Some(oid)) = (reference.name(), reference.target()) else {
                continue;
            };
            if name.starts_with("refs/") {
                refs.push((name.to_string(), oid));
            }
        }
        refs.sort();
        Ok(refs)
    }

    /// Delete a local reference. Missing references are not an error.
    pub fn delete_reference(&self, name: &str) -> Result<(), GitError> {
        match self.repo.find_reference(name) {
            Ok(mut reference) => Ok(reference.delete()?),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Commit a reference ultimately points to (annotated tags are peeled).
    pub fn resolve_commit(&self, name: &str) -> Result<Oid, GitError> {
        let reference = self.repo.find_reference(name)?;
        Ok(reference.peel_to_commit()?.id())
    }

    /// Read a UTF-8 file from a commit's tree. `Ok(None)` when the path does not exist.
    pub fn read_file_at_commit(&self, commit: Oid, path: &str) -> Result<Option<String>, GitError> {
        let tree = self.repo.find_commit(commit)?.tree()?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let object = entry.to_object(&self.repo)?;
        let Some(blob) = object.as_blob() else {
            return Ok(None);
        };
        String::from_utf8(blob.content().to_vec())
            .map(Some)
            .map_err(|_| GitError::ParseError(format!("{} is not valid UTF-8", path)))
    }

    /// List the references a remote advertises.
    pub fn list_remote_refs(&self, remote: &GitRemote) -> Result<Vec<RemoteRef>, GitError> {
        let mut anonymous = self.repo.remote_anonymous(&remote.url)?;
        let connection = anonymous
            .connect_auth(Direction::Fetch, Some(remote.callbacks()), None)
            .map_err(|e| remote.check_cancelled(e))?;
        let refs = connection
            .list()?
            .iter()
            .map(|head| RemoteRef {
                name: head.name().to_string(),
                oid: head.oid(),
            })
            .collect();
        Ok(refs)
    }

    /// Fetch `refspecs` from the remote. Tags are only fetched when a refspec names them.
    pub fn fetch(&self, remote: &GitRemote, refspecs: &[String]) -> Result<(), GitError> {
        for refspec in refspecs {
            validate_git_ref(refspec, "refspec")?;
        }
        let mut anonymous = self.repo.remote_anonymous(&remote.url)?;
        let mut options = FetchOptions::new();
        options.remote_callbacks(remote.callbacks());
        options.download_tags(AutotagOption::None);
        anonymous
            .fetch(refspecs, Some(&mut options), None)
            .map_err(|e| remote.check_cancelled(e))?;
        Ok(())
    }

    /// Push `refspecs` to the remote, failing if any single update is rejected.
    pub fn push(&self, remote: &GitRemote, refspecs: &[String]) -> Result<(), GitError> {
        if refspecs.is_empty() {
            return Ok(());
        }
        for refspec in refspecs {
            validate_git_ref(refspec.trim_start_matches('+'), "refspec")?;
        }

        let rejected: RefCell<Option<(String, String)>> = RefCell::new(None);
        let mut callbacks = remote.callbacks();
        callbacks.push_update_reference(|reference, status| {
            if let Some(reason) = status {
                log::debug!("Remote rejected {}: {}", reference, reason);
                rejected
                    .borrow_mut()
                    .get_or_insert_with(|| (reference.to_string(), reason.to_string()));
            }
            Ok(())
        });

        let mut anonymous = self.repo.remote_anonymous(&remote.url)?;
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);
        anonymous
            .push(refspecs, Some(&mut options))
            .map_err(|e| remote.check_cancelled(e))?;
        drop(options);

        match rejected.into_inner() {
            Some((reference, reason)) => Err(GitError::Rejected { reference, reason }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{SourceFixture, commit, init_bare_main};
    use tempfile::tempdir;

    fn local(url: &Path) -> GitRemote {
        GitRemote::new(url.to_string_lossy(), CancellationToken::new())
    }

    #[test]
    fn open_repository_not_found() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let nonexistent = temp_dir.path().join("nonexistent");

        let err = open_repository(&nonexistent).err().unwrap();
        match err {
            GitError::NotFound(path) => assert!(path.contains("nonexistent")),
            other => panic!("Expected NotFound error, got: {:?}", other),
        }
    }

    #[test]
    fn init_bare_discards_existing_content() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("git");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("junk"), "junk").unwrap();

        let store = GitStore::init_bare(&path).unwrap();
        assert!(!path.join("junk").exists());
        assert!(store.repository().is_bare());
        assert!(store.references().unwrap().is_empty());
        GitStore::open(&path).unwrap();
    }

    #[test]
    fn list_fetch_and_read_from_local_remote() {
        let source = SourceFixture::new();
        let temp_dir = tempdir().unwrap();
        let store = GitStore::init_bare(&temp_dir.path().join("git")).unwrap();
        let remote = local(source.path());

        let advertised = store.list_remote_refs(&remote).unwrap();
        assert!(
            advertised
                .iter()
                .any(|r| r.name == "refs/heads/main" && r.oid == source.main)
        );

        store
            .fetch(&remote, &["+refs/heads/*:refs/remotes/origin/heads/*".to_string()])
            .unwrap();
        let refs = store.references().unwrap();
        assert!(refs.contains(&("refs/remotes/origin/heads/main".to_string(), source.main)));
        assert!(!refs.iter().any(|(name, _)| name.contains("/tags/")));

        let commit = store
            .resolve_commit("refs/remotes/origin/heads/main")
            .unwrap();
        let contents = store
            .read_file_at_commit(commit, "src/defaults.json")
            .unwrap()
            .unwrap();
        assert!(contents.contains("codeql-bundle-main"));
        assert_eq!(store.read_file_at_commit(commit, "missing.txt").unwrap(), None);
        assert_eq!(store.read_file_at_commit(commit, "src").unwrap(), None);
    }

    #[test]
    fn push_and_delete_on_local_remote() {
        let source = SourceFixture::new();
        let temp_dir = tempdir().unwrap();
        let store = GitStore::init_bare(&temp_dir.path().join("git")).unwrap();
        store
            .fetch(
                &local(source.path()),
                &["+refs/heads/*:refs/remotes/origin/heads/*".to_string()],
            )
            .unwrap();

        let destination_path = temp_dir.path().join("destination");
        let destination = init_bare_main(&destination_path);
        let remote = local(&destination_path);
        store
            .push(
                &remote,
                &["+refs/remotes/origin/heads/main:refs/heads/main".to_string()],
            )
            .unwrap();
        assert_eq!(
            destination.refname_to_id("refs/heads/main").unwrap(),
            source.main
        );

        store.delete_reference("refs/remotes/origin/heads/main").unwrap();
        store.delete_reference("refs/remotes/origin/heads/main").unwrap();
        assert!(
            store
                .resolve_commit("refs/remotes/origin/heads/main")
                .is_err()
        );
    }

    #[test]
    fn push_deletes_remote_branch() {
        let temp_dir = tempdir().unwrap();
        let destination_path = temp_dir.path().join("destination");
        let destination = init_bare_main(&destination_path);
        let first = commit(&destination, &[("README.md", "main")], &[], "first");
        destination
            .reference("refs/heads/main", first, true, "test")
            .unwrap();
        destination
            .reference("refs/heads/stale", first, true, "test")
            .unwrap();

        let store = GitStore::init_bare(&temp_dir.path().join("git")).unwrap();
        store
            .push(&local(&destination_path), &[":refs/heads/stale".to_string()])
            .unwrap();
        assert!(destination.find_reference("refs/heads/stale").is_err());
        assert!(destination.find_reference("refs/heads/main").is_ok());
    }

    #[test]
    fn failures_after_cancellation_report_cancellation() {
        let remote = local(Path::new("unused"));
        let err = git2::Error::from_str("user cancelled");
        assert!(matches!(remote.check_cancelled(err), GitError::Git(_)));

        remote.cancel.cancel();
        let err = remote.check_cancelled(git2::Error::from_str("user cancelled"));
        assert!(matches!(err, GitError::Cancelled));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn error_kinds() {
        let network = git2::Error::new(ErrorCode::GenericError, ErrorClass::Net, "reset");
        assert_eq!(GitError::Git(network).kind(), ErrorKind::Transient);
        let auth = git2::Error::new(ErrorCode::Auth, ErrorClass::Callback, "denied");
        assert_eq!(GitError::Git(auth).kind(), ErrorKind::User);
        let corrupt = git2::Error::new(ErrorCode::GenericError, ErrorClass::Odb, "corrupt");
        assert_eq!(GitError::Git(corrupt).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn validate_name_rejects_path_separators() {
        assert!(matches!(
            validate_name("foo/bar", "release"),
            Err(GitError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_name("foo\\bar", "release"),
            Err(GitError::InvalidInput(_))
        ));
    }

    #[test]
    fn validate_name_accepts_valid_names() {
        assert!(validate_name("codeql-bundle-20200630", "release").is_ok());
        assert!(validate_name("codeql-bundle-linux64.tar.gz", "asset").is_ok());
    }

    #[test]
    fn validate_git_ref_rejects_empty() {
        let result = validate_git_ref("", "branch");
        assert!(matches!(result, Err(GitError::InvalidInput(_))));
    }

    #[test]
    fn validate_git_ref_rejects_path_traversal() {
        let result = validate_git_ref("refs/../HEAD", "branch");
        assert!(matches!(result, Err(GitError::InvalidInput(_))));
    }

    #[test]
    fn validate_git_ref_rejects_leading_dash() {
        let result = validate_git_ref("--upload-pack=evil", "branch");
        assert!(matches!(result, Err(GitError::InvalidInput(_))));
    }

    #[test]
    fn validate_git_ref_accepts_valid_refs() {
        assert!(validate_git_ref("main", "branch").is_ok());
        assert!(validate_git_ref("refs/remotes/origin/heads/v1", "branch").is_ok());
        assert!(validate_git_ref(":refs/heads/v1", "refspec").is_ok());
    }
}
