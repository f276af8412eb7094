//! GitHub REST API surface used by the pull and push engines.
//!
//! The engines only see the [`Hosting`] trait. [`GitHubClient`] implements it
//! over HTTP for github.com and GitHub Enterprise Server; tests use an
//! in-memory implementation.

mod client;

use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::GitHubClient;

use crate::error::ErrorKind;
use crate::types::RepoKey;

/// Header listing the OAuth scopes granted to the token.
pub const OAUTH_SCOPES_HEADER: &str = "X-OAuth-Scopes";
/// Header carrying the server-side request identifier.
pub const REQUEST_ID_HEADER: &str = "X-GitHub-Request-Id";
/// Header only GitHub Enterprise Server sends.
pub const ENTERPRISE_VERSION_HEADER: &str = "X-GitHub-Enterprise-Version";

/// Response details kept for classification and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: u16,
    /// `None` when the server did not send the scopes header.
    pub scopes: Option<Vec<String>>,
    pub request_id: Option<String>,
    pub enterprise_version: Option<String>,
    pub location: Option<String>,
}

impl ResponseMeta {
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// Parse a comma-separated scopes header value.
    pub fn parse_scopes(header: &str) -> Vec<String> {
        header
            .split(',')
            .map(str::trim)
            .filter(|scope| !scope.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// True if the token holds at least one of `scopes`. Unknown scopes count as none.
    pub fn has_any_scope(&self, scopes: &[&str]) -> bool {
        self.scopes
            .as_ref()
            .is_some_and(|granted| granted.iter().any(|g| scopes.contains(&g.as_str())))
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }
}

/// Errors returned by the hosting API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The server answered with an unexpected status.
    #[error("{method} {url} returned {status}: {message}{}", RequestId(&.meta.request_id))]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        meta: ResponseMeta,
        message: String,
        /// `errors[].code` values from the response body.
        codes: Vec<String>,
    },
    /// The request never produced a response.
    #[error("{method} {url} failed: {message}")]
    Transport {
        method: &'static str,
        url: String,
        message: String,
    },
    /// The response body did not have the expected shape.
    #[error("error decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error while talking to the API: {0}")]
    Io(#[from] std::io::Error),
    #[error("request cancelled")]
    Cancelled,
}

struct RequestId<'a>(&'a Option<String>);

impl fmt::Display for RequestId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(id) => write!(f, " (request {})", id),
            None => Ok(()),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn meta(&self) -> Option<&ResponseMeta> {
        match self {
            ApiError::Status { meta, .. } => Some(meta),
            _ => None,
        }
    }

    /// A 422 whose body reports an `already_exists` validation error.
    pub fn is_already_exists(&self) -> bool {
        match self {
            ApiError::Status { status, codes, .. } => {
                *status == 422 && codes.iter().any(|c| c == "already_exists")
            }
            _ => false,
        }
    }

    pub fn is_server_error(&self) -> bool {
        self.status().is_some_and(|status| status >= 500)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Status { status, .. } if *status >= 500 => ErrorKind::Transient,
            ApiError::Status { .. } => ErrorKind::User,
            ApiError::Transport { .. } => ErrorKind::Transient,
            ApiError::Decode { .. } | ApiError::Io(_) | ApiError::Cancelled => ErrorKind::Fatal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Organization {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Repository {
    pub name: String,
    #[serde(default)]
    pub homepage: Option<String>,
    pub clone_url: String,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub private: bool,
}

impl Repository {
    /// Effective visibility; older servers only report `private`.
    pub fn visibility(&self) -> &str {
        match self.visibility.as_deref() {
            Some(visibility) => visibility,
            None if self.private => "private",
            None => "public",
        }
    }
}

/// Properties written when creating or editing the destination repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositorySettings {
    pub name: String,
    pub homepage: String,
    pub has_issues: bool,
    pub has_projects: bool,
    pub has_wiki: bool,
    pub has_pages: bool,
    pub has_downloads: bool,
    pub archived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
}

/// A release asset as reported by the API.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Asset {
    pub id: u64,
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

/// A release as reported by the API. Fields this tool does not use are kept in `other`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Release {
    pub id: u64,
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_commitish: Option<String>,
    #[serde(default)]
    pub assets: Vec<Asset>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

/// Body for creating or editing a release. Never carries a target commitish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseRequest {
    pub tag_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub draft: bool,
    pub prerelease: bool,
}

impl From<&Release> for ReleaseRequest {
    fn from(release: &Release) -> Self {
        Self {
            tag_name: release.tag_name.clone(),
            name: release.name.clone(),
            body: release.body.clone(),
            draft: release.draft,
            prerelease: release.prerelease,
        }
    }
}

/// Outcome of asking for an asset's content.
pub enum AssetDownload {
    /// The API served the bytes directly.
    Content(Box<dyn Read + Send>),
    /// The API pointed at a storage URL to fetch without credentials.
    Redirect(String),
}

impl fmt::Debug for AssetDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetDownload::Content(_) => f.write_str("Content(..)"),
            AssetDownload::Redirect(url) => f.debug_tuple("Redirect").field(url).finish(),
        }
    }
}

/// Operations the engines need from a hosting service.
pub trait Hosting {
    /// Check the API root without following redirects.
    fn probe(&self) -> Result<ResponseMeta, ApiError>;

    fn current_user(&self) -> Result<User, ApiError>;

    fn get_organization(&self, login: &str) -> Result<Option<Organization>, ApiError>;

    /// Create an organization through the site admin API.
    fn create_organization(&self, login: &str, admin: &str) -> Result<Organization, ApiError>;

    /// Query org membership. Any of 204, 302 and 404 is returned as a status, not an error.
    fn membership_status(&self, org: &str, user: &str) -> Result<ResponseMeta, ApiError>;

    /// Issue an impersonation token for `user` with `scopes`. Needs `site_admin`.
    fn create_impersonation_token(&self, user: &str, scopes: &[&str]) -> Result<String, ApiError>;

    /// Replace the token used for subsequent requests.
    fn set_token(&mut self, token: String);

    fn get_repository(&self, repo: &RepoKey) -> Result<Option<Repository>, ApiError>;

    /// Create a repository under `org`, or under the current user when `org` is `None`.
    fn create_repository(
        &self,
        org: Option<&str>,
        settings: &RepositorySettings,
    ) -> Result<Repository, ApiError>;

    fn edit_repository(
        &self,
        repo: &RepoKey,
        settings: &RepositorySettings,
    ) -> Result<Repository, ApiError>;

    fn get_release_by_tag(&self, repo: &RepoKey, tag: &str) -> Result<Option<Release>, ApiError>;

    fn create_release(&self, repo: &RepoKey, release: &ReleaseRequest) -> Result<Release, ApiError>;

    fn edit_release(
        &self,
        repo: &RepoKey,
        release_id: u64,
        release: &ReleaseRequest,
    ) -> Result<Release, ApiError>;

    /// All assets of a release, following pagination.
    fn list_release_assets(&self, repo: &RepoKey, release_id: u64) -> Result<Vec<Asset>, ApiError>;

    fn upload_release_asset(
        &self,
        repo: &RepoKey,
        release_id: u64,
        name: &str,
        size: u64,
        body: &mut dyn Read,
    ) -> Result<Asset, ApiError>;

    fn delete_release_asset(&self, repo: &RepoKey, asset_id: u64) -> Result<(), ApiError>;

    fn download_release_asset(
        &self,
        repo: &RepoKey,
        asset_id: u64,
    ) -> Result<AssetDownload, ApiError>;

    /// Unauthenticated GET of an absolute URL (asset storage redirects).
    fn fetch_url(&self, url: &str) -> Result<Box<dyn Read + Send>, ApiError>;
}
