//! ureq-backed implementation of [`Hosting`].

use std::io::Read;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{
    ApiError, Asset, AssetDownload, ENTERPRISE_VERSION_HEADER, Hosting, OAUTH_SCOPES_HEADER,
    Organization, REQUEST_ID_HEADER, Release, ReleaseRequest, Repository, RepositorySettings,
    ResponseMeta, User,
};
use crate::cancel::CancellationToken;
use crate::transport::{TransportConfig, TransportError};
use crate::types::RepoKey;

const GITHUB_DOT_COM_API: &str = "https://api.github.com";
const GITHUB_DOT_COM_UPLOADS: &str = "https://uploads.github.com";
const ACCEPT_JSON: &str = "application/vnd.github+json";
const ACCEPT_BINARY: &str = "application/octet-stream";
const PER_PAGE: usize = 100;

/// REST client for github.com or a GitHub Enterprise Server installation.
pub struct GitHubClient {
    agent: ureq::Agent,
    api_url: String,
    uploads_url: String,
    token: Option<String>,
    cancel: CancellationToken,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<String>,
}

/// Extract the message and validation codes from an error response body.
fn parse_error_body(body: &str) -> (Option<String>, Vec<String>) {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let codes = parsed.errors.into_iter().filter_map(|e| e.code).collect();
    (parsed.message, codes)
}

fn meta_of(response: &ureq::Response) -> ResponseMeta {
    ResponseMeta {
        status: response.status(),
        scopes: response
            .header(OAUTH_SCOPES_HEADER)
            .map(ResponseMeta::parse_scopes),
        request_id: response.header(REQUEST_ID_HEADER).map(str::to_string),
        enterprise_version: response
            .header(ENTERPRISE_VERSION_HEADER)
            .map(str::to_string),
        location: response.header("Location").map(str::to_string),
    }
}

fn status_error(method: &'static str, url: &str, response: ureq::Response) -> ApiError {
    let meta = meta_of(&response);
    let status = response.status();
    let status_text = response.status_text().to_string();
    let body = response.into_string().unwrap_or_default();
    let (message, codes) = parse_error_body(&body);
    ApiError::Status {
        method,
        url: url.to_string(),
        status,
        meta,
        message: message.unwrap_or(status_text),
        codes,
    }
}

/// Content type for an uploaded asset, from its file extension.
fn content_type_for(name: &str) -> &'static str {
    let extension = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("gz") | Some("tgz") => "application/gzip",
        Some("zst") => "application/zstd",
        Some("zip") => "application/zip",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

impl GitHubClient {
    /// Client for the public API. The token is optional; anonymous access is rate limited.
    pub fn github_dot_com(
        token: Option<String>,
        transport: &TransportConfig,
        cancel: CancellationToken,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            agent: transport.agent()?,
            api_url: GITHUB_DOT_COM_API.to_string(),
            uploads_url: GITHUB_DOT_COM_UPLOADS.to_string(),
            token: token.filter(|t| !t.is_empty()),
            cancel,
        })
    }

    /// Client for a GitHub Enterprise Server instance at `base_url`.
    pub fn enterprise(
        base_url: &str,
        token: String,
        transport: &TransportConfig,
        cancel: CancellationToken,
    ) -> Result<Self, TransportError> {
        let base_url = base_url.trim_end_matches('/');
        Ok(Self {
            agent: transport.agent()?,
            api_url: format!("{}/api/v3", base_url),
            uploads_url: format!("{}/api/uploads", base_url),
            token: Some(token),
            cancel,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let request = self.agent.request(method, url).set("Accept", ACCEPT_JSON);
        match &self.token {
            Some(token) => request.set("Authorization", &format!("token {}", token)),
            None => request,
        }
    }

    /// Run a request and turn non-success statuses into [`ApiError::Status`].
    ///
    /// 3xx responses are returned as-is since redirects are never followed.
    fn execute(
        &self,
        method: &'static str,
        url: &str,
        send: impl FnOnce() -> Result<ureq::Response, ureq::Error>,
    ) -> Result<ureq::Response, ApiError> {
        if self.cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        log::debug!("{} {}", method, url);
        match send() {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(_, response)) => Err(status_error(method, url, response)),
            Err(ureq::Error::Transport(e)) => Err(ApiError::Transport {
                method,
                url: url.to_string(),
                message: e.to_string(),
            }),
        }
    }

    fn decode<T: DeserializeOwned>(url: &str, response: ureq::Response) -> Result<T, ApiError> {
        response.into_json().map_err(|source| ApiError::Decode {
            url: url.to_string(),
            source,
        })
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.url(path);
        let response = self.execute("GET", &url, || self.request("GET", &url).call())?;
        Self::decode(&url, response)
    }

    /// GET that maps 404 to `None`.
    fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ApiError> {
        match self.get_json(path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.status() == Some(404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send_json<T: DeserializeOwned, B: Serialize>(
        &self,
        method: &'static str,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        let response = self.execute(method, &url, || {
            self.request(method, &url).send_json(body)
        })?;
        Self::decode(&url, response)
    }

    fn repo_path(repo: &RepoKey) -> String {
        format!("repos/{}/{}", repo.owner, repo.repo)
    }
}

#[derive(Serialize)]
struct CreateOrganization<'a> {
    login: &'a str,
    profile_name: &'a str,
    admin: &'a str,
}

#[derive(Serialize)]
struct CreateAuthorization<'a> {
    scopes: &'a [&'a str],
}

#[derive(Deserialize)]
struct Authorization {
    token: String,
}

impl Hosting for GitHubClient {
    fn probe(&self) -> Result<ResponseMeta, ApiError> {
        let url = self.url("");
        let response = self.execute("GET", &url, || self.request("GET", &url).call())?;
        Ok(meta_of(&response))
    }

    fn current_user(&self) -> Result<User, ApiError> {
        self.get_json("user")
    }

    fn get_organization(&self, login: &str) -> Result<Option<Organization>, ApiError> {
        self.get_optional(&format!("orgs/{}", login))
    }

    fn create_organization(&self, login: &str, admin: &str) -> Result<Organization, ApiError> {
        self.send_json(
            "POST",
            "admin/organizations",
            &CreateOrganization {
                login,
                profile_name: login,
                admin,
            },
        )
    }

    fn membership_status(&self, org: &str, user: &str) -> Result<ResponseMeta, ApiError> {
        let url = self.url(&format!("orgs/{}/members/{}", org, user));
        match self.execute("GET", &url, || self.request("GET", &url).call()) {
            Ok(response) => Ok(meta_of(&response)),
            Err(ApiError::Status { status: 404, meta, .. }) => Ok(meta),
            Err(e) => Err(e),
        }
    }

    fn create_impersonation_token(&self, user: &str, scopes: &[&str]) -> Result<String, ApiError> {
        let authorization: Authorization = self.send_json(
            "POST",
            &format!("admin/users/{}/authorizations", user),
            &CreateAuthorization { scopes },
        )?;
        Ok(authorization.token)
    }

    fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    fn get_repository(&self, repo: &RepoKey) -> Result<Option<Repository>, ApiError> {
        self.get_optional(&Self::repo_path(repo))
    }

    fn create_repository(
        &self,
        org: Option<&str>,
        settings: &RepositorySettings,
    ) -> Result<Repository, ApiError> {
        let path = match org {
            Some(org) => format!("orgs/{}/repos", org),
            None => "user/repos".to_string(),
        };
        self.send_json("POST", &path, settings)
    }

    fn edit_repository(
        &self,
        repo: &RepoKey,
        settings: &RepositorySettings,
    ) -> Result<Repository, ApiError> {
        self.send_json("PATCH", &Self::repo_path(repo), settings)
    }

    fn get_release_by_tag(&self, repo: &RepoKey, tag: &str) -> Result<Option<Release>, ApiError> {
        self.get_optional(&format!("{}/releases/tags/{}", Self::repo_path(repo), tag))
    }

    fn create_release(&self, repo: &RepoKey, release: &ReleaseRequest) -> Result<Release, ApiError> {
        self.send_json("POST", &format!("{}/releases", Self::repo_path(repo)), release)
    }

    fn edit_release(
        &self,
        repo: &RepoKey,
        release_id: u64,
        release: &ReleaseRequest,
    ) -> Result<Release, ApiError> {
        self.send_json(
            "PATCH",
            &format!("{}/releases/{}", Self::repo_path(repo), release_id),
            release,
        )
    }

    fn list_release_assets(&self, repo: &RepoKey, release_id: u64) -> Result<Vec<Asset>, ApiError> {
        let mut assets = Vec::new();
        for page in 1.. {
            let batch: Vec<Asset> = self.get_json(&format!(
                "{}/releases/{}/assets?per_page={}&page={}",
                Self::repo_path(repo),
                release_id,
                PER_PAGE,
                page
            ))?;
            let done = batch.len() < PER_PAGE;
            assets.extend(batch);
            if done {
                break;
            }
        }
        Ok(assets)
    }

    fn upload_release_asset(
        &self,
        repo: &RepoKey,
        release_id: u64,
        name: &str,
        size: u64,
        body: &mut dyn Read,
    ) -> Result<Asset, ApiError> {
        let url = format!(
            "{}/{}/releases/{}/assets",
            self.uploads_url,
            Self::repo_path(repo),
            release_id
        );
        let response = self.execute("POST", &url, || {
            self.request("POST", &url)
                .query("name", name)
                .set("Content-Type", content_type_for(name))
                .set("Content-Length", &size.to_string())
                .send(body)
        });
        let response = match response {
            Err(ApiError::Transport { .. }) if self.cancel.is_cancelled() => {
                return Err(ApiError::Cancelled);
            }
            other => other?,
        };
        Self::decode(&url, response)
    }

    fn delete_release_asset(&self, repo: &RepoKey, asset_id: u64) -> Result<(), ApiError> {
        let url = self.url(&format!(
            "{}/releases/assets/{}",
            Self::repo_path(repo),
            asset_id
        ));
        self.execute("DELETE", &url, || self.request("DELETE", &url).call())?;
        Ok(())
    }

    fn download_release_asset(
        &self,
        repo: &RepoKey,
        asset_id: u64,
    ) -> Result<AssetDownload, ApiError> {
        let url = self.url(&format!(
            "{}/releases/assets/{}",
            Self::repo_path(repo),
            asset_id
        ));
        let response = self.execute("GET", &url, || {
            self.request("GET", &url).set("Accept", ACCEPT_BINARY).call()
        })?;
        let meta = meta_of(&response);
        if meta.is_redirect() {
            return match meta.location.clone() {
                Some(location) => Ok(AssetDownload::Redirect(location)),
                None => Err(ApiError::Status {
                    method: "GET",
                    url,
                    status: meta.status,
                    message: "redirect without a Location header".to_string(),
                    meta,
                    codes: Vec::new(),
                }),
            };
        }
        Ok(AssetDownload::Content(response.into_reader()))
    }

    fn fetch_url(&self, url: &str) -> Result<Box<dyn Read + Send>, ApiError> {
        let response = self.execute("GET", url, || self.agent.get(url).call())?;
        if response.status() >= 300 {
            return Err(status_error("GET", url, response));
        }
        Ok(response.into_reader())
    }
}
