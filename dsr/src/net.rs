//! The GitHub REST client
//!
//! Everything dsr says to GitHub goes through here: release lookup and
//! creation, asset upload and listing, asset download for checksum
//! verification, and the workflow-run query the watch command polls.
//!
//! The API base is overridable (`DSR_GITHUB_API_BASE`) for GitHub
//! Enterprise and for tests; asset uploads follow the `upload_url` the API
//! hands back rather than assuming a host.

use std::time::Duration;

use camino::Utf8Path;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{DsrError, DsrResult};

/// Upper bound on any single API request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// A GitHub release, as much of it as we consume
#[derive(Debug, Clone, Deserialize)]
pub struct GithubRelease {
    /// The numeric release id
    pub id: u64,
    /// The tag the release is anchored to
    pub tag_name: String,
    /// The templated upload endpoint for this release's assets
    pub upload_url: String,
    /// Where humans view the release
    #[serde(default)]
    pub html_url: String,
    /// Whether it's still a draft
    #[serde(default)]
    pub draft: bool,
    /// The assets currently attached
    #[serde(default)]
    pub assets: Vec<GithubAsset>,
}

/// One asset inside a release
#[derive(Debug, Clone, Deserialize)]
pub struct GithubAsset {
    /// The asset's API url (used for download with the octet-stream accept)
    pub url: String,
    /// The asset's public download url
    #[serde(default)]
    pub browser_download_url: String,
    /// The asset's name
    pub name: String,
    /// The asset's size in bytes
    pub size: u64,
}

/// One workflow run, as much of it as the watcher consumes
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    /// The run id
    pub id: u64,
    /// The commit the run built
    pub head_sha: String,
    /// `queued`, `in_progress`, or `completed`
    pub status: String,
    /// `success`, `failure`, ... once completed
    #[serde(default)]
    pub conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunsPage {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Serialize)]
struct CreateReleaseRequest<'a> {
    tag_name: &'a str,
    name: &'a str,
    draft: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a str>,
}

/// What became of one asset upload
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The asset was uploaded by us just now
    Uploaded,
    /// An identical asset was already there; treated as success
    AlreadyPresent,
}

/// The authenticated client
///
/// Clone is cheap (reqwest clients share their pool). No Debug impl: it
/// would be too easy to log the token.
#[derive(Clone)]
pub struct GithubClient {
    client: reqwest::Client,
    token: String,
    api_base: String,
}

impl GithubClient {
    /// A client using the token from `GITHUB_TOKEN` or `GH_TOKEN`
    pub fn from_env() -> DsrResult<Self> {
        let token = std::env::var("GITHUB_TOKEN")
            .or_else(|_| std::env::var("GH_TOKEN"))
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DsrError::AuthFailure {
                reason: "neither GITHUB_TOKEN nor GH_TOKEN is set".to_owned(),
            })?;
        let api_base = std::env::var("DSR_GITHUB_API_BASE")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "https://api.github.com".to_owned());
        Self::new(token, api_base)
    }

    /// A client with an explicit token and API base
    pub fn new(token: String, api_base: String) -> DsrResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            token,
            api_base: api_base.trim_end_matches('/').to_owned(),
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, format!("dsr/{}", env!("CARGO_PKG_VERSION")))
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// Fetch a release by tag; `None` when neither repo nor release exists
    pub async fn get_release_by_tag(
        &self,
        repo: &str,
        tag: &str,
    ) -> DsrResult<Option<GithubRelease>> {
        let url = format!("{}/repos/{repo}/releases/tags/{tag}", self.api_base);
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if response.status() == StatusCode::UNAUTHORIZED || response.status() == StatusCode::FORBIDDEN
        {
            return Err(DsrError::AuthFailure {
                reason: format!("GitHub rejected the token ({})", response.status()),
            });
        }
        let release = response.error_for_status()?.json().await?;
        Ok(Some(release))
    }

    /// Create a release on a tag
    pub async fn create_release(
        &self,
        repo: &str,
        tag: &str,
        draft: bool,
        notes: Option<&str>,
    ) -> DsrResult<GithubRelease> {
        info!("creating release {tag} in {repo}");
        let url = format!("{}/repos/{repo}/releases", self.api_base);
        let request = CreateReleaseRequest {
            tag_name: tag,
            name: tag,
            draft,
            body: notes,
        };
        let response = self
            .request(reqwest::Method::POST, &url)
            .json(&request)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(DsrError::UpstreamMissing {
                what: format!("repo {repo}"),
            });
        }
        Ok(response.error_for_status()?.json().await?)
    }

    /// Fetch a release by tag, creating it if it doesn't exist
    pub async fn ensure_release(
        &self,
        repo: &str,
        tag: &str,
        draft: bool,
        notes: Option<&str>,
    ) -> DsrResult<GithubRelease> {
        if let Some(release) = self.get_release_by_tag(repo, tag).await? {
            return Ok(release);
        }
        self.create_release(repo, tag, draft, notes).await
    }

    /// Every asset on a release, following pagination
    pub async fn list_assets(&self, repo: &str, release_id: u64) -> DsrResult<Vec<GithubAsset>> {
        let mut assets = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{}/repos/{repo}/releases/{release_id}/assets?per_page=100&page={page}",
                self.api_base
            );
            let batch: Vec<GithubAsset> = self
                .request(reqwest::Method::GET, &url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            let done = batch.len() < 100;
            assets.extend(batch);
            if done {
                break;
            }
            page += 1;
        }
        Ok(assets)
    }

    /// Upload one asset, treating an identical pre-existing asset as success
    pub async fn upload_asset(
        &self,
        repo: &str,
        release: &GithubRelease,
        name: &str,
        path: &Utf8Path,
    ) -> DsrResult<UploadOutcome> {
        let data = tokio::fs::read(path.as_std_path()).await?;
        let size = data.len() as u64;
        let upload_url = strip_url_template(&release.upload_url);
        let url = format!("{upload_url}?name={}", urlencode(name));
        debug!("uploading {name} ({size} bytes)");
        let response = self
            .request(reqwest::Method::POST, &url)
            .header(reqwest::header::CONTENT_TYPE, mime_for(name))
            .body(data)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(UploadOutcome::Uploaded);
        }
        // GitHub answers 422 (sometimes 409) when the name is taken
        if status == StatusCode::UNPROCESSABLE_ENTITY || status == StatusCode::CONFLICT {
            let existing = self.list_assets(repo, release.id).await?;
            if let Some(asset) = existing.iter().find(|a| a.name == name) {
                if asset.size == size {
                    info!("{name} already uploaded with matching size; treating as success");
                    return Ok(UploadOutcome::AlreadyPresent);
                }
                return Err(DsrError::ReleaseConflict {
                    asset: name.to_owned(),
                });
            }
        }
        Err(DsrError::Github {
            status: status.as_u16(),
            context: format!("uploading {name}"),
        })
    }

    /// Download an asset and return its SHA-256 and size
    pub async fn download_asset_sha256(&self, asset: &GithubAsset) -> DsrResult<(String, u64)> {
        use sha2::Digest;
        let response = self
            .request(reqwest::Method::GET, &asset.url)
            .header(ACCEPT, "application/octet-stream")
            .send()
            .await?
            .error_for_status()?;
        let mut hasher = sha2::Sha256::new();
        let mut size = 0u64;
        let mut response = response;
        while let Some(chunk) = response.chunk().await? {
            size += chunk.len() as u64;
            hasher.update(&chunk);
        }
        let mut hex = String::with_capacity(64);
        use std::fmt::Write;
        for byte in hasher.finalize() {
            write!(&mut hex, "{byte:02x}").expect("writing to a String can't fail");
        }
        Ok((hex, size))
    }

    /// The most recent run of a workflow file, if the repo has one
    pub async fn latest_workflow_run(
        &self,
        repo: &str,
        workflow_file: &str,
    ) -> DsrResult<Option<WorkflowRun>> {
        let url = format!(
            "{}/repos/{repo}/actions/workflows/{workflow_file}/runs?per_page=1",
            self.api_base
        );
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let page: WorkflowRunsPage = response.error_for_status()?.json().await?;
        Ok(page.workflow_runs.into_iter().next())
    }
}

/// Strip the `{?name,label}` hypermedia template off an upload url
fn strip_url_template(url: &str) -> &str {
    match url.find('{') {
        Some(idx) => &url[..idx],
        None => url,
    }
}

/// Minimal percent-encoding for asset names in a query string
fn urlencode(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// The MIME type an asset is uploaded with, from its extension
pub fn mime_for(name: &str) -> &'static str {
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        "application/gzip"
    } else if name.ends_with(".tar.xz") {
        "application/x-xz"
    } else if name.ends_with(".zip") {
        "application/zip"
    } else if name.ends_with(".json") {
        "application/json"
    } else if name == "SHA256SUMS" || name.ends_with(".txt") || name.ends_with(".sha256") {
        "text/plain"
    } else if name.ends_with(".exe") {
        "application/vnd.microsoft.portable-executable"
    } else {
        "application/octet-stream"
    }
}
