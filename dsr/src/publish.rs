//! The release publisher
//!
//! Takes a finalised manifest and makes the GitHub release match it:
//! resolve (or create) the release on the tag, then upload every asset in
//! manifest order under a small fixed concurrency. Each upload runs inside
//! the retry wrapper; 5xx and timeouts get more attempts, 4xx fails the
//! asset, and a pre-existing identical asset counts as success so the whole
//! operation is idempotent.

use std::sync::Arc;

use camino::Utf8PathBuf;
use dsr_schema::Manifest;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::errors::{DsrError, DsrResult};
use crate::net::{GithubClient, GithubRelease, UploadOutcome};
use crate::retry::{self, RetryPolicy};

/// Knobs for one publish run
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Create the release as a draft
    pub draft: bool,
    /// Release notes body, when creating
    pub notes: Option<String>,
    /// Upload only these filenames (the verifier's `--fix` path)
    pub only: Option<Vec<String>>,
    /// Concurrent uploads (the GitHub API gets a small fixed budget)
    pub concurrency: usize,
    /// Attempt cap per upload
    pub retry_attempts: u32,
}

/// What one publish run accomplished
#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishOutcome {
    /// Where the release lives
    pub release_url: String,
    /// Assets we uploaded this run
    pub uploaded: Vec<String>,
    /// Assets that were already there with matching content
    pub already_present: Vec<String>,
    /// Assets that failed, with the last error text
    pub failed: Vec<FailedUpload>,
}

/// One asset that could not be uploaded
#[derive(Debug, Clone, Serialize)]
pub struct FailedUpload {
    /// The asset name
    pub filename: String,
    /// The last error
    pub error: String,
}

impl PublishOutcome {
    /// Whether every attempted asset made it up
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Whether anything at all made it up
    pub fn any_succeeded(&self) -> bool {
        !self.uploaded.is_empty() || !self.already_present.is_empty()
    }
}

/// Publish a manifest's assets to the release for `tag`
///
/// Upload order equals manifest order: tasks are spawned in order and the
/// semaphore hands out permits first-come-first-served.
pub async fn publish_manifest(
    client: &GithubClient,
    repo: &str,
    tag: &str,
    manifest: &Manifest,
    opts: &PublishOptions,
) -> DsrResult<PublishOutcome> {
    let release = client
        .ensure_release(repo, tag, opts.draft, opts.notes.as_deref())
        .await?;
    let outcome = upload_assets(client, repo, &release, manifest, opts).await?;
    Ok(outcome)
}

/// Upload the manifest's assets onto an already-resolved release
pub async fn upload_assets(
    client: &GithubClient,
    repo: &str,
    release: &GithubRelease,
    manifest: &Manifest,
    opts: &PublishOptions,
) -> DsrResult<PublishOutcome> {
    let mut outcome = PublishOutcome {
        release_url: release.html_url.clone(),
        ..Default::default()
    };

    let wanted: Vec<(String, Utf8PathBuf)> = manifest
        .artifacts
        .iter()
        .filter(|entry| match &opts.only {
            Some(only) => only.contains(&entry.filename),
            None => true,
        })
        .filter_map(|entry| {
            let Some(path) = &entry.path else {
                warn!("{} has no local path; skipping upload", entry.filename);
                return None;
            };
            Some((entry.filename.clone(), Utf8PathBuf::from(path)))
        })
        .collect();

    let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let policy = RetryPolicy::with_attempts(opts.retry_attempts.max(1));
    let mut join = tokio::task::JoinSet::new();

    for (index, (name, path)) in wanted.into_iter().enumerate() {
        let client = client.clone();
        let release = release.clone();
        let repo = repo.to_owned();
        let semaphore = Arc::clone(&semaphore);
        join.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("upload semaphore is never closed");
            let result = retry::run_async(
                &policy,
                |_| {
                    let client = client.clone();
                    let release = release.clone();
                    let repo = repo.clone();
                    let name = name.clone();
                    let path = path.clone();
                    async move { client.upload_asset(&repo, &release, &name, &path).await }
                },
                |attempt, error: &DsrError| {
                    warn!("upload of {name} failed (attempt {attempt}): {error}");
                },
                |error| error.is_retryable(),
            )
            .await;
            (index, name, result)
        });
    }

    let mut results: Vec<(usize, String, DsrResult<UploadOutcome>)> = Vec::new();
    while let Some(joined) = join.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => {
                return Err(DsrError::BuildFailure {
                    tool: manifest.tool.clone(),
                    target: "upload".to_owned(),
                    phase: "publish".to_owned(),
                    details: format!("upload task panicked: {e}"),
                })
            }
        }
    }
    // manifest order, not completion order
    results.sort_by_key(|(index, _, _)| *index);

    for (_, name, result) in results {
        match result {
            Ok(UploadOutcome::Uploaded) => {
                info!("uploaded {name}");
                outcome.uploaded.push(name);
            }
            Ok(UploadOutcome::AlreadyPresent) => outcome.already_present.push(name),
            Err(error) => outcome.failed.push(FailedUpload {
                filename: name,
                error: error.to_string(),
            }),
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsr_schema::{ArtifactEntry, MANIFEST_SCHEMA_VERSION};
    use temp_dir::TempDir;

    fn manifest_with(files: &[(&str, &Utf8PathBuf)]) -> Manifest {
        Manifest {
            schema_version: MANIFEST_SCHEMA_VERSION.to_owned(),
            tool: "mytool".to_owned(),
            version: "v1.0.0".to_owned(),
            run_id: "8b51ac0e-93d9-4a0e-9f0a-2f9c4a2b7d11".to_owned(),
            git_sha: None,
            built_at: "2024-06-01T00:00:00Z".to_owned(),
            artifacts: files
                .iter()
                .map(|(name, path)| ArtifactEntry {
                    filename: (*name).to_owned(),
                    target: "linux/amd64".to_owned(),
                    path: Some(path.to_string()),
                    sha256: crate::checksum::sha256_bytes(b"payload"),
                    size_bytes: 7,
                })
                .collect(),
        }
    }

    fn release_json(server: &httpmock::MockServer) -> serde_json::Value {
        serde_json::json!({
            "id": 1,
            "tag_name": "v1.0.0",
            "upload_url": format!("{}/upload/1/assets{{?name,label}}", server.base_url()),
            "html_url": "https://github.com/me/mytool/releases/v1.0.0",
            "draft": false,
            "assets": []
        })
    }

    #[tokio::test]
    async fn publishes_all_assets() {
        let server = httpmock::MockServer::start_async().await;
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("a.tar.gz")).unwrap();
        std::fs::write(&path, b"payload").unwrap();

        server
            .mock_async(|when, then| {
                when.method("GET").path("/repos/me/mytool/releases/tags/v1.0.0");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method("POST").path("/repos/me/mytool/releases");
                then.status(201)
                    .header("content-type", "application/json")
                    .json_body(release_json(&server));
            })
            .await;
        let upload = server
            .mock_async(|when, then| {
                when.method("POST").path("/upload/1/assets");
                then.status(201)
                    .header("content-type", "application/json")
                    .json_body(serde_json::json!({"id": 10}));
            })
            .await;

        let client = GithubClient::new("token".to_owned(), server.base_url()).unwrap();
        let manifest = manifest_with(&[("a.tar.gz", &path)]);
        let opts = PublishOptions {
            concurrency: 4,
            retry_attempts: 1,
            ..Default::default()
        };
        let outcome = publish_manifest(&client, "me/mytool", "v1.0.0", &manifest, &opts)
            .await
            .unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.uploaded, ["a.tar.gz"]);
        upload.assert_async().await;
    }

    #[tokio::test]
    async fn identical_preexisting_asset_is_success() {
        let server = httpmock::MockServer::start_async().await;
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("a.tar.gz")).unwrap();
        std::fs::write(&path, b"payload").unwrap();

        server
            .mock_async(|when, then| {
                when.method("GET").path("/repos/me/mytool/releases/tags/v1.0.0");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(release_json(&server));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method("POST").path("/upload/1/assets");
                then.status(422);
            })
            .await;
        // the conflict check re-lists assets and finds a size match
        server
            .mock_async(|when, then| {
                when.method("GET").path("/repos/me/mytool/releases/1/assets");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(serde_json::json!([
                        {"url": "u", "browser_download_url": "b", "name": "a.tar.gz", "size": 7}
                    ]));
            })
            .await;

        let client = GithubClient::new("token".to_owned(), server.base_url()).unwrap();
        let manifest = manifest_with(&[("a.tar.gz", &path)]);
        let opts = PublishOptions {
            concurrency: 1,
            retry_attempts: 1,
            ..Default::default()
        };
        let outcome = publish_manifest(&client, "me/mytool", "v1.0.0", &manifest, &opts)
            .await
            .unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.already_present, ["a.tar.gz"]);
        assert!(outcome.uploaded.is_empty());
    }

    #[tokio::test]
    async fn differing_preexisting_asset_fails_that_asset() {
        let server = httpmock::MockServer::start_async().await;
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("a.tar.gz")).unwrap();
        std::fs::write(&path, b"payload").unwrap();

        server
            .mock_async(|when, then| {
                when.method("GET").path("/repos/me/mytool/releases/tags/v1.0.0");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(release_json(&server));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method("POST").path("/upload/1/assets");
                then.status(422);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method("GET").path("/repos/me/mytool/releases/1/assets");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(serde_json::json!([
                        {"url": "u", "browser_download_url": "b", "name": "a.tar.gz", "size": 999}
                    ]));
            })
            .await;

        let client = GithubClient::new("token".to_owned(), server.base_url()).unwrap();
        let manifest = manifest_with(&[("a.tar.gz", &path)]);
        let opts = PublishOptions {
            concurrency: 1,
            retry_attempts: 1,
            ..Default::default()
        };
        let outcome = publish_manifest(&client, "me/mytool", "v1.0.0", &manifest, &opts)
            .await
            .unwrap();
        assert!(!outcome.is_complete());
        assert!(!outcome.any_succeeded());
        assert_eq!(outcome.failed.len(), 1);
        assert!(outcome.failed[0].error.contains("different"));
    }

    #[tokio::test]
    async fn only_filter_restricts_uploads() {
        let server = httpmock::MockServer::start_async().await;
        let dir = TempDir::new().unwrap();
        let a = Utf8PathBuf::try_from(dir.path().join("a.tar.gz")).unwrap();
        let b = Utf8PathBuf::try_from(dir.path().join("b.tar.gz")).unwrap();
        std::fs::write(&a, b"payload").unwrap();
        std::fs::write(&b, b"payload").unwrap();

        server
            .mock_async(|when, then| {
                when.method("GET").path("/repos/me/mytool/releases/tags/v1.0.0");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(release_json(&server));
            })
            .await;
        let upload = server
            .mock_async(|when, then| {
                when.method("POST")
                    .path("/upload/1/assets")
                    .query_param("name", "b.tar.gz");
                then.status(201)
                    .header("content-type", "application/json")
                    .json_body(serde_json::json!({"id": 11}));
            })
            .await;

        let client = GithubClient::new("token".to_owned(), server.base_url()).unwrap();
        let manifest = manifest_with(&[("a.tar.gz", &a), ("b.tar.gz", &b)]);
        let opts = PublishOptions {
            only: Some(vec!["b.tar.gz".to_owned()]),
            concurrency: 1,
            retry_attempts: 1,
            ..Default::default()
        };
        let outcome = publish_manifest(&client, "me/mytool", "v1.0.0", &manifest, &opts)
            .await
            .unwrap();
        assert_eq!(outcome.uploaded, ["b.tar.gz"]);
        upload.assert_hits_async(1).await;
    }
}
