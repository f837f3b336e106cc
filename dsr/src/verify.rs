//! The release verifier
//!
//! Replays the local manifest against the remote release: every manifest
//! asset must exist remotely (and optionally hash-match), and anything
//! remote that the manifest doesn't know about is flagged as extra. `--fix`
//! re-uploads missing assets that still exist locally; it never deletes
//! remote extras.

use dsr_schema::Manifest;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::{DsrError, DsrResult};
use crate::net::GithubClient;
use crate::publish::{self, PublishOptions};

/// What the verifier found
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyOutcome {
    /// Manifest assets absent from the release
    pub missing: Vec<String>,
    /// Release assets the manifest doesn't list
    pub extra: Vec<String>,
    /// Assets whose remote content doesn't hash-match the manifest
    pub checksum_mismatches: Vec<String>,
    /// Manifest assets present remotely
    pub present: usize,
    /// Whether remote checksums were verified by streaming the downloads
    pub checksums_verified: bool,
}

impl VerifyOutcome {
    /// Whether the release fully matches the manifest
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.checksum_mismatches.is_empty()
    }
}

/// Compare the remote asset set against the manifest
pub async fn verify_release(
    client: &GithubClient,
    repo: &str,
    tag: &str,
    manifest: &Manifest,
    check_checksums: bool,
) -> DsrResult<VerifyOutcome> {
    let release = client
        .get_release_by_tag(repo, tag)
        .await?
        .ok_or_else(|| DsrError::UpstreamMissing {
            what: format!("release {tag} in {repo}"),
        })?;
    let remote = client.list_assets(repo, release.id).await?;

    let mut outcome = VerifyOutcome {
        checksums_verified: check_checksums,
        ..Default::default()
    };

    for entry in &manifest.artifacts {
        match remote.iter().find(|asset| asset.name == entry.filename) {
            None => outcome.missing.push(entry.filename.clone()),
            Some(asset) => {
                outcome.present += 1;
                if asset.size != entry.size_bytes {
                    warn!(
                        "{} is {} bytes remotely but {} locally",
                        entry.filename, asset.size, entry.size_bytes
                    );
                    outcome.checksum_mismatches.push(entry.filename.clone());
                } else if check_checksums {
                    let (sha, _) = client.download_asset_sha256(asset).await?;
                    if sha != entry.sha256 {
                        outcome.checksum_mismatches.push(entry.filename.clone());
                    }
                }
            }
        }
    }

    // the manifest asset can't list itself, so it is never "extra"
    let manifest_asset = crate::checksum::manifest_filename(&manifest.tool, &manifest.version);
    for asset in &remote {
        if asset.name == manifest_asset {
            continue;
        }
        if !manifest
            .artifacts
            .iter()
            .any(|entry| entry.filename == asset.name)
        {
            outcome.extra.push(asset.name.clone());
        }
    }

    info!(
        "verified {tag}: {} present, {} missing, {} extra",
        outcome.present,
        outcome.missing.len(),
        outcome.extra.len()
    );
    Ok(outcome)
}

/// Verify, then re-upload whatever is missing and still exists locally
pub async fn verify_and_fix(
    client: &GithubClient,
    repo: &str,
    tag: &str,
    manifest: &Manifest,
    check_checksums: bool,
    upload_opts: &PublishOptions,
) -> DsrResult<VerifyOutcome> {
    let outcome = verify_release(client, repo, tag, manifest, check_checksums).await?;
    if outcome.missing.is_empty() {
        return Ok(outcome);
    }
    let fixable: Vec<String> = outcome
        .missing
        .iter()
        .filter(|name| {
            manifest
                .artifacts
                .iter()
                .find(|e| &&e.filename == name)
                .and_then(|e| e.path.as_deref())
                .is_some_and(|p| camino::Utf8Path::new(p).exists())
        })
        .cloned()
        .collect();
    if fixable.is_empty() {
        warn!("none of the missing assets exist locally; nothing to fix");
        return Ok(outcome);
    }
    info!("re-uploading {} missing asset(s)", fixable.len());
    let opts = PublishOptions {
        only: Some(fixable),
        ..upload_opts.clone()
    };
    publish::publish_manifest(client, repo, tag, manifest, &opts).await?;
    // re-verify so the reported state is the post-fix one
    verify_release(client, repo, tag, manifest, check_checksums).await
}
