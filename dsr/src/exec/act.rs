//! The act driver
//!
//! Builds linux targets inside containers by replaying the tool's own
//! upstream CI workflow through `act`, pointed at a per-run artifact server
//! directory. What the workflow uploads is what we collect: the finished
//! asset when the workflow packs one, or the raw binary when it doesn't.

use axoprocess::Cmd;
use camino::Utf8PathBuf;
use tracing::{info, warn};

use crate::errors::{DsrError, DsrResult};
use crate::exec::{find_file_named, staged_binary_name, Collected, CollectedKind, ExecContext, Executor};
use crate::plan::Target;

/// Builds targets through the act container runner
#[derive(Debug, Clone, Default)]
pub struct ActDriver;

impl ActDriver {
    /// A fresh driver; act needs no per-host state
    pub fn new() -> Self {
        Self
    }
}

impl Executor for ActDriver {
    fn run(&self, target: &Target, ctx: &ExecContext) -> DsrResult<Vec<Collected>> {
        let spec = &ctx.spec;
        let tree = spec.local_path.as_ref().ok_or_else(|| DsrError::ConfigInvalid {
            path: Utf8PathBuf::from("repos.d"),
            reason: format!("tool '{}' has no local_path for act to run in", spec.name),
        })?;
        let workflow = spec.workflow_path().ok_or_else(|| DsrError::ConfigInvalid {
            path: Utf8PathBuf::from("repos.d"),
            reason: format!("tool '{}' has no workflow for act to run", spec.name),
        })?;
        let pair = target.pair().to_string();
        let job = spec
            .act_job_map
            .get(&pair)
            .ok_or_else(|| DsrError::ConfigInvalid {
                path: Utf8PathBuf::from("repos.d"),
                reason: format!("tool '{}' has no act job for {pair}", spec.name),
            })?;

        let artifact_dir = ctx.target_dir(target).join("act-artifacts");
        std::fs::create_dir_all(&artifact_dir)?;

        info!("running act job {job} for {}", target.label());
        let mut cmd = Cmd::new("act", format!("run act job {job} for {}", target.label()));
        cmd.arg("--workflows")
            .arg(&workflow)
            .arg("--job")
            .arg(job)
            .arg("--artifact-server-path")
            .arg(&artifact_dir)
            .current_dir(tree)
            .stdout_to_stderr();
        if let Some(token) = &ctx.github_token {
            cmd.arg("-s").arg(format!("GITHUB_TOKEN={token}"));
        }
        cmd.run().map_err(|e| DsrError::BuildFailure {
            tool: spec.name.clone(),
            target: target.label(),
            phase: "act".to_owned(),
            details: e.to_string(),
        })?;

        // prefer the finished asset; fall back to the raw binary
        if let Some(asset) = find_file_named(&artifact_dir, &target.expected.versioned) {
            report_extras(&artifact_dir, &target.expected.versioned);
            return Ok(vec![Collected {
                path: asset,
                kind: CollectedKind::Asset,
            }]);
        }
        let staged = staged_binary_name(spec, target);
        if let Some(binary) = find_file_named(&artifact_dir, &staged) {
            report_extras(&artifact_dir, &staged);
            return Ok(vec![Collected {
                path: binary,
                kind: CollectedKind::Binary,
            }]);
        }
        Err(DsrError::MissingArtifact {
            target: target.label(),
            filename: target.expected.versioned.clone(),
        })
    }
}

/// Log files the workflow produced beyond the one we wanted; extras are
/// informational, never fatal
fn report_extras(artifact_dir: &camino::Utf8Path, wanted: &str) {
    let walker = walkdir::WalkDir::new(artifact_dir).sort_by_file_name();
    for entry in walker.into_iter().flatten() {
        if entry.file_type().is_file() {
            if let Some(name) = entry.file_name().to_str() {
                if name != wanted {
                    warn!("act produced an extra artifact: {name}");
                }
            }
        }
    }
}
