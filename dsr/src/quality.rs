//! Quality gates
//!
//! A tool's `checks` are an ordered list of shell commands (lint, test,
//! audit, whatever the tool's authors trust). They run in the working tree,
//! in order, and the first failure fails the gate. `--skip-checks` records
//! the skip without running anything.

use std::time::Instant;

use axoprocess::Cmd;
use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::info;

use crate::config::ToolSpec;
use crate::errors::{DsrError, DsrResult};

/// The outcome of one configured check
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// The command that ran
    pub command: String,
    /// Whether it exited zero
    pub passed: bool,
    /// How long it took
    pub duration_ms: u64,
}

/// The outcome of a whole quality run
#[derive(Debug, Clone, Default, Serialize)]
pub struct QualityOutcome {
    /// Per-check results, in configured order
    pub results: Vec<CheckResult>,
    /// Whether the run was skipped outright
    pub skipped: bool,
    /// Whether every executed check passed
    pub passed: bool,
}

/// Run a tool's quality gates
///
/// `dry_run` lists the checks without executing; `skip` marks the run
/// skipped and exits clean regardless of what the checks would have said.
pub fn run_checks(spec: &ToolSpec, dry_run: bool, skip: bool) -> DsrResult<QualityOutcome> {
    if skip {
        info!("skipping {} quality check(s) for {}", spec.checks.len(), spec.name);
        return Ok(QualityOutcome {
            results: vec![],
            skipped: true,
            passed: true,
        });
    }
    let tree = spec
        .local_path
        .clone()
        .ok_or_else(|| DsrError::ConfigInvalid {
            path: Utf8PathBuf::from("repos.d"),
            reason: format!("tool '{}' has no local_path to run checks in", spec.name),
        })?;

    let mut outcome = QualityOutcome {
        passed: true,
        ..Default::default()
    };
    for check in &spec.checks {
        if dry_run {
            info!("would run: {check}");
            outcome.results.push(CheckResult {
                command: check.clone(),
                passed: true,
                duration_ms: 0,
            });
            continue;
        }
        info!("running check: {check}");
        let start = Instant::now();
        let status = Cmd::new("sh", format!("quality check for {}", spec.name))
            .arg("-c")
            .arg(check)
            .current_dir(&tree)
            .stdout_to_stderr()
            .check(false)
            .status()?;
        let passed = status.success();
        outcome.results.push(CheckResult {
            command: check.clone(),
            passed,
            duration_ms: start.elapsed().as_millis() as u64,
        });
        if !passed {
            outcome.passed = false;
            break;
        }
    }
    Ok(outcome)
}
