#![deny(missing_docs)]

//! # dsr
//!
//! Multi-host build and release automation for developer tools: expand a
//! target matrix, fan the builds out to act containers and native ssh
//! hosts, pack deterministic archives, checksum everything, push the set to
//! a GitHub release, and verify that what's up there matches what was built.

#![allow(clippy::too_many_arguments)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use dsr_schema::{ArtifactEntry, BuildRecord, BuildStatus, HostStatus, Manifest};
use serde_json::json;
use tracing::{error, info, warn};

pub mod archive;
pub mod checksum;
pub mod config;
pub mod dirs;
pub mod envelope;
pub mod errors;
pub mod exec;
pub mod health;
pub mod naming;
pub mod net;
pub mod plan;
pub mod platform;
pub mod publish;
pub mod quality;
pub mod retry;
pub mod state;
pub mod verify;
pub mod version;
pub mod watch;

use config::Snapshot;
use dirs::{ensure_dir, AppDirs};
use errors::{DsrError, DsrResult, EXIT_BUILD, EXIT_PARTIAL, EXIT_SUCCESS};
use exec::{act::ActDriver, ssh::NativeDriver, CollectedKind, ExecContext, Executor};
use plan::{BuildPlan, PlanFilters, Target, TargetClass};
use publish::{PublishOptions, PublishOutcome};
use retry::RetryPolicy;
use state::{BuildLock, StateStore};
use verify::VerifyOutcome;

/// What a command resolved to: the exit code plus the envelope payload
#[derive(Debug)]
pub struct CommandOutcome {
    /// The process exit code
    pub exit_code: u8,
    /// The command-specific `details` object
    pub details: serde_json::Value,
}

impl CommandOutcome {
    /// A clean success with a payload
    pub fn success(details: serde_json::Value) -> Self {
        Self {
            exit_code: EXIT_SUCCESS,
            details,
        }
    }
}

/// Everything a command needs to run
pub struct Session {
    /// Resolved directory roots
    pub dirs: AppDirs,
    /// The immutable config snapshot
    pub snapshot: Snapshot,
    /// The state store rooted at the state dir
    pub store: StateStore,
}

impl Session {
    /// Load config and set up the stores
    pub fn load() -> DsrResult<Self> {
        let dirs = AppDirs::from_env()?;
        let snapshot = Snapshot::load(&dirs)?;
        let store = StateStore::new(&dirs);
        Ok(Self {
            dirs,
            snapshot,
            store,
        })
    }
}

/// Options for the build pipeline
#[derive(Debug, Default, Clone)]
pub struct BuildOptions {
    /// The tool to build
    pub tool: String,
    /// The version to build; detected from the working tree when absent
    pub version: Option<String>,
    /// Matrix filters
    pub filters: PlanFilters,
    /// Plan only; no locks, builds, or uploads
    pub dry_run: bool,
    /// Create the release as a draft (overrides config)
    pub draft: Option<bool>,
    /// Cap on simultaneously-building targets
    pub parallel: Option<usize>,
    /// Sync sources to remote hosts, then stop
    pub sync_only: bool,
    /// Skip the source sync
    pub no_sync: bool,
    /// Keep archives already on disk instead of recomputing them
    pub reuse_artifacts: bool,
    /// Bypass the health cache
    pub no_cache: bool,
    /// Override the artifacts output directory
    pub artifacts_dir: Option<Utf8PathBuf>,
    /// Build and pack but skip the release upload and verification
    pub skip_publish: bool,
}

/// One target's terminal outcome inside the dispatcher
enum TargetOutcome {
    Built(Vec<ArtifactEntry>),
    Failed(String),
}

/// The full build→release→verify pipeline
pub async fn do_build(session: &Session, opts: &BuildOptions) -> DsrResult<CommandOutcome> {
    if opts.sync_only && opts.no_sync {
        return Err(DsrError::InvalidArgs {
            reason: "--sync-only and --no-sync are mutually exclusive".to_owned(),
        });
    }
    let spec = session.snapshot.get_tool(&opts.tool)?;
    let raw_version = match &opts.version {
        Some(v) => v.clone(),
        None => version::detect_version(spec)?,
    };
    let build_plan = plan::plan_build(&session.snapshot, spec, &raw_version, &opts.filters)?;

    if opts.dry_run {
        info!(
            "plan: {} target(s) across {} host(s)",
            build_plan.targets.len(),
            build_plan.hosts().len()
        );
        return Ok(CommandOutcome::success(json!({
            "tool": build_plan.tool,
            "version": build_plan.version,
            "dry_run": true,
            "plan": build_plan,
        })));
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    let lock = BuildLock::acquire(&session.dirs, &opts.tool, &raw_version, &run_id)?;
    let record = prepare_record(session, &build_plan, &run_id)?;
    let outcome = run_pipeline(session, spec.clone(), build_plan, record, opts).await;
    drop(lock);
    outcome
}

/// Create a fresh record, or resume the previous one if it fell short
fn prepare_record(
    session: &Session,
    build_plan: &BuildPlan,
    run_id: &str,
) -> DsrResult<BuildRecord> {
    let existing = session
        .store
        .load_latest(&build_plan.tool, &build_plan.version);
    if let Ok(mut previous) = existing {
        if matches!(previous.status, BuildStatus::Failed | BuildStatus::Partial) {
            info!(
                "resuming {} {} from run {} ({} host(s) already done)",
                previous.tool,
                previous.version,
                previous.run_id,
                previous
                    .hosts
                    .values()
                    .filter(|h| h.status == HostStatus::Completed)
                    .count()
            );
            // the plan may have grown hosts since the failed run
            for host_id in build_plan.hosts() {
                let targets = build_plan
                    .targets_for_host(&host_id)
                    .map(Target::label)
                    .collect();
                previous
                    .hosts
                    .entry(host_id.clone())
                    .or_insert_with(|| state::new_attempt(&host_id, targets));
            }
            return Ok(previous);
        }
    }
    let mut hosts = BTreeMap::new();
    for host_id in build_plan.hosts() {
        let targets = build_plan
            .targets_for_host(&host_id)
            .map(Target::label)
            .collect();
        hosts.insert(host_id.clone(), state::new_attempt(&host_id, targets));
    }
    let workspace = session
        .store
        .run_dir(&build_plan.tool, &build_plan.version, run_id);
    ensure_dir(&workspace)?;
    Ok(BuildRecord {
        tool: build_plan.tool.clone(),
        version: build_plan.version.clone(),
        run_id: run_id.to_owned(),
        status: BuildStatus::Pending,
        started_at: dsr_schema::rfc3339_now(),
        hosts,
        artifacts: vec![],
        workspace: workspace.to_string(),
        created_at: dsr_schema::rfc3339_now(),
    })
}

async fn run_pipeline(
    session: &Session,
    spec: config::ToolSpec,
    build_plan: BuildPlan,
    mut record: BuildRecord,
    opts: &BuildOptions,
) -> DsrResult<CommandOutcome> {
    let settings = &session.snapshot.settings;
    let artifacts_dir = opts
        .artifacts_dir
        .clone()
        .unwrap_or_else(|| session.dirs.artifacts_dir(&build_plan.tool, &build_plan.version));
    ensure_dir(&artifacts_dir)?;

    // the set of hosts this run still has to touch
    let todo_hosts = state::resume_hosts(&record, settings.retry_attempts);
    let skip_done: Vec<&Target> = build_plan
        .targets
        .iter()
        .filter(|t| todo_hosts.contains(&t.host_id))
        .collect();
    if skip_done.len() < build_plan.targets.len() {
        info!(
            "{} target(s) already completed in a previous run",
            build_plan.targets.len() - skip_done.len()
        );
    }

    // a resumed record still carries the previous finalise outputs; they
    // get recomputed below
    record
        .artifacts
        .retain(|a| a.target != "checksums" && a.target != "manifest");
    record.status = BuildStatus::Running;
    session.store.write_record(&record)?;
    log_stage(session, &record.run_id, "dispatch started");

    let record = Arc::new(Mutex::new(record));
    let dispatch = dispatch_targets(
        session,
        &spec,
        &build_plan,
        Arc::clone(&record),
        &artifacts_dir,
        opts,
    );
    tokio::select! {
        result = dispatch => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; persisting state and releasing the lock");
            let mut rec = record.lock().expect("record mutex poisoned");
            for attempt in rec.hosts.values_mut() {
                if matches!(attempt.status, HostStatus::Pending | HostStatus::Running) {
                    attempt.status = HostStatus::Failed;
                    attempt.last_error = Some("interrupted".to_owned());
                }
            }
            rec.status = BuildStatus::Failed;
            session.store.write_record(&rec)?;
            drop(rec);
            return Err(DsrError::BuildFailure {
                tool: build_plan.tool.clone(),
                target: "all".to_owned(),
                phase: "dispatch".to_owned(),
                details: "interrupted by signal".to_owned(),
            });
        }
    }

    let mut record = Arc::try_unwrap(record)
        .map_err(|_| DsrError::BuildFailure {
            tool: build_plan.tool.clone(),
            target: "all".to_owned(),
            phase: "dispatch".to_owned(),
            details: "a dispatch task outlived the pipeline".to_owned(),
        })?
        .into_inner()
        .expect("record mutex poisoned");

    if opts.sync_only {
        record.status = BuildStatus::Completed;
        session.store.write_record(&record)?;
        return Ok(CommandOutcome::success(json!({
            "tool": record.tool,
            "version": record.version,
            "sync_only": true,
            "hosts": record.hosts,
        })));
    }

    // finalise: stable artifact order, checksums, manifest
    record.sort_artifacts();
    record.artifacts.dedup_by(|a, b| a.filename == b.filename);
    let built_any = !record.artifacts.is_empty();
    if built_any {
        let sums = checksum::write_sha256sums(&record.artifacts, &artifacts_dir)?;
        record.artifacts.push(sums);

        let git_sha = spec.local_path.as_deref().and_then(version::git_sha);
        let manifest = checksum::build_manifest(&record, git_sha);
        let manifest_name = checksum::manifest_filename(&record.tool, &record.version);
        let manifest_path = artifacts_dir.join(&manifest_name);
        checksum::write_manifest(&manifest, &manifest_path)?;
        checksum::write_manifest(
            &manifest,
            &session.dirs.manifest_path(&record.tool, &record.version),
        )?;
        record
            .artifacts
            .push(checksum::artifact_entry(&manifest_path, &manifest_name, "manifest")?);
        record.sort_artifacts();
    }
    record.status = state::aggregate_status(&record);
    session.store.write_record(&record)?;
    log_stage(
        session,
        &record.run_id,
        &format!("finalised {} artifact(s)", record.artifacts.len()),
    );

    // publish + verify
    let mut release_details = json!(null);
    let mut verify_details = json!(null);
    let mut publish_ok = true;
    if !opts.skip_publish && built_any {
        if let Some(repo) = &spec.repo {
            if let Err(e) = version::ensure_tag(&spec, &record.version) {
                warn!("could not create the release tag locally: {e}");
            }
            let client = net::GithubClient::from_env()?;
            let tag = version::tag_for(&record.version);
            let upload_manifest = upload_manifest_for(&record);
            let publish_opts = PublishOptions {
                draft: opts.draft.unwrap_or(settings.draft_releases),
                notes: None,
                only: None,
                concurrency: settings.upload_concurrency,
                retry_attempts: settings.retry_attempts,
            };
            let outcome =
                publish::publish_manifest(&client, repo, &tag, &upload_manifest, &publish_opts)
                    .await?;
            publish_ok = outcome.is_complete();
            if !publish_ok {
                for failure in &outcome.failed {
                    error!("failed to upload {}: {}", failure.filename, failure.error);
                }
            }
            release_details = json!(outcome);
            log_stage(session, &record.run_id, "release published");

            let disk_manifest =
                checksum::load_manifest(&session.dirs.manifest_path(&record.tool, &record.version))?;
            let verification =
                verify::verify_release(&client, repo, &tag, &disk_manifest, false).await?;
            verify_details = verification_details(&verification, &record);
            log_stage(
                session,
                &record.run_id,
                &format!(
                    "verified: {} missing, {} extra",
                    verification.missing.len(),
                    verification.extra.len()
                ),
            );
            if !verification.is_complete() {
                publish_ok = false;
            }
        } else {
            info!("tool '{}' has no repo; skipping release upload", spec.name);
        }
    }

    let completed = record
        .hosts
        .values()
        .filter(|h| h.status == HostStatus::Completed)
        .count();
    let failed = record.hosts.len() - completed;
    let exit_code = if failed == 0 && publish_ok {
        EXIT_SUCCESS
    } else if completed > 0 || (built_any && publish_ok) {
        EXIT_PARTIAL
    } else {
        EXIT_BUILD
    };

    Ok(CommandOutcome {
        exit_code,
        details: json!({
            "tool": record.tool,
            "version": record.version,
            "run_id": record.run_id,
            "status": record.status,
            "artifacts_count": record.artifacts.len(),
            "artifacts": record.artifacts.iter().map(|a| a.filename.clone()).collect::<Vec<_>>(),
            "hosts": record.hosts,
            "release": release_details,
            "verification": verify_details,
        }),
    })
}

/// Record a stage boundary in the run log; logging never fails a build
fn log_stage(session: &Session, run_id: &str, line: &str) {
    if let Err(e) = state::append_run_log(&session.dirs, run_id, line) {
        warn!("could not append to the run log: {e}");
    }
}

/// The manifest variant used for upload: the disk manifest plus the
/// manifest file itself as an asset
fn upload_manifest_for(record: &BuildRecord) -> Manifest {
    Manifest {
        schema_version: dsr_schema::MANIFEST_SCHEMA_VERSION.to_owned(),
        tool: record.tool.clone(),
        version: record.version.clone(),
        run_id: record.run_id.clone(),
        git_sha: None,
        built_at: dsr_schema::rfc3339_now(),
        artifacts: record.artifacts.clone(),
    }
}

fn verification_details(verification: &VerifyOutcome, record: &BuildRecord) -> serde_json::Value {
    json!({
        "missing": verification.missing.len(),
        "extra": verification.extra.len(),
        "present": verification.present,
        "assets": {
            "missing": verification.missing,
            "extra": verification.extra,
        },
        "total": record.artifacts.len(),
    })
}

/// Fan the plan out: every target is a task, gated by its host's semaphore
/// and a global parallelism cap, run under the retry wrapper
async fn dispatch_targets(
    session: &Session,
    spec: &config::ToolSpec,
    build_plan: &BuildPlan,
    record: Arc<Mutex<BuildRecord>>,
    artifacts_dir: &Utf8PathBuf,
    opts: &BuildOptions,
) -> DsrResult<()> {
    let settings = &session.snapshot.settings;
    let todo_hosts = {
        let rec = record.lock().expect("record mutex poisoned");
        state::resume_hosts(&rec, settings.retry_attempts)
    };

    // per-host permits sized by host.concurrency, plus a global cap
    let mut host_semaphores: BTreeMap<String, Arc<tokio::sync::Semaphore>> = BTreeMap::new();
    let mut total_permits = 0;
    for host_id in build_plan.hosts() {
        let host = session.snapshot.get_host(&host_id)?;
        total_permits += host.concurrency;
        host_semaphores.insert(
            host_id.clone(),
            Arc::new(tokio::sync::Semaphore::new(host.concurrency)),
        );
    }
    let global_cap = opts
        .parallel
        .or(settings.parallel)
        .unwrap_or(total_permits)
        .max(1);
    let global = Arc::new(tokio::sync::Semaphore::new(global_cap));

    let github_token = std::env::var("GITHUB_TOKEN")
        .or_else(|_| std::env::var("GH_TOKEN"))
        .ok();
    let ctx = ExecContext {
        spec: spec.clone(),
        version: build_plan.version.clone(),
        clean_version: naming::clean_version(&build_plan.version).to_owned(),
        staging_dir: {
            let rec = record.lock().expect("record mutex poisoned");
            Utf8PathBuf::from(&rec.workspace).join("staging")
        },
        sync_only: opts.sync_only,
        no_sync: opts.no_sync,
        github_token,
    };

    // how many dispatched targets each host still owes us
    let mut remaining: BTreeMap<String, usize> = BTreeMap::new();
    for target in &build_plan.targets {
        if todo_hosts.contains(&target.host_id) {
            *remaining.entry(target.host_id.clone()).or_default() += 1;
        }
    }

    // a permanent failure on a host cancels that host's pending targets;
    // other hosts keep going
    let failed_hosts: Arc<Mutex<std::collections::HashSet<String>>> =
        Arc::new(Mutex::new(std::collections::HashSet::new()));
    let dispatch_start = std::time::Instant::now();

    let mut join = tokio::task::JoinSet::new();
    for target in &build_plan.targets {
        if !todo_hosts.contains(&target.host_id) {
            continue;
        }
        let host = session.snapshot.get_host(&target.host_id)?.clone();
        let host_sem = Arc::clone(&host_semaphores[&target.host_id]);
        let global = Arc::clone(&global);
        let record = Arc::clone(&record);
        let failed_hosts = Arc::clone(&failed_hosts);
        let target = target.clone();
        let ctx = ctx.clone();
        let artifacts_dir = artifacts_dir.clone();
        let dirs = session.dirs.clone();
        let policy = RetryPolicy {
            base_delay: std::time::Duration::from_secs(settings.retry_base_delay_secs),
            ..RetryPolicy::with_attempts(settings.retry_attempts)
        };
        let ttl = settings.health_ttl_secs;
        let no_cache = opts.no_cache;
        let reuse = opts.reuse_artifacts;
        let timeout = std::time::Duration::from_secs(settings.build_timeout_secs);

        join.spawn(async move {
            let _global = global
                .acquire_owned()
                .await
                .expect("global semaphore is never closed");
            let _permit = host_sem
                .acquire_owned()
                .await
                .expect("host semaphore is never closed");
            if failed_hosts
                .lock()
                .expect("failed-host set mutex poisoned")
                .contains(&target.host_id)
            {
                let outcome = TargetOutcome::Failed(
                    "cancelled after an earlier failure on this host".to_owned(),
                );
                return (target, outcome);
            }
            {
                let mut rec = record.lock().expect("record mutex poisoned");
                if let Some(attempt) = rec.hosts.get_mut(&target.host_id) {
                    attempt.status = HostStatus::Running;
                }
            }

            let record_for_unit = Arc::clone(&record);
            let target_for_unit = target.clone();
            let unit = tokio::task::spawn_blocking(move || {
                execute_target(
                    &host,
                    &target_for_unit,
                    &ctx,
                    &artifacts_dir,
                    &dirs,
                    ttl,
                    no_cache,
                    reuse,
                    &policy,
                    record_for_unit,
                )
            });
            let outcome = match tokio::time::timeout(timeout, unit).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(join_err)) => TargetOutcome::Failed(format!("worker panicked: {join_err}")),
                Err(_) => TargetOutcome::Failed(format!(
                    "build timed out after {}s",
                    timeout.as_secs()
                )),
            };
            if matches!(outcome, TargetOutcome::Failed(_)) {
                failed_hosts
                    .lock()
                    .expect("failed-host set mutex poisoned")
                    .insert(target.host_id.clone());
            }
            (target, outcome)
        });
    }

    let mut per_host_failures: BTreeMap<String, String> = BTreeMap::new();
    while let Some(joined) = join.join_next().await {
        let (target, outcome) = joined.map_err(|e| DsrError::BuildFailure {
            tool: build_plan.tool.clone(),
            target: "all".to_owned(),
            phase: "dispatch".to_owned(),
            details: format!("dispatch task panicked: {e}"),
        })?;
        let mut rec = record.lock().expect("record mutex poisoned");
        match outcome {
            TargetOutcome::Built(entries) => {
                info!("built {} on {}", target.label(), target.host_id);
                rec.artifacts.extend(entries);
            }
            TargetOutcome::Failed(why) => {
                error!("target {} failed on {}: {why}", target.label(), target.host_id);
                // the retry budget counts failed runs per host, not attempts
                if per_host_failures
                    .insert(target.host_id.clone(), why)
                    .is_none()
                {
                    if let Some(attempt) = rec.hosts.get_mut(&target.host_id) {
                        attempt.retry_count += 1;
                    }
                }
            }
        }
        let left = remaining
            .get_mut(&target.host_id)
            .map(|n| {
                *n = n.saturating_sub(1);
                *n
            })
            .unwrap_or(0);
        if let Some(attempt) = rec.hosts.get_mut(&target.host_id) {
            if let Some(why) = per_host_failures.get(&target.host_id) {
                attempt.status = HostStatus::Failed;
                attempt.last_error = Some(why.clone());
                attempt.duration_ms = Some(dispatch_start.elapsed().as_millis() as u64);
            } else if left == 0 {
                attempt.status = HostStatus::Completed;
                attempt.last_error = None;
                attempt.duration_ms = Some(dispatch_start.elapsed().as_millis() as u64);
            }
        }
        rec.status = state::aggregate_status(&rec);
        session.store.write_record(&rec)?;
    }
    Ok(())
}

/// One target, end to end: health gate, build, pack, checksum, all inside
/// the retry wrapper, on a blocking thread
fn execute_target(
    host: &config::Host,
    target: &Target,
    ctx: &ExecContext,
    artifacts_dir: &Utf8PathBuf,
    dirs: &AppDirs,
    health_ttl: u64,
    no_cache: bool,
    reuse: bool,
    policy: &RetryPolicy,
    record: Arc<Mutex<BuildRecord>>,
) -> TargetOutcome {
    let unit = || -> DsrResult<Vec<ArtifactEntry>> {
        // a sync-only run has nothing to do for container targets
        if ctx.sync_only && target.class == TargetClass::Act {
            return Ok(vec![]);
        }
        let report = health::cached_probe(dirs, host, health_ttl, no_cache)?;
        if !report.healthy {
            return Err(DsrError::HostUnreachable {
                host: host.id.clone(),
                details: format!("health status {}", report.status),
            });
        }
        let driver: Box<dyn Executor> = match target.class {
            TargetClass::Act => Box::new(ActDriver::new()),
            TargetClass::Native => Box::new(NativeDriver::new(host.clone())),
        };
        let collected = driver.run(target, ctx)?;
        if ctx.sync_only {
            return Ok(vec![]);
        }
        collect_entries(&collected, target, ctx, artifacts_dir, reuse)
    };

    let result = retry::run(
        policy,
        |_| unit(),
        |attempt, err: &DsrError| {
            warn!(
                "attempt {attempt} for {} on {} failed: {err}",
                target.label(),
                host.id
            );
            let mut rec = record.lock().expect("record mutex poisoned");
            if let Some(host_attempt) = rec.hosts.get_mut(&host.id) {
                host_attempt.last_error = Some(format!("attempt {attempt}: {err}"));
            }
        },
        |err| err.is_retryable(),
    );
    match result {
        Ok(entries) => TargetOutcome::Built(entries),
        Err(err) => TargetOutcome::Failed(err.to_string()),
    }
}

/// Turn what an executor collected into final, checksummed artifacts
fn collect_entries(
    collected: &[exec::Collected],
    target: &Target,
    ctx: &ExecContext,
    artifacts_dir: &Utf8PathBuf,
    reuse: bool,
) -> DsrResult<Vec<ArtifactEntry>> {
    let pair = target.pair().to_string();
    let mut entries = Vec::new();
    for item in collected {
        match item.kind {
            CollectedKind::Binary => {
                let packed = archive::pack(
                    &item.path,
                    ctx.spec.binary_name(),
                    target.os,
                    target.archive_format,
                    &target.expected,
                    artifacts_dir,
                    reuse,
                )?;
                for file in packed {
                    entries.push(checksum::artifact_entry(&file.path, &file.filename, &pair)?);
                }
            }
            CollectedKind::Asset => {
                // the workflow already packed it; adopt under the expected names
                let dest = artifacts_dir.join(&target.expected.versioned);
                if !(reuse && dest.exists()) {
                    std::fs::copy(&item.path, &dest)?;
                }
                entries.push(checksum::artifact_entry(
                    &dest,
                    &target.expected.versioned,
                    &pair,
                )?);
                if !target.expected.same {
                    let compat = artifacts_dir.join(&target.expected.compat);
                    if !(reuse && compat.exists()) {
                        std::fs::copy(&dest, &compat)?;
                    }
                    entries.push(checksum::artifact_entry(
                        &compat,
                        &target.expected.compat,
                        &pair,
                    )?);
                }
            }
        }
    }
    Ok(entries)
}

/// `dsr release`: publish an existing manifest; with `verify`, check only
pub async fn do_release(
    session: &Session,
    tool: &str,
    version_arg: Option<&str>,
    verify_only: bool,
    fix: bool,
    check_checksums: bool,
    draft: Option<bool>,
) -> DsrResult<CommandOutcome> {
    let spec = session.snapshot.get_tool(tool)?;
    let raw_version = match version_arg {
        Some(v) => v.to_owned(),
        None => version::detect_version(spec)?,
    };
    let repo = spec.repo.as_ref().ok_or_else(|| DsrError::ConfigInvalid {
        path: session.snapshot.config_dir.clone(),
        reason: format!("tool '{tool}' has no repo to release to"),
    })?;
    let manifest_path = session.dirs.manifest_path(tool, &raw_version);
    if !manifest_path.exists() {
        return Err(DsrError::NoBuildRecord {
            tool: tool.to_owned(),
            version: raw_version,
        });
    }
    let manifest = checksum::load_manifest(&manifest_path)?;
    let client = net::GithubClient::from_env()?;
    let tag = version::tag_for(&raw_version);
    let settings = &session.snapshot.settings;
    let publish_opts = PublishOptions {
        draft: draft.unwrap_or(settings.draft_releases),
        notes: None,
        only: None,
        concurrency: settings.upload_concurrency,
        retry_attempts: settings.retry_attempts,
    };

    if verify_only {
        let verification = if fix {
            verify::verify_and_fix(&client, repo, &tag, &manifest, check_checksums, &publish_opts)
                .await?
        } else {
            verify::verify_release(&client, repo, &tag, &manifest, check_checksums).await?
        };
        let exit_code = if verification.is_complete() {
            EXIT_SUCCESS
        } else {
            EXIT_PARTIAL
        };
        let details = json!({
            "tool": tool,
            "version": raw_version,
            "verification": {
                "missing": verification.missing.len(),
                "extra": verification.extra.len(),
                "present": verification.present,
                "checksums_verified": verification.checksums_verified,
            },
            "assets": {
                "missing": verification.missing,
                "extra": verification.extra,
                "checksum_mismatches": verification.checksum_mismatches,
            },
        });
        return Ok(CommandOutcome { exit_code, details });
    }

    let outcome: PublishOutcome =
        publish::publish_manifest(&client, repo, &tag, &manifest, &publish_opts).await?;
    let exit_code = if outcome.is_complete() {
        EXIT_SUCCESS
    } else if outcome.any_succeeded() {
        EXIT_PARTIAL
    } else {
        EXIT_BUILD
    };
    Ok(CommandOutcome {
        exit_code,
        details: json!({
            "tool": tool,
            "version": raw_version,
            "release": outcome,
        }),
    })
}

/// `dsr fallback`: the pipeline with every target forced onto native hosts
pub async fn do_fallback(session: &Session, opts: &BuildOptions) -> DsrResult<CommandOutcome> {
    info!("fallback: treating every target as native");
    let mut opts = opts.clone();
    opts.filters.force_native = true;
    do_build(session, &opts).await
}

/// `dsr watch`: poll upstream CI and trigger native builds on green runs
pub async fn do_watch(
    session: &Session,
    tool_filter: Option<&str>,
    dry_run: bool,
) -> DsrResult<CommandOutcome> {
    let client = net::GithubClient::from_env()?;
    let tools: Vec<String> = match tool_filter {
        Some(tool) => vec![tool.to_owned()],
        None => session
            .snapshot
            .list_tools()
            .into_iter()
            .map(str::to_owned)
            .collect(),
    };

    let mut states = serde_json::Map::new();
    let mut triggered = Vec::new();
    for tool in &tools {
        let spec = session.snapshot.get_tool(tool)?;
        let state = watch::check_tool(&client, &session.dirs, spec).await?;
        if let watch::WatchState::Ready { head_sha } = &state {
            if dry_run {
                info!("{tool}: upstream green at {head_sha}; would trigger a native build");
            } else {
                info!("{tool}: upstream green at {head_sha}; triggering native build");
                let build_opts = BuildOptions {
                    tool: tool.clone(),
                    filters: PlanFilters {
                        only_native: true,
                        ..Default::default()
                    },
                    ..Default::default()
                };
                match do_build(session, &build_opts).await {
                    Ok(_) => {
                        watch::record_built(&session.dirs, tool, head_sha)?;
                        triggered.push(tool.clone());
                    }
                    Err(e) => error!("triggered build of {tool} failed: {e}"),
                }
            }
        }
        states.insert(tool.clone(), json!(state));
    }
    Ok(CommandOutcome::success(json!({
        "tools": states,
        "triggered": triggered,
        "dry_run": dry_run,
    })))
}

/// `dsr health`: probe one host, all hosts, or clear the cache
pub fn do_health(
    session: &Session,
    host_arg: Option<&str>,
    clear: bool,
    no_cache: bool,
) -> DsrResult<CommandOutcome> {
    if clear {
        let removed = health::clear_cache(&session.dirs)?;
        return Ok(CommandOutcome::success(json!({"cleared": removed})));
    }
    let ttl = session.snapshot.settings.health_ttl_secs;
    let hosts: Vec<&config::Host> = match host_arg {
        Some(id) => vec![session.snapshot.get_host(id)?],
        None => session.snapshot.list_hosts(),
    };
    let mut reports = serde_json::Map::new();
    let mut all_healthy = true;
    for host in hosts {
        let report = health::cached_probe(&session.dirs, host, ttl, no_cache)?;
        all_healthy &= report.healthy;
        reports.insert(host.id.clone(), json!(report));
    }
    Ok(CommandOutcome {
        exit_code: if all_healthy { EXIT_SUCCESS } else { EXIT_PARTIAL },
        details: json!({"hosts": reports}),
    })
}

/// `dsr doctor`: preflight the control machine and the host fleet
pub fn do_doctor(session: &Session, quick: bool, fix: bool) -> DsrResult<CommandOutcome> {
    let mut problems: Vec<String> = Vec::new();
    let mut binaries = serde_json::Map::new();
    for binary in ["git", "ssh", "rsync", "act"] {
        let found = axoprocess::Cmd::new("sh", format!("probe for {binary}"))
            .arg("-c")
            .arg(format!("command -v {binary}"))
            .log(None)
            .check(false)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !found {
            problems.push(format!("{binary} is not on PATH"));
        }
        binaries.insert(binary.to_owned(), json!(found));
    }
    let token_present = std::env::var("GITHUB_TOKEN")
        .or_else(|_| std::env::var("GH_TOKEN"))
        .map(|t| !t.is_empty())
        .unwrap_or(false);
    if !token_present {
        problems.push("neither GITHUB_TOKEN nor GH_TOKEN is set".to_owned());
    }

    let mut hosts = serde_json::Map::new();
    if !quick {
        let ttl = session.snapshot.settings.health_ttl_secs;
        for host in session.snapshot.list_hosts() {
            let report = health::cached_probe(&session.dirs, host, ttl, fix)?;
            if !report.healthy {
                problems.push(format!("host {} is {}", host.id, report.status));
            }
            hosts.insert(host.id.clone(), json!(report));
        }
    }
    if fix {
        let cleared = health::clear_cache(&session.dirs)?;
        info!("cleared {cleared} cached health report(s)");
        let stale = state::clear_stale_locks(&session.dirs)?;
        info!("removed {stale} stale build lock(s)");
    }

    Ok(CommandOutcome {
        exit_code: if problems.is_empty() {
            EXIT_SUCCESS
        } else {
            EXIT_PARTIAL
        },
        details: json!({
            "binaries": binaries,
            "github_token": token_present,
            "hosts": hosts,
            "problems": problems,
            "quick": quick,
        }),
    })
}

/// `dsr prune`: delete old run state
pub fn do_prune(
    session: &Session,
    max_age_days: u64,
    keep_last: usize,
    dry_run: bool,
) -> DsrResult<CommandOutcome> {
    let report = session.store.prune(max_age_days, keep_last, dry_run)?;
    Ok(CommandOutcome::success(json!({
        "removed": report.removed,
        "kept": report.kept,
        "dry_run": dry_run,
    })))
}

/// `dsr quality`: run a tool's configured quality gates
pub fn do_quality(
    session: &Session,
    tool: &str,
    dry_run: bool,
    skip_checks: bool,
) -> DsrResult<CommandOutcome> {
    let spec = session.snapshot.get_tool(tool)?;
    let outcome = quality::run_checks(spec, dry_run, skip_checks)?;
    let exit_code = if outcome.passed { EXIT_SUCCESS } else { EXIT_BUILD };
    Ok(CommandOutcome {
        exit_code,
        details: json!({
            "tool": tool,
            "skipped": outcome.skipped,
            "passed": outcome.passed,
            "checks": outcome.results,
        }),
    })
}

/// `dsr repos list` / `dsr repos validate`
pub fn do_repos(
    session: &Session,
    validate: bool,
    tool_filter: Option<&str>,
) -> DsrResult<CommandOutcome> {
    let tools: Vec<String> = match tool_filter {
        Some(tool) => {
            session.snapshot.get_tool(tool)?;
            vec![tool.to_owned()]
        }
        None => session
            .snapshot
            .list_tools()
            .into_iter()
            .map(str::to_owned)
            .collect(),
    };
    if !validate {
        return Ok(CommandOutcome::success(json!({"tools": tools})));
    }

    let mut results = serde_json::Map::new();
    let mut any_warn = false;
    for tool in &tools {
        let spec = session.snapshot.get_tool(tool)?;
        let template = spec.template()?;
        let compat = spec.compat_template()?;
        let workflow_templates = spec
            .workflow_path()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .map(|text| naming::scrape_templates(&text))
            .unwrap_or_default();
        let report = naming::validate_templates(&template, &compat, &workflow_templates);
        let advisories = spec.goreleaser_advisories();
        let status = if report.is_ok() && advisories.is_empty() {
            "ok"
        } else {
            any_warn = true;
            "warn"
        };
        results.insert(
            tool.clone(),
            json!({
                "status": status,
                "templates": report,
                "goreleaser": advisories,
            }),
        );
    }
    // advisory only: warnings never fail the command
    Ok(CommandOutcome::success(json!({
        "status": if any_warn { "warn" } else { "ok" },
        "tools": results,
    })))
}

/// `dsr status`: every build record the store knows about
pub fn do_status(session: &Session) -> DsrResult<CommandOutcome> {
    let records = session.store.list_records()?;
    let builds: Vec<serde_json::Value> = records
        .iter()
        .map(|r| {
            json!({
                "tool": r.tool,
                "version": r.version,
                "run_id": r.run_id,
                "status": r.status,
                "started_at": r.started_at,
                "artifacts_count": r.artifacts.len(),
            })
        })
        .collect();
    Ok(CommandOutcome::success(json!({"builds": builds})))
}
