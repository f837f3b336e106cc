//! The lock & state store
//!
//! One directory per `(tool, version)` under `<state>/builds/`, one
//! subdirectory per run, and a `latest` pointer at the newest run. The build
//! lock lives beside them and guarantees at most one active build per
//! `(tool, version)` on this control machine.
//!
//! State files are never edited in place: writes go to a temp sibling and
//! rename into position, so a reader sees either the old file or the new one,
//! never a torn one.

use camino::{Utf8Path, Utf8PathBuf};
use dsr_schema::{BuildRecord, BuildStatus, HostAttempt, HostStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dirs::{ensure_dir, AppDirs};
use crate::errors::{DsrError, DsrResult};

/// How old a dead-pid lock must be before we'll steal it
const STALE_LOCK_GRACE_SECS: i64 = 3600;

/// What the lock file records about its owner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// The run holding the lock
    pub run_id: String,
    /// The machine the run is on
    pub host: String,
    /// The pid of the run
    pub pid: u32,
    /// When the lock was taken, RFC-3339 `Z`
    pub acquired_at: String,
}

/// The hostname of this control machine
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned())
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    // /proc covers linux; the kill probe covers the rest of unix
    if Utf8PathBuf::from(format!("/proc/{pid}")).exists() {
        return true;
    }
    let alive = axoprocess::Cmd::new("kill", "probe whether a pid is alive")
        .arg("-0")
        .arg(pid.to_string())
        .log(None)
        .check(false)
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    alive
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    // no portable probe; treat foreign pids as alive and let the grace
    // period + manual cleanup handle it
    true
}

fn lock_age_secs(info: &LockInfo) -> i64 {
    chrono::DateTime::parse_from_rfc3339(&info.acquired_at)
        .map(|t| (chrono::Utc::now() - t.with_timezone(&chrono::Utc)).num_seconds())
        .unwrap_or(i64::MAX)
}

/// A held build lock; dropping it releases the file
///
/// The guard is what makes "released on every exit path" true: normal
/// return, `?`, and unwind all run the destructor.
#[derive(Debug)]
pub struct BuildLock {
    path: Utf8PathBuf,
    /// What we wrote into the lock file
    pub info: LockInfo,
}

impl BuildLock {
    /// Try to take the lock for `(tool, version)`; fail fast on contention
    pub fn acquire(
        dirs: &AppDirs,
        tool: &str,
        version: &str,
        run_id: &str,
    ) -> DsrResult<BuildLock> {
        let dir = dirs.build_dir(tool, version);
        ensure_dir(&dir)?;
        let path = dir.join(".build.lock");
        let info = LockInfo {
            run_id: run_id.to_owned(),
            host: local_hostname(),
            pid: std::process::id(),
            acquired_at: dsr_schema::rfc3339_now(),
        };
        match Self::try_create(&path, &info)? {
            true => Ok(BuildLock { path, info }),
            false => {
                let holder = Self::read_holder(&path);
                if let Some(holder) = &holder {
                    // only the owning host can tell whether the pid is dead;
                    // a lock from another machine is never stolen here
                    let same_host = holder.host == info.host;
                    let stale = same_host
                        && !pid_is_alive(holder.pid)
                        && lock_age_secs(holder) > STALE_LOCK_GRACE_SECS;
                    if stale {
                        warn!(
                            "stealing stale lock for {tool} {version} (run {}, dead pid {})",
                            holder.run_id, holder.pid
                        );
                        let _ = std::fs::remove_file(&path);
                        if Self::try_create(&path, &info)? {
                            return Ok(BuildLock { path, info });
                        }
                    }
                }
                let holder = holder.unwrap_or(LockInfo {
                    run_id: "unknown".to_owned(),
                    host: "unknown".to_owned(),
                    pid: 0,
                    acquired_at: String::new(),
                });
                Err(DsrError::BuildLocked {
                    tool: tool.to_owned(),
                    version: version.to_owned(),
                    run_id: holder.run_id,
                    pid: holder.pid,
                    host: holder.host,
                })
            }
        }
    }

    fn try_create(path: &Utf8Path, info: &LockInfo) -> DsrResult<bool> {
        use std::io::Write;
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                file.write_all(serde_json::to_string_pretty(info)?.as_bytes())?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read_holder(path: &Utf8Path) -> Option<LockInfo> {
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to release build lock {}: {e}", self.path);
            }
        }
    }
}

/// Reads and writes build records under the state dir
#[derive(Debug, Clone)]
pub struct StateStore {
    dirs: AppDirs,
}

impl StateStore {
    /// A store rooted at these dirs
    pub fn new(dirs: &AppDirs) -> Self {
        Self { dirs: dirs.clone() }
    }

    /// `<state>/builds/<tool>/<version>/<run_id>`
    pub fn run_dir(&self, tool: &str, version: &str, run_id: &str) -> Utf8PathBuf {
        self.dirs.build_dir(tool, version).join(run_id)
    }

    fn latest_path(&self, tool: &str, version: &str) -> Utf8PathBuf {
        self.dirs.build_dir(tool, version).join("latest")
    }

    /// Write a record crash-safely and repoint `latest` at its run
    pub fn write_record(&self, record: &BuildRecord) -> DsrResult<()> {
        let run_dir = self.run_dir(&record.tool, &record.version, &record.run_id);
        ensure_dir(&run_dir)?;
        let final_path = run_dir.join("state.json");
        let tmp_path = run_dir.join(".state.json.tmp");
        std::fs::write(&tmp_path, serde_json::to_string_pretty(record)?)?;
        std::fs::rename(&tmp_path, &final_path)?;
        self.update_latest(&record.tool, &record.version, &record.run_id)?;
        Ok(())
    }

    #[cfg(unix)]
    fn update_latest(&self, tool: &str, version: &str, run_id: &str) -> DsrResult<()> {
        let link = self.latest_path(tool, version);
        let tmp = self.dirs.build_dir(tool, version).join(".latest.tmp");
        let _ = std::fs::remove_file(&tmp);
        std::os::unix::fs::symlink(run_id, &tmp)?;
        std::fs::rename(&tmp, &link)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn update_latest(&self, tool: &str, version: &str, run_id: &str) -> DsrResult<()> {
        let dir = self.latest_path(tool, version);
        ensure_dir(&dir)?;
        let src = self.run_dir(tool, version, run_id).join("state.json");
        std::fs::copy(src, dir.join("state.json"))?;
        Ok(())
    }

    /// Load the most recent record for `(tool, version)`
    pub fn load_latest(&self, tool: &str, version: &str) -> DsrResult<BuildRecord> {
        let path = self.latest_path(tool, version).join("state.json");
        if !path.exists() {
            return Err(DsrError::NoBuildRecord {
                tool: tool.to_owned(),
                version: version.to_owned(),
            });
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Every `(tool, version, record)` the store knows about
    pub fn list_records(&self) -> DsrResult<Vec<BuildRecord>> {
        let builds = self.dirs.state_dir.join("builds");
        let mut records = Vec::new();
        if !builds.is_dir() {
            return Ok(records);
        }
        for tool_entry in builds.read_dir_utf8()? {
            let tool_dir = tool_entry?.path().to_owned();
            if !tool_dir.is_dir() {
                continue;
            }
            for version_entry in tool_dir.read_dir_utf8()? {
                let version_dir = version_entry?.path().to_owned();
                let state = version_dir.join("latest").join("state.json");
                if state.exists() {
                    let text = std::fs::read_to_string(&state)?;
                    if let Ok(record) = serde_json::from_str(&text) {
                        records.push(record);
                    }
                }
            }
        }
        records.sort_by(|a: &BuildRecord, b: &BuildRecord| {
            (&a.tool, &a.version).cmp(&(&b.tool, &b.version))
        });
        Ok(records)
    }

    /// Remove old run dirs; keep the newest `keep_last` per `(tool, version)`
    /// and anything younger than `max_age_days`
    pub fn prune(
        &self,
        max_age_days: u64,
        keep_last: usize,
        dry_run: bool,
    ) -> DsrResult<PruneReport> {
        let builds = self.dirs.state_dir.join("builds");
        let mut report = PruneReport::default();
        if !builds.is_dir() {
            return Ok(report);
        }
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(max_age_days * 24 * 60 * 60);
        for tool_entry in builds.read_dir_utf8()? {
            let tool_dir = tool_entry?.path().to_owned();
            if !tool_dir.is_dir() {
                continue;
            }
            for version_entry in tool_dir.read_dir_utf8()? {
                let version_dir = version_entry?.path().to_owned();
                if !version_dir.is_dir() {
                    continue;
                }
                let mut runs: Vec<(std::time::SystemTime, Utf8PathBuf)> = Vec::new();
                for run_entry in version_dir.read_dir_utf8()? {
                    let run_dir = run_entry?.path().to_owned();
                    let name = run_dir.file_name().unwrap_or_default();
                    if !run_dir.is_dir() || name == "latest" {
                        continue;
                    }
                    let mtime = std::fs::metadata(&run_dir)?
                        .modified()
                        .unwrap_or(std::time::UNIX_EPOCH);
                    runs.push((mtime, run_dir));
                }
                // newest first; the first keep_last survive unconditionally
                runs.sort_by(|a, b| b.0.cmp(&a.0));
                for (mtime, run_dir) in runs.into_iter().skip(keep_last) {
                    if mtime < cutoff {
                        if dry_run {
                            info!("would prune {run_dir}");
                        } else {
                            std::fs::remove_dir_all(&run_dir)?;
                        }
                        report.removed.push(run_dir.to_string());
                    } else {
                        report.kept += 1;
                    }
                }
            }
        }
        Ok(report)
    }
}

/// What `prune` did (or would do, under `--dry-run`)
#[derive(Debug, Default, Serialize)]
pub struct PruneReport {
    /// Run dirs removed (or listed, in dry-run)
    pub removed: Vec<String>,
    /// Run dirs old enough to consider but still within the age window
    pub kept: usize,
}

/// Append one line to today's run log under `<state>/logs/YYYY-MM-DD/`
///
/// The `latest` symlink next to the date dirs always points at today.
/// Logging never fails a build; callers ignore the result at their option.
pub fn append_run_log(dirs: &AppDirs, run_id: &str, line: &str) -> DsrResult<()> {
    use std::io::Write;
    let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let day_dir = dirs.logs_dir_for(&date);
    ensure_dir(&day_dir)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(day_dir.join("run.log"))?;
    writeln!(file, "{} [{run_id}] {line}", dsr_schema::rfc3339_now())?;

    #[cfg(unix)]
    {
        let link = dirs.state_dir.join("logs").join("latest");
        let tmp = dirs.state_dir.join("logs").join(".latest.tmp");
        let _ = std::fs::remove_file(&tmp);
        std::os::unix::fs::symlink(&date, &tmp)?;
        std::fs::rename(&tmp, &link)?;
    }
    Ok(())
}

/// Remove build locks whose same-host owner pid is dead
///
/// Cross-host locks are left alone; only the owning host can judge liveness.
pub fn clear_stale_locks(dirs: &AppDirs) -> DsrResult<usize> {
    let builds = dirs.state_dir.join("builds");
    let mut removed = 0;
    if !builds.is_dir() {
        return Ok(removed);
    }
    let me = local_hostname();
    for tool_entry in builds.read_dir_utf8()? {
        let tool_dir = tool_entry?.path().to_owned();
        if !tool_dir.is_dir() {
            continue;
        }
        for version_entry in tool_dir.read_dir_utf8()? {
            let lock_path = version_entry?.path().join(".build.lock");
            if !lock_path.exists() {
                continue;
            }
            if let Some(info) = BuildLock::read_holder(&lock_path) {
                if info.host == me && !pid_is_alive(info.pid) {
                    warn!("removing stale lock at {lock_path} (dead pid {})", info.pid);
                    std::fs::remove_file(&lock_path)?;
                    removed += 1;
                }
            }
        }
    }
    Ok(removed)
}

/// The hosts a resumed build still has to dispatch to
///
/// Completed hosts keep their artifacts and are never re-dispatched; failed
/// hosts come back only while they have retry budget left.
pub fn resume_hosts(record: &BuildRecord, retry_budget: u32) -> Vec<String> {
    record
        .hosts
        .values()
        .filter(|attempt| match attempt.status {
            HostStatus::Pending | HostStatus::Running => true,
            HostStatus::Failed => attempt.retry_count < retry_budget,
            HostStatus::Completed => false,
        })
        .map(|attempt| attempt.host_id.clone())
        .collect()
}

/// Derive the record-level status from its host attempts
pub fn aggregate_status(record: &BuildRecord) -> BuildStatus {
    let total = record.hosts.len();
    let completed = record
        .hosts
        .values()
        .filter(|h| h.status == HostStatus::Completed)
        .count();
    let failed = record
        .hosts
        .values()
        .filter(|h| h.status == HostStatus::Failed)
        .count();
    if total == 0 {
        BuildStatus::Pending
    } else if completed == total {
        BuildStatus::Completed
    } else if failed == total {
        BuildStatus::Failed
    } else if completed + failed == total {
        BuildStatus::Partial
    } else {
        BuildStatus::Running
    }
}

/// A fresh host attempt in the pending state
pub fn new_attempt(host_id: &str, targets: Vec<String>) -> HostAttempt {
    HostAttempt {
        host_id: host_id.to_owned(),
        status: HostStatus::Pending,
        retry_count: 0,
        last_error: None,
        duration_ms: None,
        targets_covered: targets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use temp_dir::TempDir;

    fn dirs_for(dir: &TempDir) -> AppDirs {
        let root = Utf8PathBuf::try_from(dir.path().to_owned()).unwrap();
        AppDirs {
            config_dir: root.join("config"),
            state_dir: root.join("state"),
            cache_dir: root.join("cache"),
        }
    }

    fn record(tool: &str, version: &str, run_id: &str) -> BuildRecord {
        BuildRecord {
            tool: tool.to_owned(),
            version: version.to_owned(),
            run_id: run_id.to_owned(),
            status: BuildStatus::Running,
            started_at: dsr_schema::rfc3339_now(),
            hosts: BTreeMap::new(),
            artifacts: vec![],
            workspace: "/tmp/work".to_owned(),
            created_at: dsr_schema::rfc3339_now(),
        }
    }

    #[test]
    fn second_acquire_fails_fast() {
        let dir = TempDir::new().unwrap();
        let dirs = dirs_for(&dir);
        let lock = BuildLock::acquire(&dirs, "mytool", "v1.0.0", "run-a").unwrap();
        let err = BuildLock::acquire(&dirs, "mytool", "v1.0.0", "run-b").unwrap_err();
        match err {
            DsrError::BuildLocked { run_id, pid, .. } => {
                assert_eq!(run_id, "run-a");
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected BuildLocked, got {other}"),
        }
        drop(lock);
        // released on drop, so a third acquire succeeds
        BuildLock::acquire(&dirs, "mytool", "v1.0.0", "run-c").unwrap();
    }

    #[test]
    fn locks_are_per_tool_version() {
        let dir = TempDir::new().unwrap();
        let dirs = dirs_for(&dir);
        let _a = BuildLock::acquire(&dirs, "mytool", "v1.0.0", "run-a").unwrap();
        // different version, no contention
        let _b = BuildLock::acquire(&dirs, "mytool", "v1.0.1", "run-b").unwrap();
        let _c = BuildLock::acquire(&dirs, "othertool", "v1.0.0", "run-c").unwrap();
    }

    #[test]
    fn cross_host_lock_is_never_stolen() {
        let dir = TempDir::new().unwrap();
        let dirs = dirs_for(&dir);
        let build_dir = dirs.build_dir("mytool", "v1.0.0");
        ensure_dir(&build_dir).unwrap();
        // a very old lock owned by a pid that's certainly dead, but on
        // another machine
        let foreign = LockInfo {
            run_id: "run-x".to_owned(),
            host: "some-other-box".to_owned(),
            pid: u32::MAX - 1,
            acquired_at: "2000-01-01T00:00:00Z".to_owned(),
        };
        std::fs::write(
            build_dir.join(".build.lock"),
            serde_json::to_string(&foreign).unwrap(),
        )
        .unwrap();
        let err = BuildLock::acquire(&dirs, "mytool", "v1.0.0", "run-b").unwrap_err();
        assert!(matches!(err, DsrError::BuildLocked { .. }));
    }

    #[test]
    fn state_write_is_visible_and_latest_points_at_it() {
        let dir = TempDir::new().unwrap();
        let dirs = dirs_for(&dir);
        let store = StateStore::new(&dirs);
        let mut rec = record("mytool", "v1.0.0", "run-a");
        store.write_record(&rec).unwrap();
        rec.status = BuildStatus::Completed;
        store.write_record(&rec).unwrap();
        let loaded = store.load_latest("mytool", "v1.0.0").unwrap();
        assert_eq!(loaded.status, BuildStatus::Completed);
        assert_eq!(loaded.run_id, "run-a");

        // a newer run takes over the pointer
        let rec2 = record("mytool", "v1.0.0", "run-b");
        store.write_record(&rec2).unwrap();
        let loaded = store.load_latest("mytool", "v1.0.0").unwrap();
        assert_eq!(loaded.run_id, "run-b");
    }

    #[test]
    fn missing_record_is_its_own_error() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(&dirs_for(&dir));
        let err = store.load_latest("ghost", "v0.0.0").unwrap_err();
        assert!(matches!(err, DsrError::NoBuildRecord { .. }));
    }

    #[test]
    fn resume_skips_completed_and_budget_exhausted() {
        let mut rec = record("mytool", "v1.0.0", "run-a");
        let mut done = new_attempt("local", vec!["linux/amd64".into()]);
        done.status = HostStatus::Completed;
        let mut failed_budget_left = new_attempt("mmini", vec!["darwin/arm64".into()]);
        failed_budget_left.status = HostStatus::Failed;
        failed_budget_left.retry_count = 1;
        let mut failed_exhausted = new_attempt("winbox", vec!["windows/amd64".into()]);
        failed_exhausted.status = HostStatus::Failed;
        failed_exhausted.retry_count = 3;
        rec.hosts.insert("local".into(), done);
        rec.hosts.insert("mmini".into(), failed_budget_left);
        rec.hosts.insert("winbox".into(), failed_exhausted);

        let hosts = resume_hosts(&rec, 3);
        assert_eq!(hosts, vec!["mmini".to_owned()]);
    }

    #[test]
    fn aggregate_status_covers_the_matrix() {
        let mut rec = record("mytool", "v1.0.0", "run-a");
        assert_eq!(aggregate_status(&rec), BuildStatus::Pending);

        let mut a = new_attempt("a", vec![]);
        a.status = HostStatus::Completed;
        let mut b = new_attempt("b", vec![]);
        b.status = HostStatus::Failed;
        rec.hosts.insert("a".into(), a.clone());
        rec.hosts.insert("b".into(), b.clone());
        assert_eq!(aggregate_status(&rec), BuildStatus::Partial);

        rec.hosts.get_mut("b").unwrap().status = HostStatus::Completed;
        assert_eq!(aggregate_status(&rec), BuildStatus::Completed);

        rec.hosts.get_mut("a").unwrap().status = HostStatus::Failed;
        rec.hosts.get_mut("b").unwrap().status = HostStatus::Failed;
        assert_eq!(aggregate_status(&rec), BuildStatus::Failed);

        rec.hosts.get_mut("b").unwrap().status = HostStatus::Running;
        assert_eq!(aggregate_status(&rec), BuildStatus::Running);
    }

    #[test]
    fn run_log_appends_and_stamps() {
        let dir = TempDir::new().unwrap();
        let dirs = dirs_for(&dir);
        append_run_log(&dirs, "run-a", "build started").unwrap();
        append_run_log(&dirs, "run-a", "build completed").unwrap();
        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let log = std::fs::read_to_string(dirs.logs_dir_for(&date).join("run.log")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[run-a] build started"));
        assert!(lines[1].ends_with("build completed"));
    }

    #[test]
    fn stale_lock_sweep_ignores_live_and_foreign_locks() {
        let dir = TempDir::new().unwrap();
        let dirs = dirs_for(&dir);
        // a live lock owned by this process
        let _live = BuildLock::acquire(&dirs, "alive", "v1.0.0", "run-a").unwrap();
        // a dead same-host lock
        let dead_dir = dirs.build_dir("dead", "v1.0.0");
        ensure_dir(&dead_dir).unwrap();
        let dead = LockInfo {
            run_id: "run-x".to_owned(),
            host: local_hostname(),
            pid: u32::MAX - 1,
            acquired_at: "2000-01-01T00:00:00Z".to_owned(),
        };
        std::fs::write(
            dead_dir.join(".build.lock"),
            serde_json::to_string(&dead).unwrap(),
        )
        .unwrap();
        // a foreign-host lock, also dead, which must survive the sweep
        let foreign_dir = dirs.build_dir("foreign", "v1.0.0");
        ensure_dir(&foreign_dir).unwrap();
        let foreign = LockInfo {
            host: "some-other-box".to_owned(),
            ..dead.clone()
        };
        std::fs::write(
            foreign_dir.join(".build.lock"),
            serde_json::to_string(&foreign).unwrap(),
        )
        .unwrap();

        let removed = clear_stale_locks(&dirs).unwrap();
        assert_eq!(removed, 1);
        assert!(dirs.build_dir("alive", "v1.0.0").join(".build.lock").exists());
        assert!(!dead_dir.join(".build.lock").exists());
        assert!(foreign_dir.join(".build.lock").exists());
    }

    #[test]
    fn prune_keeps_recent_runs() {
        let dir = TempDir::new().unwrap();
        let dirs = dirs_for(&dir);
        let store = StateStore::new(&dirs);
        for run in ["run-a", "run-b", "run-c"] {
            store.write_record(&record("mytool", "v1.0.0", run)).unwrap();
        }
        // everything is brand new, so nothing is older than the cutoff
        let report = store.prune(30, 1, false).unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.kept, 2);

        // age cutoff of zero days prunes everything beyond keep_last
        let report = store.prune(0, 1, true).unwrap();
        assert_eq!(report.removed.len(), 2);
    }
}
