use std::path::Path;
use std::process::{Command, Output, Stdio};

static BIN: &str = env!("CARGO_BIN_EXE_dsr");

fn format_outputs(output: &Output) -> String {
    let stdout = std::str::from_utf8(&output.stdout).unwrap();
    let stderr = std::str::from_utf8(&output.stderr).unwrap();
    format!("stdout:\n{stdout}\nstderr:\n{stderr}")
}

/// Run dsr with its three roots pinned inside a temp dir
fn dsr(root: &Path, args: &[&str]) -> Output {
    Command::new(BIN)
        .args(args)
        .env("DSR_CONFIG_DIR", root.join("config"))
        .env("DSR_STATE_DIR", root.join("state"))
        .env("DSR_CACHE_DIR", root.join("cache"))
        .env_remove("DSR_RUN_ID")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .unwrap()
}

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

/// A config dir with one local host and one buildable tool
fn seed_config(root: &Path) {
    write(
        root,
        "config/hosts.yaml",
        r#"
hosts:
  local:
    platform: linux/amd64
    connection: local
    concurrency: 2
"#,
    );
    let tree = root.join("tree");
    std::fs::create_dir_all(&tree).unwrap();
    std::fs::write(tree.join("VERSION"), "v1.2.3\n").unwrap();
    write(
        root,
        "config/repos.d/mytool.yaml",
        &format!(
            r#"
repo: me/mytool
local_path: {}
build_cmd: mkdir -p dist && printf mytool-payload > dist/mytool
targets: [linux/amd64]
"#,
            tree.display()
        ),
    );
}

fn envelope(output: &Output) -> serde_json::Value {
    let stdout = std::str::from_utf8(&output.stdout).unwrap();
    serde_json::from_str(stdout).unwrap_or_else(|e| {
        panic!("stdout was not a single JSON envelope ({e}):\n{stdout}")
    })
}

#[test]
fn test_version_flag() {
    let output = Command::new(BIN)
        .arg("-V")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", format_outputs(&output));
    let stdout = String::from_utf8(output.stdout).unwrap();
    let (name, ver) = stdout.trim().split_once(' ').unwrap();
    assert_eq!(name, "dsr");
    let mut parts = ver.split('.');
    parts.next().unwrap().parse::<u8>().unwrap();
    parts.next().unwrap().parse::<u8>().unwrap();
}

#[test]
fn test_version_envelope() {
    let dir = temp_dir::TempDir::new().unwrap();
    let output = dsr(dir.path(), &["--json", "version"]);
    assert!(output.status.success(), "{}", format_outputs(&output));

    let env = envelope(&output);
    assert_eq!(env["command"], "version");
    assert_eq!(env["status"], "success");
    assert_eq!(env["exit_code"], 0);
    assert_eq!(env["tool"], "dsr");
    // run_id is a canonical uuid
    let run_id = env["run_id"].as_str().unwrap();
    assert_eq!(run_id.split('-').count(), 5);
    // started_at is RFC-3339 with a Z
    let started = env["started_at"].as_str().unwrap();
    assert!(started.ends_with('Z'), "{started}");
    assert!(env["duration_ms"].is_u64());
}

#[test]
fn test_run_id_env_override() {
    let dir = temp_dir::TempDir::new().unwrap();
    let output = Command::new(BIN)
        .args(["--json", "version"])
        .env("DSR_CONFIG_DIR", dir.path().join("config"))
        .env("DSR_STATE_DIR", dir.path().join("state"))
        .env("DSR_CACHE_DIR", dir.path().join("cache"))
        .env("DSR_RUN_ID", "8b51ac0e-93d9-4a0e-9f0a-2f9c4a2b7d11")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .unwrap();
    let env = envelope(&output);
    assert_eq!(env["run_id"], "8b51ac0e-93d9-4a0e-9f0a-2f9c4a2b7d11");
}

#[test]
fn test_unknown_tool_exits_4() {
    let dir = temp_dir::TempDir::new().unwrap();
    seed_config(dir.path());
    let output = dsr(dir.path(), &["--json", "build", "--tool", "ghost"]);
    assert_eq!(output.status.code(), Some(4), "{}", format_outputs(&output));
    let env = envelope(&output);
    assert_eq!(env["status"], "error");
    assert_eq!(env["exit_code"], 4);
    assert!(env["details"]["error"]
        .as_str()
        .unwrap()
        .contains("ghost"));
}

#[test]
fn test_conflicting_class_filters_exit_4() {
    let dir = temp_dir::TempDir::new().unwrap();
    seed_config(dir.path());
    let output = dsr(
        dir.path(),
        &[
            "--json",
            "build",
            "--tool",
            "mytool",
            "--only-act",
            "--only-native",
        ],
    );
    assert_eq!(output.status.code(), Some(4), "{}", format_outputs(&output));
    let env = envelope(&output);
    assert!(env["details"]["error"]
        .as_str()
        .unwrap()
        .contains("mutually exclusive"));

    let output = dsr(
        dir.path(),
        &[
            "--json",
            "build",
            "--tool",
            "mytool",
            "--sync-only",
            "--no-sync",
        ],
    );
    assert_eq!(output.status.code(), Some(4), "{}", format_outputs(&output));
}

#[test]
fn test_build_dry_run_plans_only() {
    let dir = temp_dir::TempDir::new().unwrap();
    seed_config(dir.path());
    let output = dsr(
        dir.path(),
        &["--json", "--dry-run", "build", "--tool", "mytool"],
    );
    assert!(output.status.success(), "{}", format_outputs(&output));
    let env = envelope(&output);
    assert_eq!(env["details"]["dry_run"], true);
    let plan = &env["details"]["plan"]["targets"];
    assert_eq!(plan.as_array().unwrap().len(), 1);
    assert_eq!(
        plan[0]["expected"]["versioned"],
        "mytool-1.2.3-linux-amd64.tar.gz"
    );
    // plan-only: no state was created
    assert!(!dir.path().join("state").join("builds").exists());
}

#[test]
fn test_happy_build_local_no_release() {
    let dir = temp_dir::TempDir::new().unwrap();
    seed_config(dir.path());
    let output = dsr(
        dir.path(),
        &["--json", "build", "--tool", "mytool", "--no-release"],
    );
    assert!(output.status.success(), "{}", format_outputs(&output));
    let env = envelope(&output);
    assert_eq!(env["status"], "success");
    // versioned + compat + SHA256SUMS + manifest
    assert_eq!(env["details"]["artifacts_count"], 4);

    let artifacts = dir.path().join("state/artifacts/mytool/v1.2.3");
    assert!(artifacts.join("mytool-1.2.3-linux-amd64.tar.gz").exists());
    assert!(artifacts.join("mytool-linux-amd64.tar.gz").exists());
    assert!(artifacts.join("SHA256SUMS").exists());
    assert!(artifacts.join("mytool-v1.2.3-manifest.json").exists());

    // SHA256SUMS: "<64 hex>  *<name>", sorted, trailing newline
    let sums = std::fs::read_to_string(artifacts.join("SHA256SUMS")).unwrap();
    assert!(sums.ends_with('\n'));
    let lines: Vec<&str> = sums.lines().collect();
    assert_eq!(lines.len(), 2);
    for line in &lines {
        let (hash, rest) = line.split_at(64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(rest.starts_with("  *"), "{line}");
    }
    let mut sorted = lines.clone();
    sorted.sort();
    assert_eq!(lines, sorted);

    // the manifest round-trips and lists both archives plus the checksums
    let manifest: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(artifacts.join("mytool-v1.2.3-manifest.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["schema_version"], "1.0.0");
    assert_eq!(manifest["tool"], "mytool");
    assert_eq!(manifest["version"], "v1.2.3");
    assert_eq!(manifest["artifacts"].as_array().unwrap().len(), 3);

    // the state record landed and is completed
    let state_file = dir
        .path()
        .join("state/builds/mytool/v1.2.3/latest/state.json");
    let record: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(state_file).unwrap()).unwrap();
    assert_eq!(record["status"], "completed");
    assert_eq!(record["hosts"]["local"]["status"], "completed");
}

#[test]
fn test_build_is_deterministic_across_runs() {
    let dir = temp_dir::TempDir::new().unwrap();
    seed_config(dir.path());
    let artifacts = dir.path().join("state/artifacts/mytool/v1.2.3");

    let output = dsr(
        dir.path(),
        &["--json", "build", "--tool", "mytool", "--no-release"],
    );
    assert!(output.status.success(), "{}", format_outputs(&output));
    let first = std::fs::read(artifacts.join("mytool-1.2.3-linux-amd64.tar.gz")).unwrap();

    let output = dsr(
        dir.path(),
        &["--json", "build", "--tool", "mytool", "--no-release"],
    );
    assert!(output.status.success(), "{}", format_outputs(&output));
    let second = std::fs::read(artifacts.join("mytool-1.2.3-linux-amd64.tar.gz")).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_partial_build_then_resume() {
    let dir = temp_dir::TempDir::new().unwrap();
    let root = dir.path();
    write(
        root,
        "config/config.yaml",
        "retry_attempts: 2\nretry_base_delay_secs: 0\n",
    );
    // two "hosts", both this machine, covering two platforms
    write(
        root,
        "config/hosts.yaml",
        r#"
hosts:
  local:
    platform: linux/amd64
    connection: local
  darwinbox:
    platform: darwin/arm64
    connection: local
"#,
    );
    let tree = root.join("tree");
    std::fs::create_dir_all(&tree).unwrap();
    std::fs::write(tree.join("VERSION"), "v1.2.3\n").unwrap();
    let trip_file = root.join("fail-darwin");
    write(
        root,
        "config/repos.d/mytool.yaml",
        &format!(
            r#"
repo: me/mytool
local_path: {tree}
build_cmd: 'mkdir -p dist && if [ "$TARGET_OS" = darwin ] && [ -f {trip} ]; then exit 1; fi; printf payload-$TARGET_OS > dist/mytool'
targets: [linux/amd64, darwin/arm64]
"#,
            tree = tree.display(),
            trip = trip_file.display(),
        ),
    );

    // first run: the darwin host is broken
    std::fs::write(&trip_file, b"").unwrap();
    let output = dsr(
        root,
        &[
            "--json",
            "build",
            "--tool",
            "mytool",
            "--no-release",
            "--parallel",
            "1",
        ],
    );
    assert_eq!(output.status.code(), Some(1), "{}", format_outputs(&output));
    let env = envelope(&output);
    assert_eq!(env["status"], "partial");
    assert_eq!(env["details"]["hosts"]["darwinbox"]["status"], "failed");
    assert_eq!(env["details"]["hosts"]["darwinbox"]["retry_count"], 1);
    assert_eq!(env["details"]["hosts"]["local"]["status"], "completed");
    let first_run_id = env["details"]["run_id"].as_str().unwrap().to_owned();

    let artifacts = root.join("state/artifacts/mytool/v1.2.3");
    assert!(artifacts.join("mytool-1.2.3-linux-amd64.tar.gz").exists());
    assert!(!artifacts.join("mytool-1.2.3-darwin-arm64.tar.gz").exists());
    let linux_mtime = std::fs::metadata(artifacts.join("mytool-1.2.3-linux-amd64.tar.gz"))
        .unwrap()
        .modified()
        .unwrap();

    // second run: host restored; only darwin/arm64 is re-dispatched
    std::fs::remove_file(&trip_file).unwrap();
    let output = dsr(
        root,
        &[
            "--json",
            "build",
            "--tool",
            "mytool",
            "--no-release",
            "--parallel",
            "1",
        ],
    );
    assert!(output.status.success(), "{}", format_outputs(&output));
    let env = envelope(&output);
    assert_eq!(env["status"], "success");
    // the record was resumed, not replaced
    assert_eq!(env["details"]["run_id"], first_run_id.as_str());
    assert_eq!(env["details"]["hosts"]["darwinbox"]["status"], "completed");
    // 2 versioned + 2 compat + SHA256SUMS + manifest
    assert_eq!(env["details"]["artifacts_count"], 6);

    assert!(artifacts.join("mytool-1.2.3-darwin-arm64.tar.gz").exists());
    // the completed host was not re-dispatched: its archive is untouched
    let linux_mtime_after = std::fs::metadata(artifacts.join("mytool-1.2.3-linux-amd64.tar.gz"))
        .unwrap()
        .modified()
        .unwrap();
    assert_eq!(linux_mtime, linux_mtime_after);

    // the final manifest covers both targets
    let manifest: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(artifacts.join("mytool-v1.2.3-manifest.json")).unwrap(),
    )
    .unwrap();
    let names: Vec<&str> = manifest["artifacts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["filename"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"mytool-1.2.3-linux-amd64.tar.gz"));
    assert!(names.contains(&"mytool-1.2.3-darwin-arm64.tar.gz"));
    assert!(names.contains(&"SHA256SUMS"));
}

#[test]
fn test_lock_contention_exits_4() {
    let dir = temp_dir::TempDir::new().unwrap();
    seed_config(dir.path());

    // plant a live lock owned by this test process
    let lock_dir = dir.path().join("state/builds/mytool/v1.2.3");
    std::fs::create_dir_all(&lock_dir).unwrap();
    let lock = serde_json::json!({
        "run_id": "11111111-2222-3333-4444-555555555555",
        "host": hostname::get().unwrap().into_string().unwrap(),
        "pid": std::process::id(),
        "acquired_at": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    });
    std::fs::write(lock_dir.join(".build.lock"), lock.to_string()).unwrap();

    let output = dsr(dir.path(), &["--json", "build", "--tool", "mytool"]);
    assert_eq!(output.status.code(), Some(4), "{}", format_outputs(&output));
    let env = envelope(&output);
    let error = env["details"]["error"].as_str().unwrap();
    assert!(error.contains("11111111-2222-3333-4444-555555555555"), "{error}");
    assert!(error.contains(&std::process::id().to_string()), "{error}");
}

#[test]
fn test_repos_list_and_validate_advisory() {
    let dir = temp_dir::TempDir::new().unwrap();
    seed_config(dir.path());
    // a second tool whose compat template drops the version token
    write(
        dir.path(),
        "config/repos.d/warned.yaml",
        r#"
repo: me/warned
build_cmd: make
artifact_naming: "${name}-${version}-${os}-${arch}"
install_script_compat: "${name}-${os}-${arch}"
"#,
    );

    let output = dsr(dir.path(), &["--json", "repos", "list"]);
    assert!(output.status.success(), "{}", format_outputs(&output));
    let env = envelope(&output);
    let tools = env["details"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 2);

    let output = dsr(dir.path(), &["--json", "repos", "validate", "warned"]);
    assert!(output.status.success(), "{}", format_outputs(&output));
    let env = envelope(&output);
    assert_eq!(env["details"]["status"], "warn");
    let report = &env["details"]["tools"]["warned"];
    assert_eq!(report["status"], "warn");
    let recommendations = report["templates"]["recommendations"].as_array().unwrap();
    assert!(!recommendations.is_empty());
    // advisory never fails the command
    assert_eq!(env["exit_code"], 0);
}

#[test]
fn test_quality_skip_checks() {
    let dir = temp_dir::TempDir::new().unwrap();
    seed_config(dir.path());
    write(
        dir.path(),
        "config/repos.d/gated.yaml",
        &format!(
            r#"
repo: me/gated
local_path: {}
build_cmd: make
checks: ["false"]
"#,
            dir.path().join("tree").display()
        ),
    );

    // the configured check fails...
    let output = dsr(dir.path(), &["--json", "quality", "--tool", "gated"]);
    assert_eq!(output.status.code(), Some(6), "{}", format_outputs(&output));

    // ...but --skip-checks records the skip and exits 0 regardless
    let output = dsr(
        dir.path(),
        &["--json", "quality", "--tool", "gated", "--skip-checks"],
    );
    assert!(output.status.success(), "{}", format_outputs(&output));
    let env = envelope(&output);
    assert_eq!(env["details"]["skipped"], true);
}

#[test]
fn test_health_check_local_host() {
    let dir = temp_dir::TempDir::new().unwrap();
    seed_config(dir.path());
    let output = dsr(dir.path(), &["--json", "health", "check", "local"]);
    // exit 0 when healthy, 1 when e.g. the disk is nearly full; both are
    // valid probe outcomes on a shared machine
    assert!(matches!(output.status.code(), Some(0 | 1)), "{}", format_outputs(&output));
    let env = envelope(&output);
    let report = &env["details"]["hosts"]["local"];
    assert_eq!(report["checks"]["connectivity"]["reachable"], true);
    assert_eq!(report["checks"]["clock_drift"]["drift_seconds"], 0);
    assert!(report["checks"]["disk_space"]["usage_percent"].is_u64());

    // the probe was cached
    assert!(dir.path().join("cache/health/local.json").exists());
    let output = dsr(dir.path(), &["--json", "health", "clear-cache"]);
    assert!(output.status.success());
    assert!(!dir.path().join("cache/health/local.json").exists());
}

#[test]
fn test_status_reports_builds() {
    let dir = temp_dir::TempDir::new().unwrap();
    seed_config(dir.path());
    let output = dsr(
        dir.path(),
        &["--json", "build", "--tool", "mytool", "--no-release"],
    );
    assert!(output.status.success(), "{}", format_outputs(&output));

    let output = dsr(dir.path(), &["--json", "status"]);
    assert!(output.status.success(), "{}", format_outputs(&output));
    let env = envelope(&output);
    let builds = env["details"]["builds"].as_array().unwrap();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0]["tool"], "mytool");
    assert_eq!(builds[0]["version"], "v1.2.3");
    assert_eq!(builds[0]["status"], "completed");
}

#[test]
fn test_prune_requires_force() {
    let dir = temp_dir::TempDir::new().unwrap();
    seed_config(dir.path());
    let output = dsr(
        dir.path(),
        &["--json", "build", "--tool", "mytool", "--no-release"],
    );
    assert!(output.status.success(), "{}", format_outputs(&output));

    // without --force nothing is deleted
    let output = dsr(dir.path(), &["--json", "prune", "--max-age", "0", "--keep-last", "0"]);
    assert!(output.status.success());
    let env = envelope(&output);
    assert_eq!(env["details"]["dry_run"], true);
    let state_root = dir.path().join("state/builds/mytool/v1.2.3");
    let runs_before = std::fs::read_dir(&state_root).unwrap().count();
    assert!(runs_before >= 2); // run dir + latest pointer

    let output = dsr(
        dir.path(),
        &[
            "--json", "prune", "--max-age", "0", "--keep-last", "0", "--force",
        ],
    );
    assert!(output.status.success(), "{}", format_outputs(&output));
    let env = envelope(&output);
    assert_eq!(env["details"]["dry_run"], false);
}

#[test]
fn test_stdout_is_clean_in_json_mode() {
    let dir = temp_dir::TempDir::new().unwrap();
    seed_config(dir.path());
    let output = dsr(
        dir.path(),
        &[
            "--json",
            "--verbose",
            "info",
            "build",
            "--tool",
            "mytool",
            "--no-release",
        ],
    );
    assert!(output.status.success(), "{}", format_outputs(&output));
    // even with info logging on, stdout parses as exactly one JSON object
    envelope(&output);
}
