#![deny(missing_docs)]

//! # dsr-schema
//!
//! This crate exists to serialize and deserialize the wire formats dsr
//! promises to the outside world: the stdout [`Envelope`][], the persisted
//! release [`Manifest`][], the on-disk [`BuildRecord`][], and the host
//! [`HealthReport`][]. Ideally it should be reasonably forward and backward
//! compatible with different versions of these formats.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The manifest schema version this crate reads and writes
pub const MANIFEST_SCHEMA_VERSION: &str = "1.0.0";

/// The literal `tool` value every envelope carries
pub const ENVELOPE_TOOL: &str = "dsr";

/// A local system path on the machine dsr was run.
///
/// This is a String because when deserializing this may be a path format from a different OS!
pub type LocalPath = String;

/// The shape of every dsr command's stdout in `--json` mode
///
/// Exactly one of these is printed per invocation; logs go to stderr.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Envelope {
    /// The subcommand that ran (e.g. `build`, `release-verify`)
    pub command: String,
    /// Aggregated outcome of the command
    pub status: EnvelopeStatus,
    /// The process exit code the command will terminate with
    ///
    /// `status == success` if and only if this is 0.
    pub exit_code: u8,
    /// Unique id of this run (canonical UUID format)
    pub run_id: String,
    /// When the command started, RFC-3339 with a `Z` suffix
    pub started_at: String,
    /// Wall-clock duration of the command in milliseconds
    pub duration_ms: u64,
    /// Always the literal `"dsr"`
    pub tool: String,
    /// The version of dsr that produced this envelope
    pub version: String,
    /// Command-specific payload
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Aggregated outcome of a command
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    /// Everything the command attempted succeeded
    Success,
    /// At least one unit failed but at least one succeeded
    Partial,
    /// The command failed outright
    Error,
}

impl Envelope {
    /// Create an envelope, enforcing the `status ⇔ exit_code` invariant
    ///
    /// A zero exit code forces `success`; a nonzero code with a `success`
    /// status is corrected to `error` rather than shipping a lie.
    pub fn new(
        command: impl Into<String>,
        status: EnvelopeStatus,
        exit_code: u8,
        run_id: impl Into<String>,
        started_at: impl Into<String>,
        duration_ms: u64,
        version: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        let status = match (status, exit_code) {
            (_, 0) => EnvelopeStatus::Success,
            (EnvelopeStatus::Success, _) => EnvelopeStatus::Error,
            (other, _) => other,
        };
        Self {
            command: command.into(),
            status,
            exit_code,
            run_id: run_id.into(),
            started_at: started_at.into(),
            duration_ms,
            tool: ENVELOPE_TOOL.to_owned(),
            version: version.into(),
            details,
        }
    }

    /// Get the JSON Schema for an Envelope
    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(Envelope)
    }
}

/// One file in a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactEntry {
    /// The unique name of the asset (e.g. `mytool-1.2.3-linux-amd64.tar.gz`)
    pub filename: String,
    /// Either an `os/arch` pair or the literal `checksums` / `manifest`
    pub target: String,
    /// Where the file lives on the machine that built it
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<LocalPath>,
    /// SHA-256 of the file contents, 64 lowercase hex chars
    pub sha256: String,
    /// Size of the file in bytes
    pub size_bytes: u64,
}

/// The persisted summary of a `(tool, version)` release
///
/// The round-trip invariant: for every artifact listed here, the asset of
/// that filename in the release has the same size and SHA-256.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Manifest {
    /// Version of this schema (currently `1.0.0`)
    pub schema_version: String,
    /// The tool that was released
    pub tool: String,
    /// The version that was released, as the user wrote it (`v` allowed)
    pub version: String,
    /// The run that produced this manifest
    pub run_id: String,
    /// The git commit the release was built from, if known
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<String>,
    /// When the build finished, RFC-3339 with a `Z` suffix
    pub built_at: String,
    /// Every asset in the release, sorted by `(target, filename)`
    #[serde(default)]
    pub artifacts: Vec<ArtifactEntry>,
}

impl Manifest {
    /// Get the JSON Schema for a Manifest
    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(Manifest)
    }
}

/// Lifecycle of a whole build
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    /// Planned but nothing dispatched yet
    Pending,
    /// At least one host is working
    Running,
    /// Every host completed
    Completed,
    /// Every host failed
    Failed,
    /// Some hosts completed, some failed
    Partial,
}

/// Lifecycle of one host within a build
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    /// Not dispatched yet
    Pending,
    /// Currently building
    Running,
    /// All of this host's targets built
    Completed,
    /// Retry budget exhausted
    Failed,
}

/// Per-host progress inside a [`BuildRecord`][]
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HostAttempt {
    /// Which host this is
    pub host_id: String,
    /// Where the host is in its lifecycle
    pub status: HostStatus,
    /// How many retries have been burned
    #[serde(default)]
    pub retry_count: u32,
    /// The most recent error, if any attempt failed
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// How long the host took, once finished
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// The `os/arch[/triple]` targets this host is responsible for
    #[serde(default)]
    pub targets_covered: Vec<String>,
}

/// The on-disk state of one `(tool, version)` build instance
///
/// Created by the planner, mutated exclusively by executors while the build
/// lock is held, finalised by the publisher. Readers get a point-in-time
/// copy; writes go through atomic rename so they never see a torn file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BuildRecord {
    /// The tool being built
    pub tool: String,
    /// The version being built, as the user wrote it
    pub version: String,
    /// Unique id of the run that owns this record
    pub run_id: String,
    /// Where the build is in its lifecycle
    pub status: BuildStatus,
    /// When the build started, RFC-3339 `Z`
    pub started_at: String,
    /// Progress per host, keyed by host id
    #[serde(default)]
    pub hosts: BTreeMap<String, HostAttempt>,
    /// Every artifact produced so far
    #[serde(default)]
    pub artifacts: Vec<ArtifactEntry>,
    /// The per-run directory that owns all generated files
    pub workspace: LocalPath,
    /// When the record was created, RFC-3339 `Z`
    pub created_at: String,
}

impl BuildRecord {
    /// Get the JSON Schema for a BuildRecord
    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(BuildRecord)
    }

    /// Sort artifacts by `(target, filename)`, the order manifests promise
    pub fn sort_artifacts(&mut self) {
        self.artifacts
            .sort_by(|a, b| (&a.target, &a.filename).cmp(&(&b.target, &b.filename)));
    }
}

/// Health report for a single build host
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HealthReport {
    /// The host this report describes
    pub hostname: String,
    /// Overall verdict: connectivity ok, disk not at error, toolchains present
    pub healthy: bool,
    /// Human-oriented summary (`ok`, `degraded`, `unreachable`)
    pub status: String,
    /// The individual probe results
    pub checks: HealthChecks,
    /// When this probe ran, RFC-3339 `Z` (used for cache TTL)
    pub probed_at: String,
}

/// The individual probes inside a [`HealthReport`][]
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HealthChecks {
    /// Could we reach the host at all?
    pub connectivity: ConnectivityCheck,
    /// Disk headroom on the build volume
    pub disk_space: DiskSpaceCheck,
    /// One entry per capability the host claims
    #[serde(default)]
    pub toolchains: Vec<ToolchainCheck>,
    /// Clock skew between us and the host
    pub clock_drift: ClockDriftCheck,
}

/// Reachability probe result
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConnectivityCheck {
    /// Whether the trivial remote command succeeded
    pub reachable: bool,
    /// How long the probe took
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Why the probe failed, if it did
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Disk headroom probe result
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DiskSpaceCheck {
    /// Percentage of the build volume in use
    pub usage_percent: u8,
    /// `ok` below 90, `warning` below 95, `error` at or above
    pub status: String,
}

/// Toolchain presence probe result
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolchainCheck {
    /// The capability being probed (e.g. `rust`, `go`, `docker`)
    pub name: String,
    /// Whether the binary was found
    pub installed: bool,
    /// Parsed version, where the probe output was parseable
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Clock skew probe result
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClockDriftCheck {
    /// `remote_epoch - local_epoch` in seconds; 0 for the local host
    pub drift_seconds: i64,
}

/// Current UTC time as RFC-3339 with a `Z` suffix and no sub-second noise
pub fn rfc3339_now() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

/// Check whether a string looks like a canonical UUID (8-4-4-4-12 hex)
pub fn looks_like_run_id(s: &str) -> bool {
    let groups: Vec<&str> = s.split('-').collect();
    let lens = [8usize, 4, 4, 4, 12];
    groups.len() == lens.len()
        && groups
            .iter()
            .zip(lens)
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_success_requires_exit_zero() {
        let env = Envelope::new(
            "build",
            EnvelopeStatus::Success,
            6,
            "00000000-0000-0000-0000-000000000000",
            "2024-01-01T00:00:00Z",
            12,
            "0.3.1",
            serde_json::json!({}),
        );
        assert_eq!(env.status, EnvelopeStatus::Error);
        assert_eq!(env.exit_code, 6);
    }

    #[test]
    fn envelope_exit_zero_forces_success() {
        let env = Envelope::new(
            "build",
            EnvelopeStatus::Error,
            0,
            "00000000-0000-0000-0000-000000000000",
            "2024-01-01T00:00:00Z",
            12,
            "0.3.1",
            serde_json::Value::Null,
        );
        assert_eq!(env.status, EnvelopeStatus::Success);
        assert_eq!(env.tool, "dsr");
    }

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::new(
            "version",
            EnvelopeStatus::Success,
            0,
            "8b51ac0e-93d9-4a0e-9f0a-2f9c4a2b7d11",
            "2024-06-01T12:30:00Z",
            3,
            "0.3.1",
            serde_json::json!({"dsr": "0.3.1"}),
        );
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["exit_code"], 0);
        assert_eq!(json["tool"], "dsr");
        assert_eq!(json["details"]["dsr"], "0.3.1");
    }

    #[test]
    fn statuses_serialize_lowercase() {
        insta::assert_snapshot!(
            serde_json::to_string(&EnvelopeStatus::Partial).unwrap(),
            @r#""partial""#
        );
        insta::assert_snapshot!(
            serde_json::to_string(&BuildStatus::Running).unwrap(),
            @r#""running""#
        );
    }

    #[test]
    fn manifest_round_trips() {
        let manifest = Manifest {
            schema_version: MANIFEST_SCHEMA_VERSION.to_owned(),
            tool: "mytool".to_owned(),
            version: "v1.2.3".to_owned(),
            run_id: "8b51ac0e-93d9-4a0e-9f0a-2f9c4a2b7d11".to_owned(),
            git_sha: Some("abc123".to_owned()),
            built_at: "2024-06-01T12:30:00Z".to_owned(),
            artifacts: vec![ArtifactEntry {
                filename: "mytool-1.2.3-linux-amd64.tar.gz".to_owned(),
                target: "linux/amd64".to_owned(),
                path: None,
                sha256: "a".repeat(64),
                size_bytes: 1024,
            }],
        };
        let json = serde_json::to_string(&manifest).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.artifacts, manifest.artifacts);
        assert_eq!(back.schema_version, "1.0.0");
    }

    #[test]
    fn build_record_artifact_ordering() {
        let mut record = BuildRecord {
            tool: "mytool".to_owned(),
            version: "v1.0.0".to_owned(),
            run_id: "8b51ac0e-93d9-4a0e-9f0a-2f9c4a2b7d11".to_owned(),
            status: BuildStatus::Completed,
            started_at: "2024-06-01T12:30:00Z".to_owned(),
            hosts: BTreeMap::new(),
            artifacts: vec![
                ArtifactEntry {
                    filename: "z.tar.gz".to_owned(),
                    target: "linux/amd64".to_owned(),
                    path: None,
                    sha256: "a".repeat(64),
                    size_bytes: 1,
                },
                ArtifactEntry {
                    filename: "SHA256SUMS".to_owned(),
                    target: "checksums".to_owned(),
                    path: None,
                    sha256: "b".repeat(64),
                    size_bytes: 2,
                },
                ArtifactEntry {
                    filename: "a.tar.gz".to_owned(),
                    target: "linux/amd64".to_owned(),
                    path: None,
                    sha256: "c".repeat(64),
                    size_bytes: 3,
                },
            ],
            workspace: "/tmp/work".to_owned(),
            created_at: "2024-06-01T12:30:00Z".to_owned(),
        };
        record.sort_artifacts();
        let names: Vec<&str> = record.artifacts.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, ["SHA256SUMS", "a.tar.gz", "z.tar.gz"]);
    }

    #[test]
    fn run_id_pattern() {
        assert!(looks_like_run_id("8b51ac0e-93d9-4a0e-9f0a-2f9c4a2b7d11"));
        assert!(!looks_like_run_id("8b51ac0e-93d9-4a0e-9f0a"));
        assert!(!looks_like_run_id("not-a-uuid-at-all-nope"));
        assert!(!looks_like_run_id(""));
    }

    #[test]
    fn rfc3339_now_has_z_suffix() {
        let now = rfc3339_now();
        assert!(now.ends_with('Z'));
        assert_eq!(now.len(), 20);
    }

    #[test]
    fn emit() {
        let schema = Envelope::json_schema();
        let json_schema = serde_json::to_string_pretty(&schema).unwrap();
        assert!(json_schema.contains("\"exit_code\""));
        let schema = Manifest::json_schema();
        let json_schema = serde_json::to_string_pretty(&schema).unwrap();
        assert!(json_schema.contains("\"schema_version\""));
    }
}
