//! The layered on-disk config store
//!
//! Three layers, later wins for overlapping keys:
//!
//! 1. `config.yaml`: global settings
//! 2. `hosts.yaml`: the build host inventory
//! 3. `repos.d/<tool>.yaml`: one tool definition per file
//!
//! A legacy single-file layout (`repos.yaml` with a top-level `tools` map) is
//! still read; `repos.d` entries override it. The loaded [`Snapshot`][] is
//! immutable for the rest of the run.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tracing::warn;

use crate::dirs::AppDirs;
use crate::errors::{DsrError, DsrResult};
use crate::naming::{self, Template};
use crate::platform::{default_targets, ArchiveFormat, Os, TargetPair};

/// Global settings from `config.yaml`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Cap on simultaneously-building targets; defaults to the sum of host
    /// concurrency when unset
    #[serde(default)]
    pub parallel: Option<usize>,
    /// Whether releases are created as drafts unless overridden
    #[serde(default)]
    pub draft_releases: bool,
    /// Health cache freshness window
    #[serde(default = "default_health_ttl")]
    pub health_ttl_secs: u64,
    /// Per-host retry budget for build dispatch
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Backoff base delay between attempts, in seconds
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: u64,
    /// Concurrent asset uploads against the GitHub API
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// Hard deadline for a single remote build command
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
    /// How often `dsr watch` polls upstream CI
    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,
}

fn default_health_ttl() -> u64 {
    300
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_delay() -> u64 {
    5
}
fn default_upload_concurrency() -> usize {
    4
}
fn default_build_timeout() -> u64 {
    3600
}
fn default_watch_interval() -> u64 {
    300
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            parallel: None,
            draft_releases: false,
            health_ttl_secs: default_health_ttl(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_secs: default_retry_base_delay(),
            upload_concurrency: default_upload_concurrency(),
            build_timeout_secs: default_build_timeout(),
            watch_interval_secs: default_watch_interval(),
        }
    }
}

/// How we reach a build host
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connection {
    /// This machine
    Local,
    /// A remote machine reached over ssh
    Ssh,
}

/// One build host from `hosts.yaml`
#[derive(Debug, Clone, Deserialize)]
pub struct Host {
    /// The inventory key; filled in from the map key at load time
    #[serde(default)]
    pub id: String,
    /// The `os/arch` this host builds natively
    pub platform: TargetPair,
    /// How we reach it
    pub connection: Connection,
    /// The ssh destination (`user@host` or an ssh_config alias)
    #[serde(default)]
    pub ssh_host: Option<String>,
    /// Connect timeout for ssh probes and commands
    #[serde(default = "default_ssh_timeout")]
    pub ssh_timeout_s: u64,
    /// Toolchains the host claims to have (`rust`, `go`, `docker`, ...)
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Max parallel builds this host will accept
    #[serde(default = "default_host_concurrency")]
    pub concurrency: usize,
    /// Free-form description for humans
    #[serde(default)]
    pub description: Option<String>,
}

fn default_ssh_timeout() -> u64 {
    10
}
fn default_host_concurrency() -> usize {
    1
}

impl Host {
    /// Whether this host is this machine
    pub fn is_local(&self) -> bool {
        self.connection == Connection::Local
    }
}

/// The language a tool is written in; drives version detection
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Version from Cargo.toml
    Rust,
    /// Version from a go.mod-adjacent VERSION file (go has no manifest version)
    Go,
    /// Version from package.json
    Node,
    /// Version from pyproject.toml
    Python,
    /// Version from a VERSION file only
    #[default]
    Generic,
}

/// One releasable tool from `repos.d/<tool>.yaml`
///
/// The build contract: `build_cmd` runs in the working tree with
/// `$TARGET_OS`, `$TARGET_ARCH`, `$VERSION` (and `$TARGET_TRIPLE` when one
/// applies) exported, and must leave the binary at
/// `dist/<binary_name><exe_suffix>` relative to the tree.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolSpec {
    /// The tool name; filled from the file stem or map key when omitted
    #[serde(default)]
    pub name: String,
    /// `owner/name` on GitHub
    #[serde(default)]
    pub repo: Option<String>,
    /// The local working tree
    #[serde(default)]
    pub local_path: Option<Utf8PathBuf>,
    /// What the tool is written in
    #[serde(default)]
    pub language: Language,
    /// The shell command that produces the binary
    pub build_cmd: String,
    /// The binary's base name; defaults to the tool name
    #[serde(default)]
    pub binary_name: Option<String>,
    /// The `os/arch` matrix; defaults to linux/amd64, darwin/arm64, windows/amd64
    #[serde(default)]
    pub targets: Vec<TargetPair>,
    /// Per-os archive format overrides, keyed by os token
    #[serde(default)]
    pub archive_format: BTreeMap<String, ArchiveFormat>,
    /// The versioned asset name template
    #[serde(default)]
    pub artifact_naming: Option<String>,
    /// The legacy install-script name template
    #[serde(default)]
    pub install_script_compat: Option<String>,
    /// Optional triple axis per `os/arch`
    #[serde(default)]
    pub target_triples: BTreeMap<String, Vec<String>>,
    /// Which upstream workflow job builds each `os/arch` under act
    #[serde(default)]
    pub act_job_map: BTreeMap<String, String>,
    /// Path to the upstream CI workflow file, relative to the working tree
    #[serde(default)]
    pub workflow: Option<Utf8PathBuf>,
    /// Ordered quality-gate commands for `dsr quality`
    #[serde(default)]
    pub checks: Vec<String>,
    /// Where the working tree lives on each remote host
    #[serde(default)]
    pub host_paths: BTreeMap<String, Utf8PathBuf>,
}

impl ToolSpec {
    /// The binary base name (tool name unless overridden)
    pub fn binary_name(&self) -> &str {
        self.binary_name.as_deref().unwrap_or(&self.name)
    }

    /// The archive format for an os: the per-os override or the os default
    pub fn archive_format_for(&self, os: Os) -> ArchiveFormat {
        self.archive_format
            .get(os.as_str())
            .copied()
            .unwrap_or_else(|| ArchiveFormat::default_for(os))
    }

    /// The parsed versioned-name template
    pub fn template(&self) -> DsrResult<Template> {
        Template::parse(
            self.artifact_naming
                .as_deref()
                .unwrap_or(naming::DEFAULT_TEMPLATE),
        )
    }

    /// The parsed compat-name template
    pub fn compat_template(&self) -> DsrResult<Template> {
        Template::parse(
            self.install_script_compat
                .as_deref()
                .unwrap_or(naming::DEFAULT_COMPAT_TEMPLATE),
        )
    }

    /// The absolute workflow path, when both a tree and a workflow are set
    pub fn workflow_path(&self) -> Option<Utf8PathBuf> {
        match (&self.local_path, &self.workflow) {
            (Some(tree), Some(wf)) => Some(tree.join(wf)),
            _ => None,
        }
    }

    fn validate(&self, origin: &Utf8Path) -> DsrResult<()> {
        if self.repo.is_none() && self.local_path.is_none() {
            return Err(DsrError::ConfigInvalid {
                path: origin.to_owned(),
                reason: format!("tool '{}' sets neither repo nor local_path", self.name),
            });
        }
        if let Some(repo) = &self.repo {
            let mut parts = repo.splitn(2, '/');
            let owner = parts.next().unwrap_or_default();
            let name = parts.next().unwrap_or_default();
            if owner.is_empty() || name.is_empty() || name.contains('/') {
                return Err(DsrError::ConfigInvalid {
                    path: origin.to_owned(),
                    reason: format!("repo '{repo}' is not in owner/name form"),
                });
            }
        }
        if self.build_cmd.trim().is_empty() {
            return Err(DsrError::ConfigInvalid {
                path: origin.to_owned(),
                reason: format!("tool '{}' has an empty build_cmd", self.name),
            });
        }
        if let Some(workflow) = self.workflow_path() {
            if !workflow.exists() {
                return Err(DsrError::ConfigInvalid {
                    path: origin.to_owned(),
                    reason: format!("workflow file {workflow} does not exist"),
                });
            }
        }
        // archive_format keys are os tokens; act_job_map keys are os/arch pairs
        for key in self.archive_format.keys().chain(self.act_job_map.keys()) {
            let os_token = key.split('/').next().unwrap_or(key);
            os_token.parse::<Os>().map_err(|_| DsrError::ConfigInvalid {
                path: origin.to_owned(),
                reason: format!("unknown os '{os_token}' in tool '{}'", self.name),
            })?;
        }
        // surface template problems at load time, not mid-build
        self.template()?;
        self.compat_template()?;
        Ok(())
    }

    /// Compare against a sibling `.goreleaser.yaml`, if one exists
    ///
    /// Divergence is reported as warnings, never as errors; goreleaser stays
    /// the source of truth for people who use it and we just point at drift.
    pub fn goreleaser_advisories(&self) -> Vec<String> {
        let Some(tree) = &self.local_path else {
            return Vec::new();
        };
        let path = tree.join(".goreleaser.yaml");
        let Ok(text) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        let Ok(doc) = serde_yml::from_str::<serde_yml::Value>(&text) else {
            return vec![format!("{path} exists but is not valid YAML")];
        };
        let mut advisories = Vec::new();
        if let Some(build) = doc
            .get("builds")
            .and_then(|b| b.as_sequence())
            .and_then(|s| s.first())
        {
            let goos: Vec<String> = build
                .get("goos")
                .and_then(|v| v.as_sequence())
                .map(|s| {
                    s.iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default();
            for os in &goos {
                let covered = self.targets.iter().any(|t| t.os.as_str() == os);
                if !covered {
                    advisories
                        .push(format!("goreleaser builds for {os} but the target matrix does not"));
                }
            }
        }
        if let Some(name_template) = doc
            .get("archives")
            .and_then(|a| a.as_sequence())
            .and_then(|s| s.first())
            .and_then(|a| a.get("name_template"))
            .and_then(|v| v.as_str())
        {
            let ours = self
                .artifact_naming
                .as_deref()
                .unwrap_or(naming::DEFAULT_TEMPLATE);
            let has_version = name_template.contains("Version");
            let ours_has_version = ours.contains("${version}");
            if has_version != ours_has_version {
                advisories.push(format!(
                    "goreleaser name_template '{name_template}' disagrees with artifact_naming '{ours}' on the version token"
                ));
            }
        }
        if let Some(format) = doc
            .get("archives")
            .and_then(|a| a.as_sequence())
            .and_then(|s| s.first())
            .and_then(|a| a.get("format"))
            .and_then(|v| v.as_str())
        {
            let ours = self.archive_format_for(Os::Linux).ext();
            if format != ours {
                advisories.push(format!(
                    "goreleaser archives use '{format}' but dsr would pack '{ours}'"
                ));
            }
        }
        advisories
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HostsFile {
    Wrapped {
        hosts: BTreeMap<String, Host>,
    },
    Plain(BTreeMap<String, Host>),
}

#[derive(Debug, Deserialize)]
struct LegacyReposFile {
    #[serde(default)]
    tools: BTreeMap<String, ToolSpec>,
}

/// The immutable, validated view of all config layers
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Global settings
    pub settings: GlobalSettings,
    hosts: BTreeMap<String, Host>,
    tools: BTreeMap<String, ToolSpec>,
    /// Where the layers were read from
    pub config_dir: Utf8PathBuf,
}

fn parse_yaml<T: serde::de::DeserializeOwned>(path: &Utf8Path) -> DsrResult<T> {
    let text = std::fs::read_to_string(path)?;
    serde_yml::from_str(&text).map_err(|details| DsrError::ConfigParse {
        path: path.to_owned(),
        details,
    })
}

impl Snapshot {
    /// Load and validate every layer
    pub fn load(dirs: &AppDirs) -> DsrResult<Self> {
        let config_dir = dirs.config_dir.clone();

        let settings_path = config_dir.join("config.yaml");
        let settings = if settings_path.exists() {
            parse_yaml(&settings_path)?
        } else {
            GlobalSettings::default()
        };

        let hosts_path = config_dir.join("hosts.yaml");
        let mut hosts = if hosts_path.exists() {
            match parse_yaml::<HostsFile>(&hosts_path)? {
                HostsFile::Wrapped { hosts } | HostsFile::Plain(hosts) => hosts,
            }
        } else {
            BTreeMap::new()
        };
        for (id, host) in hosts.iter_mut() {
            host.id = id.clone();
            if host.connection == Connection::Ssh && host.ssh_host.is_none() {
                return Err(DsrError::ConfigInvalid {
                    path: hosts_path.clone(),
                    reason: format!("host '{id}' is ssh but has no ssh_host"),
                });
            }
            if host.concurrency == 0 {
                return Err(DsrError::ConfigInvalid {
                    path: hosts_path.clone(),
                    reason: format!("host '{id}' has concurrency 0"),
                });
            }
        }

        // legacy single-file layout first, repos.d overrides
        let mut tools: BTreeMap<String, ToolSpec> = BTreeMap::new();
        let legacy_path = config_dir.join("repos.yaml");
        if legacy_path.exists() {
            let legacy: LegacyReposFile = parse_yaml(&legacy_path)?;
            for (name, mut spec) in legacy.tools {
                spec.name = name.clone();
                tools.insert(name, spec);
            }
        }
        let repos_d = config_dir.join("repos.d");
        if repos_d.is_dir() {
            let mut entries: Vec<Utf8PathBuf> = Vec::new();
            for entry in repos_d.read_dir_utf8()? {
                let entry = entry?;
                let path = entry.path();
                if path.extension() == Some("yaml") || path.extension() == Some("yml") {
                    entries.push(path.to_owned());
                }
            }
            entries.sort();
            for path in entries {
                let mut spec: ToolSpec = parse_yaml(&path)?;
                if spec.name.is_empty() {
                    spec.name = path
                        .file_stem()
                        .unwrap_or_default()
                        .to_owned();
                }
                if let Some(previous) = tools.insert(spec.name.clone(), spec) {
                    warn!(
                        "tool '{}' from repos.yaml is overridden by repos.d",
                        previous.name
                    );
                }
            }
        }

        let snapshot = Self {
            settings,
            hosts,
            tools,
            config_dir,
        };
        for spec in snapshot.tools.values() {
            let origin = snapshot.tool_origin(&spec.name);
            spec.validate(&origin)?;
            for advisory in spec.goreleaser_advisories() {
                warn!(tool = spec.name.as_str(), "{advisory}");
            }
        }
        Ok(snapshot)
    }

    fn tool_origin(&self, name: &str) -> Utf8PathBuf {
        let per_tool = self.config_dir.join("repos.d").join(format!("{name}.yaml"));
        if per_tool.exists() {
            per_tool
        } else {
            self.config_dir.join("repos.yaml")
        }
    }

    /// Look up one tool
    pub fn get_tool(&self, name: &str) -> DsrResult<&ToolSpec> {
        self.tools.get(name).ok_or_else(|| DsrError::ConfigNotFound {
            tool: name.to_owned(),
        })
    }

    /// Every configured tool name, sorted
    pub fn list_tools(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Look up one host
    pub fn get_host(&self, id: &str) -> DsrResult<&Host> {
        self.hosts.get(id).ok_or_else(|| DsrError::ConfigInvalid {
            path: self.config_dir.join("hosts.yaml"),
            reason: format!("no host '{id}' in the inventory"),
        })
    }

    /// Every host, sorted by id
    pub fn list_hosts(&self) -> Vec<&Host> {
        self.hosts.values().collect()
    }

    /// The matrix of a tool with its defaults applied
    pub fn targets_for(&self, spec: &ToolSpec) -> Vec<TargetPair> {
        if spec.targets.is_empty() {
            default_targets()
        } else {
            spec.targets.clone()
        }
    }
}
