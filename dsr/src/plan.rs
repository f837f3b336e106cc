//! The build planner
//!
//! All work is precomputed before anything executes: the target matrix is
//! expanded, each target is classified as `act` or `native`, a host is
//! resolved for it, and its final asset names are locked in through the
//! naming engine. Discovering work mid-build is a mess; a deterministic plan
//! also means `--dry-run` can report exactly what would happen.

use itertools::Itertools;
use serde::Serialize;

use crate::config::{Host, Snapshot, ToolSpec};
use crate::errors::{DsrError, DsrResult};
use crate::naming::{self, DualName, NameContext};
use crate::platform::{ArchiveFormat, Os, TargetPair};

/// Whether a target builds in a container or on a native host
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetClass {
    /// Built inside a container by act, using the upstream CI workflow
    Act,
    /// Built on a host whose platform matches the target
    Native,
}

/// One unit of the build plan
#[derive(Debug, Clone, Serialize)]
pub struct Target {
    /// The os half of the pair
    pub os: Os,
    /// The arch half of the pair
    pub arch: String,
    /// The optional triple axis
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_triple: Option<String>,
    /// How this target gets built
    pub class: TargetClass,
    /// The host that will build it
    pub host_id: String,
    /// The asset names this target must produce
    pub expected: DualName,
    /// How the artifact gets packed
    pub archive_format: ArchiveFormat,
}

impl Target {
    /// The `os/arch[/triple]` label used in state and logs
    pub fn label(&self) -> String {
        match &self.target_triple {
            Some(triple) => format!("{}/{}/{}", self.os, self.arch, triple),
            None => format!("{}/{}", self.os, self.arch),
        }
    }

    /// The pair without the triple axis
    pub fn pair(&self) -> TargetPair {
        TargetPair::new(self.os, self.arch.clone())
    }
}

/// CLI-level filters applied during expansion
#[derive(Debug, Default, Clone)]
pub struct PlanFilters {
    /// Restrict to these `os/arch` pairs
    pub targets: Option<Vec<TargetPair>>,
    /// Keep only act-class targets
    pub only_act: bool,
    /// Keep only native-class targets
    pub only_native: bool,
    /// Classify every target as native (the fallback pipeline, for when the
    /// upstream workflow act replays is unavailable)
    pub force_native: bool,
}

/// The full, ordered plan for one `(tool, version)` build
#[derive(Debug, Clone, Serialize)]
pub struct BuildPlan {
    /// The tool being built
    pub tool: String,
    /// The version being built, as the user wrote it
    pub version: String,
    /// Every target, ordered by `(os, arch, target_triple)`
    pub targets: Vec<Target>,
}

impl BuildPlan {
    /// The distinct host ids the plan dispatches to, in plan order
    pub fn hosts(&self) -> Vec<String> {
        self.targets
            .iter()
            .map(|t| t.host_id.clone())
            .unique()
            .collect()
    }

    /// The targets assigned to one host
    pub fn targets_for_host<'a>(&'a self, host_id: &'a str) -> impl Iterator<Item = &'a Target> {
        self.targets.iter().filter(move |t| t.host_id == host_id)
    }
}

/// The host that builds a native target: the local host if its platform
/// matches, otherwise the first matching remote
fn resolve_native_host<'a>(snapshot: &'a Snapshot, pair: &TargetPair) -> Option<&'a Host> {
    let hosts = snapshot.list_hosts();
    hosts
        .iter()
        .find(|h| h.is_local() && &h.platform == pair)
        .or_else(|| hosts.iter().find(|h| !h.is_local() && &h.platform == pair))
        .copied()
}

/// The host that runs act builds: the local runner
fn resolve_act_host<'a>(snapshot: &'a Snapshot) -> Option<&'a Host> {
    snapshot.list_hosts().into_iter().find(|h| h.is_local())
}

/// Expand a ToolSpec (plus CLI filters) into a deterministic plan
pub fn plan_build(
    snapshot: &Snapshot,
    spec: &ToolSpec,
    version: &str,
    filters: &PlanFilters,
) -> DsrResult<BuildPlan> {
    if filters.only_act && filters.only_native {
        return Err(DsrError::InvalidArgs {
            reason: "--only-act and --only-native are mutually exclusive".to_owned(),
        });
    }

    let template = spec.template()?;
    let compat_template = spec.compat_template()?;
    let clean = naming::clean_version(version);

    // 1. the tool's matrix; 2. intersect with CLI targets
    let mut pairs = snapshot.targets_for(spec);
    if let Some(wanted) = &filters.targets {
        pairs.retain(|p| wanted.contains(p));
        if pairs.is_empty() {
            return Err(DsrError::InvalidArgs {
                reason: "the requested targets are not in the tool's matrix".to_owned(),
            });
        }
    }

    let mut targets = Vec::new();
    for pair in pairs {
        // 3. one target per triple, or one with no triple axis
        let triples = spec
            .target_triples
            .get(&pair.to_string())
            .cloned()
            .unwrap_or_default();
        let variants: Vec<Option<String>> = if triples.is_empty() {
            vec![None]
        } else {
            triples.into_iter().map(Some).collect()
        };

        // 4. classify and resolve the host
        let is_act = !filters.force_native
            && pair.os == Os::Linux
            && spec.act_job_map.contains_key(&pair.to_string());
        let (class, host) = if is_act {
            let host = resolve_act_host(snapshot).ok_or_else(|| DsrError::ConfigInvalid {
                path: snapshot.config_dir.join("hosts.yaml"),
                reason: format!(
                    "target {pair} is act-class but no local host exists to run act"
                ),
            })?;
            (TargetClass::Act, host)
        } else {
            let host =
                resolve_native_host(snapshot, &pair).ok_or_else(|| DsrError::ConfigInvalid {
                    path: snapshot.config_dir.join("hosts.yaml"),
                    reason: format!("no host in the inventory can build {pair}"),
                })?;
            (TargetClass::Native, host)
        };

        // 5. --only-act / --only-native
        if (filters.only_act && class != TargetClass::Act)
            || (filters.only_native && class != TargetClass::Native)
        {
            continue;
        }

        // 6. archive format + expected names
        let format = spec.archive_format_for(pair.os);
        for triple in variants {
            let expected = naming::expand(
                &NameContext {
                    name: &spec.name,
                    version: clean,
                    os: pair.os,
                    arch: &pair.arch,
                    target_triple: triple.as_deref(),
                },
                format,
                &template,
                &compat_template,
            );
            targets.push(Target {
                os: pair.os,
                arch: pair.arch.clone(),
                target_triple: triple,
                class,
                host_id: host.id.clone(),
                expected,
                archive_format: format,
            });
        }
    }

    targets.sort_by(|a, b| {
        (a.os, &a.arch, &a.target_triple).cmp(&(b.os, &b.arch, &b.target_triple))
    });

    Ok(BuildPlan {
        tool: spec.name.clone(),
        version: version.to_owned(),
        targets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirs::AppDirs;
    use camino::Utf8PathBuf;
    use temp_dir::TempDir;

    fn snapshot_with(dir: &TempDir, hosts: &str, tool: &str) -> Snapshot {
        let root = Utf8PathBuf::try_from(dir.path().to_owned()).unwrap();
        std::fs::write(root.join("hosts.yaml"), hosts).unwrap();
        std::fs::create_dir_all(root.join("repos.d")).unwrap();
        std::fs::write(root.join("repos.d").join("mytool.yaml"), tool).unwrap();
        let dirs = AppDirs {
            config_dir: root.clone(),
            state_dir: root.join("state"),
            cache_dir: root.join("cache"),
        };
        Snapshot::load(&dirs).unwrap()
    }

    const HOSTS: &str = r#"
hosts:
  local:
    platform: linux/amd64
    connection: local
    capabilities: [docker]
    concurrency: 2
  mmini:
    platform: darwin/arm64
    connection: ssh
    ssh_host: builder@mmini.local
  winbox:
    platform: windows/amd64
    connection: ssh
    ssh_host: builder@winbox.local
"#;

    const TOOL: &str = r#"
repo: me/mytool
build_cmd: make dist
targets: [linux/amd64, darwin/arm64, windows/amd64]
workflow: null
act_job_map:
  linux/amd64: build-linux
"#;

    #[test]
    fn plan_classifies_and_orders() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot_with(&dir, HOSTS, TOOL);
        let spec = snapshot.get_tool("mytool").unwrap();
        let plan = plan_build(&snapshot, spec, "v1.2.3", &PlanFilters::default()).unwrap();

        assert_eq!(plan.targets.len(), 3);
        // ordering: (os, arch); linux < darwin < windows by enum order
        assert_eq!(plan.targets[0].label(), "linux/amd64");
        assert_eq!(plan.targets[0].class, TargetClass::Act);
        assert_eq!(plan.targets[0].host_id, "local");
        assert_eq!(plan.targets[1].label(), "darwin/arm64");
        assert_eq!(plan.targets[1].class, TargetClass::Native);
        assert_eq!(plan.targets[1].host_id, "mmini");
        assert_eq!(plan.targets[2].class, TargetClass::Native);
        assert_eq!(plan.targets[2].host_id, "winbox");

        // names flow through the naming engine, v stripped
        assert_eq!(
            plan.targets[0].expected.versioned,
            "mytool-1.2.3-linux-amd64.tar.gz"
        );
        assert_eq!(
            plan.targets[2].expected.versioned,
            "mytool-1.2.3-windows-amd64.zip"
        );
    }

    #[test]
    fn plan_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot_with(&dir, HOSTS, TOOL);
        let spec = snapshot.get_tool("mytool").unwrap();
        let a = plan_build(&snapshot, spec, "v1.2.3", &PlanFilters::default()).unwrap();
        let b = plan_build(&snapshot, spec, "v1.2.3", &PlanFilters::default()).unwrap();
        let labels = |p: &BuildPlan| p.targets.iter().map(Target::label).collect::<Vec<_>>();
        assert_eq!(labels(&a), labels(&b));
    }

    #[test]
    fn triple_variants_fan_out_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let tool = r#"
repo: me/mytool
build_cmd: make dist
targets: [linux/amd64]
artifact_naming: "${name}-${version}-${target_triple}"
target_triples:
  linux/amd64: [x86_64-unknown-linux-gnu, x86_64-unknown-linux-musl]
"#;
        let snapshot = snapshot_with(&dir, HOSTS, tool);
        let spec = snapshot.get_tool("mytool").unwrap();
        let plan = plan_build(&snapshot, spec, "1.0.0", &PlanFilters::default()).unwrap();
        assert_eq!(plan.targets.len(), 2);
        let names: Vec<&str> = plan
            .targets
            .iter()
            .map(|t| t.expected.versioned.as_str())
            .collect();
        assert_eq!(
            names,
            [
                "mytool-1.0.0-x86_64-unknown-linux-gnu.tar.gz",
                "mytool-1.0.0-x86_64-unknown-linux-musl.tar.gz"
            ]
        );
    }

    #[test]
    fn only_act_and_only_native_conflict() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot_with(&dir, HOSTS, TOOL);
        let spec = snapshot.get_tool("mytool").unwrap();
        let filters = PlanFilters {
            only_act: true,
            only_native: true,
            ..Default::default()
        };
        let err = plan_build(&snapshot, spec, "v1.0.0", &filters).unwrap_err();
        assert!(matches!(err, DsrError::InvalidArgs { .. }));
    }

    #[test]
    fn only_native_filters_act_targets() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot_with(&dir, HOSTS, TOOL);
        let spec = snapshot.get_tool("mytool").unwrap();
        let filters = PlanFilters {
            only_native: true,
            ..Default::default()
        };
        let plan = plan_build(&snapshot, spec, "v1.0.0", &filters).unwrap();
        assert_eq!(plan.targets.len(), 2);
        assert!(plan.targets.iter().all(|t| t.class == TargetClass::Native));
    }

    #[test]
    fn target_intersection() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot_with(&dir, HOSTS, TOOL);
        let spec = snapshot.get_tool("mytool").unwrap();
        let filters = PlanFilters {
            targets: Some(vec!["darwin/arm64".parse().unwrap()]),
            ..Default::default()
        };
        let plan = plan_build(&snapshot, spec, "v1.0.0", &filters).unwrap();
        assert_eq!(plan.targets.len(), 1);
        assert_eq!(plan.targets[0].host_id, "mmini");

        let filters = PlanFilters {
            targets: Some(vec!["linux/arm64".parse().unwrap()]),
            ..Default::default()
        };
        assert!(plan_build(&snapshot, spec, "v1.0.0", &filters).is_err());
    }

    #[test]
    fn force_native_reclassifies_act_targets() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot_with(&dir, HOSTS, TOOL);
        let spec = snapshot.get_tool("mytool").unwrap();
        let filters = PlanFilters {
            force_native: true,
            ..Default::default()
        };
        let plan = plan_build(&snapshot, spec, "v1.0.0", &filters).unwrap();
        assert!(plan.targets.iter().all(|t| t.class == TargetClass::Native));
        // linux/amd64 lands on the local host, whose platform matches
        assert_eq!(plan.targets[0].host_id, "local");
    }

    #[test]
    fn plan_hosts_dedupe_in_order() {
        let dir = TempDir::new().unwrap();
        let snapshot = snapshot_with(&dir, HOSTS, TOOL);
        let spec = snapshot.get_tool("mytool").unwrap();
        let plan = plan_build(&snapshot, spec, "v1.0.0", &PlanFilters::default()).unwrap();
        assert_eq!(plan.hosts(), ["local", "mmini", "winbox"]);
    }
}
