//! The native-host driver
//!
//! Builds a target on the host whose platform matches it. Remote hosts are
//! reached over ssh: sync the source tree out, run the tool's build command
//! with the target environment exported, and pull the binary back. A local
//! host skips the transport and runs the same build command directly.
//!
//! Connection failures surface as [`DsrError::HostUnreachable`][] so the
//! dispatcher can tell "the host is down" apart from "the build broke".

use axoprocess::Cmd;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::config::{Host, ToolSpec};
use crate::errors::{DsrError, DsrResult};
use crate::exec::{staged_binary_name, Collected, CollectedKind, ExecContext, Executor};
use crate::plan::Target;

/// Builds targets on a native host (this machine or an ssh remote)
#[derive(Debug, Clone)]
pub struct NativeDriver {
    /// The host this driver dispatches to
    pub host: Host,
}

impl NativeDriver {
    /// A driver bound to one host
    pub fn new(host: Host) -> Self {
        Self { host }
    }

    fn ssh_dest(&self) -> &str {
        self.host.ssh_host.as_deref().unwrap_or_default()
    }

    /// Where the working tree lives on this host
    fn remote_tree<'a>(&self, spec: &'a ToolSpec) -> DsrResult<&'a Utf8Path> {
        spec.host_paths
            .get(&self.host.id)
            .map(Utf8PathBuf::as_path)
            .ok_or_else(|| DsrError::ConfigInvalid {
                path: Utf8PathBuf::from("repos.d"),
                reason: format!(
                    "tool '{}' has no host_paths entry for '{}'",
                    spec.name, self.host.id
                ),
            })
    }

    /// rsync the local working tree to the host (mirror, honor .gitignore,
    /// preserve mtimes)
    fn sync_source(&self, spec: &ToolSpec) -> DsrResult<()> {
        let local = spec.local_path.as_ref().ok_or_else(|| DsrError::ConfigInvalid {
            path: Utf8PathBuf::from("repos.d"),
            reason: format!("tool '{}' has no local_path to sync from", spec.name),
        })?;
        let remote = self.remote_tree(spec)?;
        info!("syncing {} to {}:{}", local, self.host.id, remote);
        Cmd::new("rsync", format!("sync source to {}", self.host.id))
            .arg("-az")
            .arg("--delete")
            .arg("--filter=:- .gitignore")
            .arg("--exclude=.git")
            .arg("-e")
            .arg(format!(
                "ssh -o BatchMode=yes -o ConnectTimeout={}",
                self.host.ssh_timeout_s
            ))
            .arg(format!("{local}/"))
            .arg(format!("{}:{remote}/", self.ssh_dest()))
            .stdout_to_stderr()
            .run()
            .map_err(|e| DsrError::HostUnreachable {
                host: self.host.id.clone(),
                details: e.to_string(),
            })?;
        Ok(())
    }

    /// The remote (or local) shell line for one target's build
    fn build_script(
        &self,
        spec: &ToolSpec,
        target: &Target,
        ctx: &ExecContext,
        tree: &Utf8Path,
    ) -> String {
        let mut exports = format!(
            "export TARGET_OS={} TARGET_ARCH={} VERSION={}",
            target.os, target.arch, ctx.version
        );
        if let Some(triple) = &target.target_triple {
            exports.push_str(&format!(" TARGET_TRIPLE={triple}"));
        }
        format!("cd {tree} && {exports}; {}", spec.build_cmd)
    }

    fn run_remote_build(&self, script: &str, target: &Target) -> DsrResult<()> {
        Cmd::new("ssh", format!("build {} on {}", target.label(), self.host.id))
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.host.ssh_timeout_s))
            .arg(self.ssh_dest())
            .arg(script)
            .stdout_to_stderr()
            .run()?;
        Ok(())
    }

    fn run_local_build(&self, script: &str, target: &Target) -> DsrResult<()> {
        Cmd::new("sh", format!("build {} locally", target.label()))
            .arg("-c")
            .arg(script)
            .stdout_to_stderr()
            .run()?;
        Ok(())
    }

    /// Pull the built binary back into the target's staging dir
    fn fetch_binary(
        &self,
        spec: &ToolSpec,
        target: &Target,
        ctx: &ExecContext,
        tree: &Utf8Path,
    ) -> DsrResult<Utf8PathBuf> {
        let staged_name = staged_binary_name(spec, target);
        let remote_rel = format!("dist/{staged_name}");
        let dest_dir = ctx.target_dir(target);
        std::fs::create_dir_all(&dest_dir)?;
        let dest = dest_dir.join(&staged_name);

        if self.host.is_local() {
            let src = tree.join(&remote_rel);
            if !src.exists() {
                return Err(DsrError::MissingArtifact {
                    target: target.label(),
                    filename: remote_rel,
                });
            }
            std::fs::copy(&src, &dest)?;
        } else {
            Cmd::new("rsync", format!("fetch {} from {}", staged_name, self.host.id))
                .arg("-az")
                .arg("-e")
                .arg(format!(
                    "ssh -o BatchMode=yes -o ConnectTimeout={}",
                    self.host.ssh_timeout_s
                ))
                .arg(format!("{}:{tree}/{remote_rel}", self.ssh_dest()))
                .arg(&dest)
                .stdout_to_stderr()
                .run()
                .map_err(|_| DsrError::MissingArtifact {
                    target: target.label(),
                    filename: remote_rel,
                })?;
        }
        Ok(dest)
    }
}

impl Executor for NativeDriver {
    fn run(&self, target: &Target, ctx: &ExecContext) -> DsrResult<Vec<Collected>> {
        let spec = &ctx.spec;
        let tree: Utf8PathBuf = if self.host.is_local() {
            spec.local_path
                .clone()
                .ok_or_else(|| DsrError::ConfigInvalid {
                    path: Utf8PathBuf::from("repos.d"),
                    reason: format!("tool '{}' has no local_path", spec.name),
                })?
        } else {
            if !ctx.no_sync {
                self.sync_source(spec)?;
            }
            if ctx.sync_only {
                return Ok(vec![]);
            }
            self.remote_tree(spec)?.to_owned()
        };

        let script = self.build_script(spec, target, ctx, &tree);
        let result = if self.host.is_local() {
            self.run_local_build(&script, target)
        } else {
            self.run_remote_build(&script, target)
        };
        result.map_err(|e| DsrError::BuildFailure {
            tool: spec.name.clone(),
            target: target.label(),
            phase: "build".to_owned(),
            details: e.to_string(),
        })?;

        let binary = self.fetch_binary(spec, target, ctx, &tree)?;
        Ok(vec![Collected {
            path: binary,
            kind: CollectedKind::Binary,
        }])
    }
}
