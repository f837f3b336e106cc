//! Executors: the two ways a target gets built
//!
//! The planner picks the variant; the executors just honor the shared
//! contract: declare the artifact directory up front, never write outside
//! it, return absolute paths, and keep host-level failures (unreachable)
//! distinct from per-target failures (build broke, artifact missing).

pub mod act;
pub mod ssh;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::ToolSpec;
use crate::errors::DsrResult;
use crate::plan::Target;

/// What kind of file an executor collected
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CollectedKind {
    /// A raw binary that still needs packing
    Binary,
    /// A finished asset, already named and packed by the upstream workflow
    Asset,
}

/// One file an executor pulled out of a build
#[derive(Debug, Clone)]
pub struct Collected {
    /// Absolute path inside the declared artifact directory
    pub path: Utf8PathBuf,
    /// Whether it still needs packing
    pub kind: CollectedKind,
}

/// Everything an executor needs beyond the target itself
#[derive(Debug, Clone)]
pub struct ExecContext {
    /// The tool being built
    pub spec: ToolSpec,
    /// The version as the user wrote it (exported to build commands)
    pub version: String,
    /// The version with any leading `v` stripped (used in names)
    pub clean_version: String,
    /// The per-run directory executors stage collected files into
    pub staging_dir: Utf8PathBuf,
    /// Stop after syncing the source tree (ssh targets only)
    pub sync_only: bool,
    /// Skip the source sync entirely (ssh targets only)
    pub no_sync: bool,
    /// Token handed to the container build, when one is available
    pub github_token: Option<String>,
}

impl ExecContext {
    /// The staging subdirectory owned by one target
    ///
    /// Per-target so two targets with the same binary base name can't
    /// clobber each other's transfer.
    pub fn target_dir(&self, target: &Target) -> Utf8PathBuf {
        let mut label = format!("{}-{}", target.os, target.arch);
        if let Some(triple) = &target.target_triple {
            label.push('-');
            label.push_str(triple);
        }
        self.staging_dir.join(label)
    }
}

/// The contract both drivers implement
pub trait Executor {
    /// Build one target and return what was collected
    fn run(&self, target: &Target, ctx: &ExecContext) -> DsrResult<Vec<Collected>>;
}

/// The staged filename for a transferred binary: base name plus the
/// platform extension
pub fn staged_binary_name(spec: &ToolSpec, target: &Target) -> String {
    format!("{}{}", spec.binary_name(), target.os.exe_suffix())
}

/// Recursively search a directory for a file with the given name
pub fn find_file_named(root: &Utf8Path, name: &str) -> Option<Utf8PathBuf> {
    let walker = walkdir::WalkDir::new(root).sort_by_file_name();
    for entry in walker.into_iter().flatten() {
        if entry.file_type().is_file() && entry.file_name().to_str() == Some(name) {
            if let Ok(path) = Utf8PathBuf::try_from(entry.path().to_owned()) {
                return Some(path);
            }
        }
    }
    None
}
