//! All the clap stuff for parsing/documenting the cli

use camino::Utf8PathBuf;
use clap::{
    builder::{PossibleValuesParser, TypedValueParser},
    Args, Parser, Subcommand,
};
use tracing::level_filters::LevelFilter;

#[derive(Parser, Clone, Debug)]
#[clap(version)]
#[clap(bin_name = "dsr")]
/// Build and release developer tools across a fleet of hosts.
///
/// See 'build', 'release' and 'watch' for the 3 most important subcommands.
pub struct Cli {
    /// Subcommands
    #[clap(subcommand)]
    pub command: Commands,

    /// How verbose logging should be (log level)
    #[clap(long, short)]
    #[clap(default_value_t = LevelFilter::WARN)]
    #[clap(value_parser = PossibleValuesParser::new(["off", "error", "warn", "info", "debug", "trace"]).map(|s| s.parse::<LevelFilter>().expect("possible values are valid")))]
    #[clap(help_heading = "GLOBAL OPTIONS", global = true)]
    pub verbose: LevelFilter,

    /// Emit a single machine-readable envelope on stdout
    ///
    /// Logs move to line-oriented JSON on stderr; stdout carries exactly one
    /// envelope object per invocation.
    #[clap(long)]
    #[clap(help_heading = "GLOBAL OPTIONS", global = true)]
    pub json: bool,

    /// Plan only: no locks, no builds, no uploads
    #[clap(long)]
    #[clap(help_heading = "GLOBAL OPTIONS", global = true)]
    pub dry_run: bool,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Build, pack, checksum, upload, and verify a tool's release
    Build(BuildArgs),

    /// Publish an existing manifest, or verify a published release
    Release(ReleaseArgs),

    /// Run the full pipeline with every target forced onto native hosts
    ///
    /// For when the upstream CI workflow is unavailable and act replays
    /// can't happen.
    Fallback(BuildArgs),

    /// Poll upstream CI and trigger native builds when it goes green
    Watch(WatchArgs),

    /// Preflight the control machine and the host fleet
    Doctor(DoctorArgs),

    /// Probe host health
    Health(HealthArgs),

    /// Delete old build state
    Prune(PruneArgs),

    /// Run a tool's configured quality gates
    Quality(QualityArgs),

    /// List or validate tool configurations
    Repos(ReposArgs),

    /// Show every build the state store knows about
    Status,

    /// Print dsr's own version
    Version,
}

#[derive(Args, Clone, Debug)]
pub struct BuildArgs {
    /// The tool to build
    #[clap(long)]
    pub tool: String,

    /// The version to build; detected from the working tree when omitted
    #[clap(long)]
    pub version: Option<String>,

    /// Restrict the matrix to one os/arch pair (repeatable)
    #[clap(long)]
    pub target: Vec<String>,

    /// Restrict the matrix to a comma-separated list of os/arch pairs
    #[clap(long, value_delimiter(','))]
    pub targets: Vec<String>,

    /// Cap on simultaneously-building targets
    #[clap(long)]
    pub parallel: Option<usize>,

    /// Sync sources to remote hosts, then stop
    #[clap(long)]
    pub sync_only: bool,

    /// Skip the source sync
    #[clap(long)]
    pub no_sync: bool,

    /// Build only act-class targets
    #[clap(long)]
    pub only_act: bool,

    /// Build only native-class targets
    #[clap(long)]
    pub only_native: bool,

    /// Create the GitHub release as a draft
    #[clap(long)]
    pub draft: bool,

    /// Write final assets here instead of the state dir
    #[clap(long)]
    pub artifacts: Option<Utf8PathBuf>,

    /// Keep archives already on disk instead of recomputing them
    #[clap(long)]
    pub reuse_artifacts: bool,

    /// Ignore cached host health and probe fresh
    #[clap(long)]
    pub no_cache: bool,

    /// Build and pack but skip the release upload
    #[clap(long)]
    pub no_release: bool,
}

#[derive(Args, Clone, Debug)]
pub struct ReleaseArgs {
    /// Optional verification mode
    #[clap(subcommand)]
    pub command: Option<ReleaseCommands>,

    /// The tool to release
    #[clap(long)]
    pub tool: Option<String>,

    /// The version to release; detected when omitted
    #[clap(long)]
    pub version: Option<String>,

    /// Create the GitHub release as a draft
    #[clap(long)]
    pub draft: bool,
}

#[derive(Subcommand, Clone, Debug)]
pub enum ReleaseCommands {
    /// Compare the remote asset set against the local manifest
    Verify(VerifyArgs),
}

#[derive(Args, Clone, Debug)]
pub struct VerifyArgs {
    /// The tool to verify
    #[clap(long)]
    pub tool: String,

    /// The version to verify; detected when omitted
    #[clap(long)]
    pub version: Option<String>,

    /// Re-upload missing assets that still exist locally
    #[clap(long)]
    pub fix: bool,

    /// Stream the remote downloads and verify their checksums
    #[clap(long)]
    pub checksums: bool,
}

#[derive(Args, Clone, Debug)]
pub struct WatchArgs {
    /// Check once and exit instead of looping
    #[clap(long)]
    pub once: bool,

    /// Watch a single tool instead of every configured one
    #[clap(long)]
    pub tool: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct DoctorArgs {
    /// Skip remote host probes
    #[clap(long)]
    pub quick: bool,

    /// Clear stale health caches while probing
    #[clap(long)]
    pub fix: bool,
}

#[derive(Args, Clone, Debug)]
pub struct HealthArgs {
    /// What to probe
    #[clap(subcommand)]
    pub command: HealthCommands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum HealthCommands {
    /// Probe one host
    Check {
        /// The host id from the inventory
        host: String,
        /// Ignore the cache and probe fresh
        #[clap(long)]
        no_cache: bool,
    },
    /// Probe every host in the inventory
    All {
        /// Ignore the cache and probe fresh
        #[clap(long)]
        no_cache: bool,
    },
    /// Drop every cached health report
    ClearCache,
}

#[derive(Args, Clone, Debug)]
pub struct PruneArgs {
    /// Remove run state older than this many days
    #[clap(long, default_value_t = 30)]
    pub max_age: u64,

    /// Always keep this many most-recent runs per (tool, version)
    #[clap(long, default_value_t = 3)]
    pub keep_last: usize,

    /// Actually delete; without this, prune only reports what it would do
    #[clap(long)]
    pub force: bool,
}

#[derive(Args, Clone, Debug)]
pub struct QualityArgs {
    /// The tool whose checks should run
    #[clap(long)]
    pub tool: String,

    /// Record the skip and exit clean without running anything
    #[clap(long)]
    pub skip_checks: bool,
}

#[derive(Args, Clone, Debug)]
pub struct ReposArgs {
    /// What to do with the repo configs
    #[clap(subcommand)]
    pub command: ReposCommands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum ReposCommands {
    /// List every configured tool
    List,
    /// Validate configs and report naming-template drift
    Validate {
        /// Validate a single tool instead of all of them
        tool: Option<String>,
    },
}
