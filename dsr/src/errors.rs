//! Errors!
//!
//! Every failure dsr can report lives in [`DsrError`][]. Each variant maps
//! onto exactly one process exit code via [`DsrError::exit_code`][], which is
//! what keeps the envelope's `status ⇔ exit_code` promise honest.

use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

/// An alias for the common Result type for this crate
pub type DsrResult<T> = std::result::Result<T, DsrError>;

/// Exit code: everything worked
pub const EXIT_SUCCESS: u8 = 0;
/// Exit code: some units succeeded, some failed (or verification incomplete)
pub const EXIT_PARTIAL: u8 = 1;
/// Exit code: a required dependency or credential is missing
pub const EXIT_DEPENDENCY: u8 = 3;
/// Exit code: bad CLI arguments or bad configuration (including lock contention)
pub const EXIT_INVALID: u8 = 4;
/// Exit code: a build, artifact collection, or packing step failed
pub const EXIT_BUILD: u8 = 6;
/// Exit code: the release or repo does not exist upstream
pub const EXIT_UPSTREAM_MISSING: u8 = 7;

/// Errors dsr can have
#[derive(Debug, Error, Diagnostic)]
pub enum DsrError {
    /// random i/o error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// random process error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cmd(#[from] axoprocess::AxoprocessError),

    /// random json error
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// random http error
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    /// random camino conversion error
    #[error(transparent)]
    FromPathBufError(#[from] camino::FromPathBufError),

    /// random semver parse error
    #[error(transparent)]
    Semver(#[from] semver::Error),

    /// random zip error
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    /// Bad command-line arguments
    #[error("invalid arguments: {reason}")]
    InvalidArgs {
        /// What was wrong with them
        reason: String,
    },

    /// A tool was requested that no config layer defines
    #[error("no configuration found for tool '{tool}'")]
    #[diagnostic(help("add repos.d/{tool}.yaml to your config dir, or check `dsr repos list`"))]
    ConfigNotFound {
        /// The tool that was asked for
        tool: String,
    },

    /// A config file exists but violates the schema
    #[error("invalid configuration in {path}: {reason}")]
    ConfigInvalid {
        /// The offending file
        path: Utf8PathBuf,
        /// What's wrong with it
        reason: String,
    },

    /// A config file failed to parse as YAML
    #[error("failed to parse {path}")]
    ConfigParse {
        /// The offending file
        path: Utf8PathBuf,
        /// The underlying parse error
        #[source]
        details: serde_yml::Error,
    },

    /// A required external binary is not on PATH
    #[error("'{binary}', required to run this command, is missing")]
    #[diagnostic(help("ensure {binary} is installed and on your PATH"))]
    DependencyMissing {
        /// The binary we couldn't find
        binary: String,
    },

    /// No usable GitHub credential
    #[error("GitHub authentication failed: {reason}")]
    #[diagnostic(help("set GITHUB_TOKEN or GH_TOKEN to a token with repo scope"))]
    AuthFailure {
        /// What went wrong
        reason: String,
    },

    /// A build unit returned non-zero or produced garbage
    #[error("build failed for {tool} {target} during {phase}: {details}")]
    BuildFailure {
        /// The tool being built
        tool: String,
        /// The `os/arch[/triple]` that failed
        target: String,
        /// Which stage broke (sync, build, fetch, pack)
        phase: String,
        /// The last error text
        details: String,
    },

    /// An executor finished but an expected artifact never appeared
    #[error("expected artifact '{filename}' for {target} was not produced")]
    #[diagnostic(help("did the build command put its output where the config says it would?"))]
    MissingArtifact {
        /// The `os/arch[/triple]` the artifact belongs to
        target: String,
        /// The name we expected to find
        filename: String,
    },

    /// A build host could not be reached at all
    #[error("host '{host}' is unreachable: {details}")]
    HostUnreachable {
        /// The host id
        host: String,
        /// The connection error
        details: String,
    },

    /// An external call exceeded its deadline
    #[error("{what} timed out after {seconds}s")]
    Timeout {
        /// What we were waiting for
        what: String,
        /// The deadline that expired
        seconds: u64,
    },

    /// Some units failed, some succeeded
    #[error("{failed} of {total} units failed; the rest completed")]
    PartialCompletion {
        /// How many failed
        failed: usize,
        /// How many were attempted
        total: usize,
    },

    /// A GitHub release or repo we need does not exist
    #[error("{what} not found on GitHub")]
    UpstreamMissing {
        /// What was missing (e.g. `release v1.2.3 in owner/repo`)
        what: String,
    },

    /// The GitHub API answered something we can't work with
    #[error("GitHub API request failed ({status}): {context}")]
    Github {
        /// The HTTP status we got
        status: u16,
        /// What we were trying to do
        context: String,
    },

    /// An asset with the same name but different content is already uploaded
    #[error("release already has a different '{asset}'")]
    #[diagnostic(help("delete the conflicting asset on GitHub, or bump the version"))]
    ReleaseConflict {
        /// The asset name that collided
        asset: String,
    },

    /// Another process holds the build lock for this `(tool, version)`
    #[error("build of {tool} {version} is locked by run {run_id} (pid {pid} on {host})")]
    #[diagnostic(help("wait for that run to finish, or remove the lock if it is stale"))]
    BuildLocked {
        /// The tool whose build is locked
        tool: String,
        /// The version whose build is locked
        version: String,
        /// The run currently holding the lock
        run_id: String,
        /// The pid that holds it
        pid: u32,
        /// The machine that holds it
        host: String,
    },

    /// A naming template failed to parse or used an unknown variable
    #[error("invalid naming template '{template}': {reason}")]
    #[diagnostic(help(
        "templates may use ${{name}}, ${{version}}, ${{os}}, ${{arch}}, ${{target}}, ${{target_triple}}"
    ))]
    TemplateInvalid {
        /// The template text
        template: String,
        /// What's wrong with it
        reason: String,
    },

    /// We couldn't figure out what version the tool is at
    #[error("could not detect a version for '{tool}': {reason}")]
    #[diagnostic(help("pass --version explicitly, or add a VERSION file to the working tree"))]
    VersionDetect {
        /// The tool whose version is unknown
        tool: String,
        /// Why detection failed
        reason: String,
    },

    /// No build record exists to resume, verify, or report on
    #[error("no build state found for {tool} {version}")]
    NoBuildRecord {
        /// The tool
        tool: String,
        /// The version
        version: String,
    },
}

impl DsrError {
    /// The process exit code this error maps to
    pub fn exit_code(&self) -> u8 {
        match self {
            DsrError::InvalidArgs { .. }
            | DsrError::ConfigNotFound { .. }
            | DsrError::ConfigInvalid { .. }
            | DsrError::ConfigParse { .. }
            | DsrError::TemplateInvalid { .. }
            | DsrError::BuildLocked { .. } => EXIT_INVALID,

            DsrError::DependencyMissing { .. }
            | DsrError::AuthFailure { .. }
            | DsrError::Github { .. }
            | DsrError::Reqwest(_) => EXIT_DEPENDENCY,

            DsrError::PartialCompletion { .. } => EXIT_PARTIAL,

            DsrError::UpstreamMissing { .. } => EXIT_UPSTREAM_MISSING,

            DsrError::Io(_)
            | DsrError::Cmd(_)
            | DsrError::Json(_)
            | DsrError::Zip(_)
            | DsrError::FromPathBufError(_)
            | DsrError::Semver(_)
            | DsrError::BuildFailure { .. }
            | DsrError::MissingArtifact { .. }
            | DsrError::HostUnreachable { .. }
            | DsrError::Timeout { .. }
            | DsrError::ReleaseConflict { .. }
            | DsrError::VersionDetect { .. }
            | DsrError::NoBuildRecord { .. } => EXIT_BUILD,
        }
    }

    /// Whether the retry wrapper should bother re-attempting after this
    ///
    /// Transient failures (timeouts, dead connections, flaky processes) are
    /// worth another try; config and argument problems never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            DsrError::Io(_)
            | DsrError::Cmd(_)
            | DsrError::Reqwest(_)
            | DsrError::HostUnreachable { .. }
            | DsrError::Timeout { .. } => true,
            DsrError::BuildFailure { .. } => true,
            // server-side hiccups are worth another try; 4xx never is
            DsrError::Github { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
