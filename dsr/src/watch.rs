//! Watching upstream CI
//!
//! The watch loop polls each tool's upstream workflow on GitHub Actions.
//! When the latest run for a commit we haven't released yet completes
//! successfully, the tool is "ready": the caller triggers the native-only
//! build for the targets the upstream CI doesn't cover. The last commit we
//! acted on is remembered under `<state>/watch/<tool>.json` so a completed
//! run only triggers once.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ToolSpec;
use crate::dirs::{ensure_dir, AppDirs};
use crate::errors::DsrResult;
use crate::net::GithubClient;

/// Where a tool stands relative to its upstream CI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum WatchState {
    /// The tool has no repo or workflow configured; nothing to watch
    NotWatchable,
    /// The workflow exists but has no runs yet
    NoRuns,
    /// The newest run hasn't finished
    InProgress {
        /// The commit being built upstream
        head_sha: String,
    },
    /// The newest run finished but didn't succeed
    UpstreamFailed {
        /// The commit that failed
        head_sha: String,
        /// The run's conclusion
        conclusion: String,
    },
    /// We already triggered for this commit
    AlreadyBuilt {
        /// The commit in question
        head_sha: String,
    },
    /// A new commit finished green upstream; time to build natively
    Ready {
        /// The commit to build
        head_sha: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct WatchMemo {
    last_built_sha: String,
}

fn memo_path(dirs: &AppDirs, tool: &str) -> Utf8PathBuf {
    dirs.watch_dir().join(format!("{tool}.json"))
}

fn load_memo(dirs: &AppDirs, tool: &str) -> Option<WatchMemo> {
    let text = std::fs::read_to_string(memo_path(dirs, tool)).ok()?;
    serde_json::from_str(&text).ok()
}

/// Remember that we triggered a build for this commit
pub fn record_built(dirs: &AppDirs, tool: &str, sha: &str) -> DsrResult<()> {
    ensure_dir(&dirs.watch_dir())?;
    let memo = WatchMemo {
        last_built_sha: sha.to_owned(),
    };
    std::fs::write(memo_path(dirs, tool), serde_json::to_string_pretty(&memo)?)?;
    Ok(())
}

/// Ask upstream where one tool stands
pub async fn check_tool(
    client: &GithubClient,
    dirs: &AppDirs,
    spec: &ToolSpec,
) -> DsrResult<WatchState> {
    let (Some(repo), Some(workflow)) = (&spec.repo, &spec.workflow) else {
        return Ok(WatchState::NotWatchable);
    };
    let workflow_file = workflow
        .file_name()
        .unwrap_or(workflow.as_str())
        .to_owned();
    let Some(run) = client.latest_workflow_run(repo, &workflow_file).await? else {
        return Ok(WatchState::NoRuns);
    };
    debug!(
        "{}: run {} for {} is {} ({:?})",
        spec.name, run.id, run.head_sha, run.status, run.conclusion
    );
    if run.status != "completed" {
        return Ok(WatchState::InProgress {
            head_sha: run.head_sha,
        });
    }
    match run.conclusion.as_deref() {
        Some("success") => {
            if load_memo(dirs, &spec.name)
                .is_some_and(|memo| memo.last_built_sha == run.head_sha)
            {
                Ok(WatchState::AlreadyBuilt {
                    head_sha: run.head_sha,
                })
            } else {
                Ok(WatchState::Ready {
                    head_sha: run.head_sha,
                })
            }
        }
        other => Ok(WatchState::UpstreamFailed {
            head_sha: run.head_sha,
            conclusion: other.unwrap_or("unknown").to_owned(),
        }),
    }
}
