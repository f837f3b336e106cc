//! Where dsr keeps its files
//!
//! XDG-style layout with env-var overrides:
//!
//! * config: `$DSR_CONFIG_DIR` > `$XDG_CONFIG_HOME/dsr` > `~/.config/dsr`
//! * state:  `$DSR_STATE_DIR`  > `$XDG_STATE_HOME/dsr`  > `~/.local/state/dsr`
//! * cache:  `$DSR_CACHE_DIR`  > `$XDG_CACHE_HOME/dsr`  > `~/.cache/dsr`

use camino::{Utf8Path, Utf8PathBuf};

use crate::errors::{DsrError, DsrResult};

/// The application subdirectory name under the XDG roots
const APP_DIR: &str = "dsr";

/// Resolved root directories for one run
#[derive(Debug, Clone)]
pub struct AppDirs {
    /// Where config.yaml / hosts.yaml / repos.d live
    pub config_dir: Utf8PathBuf,
    /// Where build state, logs, artifacts, and manifests live
    pub state_dir: Utf8PathBuf,
    /// Where health probes and cached installers live
    pub cache_dir: Utf8PathBuf,
}

fn env_path(var: &str) -> Option<Utf8PathBuf> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(Utf8PathBuf::from)
}

fn home_dir() -> DsrResult<Utf8PathBuf> {
    env_path("HOME")
        .or_else(|| env_path("USERPROFILE"))
        .ok_or_else(|| DsrError::ConfigInvalid {
            path: Utf8PathBuf::from("~"),
            reason: "neither HOME nor USERPROFILE is set".to_owned(),
        })
}

impl AppDirs {
    /// Resolve all three roots from the environment
    ///
    /// The home directory is only consulted for roots with no explicit
    /// override, so fully-pinned environments work without HOME.
    pub fn from_env() -> DsrResult<Self> {
        let resolve = |explicit: &str, xdg: &str, fallback: &[&str]| -> DsrResult<Utf8PathBuf> {
            if let Some(path) = env_path(explicit) {
                return Ok(path);
            }
            if let Some(path) = env_path(xdg) {
                return Ok(path.join(APP_DIR));
            }
            let mut path = home_dir()?;
            for part in fallback {
                path = path.join(part);
            }
            Ok(path.join(APP_DIR))
        };
        Ok(Self {
            config_dir: resolve("DSR_CONFIG_DIR", "XDG_CONFIG_HOME", &[".config"])?,
            state_dir: resolve("DSR_STATE_DIR", "XDG_STATE_HOME", &[".local", "state"])?,
            cache_dir: resolve("DSR_CACHE_DIR", "XDG_CACHE_HOME", &[".cache"])?,
        })
    }

    /// `<state>/builds/<tool>/<version>`: one dir per (tool, version)
    pub fn build_dir(&self, tool: &str, version: &str) -> Utf8PathBuf {
        self.state_dir.join("builds").join(tool).join(version)
    }

    /// `<state>/artifacts/<tool>/<version>`: final assets for a release
    pub fn artifacts_dir(&self, tool: &str, version: &str) -> Utf8PathBuf {
        self.state_dir.join("artifacts").join(tool).join(version)
    }

    /// `<state>/manifests/<tool>-<version>.json`
    pub fn manifest_path(&self, tool: &str, version: &str) -> Utf8PathBuf {
        self.state_dir
            .join("manifests")
            .join(format!("{tool}-{version}.json"))
    }

    /// `<state>/logs/YYYY-MM-DD`: one dir of run logs per day
    pub fn logs_dir_for(&self, date: &str) -> Utf8PathBuf {
        self.state_dir.join("logs").join(date)
    }

    /// `<cache>/health`: cached host health reports
    pub fn health_dir(&self) -> Utf8PathBuf {
        self.cache_dir.join("health")
    }

    /// `<cache>/installers/<tool>`: cached installer payloads (offline mode)
    pub fn installers_dir(&self, tool: &str) -> Utf8PathBuf {
        self.cache_dir.join("installers").join(tool)
    }

    /// `<state>/watch`: last-seen upstream commit per tool
    pub fn watch_dir(&self) -> Utf8PathBuf {
        self.state_dir.join("watch")
    }
}

/// Create a directory and its parents, mapping the error onto the path
pub fn ensure_dir(path: &Utf8Path) -> DsrResult<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}
