//! Host health probes
//!
//! Four checks per host: connectivity, disk headroom, toolchain presence,
//! clock drift. Reports are cached under `<cache>/health/<host>.json` with a
//! TTL so `dsr build` doesn't re-ssh every host it already probed minutes
//! ago; `--no-cache` forces a fresh probe.

use std::time::Instant;

use axoprocess::Cmd;
use dsr_schema::{
    ClockDriftCheck, ConnectivityCheck, DiskSpaceCheck, HealthChecks, HealthReport, ToolchainCheck,
};
use tracing::debug;

use crate::config::{Host, Snapshot};
use crate::dirs::{ensure_dir, AppDirs};
use crate::errors::DsrResult;

/// Disk usage below this is `ok`
const DISK_WARNING_PERCENT: u8 = 90;
/// Disk usage below this is `warning`; at or above is `error`
const DISK_ERROR_PERCENT: u8 = 95;

/// Run a command on the host, locally or over ssh, capturing stdout
fn host_output(host: &Host, command: &str) -> DsrResult<String> {
    let output = if host.is_local() {
        Cmd::new("sh", format!("probe {} locally", host.id))
            .arg("-c")
            .arg(command)
            .log(None)
            .output()?
    } else {
        let ssh_host = host.ssh_host.as_deref().unwrap_or_default();
        Cmd::new("ssh", format!("probe {} over ssh", host.id))
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", host.ssh_timeout_s))
            .arg(ssh_host)
            .arg(command)
            .log(None)
            .output()?
    };
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn probe_connectivity(host: &Host) -> ConnectivityCheck {
    if host.is_local() {
        return ConnectivityCheck {
            reachable: true,
            latency_ms: Some(0),
            error: None,
        };
    }
    let start = Instant::now();
    match host_output(host, "true") {
        Ok(_) => ConnectivityCheck {
            reachable: true,
            latency_ms: Some(start.elapsed().as_millis() as u64),
            error: None,
        },
        Err(e) => ConnectivityCheck {
            reachable: false,
            latency_ms: None,
            error: Some(e.to_string()),
        },
    }
}

/// Parse the Use% column out of `df -P` output
fn parse_df_percent(output: &str) -> Option<u8> {
    let line = output.lines().nth(1)?;
    line.split_whitespace()
        .find(|field| field.ends_with('%'))
        .and_then(|field| field.trim_end_matches('%').parse().ok())
}

fn probe_disk(host: &Host) -> DiskSpaceCheck {
    let usage = host_output(host, "df -P /")
        .ok()
        .and_then(|out| parse_df_percent(&out));
    match usage {
        Some(percent) => {
            let status = if percent < DISK_WARNING_PERCENT {
                "ok"
            } else if percent < DISK_ERROR_PERCENT {
                "warning"
            } else {
                "error"
            };
            DiskSpaceCheck {
                usage_percent: percent,
                status: status.to_owned(),
            }
        }
        None => DiskSpaceCheck {
            usage_percent: 100,
            status: "error".to_owned(),
        },
    }
}

/// Which binary a capability is probed through
fn capability_binary(capability: &str) -> &str {
    match capability {
        "rust" => "cargo",
        "python" => "python3",
        other => other,
    }
}

/// Pull a `1.2.3`-looking token out of `--version` output
fn parse_version_token(output: &str) -> Option<String> {
    output.split_whitespace().find_map(|tok| {
        let trimmed = tok.trim_matches(|c: char| !c.is_ascii_digit() && c != '.');
        let mut parts = trimmed.split('.');
        match (parts.next(), parts.next()) {
            (Some(a), Some(b))
                if !a.is_empty()
                    && a.chars().all(|c| c.is_ascii_digit())
                    && b.chars().next().is_some_and(|c| c.is_ascii_digit()) =>
            {
                Some(trimmed.to_owned())
            }
            _ => None,
        }
    })
}

fn probe_toolchains(host: &Host) -> Vec<ToolchainCheck> {
    host.capabilities
        .iter()
        .map(|capability| {
            let binary = capability_binary(capability);
            match host_output(host, &format!("{binary} --version")) {
                Ok(out) => ToolchainCheck {
                    name: capability.clone(),
                    installed: true,
                    version: parse_version_token(&out),
                },
                Err(_) => ToolchainCheck {
                    name: capability.clone(),
                    installed: false,
                    version: None,
                },
            }
        })
        .collect()
}

fn probe_clock(host: &Host) -> ClockDriftCheck {
    if host.is_local() {
        return ClockDriftCheck { drift_seconds: 0 };
    }
    let drift = host_output(host, "date +%s")
        .ok()
        .and_then(|out| out.trim().parse::<i64>().ok())
        .map(|remote| remote - chrono::Utc::now().timestamp())
        .unwrap_or(0);
    ClockDriftCheck {
        drift_seconds: drift,
    }
}

/// Run all four probes against a host, ignoring any cache
pub fn probe_host(host: &Host) -> HealthReport {
    let connectivity = probe_connectivity(host);
    let (disk_space, toolchains, clock_drift) = if connectivity.reachable {
        (probe_disk(host), probe_toolchains(host), probe_clock(host))
    } else {
        // nothing else is observable on an unreachable host
        (
            DiskSpaceCheck {
                usage_percent: 0,
                status: "error".to_owned(),
            },
            host.capabilities
                .iter()
                .map(|c| ToolchainCheck {
                    name: c.clone(),
                    installed: false,
                    version: None,
                })
                .collect(),
            ClockDriftCheck { drift_seconds: 0 },
        )
    };
    let healthy = connectivity.reachable
        && disk_space.status != "error"
        && toolchains.iter().all(|t| t.installed);
    let status = if healthy {
        "ok"
    } else if connectivity.reachable {
        "degraded"
    } else {
        "unreachable"
    };
    HealthReport {
        hostname: host.id.clone(),
        healthy,
        status: status.to_owned(),
        checks: HealthChecks {
            connectivity,
            disk_space,
            toolchains,
            clock_drift,
        },
        probed_at: dsr_schema::rfc3339_now(),
    }
}

fn report_age_secs(report: &HealthReport) -> i64 {
    chrono::DateTime::parse_from_rfc3339(&report.probed_at)
        .map(|t| (chrono::Utc::now() - t.with_timezone(&chrono::Utc)).num_seconds())
        .unwrap_or(i64::MAX)
}

/// Probe a host, honoring the TTL cache
pub fn cached_probe(dirs: &AppDirs, host: &Host, ttl_secs: u64, no_cache: bool) -> DsrResult<HealthReport> {
    let cache_path = dirs.health_dir().join(format!("{}.json", host.id));
    if !no_cache && cache_path.exists() {
        if let Ok(text) = std::fs::read_to_string(&cache_path) {
            if let Ok(report) = serde_json::from_str::<HealthReport>(&text) {
                if report_age_secs(&report) < ttl_secs as i64 {
                    debug!("using cached health for {}", host.id);
                    return Ok(report);
                }
            }
        }
    }
    let report = probe_host(host);
    ensure_dir(&dirs.health_dir())?;
    let tmp = dirs.health_dir().join(format!(".{}.json.tmp", host.id));
    std::fs::write(&tmp, serde_json::to_string_pretty(&report)?)?;
    std::fs::rename(&tmp, &cache_path)?;
    Ok(report)
}

/// Whether a host is fit to receive build dispatches
pub fn is_ready(dirs: &AppDirs, host: &Host, ttl_secs: u64) -> bool {
    cached_probe(dirs, host, ttl_secs, false)
        .map(|r| r.healthy)
        .unwrap_or(false)
}

/// Ids of every healthy host in the inventory
pub fn get_healthy_hosts(dirs: &AppDirs, snapshot: &Snapshot) -> Vec<String> {
    snapshot
        .list_hosts()
        .into_iter()
        .filter(|host| is_ready(dirs, host, snapshot.settings.health_ttl_secs))
        .map(|host| host.id.clone())
        .collect()
}

/// Drop every cached report
pub fn clear_cache(dirs: &AppDirs) -> DsrResult<usize> {
    let dir = dirs.health_dir();
    let mut removed = 0;
    if dir.is_dir() {
        for entry in dir.read_dir_utf8()? {
            let path = entry?.path().to_owned();
            if path.extension() == Some("json") {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}
