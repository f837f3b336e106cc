//! Operating systems, architectures, and archive formats
//!
//! dsr names platforms the way release assets name them: `os/arch` pairs
//! like `linux/amd64`, not full target triples. Triples are an optional
//! third axis carried by the build plan.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{DsrError, DsrResult};

/// The key for referring to linux as an "os"
pub const OS_LINUX: &str = "linux";
/// The key for referring to macos as an "os"
pub const OS_DARWIN: &str = "darwin";
/// The key for referring to windows as an "os"
pub const OS_WINDOWS: &str = "windows";

/// An operating system a release asset can target
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    /// linux
    Linux,
    /// macOS (always `darwin` in asset names)
    Darwin,
    /// windows
    Windows,
}

impl Os {
    /// The token used in asset names and config keys
    pub fn as_str(self) -> &'static str {
        match self {
            Os::Linux => OS_LINUX,
            Os::Darwin => OS_DARWIN,
            Os::Windows => OS_WINDOWS,
        }
    }

    /// The executable suffix for raw binaries on this os
    pub fn exe_suffix(self) -> &'static str {
        match self {
            Os::Windows => ".exe",
            _ => "",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Os {
    type Err = DsrError;
    fn from_str(s: &str) -> DsrResult<Self> {
        match s {
            OS_LINUX => Ok(Os::Linux),
            // accept the Go-ism and the uname-ism
            OS_DARWIN | "macos" => Ok(Os::Darwin),
            OS_WINDOWS => Ok(Os::Windows),
            other => Err(DsrError::InvalidArgs {
                reason: format!("unknown os '{other}' (expected linux, darwin, or windows)"),
            }),
        }
    }
}

/// One `os/arch` pair, the unit the target matrix is written in
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetPair {
    /// The operating system
    pub os: Os,
    /// The architecture token (`amd64`, `arm64`, ...)
    pub arch: String,
}

impl TargetPair {
    /// Make a pair from parts
    pub fn new(os: Os, arch: impl Into<String>) -> Self {
        Self {
            os,
            arch: arch.into(),
        }
    }
}

impl fmt::Display for TargetPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

impl FromStr for TargetPair {
    type Err = DsrError;
    fn from_str(s: &str) -> DsrResult<Self> {
        let Some((os, arch)) = s.split_once('/') else {
            return Err(DsrError::InvalidArgs {
                reason: format!("target '{s}' is not an os/arch pair"),
            });
        };
        if arch.is_empty() || arch.contains('/') {
            return Err(DsrError::InvalidArgs {
                reason: format!("target '{s}' is not an os/arch pair"),
            });
        }
        Ok(TargetPair {
            os: os.parse()?,
            arch: arch.to_owned(),
        })
    }
}

impl Serialize for TargetPair {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TargetPair {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The default target matrix when a tool doesn't declare one
pub fn default_targets() -> Vec<TargetPair> {
    vec![
        TargetPair::new(Os::Linux, "amd64"),
        TargetPair::new(Os::Darwin, "arm64"),
        TargetPair::new(Os::Windows, "amd64"),
    ]
}

/// How an artifact gets bundled for release
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    /// gzipped tar (the default everywhere but windows)
    #[default]
    #[serde(rename = "tar.gz")]
    TarGz,
    /// xz-compressed tar
    #[serde(rename = "tar.xz")]
    TarXz,
    /// gzipped tar with the short extension
    Tgz,
    /// zip (the default on windows)
    Zip,
    /// no archive at all; the binary is the asset
    Binary,
}

impl ArchiveFormat {
    /// The file extension, without a leading dot; empty for raw binaries
    pub fn ext(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarXz => "tar.xz",
            ArchiveFormat::Tgz => "tgz",
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Binary => "",
        }
    }

    /// The format used for an os when the config doesn't override it
    pub fn default_for(os: Os) -> Self {
        match os {
            Os::Windows => ArchiveFormat::Zip,
            _ => ArchiveFormat::TarGz,
        }
    }
}
