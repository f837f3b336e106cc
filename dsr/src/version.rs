//! The version oracle
//!
//! Figures out what version a tool currently is, from its language manifest
//! or a `VERSION` file, and can lay down the matching git tag.

use axoprocess::Cmd;
use camino::Utf8Path;
use semver::Version;
use serde::Deserialize;
use tracing::info;

use crate::config::{Language, ToolSpec};
use crate::errors::{DsrError, DsrResult};

#[derive(Deserialize)]
struct CargoManifest {
    package: Option<CargoPackage>,
}

#[derive(Deserialize)]
struct CargoPackage {
    version: Option<String>,
}

#[derive(Deserialize)]
struct PackageJson {
    version: Option<String>,
}

#[derive(Deserialize)]
struct PyProject {
    project: Option<PyProjectTable>,
}

#[derive(Deserialize)]
struct PyProjectTable {
    version: Option<String>,
}

fn read_version_file(tree: &Utf8Path) -> Option<String> {
    let text = std::fs::read_to_string(tree.join("VERSION")).ok()?;
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

fn manifest_version(spec: &ToolSpec, tree: &Utf8Path) -> DsrResult<Option<String>> {
    let found = match spec.language {
        Language::Rust => {
            let path = tree.join("Cargo.toml");
            if path.exists() {
                let manifest: CargoManifest = toml::from_str(&std::fs::read_to_string(&path)?)
                    .map_err(|e| DsrError::VersionDetect {
                        tool: spec.name.clone(),
                        reason: format!("{path}: {e}"),
                    })?;
                manifest.package.and_then(|p| p.version)
            } else {
                None
            }
        }
        Language::Node => {
            let path = tree.join("package.json");
            if path.exists() {
                let manifest: PackageJson = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
                manifest.version
            } else {
                None
            }
        }
        Language::Python => {
            let path = tree.join("pyproject.toml");
            if path.exists() {
                let manifest: PyProject = toml::from_str(&std::fs::read_to_string(&path)?)
                    .map_err(|e| DsrError::VersionDetect {
                        tool: spec.name.clone(),
                        reason: format!("{path}: {e}"),
                    })?;
                manifest.project.and_then(|p| p.version)
            } else {
                None
            }
        }
        // go modules don't carry a version; generic projects have no manifest
        Language::Go | Language::Generic => None,
    };
    Ok(found)
}

/// Detect the current version of a tool, as the user would write it
///
/// Order: the language manifest, then a `VERSION` file. The returned string
/// keeps whatever `v` prefix the source had; filename rendering strips it
/// later, tags keep it.
pub fn detect_version(spec: &ToolSpec) -> DsrResult<String> {
    let Some(tree) = &spec.local_path else {
        return Err(DsrError::VersionDetect {
            tool: spec.name.clone(),
            reason: "no local_path to inspect".to_owned(),
        });
    };
    if let Some(version) = manifest_version(spec, tree)? {
        // sanity-parse so garbage manifests fail here, not in asset names
        Version::parse(version.trim_start_matches('v'))?;
        return Ok(version);
    }
    if let Some(version) = read_version_file(tree) {
        Version::parse(version.trim_start_matches('v'))?;
        return Ok(version);
    }
    Err(DsrError::VersionDetect {
        tool: spec.name.clone(),
        reason: "no language manifest or VERSION file found".to_owned(),
    })
}

/// The tag name for a version (always `v`-prefixed)
pub fn tag_for(version: &str) -> String {
    if version.starts_with('v') {
        version.to_owned()
    } else {
        format!("v{version}")
    }
}

/// The HEAD commit of the working tree, if it is a git checkout
pub fn git_sha(tree: &Utf8Path) -> Option<String> {
    let output = Cmd::new("git", "read the working tree's HEAD commit")
        .arg("-C")
        .arg(tree)
        .arg("rev-parse")
        .arg("HEAD")
        .log(None)
        .output()
        .ok()?;
    let sha = String::from_utf8(output.stdout).ok()?.trim().to_owned();
    (!sha.is_empty()).then_some(sha)
}

/// Create the release tag in the working tree unless it already exists
pub fn ensure_tag(spec: &ToolSpec, version: &str) -> DsrResult<()> {
    let Some(tree) = &spec.local_path else {
        return Ok(());
    };
    let tag = tag_for(version);
    let existing = Cmd::new("git", "check whether the release tag exists")
        .arg("-C")
        .arg(tree)
        .arg("tag")
        .arg("--list")
        .arg(&tag)
        .log(None)
        .output()?;
    if !String::from_utf8_lossy(&existing.stdout).trim().is_empty() {
        return Ok(());
    }
    info!("tagging {} as {tag}", spec.name);
    Cmd::new("git", "create the release tag")
        .arg("-C")
        .arg(tree)
        .arg("tag")
        .arg(&tag)
        .run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use temp_dir::TempDir;

    fn spec_in(dir: &TempDir, language: Language) -> ToolSpec {
        let tree = Utf8PathBuf::try_from(dir.path().to_owned()).unwrap();
        ToolSpec {
            name: "mytool".to_owned(),
            repo: Some("me/mytool".to_owned()),
            local_path: Some(tree),
            language,
            build_cmd: "make".to_owned(),
            binary_name: None,
            targets: vec![],
            archive_format: Default::default(),
            artifact_naming: None,
            install_script_compat: None,
            target_triples: Default::default(),
            act_job_map: Default::default(),
            workflow: None,
            checks: vec![],
            host_paths: Default::default(),
        }
    }

    #[test]
    fn detects_cargo_version() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("Cargo.toml"),
            "[package]\nname = \"mytool\"\nversion = \"1.2.3\"\n",
        )
        .unwrap();
        let spec = spec_in(&dir, Language::Rust);
        assert_eq!(detect_version(&spec).unwrap(), "1.2.3");
    }

    #[test]
    fn detects_package_json_version() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name": "mytool", "version": "2.0.0"}"#,
        )
        .unwrap();
        let spec = spec_in(&dir, Language::Node);
        assert_eq!(detect_version(&spec).unwrap(), "2.0.0");
    }

    #[test]
    fn version_file_is_the_fallback() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("VERSION"), "v3.1.4\n").unwrap();
        let spec = spec_in(&dir, Language::Go);
        assert_eq!(detect_version(&spec).unwrap(), "v3.1.4");
    }

    #[test]
    fn garbage_version_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("VERSION"), "not-a-version\n").unwrap();
        let spec = spec_in(&dir, Language::Generic);
        assert!(detect_version(&spec).is_err());
    }

    #[test]
    fn nothing_found_is_an_error() {
        let dir = TempDir::new().unwrap();
        let spec = spec_in(&dir, Language::Generic);
        let err = detect_version(&spec).unwrap_err();
        assert!(matches!(err, DsrError::VersionDetect { .. }));
    }

    #[test]
    fn tags_are_v_prefixed() {
        assert_eq!(tag_for("1.2.3"), "v1.2.3");
        assert_eq!(tag_for("v1.2.3"), "v1.2.3");
    }
}
