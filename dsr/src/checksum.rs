//! Checksums and the release manifest
//!
//! Every final asset gets a SHA-256; the set is written twice, once as the
//! `SHA256SUMS` text file installers consume and once as the JSON manifest
//! the verifier replays against the remote release.

use std::fmt::Write as _;
use std::io::Read;

use camino::Utf8Path;
use dsr_schema::{ArtifactEntry, BuildRecord, Manifest, MANIFEST_SCHEMA_VERSION};
use sha2::Digest;

use crate::errors::DsrResult;

/// SHA-256 of a file, streamed, as 64 lowercase hex chars
pub fn sha256_file(path: &Utf8Path) -> DsrResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = sha2::Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex_string(&hasher.finalize()))
}

/// SHA-256 of a byte slice, as 64 lowercase hex chars
pub fn sha256_bytes(data: &[u8]) -> String {
    hex_string(&sha2::Sha256::digest(data))
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(&mut out, "{byte:02x}").expect("writing to a String can't fail");
    }
    out
}

/// An ArtifactEntry for a file on disk, hashing it in the process
pub fn artifact_entry(path: &Utf8Path, filename: &str, target: &str) -> DsrResult<ArtifactEntry> {
    let sha256 = sha256_file(path)?;
    let size_bytes = std::fs::metadata(path)?.len();
    Ok(ArtifactEntry {
        filename: filename.to_owned(),
        target: target.to_owned(),
        path: Some(path.to_string()),
        sha256,
        size_bytes,
    })
}

/// Render the `SHA256SUMS` body: `<hex>  *<basename>` per line, sorted
/// ascending by basename, trailing newline
pub fn render_sha256sums(entries: &[ArtifactEntry]) -> String {
    let mut lines: Vec<(String, String)> = entries
        .iter()
        .map(|e| (e.filename.clone(), e.sha256.clone()))
        .collect();
    lines.sort();
    let mut out = String::new();
    for (filename, sha) in lines {
        out.push_str(&sha);
        out.push_str("  *");
        out.push_str(&filename);
        out.push('\n');
    }
    out
}

/// Write `SHA256SUMS` next to the assets and return its artifact entry
pub fn write_sha256sums(entries: &[ArtifactEntry], out_dir: &Utf8Path) -> DsrResult<ArtifactEntry> {
    let path = out_dir.join("SHA256SUMS");
    std::fs::write(&path, render_sha256sums(entries))?;
    artifact_entry(&path, "SHA256SUMS", "checksums")
}

/// The manifest asset name for a `(tool, version)`
pub fn manifest_filename(tool: &str, version: &str) -> String {
    format!("{tool}-{version}-manifest.json")
}

/// Build the Manifest for a finalised record
pub fn build_manifest(record: &BuildRecord, git_sha: Option<String>) -> Manifest {
    Manifest {
        schema_version: MANIFEST_SCHEMA_VERSION.to_owned(),
        tool: record.tool.clone(),
        version: record.version.clone(),
        run_id: record.run_id.clone(),
        git_sha,
        built_at: dsr_schema::rfc3339_now(),
        artifacts: record.artifacts.clone(),
    }
}

/// Write a manifest as pretty JSON with a trailing newline
pub fn write_manifest(manifest: &Manifest, path: &Utf8Path) -> DsrResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(manifest)? + "\n";
    std::fs::write(path, contents)?;
    Ok(())
}

/// Read a manifest back
pub fn load_manifest(path: &Utf8Path) -> DsrResult<Manifest> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
