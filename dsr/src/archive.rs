//! The archive packer
//!
//! Packs one built binary into the configured archive format. Packing is
//! deterministic: entries are added in a fixed order with a pinned mtime,
//! zeroed owner ids, and normalized modes, and the compressors run at fixed
//! levels with no embedded filenames or timestamps. Two byte-identical
//! inputs produce two byte-identical archives, which is what lets a local
//! release match an upstream one.

use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::{Compression, GzBuilder};
use tracing::info;
use xz2::write::XzEncoder;
use zip::write::FileOptions;
use zip::CompressionMethod;

use crate::errors::DsrResult;
use crate::naming::DualName;
use crate::platform::{ArchiveFormat, Os};

/// The mtime every archive entry carries (1980-01-01, the zip epoch)
const ARCHIVE_MTIME: u64 = 315532800;
/// gzip level; fixed so output is reproducible
const GZ_LEVEL: u32 = 6;
/// xz preset; fixed so output is reproducible
const XZ_PRESET: u32 = 6;

/// One file the packer produced
#[derive(Debug, Clone)]
pub struct PackedFile {
    /// The asset name
    pub filename: String,
    /// Where it was written
    pub path: Utf8PathBuf,
}

fn tar_into<W: Write>(writer: W, entry_name: &str, data: &[u8]) -> DsrResult<W> {
    let mut tar = tar::Builder::new(writer);
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o755);
    header.set_mtime(ARCHIVE_MTIME);
    header.set_uid(0);
    header.set_gid(0);
    // append_data writes the path into the header and fixes the checksum
    tar.append_data(&mut header, entry_name, data)?;
    Ok(tar.into_inner()?)
}

fn pack_tar_gz(binary: &[u8], entry_name: &str, dest: &Utf8Path) -> DsrResult<()> {
    let file = std::fs::File::create(dest)?;
    // GzBuilder's defaults (no filename, mtime 0) keep the stream reproducible
    let encoder = GzBuilder::new().write(file, Compression::new(GZ_LEVEL));
    let encoder = tar_into(encoder, entry_name, binary)?;
    encoder.finish()?;
    Ok(())
}

fn pack_tar_xz(binary: &[u8], entry_name: &str, dest: &Utf8Path) -> DsrResult<()> {
    let file = std::fs::File::create(dest)?;
    let encoder = XzEncoder::new(file, XZ_PRESET);
    let encoder = tar_into(encoder, entry_name, binary)?;
    encoder.finish()?;
    Ok(())
}

fn pack_zip(binary: &[u8], entry_name: &str, dest: &Utf8Path) -> DsrResult<()> {
    let file = std::fs::File::create(dest)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        // zip::DateTime::default() is the 1980-01-01 epoch
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o755);
    zip.start_file(entry_name, options)?;
    zip.write_all(binary)?;
    zip.finish()?;
    Ok(())
}

/// Pack a binary into its dual-named release assets
///
/// Produces the versioned archive and, when the compat name differs, a
/// byte-identical copy under the compat name. With `reuse` set, an archive
/// already on disk is kept as-is instead of being recomputed.
pub fn pack(
    binary_path: &Utf8Path,
    binary_name: &str,
    os: Os,
    format: ArchiveFormat,
    dual: &DualName,
    out_dir: &Utf8Path,
    reuse: bool,
) -> DsrResult<Vec<PackedFile>> {
    let versioned_path = out_dir.join(&dual.versioned);
    let entry_name = format!("{binary_name}{}", os.exe_suffix());

    if reuse && versioned_path.exists() {
        info!("archive already produced for {}", dual.versioned);
    } else {
        let data = std::fs::read(binary_path)?;
        match format {
            ArchiveFormat::TarGz | ArchiveFormat::Tgz => {
                pack_tar_gz(&data, &entry_name, &versioned_path)?
            }
            ArchiveFormat::TarXz => pack_tar_xz(&data, &entry_name, &versioned_path)?,
            ArchiveFormat::Zip => pack_zip(&data, &entry_name, &versioned_path)?,
            ArchiveFormat::Binary => {
                std::fs::copy(binary_path, &versioned_path)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(
                        &versioned_path,
                        std::fs::Permissions::from_mode(0o755),
                    )?;
                }
            }
        }
    }

    let mut packed = vec![PackedFile {
        filename: dual.versioned.clone(),
        path: versioned_path.clone(),
    }];

    if !dual.same {
        let compat_path = out_dir.join(&dual.compat);
        if !(reuse && compat_path.exists()) {
            std::fs::copy(&versioned_path, &compat_path)?;
        }
        packed.push(PackedFile {
            filename: dual.compat.clone(),
            path: compat_path,
        });
    }

    Ok(packed)
}
