//! Unpacking of downloaded tool archives.
//!
//! Handles zip, tar.gz and tar.xz. Only directories and regular files are
//! written; absolute paths, `..` components and link entries are dropped so
//! nothing lands outside the staging directory.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use super::types::ArtifactKind;

/// Unpacks `archive` into `dest`.
pub fn extract_archive(archive: &Path, dest: &Path, kind: ArtifactKind) -> Result<()> {
    info!("Unpacking {} ({}) into {}", archive.display(), kind, dest.display());
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;

    let open = || File::open(archive).with_context(|| format!("Failed to open {}", archive.display()));
    let written = match kind {
        ArtifactKind::Zip => unpack_zip(open()?, dest),
        ArtifactKind::TarGz => unpack_tar(flate2::read::GzDecoder::new(BufReader::new(open()?)), dest),
        ArtifactKind::TarXz => unpack_tar(xz2::read::XzDecoder::new(BufReader::new(open()?)), dest),
        other => anyhow::bail!("{} is not an archive", other),
    }
    .with_context(|| format!("Failed to unpack {}", archive.display()))?;

    debug!("Unpacked {} file(s)", written);
    Ok(())
}

/// Finds a regular file named `name` anywhere below `dir`.
pub fn find_executable(dir: &Path, name: &str) -> Option<PathBuf> {
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = fs::read_dir(&current) else { continue };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else { continue };
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && entry.file_name().to_str() == Some(name) {
                return Some(path);
            }
        }
    }
    None
}

// ============================================================================
// Entry Handling
// ============================================================================

/// Target of an archive entry below `dest`, or `None` when the entry name
/// could escape it.
fn entry_target(dest: &Path, name: &Path) -> Option<PathBuf> {
    let mut target = dest.to_path_buf();
    for component in name.components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (target != dest).then_some(target)
}

/// Writes one regular file, keeping the executable bit when the archive
/// carries one.
fn write_file(reader: &mut impl Read, target: &Path, mode: Option<u32>) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    // Replace rather than follow anything already at the target.
    if fs::symlink_metadata(target).is_ok() {
        fs::remove_file(target).with_context(|| format!("Failed to replace {}", target.display()))?;
    }
    let mut out = File::create(target).with_context(|| format!("Failed to create {}", target.display()))?;
    io::copy(reader, &mut out)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = mode.filter(|m| m & 0o111 != 0) {
            fs::set_permissions(target, fs::Permissions::from_mode(mode | 0o755))
                .with_context(|| format!("Failed to set permissions on {}", target.display()))?;
        }
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

// ============================================================================
// Formats
// ============================================================================

fn unpack_zip(file: File, dest: &Path) -> Result<usize> {
    let mut archive = zip::ZipArchive::new(file)?;
    let mut written = 0;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(target) = entry.enclosed_name().and_then(|name| entry_target(dest, &name)) else {
            warn!("Skipping zip entry {:?}", entry.name());
            continue;
        };
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            let mode = entry.unix_mode();
            write_file(&mut entry, &target, mode)?;
            written += 1;
        }
    }
    Ok(written)
}

fn unpack_tar(reader: impl Read, dest: &Path) -> Result<usize> {
    let mut archive = tar::Archive::new(reader);
    let mut written = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        let name = entry.path()?.into_owned();

        if !(kind.is_file() || kind.is_dir()) {
            warn!("Skipping {:?} entry {}", kind, name.display());
            continue;
        }
        let Some(target) = entry_target(dest, &name) else {
            warn!("Skipping tar entry {}", name.display());
            continue;
        };

        if kind.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            let mode = entry.header().mode().ok();
            write_file(&mut entry, &target, mode)?;
            written += 1;
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn tar_gz(path: &Path, entries: &[(&str, &[u8], u32)]) {
        let file = File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data, mode) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_extract_tar_gz_and_find_executable() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("cloudflared-darwin-amd64.tgz");
        let extract_dir = temp_dir.path().join("extracted");
        tar_gz(
            &archive_path,
            &[
                ("README.md", b"docs", 0o644),
                ("bin/cloudflared", b"\x7fELF....", 0o755),
            ],
        );

        extract_archive(&archive_path, &extract_dir, ArtifactKind::TarGz).unwrap();

        let found = find_executable(&extract_dir, "cloudflared").unwrap();
        assert_eq!(found, extract_dir.join("bin/cloudflared"));
        assert!(find_executable(&extract_dir, "mkcert").is_none());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&found).unwrap().permissions().mode();
            assert_ne!(mode & 0o111, 0);
        }
    }

    #[test]
    fn test_extract_zip_simple() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("tool.zip");
        let extract_dir = temp_dir.path().join("extracted");

        {
            let file = File::create(&archive_path).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            zip.start_file("tool/mkcert", options).unwrap();
            zip.write_all(b"binary").unwrap();
            zip.finish().unwrap();
        }

        extract_archive(&archive_path, &extract_dir, ArtifactKind::Zip).unwrap();
        assert!(extract_dir.join("tool/mkcert").exists());
    }

    #[test]
    fn test_extract_tar_xz_simple() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("tool.tar.xz");
        let extract_dir = temp_dir.path().join("extracted");

        {
            let file = File::create(&archive_path).unwrap();
            let encoder = xz2::write::XzEncoder::new(file, 6);
            let mut builder = tar::Builder::new(encoder);
            let data = b"payload";
            let mut header = tar::Header::new_gnu();
            header.set_path("payload.txt").unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, &data[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        extract_archive(&archive_path, &extract_dir, ArtifactKind::TarXz).unwrap();
        assert_eq!(
            fs::read_to_string(extract_dir.join("payload.txt")).unwrap(),
            "payload"
        );
    }

    #[test]
    fn test_non_archive_kinds_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("x.deb");
        fs::write(&path, b"!<arch>\n").unwrap();
        assert!(extract_archive(&path, &temp_dir.path().join("out"), ArtifactKind::Deb).is_err());
    }

    #[test]
    fn test_tar_symlink_escape_blocked() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("malicious.tar.gz");
        let extract_dir = temp_dir.path().join("extracted");
        let escape_target = temp_dir.path().join("escaped_file.txt");

        {
            let file = File::create(&archive_path).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            builder
                .append_link(&mut header, "escape_link", "../escaped_file.txt")
                .unwrap();

            let data = b"must stay inside";
            let mut file_header = tar::Header::new_gnu();
            file_header.set_path("escape_link").unwrap();
            file_header.set_size(data.len() as u64);
            file_header.set_mode(0o644);
            file_header.set_cksum();
            builder.append(&file_header, &data[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        extract_archive(&archive_path, &extract_dir, ArtifactKind::TarGz).unwrap();
        assert!(!escape_target.exists());
        assert!(extract_dir.join("escape_link").is_file());
    }
}
