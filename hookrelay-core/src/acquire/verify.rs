//! Artifact verification.
//!
//! A downloaded artifact is accepted only if it is non-empty, at least the
//! tool's minimum size, does not look like an HTML error page, and starts
//! with the magic bytes of its kind.

use std::io::Read;
use std::path::Path;
use thiserror::Error;

use super::types::ArtifactKind;

/// Bytes inspected at the start of an artifact.
const HEAD_LEN: usize = 512;

const ELF: &[u8] = &[0x7f, b'E', b'L', b'F'];
const MACHO_32: &[u8] = &[0xce, 0xfa, 0xed, 0xfe];
const MACHO_64: &[u8] = &[0xcf, 0xfa, 0xed, 0xfe];
const MACHO_FAT: &[u8] = &[0xca, 0xfe, 0xba, 0xbe];
const AR: &[u8] = b"!<arch>\n";
const RPM_LEAD: &[u8] = &[0xed, 0xab, 0xee, 0xdb];
const GZIP: &[u8] = &[0x1f, 0x8b];
const XZ: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const ZIP: &[u8] = &[b'P', b'K', 0x03, 0x04];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("artifact is empty")]
    Empty,
    #[error("artifact is {size} bytes, expected at least {min}")]
    TooSmall { size: u64, min: u64 },
    #[error("artifact is an HTML page, not a {kind}")]
    HtmlErrorPage { kind: ArtifactKind },
    #[error("artifact does not look like a {kind}")]
    BadMagic { kind: ArtifactKind },
    #[error("archive does not contain {0}")]
    MissingExecutable(String),
    #[error("cannot read artifact: {0}")]
    Unreadable(String),
    #[error("SHA-256 mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// Checks an artifact on disk.
pub fn verify_artifact(path: &Path, kind: ArtifactKind, min_size: u64) -> Result<u64, VerifyError> {
    let size = std::fs::metadata(path)
        .map_err(|e| VerifyError::Unreadable(e.to_string()))?
        .len();

    let mut head = Vec::with_capacity(HEAD_LEN);
    std::fs::File::open(path)
        .and_then(|f| f.take(HEAD_LEN as u64).read_to_end(&mut head))
        .map_err(|e| VerifyError::Unreadable(e.to_string()))?;

    check_bytes(&head, size, kind, min_size)?;
    Ok(size)
}

/// Checks the leading bytes and total size of an artifact.
pub fn check_bytes(head: &[u8], size: u64, kind: ArtifactKind, min_size: u64) -> Result<(), VerifyError> {
    if size == 0 || head.is_empty() {
        return Err(VerifyError::Empty);
    }
    if looks_like_html(head) {
        return Err(VerifyError::HtmlErrorPage { kind });
    }
    if size < min_size {
        return Err(VerifyError::TooSmall { size, min: min_size });
    }
    if !has_magic(head, kind) {
        return Err(VerifyError::BadMagic { kind });
    }
    Ok(())
}

fn looks_like_html(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head).to_lowercase();
    let text = text.trim_start();
    text.starts_with("<!doctype html") || text.starts_with("<html") || text.contains("<html")
}

fn has_magic(head: &[u8], kind: ArtifactKind) -> bool {
    let candidates: &[&[u8]] = match kind {
        ArtifactKind::Binary => &[ELF, MACHO_32, MACHO_64, MACHO_FAT],
        ArtifactKind::Deb => &[AR],
        ArtifactKind::Rpm => &[RPM_LEAD],
        ArtifactKind::TarGz => &[GZIP],
        ArtifactKind::TarXz => &[XZ],
        ArtifactKind::Zip => &[ZIP],
    };
    candidates.iter().any(|magic| head.starts_with(magic))
}
