//! Core types for tool acquisition: tool identifiers and artifact kinds.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Tool Identifiers
// ============================================================================

/// Binaries the acquirer knows how to obtain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolId {
    /// Tunnel client.
    Cloudflared,
    /// Local certificate authority tool.
    Mkcert,
}

impl ToolId {
    pub fn all() -> &'static [ToolId] {
        &[Self::Cloudflared, Self::Mkcert]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloudflared => "cloudflared",
            Self::Mkcert => "mkcert",
        }
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ToolId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cloudflared" | "tunnel" => Ok(Self::Cloudflared),
            "mkcert" => Ok(Self::Mkcert),
            _ => Err(format!("Unknown tool: {}", s)),
        }
    }
}

// ============================================================================
// Artifact Kinds
// ============================================================================

/// What a downloaded artifact is, inferred from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// Debian package (.deb).
    Deb,
    /// RPM package (.rpm).
    Rpm,
    /// Gzip-compressed tar archive (.tar.gz, .tgz).
    TarGz,
    /// XZ-compressed tar archive (.tar.xz).
    TarXz,
    /// ZIP archive (.zip).
    Zip,
    /// A bare executable.
    Binary,
}

impl ArtifactKind {
    /// Infers the kind from a URL or file name. Anything without a known
    /// suffix is treated as a bare executable.
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        let lower = lower.split(['?', '#']).next().unwrap_or_default();
        if lower.ends_with(".deb") {
            Self::Deb
        } else if lower.ends_with(".rpm") {
            Self::Rpm
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Self::TarGz
        } else if lower.ends_with(".tar.xz") {
            Self::TarXz
        } else if lower.ends_with(".zip") {
            Self::Zip
        } else {
            Self::Binary
        }
    }

    pub fn is_archive(&self) -> bool {
        matches!(self, Self::TarGz | Self::TarXz | Self::Zip)
    }

    pub fn is_native_package(&self) -> bool {
        matches!(self, Self::Deb | Self::Rpm)
    }

    /// Extension used by the package tool for native packages.
    pub fn package_ext(&self) -> Option<&'static str> {
        match self {
            Self::Deb => Some("deb"),
            Self::Rpm => Some("rpm"),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Deb => "deb",
            Self::Rpm => "rpm",
            Self::TarGz => "tar.gz",
            Self::TarXz => "tar.xz",
            Self::Zip => "zip",
            Self::Binary => "binary",
        };
        write!(f, "{}", s)
    }
}
