//! Resource appliers.
//!
//! Each applier renders the desired content of one managed artifact from the
//! desired config and host facts, compares it with what is on disk, and only
//! writes when they differ. The same comparison backs the read-only status
//! check, so `status` reports exactly what `install` would change.

pub mod certs;
pub mod env_file;
pub mod hosts;
pub mod proxy;
pub mod tunnel;

pub use certs::CertificateApplier;
pub use env_file::EnvFileApplier;
pub use hosts::{HostsApplier, HostsState};
pub use proxy::{render_site, ProxySiteApplier, SiteSpec};
pub use tunnel::{render_ingress, TunnelApplier, TunnelClient, TunnelInfo, TunnelReport};

use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::exec::HostFs;

// ============================================================================
// Resource Records
// ============================================================================

/// Category of a managed artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    ProxySite,
    Certificate,
    TunnelConfig,
    HostsEntry,
    EnvFile,
    Service,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProxySite => "proxy-site",
            Self::Certificate => "certificate",
            Self::TunnelConfig => "tunnel-config",
            Self::HostsEntry => "hosts-entry",
            Self::EnvFile => "env-file",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Outcome {
    /// Written or started during this run.
    Applied,
    /// Already in the desired state.
    Unchanged,
    /// Would be written or started (dry-run and status).
    Planned,
    /// Not attempted because a prerequisite is missing.
    Skipped { reason: String },
    Failed { reason: String },
}

impl Outcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl fmt::Display) -> Self {
        Self::Failed {
            reason: reason.to_string(),
        }
    }
}

/// One managed artifact and the outcome of reconciling it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub target: PathBuf,
    /// Rendered desired content, with secrets redacted.
    pub desired: String,
    pub outcome: Outcome,
}

impl ResourceRecord {
    pub fn new(kind: ResourceKind, target: impl Into<PathBuf>, desired: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            desired: desired.into(),
            outcome: Outcome::Planned,
        }
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// A record for a resource that could not even be rendered.
    pub fn skipped(kind: ResourceKind, target: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::new(kind, target, String::new()).with_outcome(Outcome::skipped(reason))
    }

    pub fn changed(&self) -> bool {
        self.outcome == Outcome::Applied
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Outcome::Failed { .. })
    }
}

// ============================================================================
// File Helpers
// ============================================================================

/// Compares a file on disk with its desired content.
pub async fn inspect_file(fs: &HostFs, path: &Path, desired: &str) -> Outcome {
    match fs.read_to_string(path).await {
        Ok(Some(current)) if current == desired => Outcome::Unchanged,
        _ => Outcome::Planned,
    }
}

/// Writes `desired` to `path` when it differs from the current content.
///
/// Returns `Unchanged` without touching the file when it already matches,
/// `Planned` in dry-run mode, `Applied` after a write.
pub async fn sync_file(fs: &HostFs, path: &Path, desired: &str, mode: Option<u32>) -> Result<Outcome> {
    if fs.read_to_string(path).await?.as_deref() == Some(desired) {
        return Ok(Outcome::Unchanged);
    }
    fs.write(path, desired, mode).await?;
    Ok(if fs.is_dry_run() {
        Outcome::Planned
    } else {
        Outcome::Applied
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeRunner;
    use crate::exec::Elevation;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sync_file_writes_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc/app.conf");
        let fs = HostFs::new(Arc::new(FakeRunner::new()), Elevation::Direct, false);

        assert_eq!(sync_file(&fs, &path, "a = 1\n", None).await.unwrap(), Outcome::Applied);
        assert_eq!(sync_file(&fs, &path, "a = 1\n", None).await.unwrap(), Outcome::Unchanged);
        assert_eq!(inspect_file(&fs, &path, "a = 1\n").await, Outcome::Unchanged);
        assert_eq!(inspect_file(&fs, &path, "a = 2\n").await, Outcome::Planned);
    }

    #[tokio::test]
    async fn test_sync_file_dry_run_is_planned() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.conf");
        let fs = HostFs::new(Arc::new(FakeRunner::new()), Elevation::Direct, true);

        assert_eq!(sync_file(&fs, &path, "x", None).await.unwrap(), Outcome::Planned);
        assert!(!path.exists());
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(Outcome::skipped("nginx missing")).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "nginx missing");
    }
}
