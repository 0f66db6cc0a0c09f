//! The three acquisition strategies, tried in order by the acquirer.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::catalog::{ToolDefinition, VendorRepo};
use super::downloader::Fetcher;
use super::installer::ArtifactInstaller;
use super::release::{checksum_asset, latest_release_url, parse_checksum, parse_release, select_asset, ReleaseAsset};
use super::types::ArtifactKind;
use super::verify::VerifyError;
use super::StrategyError;
use crate::exec::{which_in, HostFs};
use crate::package::{PackageError, PackageManager, PackageManagerId};
use crate::paths::HostPaths;
use crate::probe::HostFacts;
use crate::retry::{retry, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// The host's package manager, optionally with a vendor repository.
    PrimaryChannel,
    /// An asset from the project's published release metadata.
    ReleaseIndex,
    /// A fixed versionless "latest" URL.
    DirectUrl,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PrimaryChannel => "primary-channel",
            Self::ReleaseIndex => "release-index",
            Self::DirectUrl => "direct-url",
        };
        write!(f, "{}", s)
    }
}

/// One way of obtaining a tool.
#[async_trait]
pub trait AcquisitionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Installs the tool and returns the executable's path.
    async fn acquire(&self, tool: &ToolDefinition, facts: &HostFacts) -> Result<PathBuf, StrategyError>;
}

// ============================================================================
// Primary Channel
// ============================================================================

pub struct PrimaryChannel {
    pm: Arc<dyn PackageManager>,
    fs: HostFs,
    fetcher: Arc<dyn Fetcher>,
    paths: HostPaths,
    policy: RetryPolicy,
}

impl PrimaryChannel {
    pub fn new(
        pm: Arc<dyn PackageManager>,
        fs: HostFs,
        fetcher: Arc<dyn Fetcher>,
        paths: HostPaths,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            pm,
            fs,
            fetcher,
            paths,
            policy,
        }
    }

    /// Adds the vendor repository for the host's package tool if missing.
    async fn ensure_vendor_repo(&self, repo: &VendorRepo, facts: &HostFacts) -> Result<(), StrategyError> {
        match self.pm.id() {
            PackageManagerId::Apt => {
                let Some(codename) = facts.distro_codename.as_deref() else {
                    debug!("No distribution codename; skipping vendor repository");
                    return Ok(());
                };
                let keyring = self.paths.keyring_dir.join(repo.apt_keyring_name);
                let list = self.paths.apt_sources_dir.join(repo.apt_list_name);
                let line = format!(
                    "{}\n",
                    repo.apt_source_line(&keyring.to_string_lossy(), codename)
                );

                let current = self.fs.read_to_string(&list).await.ok().flatten();
                if current.as_deref() == Some(line.as_str()) && keyring.exists() {
                    debug!("Vendor repository already configured: {}", list.display());
                    return Ok(());
                }

                let staged = self.paths.temp_dir.join(repo.apt_keyring_name);
                download(self.fetcher.as_ref(), self.policy, repo.apt_key_url, &staged, None).await?;
                let installed = self.fs.install_file(&staged, &keyring, 0o644).await;
                let _ = tokio::fs::remove_file(&staged).await;
                installed.map_err(|e| StrategyError::Install(format!("{:#}", e)))?;

                self.fs
                    .write(&list, &line, Some(0o644))
                    .await
                    .map_err(|e| StrategyError::Install(format!("{:#}", e)))?;
                info!("Added vendor repository {}", list.display());
            }
            PackageManagerId::Dnf | PackageManagerId::Yum => {
                let file = self.paths.yum_repos_dir.join(repo.rpm_repo_name);
                let current = self.fs.read_to_string(&file).await.ok().flatten();
                if current.as_deref() == Some(repo.rpm_repo_content) {
                    debug!("Vendor repository already configured: {}", file.display());
                    return Ok(());
                }
                self.fs
                    .write(&file, repo.rpm_repo_content, Some(0o644))
                    .await
                    .map_err(|e| StrategyError::Install(format!("{:#}", e)))?;
                info!("Added vendor repository {}", file.display());
            }
            _ => return Ok(()),
        }

        self.pm.invalidate_index();
        Ok(())
    }
}

#[async_trait]
impl AcquisitionStrategy for PrimaryChannel {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PrimaryChannel
    }

    async fn acquire(&self, tool: &ToolDefinition, facts: &HostFacts) -> Result<PathBuf, StrategyError> {
        let manager = self.pm.id();
        let package = tool.package_for(manager).ok_or_else(|| {
            StrategyError::NotApplicable(format!("{} does not package {}", manager, tool.binary))
        })?;

        if let Some(repo) = &tool.vendor_repo {
            self.ensure_vendor_repo(repo, facts).await?;
        }

        self.pm.install(&[package]).await.map_err(|e| match e {
            PackageError::NoPackageManager => StrategyError::NotApplicable(e.to_string()),
            PackageError::RefreshFailed { .. } => StrategyError::Network(e.to_string()),
            PackageError::InstallFailed { .. } => StrategyError::Install(e.to_string()),
        })?;

        let mut dirs = vec![self.paths.bin_dir.clone()];
        dirs.extend(self.paths.search_path.iter().cloned());
        which_in(tool.binary, &dirs).ok_or_else(|| {
            StrategyError::Install(format!(
                "{} installed but {} is not on the search path",
                package, tool.binary
            ))
        })
    }
}

// ============================================================================
// Published Release Index
// ============================================================================

pub struct ReleaseIndex {
    fetcher: Arc<dyn Fetcher>,
    installer: Arc<ArtifactInstaller>,
    policy: RetryPolicy,
}

impl ReleaseIndex {
    pub fn new(fetcher: Arc<dyn Fetcher>, installer: Arc<ArtifactInstaller>, policy: RetryPolicy) -> Self {
        Self {
            fetcher,
            installer,
            policy,
        }
    }

    /// The asset's digest from the metadata, else from a published checksum
    /// file.
    async fn expected_sha256(&self, assets: &[ReleaseAsset], asset: &ReleaseAsset) -> Option<String> {
        if let Some(digest) = asset.sha256() {
            return Some(digest.to_lowercase());
        }
        let listing = checksum_asset(assets, &asset.name)?;
        let what = format!("checksums for {}", asset.name);
        match retry(self.policy, &what, |_| self.fetcher.get_text(&listing.browser_download_url)).await {
            Ok(body) => parse_checksum(&body, &asset.name),
            Err(e) => {
                warn!("Could not fetch {}: {:#}", listing.name, e);
                None
            }
        }
    }
}

#[async_trait]
impl AcquisitionStrategy for ReleaseIndex {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ReleaseIndex
    }

    async fn acquire(&self, tool: &ToolDefinition, facts: &HostFacts) -> Result<PathBuf, StrategyError> {
        let repo = tool.github_repo.ok_or_else(|| {
            StrategyError::NotApplicable(format!("{} has no release index", tool.binary))
        })?;

        let url = latest_release_url(repo);
        let what = format!("release metadata for {}", tool.binary);
        let body = retry(self.policy, &what, |_| self.fetcher.get_text(&url))
            .await
            .map_err(|e| StrategyError::Network(format!("{:#}", e)))?;
        let release = parse_release(&body)
            .map_err(|e| StrategyError::Network(format!("malformed release metadata: {}", e)))?;

        let asset = select_asset(&release.assets, facts.os, &facts.arch, facts.package_manager)
            .ok_or_else(|| {
                StrategyError::NotApplicable(format!(
                    "release {} has no asset for {:?}/{}",
                    release.tag_name, facts.os, facts.arch
                ))
            })?;
        info!("Selected {} from release {}", asset.name, release.tag_name);

        let file_name = Path::new(&asset.name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| tool.binary.to_string());
        let expected = self.expected_sha256(&release.assets, asset).await;
        if expected.is_none() {
            debug!("No published checksum for {}", asset.name);
        }
        let staged = self.installer.temp_dir().join(file_name);
        download(
            self.fetcher.as_ref(),
            self.policy,
            &asset.browser_download_url,
            &staged,
            expected.as_deref(),
        )
        .await?;

        self.installer
            .install(tool, &staged, ArtifactKind::from_name(&asset.name))
            .await
    }
}

// ============================================================================
// Direct Well-Known URL
// ============================================================================

pub struct DirectUrl {
    fetcher: Arc<dyn Fetcher>,
    installer: Arc<ArtifactInstaller>,
    policy: RetryPolicy,
}

impl DirectUrl {
    pub fn new(fetcher: Arc<dyn Fetcher>, installer: Arc<ArtifactInstaller>, policy: RetryPolicy) -> Self {
        Self {
            fetcher,
            installer,
            policy,
        }
    }
}

#[async_trait]
impl AcquisitionStrategy for DirectUrl {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DirectUrl
    }

    async fn acquire(&self, tool: &ToolDefinition, facts: &HostFacts) -> Result<PathBuf, StrategyError> {
        let url = tool.direct_url(facts.os, &facts.arch).ok_or_else(|| {
            StrategyError::NotApplicable(format!(
                "no direct download of {} for {:?}/{}",
                tool.binary, facts.os, facts.arch
            ))
        })?;

        let staged = self
            .installer
            .temp_dir()
            .join(format!("{}-direct", tool.binary));
        download(self.fetcher.as_ref(), self.policy, &url, &staged, None).await?;

        self.installer
            .install(tool, &staged, ArtifactKind::from_name(&url))
            .await
    }
}

async fn download(
    fetcher: &dyn Fetcher,
    policy: RetryPolicy,
    url: &str,
    dest: &Path,
    expected_sha256: Option<&str>,
) -> Result<(), StrategyError> {
    let what = format!("download of {}", url);
    retry(policy, &what, |_| fetcher.download(url, dest, expected_sha256))
        .await
        .map(|_| ())
        .map_err(|e| {
            let _ = std::fs::remove_file(dest);
            match e.downcast::<VerifyError>() {
                Ok(mismatch) => StrategyError::Verification(mismatch),
                Err(e) => StrategyError::Network(format!("{:#}", e)),
            }
        })
}
