//! Turning a downloaded artifact into an installed executable.
//!
//! Every artifact is verified first. Native packages go to the package
//! database (`dpkg -i` / `rpm -U`); archives are extracted and the expected
//! executable located; bare executables are used as-is. Whatever ends up
//! as the executable is finalized into the fixed binary directory with mode
//! 0755. The downloaded artifact and any extraction directory are always
//! removed afterwards, so a rejected artifact never reaches the binary
//! directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::catalog::ToolDefinition;
use super::extractor::{extract_archive, find_executable};
use super::types::ArtifactKind;
use super::verify::{verify_artifact, VerifyError};
use super::StrategyError;
use crate::exec::{which_in, CommandRunner, CommandSpec, HostFs};
use crate::paths::HostPaths;

pub struct ArtifactInstaller {
    runner: Arc<dyn CommandRunner>,
    fs: HostFs,
    paths: HostPaths,
}

impl ArtifactInstaller {
    pub fn new(runner: Arc<dyn CommandRunner>, fs: HostFs, paths: HostPaths) -> Self {
        Self { runner, fs, paths }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.paths.temp_dir
    }

    /// Verifies and installs `artifact`, returning the executable's path.
    pub async fn install(
        &self,
        tool: &ToolDefinition,
        artifact: &Path,
        kind: ArtifactKind,
    ) -> Result<PathBuf, StrategyError> {
        let extract_dir = self.paths.temp_dir.join(format!("{}-extract", tool.binary));
        let result = self.install_inner(tool, artifact, kind, &extract_dir).await;

        if let Err(e) = tokio::fs::remove_file(artifact).await {
            debug!("Failed to clean up {}: {}", artifact.display(), e);
        }
        if extract_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&extract_dir).await {
                warn!("Failed to clean up {}: {}", extract_dir.display(), e);
            }
        }

        result
    }

    async fn install_inner(
        &self,
        tool: &ToolDefinition,
        artifact: &Path,
        kind: ArtifactKind,
        extract_dir: &Path,
    ) -> Result<PathBuf, StrategyError> {
        let size = verify_artifact(artifact, kind, tool.min_size)?;
        debug!("{} artifact verified ({} bytes, {})", tool.binary, size, kind);

        match kind {
            ArtifactKind::Deb => {
                self.install_package(tool, CommandSpec::new("dpkg").arg("-i").arg(path_arg(artifact)))
                    .await
            }
            ArtifactKind::Rpm => {
                self.install_package(
                    tool,
                    CommandSpec::new("rpm")
                        .args(["-U", "--replacepkgs"])
                        .arg(path_arg(artifact)),
                )
                .await
            }
            ArtifactKind::TarGz | ArtifactKind::TarXz | ArtifactKind::Zip => {
                if extract_dir.exists() {
                    let _ = tokio::fs::remove_dir_all(extract_dir).await;
                }
                extract_archive(artifact, extract_dir, kind)
                    .map_err(|e| StrategyError::Install(format!("{:#}", e)))?;

                let executable = find_executable(extract_dir, tool.binary)
                    .ok_or_else(|| VerifyError::MissingExecutable(tool.binary.to_string()))?;
                verify_artifact(&executable, ArtifactKind::Binary, tool.min_size)?;
                self.finalize(tool, &executable).await
            }
            ArtifactKind::Binary => self.finalize(tool, artifact).await,
        }
    }

    async fn install_package(&self, tool: &ToolDefinition, spec: CommandSpec) -> Result<PathBuf, StrategyError> {
        self.runner
            .run(&spec.privileged().mutating())
            .await
            .map_err(|e| StrategyError::Install(e.to_string()))?;

        let mut dirs = vec![self.paths.bin_dir.clone()];
        dirs.extend(self.paths.search_path.iter().cloned());
        which_in(tool.binary, &dirs).ok_or_else(|| {
            StrategyError::Install(format!(
                "package installed but {} is not on the search path",
                tool.binary
            ))
        })
    }

    /// Moves the verified executable into the binary directory.
    async fn finalize(&self, tool: &ToolDefinition, executable: &Path) -> Result<PathBuf, StrategyError> {
        let dest = self.paths.installed_binary(tool.binary);
        self.fs
            .install_executable(executable, &dest)
            .await
            .map_err(|e| StrategyError::Install(format!("{:#}", e)))?;
        info!("Installed {} to {}", tool.display_name, dest.display());
        Ok(dest)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
