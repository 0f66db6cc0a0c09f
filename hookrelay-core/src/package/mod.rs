//! Package manager abstraction.
//!
//! The system package tool is detected once per run and bound to a
//! [`PackageManager`] implementation; callers never branch on its name.
//!
//! Detection order: apt, dnf, yum, pacman, zypper, apk, brew. When none is
//! present every install reports [`PackageError::NoPackageManager`], which
//! callers record as a warning and move on.

mod manager;

pub use manager::{detect_id, PackageManagerId};

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::exec::{CommandRunner, ExecError};
use crate::retry::{retry, RetryPolicy};

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("no supported package manager found")]
    NoPackageManager,
    #[error("{manager} index refresh failed: {source}")]
    RefreshFailed {
        manager: PackageManagerId,
        #[source]
        source: ExecError,
    },
    #[error("{manager} failed to install {packages}: {source}")]
    InstallFailed {
        manager: PackageManagerId,
        packages: String,
        #[source]
        source: ExecError,
    },
}

/// Uniform contract over the host's package tool.
#[async_trait]
pub trait PackageManager: Send + Sync {
    fn id(&self) -> PackageManagerId;

    /// Synchronizes the package index.
    async fn refresh(&self) -> Result<(), PackageError>;

    /// Installs whatever of `packages` is missing.
    ///
    /// Returns the packages that were actually installed; an empty list
    /// means everything was already satisfied.
    async fn install(&self, packages: &[&str]) -> Result<Vec<String>, PackageError>;

    async fn is_installed(&self, package: &str) -> bool;

    /// Forces the next install to refresh the index again, e.g. after a
    /// repository was added.
    fn invalidate_index(&self) {}
}

/// Detects the host's package tool and binds it.
pub fn detect(runner: Arc<dyn CommandRunner>, search_path: &[PathBuf]) -> Arc<dyn PackageManager> {
    bind(detect_id(search_path), runner, RetryPolicy::NETWORK)
}

/// Binds a known package tool.
pub fn bind(
    id: PackageManagerId,
    runner: Arc<dyn CommandRunner>,
    policy: RetryPolicy,
) -> Arc<dyn PackageManager> {
    match id {
        PackageManagerId::Unknown => Arc::new(UnavailablePackageManager),
        id => Arc::new(SystemPackageManager::new(id, runner, policy)),
    }
}

// ============================================================================
// System Package Manager
// ============================================================================

/// Package manager backed by the host's package CLI.
pub struct SystemPackageManager {
    id: PackageManagerId,
    runner: Arc<dyn CommandRunner>,
    policy: RetryPolicy,
    refreshed: AtomicBool,
}

impl SystemPackageManager {
    pub fn new(id: PackageManagerId, runner: Arc<dyn CommandRunner>, policy: RetryPolicy) -> Self {
        Self {
            id,
            runner,
            policy,
            refreshed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PackageManager for SystemPackageManager {
    fn id(&self) -> PackageManagerId {
        self.id
    }

    async fn refresh(&self) -> Result<(), PackageError> {
        let spec = self
            .id
            .refresh_command()
            .ok_or(PackageError::NoPackageManager)?;
        let what = format!("{} index refresh", self.id);

        retry(self.policy, &what, |_| self.runner.run(&spec))
            .await
            .map_err(|source| PackageError::RefreshFailed {
                manager: self.id,
                source,
            })?;

        self.refreshed.store(true, Ordering::SeqCst);
        debug!("{} index refreshed", self.id);
        Ok(())
    }

    async fn install(&self, packages: &[&str]) -> Result<Vec<String>, PackageError> {
        let mut missing = Vec::new();
        for package in packages {
            if !self.is_installed(package).await {
                missing.push(*package);
            }
        }
        if missing.is_empty() {
            debug!("Already installed: {}", packages.join(", "));
            return Ok(Vec::new());
        }

        if !self.refreshed.load(Ordering::SeqCst) {
            self.refresh().await?;
        }

        let spec = self
            .id
            .install_command(&missing)
            .ok_or(PackageError::NoPackageManager)?;
        info!("Installing {} via {}", missing.join(", "), self.id);
        self.runner
            .run(&spec)
            .await
            .map_err(|source| PackageError::InstallFailed {
                manager: self.id,
                packages: missing.join(", "),
                source,
            })?;

        Ok(missing.into_iter().map(str::to_string).collect())
    }

    async fn is_installed(&self, package: &str) -> bool {
        let Some(spec) = self.id.query_command(package) else {
            return false;
        };
        match self.runner.output(&spec).await {
            // dpkg keeps records of removed packages; only "installed" counts.
            Ok(out) if self.id == PackageManagerId::Apt => {
                out.success() && out.stdout.contains("install ok installed")
            }
            Ok(out) => out.success(),
            Err(_) => false,
        }
    }

    fn invalidate_index(&self) {
        self.refreshed.store(false, Ordering::SeqCst);
    }
}

/// Stand-in when no supported package tool exists.
#[derive(Debug, Default)]
pub struct UnavailablePackageManager;

#[async_trait]
impl PackageManager for UnavailablePackageManager {
    fn id(&self) -> PackageManagerId {
        PackageManagerId::Unknown
    }

    async fn refresh(&self) -> Result<(), PackageError> {
        Err(PackageError::NoPackageManager)
    }

    async fn install(&self, _packages: &[&str]) -> Result<Vec<String>, PackageError> {
        Err(PackageError::NoPackageManager)
    }

    async fn is_installed(&self, _package: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeRunner;
    use crate::exec::CommandOutput;
    use std::time::Duration;

    const FAST: RetryPolicy = RetryPolicy::new(3, Duration::ZERO);

    fn apt(runner: Arc<FakeRunner>) -> SystemPackageManager {
        SystemPackageManager::new(PackageManagerId::Apt, runner, FAST)
    }

    fn installed(packages: &'static [&'static str]) -> impl Fn(&crate::exec::CommandSpec) -> Option<CommandOutput> {
        move |spec| {
            if spec.program != "dpkg-query" {
                return None;
            }
            let pkg = spec.args.last()?;
            Some(if packages.contains(&pkg.as_str()) {
                CommandOutput::ok("install ok installed")
            } else {
                CommandOutput::failed(1, "no packages found")
            })
        }
    }

    #[tokio::test]
    async fn test_satisfied_install_is_noop() {
        let runner = Arc::new(FakeRunner::new().respond(installed(&["nginx", "curl"])));
        let pm = apt(runner.clone());

        let done = pm.install(&["nginx", "curl"]).await.unwrap();
        assert!(done.is_empty());
        assert!(runner.lines().iter().all(|l| l.starts_with("dpkg-query")));
    }

    #[tokio::test]
    async fn test_install_refreshes_once_then_installs_missing() {
        let runner = Arc::new(FakeRunner::new().respond(installed(&["curl"])));
        let pm = apt(runner.clone());

        let done = pm.install(&["nginx", "curl"]).await.unwrap();
        assert_eq!(done, vec!["nginx".to_string()]);
        pm.install(&["docker.io"]).await.unwrap();

        let lines = runner.lines();
        assert_eq!(lines.iter().filter(|l| *l == "apt-get update").count(), 1);
        assert!(lines.contains(&"apt-get install -y --no-install-recommends nginx".to_string()));
        assert!(lines.contains(&"apt-get install -y --no-install-recommends docker.io".to_string()));
    }

    #[tokio::test]
    async fn test_refresh_is_retried() {
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = attempts.clone();
        let runner = Arc::new(FakeRunner::new().respond(installed(&[])).respond(move |spec| {
            if spec.program == "apt-get" && spec.args == ["update"] {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    return Some(CommandOutput::failed(100, "Temporary failure resolving"));
                }
            }
            None
        }));
        let pm = apt(runner);

        pm.install(&["nginx"]).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_refresh_exhaustion_is_typed() {
        let runner = Arc::new(
            FakeRunner::new()
                .respond(installed(&[]))
                .failing("apt-get"),
        );
        let pm = apt(runner);

        let err = pm.install(&["nginx"]).await.unwrap_err();
        assert!(matches!(err, PackageError::RefreshFailed { .. }));
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let runner = Arc::new(FakeRunner::new().respond(installed(&[])));
        let pm = apt(runner.clone());

        pm.install(&["a"]).await.unwrap();
        pm.invalidate_index();
        pm.install(&["b"]).await.unwrap();

        let refreshes = runner
            .lines()
            .iter()
            .filter(|l| *l == "apt-get update")
            .count();
        assert_eq!(refreshes, 2);
    }

    #[tokio::test]
    async fn test_removed_package_is_not_installed() {
        let runner = Arc::new(FakeRunner::new().respond(|spec| {
            (spec.program == "dpkg-query").then(|| CommandOutput::ok("deinstall ok config-files"))
        }));
        assert!(!apt(runner).is_installed("nginx").await);
    }

    #[tokio::test]
    async fn test_unavailable_manager_reports_typed_failure() {
        let runner: Arc<dyn CommandRunner> = Arc::new(FakeRunner::new());
        let pm = bind(PackageManagerId::Unknown, runner, FAST);

        assert_eq!(pm.id(), PackageManagerId::Unknown);
        assert!(matches!(
            pm.install(&["nginx"]).await,
            Err(PackageError::NoPackageManager)
        ));
        assert!(!pm.is_installed("nginx").await);
    }
}
