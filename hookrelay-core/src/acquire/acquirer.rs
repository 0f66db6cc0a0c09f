//! The per-tool acquisition state machine.
//!
//! `AlreadyPresent` fast path, then each strategy in order. A strategy only
//! counts as successful when the executable it produced answers a version
//! query; anything else falls through to the next strategy.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::catalog::get_tool_definition;
use super::downloader::Fetcher;
use super::installer::ArtifactInstaller;
use super::locator::{SystemLocator, ToolLocator};
use super::strategies::{AcquisitionStrategy, DirectUrl, PrimaryChannel, ReleaseIndex, StrategyKind};
use super::types::ToolId;
use super::{AcquisitionError, StrategyAttempt, StrategyError};
use crate::exec::{CommandRunner, HostFs};
use crate::package::PackageManager;
use crate::paths::HostPaths;
use crate::probe::HostFacts;
use crate::retry::RetryPolicy;

/// Result of a successful `ensure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Acquired {
    AlreadyPresent {
        path: PathBuf,
        version: String,
    },
    Installed {
        path: PathBuf,
        version: String,
        strategy: StrategyKind,
    },
    /// Dry-run: the tool is missing and would be acquired.
    Planned,
}

impl Acquired {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::AlreadyPresent { path, .. } | Self::Installed { path, .. } => Some(path),
            Self::Planned => None,
        }
    }

    pub fn changed(&self) -> bool {
        matches!(self, Self::Installed { .. })
    }
}

pub struct Acquirer {
    locator: Arc<dyn ToolLocator>,
    strategies: Vec<Box<dyn AcquisitionStrategy>>,
    dry_run: bool,
}

impl Acquirer {
    pub fn new(
        locator: Arc<dyn ToolLocator>,
        strategies: Vec<Box<dyn AcquisitionStrategy>>,
        dry_run: bool,
    ) -> Self {
        Self {
            locator,
            strategies,
            dry_run,
        }
    }

    /// The standard pipeline: package manager, release index, direct URL.
    pub fn standard(
        runner: Arc<dyn CommandRunner>,
        fs: HostFs,
        pm: Arc<dyn PackageManager>,
        fetcher: Arc<dyn Fetcher>,
        paths: &HostPaths,
        policy: RetryPolicy,
    ) -> Self {
        let dry_run = fs.is_dry_run();
        let locator = Arc::new(SystemLocator::new(runner.clone(), &paths.bin_dir, &paths.search_path));
        let installer = Arc::new(ArtifactInstaller::new(runner, fs.clone(), paths.clone()));

        let strategies: Vec<Box<dyn AcquisitionStrategy>> = vec![
            Box::new(PrimaryChannel::new(pm, fs, fetcher.clone(), paths.clone(), policy)),
            Box::new(ReleaseIndex::new(fetcher.clone(), installer.clone(), policy)),
            Box::new(DirectUrl::new(fetcher, installer, policy)),
        ];
        Self::new(locator, strategies, dry_run)
    }

    /// Makes sure `id` is installed and answering.
    pub async fn ensure(&self, id: ToolId, facts: &HostFacts) -> Result<Acquired, AcquisitionError> {
        let tool = get_tool_definition(id);

        if let Some(found) = self.locator.locate(tool).await {
            debug!("{} already present at {}: {}", id, found.path.display(), found.version);
            return Ok(Acquired::AlreadyPresent {
                path: found.path,
                version: found.version,
            });
        }

        if self.dry_run {
            info!("dry-run: would acquire {}", tool.display_name);
            return Ok(Acquired::Planned);
        }

        let mut attempts = Vec::new();
        for strategy in &self.strategies {
            let kind = strategy.kind();
            info!("Acquiring {} via {}", tool.display_name, kind);

            let outcome: Result<(), StrategyError> = match strategy.acquire(tool, facts).await {
                Ok(path) => match self.locator.version_at(tool, &path).await {
                    Some(version) => {
                        info!("{} {} ready at {}", tool.display_name, version, path.display());
                        return Ok(Acquired::Installed {
                            path,
                            version,
                            strategy: kind,
                        });
                    }
                    None => Err(StrategyError::Install(format!(
                        "{} does not answer a version query",
                        path.display()
                    ))),
                },
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                match &e {
                    StrategyError::NotApplicable(reason) => {
                        debug!("{} not applicable for {}: {}", kind, id, reason)
                    }
                    other => warn!("{} failed for {}: {}", kind, id, other),
                }
                attempts.push(StrategyAttempt::from_error(kind, &e));
            }
        }

        if attempts.iter().all(|a| !a.applicable) {
            Err(AcquisitionError::Unsupported {
                tool: id,
                platform: format!("{:?}/{}", facts.os, facts.arch),
                attempts,
            })
        } else {
            Err(AcquisitionError::Exhausted { tool: id, attempts })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::catalog::ToolDefinition;
    use crate::acquire::locator::LocatedTool;
    use crate::package::PackageManagerId;
    use crate::probe::EnvironmentClass;
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<StrategyKind>>>;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Skip,
    }

    struct FakeStrategy {
        kind: StrategyKind,
        behavior: Behavior,
        log: Log,
    }

    #[async_trait]
    impl AcquisitionStrategy for FakeStrategy {
        fn kind(&self) -> StrategyKind {
            self.kind
        }

        async fn acquire(&self, tool: &ToolDefinition, _facts: &HostFacts) -> Result<PathBuf, StrategyError> {
            self.log.lock().unwrap().push(self.kind);
            match self.behavior {
                Behavior::Succeed => Ok(PathBuf::from("/usr/local/bin").join(tool.binary)),
                Behavior::Fail => Err(StrategyError::Network("connection reset".into())),
                Behavior::Skip => Err(StrategyError::NotApplicable("n/a".into())),
            }
        }
    }

    struct FakeLocator {
        present: bool,
        answers: bool,
    }

    #[async_trait]
    impl ToolLocator for FakeLocator {
        async fn locate(&self, tool: &ToolDefinition) -> Option<LocatedTool> {
            self.present.then(|| LocatedTool {
                path: PathBuf::from("/usr/bin").join(tool.binary),
                version: "2024.6.1".into(),
            })
        }

        async fn version_at(&self, _tool: &ToolDefinition, _path: &Path) -> Option<String> {
            self.answers.then(|| "2024.6.1".to_string())
        }
    }

    fn acquirer(behaviors: [Behavior; 3], present: bool, dry_run: bool) -> (Acquirer, Log) {
        let log: Log = Arc::default();
        let kinds = [
            StrategyKind::PrimaryChannel,
            StrategyKind::ReleaseIndex,
            StrategyKind::DirectUrl,
        ];
        let strategies = kinds
            .into_iter()
            .zip(behaviors)
            .map(|(kind, behavior)| {
                Box::new(FakeStrategy {
                    kind,
                    behavior,
                    log: log.clone(),
                }) as Box<dyn AcquisitionStrategy>
            })
            .collect();
        let locator = Arc::new(FakeLocator {
            present,
            answers: true,
        });
        (Acquirer::new(locator, strategies, dry_run), log)
    }

    fn facts() -> HostFacts {
        HostFacts::synthetic(EnvironmentClass::PublicServer, PackageManagerId::Apt)
    }

    fn order(log: &Log) -> Vec<StrategyKind> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_already_present_short_circuits() {
        let (acq, log) = acquirer([Behavior::Succeed; 3], true, false);
        let result = acq.ensure(ToolId::Cloudflared, &facts()).await.unwrap();
        assert!(matches!(result, Acquired::AlreadyPresent { .. }));
        assert!(!result.changed());
        assert!(order(&log).is_empty());
    }

    #[tokio::test]
    async fn test_release_index_tried_after_primary_and_direct_never_after_success() {
        let (acq, log) = acquirer([Behavior::Fail, Behavior::Succeed, Behavior::Succeed], false, false);
        let result = acq.ensure(ToolId::Cloudflared, &facts()).await.unwrap();

        assert_eq!(
            result,
            Acquired::Installed {
                path: PathBuf::from("/usr/local/bin/cloudflared"),
                version: "2024.6.1".into(),
                strategy: StrategyKind::ReleaseIndex,
            }
        );
        assert_eq!(
            order(&log),
            vec![StrategyKind::PrimaryChannel, StrategyKind::ReleaseIndex]
        );
    }

    #[tokio::test]
    async fn test_direct_url_is_last_resort() {
        let (acq, log) = acquirer([Behavior::Fail, Behavior::Fail, Behavior::Succeed], false, false);
        let result = acq.ensure(ToolId::Mkcert, &facts()).await.unwrap();

        assert!(matches!(
            result,
            Acquired::Installed {
                strategy: StrategyKind::DirectUrl,
                ..
            }
        ));
        assert_eq!(
            order(&log),
            vec![
                StrategyKind::PrimaryChannel,
                StrategyKind::ReleaseIndex,
                StrategyKind::DirectUrl
            ]
        );
    }

    #[tokio::test]
    async fn test_exhaustion_reports_every_attempt() {
        let (acq, _) = acquirer([Behavior::Skip, Behavior::Fail, Behavior::Fail], false, false);
        let err = acq.ensure(ToolId::Cloudflared, &facts()).await.unwrap_err();

        match err {
            AcquisitionError::Exhausted { tool, attempts } => {
                assert_eq!(tool, ToolId::Cloudflared);
                assert_eq!(attempts.len(), 3);
                assert!(!attempts[0].applicable);
                assert!(attempts[1].applicable);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_nothing_applicable_is_unsupported() {
        let (acq, _) = acquirer([Behavior::Skip; 3], false, false);
        let err = acq.ensure(ToolId::Mkcert, &facts()).await.unwrap_err();
        assert!(matches!(err, AcquisitionError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_dry_run_plans_without_strategies() {
        let (acq, log) = acquirer([Behavior::Succeed; 3], false, true);
        let result = acq.ensure(ToolId::Cloudflared, &facts()).await.unwrap();
        assert_eq!(result, Acquired::Planned);
        assert!(result.path().is_none());
        assert!(order(&log).is_empty());
    }

    #[tokio::test]
    async fn test_silent_binary_falls_through() {
        let log: Log = Arc::default();
        let strategies: Vec<Box<dyn AcquisitionStrategy>> = vec![
            Box::new(FakeStrategy {
                kind: StrategyKind::ReleaseIndex,
                behavior: Behavior::Succeed,
                log: log.clone(),
            }),
            Box::new(FakeStrategy {
                kind: StrategyKind::DirectUrl,
                behavior: Behavior::Succeed,
                log: log.clone(),
            }),
        ];
        let locator = Arc::new(FakeLocator {
            present: false,
            answers: false,
        });
        let acq = Acquirer::new(locator, strategies, false);

        let err = acq.ensure(ToolId::Cloudflared, &facts()).await.unwrap_err();
        assert!(matches!(err, AcquisitionError::Exhausted { .. }));
        assert_eq!(order(&log).len(), 2);
    }
}
