//! Containerized application startup.
//!
//! Runs `docker compose up -d --build` in the install directory, falling back
//! to the standalone `docker-compose` binary. The stack counts as already
//! running when a container of its compose project is up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::apply::{Outcome, ResourceKind, ResourceRecord};
use crate::exec::{which_in, CommandRunner, CommandSpec};
use crate::probe::HostFacts;

/// Compose file names, in the order compose itself looks for them.
const COMPOSE_FILES: &[&str] = &["compose.yaml", "compose.yml", "docker-compose.yaml", "docker-compose.yml"];

/// Builds can take a while on small hosts.
const COMPOSE_TIMEOUT: Duration = Duration::from_secs(1800);

/// Finds the compose file in `dir`.
pub fn compose_file(dir: &Path) -> Option<PathBuf> {
    COMPOSE_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Default compose project name for a directory.
pub fn project_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

/// True when a container of `project` is in `running`.
pub fn project_running(project: &str, running: &[String]) -> bool {
    !project.is_empty()
        && running.iter().any(|name| {
            name.strip_prefix(project)
                .is_some_and(|rest| rest.starts_with('-') || rest.starts_with('_'))
        })
}

pub struct ComposeLauncher {
    runner: Arc<dyn CommandRunner>,
    search_path: Vec<PathBuf>,
    dry_run: bool,
}

impl ComposeLauncher {
    pub fn new(runner: Arc<dyn CommandRunner>, search_path: &[PathBuf], dry_run: bool) -> Self {
        Self {
            runner,
            search_path: search_path.to_vec(),
            dry_run,
        }
    }

    fn prerequisites(&self, install_dir: &Path, facts: &HostFacts) -> Result<PathBuf, ResourceRecord> {
        if !facts.has_tool("docker") {
            return Err(ResourceRecord::skipped(
                ResourceKind::Service,
                install_dir,
                "the container engine is not installed",
            ));
        }
        compose_file(install_dir).ok_or_else(|| {
            ResourceRecord::skipped(
                ResourceKind::Service,
                install_dir,
                format!("no compose file in {}", install_dir.display()),
            )
        })
    }

    /// Read-only check.
    pub fn inspect(&self, install_dir: &Path, facts: &HostFacts) -> ResourceRecord {
        let compose = match self.prerequisites(install_dir, facts) {
            Ok(compose) => compose,
            Err(record) => return record,
        };
        let record = ResourceRecord::new(ResourceKind::Service, &compose, "docker compose up -d --build");
        if project_running(&project_name(install_dir), &facts.running_containers) {
            record.with_outcome(Outcome::Unchanged)
        } else {
            record
        }
    }

    /// Starts the stack unless it is already running.
    pub async fn start(&self, install_dir: &Path, facts: &HostFacts) -> ResourceRecord {
        let record = self.inspect(install_dir, facts);
        if record.outcome != Outcome::Planned {
            debug!("Compose startup: {:?}", record.outcome);
            return record;
        }

        let spec = match self.compose_command().await {
            Some(spec) => spec,
            None => {
                return record.with_outcome(Outcome::skipped(
                    "neither `docker compose` nor `docker-compose` is available",
                ))
            }
        };

        let spec = spec
            .args(["up", "-d", "--build"])
            .cwd(install_dir)
            .privileged()
            .mutating()
            .timeout(COMPOSE_TIMEOUT);
        info!("Starting application stack in {}", install_dir.display());
        match self.runner.run(&spec).await {
            Ok(_) if self.dry_run => record.with_outcome(Outcome::Planned),
            Ok(_) => record.with_outcome(Outcome::Applied),
            Err(e) => record.with_outcome(Outcome::failed(e)),
        }
    }

    async fn compose_command(&self) -> Option<CommandSpec> {
        let plugin = CommandSpec::new("docker")
            .args(["compose", "version"])
            .privileged();
        if self.runner.succeeds(&plugin).await {
            return Some(CommandSpec::new("docker").arg("compose"));
        }
        which_in("docker-compose", &self.search_path)
            .map(|path| CommandSpec::new(path.to_string_lossy().into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeRunner;
    use crate::package::PackageManagerId;
    use crate::probe::EnvironmentClass;
    use tempfile::TempDir;

    fn facts(running: &[&str]) -> HostFacts {
        let mut facts = HostFacts::synthetic(EnvironmentClass::LocalServer, PackageManagerId::Apt);
        facts.tools.insert("docker".into(), "Docker version 24.0.7".into());
        facts.running_containers = running.iter().map(|s| s.to_string()).collect();
        facts
    }

    fn install_dir(dir: &TempDir) -> PathBuf {
        let install = dir.path().join("hookrelay");
        std::fs::create_dir_all(&install).unwrap();
        std::fs::write(install.join("compose.yaml"), "services: {}\n").unwrap();
        install
    }

    #[test]
    fn test_project_name_and_running() {
        assert_eq!(project_name(Path::new("/opt/HookRelay")), "hookrelay");
        assert!(project_running("hookrelay", &["hookrelay-app-1".to_string()]));
        assert!(project_running("hookrelay", &["hookrelay_db_1".to_string()]));
        assert!(!project_running("hookrelay", &["hookrelayx-app-1".to_string()]));
        assert!(!project_running("", &["-app-1".to_string()]));
    }

    #[tokio::test]
    async fn test_starts_stack_with_compose_plugin() {
        let dir = TempDir::new().unwrap();
        let install = install_dir(&dir);
        let runner = Arc::new(FakeRunner::new());
        let launcher = ComposeLauncher::new(runner.clone(), &[], false);

        let record = launcher.start(&install, &facts(&[])).await;
        assert_eq!(record.outcome, Outcome::Applied);
        let calls = runner.calls();
        assert_eq!(calls.last().unwrap().to_string(), "docker compose up -d --build");
        assert_eq!(calls.last().unwrap().cwd.as_deref(), Some(install.as_path()));
    }

    #[tokio::test]
    async fn test_running_stack_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let install = install_dir(&dir);
        let runner = Arc::new(FakeRunner::new());
        let launcher = ComposeLauncher::new(runner.clone(), &[], false);

        let record = launcher.start(&install, &facts(&["hookrelay-app-1"])).await;
        assert_eq!(record.outcome, Outcome::Unchanged);
        assert!(runner.calls().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_falls_back_to_standalone_compose() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let install = install_dir(&dir);
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("docker-compose"), "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(bin.join("docker-compose"), std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = Arc::new(FakeRunner::new().respond(|spec| {
            (spec.args.first().map(String::as_str) == Some("compose"))
                .then(|| crate::exec::CommandOutput::failed(1, "unknown command"))
        }));
        let launcher = ComposeLauncher::new(runner.clone(), &[bin.clone()], false);

        assert_eq!(launcher.start(&install, &facts(&[])).await.outcome, Outcome::Applied);
        assert_eq!(
            runner.lines().last().cloned(),
            Some(format!("{} up -d --build", bin.join("docker-compose").display()))
        );
    }

    #[tokio::test]
    async fn test_missing_prerequisites_are_skipped() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let launcher = ComposeLauncher::new(runner.clone(), &[], false);

        let mut no_docker = facts(&[]);
        no_docker.tools.clear();
        let record = launcher.start(&install_dir(&dir), &no_docker).await;
        assert!(matches!(record.outcome, Outcome::Skipped { .. }));

        let empty = dir.path().join("empty");
        std::fs::create_dir_all(&empty).unwrap();
        let record = launcher.start(&empty, &facts(&[])).await;
        assert!(matches!(record.outcome, Outcome::Skipped { .. }));
        assert!(runner.calls().is_empty());
    }
}
