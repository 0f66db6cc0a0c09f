//! Finding installed tools and querying their versions.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::catalog::ToolDefinition;
use crate::exec::{which_in, CommandRunner, CommandSpec};

/// Version queries must answer quickly.
const VERSION_TIMEOUT: Duration = Duration::from_secs(15);

/// A tool found on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedTool {
    pub path: PathBuf,
    pub version: String,
}

/// Finds tools and checks that they respond.
#[async_trait]
pub trait ToolLocator: Send + Sync {
    /// Returns the tool if it is on the search path and answers a version query.
    async fn locate(&self, tool: &ToolDefinition) -> Option<LocatedTool>;

    /// Version reported by the executable at `path`.
    async fn version_at(&self, tool: &ToolDefinition, path: &Path) -> Option<String>;
}

/// Locator over the host search path.
pub struct SystemLocator {
    runner: Arc<dyn CommandRunner>,
    search_path: Vec<PathBuf>,
}

impl SystemLocator {
    /// `bin_dir` is searched first so finalized binaries win.
    pub fn new(runner: Arc<dyn CommandRunner>, bin_dir: &Path, search_path: &[PathBuf]) -> Self {
        let mut dirs = vec![bin_dir.to_path_buf()];
        dirs.extend(search_path.iter().filter(|d| *d != bin_dir).cloned());
        Self {
            runner,
            search_path: dirs,
        }
    }
}

#[async_trait]
impl ToolLocator for SystemLocator {
    async fn locate(&self, tool: &ToolDefinition) -> Option<LocatedTool> {
        let path = which_in(tool.binary, &self.search_path)?;
        let version = self.version_at(tool, &path).await?;
        Some(LocatedTool { path, version })
    }

    async fn version_at(&self, tool: &ToolDefinition, path: &Path) -> Option<String> {
        query_version(self.runner.as_ref(), path, tool.version_args).await
    }
}

/// Runs `<path> <args>` and returns the first non-empty output line.
///
/// Some tools print their version on stderr (`nginx -v`), so stderr is used
/// when stdout is empty. A failing command yields `None`.
pub async fn query_version(runner: &dyn CommandRunner, path: &Path, args: &[&str]) -> Option<String> {
    let spec = CommandSpec::new(path.to_string_lossy())
        .args(args.iter().copied())
        .timeout(VERSION_TIMEOUT);
    let out = runner.output(&spec).await.ok()?;
    if !out.success() {
        return None;
    }
    first_line(&out.stdout).or_else(|| first_line(&out.stderr))
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::catalog::get_tool_definition;
    use crate::acquire::types::ToolId;
    use crate::exec::testing::FakeRunner;
    use crate::exec::CommandOutput;

    #[tokio::test]
    async fn test_query_version_prefers_stdout() {
        let runner = FakeRunner::new().respond(|_| {
            Some(CommandOutput {
                code: Some(0),
                stdout: "\ncloudflared version 2024.6.1 (built 2024-06-12)\n".into(),
                stderr: "warning".into(),
            })
        });
        let v = query_version(&runner, Path::new("/usr/bin/cloudflared"), &["--version"]).await;
        assert_eq!(v.as_deref(), Some("cloudflared version 2024.6.1 (built 2024-06-12)"));
        assert_eq!(runner.lines(), vec!["/usr/bin/cloudflared --version"]);
    }

    #[tokio::test]
    async fn test_query_version_falls_back_to_stderr() {
        let runner = FakeRunner::new().respond(|_| {
            Some(CommandOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: "nginx version: nginx/1.24.0\n".into(),
            })
        });
        let v = query_version(&runner, Path::new("nginx"), &["-v"]).await;
        assert_eq!(v.as_deref(), Some("nginx version: nginx/1.24.0"));
    }

    #[tokio::test]
    async fn test_query_version_failure_is_none() {
        let runner = FakeRunner::new().respond(|_| Some(CommandOutput::failed(126, "exec format error")));
        assert!(query_version(&runner, Path::new("x"), &[]).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_locate_requires_version_answer() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let bin = dir.path().join("mkcert");
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        let def = get_tool_definition(ToolId::Mkcert);

        let answering = Arc::new(FakeRunner::new().respond(|_| Some(CommandOutput::ok("v1.4.4"))));
        let locator = SystemLocator::new(answering, dir.path(), &[]);
        let found = locator.locate(def).await.unwrap();
        assert_eq!(found.path, bin);
        assert_eq!(found.version, "v1.4.4");

        let broken = Arc::new(FakeRunner::new().failing_all());
        let locator = SystemLocator::new(broken, dir.path(), &[]);
        assert!(locator.locate(def).await.is_none());
    }
}
