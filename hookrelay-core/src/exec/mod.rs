//! External program execution.
//!
//! Every external program is started from an explicit argument vector; no
//! command line is ever handed to a shell. Privileged commands are prefixed
//! with `sudo` when the process is not already root, and in dry-run mode
//! commands flagged as mutating are logged instead of executed.

mod fs;
mod identity;
mod which;

pub use fs::HostFs;
pub use identity::{Elevation, FatalPrecondition, Identity};
pub use which::{default_search_path, which, which_in};

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Default timeout for a single external command.
const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Maximum characters of stderr kept in an error message.
const MAX_STDERR_CHARS: usize = 2_000;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },
    #[error("{program} exited with {code}: {stderr}")]
    Failed {
        program: String,
        code: String,
        stderr: String,
    },
}

// ============================================================================
// Command Builder
// ============================================================================

/// A fully specified external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
    /// Needs root; prefixed with `sudo` when not already root.
    pub privileged: bool,
    /// Changes host state; skipped in dry-run mode.
    pub mutating: bool,
    /// Run as this (unprivileged) user instead of the current one.
    pub run_as: Option<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            stdin: None,
            privileged: false,
            mutating: false,
            run_as: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn mutating(mut self) -> Self {
        self.mutating = true;
        self
    }

    pub fn run_as(mut self, user: Option<&str>) -> Self {
        self.run_as = user.map(str::to_string);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Synthetic success used for dry-run and tests.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

// ============================================================================
// Runner Seam
// ============================================================================

/// Executes external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a command and returns its output regardless of exit status.
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError>;

    /// Runs a command and treats a non-zero exit as an error.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let output = self.output(spec).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ExecError::Failed {
                program: spec.program.clone(),
                code: output
                    .code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr: truncate(output.stderr.trim(), MAX_STDERR_CHARS),
            })
        }
    }

    /// Returns true if the command exits successfully.
    async fn succeeds(&self, spec: &CommandSpec) -> bool {
        matches!(self.output(spec).await, Ok(out) if out.success())
    }
}

/// Runner backed by real processes.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    elevation: Elevation,
    dry_run: bool,
}

impl SystemRunner {
    pub fn new(elevation: Elevation, dry_run: bool) -> Self {
        Self { elevation, dry_run }
    }

    pub fn elevation(&self) -> Elevation {
        self.elevation
    }

    /// Translates a spec into the argv that is actually executed.
    pub fn argv(&self, spec: &CommandSpec) -> Vec<String> {
        let mut argv = Vec::new();

        if let Some(user) = &spec.run_as {
            // Already the invoking user when elevating through sudo.
            if self.elevation == Elevation::Direct {
                argv.extend(["sudo".to_string(), "-u".to_string(), user.clone(), "-H".to_string()]);
                argv.extend(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)));
            }
        } else if spec.privileged && self.elevation == Elevation::Sudo {
            argv.push("sudo".to_string());
            argv.extend(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)));
        }

        argv.push(spec.program.clone());
        argv.extend(spec.args.iter().cloned());
        argv
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        if self.dry_run && spec.mutating {
            info!("dry-run: would run {}", spec);
            return Ok(CommandOutput::ok(""));
        }

        let argv = self.argv(spec);
        debug!(command = %argv.join(" "), "Executing command");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: argv[0].clone(),
            source,
        })?;

        // Fed from a task so a child echoing its input cannot fill the stdout
        // pipe while we are still blocked writing stdin.
        let feeder = match (&spec.stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => {
                let input = input.clone();
                Some(tokio::spawn(async move {
                    let result = pipe.write_all(&input).await;
                    drop(pipe);
                    result
                }))
            }
            _ => None,
        };

        let output = tokio::time::timeout(spec.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecError::Timeout {
                program: spec.program.clone(),
                secs: spec.timeout.as_secs(),
            })?
            .map_err(|source| ExecError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        if let Some(feeder) = feeder {
            if let Ok(Err(e)) = feeder.await {
                debug!("Failed to write stdin of {}: {}", spec.program, e);
            }
        }

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{}...", head)
    }
}
