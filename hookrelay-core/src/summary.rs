//! Run summary: severity-counted findings for one invocation.
//!
//! Every component reports into a [`RunSummary`] that is threaded through the
//! run explicitly. At the end the summary is mapped to a process exit code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info, warn};

/// Exit code when nothing was reported.
pub const EXIT_OK: i32 = 0;
/// Exit code when only warnings were reported.
pub const EXIT_WARN: i32 = 1;
/// Exit code when at least one error was reported.
pub const EXIT_ERROR: i32 = 2;

// ============================================================================
// Severity
// ============================================================================

/// Severity of a single finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational note; does not affect the exit code.
    Info,
    /// Something was degraded or skipped.
    Warning,
    /// Something that was requested could not be done.
    Error,
}

impl Severity {
    /// Returns the lowercase label used in human output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single reported finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    /// Pipeline step that produced the finding (e.g. `acquire`, `proxy-site`).
    pub step: String,
    pub message: String,
}

// ============================================================================
// Run Summary
// ============================================================================

/// Aggregate warning/error counters and messages for one invocation.
///
/// The summary is append-only: components can add findings but never remove
/// them, so the exit code is a monotonic function of the worst severity seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub warnings: usize,
    pub errors: usize,
    pub findings: Vec<Finding>,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            warnings: 0,
            errors: 0,
            findings: Vec::new(),
        }
    }

    /// Records a finding and prints it immediately through the log.
    pub fn record(&mut self, severity: Severity, step: &str, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Info => info!(step = %step, "{}", message),
            Severity::Warning => {
                self.warnings += 1;
                warn!(step = %step, "{}", message);
            }
            Severity::Error => {
                self.errors += 1;
                error!(step = %step, "{}", message);
            }
        }
        self.findings.push(Finding {
            severity,
            step: step.to_string(),
            message,
        });
    }

    pub fn info(&mut self, step: &str, message: impl Into<String>) {
        self.record(Severity::Info, step, message);
    }

    pub fn warn(&mut self, step: &str, message: impl Into<String>) {
        self.record(Severity::Warning, step, message);
    }

    pub fn error(&mut self, step: &str, message: impl Into<String>) {
        self.record(Severity::Error, step, message);
    }

    /// Reports a step that could not run because something it depends on failed.
    pub fn skipped(&mut self, step: &str, reason: impl fmt::Display) {
        self.record(Severity::Warning, step, format!("skipped: {}", reason));
    }

    /// Returns the highest severity observed, if any warning or error exists.
    pub fn worst(&self) -> Option<Severity> {
        if self.errors > 0 {
            Some(Severity::Error)
        } else if self.warnings > 0 {
            Some(Severity::Warning)
        } else {
            None
        }
    }

    /// Maps the summary to a process exit code.
    pub fn exit_code(&self) -> i32 {
        match self.worst() {
            None | Some(Severity::Info) => EXIT_OK,
            Some(Severity::Warning) => EXIT_WARN,
            Some(Severity::Error) => EXIT_ERROR,
        }
    }

    /// Findings produced by one step.
    pub fn findings_for<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a Finding> + 'a {
        self.findings.iter().filter(move |f| f.step == step)
    }

    /// One-line restatement of the aggregate counts.
    pub fn headline(&self) -> String {
        let status = match self.worst() {
            None | Some(Severity::Info) => "ok",
            Some(Severity::Warning) => "completed with warnings",
            Some(Severity::Error) => "failed",
        };
        format!(
            "{}: {} warning(s), {} error(s)",
            status, self.warnings, self.errors
        )
    }
}
