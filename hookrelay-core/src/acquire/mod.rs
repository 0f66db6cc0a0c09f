//! Dependency acquisition.
//!
//! Obtains binaries that are not guaranteed to be in the host's package
//! index. Each tool goes through an ordered list of strategies:
//!
//! 1. the host package manager, adding a vendor repository where one exists
//! 2. the project's published release metadata
//! 3. a fixed versionless download URL
//!
//! Every downloaded artifact is verified before it is installed, and every
//! network operation is retried with a fixed delay.

mod acquirer;
pub mod catalog;
pub mod downloader;
pub mod extractor;
pub mod installer;
pub mod locator;
pub mod release;
pub mod strategies;
pub mod types;
pub mod verify;

pub use acquirer::{Acquired, Acquirer};
pub use catalog::{get_tool_definition, BaselinePackage, BaselineRole, ToolDefinition};
pub use downloader::{Fetcher, HttpFetcher};
pub use locator::{query_version, LocatedTool, SystemLocator, ToolLocator};
pub use strategies::{AcquisitionStrategy, StrategyKind};
pub use types::{ArtifactKind, ToolId};
pub use verify::VerifyError;

use serde::Serialize;
use thiserror::Error;

/// Why one strategy did not produce the tool.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// The strategy does not apply to this tool or host.
    #[error("not applicable: {0}")]
    NotApplicable(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("verification failed: {0}")]
    Verification(#[from] VerifyError),
    #[error("install failed: {0}")]
    Install(String),
}

/// Record of one strategy attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyAttempt {
    pub strategy: StrategyKind,
    pub applicable: bool,
    pub error: String,
}

impl StrategyAttempt {
    pub fn from_error(strategy: StrategyKind, error: &StrategyError) -> Self {
        Self {
            strategy,
            applicable: !matches!(error, StrategyError::NotApplicable(_)),
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("{tool} cannot be obtained on {platform}: {}", summarize(.attempts))]
    Unsupported {
        tool: ToolId,
        platform: String,
        attempts: Vec<StrategyAttempt>,
    },
    #[error("all acquisition strategies failed for {tool}: {}", summarize(.attempts))]
    Exhausted {
        tool: ToolId,
        attempts: Vec<StrategyAttempt>,
    },
}

fn summarize(attempts: &[StrategyAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.strategy, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}
