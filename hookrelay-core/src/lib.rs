//! Hookrelay Core Library
//!
//! Idempotent host reconciler for a self-hosted webhook relay. It includes:
//!
//! - Host probing (architecture, environment class, package tool, tools)
//! - A package manager abstraction over the common Linux package tools
//! - Multi-strategy acquisition of the tunnel client and certificate tool
//! - Idempotent appliers for proxy sites, certificates, tunnel ingress,
//!   hosts entries and the application environment file
//! - The `install` reconciler and the read-only `status` doctor

pub mod acquire;
pub mod apply;
pub mod config;
pub mod doctor;
pub mod exec;
pub mod orchestrator;
pub mod package;
pub mod paths;
pub mod probe;
pub mod retry;
pub mod services;
pub mod summary;

// Re-exports for convenience
pub use config::{ConfigError, ConfigFile, DesiredConfig, Flags, Overrides};
pub use doctor::Doctor;
pub use orchestrator::{Action, Context, Reconciler, Report, SetupError};
pub use summary::{Finding, RunSummary, Severity, EXIT_ERROR, EXIT_OK, EXIT_WARN};

// Re-export the pieces callers compose
pub use acquire::{Acquired, Acquirer, ToolId};
pub use apply::{Outcome, ResourceKind, ResourceRecord};
pub use exec::{CommandRunner, CommandSpec, Elevation, FatalPrecondition, Identity, SystemRunner};
pub use paths::HostPaths;
pub use probe::{EnvironmentClass, HostFacts};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
