//! Configuration for a reconciler run.
//!
//! Desired state comes from CLI flags layered over an optional JSON file
//! layered over defaults.

mod app_env;
mod desired;

pub use app_env::{generate_secret, AppEnv, SECRET_KEYS};
pub use desired::{
    validate_hostname, ConfigError, ConfigFile, DesiredConfig, Flags, Overrides,
    DEFAULT_INSTALL_DIR, DEFAULT_PORT, DEFAULT_TUNNEL_HOST, DEFAULT_WEBHOOK_HOST,
};
