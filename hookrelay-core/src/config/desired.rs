//! Desired state for one reconciler run.
//!
//! A [`DesiredConfig`] is assembled once at invocation from three layers
//! (CLI flags, an optional JSON config file, built-in defaults), validated,
//! and then treated as immutable for the rest of the run.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::app_env::AppEnv;

/// Default hostname served by the reverse proxy.
pub const DEFAULT_WEBHOOK_HOST: &str = "webhook.localhost";
/// Default public hostname routed through the tunnel.
pub const DEFAULT_TUNNEL_HOST: &str = "webhook.example.com";
/// Default local port of the containerized application.
pub const DEFAULT_PORT: u16 = 8080;
/// Default installation directory of the application stack.
pub const DEFAULT_INSTALL_DIR: &str = "/opt/hookrelay";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid hostname {value:?}: {reason}")]
    InvalidHostname { value: String, reason: &'static str },
    #[error("port must be between 1 and 65535")]
    InvalidPort,
    #[error("install directory must be an absolute path: {0}")]
    RelativeInstallDir(PathBuf),
    #[error("invalid value for {key}: {reason}")]
    InvalidEnvValue { key: &'static str, reason: &'static str },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// Flags
// =============================================================================

/// Boolean switches that shape what `install` is allowed to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Flags {
    /// Generate a locally trusted certificate and serve the TLS site variant.
    pub generate_local_cert: bool,
    /// Acquire the tunnel client and write its ingress document.
    pub prepare_tunnel: bool,
    /// Install the reverse-proxy engine when it is missing.
    pub allow_install_proxy: bool,
    /// Install the container engine when it is missing (server hosts only).
    pub allow_install_container_engine: bool,
    /// Skip the interactive confirmation.
    pub assume_yes: bool,
    /// Replace every mutating action with a logged no-op.
    pub dry_run: bool,
    /// Debug-level logging.
    pub verbose: bool,
}

// =============================================================================
// Config File Layer
// =============================================================================

/// Optional values read from a JSON config file.
///
/// Every field is optional; anything missing falls through to the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub webhook_host: Option<String>,
    pub tunnel_host: Option<String>,
    pub port: Option<u16>,
    pub install_dir: Option<PathBuf>,
    pub flags: Option<Flags>,
    pub app: Option<AppEnv>,
}

impl ConfigFile {
    /// Loads a config file from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Values supplied on the command line; `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub webhook_host: Option<String>,
    pub tunnel_host: Option<String>,
    pub port: Option<u16>,
    pub install_dir: Option<PathBuf>,
    pub flags: Flags,
}

// =============================================================================
// Desired Config
// =============================================================================

/// Immutable desired state for the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredConfig {
    pub webhook_host: String,
    pub tunnel_host: String,
    pub port: u16,
    pub install_dir: PathBuf,
    pub flags: Flags,
    /// Runtime parameters written to the application's environment file.
    pub app: AppEnv,
}

impl Default for DesiredConfig {
    fn default() -> Self {
        Self {
            webhook_host: DEFAULT_WEBHOOK_HOST.to_string(),
            tunnel_host: DEFAULT_TUNNEL_HOST.to_string(),
            port: DEFAULT_PORT,
            install_dir: PathBuf::from(DEFAULT_INSTALL_DIR),
            flags: Flags::default(),
            app: AppEnv::default(),
        }
    }
}

impl DesiredConfig {
    /// Merges CLI overrides over an optional config file over defaults, then
    /// validates the result.
    ///
    /// Boolean flags are OR-ed: a flag set in either layer is set.
    pub fn resolve(file: Option<ConfigFile>, cli: Overrides) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(file) = file {
            if let Some(host) = file.webhook_host {
                config.webhook_host = host;
            }
            if let Some(host) = file.tunnel_host {
                config.tunnel_host = host;
            }
            if let Some(port) = file.port {
                config.port = port;
            }
            if let Some(dir) = file.install_dir {
                config.install_dir = dir;
            }
            if let Some(flags) = file.flags {
                config.flags = flags;
            }
            if let Some(app) = file.app {
                config.app = app;
            }
        }

        if let Some(host) = cli.webhook_host {
            config.webhook_host = host;
        }
        if let Some(host) = cli.tunnel_host {
            config.tunnel_host = host;
        }
        if let Some(port) = cli.port {
            config.port = port;
        }
        if let Some(dir) = cli.install_dir {
            config.install_dir = dir;
        }
        config.flags = merge_flags(config.flags, cli.flags);

        config.webhook_host = config.webhook_host.to_ascii_lowercase();
        config.tunnel_host = config.tunnel_host.to_ascii_lowercase();
        config.app.listen_port = config.port;

        config.validate()?;
        Ok(config)
    }

    /// Rejects anything that would later be interpolated unsafely into a
    /// command argument or a rendered configuration file.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_hostname(&self.webhook_host)?;
        validate_hostname(&self.tunnel_host)?;
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if !self.install_dir.is_absolute() {
            return Err(ConfigError::RelativeInstallDir(self.install_dir.clone()));
        }
        self.app.validate()
    }

    /// Name used for the tunnel, derived from the tunnel hostname.
    pub fn tunnel_name(&self) -> String {
        self.tunnel_host.replace('.', "-")
    }

    /// Local upstream the proxy and tunnel point at.
    pub fn upstream(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

fn merge_flags(base: Flags, cli: Flags) -> Flags {
    Flags {
        generate_local_cert: base.generate_local_cert || cli.generate_local_cert,
        prepare_tunnel: base.prepare_tunnel || cli.prepare_tunnel,
        allow_install_proxy: base.allow_install_proxy || cli.allow_install_proxy,
        allow_install_container_engine: base.allow_install_container_engine
            || cli.allow_install_container_engine,
        assume_yes: base.assume_yes || cli.assume_yes,
        dry_run: base.dry_run || cli.dry_run,
        verbose: base.verbose || cli.verbose,
    }
}

/// Validates an RFC 1123 hostname.
pub fn validate_hostname(host: &str) -> Result<(), ConfigError> {
    let invalid = |reason| ConfigError::InvalidHostname {
        value: host.to_string(),
        reason,
    };

    if host.is_empty() {
        return Err(invalid("empty"));
    }
    if host.len() > 253 {
        return Err(invalid("longer than 253 characters"));
    }

    for label in host.split('.') {
        if label.is_empty() {
            return Err(invalid("empty label"));
        }
        if label.len() > 63 {
            return Err(invalid("label longer than 63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("label starts or ends with a hyphen"));
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(invalid("only letters, digits and hyphens are allowed"));
        }
    }

    Ok(())
}
