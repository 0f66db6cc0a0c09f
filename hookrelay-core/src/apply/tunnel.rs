//! Tunnel ingress configuration and the tunnel client commands behind it.
//!
//! The ingress document is rendered in full and overwritten, mapping the
//! tunnel hostname to the local upstream with a catch-all 404 rule. When the
//! invoking user has logged in (`~/.cloudflared/cert.pem`), the named tunnel
//! is looked up or created and its credentials are referenced from the
//! document. Tunnel creation and DNS routing run as the invoking user so the
//! login certificate and credentials stay in that user's home.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{inspect_file, sync_file, Outcome, ResourceKind, ResourceRecord};
use crate::exec::{CommandRunner, CommandSpec, ExecError, HostFs, Identity};

/// Quotes a scalar for YAML; JSON strings are valid double-quoted YAML.
fn yaml_str(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{}\"", value))
}

/// A tunnel known to the tunnel service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TunnelInfo {
    pub id: String,
    pub name: String,
}

/// Tunnel reference written into the ingress document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelCredentials {
    pub id: String,
    pub credentials_file: PathBuf,
}

/// Renders the ingress document.
pub fn render_ingress(tunnel: Option<&TunnelCredentials>, hostname: &str, upstream: &str) -> String {
    let mut out = String::from("# Managed by hookrelay; local edits are overwritten.\n");
    if let Some(tunnel) = tunnel {
        out.push_str(&format!("tunnel: {}\n", yaml_str(&tunnel.id)));
        out.push_str(&format!(
            "credentials-file: {}\n",
            yaml_str(&tunnel.credentials_file.to_string_lossy())
        ));
    }
    out.push_str("ingress:\n");
    out.push_str(&format!("  - hostname: {}\n", yaml_str(hostname)));
    out.push_str(&format!("    service: {}\n", yaml_str(&format!("http://{}", upstream))));
    out.push_str("  - service: http_status:404\n");
    out
}

// ============================================================================
// Tunnel Client
// ============================================================================

/// Thin wrapper over the tunnel client CLI.
pub struct TunnelClient {
    runner: Arc<dyn CommandRunner>,
    program: String,
    user: Option<String>,
    home: Option<PathBuf>,
}

impl TunnelClient {
    pub fn new(runner: Arc<dyn CommandRunner>, cloudflared: &Path, identity: &Identity) -> Self {
        Self {
            runner,
            program: cloudflared.to_string_lossy().into_owned(),
            user: identity.unprivileged_user().map(str::to_string),
            home: identity.invoking_home.clone(),
        }
    }

    fn state_dir(&self) -> Option<PathBuf> {
        self.home.as_ref().map(|home| home.join(".cloudflared"))
    }

    /// The login certificate, if the user has run `cloudflared tunnel login`.
    pub fn origin_cert(&self) -> Option<PathBuf> {
        self.state_dir()
            .map(|dir| dir.join("cert.pem"))
            .filter(|cert| cert.is_file())
    }

    pub fn credentials_file(&self, id: &str) -> Option<PathBuf> {
        self.state_dir().map(|dir| dir.join(format!("{}.json", id)))
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.program)
            .arg("tunnel")
            .run_as(self.user.as_deref())
    }

    pub async fn list(&self) -> Result<Vec<TunnelInfo>, ExecError> {
        let out = self
            .runner
            .run(&self.command().args(["list", "--output", "json"]))
            .await?;
        let trimmed = out.stdout.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(trimmed).map_err(|e| ExecError::Failed {
            program: self.program.clone(),
            code: "0".to_string(),
            stderr: format!("unexpected tunnel list output: {}", e),
        })
    }

    pub async fn find(&self, name: &str) -> Result<Option<TunnelInfo>, ExecError> {
        Ok(self.list().await?.into_iter().find(|t| t.name == name))
    }

    /// Creates a tunnel and returns it; `None` in dry-run mode.
    pub async fn create(&self, name: &str) -> Result<Option<TunnelInfo>, ExecError> {
        self.runner
            .run(&self.command().args(["create", name]).mutating())
            .await?;
        self.find(name).await
    }

    /// Points a DNS record for `hostname` at the tunnel.
    pub async fn route_dns(&self, name: &str, hostname: &str) -> Result<(), ExecError> {
        let out = self
            .runner
            .output(&self.command().args(["route", "dns", name, hostname]).mutating())
            .await?;
        if out.success() || out.stderr.contains("already exists") {
            Ok(())
        } else {
            Err(ExecError::Failed {
                program: self.program.clone(),
                code: out.code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    /// Command the operator runs to bring the tunnel up.
    pub fn run_hint(&self, config: &Path, name: &str) -> String {
        format!("{} tunnel --config {} run {}", self.program, config.display(), name)
    }
}

// ============================================================================
// Applier
// ============================================================================

/// Result of reconciling the tunnel.
#[derive(Debug, Clone)]
pub struct TunnelReport {
    pub record: ResourceRecord,
    /// Degradations the operator should know about.
    pub warnings: Vec<String>,
    pub hint: Option<String>,
}

pub struct TunnelApplier {
    fs: HostFs,
    client: TunnelClient,
    config_path: PathBuf,
}

impl TunnelApplier {
    pub fn new(fs: HostFs, client: TunnelClient, config_path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            client,
            config_path: config_path.into(),
        }
    }

    fn credentials(&self, tunnel: &TunnelInfo) -> Option<TunnelCredentials> {
        self.client.credentials_file(&tunnel.id).map(|file| TunnelCredentials {
            id: tunnel.id.clone(),
            credentials_file: file,
        })
    }

    fn no_login_warning(&self) -> String {
        format!(
            "no tunnel login certificate found; run `cloudflared tunnel login`{} and re-run install",
            self.client
                .user
                .as_deref()
                .map(|u| format!(" as {}", u))
                .unwrap_or_default()
        )
    }

    /// Read-only check.
    pub async fn inspect(&self, name: &str, hostname: &str, upstream: &str) -> TunnelReport {
        let mut warnings = Vec::new();
        let desired = if self.client.origin_cert().is_none() {
            warnings.push(self.no_login_warning());
            Some(render_ingress(None, hostname, upstream))
        } else {
            match self.client.find(name).await {
                Ok(Some(tunnel)) => Some(render_ingress(self.credentials(&tunnel).as_ref(), hostname, upstream)),
                Ok(None) => None,
                Err(e) => {
                    return TunnelReport {
                        record: ResourceRecord::skipped(
                            ResourceKind::TunnelConfig,
                            &self.config_path,
                            format!("cannot list tunnels: {}", e),
                        ),
                        warnings,
                        hint: None,
                    }
                }
            }
        };

        let record = match desired {
            Some(desired) => {
                let outcome = inspect_file(&self.fs, &self.config_path, &desired).await;
                ResourceRecord::new(ResourceKind::TunnelConfig, &self.config_path, desired).with_outcome(outcome)
            }
            None => ResourceRecord::new(
                ResourceKind::TunnelConfig,
                &self.config_path,
                render_ingress(None, hostname, upstream),
            ),
        };
        TunnelReport {
            record,
            warnings,
            hint: Some(self.client.run_hint(&self.config_path, name)),
        }
    }

    /// Ensures the tunnel exists (when logged in) and writes the document.
    pub async fn apply(&self, name: &str, hostname: &str, upstream: &str) -> TunnelReport {
        let mut warnings = Vec::new();

        let tunnel = if self.client.origin_cert().is_none() {
            warnings.push(self.no_login_warning());
            None
        } else {
            match self.ensure_tunnel(name, hostname, &mut warnings).await {
                Ok(tunnel) => tunnel,
                Err(e) => {
                    // Keep whatever document is on disk rather than replace it
                    // with one that lacks credentials.
                    return TunnelReport {
                        record: ResourceRecord::skipped(
                            ResourceKind::TunnelConfig,
                            &self.config_path,
                            format!("tunnel client failed: {}", e),
                        ),
                        warnings,
                        hint: None,
                    };
                }
            }
        };

        let credentials = tunnel.as_ref().and_then(|t| self.credentials(t));
        let desired = render_ingress(credentials.as_ref(), hostname, upstream);
        let record = ResourceRecord::new(ResourceKind::TunnelConfig, &self.config_path, desired.clone());
        let record = match sync_file(&self.fs, &self.config_path, &desired, Some(0o644)).await {
            Ok(outcome) => {
                if outcome == Outcome::Applied {
                    info!("Tunnel ingress written to {}", self.config_path.display());
                }
                record.with_outcome(outcome)
            }
            Err(e) => record.with_outcome(Outcome::failed(format!("{:#}", e))),
        };

        TunnelReport {
            record,
            warnings,
            hint: Some(self.client.run_hint(&self.config_path, name)),
        }
    }

    async fn ensure_tunnel(
        &self,
        name: &str,
        hostname: &str,
        warnings: &mut Vec<String>,
    ) -> Result<Option<TunnelInfo>, ExecError> {
        let tunnel = match self.client.find(name).await? {
            Some(existing) => {
                debug!("Tunnel {} already exists ({})", name, existing.id);
                existing
            }
            None => {
                info!("Creating tunnel {}", name);
                match self.client.create(name).await? {
                    Some(created) => created,
                    None => return Ok(None),
                }
            }
        };

        // Routed on every run so a failure on an earlier run is retried.
        if let Err(e) = self.client.route_dns(name, hostname).await {
            warn!("Failed to route {} to tunnel {}: {}", hostname, name, e);
            warnings.push(format!(
                "DNS routing of {} to tunnel {} failed: {}",
                hostname, name, e
            ));
        }
        Ok(Some(tunnel))
    }
}
