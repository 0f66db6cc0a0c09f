//! Reverse-proxy site definitions.
//!
//! The site file is fully rendered from hostname, upstream and (optionally)
//! the certificate pair, so the same inputs always produce byte-identical
//! content. Applying overwrites the file and (re)points the enabling link.
//! The configuration is tested on every apply, so a broken site keeps
//! failing until fixed; the proxy is only reloaded when something changed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::{Outcome, ResourceKind, ResourceRecord};
use crate::exec::{CommandRunner, CommandSpec, HostFs};
use crate::paths::ProxyLayout;

/// Inputs for one site definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteSpec {
    pub host: String,
    /// `address:port` of the local application.
    pub upstream: String,
    pub max_body_bytes: u64,
    /// Certificate and key; renders the TLS variant when set.
    pub tls: Option<(PathBuf, PathBuf)>,
}

/// Renders the nginx server blocks for a site.
pub fn render_site(spec: &SiteSpec) -> String {
    let location = format!(
        "    client_max_body_size {body};\n\
         \n\
         \x20   location / {{\n\
         \x20       proxy_pass http://{upstream};\n\
         \x20       proxy_http_version 1.1;\n\
         \x20       proxy_set_header Host $host;\n\
         \x20       proxy_set_header X-Real-IP $remote_addr;\n\
         \x20       proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n\
         \x20       proxy_set_header X-Forwarded-Proto $scheme;\n\
         \x20   }}\n",
        body = spec.max_body_bytes,
        upstream = spec.upstream,
    );

    let mut out = format!("# Managed by hookrelay for {}; local edits are overwritten.\n", spec.host);
    match &spec.tls {
        None => {
            out.push_str(&format!(
                "server {{\n    listen 80;\n    listen [::]:80;\n    server_name {};\n\n{}}}\n",
                spec.host, location
            ));
        }
        Some((cert, key)) => {
            out.push_str(&format!(
                "server {{\n    listen 80;\n    listen [::]:80;\n    server_name {};\n    return 301 https://$host$request_uri;\n}}\n\n",
                spec.host
            ));
            out.push_str(&format!(
                "server {{\n    listen 443 ssl;\n    listen [::]:443 ssl;\n    server_name {};\n\n    ssl_certificate {};\n    ssl_certificate_key {};\n    ssl_protocols TLSv1.2 TLSv1.3;\n\n{}}}\n",
                spec.host,
                cert.display(),
                key.display(),
                location
            ));
        }
    }
    out
}

pub struct ProxySiteApplier {
    runner: Arc<dyn CommandRunner>,
    fs: HostFs,
    layout: ProxyLayout,
    nginx: PathBuf,
}

impl ProxySiteApplier {
    pub fn new(runner: Arc<dyn CommandRunner>, fs: HostFs, layout: ProxyLayout, nginx: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            fs,
            layout,
            nginx: nginx.into(),
        }
    }

    async fn link_ok(&self, site: &Path, link: Option<&Path>) -> bool {
        match link {
            Some(link) => self.fs.read_link(link).await.as_deref() == Some(site),
            None => true,
        }
    }

    /// Read-only check of the site file and its enabling link.
    pub async fn inspect(&self, spec: &SiteSpec) -> ResourceRecord {
        let site = self.layout.site_file(&spec.host);
        let desired = render_site(spec);
        let link = self.layout.enabled_link(&spec.host);

        let mut outcome = super::inspect_file(&self.fs, &site, &desired).await;
        if outcome == Outcome::Unchanged && !self.link_ok(&site, link.as_deref()).await {
            outcome = Outcome::Planned;
        }
        ResourceRecord::new(ResourceKind::ProxySite, site, desired).with_outcome(outcome)
    }

    /// Writes the site, enables it, and reloads the proxy if anything changed.
    pub async fn apply(&self, spec: &SiteSpec) -> ResourceRecord {
        let site = self.layout.site_file(&spec.host);
        let desired = render_site(spec);
        let link = self.layout.enabled_link(&spec.host);
        let record = ResourceRecord::new(ResourceKind::ProxySite, &site, desired.clone());

        let mut outcome = match super::sync_file(&self.fs, &site, &desired, Some(0o644)).await {
            Ok(outcome) => outcome,
            Err(e) => return record.with_outcome(Outcome::failed(format!("{:#}", e))),
        };

        if let Some(link) = &link {
            if !self.link_ok(&site, Some(link)).await {
                if let Some(dir) = link.parent() {
                    if let Err(e) = self.fs.create_dir_all(dir).await {
                        return record.with_outcome(Outcome::failed(format!("{:#}", e)));
                    }
                }
                if let Err(e) = self.fs.symlink(&site, link).await {
                    return record.with_outcome(Outcome::failed(format!("{:#}", e)));
                }
                if outcome == Outcome::Unchanged {
                    outcome = if self.fs.is_dry_run() {
                        Outcome::Planned
                    } else {
                        Outcome::Applied
                    };
                }
            }
        }

        let outcome = match outcome {
            Outcome::Applied => {
                info!("Site for {} written to {}", spec.host, site.display());
                match self.test_config().await {
                    Ok(()) => match self.reload().await {
                        Ok(()) => Outcome::Applied,
                        Err(reason) => Outcome::Failed { reason },
                    },
                    Err(reason) => {
                        self.disable(link.as_deref()).await;
                        Outcome::Failed { reason }
                    }
                }
            }
            Outcome::Unchanged => match self.test_config().await {
                Ok(()) => Outcome::Unchanged,
                Err(reason) => Outcome::Failed { reason },
            },
            other => other,
        };
        record.with_outcome(outcome)
    }

    fn nginx(&self) -> String {
        self.nginx.to_string_lossy().into_owned()
    }

    /// `nginx -t`; read-only, so it also runs in dry-run.
    async fn test_config(&self) -> Result<(), String> {
        self.runner
            .run(&CommandSpec::new(self.nginx()).arg("-t").privileged())
            .await
            .map(|_| ())
            .map_err(|e| format!("configuration test failed: {}", e))
    }

    /// Unlinks a site that failed the configuration test so it is never live.
    async fn disable(&self, link: Option<&Path>) {
        let Some(link) = link else { return };
        match self.fs.remove_file(link).await {
            Ok(()) => warn!("Disabled {} after a failed configuration test", link.display()),
            Err(e) => warn!("Failed to disable {}: {:#}", link.display(), e),
        }
    }

    async fn reload(&self) -> Result<(), String> {
        let reload = CommandSpec::new("systemctl")
            .args(["reload", "nginx"])
            .privileged()
            .mutating();
        if self.runner.succeeds(&reload).await {
            return Ok(());
        }

        warn!("systemctl reload nginx failed; signalling nginx directly");
        self.runner
            .run(&CommandSpec::new(self.nginx()).args(["-s", "reload"]).privileged().mutating())
            .await
            .map(|_| ())
            .map_err(|e| format!("reload failed: {}", e))
    }
}
