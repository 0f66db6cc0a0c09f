//! Read-only diagnostics for the `status` action.
//!
//! Runs the same probes and existence checks as the reconciler but never an
//! apply step. Anything `install` would still change is reported as a
//! warning, so the exit code works as a health check.

use std::path::Path;
use tracing::info;

use crate::acquire::{get_tool_definition, Acquired, SystemLocator, ToolId, ToolLocator};
use crate::apply::{
    CertificateApplier, EnvFileApplier, HostsApplier, ProxySiteApplier, ResourceKind, ResourceRecord, SiteSpec,
    TunnelApplier, TunnelClient,
};
use crate::config::DesiredConfig;
use crate::orchestrator::{Action, Context, Report};
use crate::package::PackageManagerId;
use crate::probe::{HostFacts, Prober};
use crate::services::ComposeLauncher;

pub struct Doctor {
    ctx: Context,
}

impl Doctor {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Runs the `status` action.
    pub async fn diagnose(&self, config: &DesiredConfig) -> Report {
        let ctx = &self.ctx;
        let mut report = Report::new(Action::Status, true);

        if let Some(e) = &ctx.elevation_error {
            report.summary.warn("precondition", format!("install will not be possible: {}", e));
        }

        let facts = Prober::new(ctx.runner.clone(), ctx.lookup.clone(), ctx.paths.clone())
            .probe()
            .await;
        report.summary.info("probe", format!("{} host, package manager {}", facts.class, facts.package_manager));
        if facts.package_manager == PackageManagerId::Unknown {
            report.summary.warn("package-manager", "no supported package manager found");
        }

        check_probed_tool(&facts, "nginx", "proxy-engine", &mut report);
        check_probed_tool(&facts, "docker", "container-engine", &mut report);

        let cloudflared = self.locate(ToolId::Cloudflared, &mut report).await;
        let mkcert_requested = config.flags.generate_local_cert;
        if mkcert_requested {
            self.locate(ToolId::Mkcert, &mut report).await;
        }

        report.record(EnvFileApplier::new(ctx.fs.clone(), &config.install_dir).inspect(&config.app).await);

        let certs = CertificateApplier::new(ctx.runner.clone(), ctx.fs.clone(), ctx.identity.clone(), &ctx.paths.cert_dir);
        if mkcert_requested {
            report.record(certs.inspect(&config.webhook_host).await);
        }

        let spec = SiteSpec {
            host: config.webhook_host.clone(),
            upstream: config.upstream(),
            max_body_bytes: config.app.max_payload_bytes,
            tls: mkcert_requested.then(|| certs.pair(&config.webhook_host)),
        };
        let nginx = ctx.which("nginx").unwrap_or_else(|| "nginx".into());
        report.record(
            ProxySiteApplier::new(ctx.runner.clone(), ctx.fs.clone(), ctx.paths.proxy_layout(), nginx)
                .inspect(&spec)
                .await,
        );

        if facts.class.wants_hosts_entry() {
            let hosts = HostsApplier::new(ctx.fs.clone(), &ctx.paths.hosts_file);
            report.record(hosts.inspect(&config.webhook_host).await);
        }

        if config.flags.prepare_tunnel {
            self.check_tunnel(config, cloudflared.as_deref(), &mut report).await;
        }

        let launcher = ComposeLauncher::new(ctx.runner.clone(), &ctx.search_dirs(), true);
        report.record(launcher.inspect(&config.install_dir, &facts));

        if facts.is_listening(config.port) {
            report.summary.info("service", format!("port {} is listening", config.port));
        } else {
            report.summary.warn("service", format!("nothing is listening on port {}", config.port));
        }

        report.facts = Some(facts);
        info!("{}", report.summary.headline());
        report
    }

    async fn locate(&self, id: ToolId, report: &mut Report) -> Option<std::path::PathBuf> {
        let locator = SystemLocator::new(self.ctx.runner.clone(), &self.ctx.paths.bin_dir, &self.ctx.paths.search_path);
        match locator.locate(get_tool_definition(id)).await {
            Some(tool) => {
                report.summary.info("tools", format!("{} {}", id, tool.version));
                let path = tool.path.clone();
                report.tools.insert(
                    id.to_string(),
                    Acquired::AlreadyPresent {
                        path: tool.path,
                        version: tool.version,
                    },
                );
                Some(path)
            }
            None => {
                report.summary.warn("tools", format!("{} is not installed", id));
                None
            }
        }
    }

    async fn check_tunnel(&self, config: &DesiredConfig, cloudflared: Option<&Path>, report: &mut Report) {
        let ctx = &self.ctx;
        let Some(cloudflared) = cloudflared else {
            report.record(ResourceRecord::skipped(
                ResourceKind::TunnelConfig,
                &ctx.paths.tunnel_config,
                "cloudflared is not installed",
            ));
            return;
        };

        let client = TunnelClient::new(ctx.runner.clone(), cloudflared, &ctx.identity);
        let outcome = TunnelApplier::new(ctx.fs.clone(), client, &ctx.paths.tunnel_config)
            .inspect(&config.tunnel_name(), &config.tunnel_host, &config.upstream())
            .await;
        for warning in outcome.warnings {
            report.summary.warn("tunnel-config", warning);
        }
        report.record(outcome.record);
        if let Some(hint) = outcome.hint {
            report.hints.push(hint);
        }
    }
}

fn check_probed_tool(facts: &HostFacts, tool: &str, step: &str, report: &mut Report) {
    match facts.tools.get(tool) {
        Some(version) => report.summary.info(step, version.clone()),
        None => report.summary.warn(step, format!("{} is not installed", tool)),
    }
}
