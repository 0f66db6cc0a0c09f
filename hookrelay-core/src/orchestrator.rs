//! Reconciliation orchestrator.
//!
//! Sequences probe, package manager setup, baseline packages, tool
//! acquisition, resource appliers and service startup. Every step reports
//! into the run's [`RunSummary`]; a failing step never unwinds the run. The
//! only abort is a [`FatalPrecondition`], raised while building the
//! [`Context`] before anything is touched.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::acquire::{query_version, Acquired, Acquirer, BaselineRole, Fetcher, HttpFetcher, ToolId};
use crate::acquire::catalog::baseline;
use crate::apply::{
    render_ingress, CertificateApplier, EnvFileApplier, HostsApplier, Outcome, ProxySiteApplier,
    ResourceKind, ResourceRecord, SiteSpec, TunnelApplier, TunnelClient,
};
use crate::config::DesiredConfig;
use crate::exec::{which_in, CommandRunner, Elevation, FatalPrecondition, HostFs, Identity, SystemRunner};
use crate::package::{self, PackageManager, PackageManagerId};
use crate::paths::HostPaths;
use crate::probe::{AddressLookup, HostFacts, HttpAddressLookup, Prober};
use crate::retry::RetryPolicy;
use crate::services::ComposeLauncher;
use crate::summary::RunSummary;

// ============================================================================
// Context
// ============================================================================

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Fatal(#[from] FatalPrecondition),
    #[error("failed to initialise HTTP client: {0:#}")]
    Http(anyhow::Error),
}

/// Everything a run needs to talk to the host.
#[derive(Clone)]
pub struct Context {
    pub runner: Arc<dyn CommandRunner>,
    pub fs: HostFs,
    pub identity: Identity,
    pub paths: HostPaths,
    pub lookup: Arc<dyn AddressLookup>,
    pub fetcher: Arc<dyn Fetcher>,
    pub retry: RetryPolicy,
    pub dry_run: bool,
    /// Set when no elevation path exists; only tolerated by `status`.
    pub elevation_error: Option<String>,
}

impl Context {
    /// Wires the live host for `install`.
    ///
    /// Fails with [`FatalPrecondition`] when neither root nor sudo is
    /// available.
    pub async fn system(dry_run: bool) -> Result<Self, SetupError> {
        let probe_runner = SystemRunner::new(Elevation::Direct, dry_run);
        let identity = Identity::detect(&probe_runner).await?;
        Self::with_identity(identity, dry_run, None)
    }

    /// Wires the live host for `status`, which never needs elevation.
    pub async fn read_only() -> Result<Self, SetupError> {
        let probe_runner = SystemRunner::new(Elevation::Direct, true);
        match Identity::detect(&probe_runner).await {
            Ok(identity) => Self::with_identity(identity, true, None),
            Err(e) => {
                let identity = Identity {
                    elevation: Elevation::Direct,
                    invoking_user: std::env::var("USER").ok(),
                    invoking_home: dirs::home_dir(),
                };
                Self::with_identity(identity, true, Some(e.to_string()))
            }
        }
    }

    fn with_identity(identity: Identity, dry_run: bool, elevation_error: Option<String>) -> Result<Self, SetupError> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(identity.elevation, dry_run));
        let fetcher = HttpFetcher::new().map_err(SetupError::Http)?;
        Ok(Self {
            fs: HostFs::new(runner.clone(), identity.elevation, dry_run),
            runner,
            identity,
            paths: HostPaths::system(),
            lookup: Arc::new(HttpAddressLookup::default()),
            fetcher: Arc::new(fetcher),
            retry: RetryPolicy::NETWORK,
            dry_run,
            elevation_error,
        })
    }

    /// Binary directory first, then the search path.
    pub(crate) fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.paths.bin_dir.clone()];
        dirs.extend(self.paths.search_path.iter().cloned());
        dirs
    }

    pub(crate) fn which(&self, bin: &str) -> Option<PathBuf> {
        which_in(bin, &self.search_dirs())
    }
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Install,
    Status,
}

/// Everything a run found and did.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub action: Action,
    pub dry_run: bool,
    pub facts: Option<HostFacts>,
    pub tools: BTreeMap<String, Acquired>,
    pub resources: Vec<ResourceRecord>,
    /// Follow-up commands for the operator.
    pub hints: Vec<String>,
    pub summary: RunSummary,
}

impl Report {
    pub fn new(action: Action, dry_run: bool) -> Self {
        Self {
            action,
            dry_run,
            facts: None,
            tools: BTreeMap::new(),
            resources: Vec::new(),
            hints: Vec::new(),
            summary: RunSummary::new(),
        }
    }

    /// A report for a run that could not start.
    pub fn fatal(action: Action, error: impl std::fmt::Display) -> Self {
        let mut report = Self::new(action, false);
        report.summary.error("precondition", error.to_string());
        report
    }

    pub fn exit_code(&self) -> i32 {
        self.summary.exit_code()
    }

    /// Records a resource and reports its outcome.
    pub fn record(&mut self, record: ResourceRecord) {
        let step = record.kind.as_str();
        let target = record.target.display().to_string();
        match &record.outcome {
            Outcome::Applied => self.summary.info(step, format!("updated {}", target)),
            Outcome::Unchanged => debug!(step, "{} is up to date", target),
            Outcome::Planned => match (self.action, record.kind) {
                (Action::Install, _) => self.summary.info(step, format!("would update {}", target)),
                (Action::Status, ResourceKind::Service) => {
                    self.summary.warn(step, "the application stack is not running")
                }
                (Action::Status, _) => self.summary.warn(step, format!("{} is missing or out of date", target)),
            },
            Outcome::Skipped { reason } => self.summary.skipped(step, reason),
            Outcome::Failed { reason } => self.summary.error(step, format!("{}: {}", target, reason)),
        }
        self.resources.push(record);
    }

    pub fn resource(&self, kind: ResourceKind) -> Option<&ResourceRecord> {
        self.resources.iter().find(|r| r.kind == kind)
    }
}

// ============================================================================
// Availability
// ============================================================================

/// Whether a tool a later step needs can be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Availability {
    Present(PathBuf),
    /// Dry-run: would be installed first.
    Planned,
    Missing(String),
}

impl Availability {
    fn from_acquired(acquired: &Acquired) -> Self {
        match acquired.path() {
            Some(path) => Self::Present(path.to_path_buf()),
            None => Self::Planned,
        }
    }
}

// ============================================================================
// Reconciler
// ============================================================================

pub struct Reconciler {
    ctx: Context,
}

impl Reconciler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Runs the `install` action.
    pub async fn install(&self, config: &DesiredConfig) -> Report {
        let ctx = &self.ctx;
        let mut report = Report::new(Action::Install, ctx.dry_run);
        info!(
            webhook_host = %config.webhook_host,
            tunnel_host = %config.tunnel_host,
            port = config.port,
            dry_run = ctx.dry_run,
            "Reconciling host"
        );

        let mut facts = Prober::new(ctx.runner.clone(), ctx.lookup.clone(), ctx.paths.clone())
            .probe()
            .await;
        report.summary.info(
            "probe",
            format!(
                "{} host ({} {}), package manager {}",
                facts.class,
                facts.distro_id.as_deref().unwrap_or(&facts.kernel.name),
                facts.arch,
                facts.package_manager
            ),
        );

        let pm = package::bind(facts.package_manager, ctx.runner.clone(), ctx.retry);
        if pm.id() == PackageManagerId::Unknown {
            report.summary.warn(
                "package-manager",
                "no supported package manager found; package installs will be skipped",
            );
        }

        self.install_essentials(pm.as_ref(), &mut report).await;
        let nginx = self.ensure_proxy_engine(config, pm.as_ref(), &mut report).await;
        self.ensure_container_engine(config, &mut facts, pm.as_ref(), &mut report).await;

        let acquirer = Acquirer::standard(
            ctx.runner.clone(),
            ctx.fs.clone(),
            pm.clone(),
            ctx.fetcher.clone(),
            &ctx.paths,
            ctx.retry,
        );
        let cloudflared = self.acquire(&acquirer, ToolId::Cloudflared, &facts, &mut report).await;
        let mkcert = if config.flags.generate_local_cert {
            Some(self.acquire(&acquirer, ToolId::Mkcert, &facts, &mut report).await)
        } else {
            None
        };

        report.record(EnvFileApplier::new(ctx.fs.clone(), &config.install_dir).apply(&config.app).await);

        let tls = match &mkcert {
            Some(mkcert) => self.apply_certificate(config, mkcert, &mut report).await,
            None => None,
        };
        self.apply_proxy_site(config, &nginx, tls, &mut report).await;
        self.apply_hosts_entry(config, &facts, &mut report).await;
        if config.flags.prepare_tunnel {
            self.apply_tunnel(config, &cloudflared, &mut report).await;
        }

        let launcher = ComposeLauncher::new(ctx.runner.clone(), &ctx.search_dirs(), ctx.dry_run);
        report.record(launcher.start(&config.install_dir, &facts).await);

        report.facts = Some(facts);
        info!("{}", report.summary.headline());
        report
    }

    // ------------------------------------------------------------------------
    // Packages
    // ------------------------------------------------------------------------

    async fn install_essentials(&self, pm: &dyn PackageManager, report: &mut Report) {
        if pm.id() == PackageManagerId::Unknown {
            return;
        }
        let wanted: Vec<&str> = baseline(BaselineRole::Essential)
            .filter(|p| p.binary.map_or(true, |bin| self.ctx.which(bin).is_none()))
            .filter_map(|p| p.package_for(pm.id()))
            .collect();
        if wanted.is_empty() {
            return;
        }
        match pm.install(&wanted).await {
            Ok(installed) if installed.is_empty() => debug!("Baseline packages already installed"),
            Ok(installed) => report
                .summary
                .info("packages", format!("installed {}", installed.join(", "))),
            Err(e) => report.summary.warn("packages", e.to_string()),
        }
    }

    async fn install_role(
        &self,
        role: BaselineRole,
        binary: &str,
        step: &str,
        pm: &dyn PackageManager,
        report: &mut Report,
    ) -> Availability {
        let packages: Vec<&str> = baseline(role).filter_map(|p| p.package_for(pm.id())).collect();
        if packages.is_empty() {
            let reason = format!("no {} package is known for {}", binary, pm.id());
            report.summary.warn(step, &reason);
            return Availability::Missing(reason);
        }
        if let Err(e) = pm.install(&packages).await {
            report.summary.warn(step, e.to_string());
            return Availability::Missing(e.to_string());
        }
        if self.ctx.dry_run {
            report.summary.info(step, format!("would install {}", packages.join(", ")));
            return Availability::Planned;
        }
        match self.ctx.which(binary) {
            Some(path) => {
                report.summary.info(step, format!("installed {}", packages.join(", ")));
                Availability::Present(path)
            }
            None => {
                let reason = format!("{} was installed but {} is not on the search path", packages.join(", "), binary);
                report.summary.warn(step, &reason);
                Availability::Missing(reason)
            }
        }
    }

    async fn ensure_proxy_engine(&self, config: &DesiredConfig, pm: &dyn PackageManager, report: &mut Report) -> Availability {
        if let Some(path) = self.ctx.which("nginx") {
            return Availability::Present(path);
        }
        if config.flags.allow_install_proxy {
            return self
                .install_role(BaselineRole::ProxyEngine, "nginx", "proxy-engine", pm, report)
                .await;
        }
        let reason = "nginx is not installed; pass --install-proxy to install it".to_string();
        report.summary.warn("proxy-engine", &reason);
        Availability::Missing(reason)
    }

    async fn ensure_container_engine(
        &self,
        config: &DesiredConfig,
        facts: &mut HostFacts,
        pm: &dyn PackageManager,
        report: &mut Report,
    ) {
        if facts.has_tool("docker") {
            return;
        }
        if !config.flags.allow_install_container_engine {
            report.summary.warn(
                "container-engine",
                "docker is not installed; pass --install-container-engine to install it",
            );
            return;
        }
        if !facts.class.allows_container_engine_install() {
            report.summary.warn(
                "container-engine",
                format!(
                    "automatic container engine installation is not supported on a {} host; install Docker for this platform manually",
                    facts.class
                ),
            );
            return;
        }

        let availability = self
            .install_role(BaselineRole::ContainerEngine, "docker", "container-engine", pm, report)
            .await;
        if let Availability::Present(path) = availability {
            let version = query_version(self.ctx.runner.as_ref(), &path, &["--version"])
                .await
                .unwrap_or_default();
            facts.tools.insert("docker".to_string(), version);
        }
    }

    // ------------------------------------------------------------------------
    // Tools
    // ------------------------------------------------------------------------

    async fn acquire(&self, acquirer: &Acquirer, id: ToolId, facts: &HostFacts, report: &mut Report) -> Availability {
        match acquirer.ensure(id, facts).await {
            Ok(acquired) => {
                match &acquired {
                    Acquired::Installed { version, strategy, .. } => report
                        .summary
                        .info("acquire", format!("installed {} {} via {}", id, version, strategy)),
                    Acquired::Planned => report.summary.info("acquire", format!("would acquire {}", id)),
                    Acquired::AlreadyPresent { .. } => {}
                }
                let availability = Availability::from_acquired(&acquired);
                report.tools.insert(id.to_string(), acquired);
                availability
            }
            Err(e) => {
                report.summary.warn("acquire", e.to_string());
                Availability::Missing(format!("{} is unavailable", id))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------------

    /// Returns the pair to serve when the TLS variant applies.
    async fn apply_certificate(
        &self,
        config: &DesiredConfig,
        mkcert: &Availability,
        report: &mut Report,
    ) -> Option<(PathBuf, PathBuf)> {
        let ctx = &self.ctx;
        let certs = CertificateApplier::new(ctx.runner.clone(), ctx.fs.clone(), ctx.identity.clone(), &ctx.paths.cert_dir);
        let host = &config.webhook_host;

        let record = match mkcert {
            Availability::Present(path) => certs.apply(path, host).await,
            Availability::Planned => certs.inspect(host).await,
            Availability::Missing(reason) => {
                let (cert, _) = certs.pair(host);
                ResourceRecord::skipped(ResourceKind::Certificate, cert, reason.clone())
            }
        };
        let planned = record.outcome == Outcome::Planned;
        report.record(record);

        if certs.pair_exists(host) || (ctx.dry_run && planned) {
            Some(certs.pair(host))
        } else {
            report
                .summary
                .warn("proxy-site", format!("no certificate for {}; serving plain HTTP", host));
            None
        }
    }

    async fn apply_proxy_site(
        &self,
        config: &DesiredConfig,
        nginx: &Availability,
        tls: Option<(PathBuf, PathBuf)>,
        report: &mut Report,
    ) {
        let ctx = &self.ctx;
        let layout = ctx.paths.proxy_layout();
        let spec = SiteSpec {
            host: config.webhook_host.clone(),
            upstream: config.upstream(),
            max_body_bytes: config.app.max_payload_bytes,
            tls,
        };

        let record = match nginx {
            Availability::Present(path) => {
                ProxySiteApplier::new(ctx.runner.clone(), ctx.fs.clone(), layout, path.as_path())
                    .apply(&spec)
                    .await
            }
            Availability::Planned => {
                ProxySiteApplier::new(ctx.runner.clone(), ctx.fs.clone(), layout, "nginx")
                    .inspect(&spec)
                    .await
            }
            Availability::Missing(reason) => {
                ResourceRecord::skipped(ResourceKind::ProxySite, layout.site_file(&spec.host), reason.clone())
            }
        };
        report.record(record);
    }

    async fn apply_hosts_entry(&self, config: &DesiredConfig, facts: &HostFacts, report: &mut Report) {
        if !facts.class.wants_hosts_entry() {
            report.summary.info(
                "hosts-entry",
                format!("public server; relying on DNS for {}", config.webhook_host),
            );
            return;
        }
        let hosts = HostsApplier::new(self.ctx.fs.clone(), &self.ctx.paths.hosts_file);
        report.record(hosts.apply(&config.webhook_host).await);
    }

    async fn apply_tunnel(&self, config: &DesiredConfig, cloudflared: &Availability, report: &mut Report) {
        let ctx = &self.ctx;
        let config_path = &ctx.paths.tunnel_config;
        match cloudflared {
            Availability::Present(path) => {
                let client = TunnelClient::new(ctx.runner.clone(), path, &ctx.identity);
                let applier = TunnelApplier::new(ctx.fs.clone(), client, config_path);
                let outcome = applier
                    .apply(&config.tunnel_name(), &config.tunnel_host, &config.upstream())
                    .await;
                for warning in outcome.warnings {
                    report.summary.warn("tunnel-config", warning);
                }
                report.record(outcome.record);
                if let Some(hint) = outcome.hint {
                    report.hints.push(hint);
                }
            }
            Availability::Planned => report.record(ResourceRecord::new(
                ResourceKind::TunnelConfig,
                config_path,
                render_ingress(None, &config.tunnel_host, &config.upstream()),
            )),
            Availability::Missing(reason) => report.record(ResourceRecord::skipped(
                ResourceKind::TunnelConfig,
                config_path,
                reason.clone(),
            )),
        }
    }
}
