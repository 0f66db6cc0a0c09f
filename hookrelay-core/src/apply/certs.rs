//! Locally trusted certificates via mkcert.
//!
//! The trust anchor belongs to the invoking user, so `mkcert -install` and
//! the CA root lookup run as that user. Only the generation step runs with
//! elevated privileges, pointed at the user's CA root, writing straight into
//! the root-owned certificate directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::{Outcome, ResourceKind, ResourceRecord};
use crate::exec::{CommandRunner, CommandSpec, HostFs, Identity};

pub struct CertificateApplier {
    runner: Arc<dyn CommandRunner>,
    fs: HostFs,
    identity: Identity,
    cert_dir: PathBuf,
}

fn describe(cert: &Path, key: &Path) -> String {
    format!("certificate: {}\nkey: {}\n", cert.display(), key.display())
}

impl CertificateApplier {
    pub fn new(runner: Arc<dyn CommandRunner>, fs: HostFs, identity: Identity, cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            fs,
            identity,
            cert_dir: cert_dir.into(),
        }
    }

    /// Certificate and key paths for `host`.
    pub fn pair(&self, host: &str) -> (PathBuf, PathBuf) {
        (
            self.cert_dir.join(format!("{}.pem", host)),
            self.cert_dir.join(format!("{}-key.pem", host)),
        )
    }

    pub fn pair_exists(&self, host: &str) -> bool {
        let (cert, key) = self.pair(host);
        cert.is_file() && key.is_file()
    }

    /// Read-only check: both files present.
    pub async fn inspect(&self, host: &str) -> ResourceRecord {
        let (cert, key) = self.pair(host);
        let outcome = if self.pair_exists(host) {
            Outcome::Unchanged
        } else {
            Outcome::Planned
        };
        ResourceRecord::new(ResourceKind::Certificate, &cert, describe(&cert, &key)).with_outcome(outcome)
    }

    /// Installs the trust anchor and generates the pair unless it exists.
    pub async fn apply(&self, mkcert: &Path, host: &str) -> ResourceRecord {
        let (cert, key) = self.pair(host);
        let record = ResourceRecord::new(ResourceKind::Certificate, &cert, describe(&cert, &key));

        if self.pair_exists(host) {
            debug!("Certificate for {} already exists", host);
            return record.with_outcome(Outcome::Unchanged);
        }

        match self.generate(mkcert, host, &cert, &key).await {
            Ok(()) if self.fs.is_dry_run() => record.with_outcome(Outcome::Planned),
            Ok(()) => {
                info!("Generated certificate for {} in {}", host, self.cert_dir.display());
                record.with_outcome(Outcome::Applied)
            }
            Err(e) => record.with_outcome(Outcome::failed(format!("{:#}", e))),
        }
    }

    async fn generate(&self, mkcert: &Path, host: &str, cert: &Path, key: &Path) -> anyhow::Result<()> {
        let program = mkcert.to_string_lossy().into_owned();
        let user = self.identity.unprivileged_user();

        self.runner
            .run(&CommandSpec::new(&program).arg("-install").run_as(user).mutating())
            .await?;

        let caroot = self
            .runner
            .run(&CommandSpec::new(&program).arg("-CAROOT").run_as(user))
            .await?
            .stdout
            .trim()
            .to_string();

        self.fs.create_dir_all(&self.cert_dir).await?;

        let mut generate = CommandSpec::new(&program)
            .arg("-cert-file")
            .arg(cert.to_string_lossy())
            .arg("-key-file")
            .arg(key.to_string_lossy())
            .arg(host)
            .privileged()
            .mutating();
        if !caroot.is_empty() {
            generate = generate.env("CAROOT", caroot);
        }
        self.runner.run(&generate).await?;

        self.fs.chmod(key, 0o600).await?;
        self.fs.chmod(cert, 0o644).await?;
        Ok(())
    }
}
