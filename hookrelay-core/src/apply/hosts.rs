//! Static hosts-file entries.
//!
//! The hosts file is shared system state, so it is never rewritten: a
//! loopback line is appended only when no active line maps the hostname yet.

use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{debug, warn};

use super::{Outcome, ResourceKind, ResourceRecord};
use crate::exec::HostFs;

/// Marker appended to lines we add.
const MANAGED_MARKER: &str = "# hookrelay";

/// How a hostname currently resolves in the hosts file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostsState {
    /// An active line maps the host to a loopback address.
    Loopback,
    /// An active line maps the host somewhere else; left alone.
    Elsewhere(String),
    Absent,
}

/// Looks for an active (non-comment) mapping of `host`.
pub fn mapping_state(content: &str, host: &str) -> HostsState {
    for line in content.lines() {
        let active = line.split('#').next().unwrap_or_default();
        let mut fields = active.split_whitespace();
        let Some(address) = fields.next() else {
            continue;
        };
        if fields.any(|name| name.eq_ignore_ascii_case(host)) {
            return match address.parse::<IpAddr>() {
                Ok(ip) if ip.is_loopback() => HostsState::Loopback,
                _ => HostsState::Elsewhere(address.to_string()),
            };
        }
    }
    HostsState::Absent
}

/// The line appended for `host`.
pub fn render_line(host: &str) -> String {
    format!("127.0.0.1 {} {}\n", host, MANAGED_MARKER)
}

pub struct HostsApplier {
    fs: HostFs,
    hosts_file: PathBuf,
}

impl HostsApplier {
    pub fn new(fs: HostFs, hosts_file: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            hosts_file: hosts_file.into(),
        }
    }

    async fn state(&self, host: &str) -> Result<(HostsState, String), ResourceRecord> {
        match self.fs.read_to_string(&self.hosts_file).await {
            Ok(content) => {
                let content = content.unwrap_or_default();
                Ok((mapping_state(&content, host), content))
            }
            Err(e) => Err(ResourceRecord::new(ResourceKind::HostsEntry, &self.hosts_file, render_line(host))
                .with_outcome(Outcome::failed(format!("{:#}", e)))),
        }
    }

    /// Read-only check.
    pub async fn inspect(&self, host: &str) -> ResourceRecord {
        let record = ResourceRecord::new(ResourceKind::HostsEntry, &self.hosts_file, render_line(host));
        match self.state(host).await {
            Ok((HostsState::Loopback, _)) => record.with_outcome(Outcome::Unchanged),
            Ok((HostsState::Elsewhere(addr), _)) => {
                record.with_outcome(Outcome::skipped(format!("{} already maps to {}", host, addr)))
            }
            Ok((HostsState::Absent, _)) => record,
            Err(failed) => failed,
        }
    }

    /// Appends the loopback mapping for `host` unless one is active.
    pub async fn apply(&self, host: &str) -> ResourceRecord {
        let line = render_line(host);
        let record = ResourceRecord::new(ResourceKind::HostsEntry, &self.hosts_file, line.clone());

        let content = match self.state(host).await {
            Ok((HostsState::Loopback, _)) => {
                debug!("{} already maps {}", self.hosts_file.display(), host);
                return record.with_outcome(Outcome::Unchanged);
            }
            Ok((HostsState::Elsewhere(addr), _)) => {
                warn!("{} maps {} to {}; not adding a loopback entry", self.hosts_file.display(), host, addr);
                return record.with_outcome(Outcome::skipped(format!("{} already maps to {}", host, addr)));
            }
            Ok((HostsState::Absent, content)) => content,
            Err(failed) => return failed,
        };

        let text = if content.is_empty() || content.ends_with('\n') {
            line
        } else {
            format!("\n{}", line)
        };

        match self.fs.append(&self.hosts_file, &text).await {
            Ok(()) if self.fs.is_dry_run() => record.with_outcome(Outcome::Planned),
            Ok(()) => record.with_outcome(Outcome::Applied),
            Err(e) => record.with_outcome(Outcome::failed(format!("{:#}", e))),
        }
    }
}
