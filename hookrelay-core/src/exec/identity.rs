//! Who we are running as, and how privileged operations are performed.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use super::{which, CommandRunner, CommandSpec};

/// How privileged operations are carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Elevation {
    /// Already root; run everything directly.
    Direct,
    /// Prefix privileged commands with `sudo`.
    Sudo,
}

/// Conditions that abort a run before anything is mutated.
#[derive(Debug, Error)]
pub enum FatalPrecondition {
    #[error("not running as root and no sudo binary was found; cannot perform privileged operations")]
    NoElevation,
}

/// The process identity relevant to provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub elevation: Elevation,
    /// The human user behind the run (`SUDO_USER` when root via sudo).
    pub invoking_user: Option<String>,
    /// Home directory of the invoking user.
    pub invoking_home: Option<PathBuf>,
}

impl Identity {
    /// Determines the elevation path and the invoking user.
    pub async fn detect(runner: &dyn CommandRunner) -> Result<Self, FatalPrecondition> {
        let euid = runner
            .output(&CommandSpec::new("id").arg("-u"))
            .await
            .ok()
            .filter(|out| out.success())
            .and_then(|out| out.stdout.trim().parse::<u32>().ok());
        debug!(?euid, "Detected effective uid");

        let sudo_user = std::env::var("SUDO_USER").ok();
        let current_user = std::env::var("USER").ok();
        let sudo_available = which("sudo").is_some();

        let identity = Self::from_parts(euid, sudo_user, current_user, sudo_available)?;
        Ok(Self {
            invoking_home: identity
                .invoking_user
                .as_deref()
                .and_then(|user| home_for(user, Path::new("/etc/passwd"))),
            ..identity
        })
    }

    /// Pure decision logic behind [`Identity::detect`].
    pub fn from_parts(
        euid: Option<u32>,
        sudo_user: Option<String>,
        current_user: Option<String>,
        sudo_available: bool,
    ) -> Result<Self, FatalPrecondition> {
        if euid == Some(0) {
            let invoking_user = sudo_user
                .filter(|u| !u.is_empty() && u != "root")
                .or_else(|| Some("root".to_string()));
            return Ok(Self {
                elevation: Elevation::Direct,
                invoking_user,
                invoking_home: None,
            });
        }

        if sudo_available {
            return Ok(Self {
                elevation: Elevation::Sudo,
                invoking_user: current_user,
                invoking_home: None,
            });
        }

        Err(FatalPrecondition::NoElevation)
    }

    /// Identity for tests and dry planning: root, no separate user.
    pub fn root() -> Self {
        Self {
            elevation: Elevation::Direct,
            invoking_user: Some("root".to_string()),
            invoking_home: None,
        }
    }

    /// User to run user-scoped tools as, if different from root.
    pub fn unprivileged_user(&self) -> Option<&str> {
        self.invoking_user.as_deref().filter(|u| *u != "root")
    }
}

/// Looks up a user's home directory in a passwd-format file.
pub fn home_for(user: &str, passwd: &Path) -> Option<PathBuf> {
    let content = std::fs::read_to_string(passwd).ok()?;
    content.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        (fields.len() >= 6 && fields[0] == user).then(|| PathBuf::from(fields[5]))
    })
}
