//! Supported system package tools and their command syntax.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::exec::{which_in, CommandSpec};

/// Identifier of a system package tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManagerId {
    Apt,
    Dnf,
    Yum,
    Pacman,
    Zypper,
    Apk,
    Brew,
    Unknown,
}

impl PackageManagerId {
    /// Detection order; the first tool found on the search path wins.
    pub const PRIORITY: &'static [PackageManagerId] = &[
        Self::Apt,
        Self::Dnf,
        Self::Yum,
        Self::Pacman,
        Self::Zypper,
        Self::Apk,
        Self::Brew,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apt => "apt",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
            Self::Pacman => "pacman",
            Self::Zypper => "zypper",
            Self::Apk => "apk",
            Self::Brew => "brew",
            Self::Unknown => "unknown",
        }
    }

    /// Executable probed for during detection.
    pub fn binary(&self) -> Option<&'static str> {
        match self {
            Self::Apt => Some("apt-get"),
            Self::Unknown => None,
            other => Some(other.as_str()),
        }
    }

    /// File extension of the OS-native package format this tool installs.
    pub fn native_package_ext(&self) -> Option<&'static str> {
        match self {
            Self::Apt => Some("deb"),
            Self::Dnf | Self::Yum | Self::Zypper => Some("rpm"),
            _ => None,
        }
    }

    /// Homebrew refuses to run as root; everything else needs it.
    pub fn needs_root(&self) -> bool {
        !matches!(self, Self::Brew)
    }

    // ========================================================================
    // Command Syntax
    // ========================================================================

    pub(crate) fn refresh_command(&self) -> Option<CommandSpec> {
        let spec = match self {
            Self::Apt => CommandSpec::new("apt-get")
                .arg("update")
                .env("DEBIAN_FRONTEND", "noninteractive"),
            Self::Dnf => CommandSpec::new("dnf").args(["makecache", "-y"]),
            Self::Yum => CommandSpec::new("yum").args(["makecache", "-y"]),
            Self::Pacman => CommandSpec::new("pacman").args(["-Sy", "--noconfirm"]),
            Self::Zypper => CommandSpec::new("zypper").args(["--non-interactive", "refresh"]),
            Self::Apk => CommandSpec::new("apk").arg("update"),
            Self::Brew => CommandSpec::new("brew").arg("update"),
            Self::Unknown => return None,
        };
        Some(self.finish(spec))
    }

    pub(crate) fn install_command(&self, packages: &[&str]) -> Option<CommandSpec> {
        let spec = match self {
            Self::Apt => CommandSpec::new("apt-get")
                .args(["install", "-y", "--no-install-recommends"])
                .env("DEBIAN_FRONTEND", "noninteractive"),
            Self::Dnf => CommandSpec::new("dnf").args(["install", "-y"]),
            Self::Yum => CommandSpec::new("yum").args(["install", "-y"]),
            Self::Pacman => CommandSpec::new("pacman").args(["-S", "--noconfirm", "--needed"]),
            Self::Zypper => CommandSpec::new("zypper").args(["--non-interactive", "install"]),
            Self::Apk => CommandSpec::new("apk").args(["add", "--no-progress"]),
            Self::Brew => CommandSpec::new("brew").arg("install"),
            Self::Unknown => return None,
        };
        Some(self.finish(spec.args(packages.iter().copied())))
    }

    /// Read-only query that succeeds when `package` is installed.
    pub(crate) fn query_command(&self, package: &str) -> Option<CommandSpec> {
        let spec = match self {
            Self::Apt => CommandSpec::new("dpkg-query").args(["-W", "-f=${Status}"]),
            Self::Dnf | Self::Yum | Self::Zypper => CommandSpec::new("rpm").arg("-q"),
            Self::Pacman => CommandSpec::new("pacman").arg("-Q"),
            Self::Apk => CommandSpec::new("apk").args(["info", "-e"]),
            Self::Brew => CommandSpec::new("brew").args(["list", "--versions"]),
            Self::Unknown => return None,
        };
        Some(spec.arg(package))
    }

    fn finish(&self, spec: CommandSpec) -> CommandSpec {
        let spec = spec.mutating();
        if self.needs_root() {
            spec.privileged()
        } else {
            spec
        }
    }
}

impl fmt::Display for PackageManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Finds the first supported package tool on the search path.
pub fn detect_id(search_path: &[PathBuf]) -> PackageManagerId {
    PackageManagerId::PRIORITY
        .iter()
        .copied()
        .find(|id| id.binary().is_some_and(|bin| which_in(bin, search_path).is_some()))
        .unwrap_or(PackageManagerId::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn fake_bin(dir: &std::path::Path, name: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_detect_follows_priority() {
        let dir = tempfile::TempDir::new().unwrap();
        let search = vec![dir.path().to_path_buf()];
        assert_eq!(detect_id(&search), PackageManagerId::Unknown);

        fake_bin(dir.path(), "yum");
        assert_eq!(detect_id(&search), PackageManagerId::Yum);

        fake_bin(dir.path(), "dnf");
        assert_eq!(detect_id(&search), PackageManagerId::Dnf);

        fake_bin(dir.path(), "apt-get");
        assert_eq!(detect_id(&search), PackageManagerId::Apt);
    }

    #[test]
    fn test_apt_install_is_noninteractive() {
        let spec = PackageManagerId::Apt
            .install_command(&["nginx", "curl"])
            .unwrap();
        assert_eq!(
            spec.to_string(),
            "apt-get install -y --no-install-recommends nginx curl"
        );
        assert!(spec.privileged && spec.mutating);
        assert!(spec
            .env
            .contains(&("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())));
    }

    #[test]
    fn test_pacman_install_skips_satisfied() {
        let spec = PackageManagerId::Pacman.install_command(&["docker"]).unwrap();
        assert_eq!(spec.to_string(), "pacman -S --noconfirm --needed docker");
    }

    #[test]
    fn test_brew_runs_unprivileged() {
        let spec = PackageManagerId::Brew.refresh_command().unwrap();
        assert!(!spec.privileged);
        assert!(spec.mutating);
    }

    #[test]
    fn test_queries_are_read_only() {
        for id in PackageManagerId::PRIORITY {
            let spec = id.query_command("curl").unwrap();
            assert!(!spec.mutating, "{} query must not mutate", id);
        }
        assert!(PackageManagerId::Unknown.query_command("curl").is_none());
    }

    #[test]
    fn test_native_package_ext() {
        assert_eq!(PackageManagerId::Apt.native_package_ext(), Some("deb"));
        assert_eq!(PackageManagerId::Zypper.native_package_ext(), Some("rpm"));
        assert_eq!(PackageManagerId::Pacman.native_package_ext(), None);
    }
}
