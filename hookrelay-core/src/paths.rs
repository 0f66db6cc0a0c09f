//! Host path layout.
//!
//! Every system location the reconciler reads or writes is resolved through
//! [`HostPaths`], so tests can root the whole layout inside a temp directory.
//!
//! Defaults on Linux:
//!
//! - nginx: `/etc/nginx/sites-available` + `sites-enabled` (Debian layout),
//!   or `/etc/nginx/conf.d` elsewhere
//! - certificates: `/etc/hookrelay/certs/`
//! - tunnel ingress: `/etc/cloudflared/config.yml`
//! - hosts file: `/etc/hosts`
//! - acquired binaries: `/usr/local/bin/`

use std::path::{Path, PathBuf};

use crate::exec::default_search_path;

/// Subdirectory used for the reconciler's own scratch space under the OS temp dir.
const TEMP_DIR_NAME: &str = "hookrelay";

/// How the reverse proxy organizes site definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyLayout {
    /// `sites-available/<host>` plus a symlink in `sites-enabled/`.
    SitesEnabled {
        available: PathBuf,
        enabled: PathBuf,
    },
    /// A single `conf.d/<host>.conf` file.
    ConfD { dir: PathBuf },
}

impl ProxyLayout {
    /// Picks the Debian layout when `sites-available` exists under `root`.
    pub fn detect(nginx_root: &Path) -> Self {
        let available = nginx_root.join("sites-available");
        if available.is_dir() {
            Self::SitesEnabled {
                available,
                enabled: nginx_root.join("sites-enabled"),
            }
        } else {
            Self::ConfD {
                dir: nginx_root.join("conf.d"),
            }
        }
    }

    /// Path of the site file that holds the definition for `host`.
    pub fn site_file(&self, host: &str) -> PathBuf {
        match self {
            Self::SitesEnabled { available, .. } => available.join(host),
            Self::ConfD { dir } => dir.join(format!("{}.conf", host)),
        }
    }

    /// Path of the enabling symlink, if the layout uses one.
    pub fn enabled_link(&self, host: &str) -> Option<PathBuf> {
        match self {
            Self::SitesEnabled { enabled, .. } => Some(enabled.join(host)),
            Self::ConfD { .. } => None,
        }
    }
}

/// All host locations touched by the reconciler.
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub nginx_root: PathBuf,
    pub cert_dir: PathBuf,
    pub tunnel_config: PathBuf,
    pub hosts_file: PathBuf,
    /// Where acquired binaries are finalized.
    pub bin_dir: PathBuf,
    /// Scratch space for downloads and extraction.
    pub temp_dir: PathBuf,
    /// Directories searched for already-installed tools.
    pub search_path: Vec<PathBuf>,
    /// Procfs root for port listing.
    pub proc_root: PathBuf,
    pub os_release: PathBuf,
    /// Package repository definitions (`sources.list.d`, `yum.repos.d`).
    pub apt_sources_dir: PathBuf,
    pub keyring_dir: PathBuf,
    pub yum_repos_dir: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self::system()
    }
}

impl HostPaths {
    /// The real system layout.
    pub fn system() -> Self {
        let hosts_file = if cfg!(windows) {
            PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
        } else {
            PathBuf::from("/etc/hosts")
        };
        Self {
            nginx_root: PathBuf::from("/etc/nginx"),
            cert_dir: PathBuf::from("/etc/hookrelay/certs"),
            tunnel_config: PathBuf::from("/etc/cloudflared/config.yml"),
            hosts_file,
            bin_dir: PathBuf::from("/usr/local/bin"),
            temp_dir: std::env::temp_dir().join(TEMP_DIR_NAME),
            search_path: default_search_path(),
            proc_root: PathBuf::from("/proc"),
            os_release: PathBuf::from("/etc/os-release"),
            apt_sources_dir: PathBuf::from("/etc/apt/sources.list.d"),
            keyring_dir: PathBuf::from("/usr/share/keyrings"),
            yum_repos_dir: PathBuf::from("/etc/yum.repos.d"),
        }
    }

    /// The whole layout rooted under `root`; used by tests.
    pub fn rooted(root: &Path) -> Self {
        let bin_dir = root.join("usr/local/bin");
        Self {
            nginx_root: root.join("etc/nginx"),
            cert_dir: root.join("etc/hookrelay/certs"),
            tunnel_config: root.join("etc/cloudflared/config.yml"),
            hosts_file: root.join("etc/hosts"),
            search_path: vec![bin_dir.clone(), root.join("usr/bin")],
            bin_dir,
            temp_dir: root.join("tmp/hookrelay"),
            proc_root: root.join("proc"),
            os_release: root.join("etc/os-release"),
            apt_sources_dir: root.join("etc/apt/sources.list.d"),
            keyring_dir: root.join("usr/share/keyrings"),
            yum_repos_dir: root.join("etc/yum.repos.d"),
        }
    }

    pub fn proxy_layout(&self) -> ProxyLayout {
        ProxyLayout::detect(&self.nginx_root)
    }

    /// The application's environment file.
    pub fn env_file(install_dir: &Path) -> PathBuf {
        install_dir.join(".env")
    }

    /// Final location of an acquired binary.
    pub fn installed_binary(&self, name: &str) -> PathBuf {
        self.bin_dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_paths() {
        let paths = HostPaths::system();
        assert!(paths.temp_dir.ends_with("hookrelay"));
        assert_eq!(
            paths.installed_binary("cloudflared"),
            PathBuf::from("/usr/local/bin/cloudflared")
        );
    }

    #[test]
    fn test_rooted_paths_stay_under_root() {
        let root = Path::new("/tmp/test-root");
        let paths = HostPaths::rooted(root);
        for p in [
            &paths.nginx_root,
            &paths.cert_dir,
            &paths.tunnel_config,
            &paths.hosts_file,
            &paths.bin_dir,
            &paths.temp_dir,
            &paths.apt_sources_dir,
            &paths.keyring_dir,
            &paths.yum_repos_dir,
        ] {
            assert!(p.starts_with(root), "{} escapes root", p.display());
        }
    }

    #[test]
    fn test_proxy_layout_detection() {
        let dir = tempfile::TempDir::new().unwrap();
        let nginx = dir.path().join("nginx");

        let layout = ProxyLayout::detect(&nginx);
        assert_eq!(
            layout.site_file("a.test"),
            nginx.join("conf.d").join("a.test.conf")
        );
        assert!(layout.enabled_link("a.test").is_none());

        std::fs::create_dir_all(nginx.join("sites-available")).unwrap();
        let layout = ProxyLayout::detect(&nginx);
        assert_eq!(layout.site_file("a.test"), nginx.join("sites-available/a.test"));
        assert_eq!(
            layout.enabled_link("a.test"),
            Some(nginx.join("sites-enabled/a.test"))
        );
    }
}
