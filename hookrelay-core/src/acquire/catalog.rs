//! Tool catalog with hardcoded definitions.
//!
//! Static definitions for the binaries the acquirer obtains and for the
//! baseline packages installed by name through the package manager.

use super::types::ToolId;
use crate::package::PackageManagerId;
use crate::probe::{Arch, Os};

/// A third-party package repository that carries a tool.
#[derive(Debug, Clone, Copy)]
pub struct VendorRepo {
    /// Signing key, downloaded into the keyring directory.
    pub apt_key_url: &'static str,
    pub apt_keyring_name: &'static str,
    pub apt_list_name: &'static str,
    /// `{keyring}` and `{codename}` are substituted.
    pub apt_source_template: &'static str,
    pub rpm_repo_name: &'static str,
    pub rpm_repo_content: &'static str,
}

impl VendorRepo {
    pub fn apt_source_line(&self, keyring: &str, codename: &str) -> String {
        self.apt_source_template
            .replace("{keyring}", keyring)
            .replace("{codename}", codename)
    }
}

/// Static definition of an acquirable tool.
#[derive(Debug, Clone, Copy)]
pub struct ToolDefinition {
    pub id: ToolId,
    pub display_name: &'static str,
    /// Executable name on disk.
    pub binary: &'static str,
    pub version_args: &'static [&'static str],
    /// Package name per package tool, when the tool is packaged there.
    pub packages: &'static [(PackageManagerId, &'static str)],
    pub vendor_repo: Option<VendorRepo>,
    /// `owner/name` on GitHub.
    pub github_repo: Option<&'static str>,
    /// Versionless "latest" URL per OS; `{arch}` is substituted.
    pub direct_urls: &'static [(Os, &'static str)],
    /// Smallest plausible artifact, in bytes.
    pub min_size: u64,
}

impl ToolDefinition {
    pub fn package_for(&self, manager: PackageManagerId) -> Option<&'static str> {
        self.packages
            .iter()
            .find(|(id, _)| *id == manager)
            .map(|(_, name)| *name)
    }

    pub fn direct_url(&self, os: Os, arch: &Arch) -> Option<String> {
        let arch = arch.download_name()?;
        self.direct_urls
            .iter()
            .find(|(candidate, _)| *candidate == os)
            .map(|(_, template)| template.replace("{arch}", arch))
    }
}

// ============================================================================
// cloudflared
// ============================================================================

const CLOUDFLARE_REPO: VendorRepo = VendorRepo {
    apt_key_url: "https://pkg.cloudflare.com/cloudflare-main.gpg",
    apt_keyring_name: "cloudflare-main.gpg",
    apt_list_name: "cloudflared.list",
    apt_source_template: "deb [signed-by={keyring}] https://pkg.cloudflare.com/cloudflared {codename} main",
    rpm_repo_name: "cloudflared.repo",
    rpm_repo_content: "[cloudflared-stable]\n\
name=cloudflared-stable\n\
baseurl=https://pkg.cloudflare.com/cloudflared/rpm\n\
enabled=1\n\
type=rpm\n\
gpgcheck=1\n\
gpgkey=https://pkg.cloudflare.com/cloudflare-main.gpg\n",
};

const CLOUDFLARED_DEFINITION: ToolDefinition = ToolDefinition {
    id: ToolId::Cloudflared,
    display_name: "cloudflared",
    binary: "cloudflared",
    version_args: &["--version"],
    packages: &[
        (PackageManagerId::Apt, "cloudflared"),
        (PackageManagerId::Dnf, "cloudflared"),
        (PackageManagerId::Yum, "cloudflared"),
        (PackageManagerId::Pacman, "cloudflared"),
        (PackageManagerId::Brew, "cloudflared"),
    ],
    vendor_repo: Some(CLOUDFLARE_REPO),
    github_repo: Some("cloudflare/cloudflared"),
    direct_urls: &[
        (
            Os::Linux,
            "https://github.com/cloudflare/cloudflared/releases/latest/download/cloudflared-linux-{arch}",
        ),
        (
            Os::Macos,
            "https://github.com/cloudflare/cloudflared/releases/latest/download/cloudflared-darwin-{arch}.tgz",
        ),
    ],
    min_size: 5 * 1024 * 1024,
};

// ============================================================================
// mkcert
// ============================================================================

const MKCERT_DEFINITION: ToolDefinition = ToolDefinition {
    id: ToolId::Mkcert,
    display_name: "mkcert",
    binary: "mkcert",
    version_args: &["-version"],
    packages: &[
        (PackageManagerId::Apt, "mkcert"),
        (PackageManagerId::Pacman, "mkcert"),
        (PackageManagerId::Brew, "mkcert"),
    ],
    vendor_repo: None,
    github_repo: Some("FiloSottile/mkcert"),
    direct_urls: &[
        (Os::Linux, "https://dl.filippo.io/mkcert/latest?for=linux/{arch}"),
        (Os::Macos, "https://dl.filippo.io/mkcert/latest?for=darwin/{arch}"),
    ],
    min_size: 1024 * 1024,
};

// ============================================================================
// Baseline Packages
// ============================================================================

/// Why a baseline package is wanted; drives the install policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineRole {
    /// Always installed when missing.
    Essential,
    /// Reverse proxy; needs the proxy install flag.
    ProxyEngine,
    /// Container runtime; needs the container flag and a server host.
    ContainerEngine,
}

/// A package installed by name through the package manager.
#[derive(Debug, Clone, Copy)]
pub struct BaselinePackage {
    pub name: &'static str,
    pub role: BaselineRole,
    /// Executable whose presence means the package is satisfied.
    pub binary: Option<&'static str>,
    pub packages: &'static [(PackageManagerId, &'static str)],
}

impl BaselinePackage {
    pub fn package_for(&self, manager: PackageManagerId) -> Option<&'static str> {
        self.packages
            .iter()
            .find(|(id, _)| *id == manager)
            .map(|(_, name)| *name)
    }
}

pub const BASELINE: &[BaselinePackage] = &[
    BaselinePackage {
        name: "curl",
        role: BaselineRole::Essential,
        binary: Some("curl"),
        packages: &[
            (PackageManagerId::Apt, "curl"),
            (PackageManagerId::Dnf, "curl"),
            (PackageManagerId::Yum, "curl"),
            (PackageManagerId::Pacman, "curl"),
            (PackageManagerId::Zypper, "curl"),
            (PackageManagerId::Apk, "curl"),
            (PackageManagerId::Brew, "curl"),
        ],
    },
    BaselinePackage {
        name: "ca-certificates",
        role: BaselineRole::Essential,
        binary: None,
        packages: &[
            (PackageManagerId::Apt, "ca-certificates"),
            (PackageManagerId::Dnf, "ca-certificates"),
            (PackageManagerId::Yum, "ca-certificates"),
            (PackageManagerId::Pacman, "ca-certificates"),
            (PackageManagerId::Zypper, "ca-certificates"),
            (PackageManagerId::Apk, "ca-certificates"),
        ],
    },
    BaselinePackage {
        name: "nginx",
        role: BaselineRole::ProxyEngine,
        binary: Some("nginx"),
        packages: &[
            (PackageManagerId::Apt, "nginx"),
            (PackageManagerId::Dnf, "nginx"),
            (PackageManagerId::Yum, "nginx"),
            (PackageManagerId::Pacman, "nginx"),
            (PackageManagerId::Zypper, "nginx"),
            (PackageManagerId::Apk, "nginx"),
            (PackageManagerId::Brew, "nginx"),
        ],
    },
    BaselinePackage {
        name: "docker",
        role: BaselineRole::ContainerEngine,
        binary: Some("docker"),
        packages: &[
            (PackageManagerId::Apt, "docker.io"),
            (PackageManagerId::Dnf, "moby-engine"),
            (PackageManagerId::Yum, "docker"),
            (PackageManagerId::Pacman, "docker"),
            (PackageManagerId::Zypper, "docker"),
            (PackageManagerId::Apk, "docker"),
        ],
    },
    BaselinePackage {
        name: "docker-compose",
        role: BaselineRole::ContainerEngine,
        binary: None,
        packages: &[
            (PackageManagerId::Apt, "docker-compose"),
            (PackageManagerId::Dnf, "docker-compose"),
            (PackageManagerId::Pacman, "docker-compose"),
            (PackageManagerId::Zypper, "docker-compose"),
            (PackageManagerId::Apk, "docker-cli-compose"),
        ],
    },
];

// ============================================================================
// Catalog Access
// ============================================================================

/// Returns the definition for a specific tool.
pub fn get_tool_definition(id: ToolId) -> &'static ToolDefinition {
    match id {
        ToolId::Cloudflared => &CLOUDFLARED_DEFINITION,
        ToolId::Mkcert => &MKCERT_DEFINITION,
    }
}

/// Baseline packages with the given role.
pub fn baseline(role: BaselineRole) -> impl Iterator<Item = &'static BaselinePackage> {
    BASELINE.iter().filter(move |p| p.role == role)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definitions_match_ids() {
        for id in ToolId::all() {
            let def = get_tool_definition(*id);
            assert_eq!(def.id, *id);
            assert_eq!(def.binary, id.as_str());
            assert!(def.min_size > 0);
        }
    }

    #[test]
    fn test_cloudflared_direct_url() {
        let def = get_tool_definition(ToolId::Cloudflared);
        assert_eq!(
            def.direct_url(Os::Linux, &Arch::Aarch64).unwrap(),
            "https://github.com/cloudflare/cloudflared/releases/latest/download/cloudflared-linux-arm64"
        );
        assert!(def
            .direct_url(Os::Macos, &Arch::X86_64)
            .unwrap()
            .ends_with("cloudflared-darwin-amd64.tgz"));
        assert!(def.direct_url(Os::Linux, &Arch::Other("s390x".into())).is_none());
        assert!(def.direct_url(Os::Other, &Arch::X86_64).is_none());
    }

    #[test]
    fn test_mkcert_direct_url() {
        let def = get_tool_definition(ToolId::Mkcert);
        assert_eq!(
            def.direct_url(Os::Linux, &Arch::X86_64).unwrap(),
            "https://dl.filippo.io/mkcert/latest?for=linux/amd64"
        );
    }

    #[test]
    fn test_package_lookup() {
        let def = get_tool_definition(ToolId::Cloudflared);
        assert_eq!(def.package_for(PackageManagerId::Apt), Some("cloudflared"));
        assert_eq!(def.package_for(PackageManagerId::Apk), None);

        let docker = baseline(BaselineRole::ContainerEngine).next().unwrap();
        assert_eq!(docker.package_for(PackageManagerId::Apt), Some("docker.io"));
        assert_eq!(docker.package_for(PackageManagerId::Brew), None);
    }

    #[test]
    fn test_vendor_apt_line() {
        let repo = get_tool_definition(ToolId::Cloudflared).vendor_repo.unwrap();
        assert_eq!(
            repo.apt_source_line("/usr/share/keyrings/cloudflare-main.gpg", "bookworm"),
            "deb [signed-by=/usr/share/keyrings/cloudflare-main.gpg] https://pkg.cloudflare.com/cloudflared bookworm main"
        );
    }
}
