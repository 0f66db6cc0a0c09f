//! Environment probing.
//!
//! Produces a fresh [`HostFacts`] on every invocation. Probing never fails:
//! anything that cannot be determined degrades to a conservative default.

mod address;
mod ports;

pub use address::{is_local_address, parse_address, AddressLookup, HttpAddressLookup};
pub use ports::{listening_ports, parse_tcp_table};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::acquire::locator::query_version;
use crate::exec::{which_in, CommandRunner, CommandSpec};
use crate::package::{self, PackageManagerId};
use crate::paths::HostPaths;

/// Tools whose versions are recorded in [`HostFacts`], with their version flags.
pub const PROBED_TOOLS: &[(&str, &[&str])] = &[
    ("nginx", &["-v"]),
    ("docker", &["--version"]),
    ("cloudflared", &["--version"]),
    ("mkcert", &["-version"]),
    ("curl", &["--version"]),
];

// ============================================================================
// Host Classification
// ============================================================================

/// CPU architecture of the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X86_64,
    Aarch64,
    Armv7,
    Other(String),
}

impl Arch {
    /// Parses `uname -m` output.
    pub fn from_machine(machine: &str) -> Self {
        match machine.trim() {
            "x86_64" | "amd64" => Self::X86_64,
            "aarch64" | "arm64" => Self::Aarch64,
            "armv7l" | "armv7" | "armhf" | "armv6l" => Self::Armv7,
            other => Self::Other(other.to_string()),
        }
    }

    /// Architecture this binary was built for.
    pub fn current() -> Self {
        Self::from_machine(std::env::consts::ARCH)
    }

    /// Name fragments used by release assets for this architecture.
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Self::X86_64 => &["amd64", "x86_64", "x64"],
            Self::Aarch64 => &["arm64", "aarch64"],
            Self::Armv7 => &["arm", "armhf", "armv7"],
            Self::Other(_) => &[],
        }
    }

    /// Canonical name used in versionless download URLs.
    pub fn download_name(&self) -> Option<&'static str> {
        match self {
            Self::X86_64 => Some("amd64"),
            Self::Aarch64 => Some("arm64"),
            Self::Armv7 => Some("arm"),
            Self::Other(_) => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86_64 => write!(f, "x86_64"),
            Self::Aarch64 => write!(f, "aarch64"),
            Self::Armv7 => write!(f, "armv7"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Linux,
    Macos,
    Other,
}

impl Os {
    pub fn from_kernel_name(name: &str) -> Self {
        match name.trim() {
            "Linux" => Self::Linux,
            "Darwin" => Self::Macos,
            _ => Self::Other,
        }
    }

    /// Name used by release assets.
    pub fn release_names(&self) -> &'static [&'static str] {
        match self {
            Self::Linux => &["linux"],
            Self::Macos => &["darwin", "macos"],
            Self::Other => &[],
        }
    }
}

/// What kind of host we are provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentClass {
    /// A restricted Linux subsystem hosted by another OS (WSL).
    SandboxedSubsystem,
    /// A desktop OS (macOS).
    Desktop,
    /// A Linux server without a public address.
    LocalServer,
    /// A Linux server reachable on a public address.
    PublicServer,
}

impl EnvironmentClass {
    pub fn is_public(&self) -> bool {
        matches!(self, Self::PublicServer)
    }

    /// Only plain Linux servers get the container engine installed for them;
    /// subsystems and desktops use their host's container runtime.
    pub fn allows_container_engine_install(&self) -> bool {
        matches!(self, Self::LocalServer | Self::PublicServer)
    }

    /// Local hostnames need a hosts-file entry; public hosts rely on DNS.
    pub fn wants_hosts_entry(&self) -> bool {
        !self.is_public()
    }
}

impl fmt::Display for EnvironmentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SandboxedSubsystem => "sandboxed-subsystem",
            Self::Desktop => "desktop",
            Self::LocalServer => "local-server",
            Self::PublicServer => "public-server",
        };
        write!(f, "{}", s)
    }
}

/// Kernel identification strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    /// `uname -s`, e.g. `Linux` or `Darwin`.
    pub name: String,
    /// `uname -r` and `/proc/version` content.
    pub version: String,
}

impl KernelInfo {
    /// Vendor marker left in the kernel version by the Windows subsystem.
    pub fn is_sandboxed_subsystem(&self) -> bool {
        let version = self.version.to_lowercase();
        self.name == "Linux" && (version.contains("microsoft") || version.contains("wsl"))
    }

    pub fn is_desktop(&self) -> bool {
        Os::from_kernel_name(&self.name) == Os::Macos
    }
}

/// Classifies a host given its kernel and (lazily) its public address.
///
/// The address lookup only runs when the kernel does not already decide the
/// class.
pub async fn classify(kernel: &KernelInfo, lookup: &dyn AddressLookup) -> (EnvironmentClass, Option<IpAddr>) {
    if kernel.is_sandboxed_subsystem() {
        return (EnvironmentClass::SandboxedSubsystem, None);
    }
    if kernel.is_desktop() {
        return (EnvironmentClass::Desktop, None);
    }

    let address = lookup.public_address().await;
    (classify_address(address), address)
}

/// Classifies a Linux server by its looked-up address.
pub fn classify_address(address: Option<IpAddr>) -> EnvironmentClass {
    match address {
        Some(ip) if !is_local_address(&ip) => EnvironmentClass::PublicServer,
        _ => EnvironmentClass::LocalServer,
    }
}

// ============================================================================
// Host Facts
// ============================================================================

/// Everything later stages need to know about the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFacts {
    pub arch: Arch,
    pub os: Os,
    pub class: EnvironmentClass,
    pub kernel: KernelInfo,
    pub public_address: Option<IpAddr>,
    pub package_manager: PackageManagerId,
    /// `ID` and `VERSION_CODENAME` from os-release, when present.
    pub distro_id: Option<String>,
    pub distro_codename: Option<String>,
    /// Tool name -> first line of its version output.
    pub tools: BTreeMap<String, String>,
    pub listening_ports: BTreeSet<u16>,
    pub running_containers: Vec<String>,
}

impl HostFacts {
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.listening_ports.contains(&port)
    }

    /// Minimal facts for tests.
    pub fn synthetic(class: EnvironmentClass, package_manager: PackageManagerId) -> Self {
        Self {
            arch: Arch::X86_64,
            os: Os::Linux,
            class,
            kernel: KernelInfo {
                name: "Linux".to_string(),
                version: "6.1.0".to_string(),
            },
            public_address: None,
            package_manager,
            distro_id: Some("debian".to_string()),
            distro_codename: Some("bookworm".to_string()),
            tools: BTreeMap::new(),
            listening_ports: BTreeSet::new(),
            running_containers: Vec::new(),
        }
    }
}

// ============================================================================
// Prober
// ============================================================================

/// Gathers [`HostFacts`] from the live host.
pub struct Prober {
    runner: Arc<dyn CommandRunner>,
    lookup: Arc<dyn AddressLookup>,
    paths: HostPaths,
}

impl Prober {
    pub fn new(runner: Arc<dyn CommandRunner>, lookup: Arc<dyn AddressLookup>, paths: HostPaths) -> Self {
        Self {
            runner,
            lookup,
            paths,
        }
    }

    /// Probes the host.
    pub async fn probe(&self) -> HostFacts {
        let kernel = self.kernel_info().await;
        self.probe_with_kernel(kernel).await
    }

    /// Probes the host using already-known kernel strings.
    pub async fn probe_with_kernel(&self, kernel: KernelInfo) -> HostFacts {
        let (class, public_address) = classify(&kernel, self.lookup.as_ref()).await;
        let arch = self.arch().await;
        let os = Os::from_kernel_name(&kernel.name);
        let package_manager = package::detect_id(&self.paths.search_path);
        let (distro_id, distro_codename) = self.os_release().await;
        let tools = self.tool_versions().await;
        let listening_ports = listening_ports(&self.paths.proc_root);
        let running_containers = if tools.contains_key("docker") {
            self.running_containers().await
        } else {
            Vec::new()
        };

        info!(
            %class,
            %arch,
            package_manager = %package_manager,
            tools = tools.len(),
            "Host probed"
        );

        HostFacts {
            arch,
            os,
            class,
            kernel,
            public_address,
            package_manager,
            distro_id,
            distro_codename,
            tools,
            listening_ports,
            running_containers,
        }
    }

    async fn kernel_info(&self) -> KernelInfo {
        let name = self
            .stdout(CommandSpec::new("uname").arg("-s"))
            .await
            .unwrap_or_else(|| match std::env::consts::OS {
                "linux" => "Linux".to_string(),
                "macos" => "Darwin".to_string(),
                other => other.to_string(),
            });

        let mut version = self
            .stdout(CommandSpec::new("uname").arg("-r"))
            .await
            .unwrap_or_default();
        if let Ok(proc_version) = tokio::fs::read_to_string(self.paths.proc_root.join("version")).await {
            version.push(' ');
            version.push_str(proc_version.trim());
        }

        debug!(name = %name, version = %version, "Kernel info");
        KernelInfo { name, version }
    }

    async fn arch(&self) -> Arch {
        match self.stdout(CommandSpec::new("uname").arg("-m")).await {
            Some(machine) => Arch::from_machine(&machine),
            None => Arch::current(),
        }
    }

    async fn os_release(&self) -> (Option<String>, Option<String>) {
        match tokio::fs::read_to_string(&self.paths.os_release).await {
            Ok(content) => parse_os_release(&content),
            Err(_) => (None, None),
        }
    }

    async fn tool_versions(&self) -> BTreeMap<String, String> {
        let mut tools = BTreeMap::new();
        for (name, args) in PROBED_TOOLS {
            if let Some(path) = which_in(name, &self.paths.search_path) {
                if let Some(version) = query_version(self.runner.as_ref(), &path, args).await {
                    tools.insert(name.to_string(), version);
                }
            }
        }
        tools
    }

    async fn running_containers(&self) -> Vec<String> {
        self.stdout(
            CommandSpec::new("docker")
                .args(["ps", "--format", "{{.Names}}"])
                .privileged(),
        )
        .await
        .map(|out| {
            out.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
    }

    async fn stdout(&self, spec: CommandSpec) -> Option<String> {
        match self.runner.output(&spec).await {
            Ok(out) if out.success() => {
                let s = out.stdout.trim().to_string();
                (!s.is_empty()).then_some(s)
            }
            Ok(_) | Err(_) => None,
        }
    }
}

/// Extracts `ID` and `VERSION_CODENAME` from os-release content.
pub fn parse_os_release(content: &str) -> (Option<String>, Option<String>) {
    let mut id = None;
    let mut codename = None;
    for line in content.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').to_string();
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "ID" => id = Some(value),
                "VERSION_CODENAME" => codename = Some(value),
                "UBUNTU_CODENAME" if codename.is_none() => codename = Some(value),
                _ => {}
            }
        }
    }
    (id, codename)
}
