//! Published release metadata and asset selection.

use serde::Deserialize;

use super::types::ArtifactKind;
use crate::package::PackageManagerId;
use crate::probe::{Arch, Os};

/// Tokens that mark an asset as something other than an installable build.
const SKIP_TOKENS: &[&str] = &[
    "sha256", "sha256sum", "sha256sums", "checksums", "sig", "asc", "pem", "sbom", "txt", "json",
    "windows", "exe", "msi", "dmg", "pkg", "apk", "fips",
];

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
    /// `sha256:<hex>` as published alongside newer releases.
    #[serde(default)]
    pub digest: Option<String>,
}

impl ReleaseAsset {
    /// The asset's published SHA-256, if any.
    pub fn sha256(&self) -> Option<&str> {
        self.digest
            .as_deref()?
            .strip_prefix("sha256:")
            .filter(|hex| is_sha256_hex(hex))
    }
}

/// Latest-release endpoint for a GitHub `owner/name`.
pub fn latest_release_url(repo: &str) -> String {
    format!("https://api.github.com/repos/{}/releases/latest", repo)
}

pub fn parse_release(body: &str) -> serde_json::Result<Release> {
    serde_json::from_str(body)
}

/// Picks the best asset for the host, or `None` if nothing matches.
///
/// Ranking: a native package for the host's package tool, then an archive,
/// then a bare executable. Ties keep the order of the release listing.
pub fn select_asset<'a>(
    assets: &'a [ReleaseAsset],
    os: Os,
    arch: &Arch,
    manager: PackageManagerId,
) -> Option<&'a ReleaseAsset> {
    let mut best: Option<(u8, &ReleaseAsset)> = None;

    for asset in assets {
        let Some(rank) = rank_asset(&asset.name, os, arch, manager) else {
            continue;
        };
        if best.map_or(true, |(r, _)| rank > r) {
            best = Some((rank, asset));
        }
    }

    best.map(|(_, asset)| asset)
}

fn rank_asset(name: &str, os: Os, arch: &Arch, manager: PackageManagerId) -> Option<u8> {
    let tokens = tokenize(name);
    let has = |candidates: &[&str]| candidates.iter().any(|c| tokens.iter().any(|t| t == c));

    if has(SKIP_TOKENS) || !has(os.release_names()) || !has(arch.aliases()) {
        return None;
    }

    let kind = ArtifactKind::from_name(name);
    match kind {
        ArtifactKind::Deb | ArtifactKind::Rpm => {
            (kind.package_ext() == manager.native_package_ext()).then_some(3)
        }
        ArtifactKind::TarGz | ArtifactKind::TarXz | ArtifactKind::Zip => Some(2),
        ArtifactKind::Binary => Some(1),
    }
}

/// A checksum file covering `name`: a `<name>.sha256` sidecar first, then a
/// release-wide listing.
pub fn checksum_asset<'a>(assets: &'a [ReleaseAsset], name: &str) -> Option<&'a ReleaseAsset> {
    let sidecars = [format!("{}.sha256", name), format!("{}.sha256sum", name)];
    assets
        .iter()
        .find(|a| sidecars.contains(&a.name))
        .or_else(|| {
            assets.iter().find(|a| {
                let lower = a.name.to_lowercase();
                lower.contains("checksums") || lower.contains("sha256sums")
            })
        })
}

/// Extracts the digest for `name` from a sidecar (`<hex>` or
/// `<hex>  <name>`) or a `sha256sum`-style listing.
pub fn parse_checksum(body: &str, name: &str) -> Option<String> {
    for line in body.lines() {
        let mut fields = line.split_whitespace();
        let Some(hex) = fields.next().filter(|h| is_sha256_hex(h)) else {
            continue;
        };
        match fields.next() {
            None => return Some(hex.to_lowercase()),
            Some(file) if file.trim_start_matches('*') == name => return Some(hex.to_lowercase()),
            Some(_) => {}
        }
    }
    None
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Splits a name on `-`, `_` and `.`, also keeping `a_b` pairs so that
/// `x86_64` survives as a token.
fn tokenize(name: &str) -> Vec<String> {
    let lower = name.to_lowercase();
    let parts: Vec<&str> = lower
        .split(['-', '_', '.'])
        .filter(|p| !p.is_empty())
        .collect();

    let mut tokens: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
    tokens.extend(parts.windows(2).map(|w| format!("{}_{}", w[0], w[1])));
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(name: &str) -> ReleaseAsset {
        ReleaseAsset {
            name: name.to_string(),
            browser_download_url: format!("https://github.com/o/r/releases/download/v1/{}", name),
            size: 10_000_000,
            digest: None,
        }
    }

    fn cloudflared_assets() -> Vec<ReleaseAsset> {
        [
            "cloudflared-amd64.pkg",
            "cloudflared-darwin-amd64.tgz",
            "cloudflared-fips-linux-amd64",
            "cloudflared-linux-386",
            "cloudflared-linux-amd64",
            "cloudflared-linux-amd64.deb",
            "cloudflared-linux-arm",
            "cloudflared-linux-arm64",
            "cloudflared-linux-arm64.deb",
            "cloudflared-linux-armhf.deb",
            "cloudflared-linux-x86_64.rpm",
            "cloudflared-linux-aarch64.rpm",
            "cloudflared-windows-amd64.exe",
            "cloudflared-windows-amd64.msi",
        ]
        .iter()
        .map(|n| asset(n))
        .collect()
    }

    fn pick(os: Os, arch: Arch, pm: PackageManagerId) -> Option<String> {
        let assets = cloudflared_assets();
        select_asset(&assets, os, &arch, pm).map(|a| a.name.clone())
    }

    #[test]
    fn test_prefers_native_package() {
        assert_eq!(
            pick(Os::Linux, Arch::X86_64, PackageManagerId::Apt).as_deref(),
            Some("cloudflared-linux-amd64.deb")
        );
        assert_eq!(
            pick(Os::Linux, Arch::X86_64, PackageManagerId::Dnf).as_deref(),
            Some("cloudflared-linux-x86_64.rpm")
        );
        assert_eq!(
            pick(Os::Linux, Arch::Aarch64, PackageManagerId::Zypper).as_deref(),
            Some("cloudflared-linux-aarch64.rpm")
        );
    }

    #[test]
    fn test_falls_back_to_bare_binary() {
        assert_eq!(
            pick(Os::Linux, Arch::X86_64, PackageManagerId::Pacman).as_deref(),
            Some("cloudflared-linux-amd64")
        );
        assert_eq!(
            pick(Os::Linux, Arch::Armv7, PackageManagerId::Unknown).as_deref(),
            Some("cloudflared-linux-arm")
        );
    }

    #[test]
    fn test_archive_beats_binary() {
        let assets = vec![asset("tool-linux-amd64"), asset("tool-linux-amd64.tar.gz")];
        let chosen = select_asset(&assets, Os::Linux, &Arch::X86_64, PackageManagerId::Apk).unwrap();
        assert_eq!(chosen.name, "tool-linux-amd64.tar.gz");
    }

    #[test]
    fn test_macos_uses_archive() {
        assert_eq!(
            pick(Os::Macos, Arch::X86_64, PackageManagerId::Brew).as_deref(),
            Some("cloudflared-darwin-amd64.tgz")
        );
    }

    #[test]
    fn test_no_match() {
        assert!(pick(Os::Linux, Arch::Other("riscv64".into()), PackageManagerId::Apt).is_none());
        assert!(pick(Os::Other, Arch::X86_64, PackageManagerId::Apt).is_none());
        assert!(select_asset(&[], Os::Linux, &Arch::X86_64, PackageManagerId::Apt).is_none());
    }

    #[test]
    fn test_checksums_are_skipped() {
        let assets = vec![
            asset("mkcert-v1.4.4-linux-amd64.sha256"),
            asset("mkcert-v1.4.4-linux-amd64"),
        ];
        let chosen = select_asset(&assets, Os::Linux, &Arch::X86_64, PackageManagerId::Apt).unwrap();
        assert_eq!(chosen.name, "mkcert-v1.4.4-linux-amd64");
    }

    #[test]
    fn test_parse_release_json() {
        let body = r#"{
            "tag_name": "2024.6.1",
            "assets": [
                {"name": "cloudflared-linux-amd64", "browser_download_url": "https://github.com/x", "size": 38000000}
            ]
        }"#;
        let release = parse_release(body).unwrap();
        assert_eq!(release.tag_name, "2024.6.1");
        assert_eq!(release.assets[0].size, 38_000_000);
    }

    #[test]
    fn test_latest_release_url() {
        assert_eq!(
            latest_release_url("FiloSottile/mkcert"),
            "https://api.github.com/repos/FiloSottile/mkcert/releases/latest"
        );
    }

    const DIGEST: &str = "2b4c4a4c8bb7ae3c5c4f7f4e4b8f1e2a9d0c3b6a5f4e3d2c1b0a99887766554f";

    #[test]
    fn test_asset_digest() {
        let body = format!(
            r#"{{"tag_name": "v1", "assets": [{{"name": "a", "browser_download_url": "https://github.com/a", "digest": "sha256:{}"}}]}}"#,
            DIGEST
        );
        let release = parse_release(&body).unwrap();
        assert_eq!(release.assets[0].sha256(), Some(DIGEST));

        let mut other = asset("b");
        other.digest = Some("md5:abc".into());
        assert_eq!(other.sha256(), None);
        assert_eq!(asset("c").sha256(), None);
    }

    #[test]
    fn test_checksum_asset_prefers_sidecar() {
        let assets = vec![
            asset("checksums.txt"),
            asset("tool-linux-amd64"),
            asset("tool-linux-amd64.sha256"),
        ];
        assert_eq!(
            checksum_asset(&assets, "tool-linux-amd64").map(|a| a.name.as_str()),
            Some("tool-linux-amd64.sha256")
        );
        assert_eq!(
            checksum_asset(&assets, "tool-linux-arm64").map(|a| a.name.as_str()),
            Some("checksums.txt")
        );
        assert!(checksum_asset(&[asset("tool-linux-amd64")], "tool-linux-amd64").is_none());
    }

    #[test]
    fn test_parse_checksum_formats() {
        assert_eq!(parse_checksum(&format!("{}\n", DIGEST), "x").as_deref(), Some(DIGEST));

        let listing = format!(
            "{}  tool-linux-arm64\n{} *tool-linux-amd64\n",
            "0".repeat(64),
            DIGEST.to_uppercase()
        );
        assert_eq!(parse_checksum(&listing, "tool-linux-amd64").as_deref(), Some(DIGEST));
        assert_eq!(parse_checksum(&listing, "tool-darwin-amd64"), None);
        assert_eq!(parse_checksum("not a digest\n", "x"), None);
    }
}
