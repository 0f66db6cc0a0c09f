//! Streaming HTTP fetches with URL allow-listing.
//!
//! Every request, including each redirect hop, must be HTTPS to an allowed
//! host. Downloads are streamed to disk while computing SHA-256, and a
//! mismatch against an expected checksum deletes the file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use super::verify::VerifyError;

// ============================================================================
// URL Security Validation
// ============================================================================

/// Allowed domains for release metadata and artifact downloads.
const ALLOWED_DOMAINS: &[&str] = &[
    "github.com",
    "githubusercontent.com",
    "dl.filippo.io",
    "pkg.cloudflare.com",
];

const MAX_REDIRECTS: usize = 10;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Parses `raw` and rejects anything but HTTPS to an allowed host.
///
/// Subdomains of an allowed domain are accepted.
pub fn validate_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("Invalid URL: {}", raw))?;
    anyhow::ensure!(url.scheme() == "https", "Refusing non-HTTPS URL: {}", raw);

    match url.host_str() {
        Some(host) if host_allowed(host) => Ok(url),
        Some(host) => anyhow::bail!(
            "Refusing download from {} (allowed: {})",
            host,
            ALLOWED_DOMAINS.join(", ")
        ),
        None => anyhow::bail!("URL has no host: {}", raw),
    }
}

fn host_allowed(host: &str) -> bool {
    ALLOWED_DOMAINS.iter().any(|domain| {
        host.strip_suffix(domain)
            .is_some_and(|rest| rest.is_empty() || rest.ends_with('.'))
    })
}

// ============================================================================
// Fetcher Seam
// ============================================================================

/// HTTP access used by the acquisition strategies.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches a small text document such as release metadata.
    async fn get_text(&self, url: &str) -> Result<String>;

    /// Streams `url` into `dest` and returns the byte count.
    async fn download(&self, url: &str, dest: &Path, expected_sha256: Option<&str>) -> Result<u64>;
}

/// [`Fetcher`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let redirects = reqwest::redirect::Policy::custom(|attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error(format!("too many redirects ({})", MAX_REDIRECTS))
            } else if let Err(e) = validate_url(attempt.url().as_str()) {
                attempt.error(format!("{:#}", e))
            } else {
                attempt.follow()
            }
        });

        let client = reqwest::Client::builder()
            .user_agent(concat!("hookrelay/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(redirects)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get_text(&self, url: &str) -> Result<String> {
        validate_url(url)?;
        debug!("Fetching {}", url);

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "Request to {} failed with status {}: {}",
                url,
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown error")
            );
        }

        response
            .text()
            .await
            .with_context(|| format!("Failed to read response from {}", url))
    }

    async fn download(&self, url: &str, dest: &Path, expected_sha256: Option<&str>) -> Result<u64> {
        info!("Downloading {} to {}", url, dest.display());
        validate_url(url)?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let response = self
            .client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Failed to start download from {}", url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "Download failed with status {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown error")
            );
        }
        debug!("Content-Length: {:?}", response.content_length());

        let mut file = File::create(dest)
            .await
            .with_context(|| format!("Failed to create file: {}", dest.display()))?;

        let mut stream = response.bytes_stream();
        let mut bytes_downloaded: u64 = 0;
        let mut hasher = Sha256::new();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.context("Failed to read chunk from response stream")?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .context("Failed to write chunk to file")?;
            bytes_downloaded += chunk.len() as u64;
        }

        file.flush().await.context("Failed to flush file")?;
        drop(file);

        if let Some(expected) = expected_sha256 {
            let actual_hex = format_sha256_hex(&hasher.finalize());
            if actual_hex != expected.to_lowercase() {
                let _ = tokio::fs::remove_file(dest).await;
                return Err(VerifyError::ChecksumMismatch {
                    expected: expected.to_lowercase(),
                    actual: actual_hex,
                }
                .into());
            }
            debug!("SHA256 verified: {}", actual_hex);
        }

        info!(
            "Download complete: {} bytes written to {}",
            bytes_downloaded,
            dest.display()
        );
        Ok(bytes_downloaded)
    }
}

/// Formats a SHA256 hash as lowercase hex.
pub fn format_sha256_hex(hash: &[u8]) -> String {
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_hosts_are_allowed() {
        for url in [
            "https://github.com/cloudflare/cloudflared/releases/latest/download/cloudflared-linux-amd64",
            "https://api.github.com/repos/FiloSottile/mkcert/releases/latest",
            "https://objects.githubusercontent.com/github-production-release-asset",
            "https://dl.filippo.io/mkcert/latest?for=linux/amd64",
            "https://pkg.cloudflare.com/cloudflare-main.gpg",
        ] {
            assert!(validate_url(url).is_ok(), "{}", url);
        }
    }

    #[test]
    fn test_lookalike_and_insecure_urls_are_refused() {
        for url in [
            "http://github.com/cloudflared",
            "https://github.com.attacker.example/cloudflared",
            "https://notgithub.com/cloudflared",
            "https://cloudflare.com/other",
            "file:///etc/passwd",
            "not a url",
            "",
        ] {
            assert!(validate_url(url).is_err(), "{}", url);
        }
    }

    #[test]
    fn test_format_sha256_hex() {
        let empty_hash = sha2::Sha256::digest(b"");
        assert_eq!(
            format_sha256_hex(&empty_hash),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_http_fetcher_builds() {
        assert!(HttpFetcher::new().is_ok());
    }
}
