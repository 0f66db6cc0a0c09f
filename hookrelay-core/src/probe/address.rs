//! Public address lookup and private-range classification.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tracing::debug;

/// Endpoints that answer with the caller's address as plain text.
const LOOKUP_URLS: &[&str] = &["https://api.ipify.org", "https://ifconfig.me/ip"];

/// Lookups must stay short; a slow answer degrades to "no address".
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Discovers the host's public-facing address.
#[async_trait]
pub trait AddressLookup: Send + Sync {
    /// Returns `None` on any failure; lookups never raise.
    async fn public_address(&self) -> Option<IpAddr>;
}

/// Lookup against public "what is my IP" endpoints.
#[derive(Debug, Clone)]
pub struct HttpAddressLookup {
    urls: Vec<String>,
    timeout: Duration,
}

impl Default for HttpAddressLookup {
    fn default() -> Self {
        Self {
            urls: LOOKUP_URLS.iter().map(|s| s.to_string()).collect(),
            timeout: LOOKUP_TIMEOUT,
        }
    }
}

#[async_trait]
impl AddressLookup for HttpAddressLookup {
    async fn public_address(&self) -> Option<IpAddr> {
        let client = match reqwest::Client::builder().timeout(self.timeout).build() {
            Ok(client) => client,
            Err(e) => {
                debug!("Failed to build HTTP client: {}", e);
                return None;
            }
        };

        for url in &self.urls {
            match client.get(url).send().await {
                Ok(res) if res.status().is_success() => match res.text().await {
                    Ok(body) => {
                        if let Some(ip) = parse_address(&body) {
                            return Some(ip);
                        }
                        debug!("Address lookup via {} returned no address", url);
                    }
                    Err(e) => debug!("Address lookup via {} failed: {}", url, e),
                },
                Ok(res) => debug!("Address lookup via {} returned {}", url, res.status()),
                Err(e) => debug!("Address lookup via {} failed: {}", url, e),
            }
        }
        None
    }
}

/// Parses a lookup response body.
pub fn parse_address(body: &str) -> Option<IpAddr> {
    body.trim().parse().ok()
}

/// Returns true for addresses that are not reachable from the internet.
pub fn is_local_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_local_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_local_v4(&v4),
            None => is_local_v6(v6),
        },
    }
}

fn is_local_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // Carrier-grade NAT, 100.64.0.0/10.
        || (a == 100 && (64..=127).contains(&b))
}

fn is_local_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // Unique local, fc00::/7.
        || (first & 0xfe00) == 0xfc00
        // Link local, fe80::/10.
        || (first & 0xffc0) == 0xfe80
}
