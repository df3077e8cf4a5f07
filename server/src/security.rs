use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use reqwest::Url;
use tracing::warn;

use crate::errors::{Error, Result};

/// SSRF boundary for every outbound fetch target taken from untrusted input:
/// PDS URLs, issuer URLs, and PAR/token/authorization endpoints pulled from
/// remote JSON documents.
///
/// A URL is safe when it is HTTPS, carries no userinfo, and its host resolves
/// only to globally routable addresses. `allow_loopback` is the explicit
/// development exception: it additionally admits http/https to loopback hosts
/// so local fixture servers can be reached.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafeUrlGuard {
    allow_loopback: bool,
}

impl SafeUrlGuard {
    pub fn new(allow_loopback: bool) -> Self {
        Self { allow_loopback }
    }

    pub fn allows_loopback(&self) -> bool {
        self.allow_loopback
    }

    /// Check whether `url` is safe to fetch. Resolves DNS, so this is async.
    pub async fn is_safe(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return false;
        }

        let Some(host) = parsed.host_str() else {
            return false;
        };
        let port = match parsed.port_or_known_default() {
            Some(port) => port,
            None => return false,
        };

        let loopback_host = is_loopback_host(host);
        match parsed.scheme() {
            "https" => {}
            "http" if self.allow_loopback && loopback_host => {}
            _ => return false,
        }
        if loopback_host {
            return self.allow_loopback;
        }

        // Resolve the host and require every address to be globally routable.
        // A name that resolves to nothing is not fetchable either way.
        let addrs = match tokio::net::lookup_host((host, port)).await {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(err) => {
                warn!("DNS resolution failed for {}: {}", host, err);
                return false;
            }
        };
        if addrs.is_empty() {
            return false;
        }

        addrs.iter().all(|addr| match addr.ip() {
            IpAddr::V4(ip) => self.allow_loopback && ip.is_loopback() || is_public_v4(ip),
            IpAddr::V6(ip) => self.allow_loopback && ip.is_loopback() || is_public_v6(ip),
        })
    }

    /// Like `is_safe`, but returns the parsed URL or an `UnsafeTarget` error.
    pub async fn ensure_safe(&self, url: &str) -> Result<Url> {
        if self.is_safe(url).await {
            // is_safe only succeeds on parseable URLs
            Url::parse(url).map_err(|_| Error::UnsafeTarget(url.to_string()))
        } else {
            Err(Error::UnsafeTarget(url.to_string()))
        }
    }
}

pub fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        Err(_) => false,
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    // 100.64.0.0/10 (CGNAT) is not covered by the stdlib predicates
    let shared = octets[0] == 100 && (octets[1] & 0xc0) == 64;
    !(ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || ip.is_documentation()
        || shared)
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_public_v4(mapped);
    }
    let segments = ip.segments();
    let unique_local = (segments[0] & 0xfe00) == 0xfc00;
    let link_local = (segments[0] & 0xffc0) == 0xfe80;
    !(ip.is_loopback() || ip.is_multicast() || ip.is_unspecified() || unique_local || link_local)
}
