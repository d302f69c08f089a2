use std::net::IpAddr;

use thiserror::Error;
use tokio::net::lookup_host;
use tracing::{debug, warn};
use url::{Host, Url};

/// Target URL rejected at submission
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("invalid target URL: {0}")]
    Malformed(String),

    #[error("unsupported scheme '{0}', only http and https can be cloned")]
    UnsupportedScheme(String),

    #[error("target URL has no host")]
    MissingHost,

    #[error("target host '{0}' does not resolve")]
    Unresolvable(String),

    #[error("target host '{host}' resolves to internal address {addr}")]
    PrivateNetwork { host: String, addr: IpAddr },
}

/// Check if an IP is in a private/reserved range.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (first & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Block internal hosts that are recognisable without DNS
pub fn is_internal_host(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => is_private_ip(&IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => is_private_ip(&IpAddr::V6(ip)),
        Some(Host::Domain(host)) => {
            let host = host.to_lowercase();
            host == "localhost"
                || host.ends_with(".localhost")
                || host.ends_with(".local")
                || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Parse and vet a target URL before a job is created.
///
/// The host must resolve, and unless `allow_private` is set none of its
/// addresses may be loopback, link-local or private.
pub async fn validate_target(raw: &str, allow_private: bool) -> Result<Url, TargetError> {
    let url = Url::parse(raw.trim()).map_err(|e| TargetError::Malformed(format!("{}: {}", raw, e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(TargetError::UnsupportedScheme(url.scheme().to_string()));
    }

    let host = url.host_str().ok_or(TargetError::MissingHost)?.to_string();
    let port = url.port_or_known_default().unwrap_or(80);

    // lookup_host wants bare IPv6 literals
    let lookup = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let addrs: Vec<IpAddr> = match lookup_host((lookup.as_str(), port)).await {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(e) => {
            debug!("DNS lookup for {} failed: {}", host, e);
            return Err(TargetError::Unresolvable(host));
        }
    };

    if addrs.is_empty() {
        return Err(TargetError::Unresolvable(host));
    }

    if let Some(addr) = addrs.iter().find(|a| is_private_ip(a)) {
        if !allow_private {
            return Err(TargetError::PrivateNetwork { host, addr: *addr });
        }
        warn!("Target {} resolves to internal address {}, allowed by configuration", host, addr);
    }

    Ok(url)
}
