//! Outbound destination guard: scheme, host, and resolved-address policy.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::lookup_host;
use url::{Host, Url};

use crate::HttpClientError;

/// Policy for one outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestinationPolicy {
    /// Allows loopback/private/link-local targets when true.
    pub allow_private_ips: bool,
}

/// A validated destination with its pinned first resolution.
///
/// Dialing the pinned address while keeping the original host name in the
/// `Host` header defeats DNS flips between validation and connect.
#[derive(Debug, Clone)]
pub struct PinnedDestination {
    pub url: Url,
    pub host: String,
    pub port: u16,
    pub address: SocketAddr,
}

/// Parses and validates a URL, then resolves and pins its first address.
pub async fn validate_and_pin(
    raw_url: &str,
    policy: DestinationPolicy,
) -> Result<PinnedDestination, HttpClientError> {
    let url = Url::parse(raw_url).map_err(|error| HttpClientError::InvalidUrl {
        detail: format!("unparseable URL: {error}"),
    })?;
    validate_scheme(&url)?;
    let host = normalized_host(&url)?;
    if is_metadata_hostname(&host) {
        return Err(ssrf("metadata_endpoint", "cloud metadata endpoints are never reachable"));
    }
    if is_localhost_hostname(&host) && !policy.allow_private_ips {
        return Err(ssrf("private_network", "localhost targets require the private-IP opt-in"));
    }
    let port = url
        .port_or_known_default()
        .ok_or_else(|| HttpClientError::InvalidUrl {
            detail: "URL has no known default port".to_string(),
        })?;

    if let Ok(ip) = host.parse::<IpAddr>() {
        validate_ip(ip, policy.allow_private_ips)?;
        return Ok(PinnedDestination {
            url,
            host,
            port,
            address: SocketAddr::new(ip, port),
        });
    }

    let lookup_target = format!("{host}:{port}");
    let addresses: Vec<SocketAddr> = lookup_host(lookup_target.as_str())
        .await
        .map_err(|error| HttpClientError::DnsFailure {
            detail: format!("resolution failed: {error}"),
        })?
        .collect();
    if addresses.is_empty() {
        return Err(HttpClientError::DnsFailure {
            detail: "host resolved no addresses".to_string(),
        });
    }
    for candidate in &addresses {
        validate_ip(candidate.ip(), policy.allow_private_ips)?;
    }

    Ok(PinnedDestination {
        url,
        host,
        port,
        address: addresses[0],
    })
}

fn ssrf(rule: &'static str, detail: &str) -> HttpClientError {
    HttpClientError::SsrfViolation {
        rule,
        detail: detail.to_string(),
    }
}

fn validate_scheme(url: &Url) -> Result<(), HttpClientError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(HttpClientError::SsrfViolation {
            rule: "blocked_scheme",
            detail: format!("scheme '{scheme}' is not permitted for outbound requests"),
        }),
    }
}

fn normalized_host(url: &Url) -> Result<String, HttpClientError> {
    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.trim().trim_end_matches('.').to_ascii_lowercase(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => {
            // Mapped-IPv4 literals can smuggle a v4 target past v6 checks.
            if ip.to_ipv4_mapped().is_some() {
                return Err(ssrf(
                    "suspicious_literal",
                    "IPv4-mapped IPv6 literals are not permitted",
                ));
            }
            ip.to_string()
        }
        None => {
            return Err(HttpClientError::InvalidUrl {
                detail: "URL is missing a host".to_string(),
            })
        }
    };
    if host.is_empty() {
        return Err(HttpClientError::InvalidUrl {
            detail: "URL has an empty host".to_string(),
        });
    }
    Ok(host)
}

fn is_localhost_hostname(host: &str) -> bool {
    host == "localhost" || host.ends_with(".localhost")
}

fn is_metadata_hostname(host: &str) -> bool {
    matches!(
        host,
        "metadata"
            | "metadata.google.internal"
            | "instance-data"
            | "instance-data.ec2.internal"
            | "metadata.azure.internal"
    )
}

/// The link-local and AWS/GCP/Azure metadata address.
const METADATA_V4: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

/// fe80::/10.
const V6_LINK_LOCAL_PREFIX: u16 = 0xfe80;
const V6_LINK_LOCAL_MASK: u16 = 0xffc0;

/// 2001:db8::/32, the documentation block.
const V6_DOCUMENTATION_PREFIX: [u16; 2] = [0x2001, 0x0db8];

fn validate_ip(ip: IpAddr, allow_private: bool) -> Result<(), HttpClientError> {
    if ip == IpAddr::V4(METADATA_V4) {
        return Err(ssrf("metadata_endpoint", "cloud metadata addresses are never reachable"));
    }
    if ip.is_unspecified() {
        return Err(ssrf("suspicious_literal", "the unspecified address is not a valid target"));
    }
    if ip.is_multicast() {
        return Err(ssrf("suspicious_literal", "multicast addresses are not valid targets"));
    }
    if !allow_private && needs_private_opt_in(ip) {
        return Err(ssrf(
            "private_network",
            "private, loopback, and link-local targets require the private-IP opt-in",
        ));
    }
    Ok(())
}

/// Ranges that are only dialable with the operator's private-IP opt-in:
/// loopback, RFC 1918/4193 private space, link-local, broadcast, the
/// RFC 6598 shared (CGNAT) block, and the v6 documentation block.
fn needs_private_opt_in(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let [first, second, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                // 100.64.0.0/10 shared address space
                || (first == 100 && (64..128).contains(&second))
        }
        IpAddr::V6(v6) => {
            let [head, next, ..] = v6.segments();
            v6.is_loopback()
                || v6.is_unique_local()
                || head & V6_LINK_LOCAL_MASK == V6_LINK_LOCAL_PREFIX
                || [head, next] == V6_DOCUMENTATION_PREFIX
        }
    }
}
