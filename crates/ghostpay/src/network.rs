//! Host classification for outbound webhook targets.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

/// Loopback, RFC 1918, link-local, broadcast, unspecified or CGNAT (100.64.0.0/10).
pub fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xC0) == 64)
}

/// Loopback, unspecified, unique local (fc00::/7), link-local (fe80::/10) or a
/// private IPv4-mapped address.
pub fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    ip.is_loopback() || ip.is_unspecified() || {
        let segments = ip.segments();
        (segments[0] & 0xFE00) == 0xFC00
            || (segments[0] & 0xFFC0) == 0xFE80
            || ip.to_ipv4_mapped().is_some_and(|v4| is_private_ipv4(&v4))
    }
}

pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

/// Whether `url` points at an address that is not publicly routable.
/// Only literal IPs and `localhost` are classified; names are not resolved.
pub fn targets_private_host(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => is_private_ipv4(&ip),
        Some(Host::Ipv6(ip)) => is_private_ipv6(&ip),
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        None => true,
    }
}
