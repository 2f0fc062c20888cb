//! URL Guard
//!
//! Keeps tools from reaching internal services. Only literal hosts are
//! checked; names are not resolved.

use std::net::{IpAddr, Ipv4Addr};

use url::{Host, Url};

/// Well-formed `http`/`https` URL with a host
pub fn is_valid_url(raw: &str) -> bool {
    Url::parse(raw)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
        .unwrap_or(false)
}

/// Loopback, unspecified, RFC 1918, link-local and `localhost` targets.
/// Invalid URLs count as blocked.
pub fn is_blocked_url(raw: &str) -> bool {
    if !is_valid_url(raw) {
        return true;
    }
    let Ok(url) = Url::parse(raw) else {
        return true;
    };

    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => is_internal_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => is_internal_ip(IpAddr::V6(ip)),
        None => true,
    }
}

fn is_internal_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_internal_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_ipv4(v4),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || v6.to_ipv4_mapped().is_some_and(is_internal_ipv4),
    }
}
