use std::{
    borrow::Cow,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

/// Normalize a bind/listen address.
///
/// Config files commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". Rust's `SocketAddr` parsing and Tokio bind APIs do not accept
/// `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

pub async fn resolve_socket_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("net: could not resolve {addr:?}"))
}

/// Host part of `host:port`, with IPv6 brackets removed.
pub fn split_host(addr: &str) -> &str {
    let addr = addr.trim();
    let host = match addr.rfind(':') {
        Some(i) if !addr[..i].is_empty() => &addr[..i],
        Some(_) => "",
        None => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Fills in the host of a port-only address (`":7001"`) with `fallback_host`.
pub fn with_default_host(addr: &str, fallback_host: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with(':') {
        if fallback_host.contains(':') {
            format!("[{fallback_host}]{addr}")
        } else {
            format!("{fallback_host}{addr}")
        }
    } else {
        addr.to_string()
    }
}

/// Maps IPv4-mapped IPv6 addresses back to plain IPv4 so that family checks
/// and equality comparisons behave.
pub fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

pub fn same_family(a: SocketAddr, b: SocketAddr) -> bool {
    canonical(a).is_ipv4() == canonical(b).is_ipv4()
}

/// Wildcard bind address of the same family as `addr`, with an ephemeral port.
pub fn unspecified_like(addr: SocketAddr) -> SocketAddr {
    if canonical(addr).is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    }
}
