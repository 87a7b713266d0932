//! Client address resolution and trusted-proxy allowlist.
//!
//! Forwarded headers (`X-Forwarded-For`, `X-Real-IP`, `X-Forwarded-Proto`) are
//! only believed when the direct peer sits inside the trusted-proxy allowlist.
//! Any other peer is reported as-is, which keeps untrusted clients from spoofing
//! their address or claiming HTTPS.

use axum::{
    extract::{ConnectInfo, connect_info::Connected},
    http::{Extensions, HeaderMap},
    serve::IncomingStream,
};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use once_cell::sync::Lazy;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpListener;
use tracing::warn;

pub(crate) const TRUSTED_PROXY_ENV: &str = "PULSE_TRUSTED_PROXY_CIDRS";

/// Direct peer of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    /// Whether the connection itself is TLS.
    pub tls: bool,
}

impl PeerInfo {
    #[must_use]
    pub fn plain(addr: SocketAddr) -> Self {
        Self { addr, tls: false }
    }

    #[must_use]
    pub fn ip(&self) -> IpAddr {
        self.addr.ip().to_canonical()
    }
}

impl Connected<IncomingStream<'_, TcpListener>> for PeerInfo {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        Self::plain(*stream.remote_addr())
    }
}

/// Peer recorded by the server (or `MockConnectInfo` in tests).
pub(crate) fn peer_info(extensions: &Extensions) -> Option<PeerInfo> {
    extensions
        .get::<ConnectInfo<PeerInfo>>()
        .map(|ConnectInfo(peer)| *peer)
}

static PROCESS_TRUSTED_PROXIES: Lazy<TrustedProxies> = Lazy::new(|| {
    std::env::var(TRUSTED_PROXY_ENV)
        .map(|raw| TrustedProxies::parse(&raw))
        .unwrap_or_default()
});

/// Parsed trusted-proxy allowlist.
#[derive(Clone, Debug, Default)]
pub struct TrustedProxies {
    nets: Vec<IpNet>,
}

impl TrustedProxies {
    /// Parse a comma-separated list of CIDRs or bare IPs.
    ///
    /// Invalid entries are logged and skipped. Bare IPs become `/32` or `/128`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut nets = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if entry.contains('/') {
                match entry.parse::<IpNet>() {
                    Ok(net) => nets.push(net.trunc()),
                    Err(err) => {
                        warn!(cidr = entry, "Ignoring invalid CIDR in {TRUSTED_PROXY_ENV}: {err}");
                    }
                }
                continue;
            }
            match entry.parse::<IpAddr>() {
                Ok(IpAddr::V4(v4)) => {
                    if let Ok(net) = Ipv4Net::new(v4, 32) {
                        nets.push(IpNet::V4(net));
                    }
                }
                Ok(IpAddr::V6(v6)) => {
                    if let Ok(net) = Ipv6Net::new(v6, 128) {
                        nets.push(IpNet::V6(net));
                    }
                }
                Err(_) => {
                    warn!(value = entry, "Ignoring invalid IP in {TRUSTED_PROXY_ENV}");
                }
            }
        }
        Self { nets }
    }

    /// The allowlist read from `PULSE_TRUSTED_PROXY_CIDRS`, parsed once per process.
    #[must_use]
    pub fn from_env() -> Self {
        PROCESS_TRUSTED_PROXIES.clone()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nets.len()
    }

    /// Whether `ip` belongs to a trusted proxy.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.nets.iter().any(|net| net.contains(&ip))
    }
}

/// Resolve the client address for a request.
///
/// Returns the direct peer unless the peer is a trusted proxy, in which case the
/// leftmost valid `X-Forwarded-For` entry, then `X-Real-IP`, is used.
pub(crate) fn client_ip(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    proxies: &TrustedProxies,
) -> Option<IpAddr> {
    let peer = peer?.to_canonical();
    if proxies.contains(peer) {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(first_valid_forwarded_ip)
        {
            return Some(forwarded);
        }
        if let Some(real_ip) = headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().trim_matches(|c| c == '[' || c == ']'))
            .and_then(|value| value.parse::<IpAddr>().ok())
        {
            return Some(real_ip);
        }
    }
    Some(peer)
}

/// First entry of an `X-Forwarded-For` list that parses as an IP address.
///
/// Entries carrying a port are rejected.
pub(crate) fn first_valid_forwarded_ip(header: &str) -> Option<IpAddr> {
    header
        .split(',')
        .map(|part| part.trim().trim_matches(|c| c == '[' || c == ']').trim())
        .filter(|part| !part.is_empty())
        .find_map(|part| part.parse::<IpAddr>().ok())
}

/// Loopback, link-local, RFC 1918 and IPv6 unique-local addresses.
#[must_use]
pub fn is_private(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_link_local() || v4.is_private(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Whether the request claims HTTPS via forwarding headers.
///
/// Chained proxies append hops, so only the first (client-facing) entry counts.
pub(crate) fn forwarded_proto_is_https(headers: &HeaderMap) -> bool {
    let first_hop = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
    };
    if first_hop("x-forwarded-proto").is_some_and(|proto| proto.eq_ignore_ascii_case("https")) {
        return true;
    }
    first_hop("forwarded").is_some_and(|element| {
        element.split(';').any(|pair| {
            pair.split_once('=').is_some_and(|(key, value)| {
                key.trim().eq_ignore_ascii_case("proto")
                    && value.trim().trim_matches('"').eq_ignore_ascii_case("https")
            })
        })
    })
}
