//! Own address and display name: what we announce and how we recognise our own datagrams.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use crate::config::Config;

/// Any routable address works; a UDP connect sends nothing, it only selects a route.
const ROUTE_PROBE: (Ipv4Addr, u16) = (Ipv4Addr::new(192, 0, 2, 1), 9);

/// Local IPv4 address the OS would use for LAN traffic.
pub fn local_ipv4() -> std::io::Result<Ipv4Addr> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    sock.connect(ROUTE_PROBE)?;
    match sock.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Ok(ip),
        other => Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no LAN address (route probe gave {other})"),
        )),
    }
}

/// Display name to announce: configured name, else the host name.
pub fn display_name(configured: Option<&str>) -> Option<String> {
    if let Some(name) = configured.and_then(sanitize_name) {
        return Some(name);
    }
    if let Some(name) = std::env::var("HOSTNAME").ok().as_deref().and_then(sanitize_name) {
        return Some(name);
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .as_deref()
        .and_then(sanitize_name)
}

/// First line, trimmed, with control characters dropped. None if nothing is left.
fn sanitize_name(raw: &str) -> Option<String> {
    let name: String = raw
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .collect();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// This device as seen by peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfIdentity {
    pub address: Ipv4Addr,
    /// None when no name could be determined; presence broadcasts are skipped then.
    pub name: Option<String>,
}

impl SelfIdentity {
    /// Resolve from config overrides, then the bind address, then the route probe.
    pub fn resolve(config: &Config) -> std::io::Result<Self> {
        let address = match config.self_address {
            Some(a) => a,
            None if !config.bind_addr.is_unspecified() => config.bind_addr,
            None => local_ipv4()?,
        };
        Ok(Self {
            address,
            name: display_name(config.display_name.as_deref()),
        })
    }

    /// Key used for this device in peer tables and offline queues.
    pub fn key(&self) -> String {
        self.address.to_string()
    }
}
