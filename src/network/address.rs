//! Peer address validation
//!
//! Turns a raw `host:port` candidate into a canonical socket address, or says
//! why it can't be used. Candidates come from DNS seeds, IRC, peer gossip and
//! the `X-Peer-Address` header of inbound requests, so everything here treats
//! its input as untrusted.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::net::lookup_host;

/// Address ranges we never connect to or advertise
pub const RESERVED_BLOCKS: &[IpBlock] = &[
    // IPv4 loopback
    IpBlock::v4(Ipv4Addr::new(127, 0, 0, 0), 8),
    // RFC1918
    IpBlock::v4(Ipv4Addr::new(10, 0, 0, 0), 8),
    IpBlock::v4(Ipv4Addr::new(172, 16, 0, 0), 12),
    IpBlock::v4(Ipv4Addr::new(192, 168, 0, 0), 16),
    // IPv6 loopback
    IpBlock::v6(Ipv6Addr::LOCALHOST, 128),
    // IPv6 link-local
    IpBlock::v6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
    // IPv6 unique local
    IpBlock::v6(Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
];

/// Address validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Malformed peer address: {0}")]
    Malformed(String),
    #[error("Invalid port in peer address: {0}")]
    InvalidPort(String),
    #[error("Unable to resolve IP address for: {host}, error: {reason}")]
    Unresolvable { host: String, reason: String },
    #[error("No IP address found for peer address: {0}")]
    NoAddress(String),
    #[error("Peer address is ours: {0}")]
    SelfAddress(String),
    #[error("IP is in local address space: {0}")]
    Reserved(IpAddr),
}

/// A CIDR block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpBlock {
    network: IpAddr,
    prefix: u8,
}

impl IpBlock {
    pub const fn v4(network: Ipv4Addr, prefix: u8) -> Self {
        Self {
            network: IpAddr::V4(network),
            prefix,
        }
    }

    pub const fn v6(network: Ipv6Addr, prefix: u8) -> Self {
        Self {
            network: IpAddr::V6(network),
            prefix,
        }
    }

    /// Whether `ip` falls inside this block.
    ///
    /// IPv4-mapped IPv6 addresses are matched as the IPv4 address they carry.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, &ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p if p >= 128 => u128::MAX,
        p => u128::MAX << (128 - p),
    }
}

/// Whether an IP is inside any reserved range
pub fn is_reserved(ip: &IpAddr) -> bool {
    RESERVED_BLOCKS.iter().any(|block| block.contains(ip))
}

/// Split `host:port` or `[v6-host]:port`.
///
/// Unbracketed hosts containing a colon are rejected, since the port boundary
/// would be ambiguous.
pub fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        if host.is_empty() {
            return None;
        }
        return Some((host, port));
    }

    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() || host.contains(':') || host.contains('[') || host.contains(']') {
        return None;
    }
    Some((host, port))
}

fn parse_port(port: &str) -> Option<u16> {
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    port.parse().ok()
}

/// Validates candidate peer addresses against our own identity
#[derive(Debug, Clone)]
pub struct AddressValidator {
    /// Our externally visible IP, if we know it
    external_ip: Option<IpAddr>,
    /// Our listen port
    listen_port: u16,
}

impl AddressValidator {
    pub fn new(external_ip: Option<IpAddr>, listen_port: u16) -> Self {
        Self {
            external_ip,
            listen_port,
        }
    }

    /// Parse, resolve and validate a peer address
    pub async fn parse_peer_address(&self, addr: &str) -> Result<SocketAddr, AddressError> {
        let (host, port_str) =
            split_host_port(addr).ok_or_else(|| AddressError::Malformed(addr.to_string()))?;

        let port =
            parse_port(port_str).ok_or_else(|| AddressError::InvalidPort(addr.to_string()))?;

        // Resolve the host, keeping the resolver's order
        let ip = match host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => {
                let mut resolved =
                    lookup_host((host, port))
                        .await
                        .map_err(|e| AddressError::Unresolvable {
                            host: host.to_string(),
                            reason: e.to_string(),
                        })?;
                resolved
                    .next()
                    .map(|sa| sa.ip())
                    .ok_or_else(|| AddressError::NoAddress(addr.to_string()))?
            }
        };

        self.check(ip, port, addr)
    }

    /// Identity and range checks on an already-resolved address.
    ///
    /// IPv4-mapped IPv6 addresses are unwrapped first, and returned unwrapped.
    pub fn check(&self, ip: IpAddr, port: u16, raw: &str) -> Result<SocketAddr, AddressError> {
        let ip = ip.to_canonical();
        let ours = self.external_ip.map(|ext| ext.to_canonical());
        if ours == Some(ip) && self.listen_port == port {
            return Err(AddressError::SelfAddress(raw.to_string()));
        }

        if is_reserved(&ip) {
            return Err(AddressError::Reserved(ip));
        }

        Ok(SocketAddr::new(ip, port))
    }
}
