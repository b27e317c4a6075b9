//! Node configuration and identity
//!
//! `NodeConfig` is everything the peer manager takes from the outside world.
//! `NetworkIdentity` is what the node knows about itself for the life of the
//! process.

use crate::network::address::AddressValidator;
use crate::network::conn_set::{MAX_INBOUND, MAX_OUTBOUND};
use crate::network::discovery::DnsSeeder;
use crate::network::reachability::Reachability;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Default peer port
pub const DEFAULT_PORT: u16 = 8831;

/// Genesis block id of the default network
pub const DEFAULT_NETWORK_ID: &str =
    "00000000e29a7850088d660489b7b9ae2da763bc3bd83324ecc54eee04840adb";

/// How often to top up outbound connections
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Peer manager configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Data directory (TLS material lives here)
    pub data_dir: PathBuf,
    /// Network identifier: the genesis block id
    pub network_id: String,
    /// Connect only to this peer, skipping seed discovery
    pub peer: Option<String>,
    /// Port to listen on
    pub port: u16,
    /// Accept inbound connections
    pub accept: bool,
    /// Use IRC seeding
    pub irc: bool,
    /// External IP learned out of band, e.g. from a UPnP gateway
    pub external_ip: Option<IpAddr>,
    /// DNS seeds (`host:port`). Defaults to the built-in seed list, which is
    /// empty until the network publishes seeds, so deployments must configure them.
    pub dns_seeds: Vec<String>,
    pub max_outbound: usize,
    pub max_inbound: usize,
    pub reconnect_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".peerd_data"),
            network_id: DEFAULT_NETWORK_ID.to_string(),
            peer: None,
            port: DEFAULT_PORT,
            accept: true,
            irc: false,
            external_ip: None,
            dns_seeds: DnsSeeder::defaults().seeds().to_vec(),
            max_outbound: MAX_OUTBOUND,
            max_inbound: MAX_INBOUND,
            reconnect_interval: RECONNECT_INTERVAL,
        }
    }
}

/// Who this node is on the network
#[derive(Debug)]
pub struct NetworkIdentity {
    network_id: String,
    nonce: String,
    port: u16,
    /// External IP known before detection (from config)
    configured_ip: Option<IpAddr>,
    /// Set once, when reachability detection finishes
    reachability: OnceLock<Reachability>,
}

impl NetworkIdentity {
    pub fn new(network_id: String, port: u16, configured_ip: Option<IpAddr>) -> Self {
        let nonce = rand::random::<u32>() >> 1;
        Self::with_nonce(network_id, port, configured_ip, nonce.to_string())
    }

    pub fn with_nonce(
        network_id: String,
        port: u16,
        configured_ip: Option<IpAddr>,
        nonce: String,
    ) -> Self {
        Self {
            network_id,
            nonce,
            port,
            configured_ip,
            reachability: OnceLock::new(),
        }
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Record the detection result. Only the first call has any effect.
    pub fn set_reachability(&self, reachability: Reachability) -> bool {
        self.reachability.set(reachability).is_ok()
    }

    pub fn external_ip(&self) -> Option<IpAddr> {
        match self.reachability.get() {
            Some(r) => r.external_ip,
            None => self.configured_ip,
        }
    }

    pub fn is_open(&self) -> bool {
        self.reachability.get().map(|r| r.open).unwrap_or(false)
    }

    /// Our own `ip:port`, only when we believe we're reachable
    pub fn advertised_address(&self) -> Option<String> {
        if !self.is_open() {
            return None;
        }
        self.external_ip()
            .map(|ip| SocketAddr::new(ip, self.port).to_string())
    }

    pub fn validator(&self) -> AddressValidator {
        AddressValidator::new(self.external_ip(), self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_outbound, MAX_OUTBOUND);
        assert_eq!(config.max_inbound, MAX_INBOUND);
        assert_eq!(config.reconnect_interval, Duration::from_secs(300));
        assert!(config.peer.is_none());
        assert_eq!(config.dns_seeds, DnsSeeder::defaults().seeds());
    }

    #[test]
    fn test_nonce_is_non_negative_int32() {
        let identity = NetworkIdentity::new("net".to_string(), 8831, None);
        let nonce: i32 = identity.nonce().parse().unwrap();
        assert!(nonce >= 0);
    }

    #[test]
    fn test_reachability_set_once() {
        let identity = NetworkIdentity::new("net".to_string(), 8831, None);
        assert!(!identity.is_open());
        assert!(identity.advertised_address().is_none());

        assert!(identity.set_reachability(Reachability {
            external_ip: Some("203.0.113.5".parse().unwrap()),
            open: true,
        }));
        assert!(!identity.set_reachability(Reachability::default()));

        assert!(identity.is_open());
        assert_eq!(
            identity.advertised_address().as_deref(),
            Some("203.0.113.5:8831")
        );
    }

    #[test]
    fn test_configured_ip_before_detection() {
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        let identity = NetworkIdentity::new("net".to_string(), 8831, Some(ip));

        assert_eq!(identity.external_ip(), Some(ip));
        // known but not yet confirmed reachable
        assert!(identity.advertised_address().is_none());
    }
}
