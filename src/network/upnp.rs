//! UPnP NAT traversal
//!
//! Maps the listen port on the local gateway so inbound peers can reach us,
//! and reports the gateway's external IP. That IP becomes the pre-known
//! external address the reachability check compares against.

use igd_next::{search_gateway, PortMappingProtocol};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::{spawn_blocking, JoinHandle};

/// Lease requested from the gateway, in seconds
const LEASE_SECS: u32 = 3600;

/// Renew well before the lease runs out
const RENEWAL_INTERVAL: Duration = Duration::from_secs(50 * 60);

const MAPPING_DESCRIPTION: &str = "peerd";

#[derive(Error, Debug)]
pub enum UpnpError {
    #[error("UPnP gateway not found: {0}")]
    GatewayNotFound(String),
    #[error("Failed to get external IP: {0}")]
    ExternalIpError(String),
    #[error("Failed to add port mapping: {0}")]
    PortMappingError(String),
    #[error("UPnP disabled")]
    Disabled,
    #[error("Invalid local address")]
    InvalidLocalAddress,
}

/// An active TCP mapping of `port` on the gateway to `local`
#[derive(Debug, Clone, Copy)]
struct Mapping {
    port: u16,
    local: SocketAddrV4,
}

/// Maps, renews, and removes the listen port mapping.
///
/// igd-next is blocking, so every gateway call runs on the blocking pool.
pub struct UpnpManager {
    enabled: bool,
    mapping: Arc<Mutex<Option<Mapping>>>,
}

impl UpnpManager {
    pub fn new() -> Self {
        Self {
            enabled: true,
            mapping: Arc::new(Mutex::new(None)),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn mapped_port(&self) -> Option<u16> {
        self.mapping.lock().await.map(|m| m.port)
    }

    /// Map `port` on the gateway and return the gateway's external IP
    pub async fn setup(&mut self, port: u16) -> Result<IpAddr, UpnpError> {
        if !self.enabled {
            return Err(UpnpError::Disabled);
        }

        let local_ip = get_local_ip().ok_or(UpnpError::InvalidLocalAddress)?;
        let mapping = Mapping {
            port,
            local: SocketAddrV4::new(local_ip, port),
        };

        log::info!("Searching for UPnP gateway...");
        let external = spawn_blocking(move || add_mapping(mapping))
            .await
            .map_err(|e| UpnpError::GatewayNotFound(e.to_string()))??;

        log::info!(
            "Added UPnP port mapping: {}:{} -> {}",
            external,
            port,
            mapping.local
        );
        *self.mapping.lock().await = Some(mapping);

        Ok(external)
    }

    /// Re-add the mapping every renewal interval until it's removed
    pub fn start_renewal_task(&self) -> JoinHandle<()> {
        let current = self.mapping.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RENEWAL_INTERVAL).await;

                let Some(mapping) = *current.lock().await else {
                    break;
                };

                match spawn_blocking(move || add_mapping(mapping)).await {
                    Ok(Ok(_)) => log::debug!("Renewed UPnP port mapping"),
                    Ok(Err(e)) => log::warn!("Failed to renew UPnP port mapping: {}", e),
                    Err(e) => log::warn!("UPnP renewal task failed: {}", e),
                }
            }
        })
    }

    /// Remove the mapping, if any. Failures are logged.
    pub async fn cleanup(&mut self) {
        let Some(mapping) = self.mapping.lock().await.take() else {
            return;
        };

        let removed = spawn_blocking(move || {
            let gateway = search_gateway(Default::default()).map_err(|e| e.to_string())?;
            gateway
                .remove_port(PortMappingProtocol::TCP, mapping.port)
                .map_err(|e| e.to_string())
        })
        .await;

        match removed {
            Ok(Ok(())) => log::info!("Removed UPnP port mapping for port {}", mapping.port),
            Ok(Err(e)) => log::warn!("Failed to remove UPnP port mapping: {}", e),
            Err(e) => log::warn!("UPnP cleanup task failed: {}", e),
        }
    }
}

impl Default for UpnpManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocking: find the gateway, add the mapping, return its external IPv4
fn add_mapping(mapping: Mapping) -> Result<IpAddr, UpnpError> {
    let gateway = search_gateway(Default::default())
        .map_err(|e| UpnpError::GatewayNotFound(e.to_string()))?;
    log::debug!("Found UPnP gateway: {}", gateway.addr);

    let external = gateway
        .get_external_ip()
        .map_err(|e| UpnpError::ExternalIpError(e.to_string()))?;
    if external.is_ipv6() {
        return Err(UpnpError::ExternalIpError("IPv6 not supported".to_string()));
    }

    gateway
        .add_port(
            PortMappingProtocol::TCP,
            mapping.port,
            SocketAddr::V4(mapping.local),
            LEASE_SECS,
            MAPPING_DESCRIPTION,
        )
        .map_err(|e| UpnpError::PortMappingError(e.to_string()))?;

    Ok(external)
}

/// Local IPv4 address of the default route
pub fn get_local_ip() -> Option<Ipv4Addr> {
    // connecting a UDP socket sends nothing, it only picks the route
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;

    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_flag() {
        assert!(UpnpManager::new().is_enabled());
        assert!(!UpnpManager::disabled().is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_setup_fails() {
        let mut mgr = UpnpManager::disabled();
        assert!(matches!(mgr.setup(8831).await, Err(UpnpError::Disabled)));
        assert!(mgr.mapped_port().await.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_without_mapping() {
        let mut mgr = UpnpManager::new();
        mgr.cleanup().await;
        assert!(mgr.mapped_port().await.is_none());
    }
}
