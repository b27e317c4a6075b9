//! P2P Networking module
//!
//! Keeps a node connected to the rest of the network.
//!
//! # Features
//! - Outbound connections topped up from stored peer addresses
//! - TLS websocket listener for inbound peers
//! - Self-connection and duplicate-connection detection
//! - Peer discovery via DNS seeds, an IRC seed channel, and address gossip
//! - External IP detection and UPnP port mapping

pub mod acceptor;
pub mod address;
pub mod conn_set;
pub mod discovery;
pub mod manager;
pub mod node;
pub mod peer;
pub mod reachability;
pub mod storage;
pub mod tls;
pub mod upnp;
pub mod ws_peer;

#[cfg(test)]
pub(crate) mod testing;

pub use acceptor::{accept_connections, AcceptorError, TlsListener};
pub use address::{is_reserved, AddressError, AddressValidator};
pub use conn_set::{ConnectionSet, Direction, MAX_INBOUND, MAX_OUTBOUND};
pub use discovery::{
    intake_channel, AddrIntake, DiscoveryError, DnsSeeder, SeedChannel, INTAKE_CAPACITY,
};
pub use manager::{ConnectError, LifecycleState, PeerManager};
pub use node::{NetworkIdentity, NodeConfig, DEFAULT_NETWORK_ID, DEFAULT_PORT};
pub use peer::{CloseCallback, Peer, PeerError, PeerFactory, PeerHandle};
pub use reachability::{ConsensusIpSource, ExternalIpSource, Reachability, ReachabilityError};
pub use storage::{MemoryPeerStore, PeerStorage, StorageError};
pub use tls::TlsError;
pub use upnp::{UpnpError, UpnpManager};
pub use ws_peer::{PeerMessage, WsPeer, WsPeerFactory};
