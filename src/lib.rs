//! Peer manager: the connectivity core of a P2P blockchain node
//!
//! This crate keeps a node connected:
//! - Maintains up to 8 outbound and 128 inbound peer connections
//! - Accepts inbound peers on a TLS websocket listener
//! - Detects connections to itself and duplicate connections
//! - Discovers peers from DNS seeds, an IRC seed channel, and gossip
//! - Works out whether the node is reachable from outside
//!
//! # Example
//!
//! ```no_run
//! use peer_manager::network::{tls, MemoryPeerStore, NodeConfig, PeerManager, WsPeerFactory};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NodeConfig::default();
//! let store = Arc::new(MemoryPeerStore::new());
//! let factory = Arc::new(WsPeerFactory::new(
//!     config.network_id.clone(),
//!     store.clone(),
//!     tls::client_config()?,
//! ));
//!
//! let manager = PeerManager::new(config, store, factory);
//! manager.run();
//!
//! tokio::signal::ctrl_c().await?;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod network;

// Re-export commonly used types
pub use network::{
    LifecycleState, MemoryPeerStore, NodeConfig, PeerManager, PeerStorage, WsPeerFactory,
};
