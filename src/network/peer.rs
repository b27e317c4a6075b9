//! Peer collaborator interfaces
//!
//! The manager never speaks the wire protocol itself. It asks a [`PeerFactory`]
//! for a fresh [`Peer`], tracks the handle in a connection set, and hands it off.

use crate::network::discovery::AddrIntake;
use async_trait::async_trait;
use axum::extract::ws::WebSocket;
use axum::http::StatusCode;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Request header carrying the dialer's self-nonce
pub const NONCE_HEADER: &str = "x-peer-nonce";

/// Request header carrying the dialer's own address, sent only when it thinks it's reachable
pub const ADDRESS_HEADER: &str = "x-peer-address";

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection to {0} timed out")]
    Timeout(String),
    #[error("Peer rejected connection with status {0}")]
    Rejected(StatusCode),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Peer is already connected")]
    AlreadyConnected,
}

/// Invoked once when a peer's connection terminates
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Shared handle to one live connection
pub type PeerHandle = Arc<dyn Peer>;

/// One connection's protocol handler
#[async_trait]
pub trait Peer: Send + Sync {
    /// Dial `addr` and complete the handshake.
    ///
    /// `advertised` is our own `ip:port`, set only when we believe we're reachable.
    async fn connect(
        &self,
        addr: &str,
        nonce: &str,
        advertised: Option<&str>,
    ) -> Result<(), PeerError>;

    /// Start autonomous operation in a background task
    fn run(&self);

    /// Register a hook fired exactly once when the connection closes.
    ///
    /// Fires immediately if the connection has already closed.
    fn on_close(&self, callback: CloseCallback);

    /// Tear the connection down and wait for its task to exit
    async fn shutdown(&self);
}

/// Builds peers bound to this node's chain state and discovery intake
pub trait PeerFactory: Send + Sync {
    /// A peer that will dial out via [`Peer::connect`]
    fn outbound(&self, intake: AddrIntake) -> PeerHandle;

    /// A peer wrapping an already-upgraded inbound socket
    fn inbound(&self, socket: WebSocket, remote: SocketAddr, intake: AddrIntake) -> PeerHandle;
}
