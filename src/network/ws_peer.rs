//! WebSocket peer
//!
//! The transport half of a peer: dials or wraps a TLS websocket, keeps it
//! alive, and exchanges address gossip. Block and transaction relay live in
//! the chain layer and are not handled here.

use crate::network::discovery::AddrIntake;
use crate::network::peer::{
    CloseCallback, Peer, PeerError, PeerFactory, PeerHandle, ADDRESS_HEADER, NONCE_HEADER,
};
use crate::network::storage::PeerStorage;
use async_trait::async_trait;
use axum::extract::ws::{Message as InboundMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use rustls::ClientConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as OutboundMessage};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

/// Deadline for dialing plus the TLS and websocket handshakes
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How often to ping an idle connection
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Most addresses sent or accepted per gossip message
pub const MAX_GOSSIP_ADDRESSES: usize = 32;

// =============================================================================
// Messages
// =============================================================================

/// Address gossip messages, carried as JSON text frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Ask the remote for addresses it knows
    FindPeerAddresses,
    /// Addresses the sender knows
    PeerAddresses { addresses: Vec<String> },
}

// =============================================================================
// Socket
// =============================================================================

type OutboundStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Frame {
    Text(String),
    Close,
    Other,
}

/// Either side of a websocket
enum PeerSocket {
    Inbound(WebSocket),
    Outbound(Box<OutboundStream>),
}

impl PeerSocket {
    async fn send_text(&mut self, text: String) -> Result<(), PeerError> {
        match self {
            PeerSocket::Inbound(ws) => ws
                .send(InboundMessage::Text(text.into()))
                .await
                .map_err(|e| PeerError::ConnectionFailed(e.to_string())),
            PeerSocket::Outbound(ws) => ws
                .send(OutboundMessage::Text(text.into()))
                .await
                .map_err(|e| PeerError::ConnectionFailed(e.to_string())),
        }
    }

    async fn send_ping(&mut self) -> Result<(), PeerError> {
        match self {
            PeerSocket::Inbound(ws) => ws
                .send(InboundMessage::Ping(Default::default()))
                .await
                .map_err(|e| PeerError::ConnectionFailed(e.to_string())),
            PeerSocket::Outbound(ws) => ws
                .send(OutboundMessage::Ping(Default::default()))
                .await
                .map_err(|e| PeerError::ConnectionFailed(e.to_string())),
        }
    }

    async fn close(&mut self) {
        let result = match self {
            PeerSocket::Inbound(ws) => ws
                .send(InboundMessage::Close(None))
                .await
                .map_err(|e| e.to_string()),
            PeerSocket::Outbound(ws) => ws.as_mut().close(None).await.map_err(|e| e.to_string()),
        };
        if let Err(e) = result {
            log::debug!("Error closing websocket: {}", e);
        }
    }

    async fn recv(&mut self) -> Option<Frame> {
        match self {
            PeerSocket::Inbound(ws) => match ws.recv().await? {
                Ok(InboundMessage::Text(text)) => Some(Frame::Text(text.as_str().to_string())),
                Ok(InboundMessage::Close(_)) => Some(Frame::Close),
                Ok(_) => Some(Frame::Other),
                Err(e) => {
                    log::debug!("Websocket read error: {}", e);
                    None
                }
            },
            PeerSocket::Outbound(ws) => match ws.next().await? {
                Ok(OutboundMessage::Text(text)) => Some(Frame::Text(text.as_str().to_string())),
                Ok(OutboundMessage::Close(_)) => Some(Frame::Close),
                Ok(_) => Some(Frame::Other),
                Err(e) => {
                    log::debug!("Websocket read error: {}", e);
                    None
                }
            },
        }
    }
}

// =============================================================================
// Peer
// =============================================================================

#[derive(Default)]
struct CloseState {
    closed: bool,
    hooks: Vec<CloseCallback>,
}

struct Shared {
    network_id: String,
    peer_store: Arc<dyn PeerStorage>,
    intake: AddrIntake,
    tls: Arc<ClientConfig>,
    label: Mutex<String>,
    socket: Mutex<Option<PeerSocket>>,
    close: Mutex<CloseState>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

/// A peer connection over a TLS websocket
pub struct WsPeer {
    shared: Arc<Shared>,
}

impl WsPeer {
    fn new(
        network_id: String,
        peer_store: Arc<dyn PeerStorage>,
        intake: AddrIntake,
        tls: Arc<ClientConfig>,
        label: String,
        socket: Option<PeerSocket>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                network_id,
                peer_store,
                intake,
                tls,
                label: Mutex::new(label),
                socket: Mutex::new(socket),
                close: Mutex::new(CloseState::default()),
                task: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Whether the connection has closed
    pub fn is_closed(&self) -> bool {
        lock(&self.shared.close).closed
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn label(&self) -> String {
        lock(&self.label).clone()
    }

    /// Fire close hooks; only the first call does anything
    fn fire_close(&self) {
        let hooks = {
            let mut state = lock(&self.close);
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.hooks)
        };
        for hook in hooks {
            hook();
        }
    }

    async fn run_loop(&self, mut socket: PeerSocket) {
        let label = self.label();

        if let Err(e) = self.send(&mut socket, &PeerMessage::FindPeerAddresses).await {
            log::warn!("Failed to request addresses from {}: {}", label, e);
            return;
        }

        let mut keepalive = interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    socket.close().await;
                    break;
                }
                _ = keepalive.tick() => {
                    if let Err(e) = socket.send_ping().await {
                        log::debug!("Ping to {} failed: {}", label, e);
                        break;
                    }
                }
                frame = socket.recv() => match frame {
                    Some(Frame::Text(text)) => {
                        if let Err(e) = self.handle_text(&mut socket, &text).await {
                            log::warn!("Error handling message from {}: {}", label, e);
                            break;
                        }
                    }
                    Some(Frame::Other) => {}
                    Some(Frame::Close) | None => {
                        log::info!("Peer {} disconnected", label);
                        break;
                    }
                },
            }
        }
    }

    async fn send(&self, socket: &mut PeerSocket, msg: &PeerMessage) -> Result<(), PeerError> {
        let json = serde_json::to_string(msg)?;
        socket.send_text(json).await
    }

    async fn handle_text(&self, socket: &mut PeerSocket, text: &str) -> Result<(), PeerError> {
        let msg: PeerMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(_) => {
                // not part of the gossip slice
                log::debug!("Ignoring message from {}", self.label());
                return Ok(());
            }
        };

        match msg {
            PeerMessage::FindPeerAddresses => {
                let addresses = match self.peer_store.get(MAX_GOSSIP_ADDRESSES).await {
                    Ok(addrs) => addrs,
                    Err(e) => {
                        log::warn!("Error reading peer addresses: {}", e);
                        Vec::new()
                    }
                };
                self.send(socket, &PeerMessage::PeerAddresses { addresses })
                    .await
            }
            PeerMessage::PeerAddresses { addresses } => {
                log::debug!(
                    "Received {} addresses from {}",
                    addresses.len(),
                    self.label()
                );
                for addr in addresses.into_iter().take(MAX_GOSSIP_ADDRESSES) {
                    self.intake.offer(addr);
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Peer for WsPeer {
    async fn connect(
        &self,
        addr: &str,
        nonce: &str,
        advertised: Option<&str>,
    ) -> Result<(), PeerError> {
        if lock(&self.shared.socket).is_some() {
            return Err(PeerError::AlreadyConnected);
        }

        let url = format!("wss://{}/{}", addr, self.shared.network_id);
        let mut request = url
            .into_client_request()
            .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(
            NONCE_HEADER,
            HeaderValue::from_str(nonce).map_err(|e| PeerError::ConnectionFailed(e.to_string()))?,
        );
        if let Some(advertised) = advertised {
            headers.insert(
                ADDRESS_HEADER,
                HeaderValue::from_str(advertised)
                    .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?,
            );
        }

        let connector = Connector::Rustls(self.shared.tls.clone());
        let connecting = connect_async_tls_with_config(request, None, false, Some(connector));

        let stream = match timeout(CONNECT_TIMEOUT, connecting).await {
            Err(_) => return Err(PeerError::Timeout(addr.to_string())),
            Ok(Err(WsError::Http(response))) => return Err(PeerError::Rejected(response.status())),
            Ok(Err(e)) => return Err(PeerError::ConnectionFailed(e.to_string())),
            Ok(Ok((stream, _response))) => stream,
        };

        *lock(&self.shared.label) = addr.to_string();
        *lock(&self.shared.socket) = Some(PeerSocket::Outbound(Box::new(stream)));
        Ok(())
    }

    fn run(&self) {
        let Some(socket) = lock(&self.shared.socket).take() else {
            log::warn!("Peer {} has no connection to run", self.shared.label());
            self.shared.fire_close();
            return;
        };

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            shared.run_loop(socket).await;
            shared.fire_close();
        });
        *lock(&self.shared.task) = Some(handle);
    }

    fn on_close(&self, callback: CloseCallback) {
        let mut state = lock(&self.shared.close);
        if state.closed {
            drop(state);
            callback();
            return;
        }
        state.hooks.push(callback);
    }

    async fn shutdown(&self) {
        self.shared.cancel.cancel();

        let task = lock(&self.shared.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("Peer task for {} failed: {}", self.shared.label(), e);
            }
        }

        // never ran: drop the socket ourselves
        let socket = lock(&self.shared.socket).take();
        if let Some(mut socket) = socket {
            socket.close().await;
        }

        self.shared.fire_close();
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Builds [`WsPeer`]s sharing one address store and TLS client config
pub struct WsPeerFactory {
    network_id: String,
    peer_store: Arc<dyn PeerStorage>,
    tls: Arc<ClientConfig>,
}

impl WsPeerFactory {
    pub fn new(network_id: String, peer_store: Arc<dyn PeerStorage>, tls: Arc<ClientConfig>) -> Self {
        Self {
            network_id,
            peer_store,
            tls,
        }
    }
}

impl PeerFactory for WsPeerFactory {
    fn outbound(&self, intake: AddrIntake) -> PeerHandle {
        Arc::new(WsPeer::new(
            self.network_id.clone(),
            self.peer_store.clone(),
            intake,
            self.tls.clone(),
            "outbound".to_string(),
            None,
        ))
    }

    fn inbound(&self, socket: WebSocket, remote: SocketAddr, intake: AddrIntake) -> PeerHandle {
        Arc::new(WsPeer::new(
            self.network_id.clone(),
            self.peer_store.clone(),
            intake,
            self.tls.clone(),
            remote.to_string(),
            Some(PeerSocket::Inbound(socket)),
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================
