//! Inbound peer listener
//!
//! Serves a single WebSocket route, `/<network id>`, over TLS. Requests are
//! screened on their headers before the upgrade, and the upgraded socket is
//! handed to the peer factory and tracked in the inbound set.

use crate::network::manager::Core;
use crate::network::peer::{ADDRESS_HEADER, NONCE_HEADER};
use crate::network::tls::{self, TlsError};
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::connect_info::Connected;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::serve::IncomingStream;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;

/// Limit on reading request headers and writing the response
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Limit on the TLS handshake for a fresh connection
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Back-off after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum AcceptorError {
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

/// A TCP listener that only yields connections which finished a TLS handshake
pub struct TlsListener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    pub fn new(tcp: TcpListener, acceptor: TlsAcceptor) -> Self {
        Self { tcp, acceptor }
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, remote) = match self.tcp.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("Error accepting connection: {}", e);
                    sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            match timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(stream)).await {
                Ok(Ok(tls)) => return (tls, remote),
                Ok(Err(e)) => log::debug!("TLS handshake with {} failed: {}", remote, e),
                Err(_) => log::debug!("TLS handshake with {} timed out", remote),
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.tcp.local_addr()
    }
}

/// Remote socket address of a connection accepted by [`TlsListener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub SocketAddr);

impl Connected<IncomingStream<'_, TlsListener>> for RemoteAddr {
    fn connect_info(stream: IncomingStream<'_, TlsListener>) -> Self {
        Self(*stream.remote_addr())
    }
}

/// Generate fresh TLS material and bind the listen socket
pub async fn bind(core: &Core, addr: SocketAddr) -> Result<TlsListener, AcceptorError> {
    log::info!("Generating TLS certificate and key");
    let material = tls::generate_self_signed(&core.config.data_dir)?;
    let config = tls::server_config(&material)?;

    let tcp = TcpListener::bind(addr)
        .await
        .map_err(|source| AcceptorError::Bind { addr, source })?;

    Ok(TlsListener::new(tcp, TlsAcceptor::from(config)))
}

/// Serve peer upgrades on `listener` until `stop` is cancelled
pub async fn serve(
    core: Arc<Core>,
    listener: TlsListener,
    stop: CancellationToken,
) -> Result<(), AcceptorError> {
    let route = format!("/{}", core.identity.network_id());
    let app = Router::new()
        .route(&route, get(peer_handler))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(core);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<RemoteAddr>(),
    )
    .with_graceful_shutdown(async move { stop.cancelled().await })
    .await
    .map_err(AcceptorError::Serve)?;

    log::info!("Listener shutdown");
    Ok(())
}

/// Run the inbound listener on all interfaces at the configured port
pub async fn accept_connections(core: Arc<Core>, stop: CancellationToken) -> Result<(), AcceptorError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], core.identity.port()));
    let listener = bind(&core, addr).await?;
    log::info!("Listening for new peer connections on {}", addr);
    serve(core, listener, stop).await
}

/// Decide whether an upgrade request may proceed.
///
/// Rejects our own nonce with 508 and a declared address we already hold an
/// outbound connection to with 429. A valid declared address is stored.
pub async fn screen_request(
    core: &Core,
    nonce: Option<&str>,
    declared: Option<&str>,
) -> Result<(), StatusCode> {
    if nonce == Some(core.identity.nonce()) {
        log::info!("Received connection with our own nonce");
        return Err(StatusCode::LOOP_DETECTED);
    }

    let Some(declared) = declared.filter(|d| !d.is_empty()) else {
        return Ok(());
    };

    let addr = match core.identity.validator().parse_peer_address(declared).await {
        Ok(addr) => addr.to_string(),
        Err(e) => {
            log::warn!("Peer address in header is invalid: {}", e);
            return Ok(());
        }
    };

    if core.outbound.contains(&addr) {
        log::info!("Already connected to {}, not accepting inbound connection", addr);
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    // they've told us their address and it's reachable
    log::info!("Peer {} supports inbound connections, storing", addr);
    if let Err(e) = core.peer_store.store(&addr).await {
        log::error!("Error saving peer: {}, address: {}", e, addr);
    }

    Ok(())
}

async fn peer_handler(
    State(core): State<Arc<Core>>,
    ConnectInfo(RemoteAddr(remote)): ConnectInfo<RemoteAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let nonce = headers.get(NONCE_HEADER).and_then(|v| v.to_str().ok());
    let declared = headers.get(ADDRESS_HEADER).and_then(|v| v.to_str().ok());

    if let Err(status) = screen_request(&core, nonce, declared).await {
        return status.into_response();
    }

    let tasks = core.tasks.clone();
    ws.on_upgrade(move |socket| tasks.track_future(admit(core, socket, remote)))
}

/// Track an upgraded socket in the inbound set and start its peer
async fn admit(core: Arc<Core>, socket: WebSocket, remote: SocketAddr) {
    let peer = core.factory.inbound(socket, remote, core.intake.clone());

    if core.shutdown.is_cancelled() {
        peer.shutdown().await;
        return;
    }

    let key = remote.to_string();
    if !core.inbound.try_add(&key, peer.clone()) {
        log::info!("Too many inbound connections, dropping {}", key);
        peer.shutdown().await;
        return;
    }

    log::info!("New peer connection from: {}", key);

    let inbound = core.inbound.clone();
    let handle = peer.clone();
    peer.on_close(Box::new(move || {
        inbound.release(&key, &handle);
    }));
    peer.run();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::discovery::intake_channel;
    use crate::network::manager::PeerManager;
    use crate::network::node::NodeConfig;
    use crate::network::peer::{PeerError, PeerFactory};
    use crate::network::reachability::Reachability;
    use crate::network::storage::MemoryPeerStore;
    use crate::network::testing::{MockFactory, MockPeer};
    use crate::network::ws_peer::WsPeerFactory;

    fn manager(data_dir: &std::path::Path, factory: Arc<MockFactory>) -> PeerManager {
        let config = NodeConfig {
            data_dir: data_dir.to_path_buf(),
            ..NodeConfig::default()
        };
        PeerManager::new(config, Arc::new(MemoryPeerStore::new()), factory)
    }

    #[tokio::test]
    async fn test_own_nonce_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(MockFactory::new()));
        let core = manager.core();
        let nonce = core.identity.nonce().to_string();

        assert_eq!(
            screen_request(core, Some(nonce.as_str()), Some("8.8.8.8:8831")).await,
            Err(StatusCode::LOOP_DETECTED)
        );
        assert_eq!(screen_request(core, Some("1"), None).await, Ok(()));
        assert_eq!(screen_request(core, None, None).await, Ok(()));
    }

    #[tokio::test]
    async fn test_duplicate_of_outbound_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(MockFactory::new()));
        let core = manager.core();
        core.outbound.try_add("8.8.8.8:8831", MockPeer::handle());

        assert_eq!(
            screen_request(core, Some("1"), Some("8.8.8.8:8831")).await,
            Err(StatusCode::TOO_MANY_REQUESTS)
        );
        assert!(core.peer_store.get(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_outbound_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(MockFactory::new()));
        let core = manager.core();
        core.outbound.try_add("8.8.8.8:8831", MockPeer::handle());

        assert_eq!(
            screen_request(core, Some("1"), Some("1.1.1.1:8831")).await,
            Ok(())
        );
        assert_eq!(
            core.peer_store.get(10).await.unwrap(),
            vec!["1.1.1.1:8831".to_string()]
        );
    }

    #[tokio::test]
    async fn test_mapped_declaration_matches_outbound() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(MockFactory::new()));
        let core = manager.core();
        core.outbound.try_add("8.8.8.8:8831", MockPeer::handle());

        assert_eq!(
            screen_request(core, Some("1"), Some("[::ffff:8.8.8.8]:8831")).await,
            Err(StatusCode::TOO_MANY_REQUESTS)
        );
    }

    #[tokio::test]
    async fn test_declared_address_stored() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(MockFactory::new()));
        let core = manager.core();

        assert_eq!(
            screen_request(core, Some("1"), Some("8.8.4.4:8831")).await,
            Ok(())
        );
        // invalid declarations are ignored, not fatal
        assert_eq!(
            screen_request(core, Some("1"), Some("192.168.1.2:8831")).await,
            Ok(())
        );
        assert_eq!(
            screen_request(core, Some("1"), Some("not an address")).await,
            Ok(())
        );

        assert_eq!(
            core.peer_store.get(10).await.unwrap(),
            vec!["8.8.4.4:8831".to_string()]
        );
    }

    #[tokio::test]
    async fn test_declared_self_address_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(MockFactory::new()));
        let core = manager.core();
        core.identity.set_reachability(Reachability {
            external_ip: Some("203.0.113.5".parse().unwrap()),
            open: true,
        });

        assert_eq!(
            screen_request(core, Some("1"), Some("203.0.113.5:8831")).await,
            Ok(())
        );
        assert!(core.peer_store.get(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inbound_over_tls() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(MockFactory::new());
        let manager = manager(dir.path(), factory.clone());
        let core = manager.core().clone();

        let listener = bind(&core, SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = axum::serve::Listener::local_addr(&listener).unwrap().to_string();
        let stop = CancellationToken::new();
        let server = tokio::spawn(serve(core.clone(), listener, stop.clone()));

        let dialer = WsPeerFactory::new(
            core.identity.network_id().to_string(),
            Arc::new(MemoryPeerStore::new()),
            tls::client_config().unwrap(),
        );
        let (intake, _rx) = intake_channel(16);

        // dialling ourselves
        let looped = dialer.outbound(intake.clone());
        let err = looped
            .connect(&addr, core.identity.nonce(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Rejected(StatusCode::LOOP_DETECTED)));

        let peer = dialer.outbound(intake);
        peer.connect(&addr, "1", None).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while core.inbound.count() != 1 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(factory.peers()[0].runs(), 1);

        // the mock dropped its socket; closing it releases the slot
        factory.peers()[0].close();
        assert_eq!(core.inbound.count(), 0);

        peer.shutdown().await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
