//! Peer manager
//!
//! Owns the connection sets and runs the control loop: works out our
//! reachability, starts discovery and the inbound listener, keeps outbound
//! connections topped up, and tears everything down on shutdown.

use crate::network::acceptor;
use crate::network::conn_set::{ConnectionSet, Direction};
use crate::network::discovery::{intake_channel, AddrIntake, DnsSeeder, SeedChannel, INTAKE_CAPACITY};
use crate::network::node::{NetworkIdentity, NodeConfig};
use crate::network::peer::{PeerError, PeerFactory};
use crate::network::reachability::{self, ConsensusIpSource, ExternalIpSource};
use crate::network::storage::{PeerStorage, StorageError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Outbound connection errors
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Too many peer connections, or already connected to {0}")]
    AtCapacity(String),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Where the manager is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// State shared between the control loop, the listener, and close callbacks
pub struct Core {
    pub(crate) config: NodeConfig,
    pub(crate) identity: NetworkIdentity,
    pub(crate) peer_store: Arc<dyn PeerStorage>,
    pub(crate) factory: Arc<dyn PeerFactory>,
    pub(crate) inbound: Arc<ConnectionSet>,
    pub(crate) outbound: Arc<ConnectionSet>,
    pub(crate) intake: AddrIntake,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: TaskTracker,
    state: watch::Sender<LifecycleState>,
}

/// Everything moved into the control task when it starts
struct Startup {
    intake_rx: mpsc::Receiver<String>,
    irc: Option<Box<dyn SeedChannel>>,
    ip_source: Arc<dyn ExternalIpSource>,
    dns: DnsSeeder,
}

/// Port to announce on the IRC seed channel; 0 means we don't take inbound peers
pub fn irc_advertised_port(open: bool, accept: bool, port: u16) -> u16 {
    if open && accept {
        port
    } else {
        0
    }
}

impl Core {
    fn new(
        config: NodeConfig,
        peer_store: Arc<dyn PeerStorage>,
        factory: Arc<dyn PeerFactory>,
        intake: AddrIntake,
    ) -> Self {
        let identity =
            NetworkIdentity::new(config.network_id.clone(), config.port, config.external_ip);
        let (state, _) = watch::channel(LifecycleState::Starting);

        Self {
            inbound: Arc::new(ConnectionSet::new(Direction::Inbound, config.max_inbound)),
            outbound: Arc::new(ConnectionSet::new(Direction::Outbound, config.max_outbound)),
            config,
            identity,
            peer_store,
            factory,
            intake,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            state,
        }
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.send_replace(state);
    }

    /// Top up outbound connections from storage
    pub async fn connect_to_peers(&self) -> Result<(), ConnectError> {
        if let Some(peer) = &self.config.peer {
            if self.outbound.count() != 0 {
                // only connect to the explicitly requested peer once
                return Ok(());
            }

            log::info!("Attempting to connect to: {}", peer);
            if let Err(e) = self.connect(peer).await {
                log::warn!("Error connecting to peer: {}, {}", peer, e);
                return Err(e);
            }
            log::info!("Connected to peer: {}", peer);
            return Ok(());
        }

        // otherwise try to keep us maximally connected
        let want = self.outbound.max().saturating_sub(self.outbound.count());
        if want == 0 {
            return Ok(());
        }

        let addrs = self.peer_store.get(want).await?;
        for addr in addrs {
            log::info!("Attempting to connect to: {}", addr);
            match self.connect(&addr).await {
                Ok(()) => log::info!("Connected to peer: {}", addr),
                Err(e) => log::warn!("Error connecting to peer: {}", e),
            }
        }
        Ok(())
    }

    /// Dial one peer, tracking it in the outbound set
    async fn connect(&self, addr: &str) -> Result<(), ConnectError> {
        let peer = self.factory.outbound(self.intake.clone());

        if !self.outbound.try_add(addr, peer.clone()) {
            return Err(ConnectError::AtCapacity(addr.to_string()));
        }

        let advertised = self.identity.advertised_address();
        if let Err(e) = peer
            .connect(addr, self.identity.nonce(), advertised.as_deref())
            .await
        {
            self.outbound.remove(addr);
            return Err(e.into());
        }

        let outbound = self.outbound.clone();
        let key = addr.to_string();
        let handle = peer.clone();
        peer.on_close(Box::new(move || {
            outbound.release(&key, &handle);
        }));
        peer.run();

        Ok(())
    }

    /// Validate, store, and try connecting to a discovered address
    async fn handle_discovered(&self, addr: &str) {
        log::info!("Discovered peer: {}", addr);

        let resolved = match self.identity.validator().parse_peer_address(addr).await {
            Ok(resolved) => resolved.to_string(),
            Err(e) => {
                log::warn!("Peer address invalid: {}", e);
                return;
            }
        };

        log::info!("Storing peer as: {}", resolved);
        if let Err(e) = self.peer_store.store(&resolved).await {
            log::error!("Error saving peer: {}, address: {}", e, resolved);
            return;
        }

        if let Err(e) = self.connect_to_peers().await {
            log::warn!("Error connecting to peers: {}", e);
        }
    }

    async fn start_irc(&self, irc: Option<Box<dyn SeedChannel>>) -> Option<Box<dyn SeedChannel>> {
        if !self.config.irc {
            return None;
        }
        let Some(mut irc) = irc else {
            log::warn!("IRC seeding enabled but no seed channel is configured");
            return None;
        };

        let port = irc_advertised_port(
            self.identity.is_open(),
            self.config.accept,
            self.identity.port(),
        );
        match irc
            .connect(self.identity.network_id(), port, self.intake.clone())
            .await
        {
            Ok(()) => {
                irc.run();
                Some(irc)
            }
            Err(e) => {
                log::error!("IRC seeding failed: {}", e);
                None
            }
        }
    }

    async fn seed_from_dns(&self, dns: &DnsSeeder) {
        match dns.query().await {
            Ok(addrs) => {
                for addr in addrs {
                    log::info!("Got peer address from DNS: {}", addr);
                    self.intake.offer(addr);
                }
            }
            Err(e) => log::error!("Error from DNS query: {}", e),
        }
    }

    /// The control loop, from startup until shutdown is requested
    async fn supervise(self: Arc<Self>, startup: Startup) {
        let Startup {
            mut intake_rx,
            irc,
            ip_source,
            dns,
        } = startup;

        let reachability = reachability::detect(ip_source.as_ref(), self.config.external_ip).await;
        self.identity.set_reachability(reachability);
        if !reachability.open {
            log::info!("Not reachable from outside, won't advertise our address");
        }

        let mut irc_channel = None;
        if let Some(peer) = &self.config.peer {
            // store the explicitly specified outbound peer
            if let Err(e) = self.peer_store.store(peer).await {
                log::error!("Error saving peer: {}, address: {}", e, peer);
            }
        } else {
            irc_channel = self.start_irc(irc).await;
            self.seed_from_dns(&dns).await;
        }

        let listener_stop = CancellationToken::new();
        if self.config.accept {
            let core = self.clone();
            let stop = listener_stop.clone();
            self.tasks.spawn(async move {
                if let Err(e) = acceptor::accept_connections(core, stop).await {
                    log::error!("Inbound listener stopped: {}", e);
                }
            });
        }

        if let Err(e) = self.connect_to_peers().await {
            log::warn!("Error connecting to peers: {}", e);
        }

        self.set_state(LifecycleState::Running);

        let period = self.config.reconnect_interval;
        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                Some(addr) = intake_rx.recv() => {
                    self.handle_discovered(&addr).await;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.connect_to_peers().await {
                        log::warn!("Error connecting to peers: {}", e);
                    }
                }
            }
        }

        self.set_state(LifecycleState::ShuttingDown);
        log::info!("Peer manager shutting down...");

        if let Some(mut irc) = irc_channel {
            irc.shutdown().await;
        }
        listener_stop.cancel();
    }
}

/// Manages inbound and outbound peer connections on behalf of the node
pub struct PeerManager {
    core: Arc<Core>,
    startup: Mutex<Option<Startup>>,
    stopping: AtomicBool,
}

impl PeerManager {
    pub fn new(
        config: NodeConfig,
        peer_store: Arc<dyn PeerStorage>,
        factory: Arc<dyn PeerFactory>,
    ) -> Self {
        let (intake, intake_rx) = intake_channel(INTAKE_CAPACITY);
        let dns = DnsSeeder::new(config.dns_seeds.clone());
        let core = Arc::new(Core::new(config, peer_store, factory, intake));

        Self {
            core,
            startup: Mutex::new(Some(Startup {
                intake_rx,
                irc: None,
                ip_source: Arc::new(ConsensusIpSource::default()),
                dns,
            })),
            stopping: AtomicBool::new(false),
        }
    }

    fn with_startup(self, f: impl FnOnce(&mut Startup)) -> Self {
        if let Some(startup) = self
            .startup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            f(startup);
        }
        self
    }

    /// Use this IRC seed channel when IRC seeding is enabled
    pub fn with_irc(self, irc: Box<dyn SeedChannel>) -> Self {
        self.with_startup(|s| s.irc = Some(irc))
    }

    /// Replace the external IP consensus source
    pub fn with_ip_source(self, ip_source: Arc<dyn ExternalIpSource>) -> Self {
        self.with_startup(|s| s.ip_source = ip_source)
    }

    pub fn identity(&self) -> &NetworkIdentity {
        &self.core.identity
    }

    /// Sender side of the discovery intake, for extra address sources
    pub fn intake(&self) -> AddrIntake {
        self.core.intake.clone()
    }

    pub fn state(&self) -> LifecycleState {
        *self.core.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.core.state.subscribe()
    }

    pub fn inbound_count(&self) -> usize {
        self.core.inbound.count()
    }

    pub fn outbound_count(&self) -> usize {
        self.core.outbound.count()
    }

    /// Top up outbound connections now
    pub async fn connect_to_peers(&self) -> Result<(), ConnectError> {
        self.core.connect_to_peers().await
    }

    /// Start the control loop in the background
    pub fn run(&self) {
        let startup = self
            .startup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(startup) = startup else {
            log::warn!("Peer manager already started");
            return;
        };

        let core = self.core.clone();
        self.core.tasks.spawn(core.supervise(startup));
    }

    /// Stop the control loop, wait for its tasks, and shut down every peer
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        self.core.shutdown.cancel();
        self.core.tasks.close();
        self.core.tasks.wait().await;

        // no lock is held while peers tear down; their close hooks empty the sets
        let mut peers = self.core.outbound.snapshot();
        peers.extend(self.core.inbound.snapshot());
        for peer in peers {
            peer.shutdown().await;
        }

        // anything admitted after the snapshot
        let mut stragglers = self.core.outbound.drain();
        stragglers.extend(self.core.inbound.drain());
        for peer in stragglers {
            peer.shutdown().await;
        }

        self.core.set_state(LifecycleState::Stopped);
        log::info!("Peer manager shutdown");
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }
}
