//! Test doubles for the peer, factory, IP source, and seed channel seams

use crate::network::discovery::{AddrIntake, DiscoveryError, SeedChannel};
use crate::network::peer::{CloseCallback, Peer, PeerError, PeerFactory, PeerHandle};
use crate::network::reachability::{ExternalIpSource, ReachabilityError};
use async_trait::async_trait;
use axum::extract::ws::WebSocket;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Dialled {
    addr: Option<String>,
    nonce: Option<String>,
    advertised: Option<String>,
}

/// A peer that records what's done to it
#[derive(Default)]
pub struct MockPeer {
    fail_connect: bool,
    connects: AtomicUsize,
    runs: AtomicUsize,
    shutdowns: AtomicUsize,
    dialled: Mutex<Dialled>,
    closed: AtomicBool,
    hooks: Mutex<Vec<CloseCallback>>,
}

impl MockPeer {
    pub fn new(fail_connect: bool) -> Self {
        Self {
            fail_connect,
            ..Self::default()
        }
    }

    pub fn handle() -> PeerHandle {
        Arc::new(Self::new(false))
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn dialled(&self) -> Option<String> {
        self.dialled.lock().unwrap().addr.clone()
    }

    pub fn nonce(&self) -> Option<String> {
        self.dialled.lock().unwrap().nonce.clone()
    }

    pub fn advertised(&self) -> Option<String> {
        self.dialled.lock().unwrap().advertised.clone()
    }

    /// Simulate the connection dropping
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap());
        for hook in hooks {
            hook();
        }
    }
}

#[async_trait]
impl Peer for MockPeer {
    async fn connect(
        &self,
        addr: &str,
        nonce: &str,
        advertised: Option<&str>,
    ) -> Result<(), PeerError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.dialled.lock().unwrap() = Dialled {
            addr: Some(addr.to_string()),
            nonce: Some(nonce.to_string()),
            advertised: advertised.map(str::to_string),
        };
        if self.fail_connect {
            return Err(PeerError::ConnectionFailed("refused".to_string()));
        }
        Ok(())
    }

    fn run(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&self, callback: CloseCallback) {
        if self.closed.load(Ordering::SeqCst) {
            callback();
            return;
        }
        self.hooks.lock().unwrap().push(callback);
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.close();
    }
}

/// Hands out mock peers and keeps them for inspection
#[derive(Default)]
pub struct MockFactory {
    fail_connect: bool,
    peers: Mutex<Vec<Arc<MockPeer>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every peer from this factory fails its handshake
    pub fn failing() -> Self {
        Self {
            fail_connect: true,
            ..Self::default()
        }
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn outbound_created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    fn make(&self) -> PeerHandle {
        let peer = Arc::new(MockPeer::new(self.fail_connect));
        self.peers.lock().unwrap().push(peer.clone());
        peer
    }
}

impl PeerFactory for MockFactory {
    fn outbound(&self, _intake: AddrIntake) -> PeerHandle {
        self.make()
    }

    fn inbound(&self, _socket: WebSocket, _remote: SocketAddr, _intake: AddrIntake) -> PeerHandle {
        self.make()
    }
}

/// An external IP source with a canned answer
pub struct FixedIpSource(Option<IpAddr>);

impl FixedIpSource {
    pub fn answering(ip: &str) -> Self {
        Self(Some(ip.parse().unwrap()))
    }

    pub fn failing() -> Self {
        Self(None)
    }
}

#[async_trait]
impl ExternalIpSource for FixedIpSource {
    async fn external_ip(&self) -> Result<IpAddr, ReachabilityError> {
        self.0.ok_or(ReachabilityError::NoAnswers)
    }
}

/// What a [`MockSeedChannel`] saw
#[derive(Default)]
pub struct SeedRecord {
    port: Mutex<Option<u16>>,
    runs: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl SeedRecord {
    pub fn port(&self) -> Option<u16> {
        *self.port.lock().unwrap()
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

/// A seed channel that "sees" a fixed list of peers as soon as it joins
pub struct MockSeedChannel {
    addrs: Vec<String>,
    record: Arc<SeedRecord>,
}

impl MockSeedChannel {
    pub fn new(addrs: Vec<String>) -> Self {
        Self {
            addrs,
            record: Arc::new(SeedRecord::default()),
        }
    }

    pub fn record(&self) -> Arc<SeedRecord> {
        self.record.clone()
    }
}

#[async_trait]
impl SeedChannel for MockSeedChannel {
    async fn connect(
        &mut self,
        _network_id: &str,
        port: u16,
        intake: AddrIntake,
    ) -> Result<(), DiscoveryError> {
        *self.record.port.lock().unwrap() = Some(port);
        for addr in &self.addrs {
            intake.offer(addr.clone());
        }
        Ok(())
    }

    fn run(&mut self) {
        self.record.runs.fetch_add(1, Ordering::SeqCst);
    }

    async fn shutdown(&mut self) {
        self.record.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}
