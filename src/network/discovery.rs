//! Peer discovery sources
//!
//! Every source (DNS seeds, the IRC seed channel, peer gossip) feeds raw
//! address strings into one bounded intake queue drained by the manager:
//! - DNS seed resolution, once at startup
//! - IRC channel seeding, for the life of the node
//! - Address gossip from connected peers

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::lookup_host;
use tokio::sync::mpsc;

// =============================================================================
// Constants
// =============================================================================

/// Intake queue depth
pub const INTAKE_CAPACITY: usize = 10_000;

/// Default DNS seeds (`host:port`). Empty until the network has public seeds;
/// `NodeConfig::default()` starts from this list and `--dns-seed` replaces it.
pub const DEFAULT_DNS_SEEDS: &[&str] = &[];

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("All {0} DNS seeds failed to resolve")]
    DnsFailed(usize),
    #[error("Seed channel error: {0}")]
    Channel(String),
}

// =============================================================================
// Intake Queue
// =============================================================================

/// Sending side of the discovery intake queue.
///
/// When the queue is full new items are rejected, never older ones evicted.
#[derive(Clone, Debug)]
pub struct AddrIntake {
    tx: mpsc::Sender<String>,
}

impl AddrIntake {
    /// Offer an address; returns false if it was dropped
    pub fn offer(&self, addr: impl Into<String>) -> bool {
        match self.tx.try_send(addr.into()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(addr)) => {
                log::warn!("Discovery intake full, dropping address: {}", addr);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Create an intake queue of the given depth
pub fn intake_channel(capacity: usize) -> (AddrIntake, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(capacity);
    (AddrIntake { tx }, rx)
}

// =============================================================================
// IRC Seed Channel
// =============================================================================

/// A chat-channel based seed service.
///
/// Joins a channel derived from the network id, announces our port (0 means
/// "not accepting inbound") and forwards peers it sees into the intake.
#[async_trait]
pub trait SeedChannel: Send {
    async fn connect(
        &mut self,
        network_id: &str,
        port: u16,
        intake: AddrIntake,
    ) -> Result<(), DiscoveryError>;

    /// Start forwarding in the background
    fn run(&mut self);

    async fn shutdown(&mut self);
}

// =============================================================================
// DNS Seeds
// =============================================================================

/// Resolves the configured seed names into peer addresses
#[derive(Debug, Clone, Default)]
pub struct DnsSeeder {
    seeds: Vec<String>,
}

impl DnsSeeder {
    pub fn new(seeds: Vec<String>) -> Self {
        Self { seeds }
    }

    pub fn defaults() -> Self {
        Self::new(DEFAULT_DNS_SEEDS.iter().map(|s| s.to_string()).collect())
    }

    pub fn seeds(&self) -> &[String] {
        &self.seeds
    }

    /// Resolve every seed. Fails only if every seed fails.
    pub async fn query(&self) -> Result<Vec<String>, DiscoveryError> {
        let mut addrs = Vec::new();
        let mut failures = 0;

        for seed in &self.seeds {
            log::info!("Resolving DNS seed: {}", seed);

            match lookup_host(seed.as_str()).await {
                Ok(resolved) => {
                    addrs.extend(resolved.map(|sa| sa.to_string()));
                }
                Err(e) => {
                    log::warn!("Failed to resolve DNS seed {}: {}", seed, e);
                    failures += 1;
                }
            }
        }

        if failures > 0 && failures == self.seeds.len() {
            return Err(DiscoveryError::DnsFailed(failures));
        }

        Ok(addrs)
    }
}

// =============================================================================
// Tests
// =============================================================================
