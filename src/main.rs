//! peerd: runs the peer manager on its own
//!
//! Connects to the network, accepts inbound peers, and logs what it's doing
//! until interrupted.

use clap::Parser;
use peer_manager::network::{
    tls, MemoryPeerStore, NodeConfig, PeerManager, UpnpManager, WsPeerFactory, DEFAULT_NETWORK_ID,
    DEFAULT_PORT, MAX_INBOUND, MAX_OUTBOUND,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "peerd")]
#[command(version = "0.1.0")]
#[command(about = "P2P peer connection manager", long_about = None)]
struct Cli {
    /// Data directory (TLS certificate and key are written here)
    #[arg(short, long, default_value = ".peerd_data")]
    data_dir: PathBuf,

    /// Port to listen for inbound peers on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Connect only to this peer (host:port), skipping discovery
    #[arg(long)]
    peer: Option<String>,

    /// Don't accept inbound connections
    #[arg(long)]
    no_accept: bool,

    /// Use IRC seeding
    #[arg(long)]
    irc: bool,

    /// Our external IP, if already known
    #[arg(long)]
    external_ip: Option<IpAddr>,

    /// Map the listen port on the local gateway with UPnP
    #[arg(long)]
    upnp: bool,

    /// DNS seed (host:port); may be given more than once. Without any,
    /// the built-in seed list is used, and it is currently empty.
    #[arg(long = "dns-seed")]
    dns_seeds: Vec<String>,

    /// Network identifier (genesis block id)
    #[arg(long, default_value = DEFAULT_NETWORK_ID)]
    network_id: String,

    /// Maximum outbound connections
    #[arg(long, default_value_t = MAX_OUTBOUND)]
    max_outbound: usize,

    /// Maximum inbound connections
    #[arg(long, default_value_t = MAX_INBOUND)]
    max_inbound: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let accept = !cli.no_accept;

    // UPnP
    let mut upnp = if cli.upnp && accept {
        UpnpManager::new()
    } else {
        UpnpManager::disabled()
    };
    let mut external_ip = cli.external_ip;
    if upnp.is_enabled() {
        match upnp.setup(cli.port).await {
            Ok(ip) => {
                log::info!("UPnP external IP: {}", ip);
                external_ip = external_ip.or(Some(ip));
                upnp.start_renewal_task();
            }
            Err(e) => log::warn!("UPnP setup failed: {}", e),
        }
    }

    if cli.irc {
        log::warn!("IRC seeding requested but this build has no IRC client");
    }

    let mut config = NodeConfig {
        data_dir: cli.data_dir,
        network_id: cli.network_id,
        peer: cli.peer,
        port: cli.port,
        accept,
        irc: cli.irc,
        external_ip,
        max_outbound: cli.max_outbound,
        max_inbound: cli.max_inbound,
        ..NodeConfig::default()
    };
    if !cli.dns_seeds.is_empty() {
        config.dns_seeds = cli.dns_seeds;
    }
    if config.dns_seeds.is_empty() {
        log::warn!("No DNS seeds configured; pass --dns-seed to bootstrap");
    }

    let store = Arc::new(MemoryPeerStore::new());
    let factory = Arc::new(WsPeerFactory::new(
        config.network_id.clone(),
        store.clone(),
        tls::client_config()?,
    ));

    let manager = PeerManager::new(config, store, factory);
    log::info!("Our nonce: {}", manager.identity().nonce());
    manager.run();

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down...");

    manager.shutdown().await;
    upnp.cleanup().await;

    Ok(())
}
