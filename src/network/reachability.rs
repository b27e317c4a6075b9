//! Reachability detection
//!
//! Works out our externally visible IP and whether arbitrary hosts can reach
//! us there. Runs once at startup; failures leave the node "closed".

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Services answering with our IP as plain text
pub const DEFAULT_IP_SERVICES: &[&str] = &[
    "http://ifconfig.me/ip",
    "http://icanhazip.com",
    "http://api.ipify.org",
    "http://checkip.amazonaws.com",
];

/// Per-service deadline
const SERVICE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ReachabilityError {
    #[error("No external IP service answered")]
    NoAnswers,
    #[error("External IP services disagree")]
    NoConsensus,
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Interface enumeration failed: {0}")]
    Interfaces(#[from] std::io::Error),
}

/// What we learned about our own reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reachability {
    /// Our external IP, if known
    pub external_ip: Option<IpAddr>,
    /// Whether outside hosts can connect to us
    pub open: bool,
}

/// Source of our externally visible IP
#[async_trait]
pub trait ExternalIpSource: Send + Sync {
    async fn external_ip(&self) -> Result<IpAddr, ReachabilityError>;
}

/// Asks several services at once and takes the majority answer
#[derive(Debug, Clone)]
pub struct ConsensusIpSource {
    services: Vec<String>,
}

impl ConsensusIpSource {
    pub fn new(services: Vec<String>) -> Self {
        Self { services }
    }
}

impl Default for ConsensusIpSource {
    fn default() -> Self {
        Self::new(DEFAULT_IP_SERVICES.iter().map(|s| s.to_string()).collect())
    }
}

#[async_trait]
impl ExternalIpSource for ConsensusIpSource {
    async fn external_ip(&self) -> Result<IpAddr, ReachabilityError> {
        let answers = join_all(self.services.iter().map(|service| async move {
            log::debug!("Trying to get external IP from {}", service);
            match timeout(SERVICE_TIMEOUT, http_get_body(service)).await {
                Ok(Ok(body)) => body.trim().parse::<IpAddr>().ok(),
                Ok(Err(e)) => {
                    log::debug!("Failed to get IP from {}: {}", service, e);
                    None
                }
                Err(_) => {
                    log::debug!("Timed out getting IP from {}", service);
                    None
                }
            }
        }))
        .await;

        majority(answers.into_iter().flatten())
    }
}

/// The most frequent IP; a tie for first place is no consensus
pub fn majority(answers: impl IntoIterator<Item = IpAddr>) -> Result<IpAddr, ReachabilityError> {
    let mut votes: HashMap<IpAddr, usize> = HashMap::new();
    for ip in answers {
        *votes.entry(ip).or_default() += 1;
    }

    let best = votes.values().copied().max().ok_or(ReachabilityError::NoAnswers)?;
    let mut leaders = votes.into_iter().filter(|(_, n)| *n == best);
    match (leaders.next(), leaders.next()) {
        (Some((ip, _)), None) => Ok(ip),
        _ => Err(ReachabilityError::NoConsensus),
    }
}

/// All addresses bound to local interfaces
pub fn local_addresses() -> Result<Vec<IpAddr>, ReachabilityError> {
    let ifaces = if_addrs::get_if_addrs()?;
    Ok(ifaces.into_iter().map(|iface| iface.ip()).collect())
}

/// Decide reachability from an IP lookup result.
///
/// With a pre-known IP (from port mapping) we're open iff it matches what the
/// outside sees. Without one we're open iff some local interface carries the
/// outside-visible IP. Failures are logged and leave us closed.
pub fn evaluate<F>(
    detected: Result<IpAddr, ReachabilityError>,
    known: Option<IpAddr>,
    local: F,
) -> Reachability
where
    F: FnOnce() -> Result<Vec<IpAddr>, ReachabilityError>,
{
    let external = match detected {
        Ok(ip) => ip,
        Err(e) => {
            log::error!("Error determining external IP: {}", e);
            return Reachability {
                external_ip: known,
                open: false,
            };
        }
    };
    log::info!("My external IP address is: {}", external);

    let open = match known {
        Some(known) => known == external,
        None => match local() {
            Ok(addrs) => addrs.contains(&external),
            Err(e) => {
                log::error!("Error checking for local IP match: {}", e);
                false
            }
        },
    };

    Reachability {
        external_ip: Some(external),
        open,
    }
}

/// Look up the external IP and evaluate against the real interface list
pub async fn detect(source: &dyn ExternalIpSource, known: Option<IpAddr>) -> Reachability {
    let detected = source.external_ip().await;
    evaluate(detected, known, local_addresses)
}

/// Minimal HTTP GET returning the response body
async fn http_get_body(url: &str) -> Result<String, ReachabilityError> {
    let url = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let (host, path) = url.split_once('/').unwrap_or((url, ""));
    let path = format!("/{}", path);

    let addr = format!("{}:80", host);
    let mut stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| ReachabilityError::Http(e.to_string()))?;

    let request = format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: peerd\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| ReachabilityError::Http(e.to_string()))?;

    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .map_err(|e| ReachabilityError::Http(e.to_string()))?;

    let status_ok = response
        .lines()
        .next()
        .map(|line| line.split_whitespace().nth(1) == Some("200"))
        .unwrap_or(false);
    if !status_ok {
        return Err(ReachabilityError::Http("Non-200 response".to_string()));
    }

    match response.find("\r\n\r\n") {
        Some(pos) => Ok(response[pos + 4..].to_string()),
        None => Err(ReachabilityError::Http("Invalid HTTP response".to_string())),
    }
}
