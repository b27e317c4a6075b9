//! Capacity-bounded connection sets
//!
//! The inbound and outbound sets are the only shared mutable state with
//! concurrent writers. Nothing outside this module touches the map directly.

use crate::network::peer::PeerHandle;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Maximum number of outbound connections
pub const MAX_OUTBOUND: usize = 8;

/// Maximum number of inbound connections
pub const MAX_INBOUND: usize = 128;

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "Inbound"),
            Direction::Outbound => write!(f, "Outbound"),
        }
    }
}

/// Address-keyed set of live peers with a hard size limit
pub struct ConnectionSet {
    direction: Direction,
    max: usize,
    peers: RwLock<HashMap<String, PeerHandle>>,
}

impl ConnectionSet {
    pub fn new(direction: Direction, max: usize) -> Self {
        Self {
            direction,
            max,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Admit a peer if there's room and the address isn't already tracked
    pub fn try_add(&self, addr: &str, peer: PeerHandle) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        if peers.len() >= self.max {
            // too many connections
            return false;
        }
        if peers.contains_key(addr) {
            // already connected
            return false;
        }
        peers.insert(addr.to_string(), peer);
        log::info!("{} peer count: {}", self.direction, peers.len());
        true
    }

    /// Delete the entry for `addr` if present
    pub fn remove(&self, addr: &str) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        peers.remove(addr);
        log::info!("{} peer count: {}", self.direction, peers.len());
    }

    /// Delete the entry for `addr` only if it still holds `peer`.
    ///
    /// Returns whether anything was removed.
    pub fn release(&self, addr: &str, peer: &PeerHandle) -> bool {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        let same = peers
            .get(addr)
            .map(|current| Arc::ptr_eq(current, peer))
            .unwrap_or(false);
        if same {
            peers.remove(addr);
        }
        log::info!("{} peer count: {}", self.direction, peers.len());
        same
    }

    pub fn contains(&self, addr: &str) -> bool {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        peers.contains_key(addr)
    }

    pub fn count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        peers.len()
    }

    /// Point-in-time copy of the tracked handles.
    ///
    /// The lock is released before returning, so callers may block on the handles.
    pub fn snapshot(&self) -> Vec<PeerHandle> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        peers.values().cloned().collect()
    }

    /// Remove every entry, returning the handles for teardown outside the lock
    pub fn drain(&self) -> Vec<PeerHandle> {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        let drained: Vec<PeerHandle> = peers.drain().map(|(_, peer)| peer).collect();
        log::info!("{} peer count: {}", self.direction, peers.len());
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::MockPeer;

    #[test]
    fn test_capacity_limit() {
        let set = ConnectionSet::new(Direction::Outbound, 2);

        assert!(set.try_add("1.1.1.1:8831", MockPeer::handle()));
        assert!(set.try_add("8.8.8.8:8831", MockPeer::handle()));
        assert!(!set.try_add("9.9.9.9:8831", MockPeer::handle()));

        assert_eq!(set.count(), 2);
        assert!(!set.contains("9.9.9.9:8831"));
    }

    #[test]
    fn test_duplicate_rejected() {
        let set = ConnectionSet::new(Direction::Outbound, MAX_OUTBOUND);

        assert!(set.try_add("8.8.8.8:8831", MockPeer::handle()));
        assert!(!set.try_add("8.8.8.8:8831", MockPeer::handle()));
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn test_remove_idempotent() {
        let set = ConnectionSet::new(Direction::Inbound, MAX_INBOUND);
        set.try_add("8.8.8.8:50000", MockPeer::handle());

        set.remove("8.8.8.8:50000");
        set.remove("8.8.8.8:50000");

        assert_eq!(set.count(), 0);
        assert!(set.try_add("8.8.8.8:50000", MockPeer::handle()));
    }

    #[test]
    fn test_release_ignores_stale_handle() {
        let set = ConnectionSet::new(Direction::Outbound, MAX_OUTBOUND);
        let old = MockPeer::handle();
        let new = MockPeer::handle();

        set.try_add("8.8.8.8:8831", old.clone());
        assert!(set.release("8.8.8.8:8831", &old));
        set.try_add("8.8.8.8:8831", new.clone());

        // a late close notification from the old connection
        assert!(!set.release("8.8.8.8:8831", &old));
        assert!(set.contains("8.8.8.8:8831"));

        assert!(set.release("8.8.8.8:8831", &new));
        assert_eq!(set.count(), 0);
    }

    #[test]
    fn test_snapshot() {
        let set = ConnectionSet::new(Direction::Inbound, MAX_INBOUND);
        set.try_add("1.1.1.1:1", MockPeer::handle());
        set.try_add("1.1.1.1:2", MockPeer::handle());

        let snapshot = set.snapshot();
        set.remove("1.1.1.1:1");

        assert_eq!(snapshot.len(), 2);
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn test_drain() {
        let set = ConnectionSet::new(Direction::Outbound, MAX_OUTBOUND);
        let peer = MockPeer::handle();
        set.try_add("8.8.8.8:8831", peer.clone());
        set.try_add("1.1.1.1:8831", MockPeer::handle());

        assert_eq!(set.drain().len(), 2);
        assert_eq!(set.count(), 0);
        // a close notification after draining is a no-op
        assert!(!set.release("8.8.8.8:8831", &peer));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_never_overshoots() {
        let set = Arc::new(ConnectionSet::new(Direction::Outbound, MAX_OUTBOUND));

        let mut tasks = Vec::new();
        for i in 0..64 {
            let set = set.clone();
            tasks.push(tokio::spawn(async move {
                let addr = format!("8.8.{}.{}:8831", i % 4, i);
                let added = set.try_add(&addr, MockPeer::handle());
                assert!(set.count() <= MAX_OUTBOUND);
                added
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, MAX_OUTBOUND);
        assert_eq!(set.count(), MAX_OUTBOUND);
    }
}
