//! Peer address storage
//!
//! The manager only needs to store addresses and fetch a handful back.
//! How addresses are chosen is up to the store.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use thiserror::Error;
use tokio::sync::Mutex;

/// Most addresses a [`MemoryPeerStore`] remembers
pub const MAX_KNOWN_ADDRESSES: usize = 4096;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable store of peer addresses
#[async_trait]
pub trait PeerStorage: Send + Sync {
    /// Remember an address for later outbound use
    async fn store(&self, addr: &str) -> Result<(), StorageError>;

    /// Up to `count` previously stored addresses
    async fn get(&self, count: usize) -> Result<Vec<String>, StorageError>;
}

/// In-memory address store.
///
/// `get` hands out addresses round-robin so repeated calls cycle through
/// everything known instead of retrying the same few. When full, storing a
/// new address evicts the one at the front of the rotation.
#[derive(Debug)]
pub struct MemoryPeerStore {
    capacity: usize,
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    order: VecDeque<String>,
    known: HashSet<String>,
}

impl Default for MemoryPeerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_KNOWN_ADDRESSES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, addr: &str) -> bool {
        self.inner.lock().await.known.contains(addr)
    }
}

#[async_trait]
impl PeerStorage for MemoryPeerStore {
    async fn store(&self, addr: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.known.contains(addr) {
            return Ok(());
        }

        while inner.order.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(evicted) => {
                    inner.known.remove(&evicted);
                }
                None => break,
            }
        }

        inner.known.insert(addr.to_string());
        inner.order.push_back(addr.to_string());
        Ok(())
    }

    async fn get(&self, count: usize) -> Result<Vec<String>, StorageError> {
        let mut inner = self.inner.lock().await;
        let count = count.min(inner.order.len());

        let mut addrs = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(addr) = inner.order.pop_front() {
                addrs.push(addr.clone());
                inner.order.push_back(addr);
            }
        }
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_dedup() {
        let store = MemoryPeerStore::new();
        store.store("8.8.8.8:8831").await.unwrap();
        store.store("8.8.8.8:8831").await.unwrap();

        assert_eq!(store.len().await, 1);
        assert!(store.contains("8.8.8.8:8831").await);
    }

    #[tokio::test]
    async fn test_get_rotates() {
        let store = MemoryPeerStore::new();
        for i in 1..=3 {
            store.store(&format!("8.8.8.{}:8831", i)).await.unwrap();
        }

        assert_eq!(
            store.get(2).await.unwrap(),
            vec!["8.8.8.1:8831", "8.8.8.2:8831"]
        );
        assert_eq!(
            store.get(2).await.unwrap(),
            vec!["8.8.8.3:8831", "8.8.8.1:8831"]
        );
    }

    #[tokio::test]
    async fn test_capacity_evicts_front() {
        let store = MemoryPeerStore::with_capacity(2);
        for i in 1..=3 {
            store.store(&format!("8.8.8.{}:8831", i)).await.unwrap();
        }

        assert_eq!(store.len().await, 2);
        assert!(!store.contains("8.8.8.1:8831").await);
        assert_eq!(
            store.get(2).await.unwrap(),
            vec!["8.8.8.2:8831", "8.8.8.3:8831"]
        );

        // an evicted address can be learned again
        store.store("8.8.8.1:8831").await.unwrap();
        assert!(store.contains("8.8.8.1:8831").await);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_get_more_than_known() {
        let store = MemoryPeerStore::new();
        store.store("8.8.8.8:8831").await.unwrap();

        assert_eq!(store.get(8).await.unwrap().len(), 1);
        assert!(MemoryPeerStore::new().get(8).await.unwrap().is_empty());
    }
}
