//! Registry of live connections

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use sp_core::time::{current_time_secs, elapsed_since};

/// Identifier of one accepted connection
pub type ConnectionId = u64;

/// A live connection
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub peer: SocketAddr,
    /// Unix timestamp of acceptance
    pub connected_at: u64,
    /// Cancelling closes the connection
    pub cancel: CancellationToken,
}

impl ConnectionEntry {
    /// Time since the connection was accepted
    pub fn age(&self) -> Duration {
        elapsed_since(self.connected_at)
    }
}

/// Connections indexed by id
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection and return its id
    pub fn register(&self, peer: SocketAddr, cancel: CancellationToken) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections.insert(
            id,
            ConnectionEntry {
                peer,
                connected_at: current_time_secs(),
                cancel,
            },
        );
        id
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionEntry> {
        self.connections.remove(&id).map(|(_, entry)| entry)
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionEntry> {
        self.connections.get(&id).map(|r| r.clone())
    }

    /// Ask every live connection to close
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.cancel.cancel();
        }
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_register_and_remove() {
        let registry = ConnectionRegistry::new();
        let a = registry.register(peer(1000), CancellationToken::new());
        let b = registry.register(peer(1001), CancellationToken::new());
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(a).unwrap().peer, peer(1000));

        assert!(registry.remove(a).is_some());
        assert!(registry.remove(a).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_close_all_cancels_every_connection() {
        let registry = ConnectionRegistry::new();
        let tokens: Vec<_> = (0..3).map(|_| CancellationToken::new()).collect();
        for (i, token) in tokens.iter().enumerate() {
            registry.register(peer(2000 + i as u16), token.clone());
        }

        registry.close_all();
        assert!(tokens.iter().all(|t| t.is_cancelled()));
    }
}
