//! Client registry: bookkeeping for live connections
//!
//! Maps each accepted connection to the identifier it registered, if any.
//! The lock is held only for the map operation itself, never across network
//! or disk I/O. Nothing here routes files: pushes always go to the on-disk
//! directory of the target identifier whether or not it is online.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Server-assigned key for one accepted connection
pub type ConnectionId = u64;

/// Metadata kept for a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ConnectionId,
    /// Peer socket address
    pub address: SocketAddr,
    /// Identifier from the last successful REGISTER
    pub uid: Option<String>,
    /// Unix timestamp of the accept
    pub connected_at: u64,
}

/// Statistics about registry contents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Connections currently open
    pub connections_active: usize,
    /// Open connections that have registered an identifier
    pub registered: usize,
    /// Connections accepted since start-up
    pub connections_total: u64,
}

/// Concurrency-safe directory of connected sessions
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ConnectionId, ClientInfo>>,
    accepted: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly accepted connection
    pub fn connect(&self, address: SocketAddr) -> ConnectionId {
        let id = self.accepted.fetch_add(1, Ordering::Relaxed) + 1;
        let info = ClientInfo {
            id,
            address,
            uid: None,
            connected_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        self.clients.lock().insert(id, info);
        id
    }

    /// Add a connection and get a guard that removes it when dropped
    pub fn connect_guarded(self: &Arc<Self>, address: SocketAddr) -> ConnectionGuard {
        let id = self.connect(address);
        ConnectionGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Record the identifier a connection registered.
    ///
    /// Returns false if the connection is not (or no longer) known.
    pub fn register(&self, id: ConnectionId, uid: &str) -> bool {
        match self.clients.lock().get_mut(&id) {
            Some(info) => {
                info.uid = Some(uid.to_string());
                true
            }
            None => false,
        }
    }

    /// Remove a closed connection
    pub fn disconnect(&self, id: ConnectionId) -> Option<ClientInfo> {
        self.clients.lock().remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<ClientInfo> {
        self.clients.lock().get(&id).cloned()
    }

    pub fn uid_of(&self, id: ConnectionId) -> Option<String> {
        self.clients.lock().get(&id).and_then(|info| info.uid.clone())
    }

    /// Connections currently registered as `uid`
    pub fn sessions_for(&self, uid: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .clients
            .lock()
            .values()
            .filter(|info| info.uid.as_deref() == Some(uid))
            .map(|info| info.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_online(&self, uid: &str) -> bool {
        self.clients
            .lock()
            .values()
            .any(|info| info.uid.as_deref() == Some(uid))
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    /// Copy of every entry, ordered by connection id
    pub fn snapshot(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self.clients.lock().values().cloned().collect();
        clients.sort_by_key(|info| info.id);
        clients
    }

    pub fn stats(&self) -> RegistryStats {
        let clients = self.clients.lock();
        RegistryStats {
            connections_active: clients.len(),
            registered: clients.values().filter(|info| info.uid.is_some()).count(),
            connections_total: self.accepted.load(Ordering::Relaxed),
        }
    }
}

/// Removes its connection from the registry on drop
#[derive(Debug)]
pub struct ConnectionGuard {
    registry: Arc<ClientRegistry>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.disconnect(self.id);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:3002".parse().unwrap()
    }

    #[test]
    fn test_registry_creation() {
        let registry = ClientRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.stats(), RegistryStats::default());
    }

    #[test]
    fn test_connect_assigns_unique_ids() {
        let registry = ClientRegistry::new();
        let a = registry.connect(addr());
        let b = registry.connect(addr());
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(a).unwrap().uid.is_none());
    }

    #[test]
    fn test_register_updates_entry() {
        let registry = ClientRegistry::new();
        let id = registry.connect(addr());

        assert!(registry.register(id, "abc"));
        assert_eq!(registry.uid_of(id), Some("abc".to_string()));
        assert!(registry.is_online("abc"));
        assert!(!registry.is_online("xyz"));

        // Re-registering rebinds the connection
        assert!(registry.register(id, "xyz"));
        assert!(!registry.is_online("abc"));
        assert!(registry.is_online("xyz"));
    }

    #[test]
    fn test_register_unknown_connection() {
        let registry = ClientRegistry::new();
        assert!(!registry.register(42, "abc"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_shared_identifier() {
        let registry = ClientRegistry::new();
        let a = registry.connect(addr());
        let b = registry.connect(addr());
        let c = registry.connect(addr());
        registry.register(a, "same");
        registry.register(b, "same");
        registry.register(c, "other");

        assert_eq!(registry.sessions_for("same"), vec![a, b]);
        assert_eq!(registry.sessions_for("nobody"), Vec::<ConnectionId>::new());
    }

    #[test]
    fn test_disconnect() {
        let registry = ClientRegistry::new();
        let id = registry.connect(addr());
        registry.register(id, "abc");

        let removed = registry.disconnect(id).unwrap();
        assert_eq!(removed.uid.as_deref(), Some("abc"));
        assert!(registry.is_empty());
        assert!(!registry.is_online("abc"));
        assert!(registry.disconnect(id).is_none());
    }

    #[test]
    fn test_stats_tracking() {
        let registry = ClientRegistry::new();
        let a = registry.connect(addr());
        let _b = registry.connect(addr());
        registry.register(a, "abc");

        let stats = registry.stats();
        assert_eq!(stats.connections_active, 2);
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.connections_total, 2);

        registry.disconnect(a);
        let stats = registry.stats();
        assert_eq!(stats.connections_active, 1);
        assert_eq!(stats.registered, 0);
        assert_eq!(stats.connections_total, 2);
    }

    #[test]
    fn test_guard_removes_on_drop() {
        let registry = Arc::new(ClientRegistry::new());
        let guard = registry.connect_guarded(addr());
        let id = guard.id();
        assert!(registry.get(id).is_some());

        drop(guard);
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let registry = ClientRegistry::new();
        let ids: Vec<_> = (0..5).map(|_| registry.connect(addr())).collect();
        let snapshot: Vec<_> = registry.snapshot().into_iter().map(|i| i.id).collect();
        assert_eq!(snapshot, ids);
    }

    #[test]
    fn test_concurrent_connects() {
        let registry = Arc::new(ClientRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let id = registry.connect(addr());
                        registry.register(id, &format!("uid-{}", n));
                        registry.disconnect(id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = registry.stats();
        assert_eq!(stats.connections_active, 0);
        assert_eq!(stats.connections_total, 800);
    }
}
