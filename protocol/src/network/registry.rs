//! # Peer Registry
//!
//! Map from peer ID to [`Peer`] plus the ordered list of IDs this node
//! dialed. Membership check and insert happen under one write lock, so two
//! concurrent handshakes for the same ID cannot both register.
//!
//! Invariant: every ID in the dialed list has a map entry. Peers registered
//! from an inbound handshake appear in the map only.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::peer::Peer;
use crate::config::NodeId;

#[derive(Debug, Default)]
struct RegistryInner {
    peers: HashMap<NodeId, Arc<Peer>>,
    dialed: Vec<NodeId>,
}

/// Thread-safe peer set shared by the connect routine, the dispatcher and
/// broadcast.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    inner: RwLock<RegistryInner>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.inner.read().peers.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<Peer>> {
        self.inner.read().peers.get(&id).cloned()
    }

    /// Registers a peer created by an inbound handshake.
    ///
    /// Returns `false` and leaves the registry untouched if the ID is
    /// already known.
    pub fn insert_if_absent(&self, peer: Peer) -> bool {
        let mut inner = self.inner.write();
        if inner.peers.contains_key(&peer.id) {
            return false;
        }
        inner.peers.insert(peer.id, Arc::new(peer));
        true
    }

    /// Registers a peer this node dialed and records its ID in the dialed
    /// list. Returns `false` if the ID is already known.
    pub fn insert_dialed(&self, peer: Peer) -> bool {
        let mut inner = self.inner.write();
        if inner.peers.contains_key(&peer.id) {
            return false;
        }
        inner.dialed.push(peer.id);
        inner.peers.insert(peer.id, Arc::new(peer));
        true
    }

    /// Removes `id` if its entry is still bound to connection `conn_id`.
    ///
    /// The connection check keeps a late prune from evicting a peer that
    /// has meanwhile been re-registered on a fresh connection.
    pub fn remove_if_connection(&self, id: NodeId, conn_id: u64) -> Option<Arc<Peer>> {
        let mut inner = self.inner.write();
        match inner.peers.get(&id) {
            Some(peer) if peer.connection().id() == conn_id => {}
            _ => return None,
        }
        inner.dialed.retain(|&d| d != id);
        inner.peers.remove(&id)
    }

    /// Snapshot of all peers, for iteration without holding the lock.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.inner.read().peers.values().cloned().collect()
    }

    /// Known peer IDs in ascending order.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.inner.read().peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// IDs this node dialed, in dial order.
    pub fn dialed_ids(&self) -> Vec<NodeId> {
        self.inner.read().dialed.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().peers.is_empty()
    }

    /// Empties the registry, returning the removed peers.
    pub fn drain(&self) -> Vec<Arc<Peer>> {
        let mut inner = self.inner.write();
        inner.dialed.clear();
        inner.peers.drain().map(|(_, peer)| peer).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer::Connection;

    fn peer(id: NodeId) -> Peer {
        let (client, _server) = tokio::io::duplex(64);
        Peer::new(id, 0, Connection::new(format!("peer-{id}"), client))
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let registry = PeerRegistry::new();
        assert!(registry.insert_if_absent(peer(1)));
        assert!(!registry.insert_if_absent(peer(1)));
        assert!(!registry.insert_dialed(peer(1)));
        assert_eq!(registry.len(), 1);
        assert!(registry.dialed_ids().is_empty());
    }

    #[test]
    fn dialed_ids_track_insert_order() {
        let registry = PeerRegistry::new();
        registry.insert_dialed(peer(4));
        registry.insert_if_absent(peer(2));
        registry.insert_dialed(peer(1));
        assert_eq!(registry.dialed_ids(), vec![4, 1]);
        assert_eq!(registry.ids(), vec![1, 2, 4]);

        for id in registry.dialed_ids() {
            assert!(registry.contains(id));
        }
    }

    #[test]
    fn remove_checks_connection_identity() {
        let registry = PeerRegistry::new();
        registry.insert_dialed(peer(3));
        let current = registry.get(3).unwrap().connection().id();

        assert!(registry.remove_if_connection(3, current + 1_000).is_none());
        assert!(registry.contains(3));

        assert!(registry.remove_if_connection(3, current).is_some());
        assert!(!registry.contains(3));
        assert!(registry.dialed_ids().is_empty());
    }

    #[test]
    fn concurrent_handshakes_register_once() {
        let registry = Arc::new(PeerRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.insert_if_absent(peer(9)))
            })
            .collect();

        let inserted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(inserted, 1);
        assert_eq!(registry.len(), 1);
    }
}
