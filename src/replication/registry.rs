//! Peer Registry
//!
//! Thread-safe map from peer identity to the live connection handle.
//! Every access goes through the internal lock; callers only ever see
//! point-in-time snapshots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::network::{lock, Peer, PeerHandler};

/// Registry of connected peers, keyed by remote address
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, Arc<dyn Peer>>>,
}

impl PeerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for the peer's identity.
    /// Returns the handle that was replaced, if any.
    pub fn register(&self, peer: Arc<dyn Peer>) -> Option<Arc<dyn Peer>> {
        let id = peer.remote_addr().to_string();
        let direction = if peer.is_outbound() { "outbound" } else { "inbound" };
        let previous = lock(&self.peers).insert(id.clone(), peer);

        if previous.is_some() {
            tracing::info!("Replaced connection with remote {} ({})", id, direction);
        } else {
            tracing::info!("Connected with remote {} ({})", id, direction);
        }
        previous
    }

    /// Remove `peer` if it is still the registered handle for its identity
    pub fn remove(&self, peer: &Arc<dyn Peer>) -> bool {
        let id = peer.remote_addr();
        let mut peers = lock(&self.peers);

        match peers.get(id) {
            Some(current) if same_peer(current, peer) => {
                peers.remove(id);
                tracing::info!("Disconnected from remote {}", id);
                true
            }
            _ => false,
        }
    }

    /// Point-in-time list of live peers
    pub fn snapshot(&self) -> Vec<Arc<dyn Peer>> {
        lock(&self.peers).values().cloned().collect()
    }

    /// Identities of all registered peers
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.peers).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered peers
    pub fn len(&self) -> usize {
        lock(&self.peers).len()
    }

    /// Whether no peers are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PeerHandler for PeerRegistry {
    fn on_peer(&self, peer: Arc<dyn Peer>) -> Result<()> {
        self.register(peer);
        Ok(())
    }

    fn on_disconnect(&self, peer: &Arc<dyn Peer>) {
        self.remove(peer);
    }
}

/// Identity comparison on the allocation, ignoring vtables
fn same_peer(a: &Arc<dyn Peer>, b: &Arc<dyn Peer>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
