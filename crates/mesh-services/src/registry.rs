//! Membership registry — which peers are alive, as seen by the rendezvous
//! service.
//!
//! Keyed on the peer's advertised identity. An entry exists from `register`
//! until `leave` or until the sweep finds it older than the timeout.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use mesh_core::PeerIdentity;

/// Shared membership table. One lock guards the whole map so a peer list is
/// always a single consistent state.
pub struct MembershipRegistry {
    entries: RwLock<HashMap<PeerIdentity, Instant>>,
    timeout: Duration,
}

impl MembershipRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Insert or overwrite `peer`. Returns true if the peer was not present.
    pub fn register(&self, peer: PeerIdentity) -> bool {
        self.register_at(peer, Instant::now())
    }

    pub fn register_at(&self, peer: PeerIdentity, now: Instant) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(&peer) {
            Some(last_seen) => {
                *last_seen = (*last_seen).max(now);
                false
            }
            None => {
                entries.insert(peer, now);
                true
            }
        }
    }

    /// Refresh `peer` if it is present. A heartbeat never re-creates an
    /// expired or departed entry.
    pub fn heartbeat(&self, peer: &PeerIdentity) -> bool {
        self.heartbeat_at(peer, Instant::now())
    }

    pub fn heartbeat_at(&self, peer: &PeerIdentity, now: Instant) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(peer) {
            Some(last_seen) => {
                *last_seen = (*last_seen).max(now);
                true
            }
            None => false,
        }
    }

    /// Remove `peer`. Returns false if it was not present.
    pub fn leave(&self, peer: &PeerIdentity) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer)
            .is_some()
    }

    /// Remove every entry whose age exceeds the timeout. Returns the evicted
    /// identities.
    pub fn sweep(&self) -> Vec<PeerIdentity> {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> Vec<PeerIdentity> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut expired = Vec::new();
        entries.retain(|peer, last_seen| {
            let alive = now.saturating_duration_since(*last_seen) <= self.timeout;
            if !alive {
                expired.push(peer.clone());
            }
            alive
        });
        expired
    }

    /// Live peers, sorted for stable output.
    pub fn snapshot(&self) -> Vec<PeerIdentity> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut peers: Vec<_> = entries.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn last_seen(&self, peer: &PeerIdentity) -> Option<Instant> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .copied()
    }

    pub fn contains(&self, peer: &PeerIdentity) -> bool {
        self.last_seen(peer).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
