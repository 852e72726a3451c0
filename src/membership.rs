use crate::events::{DiscoveryEvent, EventSink, LeaveReason};
use crate::peer::PeerRecord;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Result of [`MembershipTable::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// First message from this id
    Joined,
    /// Known id, at least one observable field changed
    Updated,
    /// Known id, nothing but `last_seen` moved
    Refreshed,
}

/// Live peers keyed by node id.
///
/// Every mutation emits its event while the lock is still held, so events for a
/// single peer reach the queue in the order the table saw them.
pub struct MembershipTable {
    peers: Mutex<HashMap<String, PeerRecord>>,
    events: EventSink,
}

impl MembershipTable {
    pub fn new(events: EventSink) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PeerRecord>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn upsert(
        &self,
        id: &str,
        display_name: &str,
        source: SocketAddr,
        comm: SocketAddr,
        now: Instant,
    ) -> Upsert {
        let mut peers = self.lock();
        match peers.get_mut(id) {
            Some(peer) => {
                if peer.refresh(display_name, source, comm, now) {
                    self.events.emit(DiscoveryEvent::Updated(peer.clone()));
                    Upsert::Updated
                } else {
                    Upsert::Refreshed
                }
            }
            None => {
                let peer = PeerRecord {
                    id: id.to_string(),
                    display_name: display_name.to_string(),
                    source,
                    comm,
                    last_seen: now,
                };
                self.events.emit(DiscoveryEvent::Joined(peer.clone()));
                peers.insert(id.to_string(), peer);
                Upsert::Joined
            }
        }
    }

    /// Drop a peer that said goodbye.
    pub fn remove(&self, id: &str) -> Option<PeerRecord> {
        let mut peers = self.lock();
        let peer = peers.remove(id)?;
        self.events.emit(DiscoveryEvent::Left {
            peer: peer.clone(),
            reason: LeaveReason::Offline,
        });
        Some(peer)
    }

    /// Remove and return every peer silent for strictly longer than `timeout`.
    pub fn expire(&self, timeout: Duration, now: Instant) -> Vec<PeerRecord> {
        let mut peers = self.lock();
        let stale: Vec<String> = peers
            .iter()
            .filter(|(_, peer)| now.saturating_duration_since(peer.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(peer) = peers.remove(&id) {
                self.events.emit(DiscoveryEvent::Left {
                    peer: peer.clone(),
                    reason: LeaveReason::Timeout,
                });
                evicted.push(peer);
            }
        }
        evicted
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<PeerRecord> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forget everyone without emitting events (engine shutdown).
    pub fn clear(&self) {
        self.lock().clear();
    }
}
