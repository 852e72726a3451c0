use crate::peer::PeerRecord;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Peer announced it was going away
    Offline,
    /// Peer stopped heartbeating
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Joined,
    Updated,
    Left,
    Negotiated,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Joined(PeerRecord),
    Updated(PeerRecord),
    Left {
        peer: PeerRecord,
        reason: LeaveReason,
    },
    /// A Response moved our heartbeat target to `comm`.
    CommNegotiated {
        peer_id: String,
        comm: SocketAddr,
    },
    Error(String),
}

impl DiscoveryEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DiscoveryEvent::Joined(_) => EventKind::Joined,
            DiscoveryEvent::Updated(_) => EventKind::Updated,
            DiscoveryEvent::Left { .. } => EventKind::Left,
            DiscoveryEvent::CommNegotiated { .. } => EventKind::Negotiated,
            DiscoveryEvent::Error(_) => EventKind::Error,
        }
    }

    pub fn peer(&self) -> Option<&PeerRecord> {
        match self {
            DiscoveryEvent::Joined(peer)
            | DiscoveryEvent::Updated(peer)
            | DiscoveryEvent::Left { peer, .. } => Some(peer),
            _ => None,
        }
    }
}

pub type Observer = Arc<dyn Fn(&DiscoveryEvent) + Send + Sync>;

/// Slot holding the single registered observer, shared with the dispatcher task.
pub(crate) type ObserverSlot = Arc<RwLock<Option<Observer>>>;

/// Non-blocking producer side of the bounded event queue.
///
/// Detached sinks drop everything, so a stopped engine never accumulates events.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Arc<Mutex<Option<mpsc::Sender<DiscoveryEvent>>>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start queueing events, returning the consumer end.
    pub fn attach(&self, capacity: usize) -> mpsc::Receiver<DiscoveryEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Stop queueing. The receiver drains what is left and then sees the end of the stream.
    pub fn detach(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn emit(&self, event: DiscoveryEvent) {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            tracing::debug!("No event queue attached, dropping {:?}", event.kind());
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!("Event queue full, dropping {:?} event", event.kind());
            }
            Err(TrySendError::Closed(event)) => {
                tracing::debug!("Event queue closed, dropping {:?} event", event.kind());
            }
        }
    }
}

/// Deliver queued events to whatever observer is registered at the time.
pub(crate) async fn dispatch(mut rx: mpsc::Receiver<DiscoveryEvent>, observer: ObserverSlot) {
    while let Some(event) = rx.recv().await {
        let current = observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(callback) = current else {
            tracing::debug!("No observer registered, dropping {:?}", event);
            continue;
        };
        // A panicking observer loses this one event, not the dispatcher.
        if panic::catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
            tracing::error!("Observer panicked while handling {:?}", event);
        }
    }
}
