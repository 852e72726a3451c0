use std::net::{IpAddr, SocketAddr};
use tokio::time::Instant;

/// Who this process is on the LAN. Fixed for the lifetime of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: String,
    pub display_name: String,
}

impl NodeIdentity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// Fresh random id; nothing stops two nodes from picking the same one by hand,
    /// but two generated ids will not collide in practice.
    pub fn generate(display_name: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), display_name)
    }
}

/// The machine's hostname, for use as a display name.
pub fn default_display_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "Unknown Device".to_string())
}

/// A live peer as seen by the membership table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: String,
    pub display_name: String,
    /// Where this peer's packets physically arrive from
    pub source: SocketAddr,
    /// Group/port the peer uses for steady-state traffic
    pub comm: SocketAddr,
    pub last_seen: Instant,
}

impl PeerRecord {
    pub fn source_address(&self) -> IpAddr {
        self.source.ip()
    }

    pub fn source_port(&self) -> u16 {
        self.source.port()
    }

    pub fn comm_address(&self) -> IpAddr {
        self.comm.ip()
    }

    pub fn comm_port(&self) -> u16 {
        self.comm.port()
    }

    /// Overwrite the observable fields, returning whether any of them changed.
    /// `last_seen` is always refreshed.
    pub(crate) fn refresh(
        &mut self,
        display_name: &str,
        source: SocketAddr,
        comm: SocketAddr,
        now: Instant,
    ) -> bool {
        self.last_seen = now;
        if self.display_name == display_name && self.source == source && self.comm == comm {
            return false;
        }
        self.display_name = display_name.to_string();
        self.source = source;
        self.comm = comm;
        true
    }
}
