//! Serverless peer discovery for machines on the same LAN segment.
//!
//! Nodes find each other on a well-known multicast group, optionally agree on a
//! second group for steady-state heartbeats, and keep a membership table that
//! evicts peers once they fall silent. See [`DiscoveryEngine`].

mod announcer;
pub mod channel;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
mod listener;
pub mod logging;
pub mod membership;
pub mod peer;
pub mod protocol;
mod reaper;

pub use channel::{ChannelOptions, MulticastChannel};
pub use config::DiscoveryConfig;
pub use discovery::{DiscoveryEngine, EngineState};
pub use error::{ChannelError, CodecError, ConfigError, DiscoveryError};
pub use events::{DiscoveryEvent, EventKind, LeaveReason};
pub use membership::{MembershipTable, Upsert};
pub use peer::{default_display_name, NodeIdentity, PeerRecord};
pub use protocol::{DiscoveryMessage, MessageBody};
