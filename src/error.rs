use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by a [`MulticastChannel`](crate::channel::MulticastChannel).
///
/// The setup variants name the step that failed so a caller of
/// `DiscoveryEngine::start` can tell a bind conflict from a missing
/// multicast route.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to create UDP socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to set socket option {option}: {source}")]
    SetOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to join multicast group {group}: {source}")]
    Join {
        group: IpAddr,
        #[source]
        source: io::Error,
    },

    #[error("{0} is not an IPv4 multicast address")]
    NotMulticast(IpAddr),

    #[error("send to {target} failed: {source}")]
    Send {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),

    #[error("channel closed")]
    Closed,
}

/// Why a datagram could not be turned into a `DiscoveryMessage`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty payload")]
    Empty,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message kind {0:?}")]
    UnknownKind(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("failed to encode message: {0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error surfaced by [`DiscoveryEngine`](crate::discovery::DiscoveryEngine).
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
