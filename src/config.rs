//! Discovery engine configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

/// Well-known rendezvous group every node listens on first.
pub const DEFAULT_BOOTSTRAP_ADDRESS: Ipv4Addr = Ipv4Addr::new(239, 255, 43, 21);
pub const DEFAULT_BOOTSTRAP_PORT: u16 = 45454;

/// Group proposed for steady-state heartbeats when negotiating.
pub const DEFAULT_COMM_ADDRESS: Ipv4Addr = Ipv4Addr::new(239, 255, 43, 22);
pub const DEFAULT_COMM_PORT: u16 = 45455;

/// Discovery engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    /// Bootstrap (rendezvous) multicast group
    #[serde(default = "default_bootstrap_address")]
    pub bootstrap_address: Ipv4Addr,

    #[serde(default = "default_bootstrap_port")]
    pub bootstrap_port: u16,

    /// Communication group this node proposes during negotiation
    #[serde(default = "default_comm_address")]
    pub comm_address: Ipv4Addr,

    #[serde(default = "default_comm_port")]
    pub comm_port: u16,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// A peer silent for longer than this is evicted
    #[serde(default = "default_node_timeout")]
    pub node_timeout_ms: u64,

    /// Reaper sweep interval, defaults to the heartbeat interval
    #[serde(default)]
    pub sweep_interval_ms: Option<u64>,

    /// Run the Request/Response handshake before heartbeating
    #[serde(default = "default_true")]
    pub negotiate: bool,

    /// How long to wait for a Response before falling back to `comm_address`
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_ms: u64,

    #[serde(default = "default_ttl")]
    pub multicast_ttl: u32,

    /// Deliver our own multicast packets back to local sockets
    #[serde(default = "default_true")]
    pub multicast_loop: bool,

    /// Send an Offline message on stop
    #[serde(default = "default_true")]
    pub announce_offline: bool,

    /// Bound on undelivered observer events
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_bootstrap_address() -> Ipv4Addr {
    DEFAULT_BOOTSTRAP_ADDRESS
}

fn default_bootstrap_port() -> u16 {
    DEFAULT_BOOTSTRAP_PORT
}

fn default_comm_address() -> Ipv4Addr {
    DEFAULT_COMM_ADDRESS
}

fn default_comm_port() -> u16 {
    DEFAULT_COMM_PORT
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_node_timeout() -> u64 {
    5000
}

fn default_negotiation_timeout() -> u64 {
    1000
}

fn default_ttl() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_event_queue_capacity() -> usize {
    256
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bootstrap_address: default_bootstrap_address(),
            bootstrap_port: default_bootstrap_port(),
            comm_address: default_comm_address(),
            comm_port: default_comm_port(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            node_timeout_ms: default_node_timeout(),
            sweep_interval_ms: None,
            negotiate: true,
            negotiation_timeout_ms: default_negotiation_timeout(),
            multicast_ttl: default_ttl(),
            multicast_loop: true,
            announce_offline: true,
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl DiscoveryConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn bootstrap_group(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.bootstrap_address, self.bootstrap_port))
    }

    pub fn comm_group(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.comm_address, self.comm_port))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.unwrap_or(self.heartbeat_interval_ms))
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, addr) in [
            ("bootstrapAddress", self.bootstrap_address),
            ("commAddress", self.comm_address),
        ] {
            if !addr.is_multicast() {
                return Err(ConfigError::Invalid(format!(
                    "{name} {addr} is not a multicast address"
                )));
            }
        }
        if self.bootstrap_port == 0 || self.comm_port == 0 {
            return Err(ConfigError::Invalid("ports cannot be 0".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeatIntervalMs cannot be 0".into(),
            ));
        }
        // A single dropped heartbeat must not evict a peer.
        if self.node_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "nodeTimeoutMs ({}) must be greater than heartbeatIntervalMs ({})",
                self.node_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.sweep_interval_ms == Some(0) {
            return Err(ConfigError::Invalid("sweepIntervalMs cannot be 0".into()));
        }
        if !(1..=255).contains(&self.multicast_ttl) {
            return Err(ConfigError::Invalid(format!(
                "multicastTtl {} out of range 1..=255",
                self.multicast_ttl
            )));
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "eventQueueCapacity cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.bootstrap_group(), "239.255.43.21:45454".parse().unwrap());
        assert_eq!(config.comm_group(), "239.255.43.22:45455".parse().unwrap());
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(1000));
        assert_eq!(config.node_timeout(), Duration::from_millis(5000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sweep_defaults_to_heartbeat() {
        let config = DiscoveryConfig {
            heartbeat_interval_ms: 100,
            node_timeout_ms: 500,
            ..Default::default()
        };
        assert_eq!(config.sweep_interval(), Duration::from_millis(100));

        let config = DiscoveryConfig {
            sweep_interval_ms: Some(250),
            ..config
        };
        assert_eq!(config.sweep_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_timeout_must_exceed_heartbeat() {
        let config = DiscoveryConfig {
            heartbeat_interval_ms: 1000,
            node_timeout_ms: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unicast_group() {
        let config = DiscoveryConfig {
            comm_address: Ipv4Addr::new(192, 168, 1, 10),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("commAddress"));
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let config = DiscoveryConfig {
            multicast_ttl: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DiscoveryConfig =
            serde_json::from_str(r#"{"bootstrapPort": 50000, "negotiate": false}"#).unwrap();
        assert_eq!(config.bootstrap_port, 50000);
        assert!(!config.negotiate);
        assert_eq!(config.node_timeout_ms, 5000);
        assert_eq!(config.bootstrap_address, DEFAULT_BOOTSTRAP_ADDRESS);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"heartbeatIntervalMs": 200, "nodeTimeoutMs": 1000, "multicastTtl": 2}}"#
        )
        .unwrap();

        let config = DiscoveryConfig::from_file(file.path()).unwrap();
        assert_eq!(config.heartbeat_interval_ms, 200);
        assert_eq!(config.multicast_ttl, 2);
    }

    #[test]
    fn test_from_file_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"heartbeatIntervalMs": 5000}}"#).unwrap();

        assert!(matches!(
            DiscoveryConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
