//! Run a discovery node and log what it sees.
//!
//! ```bash
//! # Defaults: bootstrap 239.255.43.21:45454, negotiated heartbeats
//! meetlan --name alice
//!
//! # Heartbeat straight on the bootstrap group, faster timeouts
//! meetlan --no-negotiate --heartbeat-ms 100 --timeout-ms 500
//! ```

use clap::Parser;
use meetlan_lib::{
    default_display_name, logging, DiscoveryConfig, DiscoveryEngine, DiscoveryEvent,
    NodeIdentity,
};
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "meetlan")]
#[command(author, version, about = "LAN peer discovery node", long_about = None)]
struct Args {
    /// Configuration file (JSON format); flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node id (random if omitted)
    #[arg(long)]
    id: Option<String>,

    /// Display name (hostname if omitted)
    #[arg(short, long)]
    name: Option<String>,

    /// Bootstrap multicast group, e.g. 239.255.43.21:45454
    #[arg(long)]
    bootstrap: Option<SocketAddrV4>,

    /// Communication multicast group proposed during negotiation
    #[arg(long)]
    comm: Option<SocketAddrV4>,

    #[arg(long)]
    heartbeat_ms: Option<u64>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Heartbeat on the bootstrap group instead of negotiating
    #[arg(long)]
    no_negotiate: bool,

    /// Multicast TTL
    #[arg(long)]
    ttl: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Seconds between membership reports
    #[arg(long, default_value = "5")]
    report_interval_secs: u64,
}

impl Args {
    fn discovery_config(&self) -> Result<DiscoveryConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading config from {:?}", path);
                DiscoveryConfig::from_file(path)?
            }
            None => DiscoveryConfig::default(),
        };
        if let Some(bootstrap) = self.bootstrap {
            config.bootstrap_address = *bootstrap.ip();
            config.bootstrap_port = bootstrap.port();
        }
        if let Some(comm) = self.comm {
            config.comm_address = *comm.ip();
            config.comm_port = comm.port();
        }
        if let Some(ms) = self.heartbeat_ms {
            config.heartbeat_interval_ms = ms;
        }
        if let Some(ms) = self.timeout_ms {
            config.node_timeout_ms = ms;
        }
        if let Some(ttl) = self.ttl {
            config.multicast_ttl = ttl;
        }
        if self.no_negotiate {
            config.negotiate = false;
        }
        Ok(config)
    }
}

fn log_event(event: &DiscoveryEvent) {
    match event {
        DiscoveryEvent::Joined(peer) => info!(
            "JOINED  {} ({}) from {} comm {}",
            peer.id, peer.display_name, peer.source, peer.comm
        ),
        DiscoveryEvent::Updated(peer) => info!(
            "UPDATED {} ({}) from {} comm {}",
            peer.id, peer.display_name, peer.source, peer.comm
        ),
        DiscoveryEvent::Left { peer, reason } => {
            info!("LEFT    {} ({}) {:?}", peer.id, peer.display_name, reason)
        }
        DiscoveryEvent::CommNegotiated { peer_id, comm } => {
            info!("Negotiated heartbeat group {} with {}", comm, peer_id)
        }
        DiscoveryEvent::Error(message) => tracing::warn!("Discovery error: {}", message),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let _log_guard = logging::init(&args.log_level, args.log_file.as_deref())?;

    let config = args.discovery_config()?;
    let name = args.name.clone().unwrap_or_else(default_display_name);
    let identity = match &args.id {
        Some(id) => NodeIdentity::new(id.clone(), name),
        None => NodeIdentity::generate(name),
    };
    info!("Node {} ({})", identity.id, identity.display_name);

    let engine = DiscoveryEngine::new(identity, config)?;
    engine.set_observer(log_event);
    engine.start().await?;

    let mut report = tokio::time::interval(Duration::from_secs(args.report_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping...");
                break;
            }
            _ = report.tick() => {
                let mut members = engine.members();
                members.sort_by(|a, b| a.id.cmp(&b.id));
                info!("{} peer(s) online", members.len());
                for peer in members {
                    info!(
                        "  {:<36} {:<20} {:<21} last seen {:?} ago",
                        peer.id,
                        peer.display_name,
                        peer.source.to_string(),
                        peer.last_seen.elapsed()
                    );
                }
            }
        }
    }

    engine.stop().await;
    Ok(())
}
