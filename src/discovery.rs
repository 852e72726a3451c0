//! Discovery engine: owns the bootstrap channel, the membership table and the
//! announcer, listener and reaper tasks.

use crate::announcer;
use crate::channel::{ChannelOptions, MulticastChannel};
use crate::config::DiscoveryConfig;
use crate::error::{ConfigError, DiscoveryError};
use crate::events::{self, DiscoveryEvent, EventSink, Observer, ObserverSlot};
use crate::listener;
use crate::membership::MembershipTable;
use crate::peer::{NodeIdentity, PeerRecord};
use crate::protocol::{self, DiscoveryMessage};
use crate::reaper;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// State shared by the engine and its tasks.
pub(crate) struct Context {
    pub(crate) identity: NodeIdentity,
    pub(crate) config: DiscoveryConfig,
    pub(crate) table: Arc<MembershipTable>,
    pub(crate) events: EventSink,
    /// Where heartbeats go. `None` until negotiation settles.
    pub(crate) target: watch::Sender<Option<SocketAddr>>,
}

impl Context {
    pub(crate) fn new(identity: NodeIdentity, config: DiscoveryConfig) -> Self {
        let events = EventSink::new();
        let (target, _) = watch::channel(None);
        Self {
            identity,
            config,
            table: Arc::new(MembershipTable::new(events.clone())),
            events,
            target,
        }
    }

    pub(crate) fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            ttl: self.config.multicast_ttl,
            multicast_loop: self.config.multicast_loop,
        }
    }

    pub(crate) fn current_target(&self) -> Option<SocketAddr> {
        *self.target.borrow()
    }

    /// The communication group we offer to others: whatever we heartbeat on now,
    /// or our configured group before that is settled.
    pub(crate) fn proposal(&self) -> SocketAddrV4 {
        match self.current_target() {
            Some(SocketAddr::V4(target)) => target,
            _ => SocketAddrV4::new(self.config.comm_address, self.config.comm_port),
        }
    }
}

struct Running {
    token: CancellationToken,
    bootstrap: Arc<MulticastChannel>,
    tasks: Vec<JoinHandle<()>>,
    dispatcher: JoinHandle<()>,
}

/// LAN peer discovery over UDP multicast.
///
/// ```no_run
/// # async fn demo() -> Result<(), meetlan_lib::DiscoveryError> {
/// use meetlan_lib::{DiscoveryConfig, DiscoveryEngine, NodeIdentity};
///
/// let engine = DiscoveryEngine::new(NodeIdentity::new("a", "Alice"), DiscoveryConfig::default())?;
/// engine.set_observer(|event| println!("{:?}", event));
/// engine.start().await?;
/// // ...
/// engine.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct DiscoveryEngine {
    ctx: Arc<Context>,
    observer: ObserverSlot,
    state: Mutex<EngineState>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl DiscoveryEngine {
    pub fn new(identity: NodeIdentity, config: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        config.validate()?;
        if identity.id.is_empty() {
            return Err(ConfigError::Invalid("node id cannot be empty".into()).into());
        }
        Ok(Self {
            ctx: Arc::new(Context::new(identity, config)),
            observer: Arc::new(RwLock::new(None)),
            state: Mutex::new(EngineState::Stopped),
            running: tokio::sync::Mutex::new(None),
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.ctx.identity
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.ctx.config
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Current membership. Empty while stopped.
    pub fn members(&self) -> Vec<PeerRecord> {
        self.ctx.table.snapshot()
    }

    pub fn member(&self, id: &str) -> Option<PeerRecord> {
        self.ctx.table.get(id)
    }

    /// Group our heartbeats currently go to, once negotiation has settled.
    pub fn transmit_target(&self) -> Option<SocketAddr> {
        self.ctx.current_target()
    }

    /// Register the single observer, replacing any previous one.
    pub fn set_observer<F>(&self, observer: F)
    where
        F: Fn(&DiscoveryEvent) + Send + Sync + 'static,
    {
        let observer: Observer = Arc::new(observer);
        *self.observer.write().unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    pub fn clear_observer(&self) {
        self.observer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Join the bootstrap group and start the announcer, listener and reaper.
    /// Succeeds without doing anything if already running.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!("Discovery engine already running");
            return Ok(());
        }

        self.set_state(EngineState::Starting);
        let config = &self.ctx.config;

        let bootstrap =
            match MulticastChannel::open(config.bootstrap_group(), &self.ctx.channel_options()) {
                Ok(channel) => Arc::new(channel),
                Err(e) => {
                    self.set_state(EngineState::Stopped);
                    tracing::error!(
                        "Failed to open bootstrap channel {}: {}",
                        config.bootstrap_group(),
                        e
                    );
                    return Err(e.into());
                }
            };

        let initial_target = if config.negotiate {
            None
        } else {
            Some(config.bootstrap_group())
        };
        self.ctx.target.send_replace(initial_target);

        let queue = self.ctx.events.attach(config.event_queue_capacity);
        let dispatcher = tokio::spawn(events::dispatch(queue, self.observer.clone()));

        let token = CancellationToken::new();
        self.set_state(EngineState::Running);
        let tasks = vec![
            tokio::spawn(announcer::run(
                self.ctx.clone(),
                bootstrap.clone(),
                token.clone(),
            )),
            tokio::spawn(listener::run(self.ctx.clone(), bootstrap.clone())),
            tokio::spawn(reaper::run(
                self.ctx.table.clone(),
                config.node_timeout(),
                config.sweep_interval(),
                token.clone(),
            )),
        ];

        tracing::info!(
            "Discovery engine started for {} ({}) on {}",
            self.ctx.identity.id,
            self.ctx.identity.display_name,
            config.bootstrap_group()
        );
        match bootstrap.local_addr() {
            Ok(local) => tracing::debug!("Bootstrap socket bound to {}", local),
            Err(e) => tracing::debug!("Could not read bootstrap socket address: {}", e),
        }
        match local_ip_address::local_ip() {
            Ok(ip) => tracing::info!("Local address: {}", ip),
            Err(e) => tracing::debug!("Could not determine local address: {}", e),
        }

        if config.negotiate {
            self.send_request(&bootstrap).await;
        }

        *running = Some(Running {
            token,
            bootstrap,
            tasks,
            dispatcher,
        });
        Ok(())
    }

    /// Stop all tasks, say goodbye, release the socket and forget every peer.
    /// Does nothing if already stopped.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            return;
        };

        self.set_state(EngineState::Stopping);
        run.token.cancel();

        if self.ctx.config.announce_offline {
            self.send_offline(&run.bootstrap).await;
        }
        run.bootstrap.close();

        for result in futures::future::join_all(run.tasks).await {
            if let Err(e) = result {
                tracing::warn!("Discovery task ended abnormally: {}", e);
            }
        }

        self.ctx.table.clear();
        self.ctx.events.detach();
        if let Err(e) = run.dispatcher.await {
            tracing::warn!("Event dispatcher ended abnormally: {}", e);
        }
        self.ctx.target.send_replace(None);

        self.set_state(EngineState::Stopped);
        tracing::info!("Discovery engine stopped");
    }

    async fn send_request(&self, bootstrap: &MulticastChannel) {
        let request = DiscoveryMessage::request(&self.ctx.identity, self.ctx.proposal());
        match protocol::encode(&request) {
            Ok(payload) => match bootstrap.send(&payload).await {
                Ok(_) => tracing::debug!("Sent discovery request to {}", bootstrap.group()),
                Err(e) => tracing::warn!("Failed to send discovery request: {}", e),
            },
            Err(e) => tracing::warn!("Failed to encode discovery request: {}", e),
        }
    }

    async fn send_offline(&self, bootstrap: &MulticastChannel) {
        let offline = DiscoveryMessage::offline(&self.ctx.identity, Some("normal_shutdown"));
        let payload = match protocol::encode(&offline) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Failed to encode offline message: {}", e);
                return;
            }
        };

        let mut targets = vec![bootstrap.group()];
        if let Some(target) = self.ctx.current_target() {
            if target != bootstrap.group() {
                targets.push(target);
            }
        }
        for target in targets {
            if let Err(e) = bootstrap.send_to(&payload, target).await {
                tracing::warn!("Failed to send offline message: {}", e);
            }
        }
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        if let Some(run) = self.running.get_mut().take() {
            tracing::info!("Discovery engine dropped while running, cancelling tasks");
            run.token.cancel();
            run.bootstrap.close();
            self.ctx.events.detach();
        }
    }
}
