//! Receive loop: decodes datagrams from the bootstrap and communication
//! channels and applies them to the membership table.

use crate::channel::MulticastChannel;
use crate::discovery::Context;
use crate::error::{ChannelError, CodecError};
use crate::events::DiscoveryEvent;
use crate::protocol::{self, DiscoveryMessage, MessageBody};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;

/// What the receive loop should do after handling one datagram.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Action {
    Nothing,
    Reply { to: SocketAddr, payload: Vec<u8> },
}

/// Apply one datagram that arrived from `from` on the channel joined to `via`.
pub(crate) fn handle_datagram(
    ctx: &Context,
    bytes: &[u8],
    from: SocketAddr,
    via: SocketAddr,
    now: Instant,
) -> Action {
    let message = match protocol::decode(bytes) {
        Ok(message) => message,
        Err(CodecError::UnknownKind(kind)) => {
            tracing::warn!("Dropping message of unknown kind {:?} from {}", kind, from);
            return Action::Nothing;
        }
        Err(e) => {
            tracing::debug!("Dropping undecodable datagram from {}: {}", from, e);
            return Action::Nothing;
        }
    };

    // Multicast loopback hands us our own heartbeats.
    if message.sender_id == ctx.identity.id {
        return Action::Nothing;
    }

    let sender = message.sender_id.as_str();
    match &message.body {
        MessageBody::Announce { display_name } => {
            ctx.table.upsert(sender, display_name, from, via, now);
            Action::Nothing
        }
        MessageBody::Request { display_name, .. } => {
            tracing::debug!("Discovery request from {} at {}", sender, from);
            let proposal = message.body.proposal().unwrap_or(via);
            ctx.table.upsert(sender, display_name, from, proposal, now);

            let response = DiscoveryMessage::response(&ctx.identity, ctx.proposal());
            match protocol::encode(&response) {
                Ok(payload) => Action::Reply { to: from, payload },
                Err(e) => {
                    tracing::warn!("Failed to encode discovery response: {}", e);
                    Action::Nothing
                }
            }
        }
        MessageBody::Response { display_name, .. } => {
            tracing::debug!("Discovery response from {} at {}", sender, from);
            let proposal = message.body.proposal().unwrap_or(via);
            ctx.table.upsert(sender, display_name, from, proposal, now);

            // Last response wins. Only sound while every peer converges on one group.
            if ctx.config.negotiate && adopt_target(ctx, proposal) {
                tracing::info!("Heartbeat target negotiated with {}: {}", sender, proposal);
                ctx.events.emit(DiscoveryEvent::CommNegotiated {
                    peer_id: sender.to_string(),
                    comm: proposal,
                });
            }
            Action::Nothing
        }
        MessageBody::Offline { reason } => {
            match ctx.table.remove(sender) {
                Some(_) => tracing::info!(
                    "Peer {} went offline ({})",
                    sender,
                    reason.as_deref().unwrap_or("no reason given")
                ),
                None => tracing::debug!("Offline message from unknown peer {}", sender),
            }
            Action::Nothing
        }
    }
}

fn adopt_target(ctx: &Context, proposal: SocketAddr) -> bool {
    ctx.target.send_if_modified(|target| {
        if *target == Some(proposal) {
            false
        } else {
            *target = Some(proposal);
            true
        }
    })
}

/// Runs until the bootstrap channel is closed.
pub(crate) async fn run(ctx: Arc<Context>, bootstrap: Arc<MulticastChannel>) {
    let mut target = ctx.target.subscribe();
    let mut comm: Option<MulticastChannel> = None;
    let initial = *target.borrow_and_update();
    sync_comm_channel(&ctx, &bootstrap, &mut comm, initial);

    loop {
        tokio::select! {
            received = bootstrap.receive() => match received {
                Ok((bytes, from)) => process(&ctx, &bootstrap, &bytes, from).await,
                Err(ChannelError::Closed) => break,
                Err(e) => tracing::warn!("Receive on {} failed: {}", bootstrap.group(), e),
            },
            received = receive_on(comm.as_ref()) => match received {
                Ok((bytes, from)) => {
                    if let Some(channel) = comm.as_ref() {
                        process(&ctx, channel, &bytes, from).await;
                    }
                }
                Err(ChannelError::Closed) => comm = None,
                Err(e) => tracing::warn!("Receive on communication channel failed: {}", e),
            },
            changed = target.changed() => {
                if changed.is_err() {
                    break;
                }
                let desired = *target.borrow_and_update();
                sync_comm_channel(&ctx, &bootstrap, &mut comm, desired);
            }
        }
    }

    if let Some(channel) = comm.take() {
        channel.close();
    }
    tracing::debug!("Listener stopped");
}

async fn receive_on(
    channel: Option<&MulticastChannel>,
) -> Result<(Vec<u8>, SocketAddr), ChannelError> {
    match channel {
        Some(channel) => channel.receive().await,
        None => std::future::pending().await,
    }
}

async fn process(ctx: &Context, channel: &MulticastChannel, bytes: &[u8], from: SocketAddr) {
    let action = handle_datagram(ctx, bytes, from, channel.group(), Instant::now());
    if let Action::Reply { to, payload } = action {
        if let Err(e) = channel.send_to(&payload, to).await {
            tracing::warn!("Failed to reply to {}: {}", to, e);
            ctx.events
                .emit(DiscoveryEvent::Error(format!("reply to {} failed: {}", to, e)));
        }
    }
}

/// Make sure we are listening on the group our heartbeats go to, unless that
/// is the bootstrap group which we already listen on.
fn sync_comm_channel(
    ctx: &Context,
    bootstrap: &MulticastChannel,
    comm: &mut Option<MulticastChannel>,
    desired: Option<SocketAddr>,
) {
    let Some(desired) = desired else {
        return;
    };
    if desired == bootstrap.group() {
        if let Some(old) = comm.take() {
            old.close();
        }
        return;
    }
    if comm.as_ref().map(MulticastChannel::group) == Some(desired) {
        return;
    }

    match MulticastChannel::open(desired, &ctx.channel_options()) {
        Ok(channel) => {
            tracing::info!("Listening for heartbeats on {}", desired);
            if let Some(old) = comm.replace(channel) {
                old.close();
            }
        }
        Err(e) => {
            tracing::warn!("Failed to open communication channel {}: {}", desired, e);
            ctx.events.emit(DiscoveryEvent::Error(format!(
                "communication channel {} unavailable: {}",
                desired, e
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::events::{EventKind, LeaveReason};
    use crate::peer::NodeIdentity;
    use std::net::SocketAddrV4;
    use tokio::sync::mpsc;

    const BOOTSTRAP: &str = "239.255.43.21:45454";

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn context() -> (Context, mpsc::Receiver<DiscoveryEvent>) {
        let ctx = Context::new(NodeIdentity::new("a", "Alice"), DiscoveryConfig::default());
        let rx = ctx.events.attach(64);
        (ctx, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<DiscoveryEvent>) -> Vec<DiscoveryEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn announce(id: &str) -> Vec<u8> {
        protocol::encode(&DiscoveryMessage::announce(&NodeIdentity::new(id, "Peer"))).unwrap()
    }

    fn deliver(ctx: &Context, bytes: &[u8], from: &str) -> Action {
        handle_datagram(ctx, bytes, addr(from), addr(BOOTSTRAP), Instant::now())
    }

    #[test]
    fn announce_from_new_peer_joins_once() {
        let (ctx, mut rx) = context();

        deliver(&ctx, &announce("b"), "10.0.0.2:45454");

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Joined);
        let peer = ctx.table.get("b").unwrap();
        assert_eq!(peer.source, addr("10.0.0.2:45454"));
        assert_eq!(peer.comm, addr(BOOTSTRAP));
    }

    #[test]
    fn repeated_announce_is_silent() {
        let (ctx, mut rx) = context();
        deliver(&ctx, &announce("b"), "10.0.0.2:45454");
        drain(&mut rx);

        for _ in 0..5 {
            deliver(&ctx, &announce("b"), "10.0.0.2:45454");
        }

        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn announce_from_new_port_updates_once() {
        let (ctx, mut rx) = context();
        deliver(&ctx, &announce("b"), "10.0.0.2:45454");
        drain(&mut rx);

        deliver(&ctx, &announce("b"), "10.0.0.2:50000");

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Updated);
    }

    #[test]
    fn own_messages_are_ignored() {
        let (ctx, mut rx) = context();

        deliver(&ctx, &announce("a"), "10.0.0.1:45454");

        assert!(ctx.table.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn offline_removes_known_peer_immediately() {
        let (ctx, mut rx) = context();
        deliver(&ctx, &announce("b"), "10.0.0.2:45454");
        drain(&mut rx);

        let offline = protocol::encode(&DiscoveryMessage::offline(
            &NodeIdentity::new("b", "Peer"),
            Some("normal_shutdown"),
        ))
        .unwrap();
        deliver(&ctx, &offline, "10.0.0.2:45454");
        deliver(&ctx, &offline, "10.0.0.2:45454");

        assert!(ctx.table.get("b").is_none());
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            DiscoveryEvent::Left {
                reason: LeaveReason::Offline,
                ..
            }
        ));
    }

    #[test]
    fn request_is_answered_with_unicast_response() {
        let (ctx, mut rx) = context();
        let proposal: SocketAddrV4 = "239.255.43.30:46000".parse().unwrap();
        let request =
            protocol::encode(&DiscoveryMessage::request(&NodeIdentity::new("b", "Bob"), proposal))
                .unwrap();

        let action = deliver(&ctx, &request, "10.0.0.2:45454");

        let (to, payload) = match action {
            Action::Reply { to, payload } => (to, payload),
            other => panic!("expected a reply, got {:?}", other),
        };
        assert_eq!(to, addr("10.0.0.2:45454"));
        let response = protocol::decode(&payload).unwrap();
        assert_eq!(response.sender_id, "a");
        assert!(matches!(response.body, MessageBody::Response { .. }));
        assert_eq!(response.body.proposal(), Some(ctx.config.comm_group()));

        // The requester is now a member, advertising its own proposal.
        assert_eq!(ctx.table.get("b").unwrap().comm, SocketAddr::V4(proposal));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn response_moves_heartbeat_target() {
        let (ctx, mut rx) = context();
        let proposal: SocketAddrV4 = "239.255.43.40:46100".parse().unwrap();
        let response =
            protocol::encode(&DiscoveryMessage::response(&NodeIdentity::new("b", "Bob"), proposal))
                .unwrap();

        assert_eq!(deliver(&ctx, &response, "10.0.0.2:45454"), Action::Nothing);
        deliver(&ctx, &response, "10.0.0.2:45454");

        assert_eq!(ctx.current_target(), Some(SocketAddr::V4(proposal)));
        assert_eq!(ctx.proposal(), proposal);
        let negotiated: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.kind() == EventKind::Negotiated)
            .collect();
        assert_eq!(negotiated.len(), 1);
    }

    #[test]
    fn response_is_not_adopted_without_negotiation() {
        let config = DiscoveryConfig {
            negotiate: false,
            ..Default::default()
        };
        let ctx = Context::new(NodeIdentity::new("a", "Alice"), config);
        let proposal: SocketAddrV4 = "239.255.43.40:46100".parse().unwrap();
        let response =
            protocol::encode(&DiscoveryMessage::response(&NodeIdentity::new("b", "Bob"), proposal))
                .unwrap();

        deliver(&ctx, &response, "10.0.0.2:45454");

        assert_eq!(ctx.current_target(), None);
        assert!(ctx.table.get("b").is_some());
    }

    #[test]
    fn garbage_is_dropped() {
        let (ctx, mut rx) = context();

        for bytes in [
            &b""[..],
            b"{",
            b"\x00\x01\x02",
            br#"{"kind":"gossip","senderId":"b","timestamp":1}"#,
            br#"{"kind":"announce","senderId":"b","timestamp":"x","displayName":"B"}"#,
        ] {
            assert_eq!(deliver(&ctx, bytes, "10.0.0.2:45454"), Action::Nothing);
        }

        assert!(ctx.table.is_empty());
        assert!(drain(&mut rx).is_empty());
    }
}
