use crate::channel::MulticastChannel;
use crate::discovery::Context;
use crate::events::DiscoveryEvent;
use crate::protocol::{self, DiscoveryMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Heartbeat loop. Sends one Announce per interval to the active target until cancelled.
pub(crate) async fn run(ctx: Arc<Context>, channel: Arc<MulticastChannel>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.config.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let fallback_at = Instant::now() + ctx.config.negotiation_timeout();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(target) = settle_target(&ctx, fallback_at, Instant::now()) else {
            tracing::trace!("Negotiation pending, holding heartbeat");
            continue;
        };
        heartbeat(&ctx, &channel, target).await;
    }
    tracing::debug!("Announcer stopped");
}

/// The target to heartbeat on, or `None` while still waiting for a Response.
/// Past `fallback_at` nobody has answered, so we take our own configured group.
pub(crate) fn settle_target(ctx: &Context, fallback_at: Instant, now: Instant) -> Option<SocketAddr> {
    if let Some(target) = ctx.current_target() {
        return Some(target);
    }
    if now < fallback_at {
        return None;
    }

    let fallback = ctx.config.comm_group();
    let adopted = ctx.target.send_if_modified(|target| {
        if target.is_none() {
            *target = Some(fallback);
            true
        } else {
            false
        }
    });
    if adopted {
        tracing::info!("No discovery response received, heartbeating on {}", fallback);
    }
    ctx.current_target()
}

async fn heartbeat(ctx: &Context, channel: &MulticastChannel, target: SocketAddr) {
    let payload = match protocol::encode(&DiscoveryMessage::announce(&ctx.identity)) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Failed to encode heartbeat: {}", e);
            return;
        }
    };
    match channel.send_to(&payload, target).await {
        Ok(_) => tracing::trace!("Heartbeat sent to {}", target),
        Err(e) => {
            // The next tick is the retry.
            tracing::warn!("Failed to send heartbeat: {}", e);
            ctx.events
                .emit(DiscoveryEvent::Error(format!("heartbeat to {} failed: {}", target, e)));
        }
    }
}
