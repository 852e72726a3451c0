use crate::membership::MembershipTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Evict peers silent for longer than `timeout`, checking every `sweep`.
pub(crate) async fn run(
    table: Arc<MembershipTable>,
    timeout: Duration,
    sweep: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + sweep, sweep);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = table.expire(timeout, Instant::now());
                if !evicted.is_empty() {
                    tracing::info!("Removed {} expired peers", evicted.len());
                    for peer in &evicted {
                        tracing::debug!("  - {} ({})", peer.id, peer.source);
                    }
                }
            }
        }
    }
    tracing::debug!("Reaper stopped");
}
