//! Periodic eviction of stale agents
//!
//! The reaper is the only mechanism that removes agents based on time; a
//! failed heartbeat alone never self-evicts. The 90 s threshold is three
//! heartbeat periods, so one lost heartbeat plus a slow round trip does not
//! cause flapping.

use crate::broker::state::BrokerState;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Spawns the reaper task. Cancelling `shutdown` stops it.
pub fn spawn(
    state: Arc<BrokerState>,
    period: Duration,
    threshold: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; skip it so a
        // freshly started broker never reaps before a full period elapsed.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = state.reap_stale(threshold);
                    if !evicted.is_empty() {
                        info!(count = evicted.len(), "reaped stale agents");
                    }
                }
            }
        }
    })
}
