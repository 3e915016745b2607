//! Periodic eviction of counters whose retention has lapsed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::quota::clock::Clock;
use crate::quota::store::CounterStore;

pub fn spawn_compaction(
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.evict_expired(clock.now()).await {
                Ok(0) => {}
                Ok(n) => debug!("Evicted {n} expired quota counters"),
                Err(e) => warn!("Quota counter compaction failed: {e}"),
            }
        }
    })
}
