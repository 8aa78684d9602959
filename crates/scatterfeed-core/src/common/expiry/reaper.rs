//! Background sweep task for an [`ExpiringMap`].

use super::ExpiringMap;
use std::sync::Arc;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tokio_util::sync::CancellationToken;

/// Spawns the periodic sweep over `map`.
///
/// The first sweep runs one `sweep_interval` after spawning. Every eviction
/// is logged under `store`; `on_sweep` receives the evicted keys after each
/// sweep, including sweeps that evicted nothing. The task exits once
/// `shutdown` is cancelled.
///
/// # Panics
///
/// Panics if the map's sweep interval is zero.
pub fn spawn_reaper<V, F>(
    map: Arc<ExpiringMap<V>>,
    store: &'static str,
    shutdown: CancellationToken,
    on_sweep: F,
) -> JoinHandle<()>
where
    V: Send + 'static,
    F: Fn(&[String]) + Send + 'static,
{
    let period = map.policy().sweep_interval;
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(store, ?period, "reaper started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = map.sweep();
                    for key in &evicted {
                        tracing::info!(store, request_id = %key, "evicted idle entry");
                    }
                    on_sweep(&evicted);
                }
            }
        }
        tracing::debug!(store, "reaper stopped");
    })
}
