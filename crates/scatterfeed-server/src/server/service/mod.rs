//! gRPC service implementations for both roles.
//!
//! ## Structure
//!
//! - [`worker`] - `WorkerService`, serving one record partition.
//! - [`leader`] - `LeaderService`, fronting a fixed list of workers.
//!
//! Both own a [`Housekeeping`] handle that runs a reaper over each of their
//! stores and stops them on shutdown.

pub mod leader;
pub mod worker;

use core::time::Duration;
use futures::future::join_all;
use parking_lot::Mutex;
use scatterfeed_core::expiry::{ExpiringMap, spawn_reaper};
use std::sync::Arc;
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::server::telemetry::{increment_evictions, record_active_entries};

/// Background upkeep owned by a service: one reaper per store it watches.
#[derive(Debug)]
pub struct Housekeeping {
    shutdown_token: CancellationToken,
    reapers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl Housekeeping {
    pub fn new(shutdown_token: CancellationToken, shutdown_timeout: Duration) -> Self {
        Self {
            shutdown_token,
            reapers: Mutex::new(Vec::new()),
            shutdown_timeout,
        }
    }

    /// Spawns a reaper for `map`, publishing its evictions and occupancy
    /// under `store`. Must be called within a Tokio runtime.
    pub fn watch<V: Send + 'static>(&self, map: Arc<ExpiringMap<V>>, store: &'static str) {
        let observed = Arc::clone(&map);
        let reaper = spawn_reaper(map, store, self.shutdown_token.clone(), move |evicted| {
            if !evicted.is_empty() {
                increment_evictions(store, evicted.len() as u64);
            }
            record_active_entries(store, observed.active_len() as u64);
        });
        self.reapers.lock().push(reaper);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Refuses new work and waits (up to the shutdown timeout) for every
    /// reaper to stop.
    pub async fn shutdown(&self) {
        tracing::info!("Refusing new requests");
        self.shutdown_token.cancel();

        let reapers = core::mem::take(&mut *self.reapers.lock());
        if reapers.is_empty() {
            return;
        }
        match timeout(self.shutdown_timeout, join_all(reapers)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        tracing::error!("Reaper task failed: {e}");
                    }
                }
                tracing::debug!("Reapers stopped");
            }
            Err(_) => tracing::warn!("Reaper shutdown timed out"),
        }
    }
}
