//! The fixed set of backend workers a leader addresses.
//!
//! This module defines the [`WorkerPool`] struct, which owns one
//! [`ChunkBackend`] per configured worker in priority order and fans calls
//! out to any subset of them concurrently. Results always come back in
//! priority order, however the replies interleave on the wire.

use super::backend::ChunkBackend;
use core::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A named backend worker.
#[derive(Clone)]
pub struct WorkerHandle {
    pub name: String,
    pub backend: Arc<dyn ChunkBackend>,
}

impl WorkerHandle {
    pub fn new(name: impl Into<String>, backend: Arc<dyn ChunkBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
        }
    }
}

impl core::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Backend workers in their fixed priority order.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    shutdown_token: CancellationToken,
}

impl WorkerPool {
    /// Constructs a pool from workers listed in priority order.
    pub const fn new(workers: Vec<WorkerHandle>, shutdown_token: CancellationToken) -> Self {
        Self {
            workers,
            shutdown_token,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn name(&self, worker: usize) -> &str {
        self.workers
            .get(worker)
            .map_or("unknown", |handle| handle.name.as_str())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Calls every worker in `targets` concurrently and waits for all of
    /// them.
    ///
    /// The result lists `(worker, output)` pairs in the order `targets` named
    /// them, regardless of which reply arrived first. Unknown indices are
    /// skipped.
    pub async fn fan_out<'a, T, F, Fut>(
        &'a self,
        targets: impl IntoIterator<Item = usize>,
        call: F,
    ) -> Vec<(usize, T)>
    where
        F: Fn(usize, &'a WorkerHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        let calls = targets.into_iter().filter_map(|worker| {
            let handle = self.workers.get(worker)?;
            let fut = call(worker, handle);
            Some(async move { (worker, fut.await) })
        });

        futures::future::join_all(calls).await
    }
}
