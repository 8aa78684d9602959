use super::{
    cache::{CachePolicy, QueryCache},
    correlation::{CorrelationEntry, CorrelationStore, Recording, WorkerSlot},
};
use crate::server::{
    pool::manager::WorkerPool,
    telemetry::{
        increment_cache_hits, increment_cache_misses, increment_worker_failures,
        record_chunk_records,
    },
};
use scatterfeed_core::{
    CloseReason, Error, Result, expiry::ExpiryPolicy, ids::RequestIdGenerator, proto::DataChunk,
};
use std::sync::Arc;
use tonic::Code;

/// Presents a fixed set of workers as a single chunked record stream.
///
/// Every request is fanned out to all workers; their chunks are concatenated
/// in worker priority order and their individual exhaustion folds into one
/// `has_more` flag. No store lock is held while a worker call is in flight.
///
/// With a [`QueryCache`] attached, a query whose complete result was
/// delivered recently is replayed from the cache without touching the
/// workers.
pub struct ScatterGatherCoordinator {
    pool: Arc<WorkerPool>,
    correlations: CorrelationStore,
    cache: Option<QueryCache>,
    ids: Arc<dyn RequestIdGenerator>,
}

impl ScatterGatherCoordinator {
    pub fn new(
        pool: Arc<WorkerPool>,
        policy: ExpiryPolicy,
        cache: Option<CachePolicy>,
        ids: Arc<dyn RequestIdGenerator>,
    ) -> Self {
        Self {
            pool,
            correlations: CorrelationStore::new(policy),
            cache: cache.map(|cache| QueryCache::new(cache, policy, Arc::clone(&ids))),
            ids,
        }
    }

    pub fn correlations(&self) -> &CorrelationStore {
        &self.correlations
    }

    pub fn cache(&self) -> Option<&QueryCache> {
        self.cache.as_ref()
    }

    /// Starts a request on every worker and returns the merged first chunk.
    ///
    /// # Errors
    ///
    /// Fails as a whole if any worker fails. Nothing is stored in that case
    /// and workers that did answer are not told to clean up; their sessions
    /// are left to the worker-side reaper.
    pub async fn initiate(&self, query: &str) -> Result<DataChunk> {
        if self.pool.is_shutting_down() {
            return Err(Error::ServiceShutdown);
        }
        if self.pool.is_empty() {
            return Err(Error::Internal {
                context: "no workers configured".to_string(),
            });
        }

        if let Some(cache) = &self.cache {
            if let Some(records) = cache.lookup(query) {
                increment_cache_hits();
                let chunk = cache.replay(records);
                tracing::debug!(
                    request_id = %chunk.request_id,
                    records = chunk.records.len(),
                    has_more = chunk.has_more,
                    "request served from cache"
                );
                record_chunk_records(chunk.records.len());
                return Ok(chunk);
            }
            increment_cache_misses();
        }

        let replies = self
            .pool
            .fan_out(0..self.pool.len(), |_, worker| worker.backend.initiate(query))
            .await;

        let mut records = Vec::new();
        let mut slots = Vec::with_capacity(replies.len());
        let mut failure = None;

        for (worker, reply) in replies {
            let name = self.pool.name(worker);
            match reply {
                Ok(chunk) => {
                    tracing::debug!(
                        worker = name,
                        session_id = %chunk.request_id,
                        records = chunk.records.len(),
                        has_more = chunk.has_more,
                        "worker session opened"
                    );
                    records.extend(chunk.records);
                    slots.push(WorkerSlot {
                        worker,
                        session_id: chunk.request_id,
                        has_more: chunk.has_more,
                    });
                }
                Err(status) => {
                    tracing::warn!(worker = name, %status, "worker failed to initiate request");
                    increment_worker_failures(name);
                    failure.get_or_insert_with(|| Error::from_worker_status(name, &status));
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }

        let request_id = self.ids.next_id();
        let entry = CorrelationEntry::new(slots);
        let has_more = entry.has_more();
        let recording = self.cache.as_ref().map(|_| Recording {
            query: query.to_string(),
            records: records.clone(),
        });
        if let Some(finished) = self.correlations.store(&request_id, entry, recording) {
            self.remember(finished);
        }

        tracing::debug!(
            %request_id,
            records = records.len(),
            has_more,
            active = self.correlations.active_requests(),
            "request initiated"
        );
        record_chunk_records(records.len());
        Ok(DataChunk {
            request_id,
            records,
            has_more,
        })
    }

    /// Fetches the next chunk from every worker that still has records.
    ///
    /// A worker whose call fails contributes nothing this time and is asked
    /// again on the next call.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `request_id` is unknown, drained, cancelled or
    /// expired. A worker that no longer knows its session makes the request
    /// impossible to complete: it is closed, the other workers are told to
    /// drop their sessions and `NotFound` is returned so the caller restarts.
    pub async fn next_chunk(&self, request_id: &str) -> Result<DataChunk> {
        if let Some(cache) = &self.cache
            && cache.owns(request_id)
        {
            let chunk = cache.next_chunk(request_id)?;
            record_chunk_records(chunk.records.len());
            return Ok(chunk);
        }

        let mut entry = self.correlations.get(request_id)?;
        let pending: Vec<usize> = entry.pending().map(|slot| slot.worker).collect();

        let replies = {
            let entry = &entry;
            self.pool
                .fan_out(pending, |worker, handle| {
                    let session_id = entry.session_id(worker).unwrap_or_default();
                    handle.backend.next_chunk(session_id)
                })
                .await
        };

        let mut records = Vec::new();
        let mut flags = Vec::with_capacity(replies.len());
        let mut lost = false;
        for (worker, reply) in replies {
            let name = self.pool.name(worker);
            match reply {
                Ok(chunk) => {
                    records.extend(chunk.records);
                    flags.push((worker, chunk.has_more));
                }
                Err(status) if status.code() == Code::NotFound => {
                    tracing::warn!(worker = name, %request_id, %status, "worker session lost");
                    increment_worker_failures(name);
                    lost = true;
                }
                Err(status) => {
                    tracing::warn!(worker = name, %request_id, %status, "worker chunk skipped");
                    increment_worker_failures(name);
                }
            }
        }

        if lost {
            if let Some(entry) = self.correlations.abandon(request_id) {
                self.release_sessions(request_id, &entry).await;
            }
            return Err(Error::not_found(request_id, CloseReason::WorkerLost));
        }

        self.correlations.append_records(request_id, &records);
        for (worker, has_more) in flags {
            entry.set_has_more(worker, has_more);
            if let Some(finished) = self
                .correlations
                .update_worker_has_more(request_id, worker, has_more)
            {
                self.remember(finished);
            }
        }

        let has_more = entry.has_more();
        if !has_more {
            tracing::debug!(%request_id, "request drained");
        }
        record_chunk_records(records.len());
        Ok(DataChunk {
            request_id: request_id.to_string(),
            records,
            has_more,
        })
    }

    /// Drops the request locally, then asks every worker to drop its session.
    ///
    /// Local state goes first so a racing [`next_chunk`](Self::next_chunk)
    /// sees `NotFound`. Worker failures are logged and otherwise ignored.
    pub async fn cancel(&self, request_id: &str) -> bool {
        if let Some(cache) = &self.cache
            && cache.owns(request_id)
        {
            let live = cache.cancel(request_id);
            tracing::debug!(%request_id, live, "cached replay cancelled");
            return true;
        }

        let Some(entry) = self.correlations.remove(request_id) else {
            tracing::debug!(%request_id, "cancel for unknown or closed request");
            return true;
        };

        self.release_sessions(request_id, &entry).await;
        tracing::debug!(%request_id, "request cancelled");
        true
    }

    /// Best-effort cancel of every worker session behind `entry`.
    async fn release_sessions(&self, request_id: &str, entry: &CorrelationEntry) {
        let targets = entry.slots().iter().map(|slot| slot.worker);
        let acks = self
            .pool
            .fan_out(targets, |worker, handle| {
                let session_id = entry.session_id(worker).unwrap_or_default();
                handle.backend.cancel(session_id)
            })
            .await;

        for (worker, ack) in acks {
            let name = self.pool.name(worker);
            match ack {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(worker = name, %request_id, "worker session already gone");
                }
                Err(status) => {
                    tracing::warn!(worker = name, %request_id, %status, "worker cancel failed");
                    increment_worker_failures(name);
                }
            }
        }
    }

    fn remember(&self, recording: Recording) {
        if let Some(cache) = &self.cache {
            cache.insert(recording);
        }
    }
}
