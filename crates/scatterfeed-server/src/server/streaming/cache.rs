use super::{correlation::Recording, session::SessionStore};
use core::time::Duration;
use parking_lot::Mutex;
use scatterfeed_core::{
    CloseReason, Result,
    expiry::ExpiryPolicy,
    ids::RequestIdGenerator,
    proto::DataChunk,
    types::RecordSet,
};
use std::{collections::HashMap, sync::Arc};
use tokio::time::Instant;

/// Limits of the leader's query-result cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachePolicy {
    /// Age after which a cached result is no longer served, counted from
    /// when it was stored. Hits do not extend it.
    pub ttl: Duration,
    /// Most results kept at once. The oldest one makes room for a new one.
    pub max_entries: usize,
    /// Records per chunk when a cached result is replayed.
    pub chunk_size: usize,
}

struct CachedResult {
    records: RecordSet,
    cached_at: Instant,
    hits: u64,
}

/// Complete results of recently finished queries, keyed by query text.
///
/// A hit is replayed through its own [`SessionStore`], so the caller pages
/// through it with a fresh request id exactly as through a live fan-out.
pub struct QueryCache {
    policy: CachePolicy,
    results: Mutex<HashMap<String, CachedResult>>,
    replays: SessionStore,
}

impl QueryCache {
    /// `ids` should be the generator of the owning leader so replay ids and
    /// fan-out ids never collide.
    pub fn new(policy: CachePolicy, expiry: ExpiryPolicy, ids: Arc<dyn RequestIdGenerator>) -> Self {
        Self {
            policy,
            results: Mutex::new(HashMap::new()),
            replays: SessionStore::new(policy.chunk_size, expiry, ids),
        }
    }

    /// The sessions serving cache hits, shared with the reaper.
    pub fn replays(&self) -> &SessionStore {
        &self.replays
    }

    /// Returns the cached result for `query` if it is younger than the TTL.
    /// Stale results are dropped on the way.
    pub fn lookup(&self, query: &str) -> Option<RecordSet> {
        let mut results = self.results.lock();
        let cached = results.get_mut(query)?;
        if cached.cached_at.elapsed() >= self.policy.ttl {
            results.remove(query);
            tracing::debug!(query, "cached result expired");
            return None;
        }
        cached.hits += 1;
        tracing::debug!(query, hits = cached.hits, "cache hit");
        Some(Arc::clone(&cached.records))
    }

    /// Stores a finished query, evicting the oldest result when full.
    pub fn insert(&self, recording: Recording) {
        let mut results = self.results.lock();
        if !results.contains_key(&recording.query) && results.len() >= self.policy.max_entries {
            let oldest = results
                .iter()
                .min_by_key(|(_, cached)| cached.cached_at)
                .map(|(query, _)| query.clone());
            if let Some(oldest) = oldest {
                results.remove(&oldest);
                tracing::debug!(query = %oldest, "cached result evicted");
            }
        }

        tracing::debug!(
            query = %recording.query,
            records = recording.records.len(),
            "query result cached"
        );
        results.insert(
            recording.query,
            CachedResult {
                records: recording.records.into(),
                cached_at: Instant::now(),
                hits: 0,
            },
        );
    }

    /// Opens a replay over a cached result and returns its first chunk.
    pub fn replay(&self, records: RecordSet) -> DataChunk {
        self.replays.initiate(records)
    }

    /// Whether `request_id` was issued for a replay.
    pub fn owns(&self, request_id: &str) -> bool {
        self.replays.sessions().closed_reason(request_id) != Some(CloseReason::Unknown)
    }

    /// # Errors
    ///
    /// Returns `NotFound` once the replay is drained, cancelled or expired.
    pub fn next_chunk(&self, request_id: &str) -> Result<DataChunk> {
        self.replays.next_chunk(request_id)
    }

    pub fn cancel(&self, request_id: &str) -> bool {
        self.replays.cancel(request_id)
    }
}
