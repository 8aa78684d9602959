use scatterfeed_core::{
    CloseReason, Result,
    expiry::{Drainable, ExpiringMap, ExpiryPolicy},
    ids::RequestIdGenerator,
    proto::DataChunk,
    types::{Record, RecordSet},
};
use std::sync::Arc;

/// A cursor over an immutable record snapshot.
///
/// The cursor only moves forward and never passes the end of the snapshot,
/// so `has_more` is exactly `cursor < records.len()`.
#[derive(Debug, Clone)]
pub struct PaginationSession {
    records: RecordSet,
    cursor: usize,
}

impl PaginationSession {
    pub const fn new(records: RecordSet) -> Self {
        Self { records, cursor: 0 }
    }

    pub fn has_more(&self) -> bool {
        self.cursor < self.records.len()
    }

    /// Returns records `[cursor, cursor + chunk_size)` clipped to the
    /// snapshot and advances the cursor past them.
    pub fn next_chunk(&mut self, chunk_size: usize) -> Vec<Record> {
        let end = self
            .cursor
            .saturating_add(chunk_size)
            .min(self.records.len());
        let chunk = self.records[self.cursor..end].to_vec();
        self.cursor = end;
        chunk
    }
}

impl Drainable for PaginationSession {
    fn is_drained(&self) -> bool {
        !self.has_more()
    }
}

/// Worker-side table of live pagination sessions.
///
/// Sessions remove themselves the moment their last record is handed out;
/// idle ones are left to the reaper driving [`SessionStore::sessions`].
pub struct SessionStore {
    sessions: Arc<ExpiringMap<PaginationSession>>,
    ids: Arc<dyn RequestIdGenerator>,
    chunk_size: usize,
}

impl SessionStore {
    /// `chunk_size` must be at least 1; configuration validates it.
    pub fn new(chunk_size: usize, policy: ExpiryPolicy, ids: Arc<dyn RequestIdGenerator>) -> Self {
        debug_assert!(chunk_size > 0);
        Self {
            sessions: Arc::new(ExpiringMap::new(policy)),
            ids,
            chunk_size,
        }
    }

    /// The underlying map, shared with the reaper.
    pub fn sessions(&self) -> &Arc<ExpiringMap<PaginationSession>> {
        &self.sessions
    }

    /// Opens a session over `records` and returns its first chunk.
    ///
    /// A snapshot that fits in one chunk is exhausted immediately; its id is
    /// still returned and resolves to `NotFound` from then on.
    pub fn initiate(&self, records: RecordSet) -> DataChunk {
        let session_id = self.ids.next_id();
        let mut session = PaginationSession::new(records);
        let first = session.next_chunk(self.chunk_size);
        let has_more = session.has_more();

        if has_more {
            self.sessions.insert(session_id.clone(), session);
        } else {
            self.sessions
                .insert_closed(session_id.clone(), CloseReason::Exhausted);
        }

        tracing::debug!(%session_id, records = first.len(), has_more, "session opened");
        DataChunk {
            request_id: session_id,
            records: first,
            has_more,
        }
    }

    /// Returns the next chunk of a session.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session never existed, was drained,
    /// cancelled or reaped.
    pub fn next_chunk(&self, session_id: &str) -> Result<DataChunk> {
        let chunk_size = self.chunk_size;
        let (records, has_more) = self.sessions.update(session_id, |session| {
            let records = session.next_chunk(chunk_size);
            (records, session.has_more())
        })?;

        if !has_more {
            tracing::debug!(%session_id, "session drained");
        }
        Ok(DataChunk {
            request_id: session_id.to_string(),
            records,
            has_more,
        })
    }

    /// Drops a session. Returns whether it was live.
    pub fn cancel(&self, session_id: &str) -> bool {
        self.sessions
            .close(session_id, CloseReason::Cancelled)
            .is_some()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.active_len()
    }
}
