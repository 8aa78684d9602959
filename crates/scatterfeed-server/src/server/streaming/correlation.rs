use scatterfeed_core::{
    CloseReason, Result,
    expiry::{Drainable, ExpiringMap, ExpiryPolicy},
    types::Record,
};
use std::sync::Arc;

/// One worker's share of a leader request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSlot {
    /// Position of the worker in the configured priority order.
    pub worker: usize,
    /// The session id that worker issued for this request.
    pub session_id: String,
    /// Whether that worker reported more records on its latest reply.
    pub has_more: bool,
}

/// Leader-side state for one external request id.
///
/// Session ids and exhaustion flags live in the same slot, so every worker
/// with a session id always has a flag. The aggregate flag is derived, never
/// stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationEntry {
    slots: Vec<WorkerSlot>,
}

impl CorrelationEntry {
    pub fn new(mut slots: Vec<WorkerSlot>) -> Self {
        slots.sort_by_key(|slot| slot.worker);
        Self { slots }
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    /// Slots of workers still expected to produce records, in priority order.
    pub fn pending(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.iter().filter(|slot| slot.has_more)
    }

    pub fn session_id(&self, worker: usize) -> Option<&str> {
        self.slot(worker).map(|slot| slot.session_id.as_str())
    }

    /// OR over every worker's flag.
    pub fn has_more(&self) -> bool {
        self.slots.iter().any(|slot| slot.has_more)
    }

    /// Updates one worker's flag. Unknown workers are ignored.
    pub fn set_has_more(&mut self, worker: usize, has_more: bool) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.worker == worker) {
            slot.has_more = has_more;
        }
    }

    fn slot(&self, worker: usize) -> Option<&WorkerSlot> {
        self.slots.iter().find(|slot| slot.worker == worker)
    }
}

impl Drainable for CorrelationEntry {
    fn is_drained(&self) -> bool {
        !self.has_more()
    }
}

/// Everything a request has delivered so far, kept so a finished query can
/// be served again from the result cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub query: String,
    pub records: Vec<Record>,
}

/// A live correlation: the worker slots plus the optional recording.
#[derive(Debug, Clone)]
pub struct Correlation {
    entry: CorrelationEntry,
    recording: Option<Recording>,
}

impl Drainable for Correlation {
    fn is_drained(&self) -> bool {
        self.entry.is_drained()
    }
}

/// Maps leader request ids to the worker sessions behind them.
pub struct CorrelationStore {
    entries: Arc<ExpiringMap<Correlation>>,
}

impl CorrelationStore {
    pub fn new(policy: ExpiryPolicy) -> Self {
        Self {
            entries: Arc::new(ExpiringMap::new(policy)),
        }
    }

    /// The underlying map, shared with the reaper.
    pub fn entries(&self) -> &Arc<ExpiringMap<Correlation>> {
        &self.entries
    }

    /// Records a freshly fanned-out request, replacing any previous entry
    /// under the same id. An entry with nothing left to fetch is recorded as
    /// exhausted straight away and its finished recording is handed back.
    pub fn store(
        &self,
        request_id: &str,
        entry: CorrelationEntry,
        recording: Option<Recording>,
    ) -> Option<Recording> {
        if entry.has_more() {
            self.entries
                .insert(request_id, Correlation { entry, recording });
            None
        } else {
            self.entries
                .insert_closed(request_id, CloseReason::Exhausted);
            recording
        }
    }

    /// Returns a copy of the entry and extends its lifetime.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` tagged with why the id no longer resolves.
    pub fn get(&self, request_id: &str) -> Result<CorrelationEntry> {
        self.entries
            .access(request_id, |correlation| correlation.entry.clone())
    }

    /// Adds delivered records to the request's recording, if it keeps one.
    pub fn append_records(&self, request_id: &str, records: &[Record]) {
        self.entries
            .update(request_id, |correlation| {
                if let Some(recording) = &mut correlation.recording {
                    recording.records.extend_from_slice(records);
                }
            })
            .ok();
    }

    /// Refreshes one worker's flag in place. Does nothing if the entry has
    /// already gone; closes it as exhausted once no worker has more, handing
    /// back the finished recording.
    pub fn update_worker_has_more(
        &self,
        request_id: &str,
        worker: usize,
        has_more: bool,
    ) -> Option<Recording> {
        self.entries
            .update(request_id, |correlation| {
                correlation.entry.set_has_more(worker, has_more);
                if correlation.entry.has_more() {
                    None
                } else {
                    correlation.recording.take()
                }
            })
            .ok()
            .flatten()
    }

    /// Deletes the entry unconditionally, closing it as cancelled. Hands back
    /// the slots it held if it was live.
    pub fn remove(&self, request_id: &str) -> Option<CorrelationEntry> {
        self.entries
            .close(request_id, CloseReason::Cancelled)
            .map(|correlation| correlation.entry)
    }

    /// Closes a request that can no longer be completed because a worker
    /// lost its session.
    pub fn abandon(&self, request_id: &str) -> Option<CorrelationEntry> {
        self.entries
            .close(request_id, CloseReason::WorkerLost)
            .map(|correlation| correlation.entry)
    }

    pub fn active_requests(&self) -> usize {
        self.entries.active_len()
    }
}
