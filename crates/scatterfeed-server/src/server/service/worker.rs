//! gRPC service for one record partition.
//!
//! [`WorkerService`] answers the chunk protocol directly from a
//! [`SessionStore`]: `InitiateRequest` snapshots the partition (filtered by
//! the query) into a new session and returns its first chunk,
//! `GetNextChunk` advances that session and `CancelRequest` drops it.

use super::Housekeeping;
use crate::server::{
    config::{ServerConfig, WorkerConfig},
    dataset::Dataset,
    pool::backend::ChunkBackend,
    streaming::session::SessionStore,
    telemetry::{increment_not_found, increment_requests, record_chunk_records},
};
use scatterfeed_core::{
    Error,
    ids::SequenceIdGenerator,
    proto::{
        Ack, CancelRequestMessage, ChunkRequest, DataChunk, QueryRequest,
        data_service_server::DataService,
    },
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

#[derive(Clone)]
pub struct WorkerService {
    dataset: Arc<Dataset>,
    sessions: Arc<SessionStore>,
    housekeeping: Arc<Housekeeping>,
}

impl WorkerService {
    /// Creates the service and starts the reaper over its sessions.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(config: &ServerConfig, worker: &WorkerConfig, dataset: Dataset) -> Self {
        let ids = Arc::new(SequenceIdGenerator::new(worker.id_prefix.clone()));
        let sessions = Arc::new(SessionStore::new(worker.chunk_size, config.expiry, ids));
        let housekeeping = Housekeeping::new(CancellationToken::new(), config.shutdown_timeout);
        housekeeping.watch(Arc::clone(sessions.sessions()), "sessions");

        Self {
            dataset: Arc::new(dataset),
            sessions,
            housekeeping: Arc::new(housekeeping),
        }
    }

    pub fn housekeeping(&self) -> Arc<Housekeeping> {
        Arc::clone(&self.housekeeping)
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    fn initiate(&self, query: &str) -> scatterfeed_core::Result<DataChunk> {
        if self.housekeeping.is_shutting_down() {
            return Err(Error::ServiceShutdown);
        }
        let snapshot = self.dataset.select(query)?;
        let chunk = self.sessions.initiate(snapshot);
        tracing::debug!(active = self.sessions.active_sessions(), "partition snapshot served");
        record_chunk_records(chunk.records.len());
        Ok(chunk)
    }

    fn next_chunk(&self, session_id: &str) -> scatterfeed_core::Result<DataChunk> {
        let chunk = self.sessions.next_chunk(session_id).inspect_err(|e| {
            if e.is_not_found() {
                increment_not_found();
            }
        })?;
        record_chunk_records(chunk.records.len());
        Ok(chunk)
    }
}

#[tonic::async_trait]
impl DataService for WorkerService {
    #[tracing::instrument(skip_all, fields(query = %req.get_ref().query))]
    async fn initiate_request(
        &self,
        req: Request<QueryRequest>,
    ) -> Result<Response<DataChunk>, Status> {
        increment_requests("initiate");
        let chunk = self.initiate(&req.get_ref().query)?;
        Ok(Response::new(chunk))
    }

    #[tracing::instrument(skip_all, fields(request_id = %req.get_ref().request_id))]
    async fn get_next_chunk(
        &self,
        req: Request<ChunkRequest>,
    ) -> Result<Response<DataChunk>, Status> {
        increment_requests("next_chunk");
        let chunk = self.next_chunk(&req.get_ref().request_id)?;
        Ok(Response::new(chunk))
    }

    #[tracing::instrument(skip_all, fields(request_id = %req.get_ref().request_id))]
    async fn cancel_request(
        &self,
        req: Request<CancelRequestMessage>,
    ) -> Result<Response<Ack>, Status> {
        increment_requests("cancel");
        let success = self.sessions.cancel(&req.get_ref().request_id);
        tracing::debug!(success, "session cancel");
        Ok(Response::new(Ack { success }))
    }
}

/// Lets a leader drive a worker living in the same process.
#[tonic::async_trait]
impl ChunkBackend for WorkerService {
    async fn initiate(&self, query: &str) -> Result<DataChunk, Status> {
        Ok(WorkerService::initiate(self, query)?)
    }

    async fn next_chunk(&self, request_id: &str) -> Result<DataChunk, Status> {
        Ok(WorkerService::next_chunk(self, request_id)?)
    }

    async fn cancel(&self, request_id: &str) -> Result<bool, Status> {
        Ok(self.sessions.cancel(request_id))
    }
}
