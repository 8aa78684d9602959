//! gRPC service fronting a fixed, ordered list of workers.
//!
//! [`LeaderService`] exposes the same chunk protocol as a worker, so callers
//! cannot tell that the records come from several backends. All of the
//! coordination lives in [`ScatterGatherCoordinator`].

use super::Housekeeping;
use crate::server::{
    config::{LeaderConfig, ServerConfig},
    pool::{
        backend::GrpcBackend,
        manager::{WorkerHandle, WorkerPool},
    },
    streaming::{cache::CachePolicy, coordinator::ScatterGatherCoordinator},
    telemetry::{increment_not_found, increment_requests},
};
use scatterfeed_core::{
    ids::{RequestIdGenerator, SequenceIdGenerator},
    proto::{
        Ack, CancelRequestMessage, ChunkRequest, DataChunk, QueryRequest,
        data_service_server::DataService,
    },
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

#[derive(Clone)]
pub struct LeaderService {
    coordinator: Arc<ScatterGatherCoordinator>,
    housekeeping: Arc<Housekeeping>,
}

impl LeaderService {
    /// Builds lazily connected gRPC backends for every configured worker.
    ///
    /// Must be called within a Tokio runtime.
    pub fn connect(config: &ServerConfig, leader: &LeaderConfig) -> anyhow::Result<Self> {
        let workers = leader
            .workers
            .iter()
            .map(|endpoint| {
                let backend = GrpcBackend::connect_lazy(&endpoint.address, leader.connect_timeout)?;
                Ok(WorkerHandle::new(endpoint.name.clone(), Arc::new(backend)))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let ids = Arc::new(SequenceIdGenerator::new(leader.id_prefix.clone()));
        Ok(Self::new(config, workers, leader.cache, ids))
    }

    /// Creates the service over already built backends and starts the
    /// reapers over its correlations and cached replays.
    pub fn new(
        config: &ServerConfig,
        workers: Vec<WorkerHandle>,
        cache: Option<CachePolicy>,
        ids: Arc<dyn RequestIdGenerator>,
    ) -> Self {
        let shutdown_token = CancellationToken::new();
        let pool = Arc::new(WorkerPool::new(workers, shutdown_token.clone()));
        let coordinator = Arc::new(ScatterGatherCoordinator::new(
            pool,
            config.expiry,
            cache,
            ids,
        ));
        let housekeeping = Housekeeping::new(shutdown_token, config.shutdown_timeout);
        housekeeping.watch(
            Arc::clone(coordinator.correlations().entries()),
            "correlations",
        );
        if let Some(cache) = coordinator.cache() {
            housekeeping.watch(Arc::clone(cache.replays().sessions()), "replays");
        }

        Self {
            coordinator,
            housekeeping: Arc::new(housekeeping),
        }
    }

    pub fn housekeeping(&self) -> Arc<Housekeeping> {
        Arc::clone(&self.housekeeping)
    }

    pub fn coordinator(&self) -> &ScatterGatherCoordinator {
        &self.coordinator
    }
}

#[tonic::async_trait]
impl DataService for LeaderService {
    #[tracing::instrument(skip_all, fields(query = %req.get_ref().query))]
    async fn initiate_request(
        &self,
        req: Request<QueryRequest>,
    ) -> Result<Response<DataChunk>, Status> {
        increment_requests("initiate");
        let chunk = self.coordinator.initiate(&req.get_ref().query).await?;
        Ok(Response::new(chunk))
    }

    #[tracing::instrument(skip_all, fields(request_id = %req.get_ref().request_id))]
    async fn get_next_chunk(
        &self,
        req: Request<ChunkRequest>,
    ) -> Result<Response<DataChunk>, Status> {
        increment_requests("next_chunk");
        let chunk = self
            .coordinator
            .next_chunk(&req.get_ref().request_id)
            .await
            .inspect_err(|e| {
                if e.is_not_found() {
                    increment_not_found();
                }
            })?;
        Ok(Response::new(chunk))
    }

    #[tracing::instrument(skip_all, fields(request_id = %req.get_ref().request_id))]
    async fn cancel_request(
        &self,
        req: Request<CancelRequestMessage>,
    ) -> Result<Response<Ack>, Status> {
        increment_requests("cancel");
        let success = self.coordinator.cancel(&req.get_ref().request_id).await;
        Ok(Response::new(Ack { success }))
    }
}
