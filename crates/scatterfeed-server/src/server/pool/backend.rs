use anyhow::Context;
use core::time::Duration;
use scatterfeed_core::proto::{
    CancelRequestMessage, ChunkRequest, DataChunk, QueryRequest,
    data_service_client::DataServiceClient,
};
use tonic::{
    Request, Status,
    codec::CompressionEncoding,
    transport::{Channel, Endpoint},
};

/// The chunk protocol as seen from a leader.
///
/// Every backend a leader fans out to implements this, whether it sits
/// behind a gRPC channel or runs in the same process.
#[tonic::async_trait]
pub trait ChunkBackend: Send + Sync {
    async fn initiate(&self, query: &str) -> Result<DataChunk, Status>;

    async fn next_chunk(&self, request_id: &str) -> Result<DataChunk, Status>;

    /// Returns whether the backend still held state for `request_id`.
    async fn cancel(&self, request_id: &str) -> Result<bool, Status>;
}

/// A remote worker reached over gRPC.
///
/// The channel connects lazily and reconnects on its own, so a worker that
/// is down at startup only fails the requests that need it.
#[derive(Clone, Debug)]
pub struct GrpcBackend {
    client: DataServiceClient<Channel>,
}

impl GrpcBackend {
    pub fn connect_lazy(address: &str, connect_timeout: Duration) -> anyhow::Result<Self> {
        let channel = Endpoint::from_shared(address.to_string())
            .with_context(|| format!("invalid worker address `{address}`"))?
            .connect_timeout(connect_timeout)
            .tcp_nodelay(true)
            .connect_lazy();

        let client = DataServiceClient::new(channel)
            .send_compressed(CompressionEncoding::Zstd)
            .accept_compressed(CompressionEncoding::Zstd)
            .accept_compressed(CompressionEncoding::Gzip);

        Ok(Self { client })
    }
}

#[tonic::async_trait]
impl ChunkBackend for GrpcBackend {
    async fn initiate(&self, query: &str) -> Result<DataChunk, Status> {
        let mut client = self.client.clone();
        let request = Request::new(QueryRequest {
            query: query.to_string(),
        });
        Ok(client.initiate_request(request).await?.into_inner())
    }

    async fn next_chunk(&self, request_id: &str) -> Result<DataChunk, Status> {
        let mut client = self.client.clone();
        let request = Request::new(ChunkRequest {
            request_id: request_id.to_string(),
        });
        Ok(client.get_next_chunk(request).await?.into_inner())
    }

    async fn cancel(&self, request_id: &str) -> Result<bool, Status> {
        let mut client = self.client.clone();
        let request = Request::new(CancelRequestMessage {
            request_id: request_id.to_string(),
        });
        Ok(client.cancel_request(request).await?.into_inner().success)
    }
}
