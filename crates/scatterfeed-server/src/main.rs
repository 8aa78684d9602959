#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use futures::Stream;
use scatterfeed_core::proto::{
    FILE_DESCRIPTOR_SET,
    data_service_server::{DataService, DataServiceServer},
};
use server::config::{CliArgs, RoleConfig, ServerConfig};
use server::dataset::Dataset;
use server::service::{Housekeeping, leader::LeaderService, worker::WorkerService};
use server::telemetry::{TelemetryProviders, init_telemetry};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Connected;
use tonic::{codec::CompressionEncoding, transport::Server};
use tonic_health::server::HealthReporter;
use tonic_reflection::server::Builder;
use tonic_web::GrpcWebLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    match &config.role {
        RoleConfig::Worker(worker) => {
            let dataset = match &worker.data_file {
                Some(path) => Dataset::load(path).await?,
                None => Dataset::empty(),
            };
            if dataset.is_empty() {
                tracing::warn!("Worker partition is empty; every query returns no records");
            } else {
                tracing::info!(records = dataset.len(), "Loaded worker partition");
            }
            let service = WorkerService::new(&config, worker, dataset);
            let housekeeping = service.housekeeping();
            listen(service, housekeeping, providers, &config).await
        }
        RoleConfig::Leader(leader) => {
            let service = LeaderService::connect(&config, leader)?;
            let housekeeping = service.housekeeping();
            listen(service, housekeeping, providers, &config).await
        }
    }
}

async fn listen<S: DataService>(
    service: S,
    housekeeping: Arc<Housekeeping>,
    providers: TelemetryProviders,
    config: &ServerConfig,
) -> anyhow::Result<()> {
    if config.uds {
        #[cfg(unix)]
        {
            use tokio::net::UnixListener;
            use tokio_stream::wrappers::UnixListenerStream;
            let uds_path = config.server_addr.clone();
            let uds = UnixListener::bind(&uds_path)?;
            let incoming = UnixListenerStream::new(uds);
            log_startup_info(&uds_path, config);
            let res = run_server_with_incoming(service, housekeeping, providers, incoming).await;
            // A panic can still leave the socket file behind.
            let _ = std::fs::remove_file(&uds_path);
            res
        }
        #[cfg(not(unix))]
        {
            let _ = (service, housekeeping, providers);
            anyhow::bail!("Unix domain sockets are not supported on this platform");
        }
    } else {
        let tcp_path = config.server_addr.clone();
        let tcp = TcpListener::bind(&tcp_path).await?;
        let incoming = TcpListenerStream::new(tcp);
        log_startup_info(&tcp_path, config);
        run_server_with_incoming(service, housekeeping, providers, incoming).await
    }
}

async fn run_server_with_incoming<S, I, IO, IE>(
    service: S,
    housekeeping: Arc<Housekeeping>,
    providers: TelemetryProviders,
    incoming: I,
) -> anyhow::Result<()>
where
    S: DataService,
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
{
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter.set_serving::<DataServiceServer<S>>().await;

    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    Server::builder()
        .accept_http1(true)
        .http2_adaptive_window(Some(true))
        .layer(
            ServiceBuilder::new()
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(GrpcWebLayer::new()),
        )
        .add_service(health_service)
        .add_service(reflection)
        .add_service(build_data_service(service))
        .serve_with_incoming_shutdown(
            incoming,
            shutdown_signal::<S>(housekeeping, health_reporter, providers),
        )
        .await?;

    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(addr: &str, config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting data service on {} with full config: {:#?}", addr, config);
    } else {
        match &config.role {
            RoleConfig::Worker(worker) => tracing::info!(
                "Starting worker on {} with chunk size {}",
                addr,
                worker.chunk_size
            ),
            RoleConfig::Leader(leader) => tracing::info!(
                "Starting leader on {} with {} workers",
                addr,
                leader.workers.len()
            ),
        }
    }
}

fn build_data_service<S: DataService>(service: S) -> DataServiceServer<S> {
    DataServiceServer::new(service)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}

async fn shutdown_signal<S: DataService>(
    housekeeping: Arc<Housekeeping>,
    health_reporter: HealthReporter,
    providers: TelemetryProviders,
) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");

    // 1. Publish the status
    health_reporter
        .set_not_serving::<DataServiceServer<S>>()
        .await;

    // 2. Stop accepting work and stop the reaper
    housekeeping.shutdown().await;

    // 3. Flush exporters
    providers.shutdown();
}
