use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use core::time::Duration;
use crate::server::streaming::cache::CachePolicy;
use scatterfeed_core::{
    expiry::ExpiryPolicy,
    types::{DEFAULT_CHUNK_SIZE, DEFAULT_IDLE_TIMEOUT, DEFAULT_SWEEP_INTERVAL},
};
use std::{collections::HashSet, path::PathBuf};

/// Runtime configuration for the `scatterfeed-server` binary.
///
/// One binary serves both roles of the chunk protocol. A `worker` owns one
/// partition of the records; a `leader` fans every request out to a fixed,
/// ordered list of workers and merges their chunks. All values are parsed
/// from CLI arguments or environment variables.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "scatterfeed-server",
    version,
    about = "A gRPC service for chunked scatter-gather record streaming"
)]
pub struct CliArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub role: RoleArgs,
}

/// Options shared by both roles.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Address to listen on (TCP or Unix socket path; use --uds for Unix
    /// socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/scatterfeed.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", global = true, default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a
    /// file path.
    #[arg(short, long, global = true, default_value_t = false)]
    pub uds: bool,

    /// Seconds a session or correlation may sit idle before the reaper
    /// evicts it.
    ///
    /// Environment variable: `IDLE_TIMEOUT_SECS`
    #[arg(long, env = "IDLE_TIMEOUT_SECS", global = true, default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs())]
    pub idle_timeout_secs: u64,

    /// Seconds between two reaper sweeps.
    ///
    /// Environment variable: `SWEEP_INTERVAL_SECS`
    #[arg(long, env = "SWEEP_INTERVAL_SECS", global = true, default_value_t = DEFAULT_SWEEP_INTERVAL.as_secs())]
    pub sweep_interval_secs: u64,

    /// Seconds to wait for background tasks during graceful shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", global = true, default_value_t = 3)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Subcommand, Debug, Clone)]
pub enum RoleArgs {
    /// Serve one partition of the records directly.
    Worker(WorkerArgs),
    /// Fan requests out to a fixed list of workers and merge their chunks.
    Leader(LeaderArgs),
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Number of records returned per chunk. Must be at least 1.
    ///
    /// Environment variable: `CHUNK_SIZE`
    #[arg(long, env = "CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// JSON array or JSON-lines file holding this worker's records. Without
    /// it the worker serves an empty partition.
    ///
    /// Environment variable: `DATA_FILE`
    #[arg(long, env = "DATA_FILE")]
    pub data_file: Option<PathBuf>,

    /// Prefix of the session ids handed out by this worker.
    ///
    /// Environment variable: `ID_PREFIX`
    #[arg(long, env = "ID_PREFIX", default_value_t = String::from("session"))]
    pub id_prefix: String,
}

#[derive(Args, Debug, Clone)]
pub struct LeaderArgs {
    /// Comma-separated workers in priority order, each `name=address` or a
    /// bare address. Merged chunks always list records in this order.
    ///
    /// Example: "first-half=10.0.0.5:50055,second-half=10.0.0.6:50056"
    ///
    /// Environment variable: `WORKERS`
    #[arg(long, env = "WORKERS", value_delimiter = ',', required = true)]
    pub workers: Vec<String>,

    /// Prefix of the request ids handed out by this leader.
    ///
    /// Environment variable: `ID_PREFIX`
    #[arg(long, env = "ID_PREFIX", default_value_t = String::from("req"))]
    pub id_prefix: String,

    /// Milliseconds allowed for establishing a connection to a worker.
    ///
    /// Environment variable: `CONNECT_TIMEOUT_MS`
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 1_000)]
    pub connect_timeout_ms: u64,

    /// Seconds a finished query result is replayed from the cache, counted
    /// from when it was stored.
    ///
    /// Environment variable: `CACHE_TTL_SECS`
    #[arg(long, env = "CACHE_TTL_SECS", default_value_t = 300)]
    pub cache_ttl_secs: u64,

    /// Most query results kept in the cache. `0` disables the cache.
    ///
    /// Environment variable: `CACHE_MAX_ENTRIES`
    #[arg(long, env = "CACHE_MAX_ENTRIES", default_value_t = 10)]
    pub cache_max_entries: usize,

    /// Records per chunk when a cached result is replayed.
    ///
    /// Environment variable: `CACHE_CHUNK_SIZE`
    #[arg(long, env = "CACHE_CHUNK_SIZE", default_value_t = 10)]
    pub cache_chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub uds: bool,
    pub expiry: ExpiryPolicy,
    pub shutdown_timeout: Duration,
    pub role: RoleConfig,
}

#[derive(Debug, Clone)]
pub enum RoleConfig {
    Worker(WorkerConfig),
    Leader(LeaderConfig),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub chunk_size: usize,
    pub data_file: Option<PathBuf>,
    pub id_prefix: String,
}

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub workers: Vec<WorkerEndpoint>,
    pub id_prefix: String,
    pub connect_timeout: Duration,
    /// `None` when the result cache is disabled.
    pub cache: Option<CachePolicy>,
}

/// One backend worker as addressed by a leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    pub name: String,
    pub address: String,
}

impl WorkerEndpoint {
    /// Parses `name=address` or a bare address, naming the latter after its
    /// position in the priority order.
    fn parse(raw: &str, position: usize) -> anyhow::Result<Self> {
        let raw = raw.trim();
        let (name, address) = match raw.split_once('=') {
            Some((name, address)) => (name.trim().to_string(), address.trim()),
            None => (format!("worker-{}", position + 1), raw),
        };

        if name.is_empty() {
            bail!("worker entry `{raw}` has an empty name");
        }
        if address.is_empty() {
            bail!("worker `{name}` has an empty address");
        }

        let address = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };

        Ok(Self { name, address })
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let common = args.common;

        if common.idle_timeout_secs == 0 {
            bail!("IDLE_TIMEOUT_SECS must be greater than 0");
        }
        if common.sweep_interval_secs == 0 {
            bail!("SWEEP_INTERVAL_SECS must be greater than 0");
        }

        let role = match args.role {
            RoleArgs::Worker(worker) => {
                if worker.chunk_size == 0 {
                    bail!("CHUNK_SIZE must be greater than 0");
                }
                RoleConfig::Worker(WorkerConfig {
                    chunk_size: worker.chunk_size,
                    data_file: worker.data_file,
                    id_prefix: worker.id_prefix,
                })
            }
            RoleArgs::Leader(leader) => {
                let workers = leader
                    .workers
                    .iter()
                    .filter(|raw| !raw.trim().is_empty())
                    .enumerate()
                    .map(|(position, raw)| WorkerEndpoint::parse(raw, position))
                    .collect::<anyhow::Result<Vec<_>>>()
                    .context("invalid WORKERS list")?;

                if workers.is_empty() {
                    bail!("WORKERS must name at least one worker");
                }

                let mut seen = HashSet::new();
                if let Some(dup) = workers.iter().find(|w| !seen.insert(w.name.as_str())) {
                    bail!("worker name `{}` is used more than once", dup.name);
                }

                let cache = if leader.cache_max_entries == 0 {
                    None
                } else {
                    if leader.cache_ttl_secs == 0 {
                        bail!("CACHE_TTL_SECS must be greater than 0");
                    }
                    if leader.cache_chunk_size == 0 {
                        bail!("CACHE_CHUNK_SIZE must be greater than 0");
                    }
                    Some(CachePolicy {
                        ttl: Duration::from_secs(leader.cache_ttl_secs),
                        max_entries: leader.cache_max_entries,
                        chunk_size: leader.cache_chunk_size,
                    })
                };

                RoleConfig::Leader(LeaderConfig {
                    workers,
                    id_prefix: leader.id_prefix,
                    connect_timeout: Duration::from_millis(leader.connect_timeout_ms),
                    cache,
                })
            }
        };

        Ok(Self {
            server_addr: common.server_addr,
            uds: common.uds,
            expiry: ExpiryPolicy::new(
                Duration::from_secs(common.idle_timeout_secs),
                Duration::from_secs(common.sweep_interval_secs),
            ),
            shutdown_timeout: Duration::from_secs(common.shutdown_timeout_secs),
            role,
        })
    }
}
