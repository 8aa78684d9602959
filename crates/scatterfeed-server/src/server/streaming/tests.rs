use super::{
    cache::CachePolicy,
    coordinator::ScatterGatherCoordinator,
    session::{PaginationSession, SessionStore},
};
use crate::server::{
    config::{RoleConfig, ServerConfig, WorkerConfig},
    dataset::Dataset,
    pool::{
        backend::ChunkBackend,
        manager::{WorkerHandle, WorkerPool},
    },
    service::worker::WorkerService,
};
use core::time::Duration;
use scatterfeed_core::{
    CloseReason, Error,
    expiry::ExpiryPolicy,
    ids::SequenceIdGenerator,
    proto::DataChunk,
    types::{Record, RecordSet},
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::Status;

const IDLE: Duration = Duration::from_secs(60);
const SWEEP: Duration = Duration::from_secs(10);

fn record(tag: &str, i: usize) -> Record {
    Record {
        datetime: format!("{tag}-{i}"),
        location: tag.to_string(),
        parameter: "PM2.5".to_string(),
        value: i as f64,
        ..Default::default()
    }
}

fn records(tag: &str, n: usize) -> Vec<Record> {
    (0..n).map(|i| record(tag, i)).collect()
}

fn reason(err: Error) -> CloseReason {
    match err {
        Error::NotFound { reason, .. } => reason,
        other => panic!("expected NotFound, got {other:?}"),
    }
}

fn session_store(chunk_size: usize) -> SessionStore {
    SessionStore::new(
        chunk_size,
        ExpiryPolicy::new(IDLE, SWEEP),
        Arc::new(SequenceIdGenerator::with_nonce("session", 0)),
    )
}

fn worker(tag: &str, n: usize, chunk_size: usize) -> Arc<WorkerService> {
    let worker = WorkerConfig {
        chunk_size,
        data_file: None,
        id_prefix: format!("{tag}-session"),
    };
    let config = ServerConfig {
        server_addr: String::new(),
        uds: false,
        expiry: ExpiryPolicy::new(IDLE, SWEEP),
        shutdown_timeout: Duration::from_secs(1),
        role: RoleConfig::Worker(worker.clone()),
    };
    Arc::new(WorkerService::new(
        &config,
        &worker,
        Dataset::new(records(tag, n)),
    ))
}

fn coordinator(backends: Vec<(&str, Arc<dyn ChunkBackend>)>) -> ScatterGatherCoordinator {
    cached_coordinator(backends, None)
}

fn cached_coordinator(
    backends: Vec<(&str, Arc<dyn ChunkBackend>)>,
    cache: Option<CachePolicy>,
) -> ScatterGatherCoordinator {
    let workers = backends
        .into_iter()
        .map(|(name, backend)| WorkerHandle::new(name, backend))
        .collect();
    let pool = Arc::new(WorkerPool::new(workers, CancellationToken::new()));
    ScatterGatherCoordinator::new(
        pool,
        ExpiryPolicy::new(IDLE, SWEEP),
        cache,
        Arc::new(SequenceIdGenerator::with_nonce("req", 0)),
    )
}

const CACHE: CachePolicy = CachePolicy {
    ttl: Duration::from_secs(300),
    max_entries: 10,
    chunk_size: 10,
};

/// Pages through a leader request until it reports nothing more.
async fn drain(leader: &ScatterGatherCoordinator, query: &str) -> Vec<Record> {
    let mut chunk = leader.initiate(query).await.unwrap();
    let mut collected = chunk.records;
    while chunk.has_more {
        chunk = leader.next_chunk(&chunk.request_id).await.unwrap();
        collected.extend(std::mem::take(&mut chunk.records));
    }
    collected
}

/// Wraps a real worker and lets a test slow it down or make it fail.
struct Scripted {
    inner: Arc<WorkerService>,
    delay: Duration,
    fail_initiate: bool,
    fail_next_chunk_once: AtomicBool,
    calls: AtomicUsize,
}

impl Scripted {
    fn new(inner: Arc<WorkerService>) -> Self {
        Self {
            inner,
            delay: Duration::ZERO,
            fail_initiate: false,
            fail_next_chunk_once: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }
}

#[tonic::async_trait]
impl ChunkBackend for Scripted {
    async fn initiate(&self, query: &str) -> Result<DataChunk, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail_initiate {
            return Err(Status::unavailable("connection refused"));
        }
        ChunkBackend::initiate(&*self.inner, query).await
    }

    async fn next_chunk(&self, request_id: &str) -> Result<DataChunk, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail_next_chunk_once.swap(false, Ordering::SeqCst) {
            return Err(Status::unavailable("connection reset"));
        }
        ChunkBackend::next_chunk(&*self.inner, request_id).await
    }

    async fn cancel(&self, request_id: &str) -> Result<bool, Status> {
        ChunkBackend::cancel(&*self.inner, request_id).await
    }
}

#[test]
fn pagination_never_passes_the_end() {
    let mut session = PaginationSession::new(records("a", 3).into());
    assert_eq!(session.next_chunk(2).len(), 2);
    assert!(session.has_more());
    assert_eq!(session.next_chunk(2).len(), 1);
    assert!(!session.has_more());
    assert!(session.next_chunk(2).is_empty());
    assert!(!session.has_more());
}

#[tokio::test]
async fn session_chunks_reassemble_the_snapshot() {
    for (n, chunk_size) in [(0, 3), (1, 1), (10, 5), (12, 5), (23, 7)] {
        let store = session_store(chunk_size);
        let snapshot: RecordSet = records("a", n).into();

        let mut chunk = store.initiate(Arc::clone(&snapshot));
        let id = chunk.request_id.clone();
        let mut collected = Vec::new();
        let mut chunks = 0;
        loop {
            // Only an empty snapshot yields an empty chunk.
            assert!(n == 0 || !chunk.records.is_empty());
            assert!(chunk.records.len() <= chunk_size);
            if !chunk.records.is_empty() {
                chunks += 1;
            }
            collected.extend(chunk.records);
            if !chunk.has_more {
                break;
            }
            chunk = store.next_chunk(&id).unwrap();
        }

        assert_eq!(chunks, n.div_ceil(chunk_size));
        assert_eq!(collected, snapshot.to_vec());
        assert_eq!(reason(store.next_chunk(&id).unwrap_err()), CloseReason::Exhausted);
        assert_eq!(store.active_sessions(), 0);
    }
}

#[tokio::test]
async fn empty_snapshot_is_exhausted_at_initiate() {
    let store = session_store(5);
    let chunk = store.initiate(Vec::new().into());

    assert!(chunk.records.is_empty());
    assert!(!chunk.has_more);
    assert_eq!(
        reason(store.next_chunk(&chunk.request_id).unwrap_err()),
        CloseReason::Exhausted
    );
}

#[tokio::test]
async fn session_ids_are_unique() {
    let store = session_store(1);
    let a = store.initiate(records("a", 3).into());
    let b = store.initiate(records("a", 3).into());
    assert_ne!(a.request_id, b.request_id);
    assert_eq!(store.active_sessions(), 2);
}

#[tokio::test]
async fn session_cancel_reports_only_the_first_call() {
    let store = session_store(2);
    let chunk = store.initiate(records("a", 5).into());

    assert!(store.cancel(&chunk.request_id));
    assert!(!store.cancel(&chunk.request_id));
    assert!(!store.cancel("never-issued"));
    assert_eq!(
        reason(store.next_chunk(&chunk.request_id).unwrap_err()),
        CloseReason::Cancelled
    );
}

#[tokio::test]
async fn leader_merges_workers_in_priority_order() {
    let first = worker("first", 7, 5);
    let second = worker("second", 3, 5);
    let leader = coordinator(vec![
        ("first", first.clone() as Arc<dyn ChunkBackend>),
        ("second", second.clone() as Arc<dyn ChunkBackend>),
    ]);

    let chunk = leader.initiate("all_data").await.unwrap();
    assert_eq!(chunk.records.len(), 8);
    assert!(chunk.has_more);
    let expected: Vec<Record> = records("first", 5)
        .into_iter()
        .chain(records("second", 3))
        .collect();
    assert_eq!(chunk.records, expected);

    let id = chunk.request_id;
    let chunk = leader.next_chunk(&id).await.unwrap();
    assert_eq!(chunk.records, records("first", 7)[5..].to_vec());
    assert!(!chunk.has_more);

    assert_eq!(
        reason(leader.next_chunk(&id).await.unwrap_err()),
        CloseReason::Exhausted
    );
    assert_eq!(first.sessions().active_sessions(), 0);
    assert_eq!(second.sessions().active_sessions(), 0);
}

#[tokio::test]
async fn drained_workers_are_not_asked_again() {
    let short = Arc::new(Scripted::new(worker("short", 2, 5)));
    let long = Arc::new(Scripted::new(worker("long", 12, 5)));
    let leader = coordinator(vec![
        ("short", short.clone() as Arc<dyn ChunkBackend>),
        ("long", long.clone() as Arc<dyn ChunkBackend>),
    ]);

    let chunk = leader.initiate("").await.unwrap();
    assert_eq!(chunk.records.len(), 7);
    assert!(chunk.has_more);

    let chunk = leader.next_chunk(&chunk.request_id).await.unwrap();
    assert_eq!(chunk.records, records("long", 12)[5..10].to_vec());
    assert!(chunk.has_more);

    assert_eq!(short.calls.load(Ordering::SeqCst), 1);
    assert_eq!(long.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_workers_do_not_reorder_records() {
    let mut slow = Scripted::new(worker("slow", 4, 2));
    slow.delay = Duration::from_millis(250);
    let fast = Scripted::new(worker("fast", 4, 2));
    let leader = coordinator(vec![
        ("slow", Arc::new(slow) as Arc<dyn ChunkBackend>),
        ("fast", Arc::new(fast) as Arc<dyn ChunkBackend>),
    ]);

    let started = Instant::now();
    let chunk = leader.initiate("*").await.unwrap();
    let locations: Vec<&str> = chunk.records.iter().map(|r| r.location.as_str()).collect();
    assert_eq!(locations, ["slow", "slow", "fast", "fast"]);

    // Calls run concurrently, so the wait is one delay, not the sum.
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn failed_initiate_stores_nothing() {
    let healthy = worker("healthy", 10, 5);
    let mut broken = Scripted::new(worker("broken", 10, 5));
    broken.fail_initiate = true;
    let leader = coordinator(vec![
        ("healthy", healthy.clone() as Arc<dyn ChunkBackend>),
        ("broken", Arc::new(broken) as Arc<dyn ChunkBackend>),
    ]);

    let err = leader.initiate("all").await.unwrap_err();
    assert!(matches!(err, Error::Unavailable { ref worker, .. } if worker == "broken"));
    assert!(leader.correlations().entries().is_empty());
    // The healthy worker keeps its session until its own reaper runs.
    assert_eq!(healthy.sessions().active_sessions(), 1);
}

#[tokio::test]
async fn transient_chunk_failure_keeps_the_worker_pending() {
    let flaky = Scripted::new(worker("flaky", 10, 5));
    flaky.fail_next_chunk_once.store(true, Ordering::SeqCst);
    let steady = worker("steady", 10, 5);
    let leader = coordinator(vec![
        ("flaky", Arc::new(flaky) as Arc<dyn ChunkBackend>),
        ("steady", steady as Arc<dyn ChunkBackend>),
    ]);

    let id = leader.initiate("all").await.unwrap().request_id;

    let chunk = leader.next_chunk(&id).await.unwrap();
    assert_eq!(chunk.records, records("steady", 10)[5..].to_vec());
    assert!(chunk.has_more);

    let chunk = leader.next_chunk(&id).await.unwrap();
    assert_eq!(chunk.records, records("flaky", 10)[5..].to_vec());
    assert!(!chunk.has_more);
}

#[tokio::test]
async fn lost_worker_session_abandons_the_request() {
    let lossy = worker("lossy", 10, 5);
    let steady = worker("steady", 10, 5);
    let leader = coordinator(vec![
        ("lossy", lossy.clone() as Arc<dyn ChunkBackend>),
        ("steady", steady.clone() as Arc<dyn ChunkBackend>),
    ]);

    let id = leader.initiate("all").await.unwrap().request_id;
    let entry = leader.correlations().get(&id).unwrap();
    assert!(lossy.sessions().cancel(entry.session_id(0).unwrap()));

    assert_eq!(
        reason(leader.next_chunk(&id).await.unwrap_err()),
        CloseReason::WorkerLost
    );
    // The surviving worker is told to drop its half of the request.
    assert_eq!(steady.sessions().active_sessions(), 0);
    assert_eq!(
        reason(leader.next_chunk(&id).await.unwrap_err()),
        CloseReason::WorkerLost
    );
    assert!(leader.cancel(&id).await);
}

#[tokio::test]
async fn leader_cancel_is_idempotent_and_releases_workers() {
    let first = worker("first", 10, 5);
    let second = worker("second", 10, 5);
    let leader = coordinator(vec![
        ("first", first.clone() as Arc<dyn ChunkBackend>),
        ("second", second.clone() as Arc<dyn ChunkBackend>),
    ]);

    let id = leader.initiate("all").await.unwrap().request_id;
    assert!(leader.cancel(&id).await);
    assert_eq!(first.sessions().active_sessions(), 0);
    assert_eq!(second.sessions().active_sessions(), 0);

    assert_eq!(
        reason(leader.next_chunk(&id).await.unwrap_err()),
        CloseReason::Cancelled
    );
    assert!(leader.cancel(&id).await);
    assert!(leader.cancel("never-issued").await);
}

#[tokio::test]
async fn idle_correlations_expire() {
    let leader = coordinator(vec![(
        "only",
        worker("only", 10, 5) as Arc<dyn ChunkBackend>,
    )]);

    let id = leader.initiate("all").await.unwrap().request_id;
    let evicted = leader
        .correlations()
        .entries()
        .sweep_at(Instant::now() + IDLE + Duration::from_secs(1));
    assert_eq!(evicted, vec![id.clone()]);

    assert_eq!(
        reason(leader.next_chunk(&id).await.unwrap_err()),
        CloseReason::Expired
    );
}

#[tokio::test]
async fn request_ids_are_issued_by_the_leader() {
    let leader = coordinator(vec![("only", worker("only", 10, 5) as Arc<dyn ChunkBackend>)]);

    let a = leader.initiate("all").await.unwrap();
    let b = leader.initiate("all").await.unwrap();
    assert!(a.request_id.starts_with("req-"));
    assert_ne!(a.request_id, b.request_id);
    assert_eq!(leader.correlations().active_requests(), 2);
}

#[tokio::test]
async fn leader_rejects_malformed_queries_like_a_worker() {
    let leader = coordinator(vec![
        ("first", worker("first", 3, 5) as Arc<dyn ChunkBackend>),
        ("second", worker("second", 3, 5) as Arc<dyn ChunkBackend>),
    ]);

    let err = leader.initiate("colour:blue").await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest { .. }));
    assert_eq!(Status::from(err).code(), tonic::Code::InvalidArgument);
    assert!(leader.correlations().entries().is_empty());
}

#[tokio::test]
async fn leader_without_workers_refuses_requests() {
    let leader = coordinator(Vec::new());
    let err = leader.initiate("all").await.unwrap_err();
    assert!(matches!(err, Error::Internal { .. }));
}

#[tokio::test]
async fn repeated_query_is_replayed_from_cache() {
    let backend = Arc::new(Scripted::new(worker("a", 12, 5)));
    let leader = cached_coordinator(
        vec![("a", backend.clone() as Arc<dyn ChunkBackend>)],
        Some(CACHE),
    );

    assert_eq!(drain(&leader, "all").await, records("a", 12));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

    let first = leader.initiate("all").await.unwrap();
    assert_eq!(first.records, records("a", 12)[..10].to_vec());
    assert!(first.has_more);
    assert!(first.request_id.starts_with("req-"));

    let id = first.request_id;
    let rest = leader.next_chunk(&id).await.unwrap();
    assert_eq!(rest.request_id, id);
    assert_eq!(rest.records, records("a", 12)[10..].to_vec());
    assert!(!rest.has_more);
    assert_eq!(
        reason(leader.next_chunk(&id).await.unwrap_err()),
        CloseReason::Exhausted
    );

    // Served without asking the worker again.
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    assert_eq!(leader.correlations().active_requests(), 0);
}

#[tokio::test]
async fn replays_get_fresh_ids_and_can_be_cancelled() {
    let leader = cached_coordinator(
        vec![("a", worker("a", 12, 5) as Arc<dyn ChunkBackend>)],
        Some(CachePolicy {
            chunk_size: 4,
            ..CACHE
        }),
    );
    drain(&leader, "all").await;

    let a = leader.initiate("all").await.unwrap();
    let b = leader.initiate("all").await.unwrap();
    assert_ne!(a.request_id, b.request_id);

    assert!(leader.cancel(&a.request_id).await);
    assert_eq!(
        reason(leader.next_chunk(&a.request_id).await.unwrap_err()),
        CloseReason::Cancelled
    );
    assert!(leader.cancel(&a.request_id).await);

    let next = leader.next_chunk(&b.request_id).await.unwrap();
    assert_eq!(next.records, records("a", 12)[4..8].to_vec());
}

#[tokio::test]
async fn unfinished_requests_are_not_cached() {
    let backend = Arc::new(Scripted::new(worker("a", 12, 5)));
    let leader = cached_coordinator(
        vec![("a", backend.clone() as Arc<dyn ChunkBackend>)],
        Some(CACHE),
    );

    let id = leader.initiate("all").await.unwrap().request_id;
    leader.next_chunk(&id).await.unwrap();
    assert!(leader.cancel(&id).await);

    let again = leader.initiate("all").await.unwrap();
    assert_eq!(again.records, records("a", 12)[..5].to_vec());
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn cached_results_expire_after_their_ttl() {
    let backend = Arc::new(Scripted::new(worker("a", 3, 5)));
    let leader = cached_coordinator(
        vec![("a", backend.clone() as Arc<dyn ChunkBackend>)],
        Some(CACHE),
    );

    drain(&leader, "all").await;
    tokio::time::advance(CACHE.ttl - Duration::from_secs(1)).await;
    drain(&leader, "all").await;
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

    // Hits do not extend the lifetime of a cached result.
    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(drain(&leader, "all").await, records("a", 3));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn full_cache_evicts_the_oldest_result() {
    let backend = Arc::new(Scripted::new(worker("a", 3, 5)));
    let leader = cached_coordinator(
        vec![("a", backend.clone() as Arc<dyn ChunkBackend>)],
        Some(CachePolicy {
            max_entries: 2,
            ..CACHE
        }),
    );

    for query in ["all", "*", "location:a"] {
        drain(&leader, query).await;
        tokio::time::advance(Duration::from_secs(1)).await;
    }
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

    // "*" and "location:a" survive, "all" was the oldest.
    drain(&leader, "*").await;
    drain(&leader, "location:a").await;
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    drain(&leader, "all").await;
    assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
}
