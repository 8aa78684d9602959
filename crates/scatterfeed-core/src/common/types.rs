//! # Shared Types and Defaults
//!
//! Aliases and constants used by both the worker and the leader role. The
//! defaults mirror the deployment the chunk protocol was first built for:
//! five-record chunks, thirty minutes of idle tolerance and a sweep every
//! five minutes.

use core::time::Duration;
use std::sync::Arc;

/// A single row streamed through the protocol. The coordination layer only
/// counts, slices and forwards it.
pub type Record = crate::proto::Record;

/// An immutable, shareable record sequence. Sessions hold one of these so a
/// full-partition snapshot costs a reference count, not a copy.
pub type RecordSet = Arc<[Record]>;

/// Records returned per chunk by a worker when not configured otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 5;

/// Idle time after which session and correlation state is evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Period of the background sweep over each store.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
