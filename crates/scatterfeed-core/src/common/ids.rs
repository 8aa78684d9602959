//! Request-id generation.
//!
//! Stores never mint ids from global state. They receive a
//! [`RequestIdGenerator`] at construction instead, which keeps tests
//! deterministic and lets a deployment swap in its own scheme.

use portable_atomic::{AtomicU64, Ordering};

/// Produces ids that are unique for the lifetime of the owning process.
pub trait RequestIdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Default generator: `<prefix>-<nonce>-<sequence>`.
///
/// The nonce is drawn once per generator so ids handed out before a restart
/// do not collide with ids handed out after it.
#[derive(Debug)]
pub struct SequenceIdGenerator {
    prefix: String,
    nonce: u32,
    next: AtomicU64,
}

impl SequenceIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_nonce(prefix, rand::random())
    }

    /// Builds a generator with a fixed nonce.
    pub fn with_nonce(prefix: impl Into<String>, nonce: u32) -> Self {
        Self {
            prefix: prefix.into(),
            nonce,
            next: AtomicU64::new(1),
        }
    }
}

impl RequestIdGenerator for SequenceIdGenerator {
    fn next_id(&self) -> String {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:08x}-{seq}", self.prefix, self.nonce)
    }
}
