//! Idle-based expiry shared by the worker session store and the leader
//! correlation store.
//!
//! [`ExpiringMap`] is a keyed store guarded by a single mutex. Every entry
//! remembers when it was last touched; the [`reaper`] periodically sweeps the
//! map and evicts entries idle for longer than the configured threshold.
//!
//! An entry is either live or a payload-free tombstone tagged with the
//! [`CloseReason`](crate::CloseReason) that ended it. Tombstones let lookups
//! tell "drained", "cancelled" and "expired" apart from "never issued", and
//! are themselves dropped by the next sweep that finds them idle.

mod map;
pub mod reaper;

pub use map::{Drainable, ExpiringMap, ExpiryPolicy};
pub use reaper::spawn_reaper;
