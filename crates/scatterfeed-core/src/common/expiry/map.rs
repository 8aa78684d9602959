use crate::{
    CloseReason, Error, Result,
    types::{DEFAULT_IDLE_TIMEOUT, DEFAULT_SWEEP_INTERVAL},
};
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::time::Instant;

/// Values that can report they have nothing left to hand out.
///
/// [`ExpiringMap::update`] closes an entry as
/// [`CloseReason::Exhausted`] as soon as its value reports it is drained.
pub trait Drainable {
    fn is_drained(&self) -> bool;
}

/// Idle threshold and sweep cadence for one store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiryPolicy {
    /// Entries untouched for longer than this are evicted.
    pub idle_timeout: Duration,
    /// How often the reaper scans the store.
    pub sweep_interval: Duration,
}

impl ExpiryPolicy {
    pub const fn new(idle_timeout: Duration, sweep_interval: Duration) -> Self {
        Self {
            idle_timeout,
            sweep_interval,
        }
    }
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT, DEFAULT_SWEEP_INTERVAL)
    }
}

enum Slot<V> {
    Active(V),
    Closed(CloseReason),
}

struct Entry<V> {
    slot: Slot<V>,
    last_access: Instant,
}

impl<V> Entry<V> {
    fn new(slot: Slot<V>, now: Instant) -> Self {
        Self {
            slot,
            last_access: now,
        }
    }
}

/// A keyed store whose entries expire after sitting idle.
///
/// The lock is held only for the duration of a single map operation. Callers
/// must copy out whatever they need before doing any I/O.
pub struct ExpiringMap<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
    policy: ExpiryPolicy,
}

impl<V> ExpiringMap<V> {
    pub fn new(policy: ExpiryPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            policy,
        }
    }

    pub const fn policy(&self) -> ExpiryPolicy {
        self.policy
    }

    /// Inserts a live entry, silently replacing whatever was stored under
    /// `key`.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        let entry = Entry::new(Slot::Active(value), Instant::now());
        self.entries.lock().insert(key.into(), entry);
    }

    /// Records `key` as closed without ever holding a value for it.
    pub fn insert_closed(&self, key: impl Into<String>, reason: CloseReason) {
        let entry = Entry::new(Slot::Closed(reason), Instant::now());
        self.entries.lock().insert(key.into(), entry);
    }

    /// Runs `f` against a live entry and refreshes its last access time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] carrying the tombstone's reason, or
    /// [`CloseReason::Unknown`] when nothing is stored under `key`.
    pub fn access<R>(&self, key: &str, f: impl FnOnce(&V) -> R) -> Result<R> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| Error::not_found(key, CloseReason::Unknown))?;
        match &entry.slot {
            Slot::Active(value) => {
                entry.last_access = Instant::now();
                Ok(f(value))
            }
            Slot::Closed(reason) => Err(Error::not_found(key, *reason)),
        }
    }

    /// Ends a live entry, keeping a tombstone tagged with `reason`.
    ///
    /// Returns the value that was live, or `None` when the entry was absent
    /// or already closed. A closed entry keeps its original reason.
    pub fn close(&self, key: &str, reason: CloseReason) -> Option<V> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        if matches!(entry.slot, Slot::Closed(_)) {
            return None;
        }
        entry.last_access = Instant::now();
        match core::mem::replace(&mut entry.slot, Slot::Closed(reason)) {
            Slot::Active(value) => Some(value),
            Slot::Closed(_) => None,
        }
    }

    /// Reports why `key` is not live, or `None` if it is.
    pub fn closed_reason(&self, key: &str) -> Option<CloseReason> {
        match self.entries.lock().get(key).map(|entry| &entry.slot) {
            None => Some(CloseReason::Unknown),
            Some(Slot::Closed(reason)) => Some(*reason),
            Some(Slot::Active(_)) => None,
        }
    }

    /// Number of live entries.
    pub fn active_len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| matches!(entry.slot, Slot::Active(_)))
            .count()
    }

    /// Number of stored entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Sweeps against the current time. See [`ExpiringMap::sweep_at`].
    pub fn sweep(&self) -> Vec<String> {
        self.sweep_at(Instant::now())
    }

    /// Evicts every entry idle for longer than the policy allows at `now`.
    ///
    /// Live entries turn into [`CloseReason::Expired`] tombstones and their
    /// keys are returned. Idle tombstones are dropped without being reported.
    pub fn sweep_at(&self, now: Instant) -> Vec<String> {
        let idle_timeout = self.policy.idle_timeout;
        let mut evicted = Vec::new();
        let mut entries = self.entries.lock();

        entries.retain(|key, entry| {
            if now.saturating_duration_since(entry.last_access) <= idle_timeout {
                return true;
            }
            match entry.slot {
                Slot::Active(_) => {
                    entry.slot = Slot::Closed(CloseReason::Expired);
                    entry.last_access = now;
                    evicted.push(key.clone());
                    true
                }
                Slot::Closed(_) => false,
            }
        });

        evicted
    }
}

impl<V: Drainable> ExpiringMap<V> {
    /// Runs `f` against a live entry, refreshes its last access time and
    /// closes it as [`CloseReason::Exhausted`] if `f` left it drained.
    ///
    /// # Errors
    ///
    /// Same as [`ExpiringMap::access`].
    pub fn update<R>(&self, key: &str, f: impl FnOnce(&mut V) -> R) -> Result<R> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| Error::not_found(key, CloseReason::Unknown))?;
        let value = match &mut entry.slot {
            Slot::Active(value) => value,
            Slot::Closed(reason) => return Err(Error::not_found(key, *reason)),
        };

        entry.last_access = Instant::now();
        let out = f(value);
        if value.is_drained() {
            entry.slot = Slot::Closed(CloseReason::Exhausted);
        }
        Ok(out)
    }
}

impl<V> Default for ExpiringMap<V> {
    fn default() -> Self {
        Self::new(ExpiryPolicy::default())
    }
}

impl<V> core::fmt::Debug for ExpiringMap<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExpiringMap")
            .field("policy", &self.policy)
            .field("entries", &self.len())
            .finish()
    }
}
