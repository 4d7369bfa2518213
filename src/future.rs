//! Single-assignment result handle.
//!
//! A [`Future`] is written exactly once by the dispatcher and read by any
//! number of clients, each of which may block with a timeout.

use crate::error::{PoolError, Result, TaskError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Slot<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

/// Write-once, blocking-read result container.
///
/// Cloning a `Future` yields another handle to the same slot.
pub struct Future<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("is_set", &self.is_set())
            .finish()
    }
}

impl<T> Future<T> {
    /// Create an unset future.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Slot {
                value: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        // The slot holds plain data, a poisoned lock still has a valid value.
        self.slot
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store the value and wake all readers.
    ///
    /// Returns `false` (and drops `value`) if the future was already set.
    pub fn set(&self, value: T) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.slot.ready.notify_all();
        true
    }

    /// Whether a value has been stored.
    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    /// Resolve the future with the output of `body`.
    ///
    /// If `body` panics the panic is caught and `recover` produces the stored
    /// value instead, so the future always transitions to set exactly once.
    pub fn resolve_with<F, R>(&self, body: F, recover: R) -> bool
    where
        F: FnOnce() -> T,
        R: FnOnce(TaskError) -> T,
    {
        let value = match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(value) => value,
            Err(payload) => recover(TaskError::from_panic(payload)),
        };
        self.set(value)
    }
}

impl<T: Clone> Future<T> {
    /// Return the value if already set, without blocking.
    pub fn try_get(&self) -> Option<T> {
        self.lock().clone()
    }

    /// Block until the value is set.
    ///
    /// With `timeout` of `None` this waits forever; otherwise it fails with
    /// [`PoolError::Timeout`] once the duration elapses. A value written after
    /// the timeout does not affect a read that has already failed.
    pub fn get(&self, timeout: Option<Duration>) -> Result<T> {
        let mut slot = self.lock();
        match timeout {
            None => {
                while slot.is_none() {
                    slot = self
                        .slot
                        .ready
                        .wait(slot)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
            Some(limit) => {
                let deadline = Instant::now() + limit;
                while slot.is_none() {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::Timeout(limit));
                    }
                    let (guard, _) = self
                        .slot
                        .ready
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    slot = guard;
                }
            }
        }
        slot.clone()
            .ok_or_else(|| PoolError::Worker("future woke without a value".into()))
    }
}
