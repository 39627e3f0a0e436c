//! A uniform mutex abstraction handing out opaque handles and gathering
//! per-mutex contention counters (granted-with-wait vs.
//! granted-without-wait) instead of exposing `RwLock` directly. Built on
//! a condvar-guarded flag rather than a borrowed lock guard so the
//! returned `MutexGuard` can own its `Arc<Slot>` outright with no unsafe
//! lifetime extension.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An opaque handle returned by the mutex service. Indexes into
/// `MutexService`'s internal table; never dereferenced directly by
/// callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutexHandle(pub usize);

#[derive(Debug, Default)]
struct Counters {
    granted_with_wait: AtomicU64,
    granted_without_wait: AtomicU64,
}

struct Slot {
    held: Mutex<bool>,
    cv: Condvar,
    counters: Counters,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            held: Mutex::new(false),
            cv: Condvar::new(),
            counters: Counters::default(),
        }
    }
}

/// Hands out mutex handles and tracks per-mutex contention. One instance
/// lives in each `Environment`.
pub struct MutexService {
    slots: Mutex<Vec<Arc<Slot>>>,
}

impl MutexService {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Allocate a new mutex, returning its handle.
    pub fn alloc(&self) -> MutexHandle {
        let mut slots = self.slots.lock();
        slots.push(Arc::new(Slot::default()));
        MutexHandle(slots.len() - 1)
    }

    fn slot(&self, handle: MutexHandle) -> Arc<Slot> {
        self.slots.lock()[handle.0].clone()
    }

    /// Acquire the mutex for `handle`, blocking if it is currently held.
    /// Bumps the granted-with-wait or granted-without-wait counter
    /// accordingly. The returned guard releases the mutex on drop.
    pub fn lock(&self, handle: MutexHandle) -> MutexGuard {
        let slot = self.slot(handle);
        {
            let mut held = slot.held.lock();
            if *held {
                slot.counters
                    .granted_with_wait
                    .fetch_add(1, Ordering::Relaxed);
                while *held {
                    slot.cv.wait(&mut held);
                }
            } else {
                slot.counters
                    .granted_without_wait
                    .fetch_add(1, Ordering::Relaxed);
            }
            *held = true;
        }
        MutexGuard { slot }
    }

    /// Non-blocking acquire. Returns `None` if the mutex is currently held.
    pub fn try_lock(&self, handle: MutexHandle) -> Option<MutexGuard> {
        let slot = self.slot(handle);
        let mut held = slot.held.lock();
        if *held {
            return None;
        }
        *held = true;
        slot.counters
            .granted_without_wait
            .fetch_add(1, Ordering::Relaxed);
        drop(held);
        Some(MutexGuard { slot })
    }

    /// Contention counters for a mutex: (granted-with-wait, granted-without-wait).
    pub fn counters(&self, handle: MutexHandle) -> (u64, u64) {
        let slot = self.slot(handle);
        (
            slot.counters.granted_with_wait.load(Ordering::Relaxed),
            slot.counters.granted_without_wait.load(Ordering::Relaxed),
        )
    }
}

impl Default for MutexService {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by `MutexService::lock`/`try_lock`. Releases the
/// mutex and wakes one waiter on drop.
pub struct MutexGuard {
    slot: Arc<Slot>,
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        let mut held = self.slot.held.lock();
        *held = false;
        drop(held);
        self.slot.cv.notify_one();
    }
}
