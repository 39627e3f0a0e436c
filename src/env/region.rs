//! Arena allocator used by each region (lock, log, mpool, txn) to hand out
//! fixed-size slots without per-allocation heap churn.
//!
//! A literal shared-memory region (mmap'd, cross-process, addressed by
//! byte offset) is not needed here: this crate runs as one process with
//! many threads, so `Region` is a `parking_lot`-guarded growable `Vec<T>`
//! and slots are addressed by a `SlotId` index rather than a byte offset.
//! Freed slots are threaded onto an intrusive free list so reuse never
//! needs a scan.

use parking_lot::Mutex;

/// A region-relative slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

enum Entry<T> {
    Occupied(T),
    /// Intrusive free-list link: index of the next free slot, or `None`
    /// if this is the list's tail.
    Free(Option<u32>),
}

/// A typed arena of fixed-size slots with an intrusive free list, shared
/// by reference across threads via interior locking.
pub struct Region<T> {
    inner: Mutex<RegionInner<T>>,
}

struct RegionInner<T> {
    slots: Vec<Entry<T>>,
    free_head: Option<u32>,
    live_count: usize,
}

impl<T> Region<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegionInner {
                slots: Vec::new(),
                free_head: None,
                live_count: 0,
            }),
        }
    }

    /// Allocate a slot holding `value`, reusing a freed slot if one is
    /// available.
    pub fn alloc(&self, value: T) -> SlotId {
        let mut inner = self.inner.lock();
        inner.live_count += 1;
        if let Some(idx) = inner.free_head {
            let next_free = match &inner.slots[idx as usize] {
                Entry::Free(next) => *next,
                Entry::Occupied(_) => unreachable!("free list pointed at an occupied slot"),
            };
            inner.free_head = next_free;
            inner.slots[idx as usize] = Entry::Occupied(value);
            SlotId(idx)
        } else {
            let idx = inner.slots.len() as u32;
            inner.slots.push(Entry::Occupied(value));
            SlotId(idx)
        }
    }

    /// Release a previously allocated slot, linking it at the head of the
    /// free list.
    pub fn free(&self, id: SlotId) {
        let mut inner = self.inner.lock();
        let head = inner.free_head;
        inner.slots[id.0 as usize] = Entry::Free(head);
        inner.free_head = Some(id.0);
        inner.live_count -= 1;
    }

    /// Run `f` against the slot's value, returning `None` if the slot is
    /// free (already released).
    pub fn with<R>(&self, id: SlotId, f: impl FnOnce(&T) -> R) -> Option<R> {
        let inner = self.inner.lock();
        match inner.slots.get(id.0 as usize) {
            Some(Entry::Occupied(v)) => Some(f(v)),
            _ => None,
        }
    }

    /// Run `f` against the slot's value with mutable access.
    pub fn with_mut<R>(&self, id: SlotId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(id.0 as usize) {
            Some(Entry::Occupied(v)) => Some(f(v)),
            _ => None,
        }
    }

    /// Number of currently occupied slots.
    pub fn live_count(&self) -> usize {
        self.inner.lock().live_count
    }

    /// Snapshot of all occupied slot ids, in slot order.
    pub fn live_ids(&self) -> Vec<SlotId> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, e)| matches!(e, Entry::Occupied(_)).then(|| SlotId(i as u32)))
            .collect()
    }
}

impl<T> Default for Region<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_reuses_slot() {
        let region: Region<u32> = Region::new();
        let a = region.alloc(1);
        let b = region.alloc(2);
        assert_ne!(a, b);
        region.free(a);
        let c = region.alloc(3);
        assert_eq!(a, c, "freed slot should be reused");
        assert_eq!(region.live_count(), 2);
    }

    #[test]
    fn with_mut_sees_updates() {
        let region: Region<u32> = Region::new();
        let id = region.alloc(10);
        region.with_mut(id, |v| *v += 5);
        assert_eq!(region.with(id, |v| *v), Some(15));
    }
}
