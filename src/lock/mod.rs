//! Lock Manager: mediates access to lock objects across lockers
//! (transactions or standalone handles) under the full object/locker/lock
//! triple, the compatibility matrices in `mode.rs`, condvar-based
//! waiting, and the deadlock victim-selection policies in `deadlock.rs`.

pub mod deadlock;
pub mod mode;
pub mod object;

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::EnvConfig;
use crate::error::{DbError, DbResult};

pub use deadlock::DetectPolicy;
pub use mode::LockMode;
pub use object::{GetFlags, LockObjectId, LockerId, LOCKER_ID_BOUNDARY};

use deadlock::{LockerStats, WaitForGraph};
use mode::CompatMatrix;

#[derive(Debug, Clone, Copy)]
struct Grant {
    locker: LockerId,
    mode: LockMode,
}

struct Waiter {
    locker: LockerId,
    mode: LockMode,
    /// Set by another thread's `put`/deadlock resolution to tell this
    /// waiter it has been granted or must abort.
    outcome: Option<Result<(), DbError>>,
}

struct ObjectState {
    held: Vec<Grant>,
    waiters: VecDeque<Waiter>,
}

impl ObjectState {
    fn new() -> Self {
        Self {
            held: Vec::new(),
            waiters: VecDeque::new(),
        }
    }
}

struct ObjectEntry {
    state: Mutex<ObjectState>,
    cv: Condvar,
}

impl ObjectEntry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ObjectState::new()),
            cv: Condvar::new(),
        })
    }
}

#[derive(Default)]
struct LockerRecord {
    held: Vec<(LockObjectId, LockMode)>,
    stats: LockerStats,
    txn_expire: Option<Instant>,
    lock_timeout: Option<Duration>,
    deleted: bool,
}

/// A single element of a `LockManager::vec` batch.
pub enum LockOp {
    Get {
        object: LockObjectId,
        mode: LockMode,
        flags: GetFlags,
    },
    Put {
        object: LockObjectId,
    },
    PutAll,
    PutObj {
        object: LockObjectId,
    },
    Timeout {
        lock_timeout: Option<Duration>,
        txn_expire: Option<Instant>,
    },
    Upgrade {
        object: LockObjectId,
        new_mode: LockMode,
    },
}

/// Mediates access to lock objects.
pub struct LockManager {
    objects: Mutex<HashMap<LockObjectId, Arc<ObjectEntry>>>,
    lockers: Mutex<HashMap<LockerId, LockerRecord>>,
    wait_graph: Mutex<WaitForGraph>,
    next_nontxn_id: AtomicU64,
    next_txn_id: AtomicU64,
    age_counter: AtomicU64,
    matrix: CompatMatrix,
    cds_matrix: CompatMatrix,
    cdb_mode: bool,
    default_lock_timeout: Option<Duration>,
    detect_policy: DetectPolicy,
    max_locks: u32,
    max_lockers: u32,
    max_objects: u32,
}

impl LockManager {
    pub fn new(config: &EnvConfig) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            lockers: Mutex::new(HashMap::new()),
            wait_graph: Mutex::new(WaitForGraph::new()),
            next_nontxn_id: AtomicU64::new(1),
            next_txn_id: AtomicU64::new(LOCKER_ID_BOUNDARY),
            age_counter: AtomicU64::new(0),
            matrix: CompatMatrix::full(),
            cds_matrix: CompatMatrix::cds(),
            cdb_mode: config.flags.cdb_alldb,
            default_lock_timeout: (config.lock_timeout_micros > 0)
                .then(|| Duration::from_micros(config.lock_timeout_micros)),
            detect_policy: config.lk_detect,
            max_locks: config.lk_max_locks,
            max_lockers: config.lk_max_lockers,
            max_objects: config.lk_max_objects,
        }
    }

    /// Allocate a non-transactional locker id (handle), starting at 1.
    pub fn alloc_id(&self) -> DbResult<LockerId> {
        self.register_locker(self.next_nontxn_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Allocate a transaction-range locker id, starting at
    /// `LOCKER_ID_BOUNDARY`, so transaction ids and non-transactional
    /// lock ids never collide.
    pub fn alloc_txn_id(&self) -> DbResult<LockerId> {
        self.register_locker(self.next_txn_id.fetch_add(1, Ordering::SeqCst))
    }

    fn register_locker(&self, id: LockerId) -> DbResult<LockerId> {
        let mut lockers = self.lockers.lock();
        if lockers.len() as u32 >= self.max_lockers {
            return Err(DbError::LockNotEnoughSpace);
        }
        let age = self.age_counter.fetch_add(1, Ordering::SeqCst);
        lockers.insert(
            id,
            LockerRecord {
                stats: LockerStats { age, ..Default::default() },
                ..Default::default()
            },
        );
        Ok(id)
    }

    /// Release a locker id. The locker must hold no locks.
    pub fn id_free(&self, locker: LockerId) -> DbResult<()> {
        let mut lockers = self.lockers.lock();
        if let Some(rec) = lockers.get(&locker) {
            if !rec.held.is_empty() {
                return Err(DbError::Inval(format!(
                    "locker {} still holds {} locks",
                    locker,
                    rec.held.len()
                )));
            }
        }
        lockers.remove(&locker);
        self.wait_graph.lock().remove_waiter(locker);
        Ok(())
    }

    /// Set the per-locker transaction-expire time and per-lock timeout,
    /// applied to subsequent waits.
    pub fn set_timeout(
        &self,
        locker: LockerId,
        lock_timeout: Option<Duration>,
        txn_expire: Option<Instant>,
    ) {
        let mut lockers = self.lockers.lock();
        if let Some(rec) = lockers.get_mut(&locker) {
            rec.lock_timeout = lock_timeout;
            rec.txn_expire = txn_expire;
        }
    }

    fn matrix(&self) -> &CompatMatrix {
        if self.cdb_mode {
            &self.cds_matrix
        } else {
            &self.matrix
        }
    }

    fn object_entry(&self, object: LockObjectId) -> DbResult<Arc<ObjectEntry>> {
        let mut objects = self.objects.lock();
        if let Some(e) = objects.get(&object) {
            return Ok(e.clone());
        }
        if objects.len() as u32 >= self.max_objects {
            return Err(DbError::LockNotEnoughSpace);
        }
        let entry = ObjectEntry::new();
        objects.insert(object, entry.clone());
        Ok(entry)
    }

    /// Request a lock. Blocks on conflict unless `flags.nowait`.
    pub fn get(
        &self,
        locker: LockerId,
        object: LockObjectId,
        mode: LockMode,
        flags: GetFlags,
    ) -> DbResult<()> {
        {
            let lockers = self.lockers.lock();
            let total: usize = lockers.values().map(|r| r.held.len()).sum();
            if total as u32 >= self.max_locks {
                return Err(DbError::LockNotEnoughSpace);
            }
        }

        let entry = self.object_entry(object)?;
        let deadline = flags
            .timeout
            .or(self.default_lock_timeout)
            .map(|d| Instant::now() + d);

        {
            let mut state = entry.state.lock();

            // Already held by this locker at >= requested strength: no-op.
            if state
                .held
                .iter()
                .any(|g| g.locker == locker && !self.matrix().conflicts(g.mode, mode) && g.mode == mode)
            {
                return Ok(());
            }

            let conflicts: Vec<LockerId> = state
                .held
                .iter()
                .filter(|g| g.locker != locker && self.matrix().conflicts(g.mode, mode))
                .map(|g| g.locker)
                .collect();

            if conflicts.is_empty() && state.waiters.is_empty() {
                state.held.push(Grant { locker, mode });
                drop(state);
                self.record_grant(locker, object, mode);
                return Ok(());
            }

            if flags.nowait {
                return Err(DbError::Busy);
            }

            // Register the wait-for edges and probe for a cycle before
            // blocking (eager detection).
            {
                let mut graph = self.wait_graph.lock();
                for holder in &conflicts {
                    graph.add_edge(locker, *holder);
                }
                if let Some(cycle) = graph.find_cycle_from(locker) {
                    let stats = self.locker_stats_snapshot();
                    let victim = deadlock::select_victim(self.detect_policy, &cycle, locker, &stats);
                    graph.remove_waiter(locker);
                    drop(graph);
                    if victim == locker {
                        return Err(DbError::Deadlock);
                    }
                    // Abort the other cycle member's current wait instead.
                    self.abort_waiter(victim, DbError::Deadlock);
                }
            }

            state.waiters.push_back(Waiter {
                locker,
                mode,
                outcome: None,
            });
        }

        self.wait_for_grant(&entry, locker, deadline)?;
        self.record_grant(locker, object, mode);
        Ok(())
    }

    fn wait_for_grant(
        &self,
        entry: &Arc<ObjectEntry>,
        locker: LockerId,
        deadline: Option<Instant>,
    ) -> DbResult<()> {
        let mut state = entry.state.lock();
        loop {
            if let Some(w) = state.waiters.iter_mut().find(|w| w.locker == locker) {
                if let Some(outcome) = w.outcome.take() {
                    state.waiters.retain(|w| w.locker != locker);
                    self.wait_graph.lock().remove_waiter(locker);
                    return outcome;
                }
            } else {
                // Already promoted and removed from the waiter list by a
                // concurrent `put`.
                self.wait_graph.lock().remove_waiter(locker);
                return Ok(());
            }

            match deadline {
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        state.waiters.retain(|w| w.locker != locker);
                        self.wait_graph.lock().remove_waiter(locker);
                        return Err(DbError::LockTimeout);
                    }
                    entry.cv.wait_for(&mut state, dl - now);
                }
                None => entry.cv.wait(&mut state),
            }
        }
    }

    fn abort_waiter(&self, locker: LockerId, err: DbError) {
        let objects = self.objects.lock().clone_values();
        for entry in objects {
            // `try_lock`, not `lock`: the calling thread may already hold
            // the state mutex of the very object it is currently
            // enqueueing a wait on (the common 2-cycle case always
            // targets a *different* object, but a longer cycle could
            // coincide). Skipping a contended entry here only delays the
            // victim's wakeup until its own next poll of `outcome`, which
            // `wait_for_grant`'s timeout/condvar loop still covers.
            if let Some(mut state) = entry.state.try_lock() {
                if let Some(w) = state.waiters.iter_mut().find(|w| w.locker == locker) {
                    w.outcome = Some(Err(err.clone()));
                    drop(state);
                    entry.cv.notify_all();
                    return;
                }
            }
        }
    }

    fn record_grant(&self, locker: LockerId, object: LockObjectId, mode: LockMode) {
        let mut lockers = self.lockers.lock();
        let rec = lockers.entry(locker).or_insert_with(LockerRecord::default);
        if !rec.held.iter().any(|(o, _)| *o == object) {
            rec.held.push((object, mode));
            rec.stats.num_locks += 1;
            if mode.is_write() {
                rec.stats.num_writes += 1;
            }
        }
    }

    fn locker_stats_snapshot(&self) -> HashMap<LockerId, LockerStats> {
        self.lockers
            .lock()
            .iter()
            .map(|(id, rec)| (*id, rec.stats))
            .collect()
    }

    /// Release a lock. Promotes waiters strictly FIFO:
    /// a waiter blocked behind an incompatible request is never promoted
    /// ahead of it, even if later-arriving waiters would otherwise be
    /// compatible (prevents starvation).
    pub fn put(&self, locker: LockerId, object: LockObjectId) -> DbResult<()> {
        let entry = self.object_entry(object)?;
        {
            let mut state = entry.state.lock();
            state.held.retain(|g| g.locker != locker);

            // Promote a prefix of the wait queue: walk from the head and
            // stop at the first still-incompatible waiter (strict FIFO —
            // a waiter once skipped blocks later compatible waiters from
            // jumping the queue). Already-resolved entries
            // (outcome.is_some()) are left untouched and don't block the
            // scan; they are pending pickup by their own thread in
            // `wait_for_grant`.
            for w in state.waiters.iter_mut() {
                if w.outcome.is_some() {
                    continue;
                }
                let held_snapshot: Vec<Grant> = state
                    .held
                    .iter()
                    .filter(|g| g.locker != w.locker)
                    .copied()
                    .collect();
                let compatible = held_snapshot
                    .iter()
                    .all(|g| !self.matrix().conflicts(g.mode, w.mode));
                if !compatible {
                    break;
                }
                state.held.push(Grant {
                    locker: w.locker,
                    mode: w.mode,
                });
                w.outcome = Some(Ok(()));
            }
        }
        entry.cv.notify_all();

        let mut lockers = self.lockers.lock();
        if let Some(rec) = lockers.get_mut(&locker) {
            rec.held.retain(|(o, _)| *o != object);
        }
        Ok(())
    }

    /// Move every lock held by `from` to `to` without releasing and
    /// re-acquiring (which could block on an unrelated waiter) — used on
    /// a nested commit, where the child's locks transfer to the parent.
    /// The grants stay held throughout.
    pub fn transfer(&self, from: LockerId, to: LockerId) -> DbResult<()> {
        let held: Vec<(LockObjectId, LockMode)> = {
            let lockers = self.lockers.lock();
            lockers.get(&from).map(|r| r.held.clone()).unwrap_or_default()
        };
        for (object, mode) in &held {
            let entry = self.object_entry(*object)?;
            let mut state = entry.state.lock();
            if let Some(grant) = state.held.iter_mut().find(|g| g.locker == *from) {
                grant.locker = to;
            }
        }
        let mut lockers = self.lockers.lock();
        if let Some(mut rec) = lockers.remove(&from) {
            let to_rec = lockers.entry(to).or_insert_with(LockerRecord::default);
            to_rec.held.append(&mut rec.held);
            to_rec.stats.num_locks += rec.stats.num_locks;
            to_rec.stats.num_writes += rec.stats.num_writes;
        }
        Ok(())
    }

    /// Release every lock held by `locker`, on commit or abort.
    pub fn put_all(&self, locker: LockerId) -> DbResult<()> {
        let objects: Vec<LockObjectId> = {
            let lockers = self.lockers.lock();
            lockers
                .get(&locker)
                .map(|r| r.held.iter().map(|(o, _)| *o).collect())
                .unwrap_or_default()
        };
        for object in objects {
            self.put(locker, object)?;
        }
        Ok(())
    }

    /// Legal only to a less-restrictive mode.
    pub fn downgrade(&self, locker: LockerId, object: LockObjectId, new_mode: LockMode) -> DbResult<()> {
        let entry = self.object_entry(object)?;
        let mut state = entry.state.lock();
        let grant = state
            .held
            .iter_mut()
            .find(|g| g.locker == locker)
            .ok_or(DbError::NotGranted)?;
        if !new_mode.strictly_less_restrictive_than(&grant.mode) {
            return Err(DbError::Inval(
                "downgrade target must be strictly less restrictive".into(),
            ));
        }
        grant.mode = new_mode;
        drop(state);
        entry.cv.notify_all();

        let mut lockers = self.lockers.lock();
        if let Some(rec) = lockers.get_mut(&locker) {
            if let Some(slot) = rec.held.iter_mut().find(|(o, _)| *o == object) {
                slot.1 = new_mode;
            }
        }
        Ok(())
    }

    /// Apply a batch of operations atomically with respect to internal
    /// lock-manager state. `GET` entries within a batch are always
    /// treated as `NOWAIT` so the batch cannot itself deadlock
    /// mid-application.
    pub fn vec(&self, locker: LockerId, ops: Vec<LockOp>) -> DbResult<()> {
        for op in ops {
            match op {
                LockOp::Get { object, mode, mut flags } => {
                    flags.nowait = true;
                    self.get(locker, object, mode, flags)?;
                }
                LockOp::Put { object } => self.put(locker, object)?,
                LockOp::PutAll => self.put_all(locker)?,
                LockOp::PutObj { object } => self.put(locker, object)?,
                LockOp::Timeout {
                    lock_timeout,
                    txn_expire,
                } => self.set_timeout(locker, lock_timeout, txn_expire),
                LockOp::Upgrade { object, new_mode } => {
                    self.put(locker, object)?;
                    self.get(locker, object, new_mode, GetFlags::default())?;
                }
            }
        }
        Ok(())
    }

    /// Sweep all lockers for an expired transaction or lock timeout,
    /// aborting the relevant wait with the matching error.
    pub fn sweep_timeouts(&self) {
        let now = Instant::now();
        let expired: Vec<(LockerId, DbError)> = {
            let lockers = self.lockers.lock();
            lockers
                .iter()
                .filter_map(|(id, rec)| match rec.txn_expire {
                    Some(t) if now >= t => Some((*id, DbError::TxnTimeout)),
                    _ => None,
                })
                .collect()
        };
        for (id, err) in expired {
            self.abort_waiter(id, err);
        }
    }
}

// Small helper trait kept local to this module: `parking_lot::MutexGuard`
// doesn't expose a values() iterator without living as long as the guard,
// so `abort_waiter` needs an owned snapshot of the current object table.
trait CloneValues {
    fn clone_values(&self) -> Vec<Arc<ObjectEntry>>;
}

impl CloneValues for std::collections::HashMap<LockObjectId, Arc<ObjectEntry>> {
    fn clone_values(&self) -> Vec<Arc<ObjectEntry>> {
        self.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Fid;

    fn manager() -> LockManager {
        LockManager::new(&EnvConfig::default())
    }

    #[test]
    fn read_locks_are_shared() {
        let lm = manager();
        let t1 = lm.alloc_id().unwrap();
        let t2 = lm.alloc_id().unwrap();
        let obj = LockObjectId::page(Fid::zero(), 1);
        lm.get(t1, obj, LockMode::Read, GetFlags::default()).unwrap();
        lm.get(t2, obj, LockMode::Read, GetFlags::default()).unwrap();
    }

    #[test]
    fn nowait_returns_busy_on_conflict() {
        let lm = manager();
        let t1 = lm.alloc_id().unwrap();
        let t2 = lm.alloc_id().unwrap();
        let obj = LockObjectId::page(Fid::zero(), 1);
        lm.get(t1, obj, LockMode::Read, GetFlags::default()).unwrap();
        let flags = GetFlags { nowait: true, ..Default::default() };
        let res = lm.get(t2, obj, LockMode::Write, flags);
        assert!(matches!(res, Err(DbError::Busy)));
    }

    #[test]
    fn put_releases_and_promotes_waiter() {
        let lm = manager();
        let t1 = lm.alloc_id().unwrap();
        let t2 = lm.alloc_id().unwrap();
        let obj = LockObjectId::page(Fid::zero(), 1);
        lm.get(t1, obj, LockMode::Write, GetFlags::default()).unwrap();

        let lm2 = Arc::new(lm);
        let lm_clone = lm2.clone();
        let handle = std::thread::spawn(move || {
            lm_clone.get(t2, obj, LockMode::Write, GetFlags::default())
        });
        std::thread::sleep(Duration::from_millis(50));
        lm2.put(t1, obj).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn downgrade_write_to_read_succeeds() {
        let lm = manager();
        let t1 = lm.alloc_id().unwrap();
        let obj = LockObjectId::page(Fid::zero(), 1);
        lm.get(t1, obj, LockMode::Write, GetFlags::default()).unwrap();
        lm.downgrade(t1, obj, LockMode::Read).unwrap();
        let t2 = lm.alloc_id().unwrap();
        lm.get(t2, obj, LockMode::Read, GetFlags::default()).unwrap();
    }

    #[test]
    fn two_txn_deadlock_resolves_exactly_one_victim() {
        let lm = Arc::new(manager());
        let t1 = lm.alloc_id().unwrap();
        let t2 = lm.alloc_id().unwrap();
        let p1 = LockObjectId::page(Fid::zero(), 1);
        let p2 = LockObjectId::page(Fid::zero(), 2);

        lm.get(t1, p1, LockMode::Write, GetFlags::default()).unwrap();
        lm.get(t2, p2, LockMode::Write, GetFlags::default()).unwrap();

        let lm_a = lm.clone();
        let h1 = std::thread::spawn(move || lm_a.get(t1, p2, LockMode::Write, GetFlags::default()));
        std::thread::sleep(Duration::from_millis(30));
        let res2 = lm.get(t2, p1, LockMode::Write, GetFlags::default());
        let res1 = h1.join().unwrap();

        let deadlocks = [&res1, &res2].iter().filter(|r| matches!(r, Err(DbError::Deadlock))).count();
        assert_eq!(deadlocks, 1, "exactly one side of a 2-cycle must be the victim");
    }
}
