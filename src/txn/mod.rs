//! Transaction manager and crash recovery.
//!
//! An atomic locker-id counter drives `begin`/`commit`/`abort`, keeping
//! the log manager, buffer pool, and lock manager in lockstep. On top
//! of that: parent/child nesting with lock transfer on nested commit,
//! a per-transaction isolation level, two-phase prepare, and full
//! redo/undo recovery driven by replaying the log's record stream
//! rather than assuming a live, unrecovered environment.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use parking_lot::Mutex;

use crate::error::{DbError, DbResult};
use crate::ids::{Fid, Lsn, Pgno};
use crate::lock::{GetFlags as LockGetFlags, LockManager, LockMode, LockObjectId, LockerId};
use crate::log::{LogManager, LogRecord, RecordBody};
use crate::mpool::{BufferPool, GetFlags as MpoolGetFlags, PutFlags as MpoolPutFlags};

/// Isolation levels, selectable per-transaction via `TxnConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    Serializable,
    ReadCommitted,
    ReadUncommitted,
    Snapshot,
}

/// Flags accepted by `TxnManager::begin`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxnConfig {
    pub isolation: IsolationLevel,
    pub nosync: bool,
    pub cds_group: bool,
}

/// Per-transaction bookkeeping kept by the manager while the transaction
/// is open.
struct TxnState {
    parent: Option<TxnId>,
    children: Vec<TxnId>,
    first_lsn: Option<Lsn>,
    last_lsn: Lsn,
    config: TxnConfig,
    open_fids: Vec<Fid>,
    prepared: bool,
}

pub type TxnId = u64;

/// Drives begin/commit/abort/prepare and backward-scan recovery over the
/// log and lock manager.
pub struct TxnManager {
    log: Arc<LogManager>,
    lock: Arc<LockManager>,
    mpool: StdRwLock<Option<Arc<BufferPool>>>,
    files: Mutex<HashMap<Fid, Arc<crate::mpool::FilePool>>>,
    states: Mutex<HashMap<TxnId, TxnState>>,
    checkpoint_mutex: Mutex<()>,
    panicked: AtomicBool,
}

impl TxnManager {
    pub fn new(log: Arc<LogManager>, lock: Arc<LockManager>) -> Self {
        Self {
            log,
            lock,
            mpool: StdRwLock::new(None),
            files: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            checkpoint_mutex: Mutex::new(()),
            panicked: AtomicBool::new(false),
        }
    }

    /// Wires in the buffer pool belonging to the same environment, once
    /// it exists. `Environment::open` calls this right after both
    /// managers are constructed, since `TxnManager::new` alone cannot
    /// see the pool (its construction order in `Environment::open`
    /// predates it).
    pub fn attach_mpool(&self, mpool: Arc<BufferPool>) {
        *self.mpool.write().unwrap() = Some(mpool);
    }

    fn mpool(&self) -> DbResult<Arc<BufferPool>> {
        self.mpool
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| DbError::Inval("transaction manager has no buffer pool attached".into()))
    }

    /// Register a file so recovery and undo can resolve a `Fid` back to
    /// a page-addressable file; also logs a FILEOPEN record so recovery
    /// can rebuild the same mapping from the log alone.
    pub fn register_file(&self, fid: Fid, file: Arc<crate::mpool::FilePool>, name: &str) -> DbResult<()> {
        self.files.lock().insert(fid, file);
        self.log.register_file(fid, name)?;
        Ok(())
    }

    /// Begin a new (optionally nested) transaction. The BEGIN record
    /// itself is deferred until the transaction's first write
    /// (`log_op`), so read-only transactions never touch the log.
    pub fn begin(self: &Arc<Self>, parent: Option<TxnId>, config: TxnConfig) -> DbResult<Transaction> {
        self.check_panic()?;
        let id = self.lock.alloc_txn_id()?;
        {
            let mut states = self.states.lock();
            states.insert(
                id,
                TxnState {
                    parent,
                    children: Vec::new(),
                    first_lsn: None,
                    last_lsn: Lsn::ZERO,
                    config,
                    open_fids: Vec::new(),
                    prepared: false,
                },
            );
            if let Some(p) = parent {
                if let Some(prec) = states.get_mut(&p) {
                    prec.children.push(id);
                } else {
                    states.remove(&id);
                    return Err(DbError::Inval(format!("parent transaction {} not found", p)));
                }
            }
        }
        Ok(Transaction {
            id,
            mgr: self.clone(),
        })
    }

    fn check_panic(&self) -> DbResult<()> {
        if self.panicked.load(Ordering::SeqCst) {
            Err(DbError::Panic)
        } else {
            Ok(())
        }
    }

    /// Append a log record for `txn`, chaining `prev_lsn` to the
    /// transaction's current `last_lsn` and advancing it. Emits a
    /// deferred BEGIN first if this is the transaction's first write.
    fn log_op(&self, txn: TxnId, body: RecordBody) -> DbResult<Lsn> {
        let mut states = self.states.lock();
        let state = states
            .get_mut(&txn)
            .ok_or_else(|| DbError::Inval(format!("unknown transaction {}", txn)))?;
        if state.first_lsn.is_none() {
            let begin_lsn = self.log.put(txn, Lsn::ZERO, RecordBody::Begin)?;
            state.first_lsn = Some(begin_lsn);
            state.last_lsn = begin_lsn;
        }
        let prev = state.last_lsn;
        drop(states);

        let lsn = self.log.put(txn, prev, body)?;

        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(&txn) {
            state.last_lsn = lsn;
        }
        Ok(lsn)
    }

    /// Commit: emit COMMIT, flush unless NOSYNC, release (or, for a
    /// nested transaction, transfer) locks, free the locker id.
    fn commit(&self, txn: TxnId) -> DbResult<()> {
        self.check_panic()?;
        let (last_lsn, parent, nosync) = {
            let states = self.states.lock();
            let state = states
                .get(&txn)
                .ok_or_else(|| DbError::Inval(format!("unknown transaction {}", txn)))?;
            (state.last_lsn, state.parent, state.config.nosync)
        };

        // An empty transaction (no writes, no BEGIN emitted) still needs
        // a COMMIT record so the log reflects it.
        let commit_lsn = self.log.put(txn, last_lsn, RecordBody::Commit)?;
        if !nosync {
            self.log.flush(Some(commit_lsn))?;
        }

        match parent {
            Some(p) => self.lock.transfer(txn, p)?,
            None => self.lock.put_all(txn)?,
        }

        self.lock.id_free(txn)?;
        self.log.note_txn_commit_or_abort(txn);
        self.states.lock().remove(&txn);
        Ok(())
    }

    /// Abort: walk the transaction's prev-LSN chain backward applying
    /// undo, emit ABORT, release locks, free the locker id.
    fn abort(&self, txn: TxnId) -> DbResult<()> {
        self.check_panic()?;
        let last_lsn = {
            let states = self.states.lock();
            states
                .get(&txn)
                .ok_or_else(|| DbError::Inval(format!("unknown transaction {}", txn)))?
                .last_lsn
        };

        if !last_lsn.is_zero() {
            let mpool = self.mpool()?;
            let mut cursor = last_lsn;
            loop {
                let rec = self.read_one(cursor)?;
                if matches!(rec.body, RecordBody::Begin) {
                    break;
                }
                self.undo_apply(&mpool, &rec)?;
                if rec.prev_lsn.is_zero() {
                    break;
                }
                cursor = rec.prev_lsn;
            }
        }

        self.log.put(txn, last_lsn, RecordBody::Abort)?;
        self.lock.put_all(txn)?;
        self.lock.id_free(txn)?;
        self.log.note_txn_commit_or_abort(txn);
        self.states.lock().remove(&txn);
        Ok(())
    }

    /// Two-phase prepare: the transaction's effects are durable but it
    /// is held open until a subsequent `commit`/`abort`. A
    /// prepared-but-unresolved transaction survives a crash and is
    /// re-exposed by `recover`.
    fn prepare(&self, txn: TxnId) -> DbResult<()> {
        self.check_panic()?;
        let last_lsn = {
            let states = self.states.lock();
            states
                .get(&txn)
                .ok_or_else(|| DbError::Inval(format!("unknown transaction {}", txn)))?
                .last_lsn
        };
        let lsn = self.log.put(txn, last_lsn, RecordBody::Prepare)?;
        self.log.flush(Some(lsn))?;
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(&txn) {
            state.last_lsn = lsn;
            state.prepared = true;
        }
        Ok(())
    }

    fn read_one(&self, lsn: Lsn) -> DbResult<LogRecord> {
        let mut cursor = self.log.cursor(lsn)?;
        cursor
            .next_record()?
            .ok_or_else(|| DbError::Inval(format!("log record at {} not found", lsn)))
    }

    /// Open `name` under `base_dir` and register it under `fid` if not
    /// already known, so a later UPDATE/FREE record referencing `fid`
    /// has a file to redo/undo against. A no-op if recovery already
    /// learned this mapping (e.g. from an earlier FILEOPEN record, or
    /// because the caller registered it before calling `recover`).
    fn reopen_for_recovery(
        &self,
        fid: Fid,
        name: &str,
        base_dir: &std::path::Path,
        mpool: &Arc<BufferPool>,
    ) -> DbResult<()> {
        if self.files.lock().contains_key(&fid) {
            return Ok(());
        }
        let path = base_dir.join(name);
        let file = Arc::new(crate::mpool::FilePool::new(&path, mpool.page_size())?);
        mpool.open_file(fid, file.clone());
        self.files.lock().insert(fid, file);
        Ok(())
    }

    /// Apply a record's redo image if the target page's on-disk LSN
    /// precedes the record's: redo forward means re-applying every
    /// record whose target page LSN is older than the record's own.
    fn redo_apply(&self, mpool: &Arc<BufferPool>, rec: &LogRecord) -> DbResult<()> {
        match &rec.body {
            RecordBody::Update { fid, pgno, after, .. } => {
                self.redo_write(mpool, *fid, *pgno, after, rec.lsn)
            }
            RecordBody::Free { fid, pgno, .. } => {
                // A FREE record's redo is "this page is invalid again";
                // its full post-free image is the all-zero page with
                // type INVALID, which new_page/free_page always write
                // before logging, so nothing further to redo here
                // beyond what a following ALLOC/UPDATE record covers.
                let _ = (fid, pgno);
                Ok(())
            }
            RecordBody::Alloc { .. } => Ok(()),
            _ => Ok(()),
        }
    }

    fn redo_write(&self, mpool: &Arc<BufferPool>, fid: Fid, pgno: Pgno, after: &[u8], lsn: Lsn) -> DbResult<()> {
        let buf = mpool.get(fid, pgno, MpoolGetFlags { create: true, ..Default::default() })?;
        let should_apply = buf.read().lsn < lsn;
        if should_apply {
            let mut guard = buf.write();
            guard.bytes.clear();
            guard.bytes.extend_from_slice(after);
            guard.mark_dirty(lsn);
        }
        mpool.put(&buf, MpoolPutFlags { dirty: should_apply, ..Default::default() })
    }

    /// Apply a record's undo (reverse) image.
    fn undo_apply(&self, mpool: &Arc<BufferPool>, rec: &LogRecord) -> DbResult<()> {
        match &rec.body {
            RecordBody::Update { fid, pgno, before, .. } => {
                let buf = mpool.get(*fid, *pgno, MpoolGetFlags { create: true, ..Default::default() })?;
                {
                    let mut guard = buf.write();
                    guard.bytes.clear();
                    guard.bytes.extend_from_slice(before);
                    guard.mark_dirty(rec.lsn);
                }
                mpool.put(&buf, MpoolPutFlags { dirty: true, ..Default::default() })
            }
            RecordBody::Free { fid, pgno, old_image, .. } => {
                // Undo a FREE: restore the page's pre-free image, i.e.
                // put it back into the live tree it came from.
                let buf = mpool.get(*fid, *pgno, MpoolGetFlags { create: true, ..Default::default() })?;
                {
                    let mut guard = buf.write();
                    guard.bytes.clear();
                    guard.bytes.extend_from_slice(old_image);
                    guard.mark_dirty(rec.lsn);
                }
                mpool.put(&buf, MpoolPutFlags { dirty: true, ..Default::default() })
            }
            RecordBody::Alloc { .. } => {
                // Undo an ALLOC: the meta page's free-list-head Update
                // record that always accompanies an ALLOC (see
                // `access::freelist::new_page`) already restores
                // `old_free_head`; the allocated page itself is simply
                // abandoned (never linked into a live structure by an
                // aborted transaction).
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Recovery: scan for the most recent checkpoint, redo forward from
    /// it, then undo every transaction not committed by the tail.
    /// Returns the ids of transactions left PREPARED and unresolved,
    /// which the caller must re-expose.
    ///
    /// `base_dir` resolves the relative names carried by FILEOPEN/
    /// CHECKPOINT records back to paths, so recovery can reopen a
    /// file's `Fid` mapping from the log alone rather than depending on
    /// a caller having already called `register_file` this process.
    pub fn recover(&self, mpool: &Arc<BufferPool>, base_dir: &std::path::Path) -> DbResult<Vec<TxnId>> {
        self.attach_mpool(mpool.clone());

        let mut last_checkpoint: Option<Lsn> = None;
        {
            let mut scan = self.log.cursor(Lsn::ZERO)?;
            while let Some(rec) = scan.next_record()? {
                if matches!(rec.body, RecordBody::Checkpoint { .. }) {
                    last_checkpoint = Some(rec.lsn);
                }
            }
        }

        let mut chains: HashMap<TxnId, Vec<LogRecord>> = HashMap::new();
        let mut resolved: HashSet<TxnId> = HashSet::new();
        let mut prepared: HashSet<TxnId> = HashSet::new();

        let start = last_checkpoint.unwrap_or(Lsn::ZERO);
        let mut replay = self.log.cursor(start)?;
        while let Some(rec) = replay.next_record()? {
            match &rec.body {
                RecordBody::Commit | RecordBody::Abort => {
                    resolved.insert(rec.txn_id);
                    prepared.remove(&rec.txn_id);
                }
                RecordBody::Prepare => {
                    prepared.insert(rec.txn_id);
                }
                RecordBody::FileOpen { fid, name } => {
                    self.reopen_for_recovery(*fid, name, base_dir, mpool)?;
                }
                RecordBody::Checkpoint { open_files, .. } => {
                    for (fid, name) in open_files {
                        self.reopen_for_recovery(*fid, name, base_dir, mpool)?;
                    }
                }
                RecordBody::Update { fid, .. } | RecordBody::Free { fid, .. } => {
                    self.redo_apply(mpool, &rec)?;
                    let _ = fid;
                }
                _ => {}
            }
            if rec.txn_id != 0 {
                chains.entry(rec.txn_id).or_default().push(rec);
            }
        }

        let mut undone = Vec::new();
        for (txn_id, chain) in chains.iter() {
            if resolved.contains(txn_id) || prepared.contains(txn_id) {
                continue;
            }
            for rec in chain.iter().rev() {
                self.undo_apply(mpool, rec)?;
            }
            let last = chain.last().map(|r| r.lsn).unwrap_or(Lsn::ZERO);
            self.log.put(*txn_id, last, RecordBody::Abort)?;
            undone.push(*txn_id);
        }

        self.log.put(0, Lsn::ZERO, RecordBody::RecoveryDone)?;
        self.checkpoint()?;

        Ok(prepared.into_iter().collect())
    }

    /// Checkpoint: sync the buffer pool through the log tail (honoring
    /// WAL), append a CHECKPOINT record, flush.
    pub fn checkpoint(&self) -> DbResult<Lsn> {
        let _guard = self.checkpoint_mutex.lock();
        self.check_panic()?;
        if let Some(mpool) = self.mpool.read().unwrap().clone() {
            let log = self.log.clone();
            mpool.sync(None, || log.durable_lsn(), |fid, pgno, bytes| {
                self.write_back(fid, pgno, bytes)
            })?;
        }
        self.log.checkpoint()
    }

    fn write_back(&self, fid: Fid, pgno: Pgno, bytes: &[u8]) -> DbResult<()> {
        let files = self.files.lock();
        let file = files
            .get(&fid)
            .ok_or_else(|| DbError::NoEnt(format!("file {} not open for write-back", fid)))?;
        file.write_page(pgno, bytes)
    }

    /// Sweep expired waits across the lock manager; a thread-driven
    /// background policy invokes this periodically.
    pub fn sweep_lock_timeouts(&self) {
        self.lock.sweep_timeouts();
    }
}

/// A handle to one open transaction. Cheap to clone (shares the manager
/// via `Arc`); `commit`/`abort`/`prepare` consume it so a finished
/// transaction cannot be used again.
#[derive(Clone)]
pub struct Transaction {
    id: TxnId,
    mgr: Arc<TxnManager>,
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.mgr
            .states
            .lock()
            .get(&self.id)
            .map(|s| s.config.isolation)
            .unwrap_or_default()
    }

    /// Append a log record on this transaction's prev-LSN chain.
    /// Access-method code calls this for every logged mutation, then
    /// sets the mutated page's buffer LSN to the returned value before
    /// releasing it (the write-ahead-log ordering invariant).
    pub fn log_update(&self, body: RecordBody) -> DbResult<Lsn> {
        self.mgr.log_op(self.id, body)
    }

    pub fn lock_get(&self, object: LockObjectId, mode: LockMode, flags: LockGetFlags) -> DbResult<()> {
        self.mgr.lock.get(self.id, object, mode, flags)
    }

    pub fn lock_put(&self, object: LockObjectId) -> DbResult<()> {
        self.mgr.lock.put(self.id, object)
    }

    pub fn note_open_file(&self, fid: Fid) {
        let mut states = self.mgr.states.lock();
        if let Some(state) = states.get_mut(&self.id) {
            if !state.open_fids.contains(&fid) {
                state.open_fids.push(fid);
            }
        }
    }

    pub fn commit(self) -> DbResult<()> {
        self.mgr.commit(self.id)
    }

    pub fn abort(self) -> DbResult<()> {
        self.mgr.abort(self.id)
    }

    pub fn prepare(&self) -> DbResult<()> {
        self.mgr.prepare(self.id)
    }

    /// The locker id this transaction's operations acquire locks under;
    /// identical to `id()`, since for transactional operations the
    /// locker is the transaction itself.
    pub fn locker_id(&self) -> LockerId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::ids::Fid;
    use crate::mpool::{FilePool, GetFlags as MGet, PutFlags as MPut};

    fn harness() -> (tempfile::TempDir, Arc<LogManager>, Arc<LockManager>, Arc<BufferPool>) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EnvConfig::default();
        let log = Arc::new(LogManager::open(dir.path(), &cfg).unwrap());
        let lock = Arc::new(LockManager::new(&cfg));
        let mpool = Arc::new(BufferPool::new(&cfg));
        (dir, log, lock, mpool)
    }

    #[test]
    fn commit_emits_begin_and_commit_records() {
        let (_dir, log, lock, mpool) = harness();
        let mgr = Arc::new(TxnManager::new(log.clone(), lock));
        mgr.attach_mpool(mpool);
        let txn = mgr.begin(None, TxnConfig::default()).unwrap();
        txn.log_update(RecordBody::Update {
            fid: Fid::zero(),
            pgno: 1,
            before: vec![0; 4],
            after: vec![1; 4],
        })
        .unwrap();
        txn.commit().unwrap();

        let mut cursor = log.cursor(Lsn::ZERO).unwrap();
        let first = cursor.next_record().unwrap().unwrap();
        assert!(matches!(first.body, RecordBody::Begin));
        let second = cursor.next_record().unwrap().unwrap();
        assert!(matches!(second.body, RecordBody::Update { .. }));
        let third = cursor.next_record().unwrap().unwrap();
        assert!(matches!(third.body, RecordBody::Commit));
    }

    #[test]
    fn abort_restores_before_image() {
        let (dir, log, lock, mpool) = harness();
        let mgr = Arc::new(TxnManager::new(log.clone(), lock));
        mgr.attach_mpool(mpool.clone());

        let path = dir.path().join("t.db");
        let file = Arc::new(FilePool::new(&path, 64).unwrap());
        mpool.open_file(Fid::zero(), file.clone());
        mgr.register_file(Fid::zero(), file, "t.db").unwrap();

        let buf = mpool.get(Fid::zero(), 0, MGet { create: true, ..Default::default() }).unwrap();
        buf.write().bytes = vec![0u8; 64];
        mpool.put(&buf, MPut::default()).unwrap();

        let txn = mgr.begin(None, TxnConfig::default()).unwrap();
        let before = vec![0u8; 64];
        let mut after = vec![0u8; 64];
        after[0] = 42;
        let lsn = txn
            .log_update(RecordBody::Update {
                fid: Fid::zero(),
                pgno: 0,
                before: before.clone(),
                after: after.clone(),
            })
            .unwrap();
        let buf = mpool.get(Fid::zero(), 0, MGet::default()).unwrap();
        buf.write().bytes = after.clone();
        buf.write().mark_dirty(lsn);
        mpool.put(&buf, MPut { dirty: true, ..Default::default() }).unwrap();

        txn.abort().unwrap();

        let buf = mpool.get(Fid::zero(), 0, MGet::default()).unwrap();
        assert_eq!(buf.read().bytes, before);
    }

    #[test]
    fn nested_commit_transfers_locks_to_parent() {
        let (_dir, log, lock, mpool) = harness();
        let mgr = Arc::new(TxnManager::new(log, lock.clone()));
        mgr.attach_mpool(mpool);
        let parent = mgr.begin(None, TxnConfig::default()).unwrap();
        let child = mgr.begin(Some(parent.id()), TxnConfig::default()).unwrap();
        let obj = LockObjectId::page(Fid::zero(), 7);
        child.lock_get(obj, LockMode::Write, LockGetFlags::default()).unwrap();
        let child_id = child.id();
        child.commit().unwrap();

        // The parent now holds the lock the child acquired: a new
        // locker requesting WRITE on the same object must block.
        let other = lock.alloc_id().unwrap();
        let res = lock.get(
            other,
            obj,
            LockMode::Write,
            LockGetFlags { nowait: true, ..Default::default() },
        );
        assert!(matches!(res, Err(DbError::Busy)));
        let _ = child_id;
        parent.commit().unwrap();
    }
}
