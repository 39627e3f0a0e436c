//! Lock objects, lockers, and locks: the lockable identity is
//! (fid, page-number-or-hash, kind) rather than hard-coded to a B-tree
//! page id, since the lock manager also serves record-locks and
//! handle-locks.

use crate::ids::{Fid, Pgno};
use std::fmt;

/// What kind of thing is being locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockObjectKind {
    Page,
    Record,
    Handle,
}

/// Identity of something lockable: (fid, page-number, type). For record
/// locks the "page-number" field holds a hash of the record key
/// instead, per the RECORD flag on `LockManager::get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockObjectId {
    pub fid: Fid,
    pub pgno: Pgno,
    pub kind: LockObjectKind,
}

impl LockObjectId {
    pub fn page(fid: Fid, pgno: Pgno) -> Self {
        Self {
            fid,
            pgno,
            kind: LockObjectKind::Page,
        }
    }

    pub fn record(fid: Fid, key_hash: u32) -> Self {
        Self {
            fid,
            pgno: key_hash,
            kind: LockObjectKind::Record,
        }
    }

    pub fn handle(fid: Fid) -> Self {
        Self {
            fid,
            pgno: 0,
            kind: LockObjectKind::Handle,
        }
    }
}

impl fmt::Display for LockObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({}, {})", self.kind, self.fid, self.pgno)
    }
}

/// Non-transactional lock ids start at 1; transaction ids begin above
/// this boundary, so the id space is partitioned between the two.
pub const LOCKER_ID_BOUNDARY: u64 = 0x8000_0000;

/// Numeric identity of an agent that may hold locks.
pub type LockerId = u64;

/// A single grant or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    Waiting,
    Pending,
    Held,
    Expired,
    Aborted,
}

/// Flags accepted by `LockManager::get`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetFlags {
    pub nowait: bool,
    pub timeout: Option<std::time::Duration>,
    pub upgrade: bool,
    pub record: bool,
}
