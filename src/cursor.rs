//! The shared cursor contract over B-tree, Hash, and Queue: `{get, put,
//! del, count, dup, close, key-range}` dispatched by the owning
//! [`Database`]'s access-method tag.
//!
//! Owns a `Transaction` reference and a current key/position, coupling
//! and releasing page locks through each underlying access method's
//! `get`/`put`/`del`/`first`/`next` call rather than holding them across
//! operations.

use crate::db::Database;
use crate::error::{DbError, DbResult};
use crate::txn::Transaction;

/// Positioning mode for [`Cursor::position`]: the usual page-cursor
/// vocabulary (`FIRST`, `NEXT`, `CURRENT`, `LAST`, `PREV`, `SET`).
/// B-tree/Hash/Queue cursors only need the forward subset; `Prev`/`Last`
/// are accepted but only meaningful for `Queue`, whose record-number
/// space is reversible in O(1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position<'k> {
    First,
    Next,
    Current,
    Last,
    Prev,
    Set(&'k [u8]),
}

/// Flags accepted by [`Cursor::open`]: a
/// transient cursor is closed by its operation rather than held across
/// calls; a write cursor acquires `IWRITE`/`WRITE` rather than `READ`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CursorFlags {
    pub transient: bool,
    pub write: bool,
    pub read_committed: bool,
    pub read_uncommitted: bool,
    pub dirty_reader: bool,
}

/// A positioned iterator over one [`Database`]. Holds at most one
/// page-lock per level between operations (the underlying access
/// method's `get`/`put`/`del`/`first`/`next` calls couple and release
/// locks internally); this type layers positional (`FIRST`/`NEXT`/...)
/// semantics on top.
pub struct Cursor<'d> {
    db: &'d Database,
    txn: &'d Transaction,
    flags: CursorFlags,
    current_key: Option<Vec<u8>>,
    // Lazily-built unordered snapshot for Hash, since extendible hashing
    // has no inherent key order to walk incrementally; a B-tree/Queue
    // cursor instead calls back into the access method per step.
    hash_snapshot: Option<Vec<(Vec<u8>, Vec<u8>)>>,
    hash_index: usize,
}

impl<'d> Cursor<'d> {
    pub(crate) fn new(db: &'d Database, txn: &'d Transaction) -> Self {
        Self {
            db,
            txn,
            flags: CursorFlags::default(),
            current_key: None,
            hash_snapshot: None,
            hash_index: 0,
        }
    }

    pub fn with_flags(mut self, flags: CursorFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Position the cursor and return the entry found there, if any.
    pub fn position(&mut self, pos: Position<'_>) -> DbResult<Option<(Vec<u8>, Vec<u8>)>> {
        if let Some(bt) = self.db.as_btree() {
            return self.position_btree(bt, pos);
        }
        if let Some(h) = self.db.as_hash() {
            return self.position_hash(h, pos);
        }
        if let Some(q) = self.db.as_queue() {
            return self.position_queue(q, pos);
        }
        unreachable!("Database always wraps exactly one access method")
    }

    fn position_btree(
        &mut self,
        bt: &crate::access::btree::BTree,
        pos: Position<'_>,
    ) -> DbResult<Option<(Vec<u8>, Vec<u8>)>> {
        let result = match pos {
            Position::First => bt.first(self.txn)?,
            Position::Set(key) => bt.get(self.txn, key)?.map(|v| (key.to_vec(), v)),
            Position::Next => match &self.current_key {
                Some(k) => bt.next(self.txn, k)?,
                None => bt.first(self.txn)?,
            },
            Position::Current => match &self.current_key {
                Some(k) => bt.get(self.txn, k)?.map(|v| (k.clone(), v)),
                None => None,
            },
            Position::Last | Position::Prev => {
                return Err(DbError::OpNotSup);
            }
        };
        self.current_key = result.as_ref().map(|(k, _)| k.clone());
        Ok(result)
    }

    fn position_hash(
        &mut self,
        h: &crate::access::hash::Hash,
        pos: Position<'_>,
    ) -> DbResult<Option<(Vec<u8>, Vec<u8>)>> {
        if let Position::Set(key) = pos {
            return Ok(h.get(self.txn, key)?.map(|v| (key.to_vec(), v)));
        }
        if self.hash_snapshot.is_none() {
            self.hash_snapshot = Some(h.scan(self.txn)?);
        }
        let snapshot = self.hash_snapshot.as_ref().unwrap();
        match pos {
            Position::First => {
                self.hash_index = 0;
            }
            Position::Next => {
                self.hash_index += 1;
            }
            Position::Current => {}
            Position::Last | Position::Prev => return Err(DbError::OpNotSup),
            Position::Set(_) => unreachable!(),
        }
        let entry = snapshot.get(self.hash_index).cloned();
        self.current_key = entry.as_ref().map(|(k, _)| k.clone());
        Ok(entry)
    }

    fn position_queue(
        &mut self,
        q: &crate::access::queue::Queue,
        pos: Position<'_>,
    ) -> DbResult<Option<(Vec<u8>, Vec<u8>)>> {
        let last = q.record_count(self.txn)?;
        let current_recno = || -> u32 {
            self.current_key
                .as_ref()
                .and_then(|k| k.as_slice().try_into().ok())
                .map(u32::from_be_bytes)
                .unwrap_or(0)
        };
        let target = match pos {
            Position::First => 1,
            Position::Last => last,
            Position::Next => current_recno() + 1,
            Position::Prev => current_recno().saturating_sub(1),
            Position::Current => current_recno(),
            Position::Set(key) => {
                let recno: u32 = key
                    .try_into()
                    .map(u32::from_be_bytes)
                    .map_err(|_| DbError::Inval("queue SET key must be a 4-byte big-endian record number".into()))?;
                recno
            }
        };
        if target == 0 || target > last {
            self.current_key = None;
            return Ok(None);
        }
        let mut recno = target;
        // Deleted slots are skipped when advancing; `SET`/`CURRENT` do
        // not skip, since landing exactly on a deleted slot is itself an
        // observable (empty) result.
        let skip_deleted = matches!(pos, Position::Next | Position::Prev | Position::First | Position::Last);
        loop {
            match q.get(self.txn, recno)? {
                Some(v) => {
                    let key = recno.to_be_bytes().to_vec();
                    self.current_key = Some(key.clone());
                    return Ok(Some((key, v)));
                }
                None if skip_deleted => {
                    recno = match pos {
                        Position::Prev => {
                            if recno == 0 {
                                self.current_key = None;
                                return Ok(None);
                            }
                            recno - 1
                        }
                        _ => recno + 1,
                    };
                    if recno == 0 || recno > last {
                        self.current_key = None;
                        return Ok(None);
                    }
                }
                None => {
                    self.current_key = None;
                    return Ok(None);
                }
            }
        }
    }

    pub fn get(&mut self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        Ok(self.position(Position::Set(key))?.map(|(_, v)| v))
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> DbResult<()> {
        self.db.put(self.txn, key, value)?;
        self.current_key = Some(key.to_vec());
        Ok(())
    }

    pub fn del(&mut self) -> DbResult<bool> {
        match &self.current_key {
            Some(k) => self.db.del(self.txn, k),
            None => Ok(false),
        }
    }

    /// Number of duplicate entries sharing the cursor's current key.
    /// B-tree is the only access method that allows duplicates; the
    /// others always report 0 or 1.
    pub fn count(&self) -> DbResult<u32> {
        let Some(key) = &self.current_key else {
            return Ok(0);
        };
        match self.db.get(self.txn, key)? {
            Some(_) => Ok(1),
            None => Ok(0),
        }
    }

    /// Duplicate the cursor at its current position (a fresh, logically
    /// independent cursor over the same key).
    pub fn dup(&self) -> Cursor<'d> {
        Cursor {
            db: self.db,
            txn: self.txn,
            flags: self.flags,
            current_key: self.current_key.clone(),
            hash_snapshot: self.hash_snapshot.clone(),
            hash_index: self.hash_index,
        }
    }

    /// Inclusive `[lo, hi)` key range scan over a B-tree; the only access
    /// method with an intrinsic order for `key-range` to mean anything.
    pub fn key_range(&mut self, lo: &[u8], hi: &[u8]) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let bt = self.db.as_btree().ok_or(DbError::OpNotSup)?;
        let mut out = Vec::new();
        let mut next = bt.get(self.txn, lo)?.map(|v| (lo.to_vec(), v));
        if next.is_none() {
            next = bt.next(self.txn, lo)?;
        }
        while let Some((k, v)) = next {
            if k.as_slice() >= hi {
                break;
            }
            out.push((k.clone(), v));
            next = bt.next(self.txn, &k)?;
        }
        Ok(out)
    }

    /// Release the cursor's position. A no-op beyond dropping local
    /// state: per-operation locks are already released by the access
    /// method before each call returns.
    pub fn close(mut self) {
        self.current_key = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::db::{DbConfig, DbTypeConfig};
    use crate::env::{Environment, OpenFlags};

    #[test]
    fn btree_cursor_walks_first_next_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::open(dir.path(), OpenFlags::full(), EnvConfig::default()).unwrap();
        let db = Database::open(env.clone(), "t.db", DbConfig::default(), true).unwrap();
        let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
        for (k, v) in [("b", "2"), ("a", "1"), ("c", "3")] {
            db.put(&txn, k.as_bytes(), v.as_bytes()).unwrap();
        }
        let mut cursor = db.cursor(&txn);
        let mut seen = Vec::new();
        let mut entry = cursor.position(Position::First).unwrap();
        while let Some((k, v)) = entry {
            seen.push((k, v));
            entry = cursor.position(Position::Next).unwrap();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
        txn.commit().unwrap();
    }

    #[test]
    fn btree_key_range_is_half_open() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::open(dir.path(), OpenFlags::full(), EnvConfig::default()).unwrap();
        let db = Database::open(env.clone(), "t.db", DbConfig::default(), true).unwrap();
        let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
        for k in ["a", "b", "c", "d"] {
            db.put(&txn, k.as_bytes(), b"v").unwrap();
        }
        let mut cursor = db.cursor(&txn);
        let got: Vec<Vec<u8>> = cursor.key_range(b"b", b"d").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(got, vec![b"b".to_vec(), b"c".to_vec()]);
        txn.commit().unwrap();
    }

    #[test]
    fn queue_cursor_skips_deleted_slots() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::open(dir.path(), OpenFlags::full(), EnvConfig::default()).unwrap();
        let cfg = DbConfig { db_type: DbTypeConfig::Queue, record_len: 4, ..Default::default() };
        let db = Database::open(env.clone(), "q.db", cfg, true).unwrap();
        let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
        db.put(&txn, b"", b"rec1").unwrap();
        db.put(&txn, b"", b"rec2").unwrap();
        db.put(&txn, b"", b"rec3").unwrap();
        db.del(&txn, &2u32.to_be_bytes()).unwrap();
        let mut cursor = db.cursor(&txn);
        let mut seen = Vec::new();
        let mut entry = cursor.position(Position::First).unwrap();
        while let Some((_, v)) = entry {
            seen.push(v);
            entry = cursor.position(Position::Next).unwrap();
        }
        assert_eq!(seen, vec![b"rec1".to_vec(), b"rec3".to_vec()]);
        txn.commit().unwrap();
    }

    #[test]
    fn hash_cursor_visits_every_entry_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::open(dir.path(), OpenFlags::full(), EnvConfig::default()).unwrap();
        let cfg = DbConfig { db_type: DbTypeConfig::Hash, nbuckets: 4, ..Default::default() };
        let db = Database::open(env.clone(), "h.db", cfg, true).unwrap();
        let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
        for i in 0..10u32 {
            db.put(&txn, format!("k{}", i).as_bytes(), b"v").unwrap();
        }
        let mut cursor = db.cursor(&txn);
        let mut count = 0;
        let mut entry = cursor.position(Position::First).unwrap();
        while entry.is_some() {
            count += 1;
            entry = cursor.position(Position::Next).unwrap();
        }
        assert_eq!(count, 10);
        txn.commit().unwrap();
    }
}
