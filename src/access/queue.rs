//! Fixed-record-length queue access method built on the same
//! page/freelist primitives as [`super::btree`], addressed by a 32-bit
//! record number with a per-page deleted bitmap. Records live in a
//! single unbounded extent: the current file grows without a cap, and
//! multi-extent rollover is not wired in.

use std::sync::Arc;

use bit_vec::BitVec;

use crate::error::{DbError, DbResult};
use crate::ids::{Fid, Pgno};
use crate::lock::{GetFlags as LockGetFlags, LockMode, LockObjectId};
use crate::log::RecordBody;
use crate::mpool::{BufferPool, FilePool, GetFlags as MpoolGetFlags, PutFlags as MpoolPutFlags};
use crate::serialize::Writer;
use crate::txn::Transaction;

use super::freelist;
use super::meta::MetaPage;
use super::page::{PageHeader, PageType, HEADER_LEN};

fn lock_obj(fid: Fid, pgno: Pgno) -> LockObjectId {
    LockObjectId::page(fid, pgno)
}

struct QueuePage {
    header: PageHeader,
    deleted: BitVec,
    record_len: usize,
    slots: Vec<u8>,
}

impl QueuePage {
    fn slots_per_page(page_size: usize, record_len: usize) -> usize {
        // Reserve one byte of bitmap per 8 slots, rounded up.
        let mut n = (page_size - HEADER_LEN) / record_len.max(1);
        while n > 0 && HEADER_LEN + (n + 7) / 8 + n * record_len > page_size {
            n -= 1;
        }
        n
    }

    fn new(pgno: Pgno, record_len: usize, capacity: usize) -> Self {
        Self {
            header: PageHeader::new(pgno, PageType::QueueData),
            deleted: BitVec::from_elem(capacity, false),
            record_len,
            slots: vec![0u8; capacity * record_len],
        }
    }

    fn decode(bytes: &[u8], record_len: usize, capacity: usize) -> DbResult<Self> {
        let header = PageHeader::decode(bytes)?;
        let bitmap_len = (capacity + 7) / 8;
        let bitmap_bytes = &bytes[HEADER_LEN..HEADER_LEN + bitmap_len];
        let deleted = BitVec::from_bytes(bitmap_bytes);
        let slots_offset = HEADER_LEN + bitmap_len;
        let slots = bytes[slots_offset..slots_offset + capacity * record_len].to_vec();
        Ok(Self { header, deleted, record_len, slots })
    }

    fn encode(&self, page_size: usize) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_bytes(&self.deleted.to_bytes());
        w.write_bytes(&self.slots);
        let payload = w.into_bytes();
        let mut header = self.header;
        header.entries = self.deleted.iter().filter(|b| !b).count() as u16;
        let mut bytes = vec![0u8; page_size];
        header.write_into(&mut bytes);
        bytes[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(&payload);
        bytes
    }

    fn slot(&self, i: usize) -> &[u8] {
        &self.slots[i * self.record_len..(i + 1) * self.record_len]
    }

    fn set_slot(&mut self, i: usize, value: &[u8]) {
        self.slots[i * self.record_len..(i + 1) * self.record_len].copy_from_slice(value);
    }
}

/// A fixed-record-length database addressed by 32-bit record number.
/// Record number 0 is never assigned (matching the B-tree/recno
/// convention that a positional index is 1-based).
pub struct Queue {
    fid: Fid,
    mpool: Arc<BufferPool>,
    file: Arc<FilePool>,
    page_size: usize,
    record_len: usize,
    per_page: usize,
}

impl Queue {
    pub fn new(fid: Fid, mpool: Arc<BufferPool>, file: Arc<FilePool>, page_size: usize, record_len: usize) -> Self {
        let per_page = QueuePage::slots_per_page(page_size, record_len).max(1);
        Self { fid, mpool, file, page_size, record_len, per_page }
    }

    pub fn init(&self, txn: &Transaction, meta: &mut MetaPage) -> DbResult<()> {
        meta.nparts = 1; // one unbounded extent; rollover is not implemented.
        meta.record_count = 0;
        let first = freelist::new_page(txn, &self.mpool, &self.file, self.fid, PageType::QueueData)?;
        let pgno = first.read().pgno;
        self.mpool.put(&first, MpoolPutFlags::default())?;
        let page = QueuePage::new(pgno, self.record_len, self.per_page);
        let bytes = page.encode(self.page_size);
        self.write_fresh(txn, pgno, bytes)?;
        Ok(())
    }

    fn locate(&self, recno: u32) -> (Pgno, usize) {
        let idx = (recno - 1) as usize;
        let page_idx = idx / self.per_page;
        let slot = idx % self.per_page;
        // Data pages are allocated consecutively starting at pgno 1 (the
        // first call to `init` claims pgno 1), mirroring the B-tree's
        // "new page always extends the high-water mark by one" rule.
        (1 + page_idx as Pgno, slot)
    }

    fn ensure_page(&self, txn: &Transaction, pgno: Pgno) -> DbResult<()> {
        // `create: true` hands back an all-zero in-memory buffer for a
        // pgno past the file's actual length rather than erroring, which
        // is how a brand-new queue data page is "allocated" here.
        let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags { create: true, ..Default::default() })?;
        let is_fresh = buf.read().bytes.iter().all(|&b| b == 0);
        self.mpool.put(&buf, MpoolPutFlags::default())?;
        if is_fresh {
            let page = QueuePage::new(pgno, self.record_len, self.per_page);
            let bytes = page.encode(self.page_size);
            self.write_fresh(txn, pgno, bytes)?;
        }
        Ok(())
    }

    fn write_fresh(&self, txn: &Transaction, pgno: Pgno, after: Vec<u8>) -> DbResult<()> {
        let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags { create: true, ..Default::default() })?;
        let before = buf.read().bytes.clone();
        self.mpool.put(&buf, MpoolPutFlags::default())?;
        self.commit_page(txn, pgno, before, after)
    }

    fn commit_page(&self, txn: &Transaction, pgno: Pgno, before: Vec<u8>, after: Vec<u8>) -> DbResult<()> {
        let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags { create: true, ..Default::default() })?;
        let lsn = txn.log_update(RecordBody::Update { fid: self.fid, pgno, before, after: after.clone() })?;
        let mut guard = buf.write();
        guard.bytes = after;
        guard.mark_dirty(lsn);
        drop(guard);
        self.mpool.put(&buf, MpoolPutFlags { dirty: true, ..Default::default() })
    }

    /// Append at the next record number. Returns the assigned record
    /// number.
    pub fn append(&self, txn: &Transaction, value: &[u8]) -> DbResult<u32> {
        if value.len() != self.record_len {
            return Err(DbError::Inval(format!(
                "queue record must be exactly {} bytes, got {}",
                self.record_len,
                value.len()
            )));
        }
        txn.lock_get(lock_obj(self.fid, 0), LockMode::Write, LockGetFlags::default())?;
        let meta_buf = self.mpool.get(self.fid, 0, MpoolGetFlags::default())?;
        let mut meta = MetaPage::decode(&meta_buf.read().bytes)?;
        self.mpool.put(&meta_buf, MpoolPutFlags::default())?;
        let recno = meta.record_count + 1;

        let (pgno, slot) = self.locate(recno);
        self.ensure_page(txn, pgno)?;
        txn.lock_get(lock_obj(self.fid, pgno), LockMode::Write, LockGetFlags::default())?;

        let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
        let before = buf.read().bytes.clone();
        self.mpool.put(&buf, MpoolPutFlags::default())?;
        let mut page = QueuePage::decode(&before, self.record_len, self.per_page)?;
        page.set_slot(slot, value);
        page.deleted.set(slot, false);
        let after = page.encode(self.page_size);
        self.commit_page(txn, pgno, before, after)?;

        meta.record_count = recno;
        let meta_before = self.mpool.get(self.fid, 0, MpoolGetFlags::default())?;
        let meta_before_bytes = meta_before.read().bytes.clone();
        self.mpool.put(&meta_before, MpoolPutFlags::default())?;
        let meta_after = meta.encode(self.page_size);
        self.commit_page(txn, 0, meta_before_bytes, meta_after)?;

        txn.lock_put(lock_obj(self.fid, pgno))?;
        txn.lock_put(lock_obj(self.fid, 0))?;
        Ok(recno)
    }

    pub fn get(&self, txn: &Transaction, recno: u32) -> DbResult<Option<Vec<u8>>> {
        if recno == 0 {
            return Ok(None);
        }
        let (pgno, slot) = self.locate(recno);
        txn.lock_get(lock_obj(self.fid, pgno), LockMode::Read, LockGetFlags::default())?;
        let buf = match self.mpool.get(self.fid, pgno, MpoolGetFlags::default()) {
            Ok(b) => b,
            Err(_) => {
                txn.lock_put(lock_obj(self.fid, pgno))?;
                return Ok(None);
            }
        };
        let bytes = buf.read().bytes.clone();
        self.mpool.put(&buf, MpoolPutFlags::default())?;
        let page = QueuePage::decode(&bytes, self.record_len, self.per_page)?;
        txn.lock_put(lock_obj(self.fid, pgno))?;
        if slot >= self.per_page || page.deleted.get(slot).unwrap_or(true) {
            return Ok(None);
        }
        Ok(Some(page.slot(slot).to_vec()))
    }

    /// Mark a record number's slot deleted. The slot stays reserved
    /// (never reused by a later `append`), matching the
    /// queue's append-only record-number contract.
    pub fn del(&self, txn: &Transaction, recno: u32) -> DbResult<bool> {
        if recno == 0 {
            return Ok(false);
        }
        let (pgno, slot) = self.locate(recno);
        txn.lock_get(lock_obj(self.fid, pgno), LockMode::Write, LockGetFlags::default())?;
        let buf = match self.mpool.get(self.fid, pgno, MpoolGetFlags::default()) {
            Ok(b) => b,
            Err(_) => {
                txn.lock_put(lock_obj(self.fid, pgno))?;
                return Ok(false);
            }
        };
        let before = buf.read().bytes.clone();
        self.mpool.put(&buf, MpoolPutFlags::default())?;
        let mut page = QueuePage::decode(&before, self.record_len, self.per_page)?;
        if slot >= self.per_page || page.deleted.get(slot).unwrap_or(true) {
            txn.lock_put(lock_obj(self.fid, pgno))?;
            return Ok(false);
        }
        page.deleted.set(slot, true);
        let after = page.encode(self.page_size);
        self.commit_page(txn, pgno, before, after)?;
        txn.lock_put(lock_obj(self.fid, pgno))?;
        Ok(true)
    }

    /// Highest record number ever assigned, for the shared cursor
    /// contract's `LAST`/`NEXT` positioning over the record-number
    /// address space.
    pub fn record_count(&self, txn: &Transaction) -> DbResult<u32> {
        txn.lock_get(lock_obj(self.fid, 0), LockMode::Read, LockGetFlags::default())?;
        let meta_buf = self.mpool.get(self.fid, 0, MpoolGetFlags::default())?;
        let meta = MetaPage::decode(&meta_buf.read().bytes)?;
        self.mpool.put(&meta_buf, MpoolPutFlags::default())?;
        txn.lock_put(lock_obj(self.fid, 0))?;
        Ok(meta.record_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::meta::DbType;
    use crate::config::EnvConfig;
    use crate::lock::LockManager;
    use crate::log::LogManager;
    use crate::txn::{TxnConfig, TxnManager};

    fn harness(page_size: usize, record_len: usize) -> (tempfile::TempDir, Queue, Arc<TxnManager>) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = EnvConfig::default();
        cfg.page_size = page_size;
        let mpool = Arc::new(BufferPool::new(&cfg));
        let path = dir.path().join("q.db");
        let file = Arc::new(FilePool::new(&path, page_size).unwrap());
        let fid = Fid::generate();
        mpool.open_file(fid, file.clone());

        let log = Arc::new(LogManager::open(dir.path(), &cfg).unwrap());
        let lock = Arc::new(LockManager::new(&cfg));
        let txn_mgr = Arc::new(TxnManager::new(log, lock));
        txn_mgr.attach_mpool(mpool.clone());

        let queue = Queue::new(fid, mpool.clone(), file, page_size, record_len);
        let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();
        let meta_buf = mpool.get(fid, 0, MpoolGetFlags { create: true, ..Default::default() }).unwrap();
        let mut meta = MetaPage::new(page_size as u32, DbType::Queue, Default::default(), fid);
        queue.init(&txn, &mut meta).unwrap();
        let bytes = meta.encode(page_size);
        meta_buf.write().bytes = bytes;
        mpool.put(&meta_buf, MpoolPutFlags { dirty: true, ..Default::default() }).unwrap();
        txn.commit().unwrap();

        (dir, queue, txn_mgr)
    }

    #[test]
    fn append_then_get_round_trips() {
        let (_dir, q, txn_mgr) = harness(256, 8);
        let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();
        let r1 = q.append(&txn, b"record01").unwrap();
        let r2 = q.append(&txn, b"record02").unwrap();
        assert_eq!(r1, 1);
        assert_eq!(r2, 2);
        assert_eq!(q.get(&txn, r1).unwrap(), Some(b"record01".to_vec()));
        assert_eq!(q.get(&txn, r2).unwrap(), Some(b"record02".to_vec()));
        txn.commit().unwrap();
    }

    #[test]
    fn delete_marks_slot_unreadable() {
        let (_dir, q, txn_mgr) = harness(256, 8);
        let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();
        let r1 = q.append(&txn, b"record01").unwrap();
        assert!(q.del(&txn, r1).unwrap());
        assert_eq!(q.get(&txn, r1).unwrap(), None);
        txn.commit().unwrap();
    }

    #[test]
    fn spanning_multiple_pages_stays_queryable() {
        let (_dir, q, txn_mgr) = harness(64, 8);
        let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();
        let mut recnos = Vec::new();
        for i in 0..10u32 {
            let rec = format!("rec{:05}", i);
            recnos.push(q.append(&txn, rec.as_bytes()).unwrap());
        }
        for (i, recno) in recnos.into_iter().enumerate() {
            let expect = format!("rec{:05}", i);
            assert_eq!(q.get(&txn, recno).unwrap(), Some(expect.into_bytes()));
        }
        txn.commit().unwrap();
    }
}
