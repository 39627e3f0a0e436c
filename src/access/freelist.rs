//! Per-file free-page list: `new_page`/`free_page`.
//!
//! An ALLOC record carries the free list's *old* head so undo can relink
//! it exactly, and a FREE record carries the freed page's full pre-free
//! image so the fact "this page becomes INVALID and is linked at the
//! list head" is redo-able on its own rather than folded into a generic
//! before/after update.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::DbResult;
use crate::ids::{Fid, Pgno};
use crate::lock::{GetFlags as LockGetFlags, LockMode, LockObjectId};
use crate::log::RecordBody;
use crate::mpool::{Buffer, BufferPool, FilePool, GetFlags as MpoolGetFlags, PutFlags as MpoolPutFlags};
use crate::txn::Transaction;

use super::meta::MetaPage;
use super::page::{PageHeader, PageType};

fn lock_meta(txn: &Transaction, fid: Fid) -> DbResult<()> {
    // Every free/alloc operation holds a write lock on page 0 for its
    // duration.
    txn.lock_get(LockObjectId::page(fid, 0), LockMode::Write, LockGetFlags::default())
}

fn read_meta(meta_buf: &Arc<RwLock<Buffer>>) -> DbResult<MetaPage> {
    MetaPage::decode(&meta_buf.read().bytes)
}

fn write_meta(meta_buf: &Arc<RwLock<Buffer>>, meta: &MetaPage, lsn: crate::ids::Lsn) {
    let mut guard = meta_buf.write();
    let page_size = guard.bytes.len();
    guard.bytes = meta.encode(page_size);
    guard.mark_dirty(lsn);
}

/// Allocate a page: unlink the free list's head if one exists (ALLOC
/// record carrying the old head), else extend the file by one page
/// (ALLOC record with the EXTEND shape). Returns the pinned,
/// zeroed-or-reused buffer with `page_type` already set in its header.
pub fn new_page(
    txn: &Transaction,
    mpool: &BufferPool,
    file: &FilePool,
    fid: Fid,
    page_type: PageType,
) -> DbResult<Arc<RwLock<Buffer>>> {
    lock_meta(txn, fid)?;
    let meta_buf = mpool.get(fid, 0, MpoolGetFlags::default())?;
    let mut meta = read_meta(&meta_buf)?;
    let old_free_head = meta.free_list_head;
    let extended = old_free_head == 0;
    let pre_extend_last_pgno = file.last_pgno();

    let page_buf = if !extended {
        let free_buf = mpool.get(fid, old_free_head, MpoolGetFlags::default())?;
        let next_pgno = PageHeader::decode(&free_buf.read().bytes)?.next_pgno;
        meta.free_list_head = next_pgno;
        free_buf
    } else {
        mpool.get(fid, 0, MpoolGetFlags { new: true, ..Default::default() })?
    };
    let pgno = page_buf.read().pgno;
    if pgno > meta.last_pgno {
        meta.last_pgno = pgno;
    }

    let lsn = txn.log_update(RecordBody::Alloc {
        fid,
        pgno,
        old_free_head,
        extended,
        pre_extend_last_pgno,
    })?;

    {
        let mut guard = page_buf.write();
        let mut bytes = vec![0u8; guard.bytes.len()];
        PageHeader::new(pgno, page_type).write_into(&mut bytes);
        guard.bytes = bytes;
        guard.mark_dirty(lsn);
    }
    write_meta(&meta_buf, &meta, lsn);

    mpool.put(&meta_buf, MpoolPutFlags { dirty: true, ..Default::default() })?;
    Ok(page_buf)
}

/// Return a page to the free list: log a FREE record carrying the old
/// page contents for undo, clear the page to INVALID
/// with `next_pgno` pointing at the prior head, link it at the list
/// head, mark meta dirty.
pub fn free_page(txn: &Transaction, mpool: &BufferPool, fid: Fid, pgno: Pgno) -> DbResult<()> {
    lock_meta(txn, fid)?;
    let meta_buf = mpool.get(fid, 0, MpoolGetFlags::default())?;
    let mut meta = read_meta(&meta_buf)?;
    let old_free_head = meta.free_list_head;

    let page_buf = mpool.get(fid, pgno, MpoolGetFlags::default())?;
    let old_image = page_buf.read().bytes.clone();

    meta.free_list_head = pgno;
    let lsn = txn.log_update(RecordBody::Free {
        fid,
        pgno,
        old_free_head,
        old_image,
    })?;

    {
        let mut guard = page_buf.write();
        let mut bytes = vec![0u8; guard.bytes.len()];
        PageHeader::invalid(pgno, old_free_head).write_into(&mut bytes);
        guard.bytes = bytes;
        guard.mark_dirty(lsn);
    }
    write_meta(&meta_buf, &meta, lsn);

    mpool.put(&page_buf, MpoolPutFlags { dirty: true, ..Default::default() })?;
    mpool.put(&meta_buf, MpoolPutFlags { dirty: true, ..Default::default() })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::ids::Fid;
    use crate::lock::LockManager;
    use crate::log::LogManager;
    use crate::txn::{TxnConfig, TxnManager};
    use std::sync::Arc;

    fn harness() -> (tempfile::TempDir, Arc<BufferPool>, Arc<FilePool>, Fid, Arc<TxnManager>) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EnvConfig::default();
        let mpool = Arc::new(BufferPool::new(&cfg));
        let path = dir.path().join("t.db");
        let file = Arc::new(FilePool::new(&path, cfg.page_size).unwrap());
        let fid = Fid::generate();
        mpool.open_file(fid, file.clone());

        let log = Arc::new(LogManager::open(dir.path(), &cfg).unwrap());
        let lock = Arc::new(LockManager::new(&cfg));
        let txn_mgr = Arc::new(TxnManager::new(log, lock));
        txn_mgr.attach_mpool(mpool.clone());
        (dir, mpool, file, fid, txn_mgr)
    }

    #[test]
    fn new_page_extends_then_free_list_reuses() {
        let (_dir, mpool, file, fid, txn_mgr) = harness();
        let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();

        let p1 = new_page(&txn, &mpool, &file, fid, PageType::BtreeLeaf).unwrap();
        let pgno1 = p1.read().pgno;
        mpool.put(&p1, MpoolPutFlags::default()).unwrap();
        assert_eq!(pgno1, 1, "new page at the high-water extends by one");

        free_page(&txn, &mpool, fid, pgno1).unwrap();

        let p2 = new_page(&txn, &mpool, &file, fid, PageType::BtreeLeaf).unwrap();
        let pgno2 = p2.read().pgno;
        assert_eq!(pgno2, pgno1, "free-page + new-page reuses the freed page");
        txn.commit().unwrap();
    }
}
