//! Nested transactions and checkpoint/reclaim, exercised both through
//! the `Database` handle and (for reclaim, which has no public wrapper)
//! directly against `BTree`.

use std::sync::Arc;

use kvcore::access::btree::BTree;
use kvcore::access::meta::{DbType, MetaPage};
use kvcore::config::EnvConfig;
use kvcore::db::DbConfig;
use kvcore::env::OpenFlags;
use kvcore::ids::Fid;
use kvcore::mpool::{BufferPool, FilePool, GetFlags as MGet, PutFlags as MPut};
use kvcore::txn::TxnConfig;
use kvcore::{Database, Environment};

#[test]
fn nested_child_commit_is_visible_before_parent_commits() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::open(dir.path(), OpenFlags::full(), EnvConfig::default()).unwrap();
    let db = Database::open(env.clone(), "t.db", DbConfig::default(), true).unwrap();
    let txn_mgr = env.txn_mgr().unwrap().clone();

    let parent = txn_mgr.begin(None, TxnConfig::default()).unwrap();
    let child = txn_mgr.begin(Some(parent.id()), TxnConfig::default()).unwrap();
    db.put(&child, b"from-child", b"v").unwrap();
    child.commit().unwrap();

    assert_eq!(db.get(&parent, b"from-child").unwrap(), Some(b"v".to_vec()));
    parent.commit().unwrap();
}

#[test]
fn aborted_child_leaves_no_trace_after_parent_commits() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::open(dir.path(), OpenFlags::full(), EnvConfig::default()).unwrap();
    let db = Database::open(env.clone(), "t.db", DbConfig::default(), true).unwrap();
    let txn_mgr = env.txn_mgr().unwrap().clone();

    let parent = txn_mgr.begin(None, TxnConfig::default()).unwrap();
    let child = txn_mgr.begin(Some(parent.id()), TxnConfig::default()).unwrap();
    db.put(&child, b"rolled-back", b"v").unwrap();
    child.abort().unwrap();

    assert_eq!(db.get(&parent, b"rolled-back").unwrap(), None);
    parent.commit().unwrap();
}

#[test]
fn checkpoint_lsn_advances_past_the_last_commit() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::open(dir.path(), OpenFlags::full(), EnvConfig::default()).unwrap();
    let db = Database::open(env.clone(), "t.db", DbConfig::default(), true).unwrap();
    let txn_mgr = env.txn_mgr().unwrap().clone();

    let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();
    db.put(&txn, b"k", b"v").unwrap();
    txn.commit().unwrap();

    let first = txn_mgr.checkpoint().unwrap();
    let second = txn_mgr.checkpoint().unwrap();
    assert!(second >= first);
}

fn btree_harness(page_size: usize) -> (tempfile::TempDir, BTree, Arc<kvcore::txn::TxnManager>) {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = EnvConfig::default();
    cfg.page_size = page_size;
    let mpool = Arc::new(BufferPool::new(&cfg));
    let path = dir.path().join("t.db");
    let file = Arc::new(FilePool::new(&path, page_size).unwrap());
    let fid = Fid::generate();
    mpool.open_file(fid, file.clone());

    let log = Arc::new(kvcore::log::LogManager::open(dir.path(), &cfg).unwrap());
    let lock = Arc::new(kvcore::lock::LockManager::new(&cfg));
    let txn_mgr = Arc::new(kvcore::txn::TxnManager::new(log, lock));
    txn_mgr.attach_mpool(mpool.clone());

    let bt = BTree::new(fid, mpool.clone(), file, page_size, false, false);
    let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();
    let meta_buf = mpool.get(fid, 0, MGet { create: true, ..Default::default() }).unwrap();
    let mut meta = MetaPage::new(page_size as u32, DbType::Btree, Default::default(), fid);
    bt.init(&txn, &mut meta).unwrap();
    meta_buf.write().bytes = meta.encode(page_size);
    mpool.put(&meta_buf, MPut { dirty: true, ..Default::default() }).unwrap();
    txn.commit().unwrap();

    (dir, bt, txn_mgr)
}

#[test]
fn reclaim_after_bulk_delete_frees_every_page_including_the_meta_page() {
    let (_dir, bt, txn_mgr) = btree_harness(256);
    let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();
    for i in 0..200u32 {
        bt.put(&txn, format!("k{:05}", i).as_bytes(), b"v").unwrap();
    }
    for i in 0..200u32 {
        assert!(bt.del(&txn, format!("k{:05}", i).as_bytes()).unwrap());
    }
    // reclaim deletes the database outright (it frees the meta page
    // itself), unlike truncate which leaves it ready for reuse, so there
    // is nothing left to put/get against afterward.
    let freed = bt.reclaim(&txn).unwrap();
    assert!(freed > 1, "bulk delete over many pages plus the meta page should free more than one page");
    txn.commit().unwrap();
}

#[test]
fn put_after_truncate_lazily_recreates_the_root() {
    let (_dir, bt, txn_mgr) = btree_harness(4096);
    let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();
    for i in 0..20u32 {
        bt.put(&txn, format!("k{:02}", i).as_bytes(), b"v").unwrap();
    }
    bt.truncate(&txn).unwrap();
    assert_eq!(bt.get(&txn, b"k00").unwrap(), None);

    bt.put(&txn, b"fresh", b"value").unwrap();
    assert_eq!(bt.get(&txn, b"fresh").unwrap(), Some(b"value".to_vec()));
    assert_eq!(bt.first(&txn).unwrap(), Some((b"fresh".to_vec(), b"value".to_vec())));
    txn.commit().unwrap();
}

#[test]
fn truncate_removes_every_entry() {
    let (_dir, bt, txn_mgr) = btree_harness(4096);
    let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();
    for i in 0..20u32 {
        bt.put(&txn, format!("k{:02}", i).as_bytes(), b"v").unwrap();
    }
    // truncate returns the number of pages freed (just the single root
    // leaf here, since 20 small entries fit on one page), not the
    // entry count.
    let freed_pages = bt.truncate(&txn).unwrap();
    assert_eq!(freed_pages, 1);
    assert_eq!(bt.first(&txn).unwrap(), None);
    txn.commit().unwrap();
}
