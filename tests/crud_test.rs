//! Single-thread CRUD across all three access methods, driven entirely
//! through the public `Environment`/`Database`/`Transaction` surface.

use kvcore::config::EnvConfig;
use kvcore::db::{DbConfig, DbTypeConfig};
use kvcore::env::OpenFlags;
use kvcore::{Database, Environment};

fn open_env() -> (tempfile::TempDir, std::sync::Arc<Environment>) {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::open(dir.path(), OpenFlags::full(), EnvConfig::default()).unwrap();
    (dir, env)
}

#[test]
fn btree_put_get_update_delete() {
    let (_dir, env) = open_env();
    let db = Database::open(env.clone(), "t.db", DbConfig::default(), true).unwrap();

    let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
    db.put(&txn, b"alice", b"1").unwrap();
    db.put(&txn, b"bob", b"2").unwrap();
    assert_eq!(db.get(&txn, b"alice").unwrap(), Some(b"1".to_vec()));

    db.put(&txn, b"alice", b"11").unwrap();
    assert_eq!(db.get(&txn, b"alice").unwrap(), Some(b"11".to_vec()));

    assert!(db.del(&txn, b"bob").unwrap());
    assert_eq!(db.get(&txn, b"bob").unwrap(), None);
    assert!(!db.del(&txn, b"bob").unwrap());
    txn.commit().unwrap();
}

#[test]
fn hash_put_get_delete() {
    let (_dir, env) = open_env();
    let cfg = DbConfig { db_type: DbTypeConfig::Hash, nbuckets: 8, ..Default::default() };
    let db = Database::open(env.clone(), "h.db", cfg, true).unwrap();

    let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
    for i in 0..20u32 {
        db.put(&txn, format!("key{}", i).as_bytes(), format!("val{}", i).as_bytes())
            .unwrap();
    }
    for i in 0..20u32 {
        let got = db.get(&txn, format!("key{}", i).as_bytes()).unwrap();
        assert_eq!(got, Some(format!("val{}", i).into_bytes()));
    }
    assert!(db.del(&txn, b"key5").unwrap());
    assert_eq!(db.get(&txn, b"key5").unwrap(), None);
    txn.commit().unwrap();
}

#[test]
fn queue_append_get_delete_by_recno() {
    let (_dir, env) = open_env();
    let cfg = DbConfig { db_type: DbTypeConfig::Queue, record_len: 8, ..Default::default() };
    let db = Database::open(env.clone(), "q.db", cfg, true).unwrap();

    let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
    for i in 0..5u32 {
        db.put(&txn, b"", format!("rec{:04}", i).as_bytes()).unwrap();
    }
    let third = 3u32.to_be_bytes();
    assert_eq!(db.get(&txn, &third).unwrap(), Some(b"rec0002".to_vec()));
    assert!(db.del(&txn, &third).unwrap());
    assert_eq!(db.get(&txn, &third).unwrap(), None);
    txn.commit().unwrap();
}

#[test]
fn reopen_existing_database_preserves_committed_data() {
    let dir = tempfile::tempdir().unwrap();
    let fid = {
        let env = Environment::open(dir.path(), OpenFlags::full(), EnvConfig::default()).unwrap();
        let db = Database::open(env.clone(), "t.db", DbConfig::default(), true).unwrap();
        let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
        db.put(&txn, b"k", b"v").unwrap();
        txn.commit().unwrap();
        env.txn_mgr().unwrap().checkpoint().unwrap();
        db.fid()
    };

    let env = Environment::open(dir.path(), OpenFlags::full(), EnvConfig::default()).unwrap();
    let db = Database::open(env.clone(), "t.db", DbConfig::default(), false).unwrap();
    assert_eq!(db.fid(), fid);
    let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
    assert_eq!(db.get(&txn, b"k").unwrap(), Some(b"v".to_vec()));
    txn.commit().unwrap();
}

#[test]
fn opening_missing_database_without_create_fails() {
    let (_dir, env) = open_env();
    let res = Database::open(env.clone(), "missing.db", DbConfig::default(), false);
    assert!(matches!(res, Err(kvcore::DbError::NoEnt(_))));
}
