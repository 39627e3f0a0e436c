//! Crash recovery: a transaction's writes must vanish if it never
//! committed, and must survive if it did, across a fresh `Environment`
//! pointed at the same home directory (standing in for a process
//! restart after a crash).

use kvcore::config::EnvConfig;
use kvcore::db::DbConfig;
use kvcore::env::OpenFlags;
use kvcore::{Database, Environment};

#[test]
fn uncommitted_write_is_undone_on_recovery() {
    let dir = tempfile::tempdir().unwrap();

    {
        let env = Environment::open(dir.path(), OpenFlags::full(), EnvConfig::default()).unwrap();
        let db = Database::open(env.clone(), "t.db", DbConfig::default(), true).unwrap();
        let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
        db.put(&txn, b"durable", b"yes").unwrap();
        txn.commit().unwrap();

        let txn2 = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
        db.put(&txn2, b"crashed", b"no").unwrap();
        // No commit: the transaction's locker id and in-flight state are
        // simply dropped here, standing in for the process dying before
        // COMMIT is logged.
        drop(txn2);
        // No checkpoint either: the dirty "crashed" page never reaches
        // the data file except through recovery's own redo-then-sync.
    }

    let recover_flags = OpenFlags { recover: true, ..OpenFlags::full() };
    let env = Environment::open(dir.path(), recover_flags, EnvConfig::default()).unwrap();
    let db = Database::open(env.clone(), "t.db", DbConfig::default(), false).unwrap();
    let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
    assert_eq!(db.get(&txn, b"durable").unwrap(), Some(b"yes".to_vec()));
    assert_eq!(db.get(&txn, b"crashed").unwrap(), None);
    txn.commit().unwrap();
}

#[test]
fn committed_write_survives_recovery_without_a_prior_checkpoint() {
    let dir = tempfile::tempdir().unwrap();

    {
        let env = Environment::open(dir.path(), OpenFlags::full(), EnvConfig::default()).unwrap();
        let db = Database::open(env.clone(), "t.db", DbConfig::default(), true).unwrap();
        let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
        db.put(&txn, b"k1", b"v1").unwrap();
        db.put(&txn, b"k2", b"v2").unwrap();
        txn.commit().unwrap();
        // Deliberately no checkpoint: redo must reconstruct "k1"/"k2"
        // from the log alone.
    }

    let recover_flags = OpenFlags { recover: true, ..OpenFlags::full() };
    let env = Environment::open(dir.path(), recover_flags, EnvConfig::default()).unwrap();
    let db = Database::open(env.clone(), "t.db", DbConfig::default(), false).unwrap();
    let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
    assert_eq!(db.get(&txn, b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(db.get(&txn, b"k2").unwrap(), Some(b"v2".to_vec()));
    txn.commit().unwrap();
}

#[test]
fn recovery_is_idempotent_across_repeated_restarts() {
    let dir = tempfile::tempdir().unwrap();
    {
        let env = Environment::open(dir.path(), OpenFlags::full(), EnvConfig::default()).unwrap();
        let db = Database::open(env.clone(), "t.db", DbConfig::default(), true).unwrap();
        let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
        db.put(&txn, b"k", b"v").unwrap();
        txn.commit().unwrap();
    }

    let recover_flags = OpenFlags { recover: true, ..OpenFlags::full() };
    for _ in 0..2 {
        let env = Environment::open(dir.path(), recover_flags, EnvConfig::default()).unwrap();
        let db = Database::open(env.clone(), "t.db", DbConfig::default(), false).unwrap();
        let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
        assert_eq!(db.get(&txn, b"k").unwrap(), Some(b"v".to_vec()));
        txn.commit().unwrap();
    }
}
