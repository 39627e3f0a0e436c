//! Environment and region allocator: the process-wide handle that owns
//! one buffer pool, one lock manager, one log manager, and one
//! transaction manager behind `Arc`s, and the sticky panic flag shared
//! across all of them. `Environment::open` returns an owned value
//! threaded explicitly through every subsequent call rather than a
//! global singleton, so tests can open and tear down as many independent
//! environments as they like.

pub mod mutex;
pub mod region;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::EnvConfig;
use crate::error::{DbError, DbResult};
use crate::log::LogManager;
use crate::lock::LockManager;
use crate::mpool::BufferPool;
use crate::txn::TxnManager;

/// Flags accepted by `Environment::open`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub create: bool,
    pub private: bool,
    pub thread: bool,
    pub system_mem: bool,
    pub init_mpool: bool,
    pub init_lock: bool,
    pub init_log: bool,
    pub init_txn: bool,
    pub init_cdb: bool,
    pub recover: bool,
    pub recover_fatal: bool,
    pub register: bool,
    pub lockdown: bool,
    pub use_environ: bool,
}

impl OpenFlags {
    /// The common "full stack" combination: buffer pool, lock manager,
    /// log manager and transactions all initialized.
    pub fn full() -> Self {
        Self {
            create: true,
            init_mpool: true,
            init_lock: true,
            init_log: true,
            init_txn: true,
            ..Default::default()
        }
    }

    /// Concurrency Data Store mode: lock manager only, no log/txn.
    pub fn cds() -> Self {
        Self {
            create: true,
            init_mpool: true,
            init_lock: true,
            init_cdb: true,
            ..Default::default()
        }
    }
}

/// Process-wide shared state: configuration, sub-region handles, and the
/// sticky panic flag.
pub struct Environment {
    home: PathBuf,
    config: EnvConfig,
    panicked: AtomicBool,
    mutexes: mutex::MutexService,
    refcount: std::sync::atomic::AtomicU32,

    pub mpool: Option<Arc<BufferPool>>,
    pub lock_mgr: Option<Arc<LockManager>>,
    pub log_mgr: Option<Arc<LogManager>>,
    pub txn_mgr: Option<Arc<TxnManager>>,
}

impl Environment {
    /// Create or join a shared environment at `home`. Each `INIT_*` bit
    /// in `flags` selects whether that subsystem is brought up.
    pub fn open(home: impl AsRef<Path>, flags: OpenFlags, config: EnvConfig) -> DbResult<Arc<Self>> {
        config.validate()?;
        let home = home.as_ref().to_path_buf();
        if flags.create {
            std::fs::create_dir_all(&home)?;
        } else if !home.exists() {
            return Err(DbError::NoEnt(home.display().to_string()));
        }

        let mutexes = mutex::MutexService::new();

        let mpool = flags
            .init_mpool
            .then(|| Arc::new(BufferPool::new(&config)));

        let lock_mgr = flags
            .init_lock
            .then(|| Arc::new(LockManager::new(&config)));

        let log_mgr = if flags.init_log {
            Some(Arc::new(LogManager::open(&home, &config)?))
        } else {
            None
        };

        let txn_mgr = if flags.init_txn {
            let lm = log_mgr
                .clone()
                .ok_or_else(|| DbError::Inval("INIT_TXN requires INIT_LOG".into()))?;
            let lk = lock_mgr
                .clone()
                .ok_or_else(|| DbError::Inval("INIT_TXN requires INIT_LOCK".into()))?;
            let txn_mgr = Arc::new(TxnManager::new(lm, lk));
            if let Some(mp) = &mpool {
                txn_mgr.attach_mpool(mp.clone());
            }
            Some(txn_mgr)
        } else {
            None
        };

        let env = Arc::new(Self {
            home,
            config,
            panicked: AtomicBool::new(false),
            mutexes,
            refcount: std::sync::atomic::AtomicU32::new(1),
            mpool,
            lock_mgr,
            log_mgr,
            txn_mgr,
        });

        if flags.recover || flags.recover_fatal {
            if let (Some(txn_mgr), Some(mpool)) = (&env.txn_mgr, &env.mpool) {
                let base_dir = env.config.data_dir.clone().unwrap_or_else(|| env.home.clone());
                txn_mgr.recover(mpool, &base_dir)?;
            } else {
                return Err(DbError::Inval("RECOVER requires INIT_TXN and INIT_MPOOL".into()));
            }
        }

        Ok(env)
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn mutexes(&self) -> &mutex::MutexService {
        &self.mutexes
    }

    /// Every entry point should call this first; once panicked, every
    /// operation fails with `DbError::Panic` until the environment is
    /// re-created.
    pub fn check_panic(&self) -> DbResult<()> {
        if self.panicked.load(Ordering::SeqCst) {
            Err(DbError::Panic)
        } else {
            Ok(())
        }
    }

    /// Set the sticky panic flag. Any unrecoverable internal
    /// inconsistency should call this before returning its error.
    pub fn panic(&self) {
        self.panicked.store(true, Ordering::SeqCst);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::SeqCst)
    }

    pub fn add_ref(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn remove_ref(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn lock_mgr(&self) -> DbResult<&Arc<LockManager>> {
        self.check_panic()?;
        self.lock_mgr
            .as_ref()
            .ok_or_else(|| DbError::Inval("lock manager not initialized".into()))
    }

    pub fn log_mgr(&self) -> DbResult<&Arc<LogManager>> {
        self.check_panic()?;
        self.log_mgr
            .as_ref()
            .ok_or_else(|| DbError::Inval("log manager not initialized".into()))
    }

    pub fn txn_mgr(&self) -> DbResult<&Arc<TxnManager>> {
        self.check_panic()?;
        self.txn_mgr
            .as_ref()
            .ok_or_else(|| DbError::Inval("transaction manager not initialized".into()))
    }

    pub fn mpool(&self) -> DbResult<&Arc<BufferPool>> {
        self.check_panic()?;
        self.mpool
            .as_ref()
            .ok_or_else(|| DbError::Inval("buffer pool not initialized".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_requires_existing_home_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let flags = OpenFlags {
            create: false,
            ..OpenFlags::full()
        };
        let res = Environment::open(&missing, flags, EnvConfig::default());
        assert!(matches!(res, Err(DbError::NoEnt(_))));
    }

    #[test]
    fn panic_is_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::open(dir.path(), OpenFlags::full(), EnvConfig::default()).unwrap();
        assert!(env.check_panic().is_ok());
        env.panic();
        assert!(matches!(env.check_panic(), Err(DbError::Panic)));
        assert!(env.is_panicked());
    }
}
