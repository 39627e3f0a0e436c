//! Database handle: one access method composed over the buffer pool,
//! lock manager, and transaction manager via a cursor abstraction.
//!
//! Owns a file handle and a closed variant over the three access
//! methods (B-tree, Hash, Queue), dispatched by the meta page's
//! `DbType` tag.

use std::sync::Arc;

use crate::access::btree::BTree;
use crate::access::hash::Hash;
use crate::access::meta::{DbType, MetaFlags, MetaPage};
use crate::access::queue::Queue;
use crate::env::Environment;
use crate::error::{DbError, DbResult};
use crate::ids::Fid;
use crate::mpool::{FilePool, GetFlags as MpoolGetFlags, PutFlags as MpoolPutFlags};
use crate::txn::Transaction;

/// Options accepted by [`Database::open`], generalizing the meta page's
/// feature-flag set into a construction-time configuration struct.
#[derive(Debug, Clone, Default)]
pub struct DbConfig {
    pub db_type: DbTypeConfig,
    pub duplicates: bool,
    /// Bucket count for `Hash`; ignored otherwise.
    pub nbuckets: u32,
    /// Fixed record length for `Queue`; ignored otherwise.
    pub record_len: usize,
}

/// Which access method to open the file with, mirroring `DbType` but
/// owned by the caller-facing config rather than the on-disk tag type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbTypeConfig {
    Btree,
    Hash,
    Queue,
    Recno,
}

impl Default for DbTypeConfig {
    fn default() -> Self {
        DbTypeConfig::Btree
    }
}

/// The closed variant set of access methods: a tagged union of
/// per-access-method state with shared operations dispatched on the
/// tag.
enum AccessHandle {
    Btree(BTree),
    Hash(Hash),
    Queue(Queue),
}

/// A single open database file, composing one access method over the
/// environment's buffer pool, lock manager, and transaction manager.
pub struct Database {
    env: Arc<Environment>,
    fid: Fid,
    file: Arc<FilePool>,
    access: AccessHandle,
}

impl Database {
    /// Create (if `CREATE`/missing) or open an existing database file
    /// under the environment's data directory.
    pub fn open(env: Arc<Environment>, name: &str, config: DbConfig, create: bool) -> DbResult<Self> {
        env.check_panic()?;
        let mpool = env.mpool()?.clone();
        let page_size = env.config().page_size;
        let dir = env
            .config()
            .data_dir
            .clone()
            .unwrap_or_else(|| env.home().to_path_buf());
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        if !create && !path.exists() {
            return Err(DbError::NoEnt(path.display().to_string()));
        }
        let is_new = !path.exists() || std::fs::metadata(&path)?.len() == 0;
        let file = Arc::new(FilePool::new(&path, page_size)?);

        let fid = if is_new {
            Fid::generate()
        } else {
            let buf = mpool_peek_fid(&file, page_size)?;
            buf.unwrap_or_else(Fid::generate)
        };
        mpool.open_file(fid, file.clone());

        if let Some(txn_mgr) = env.txn_mgr.as_ref() {
            txn_mgr.register_file(fid, file.clone(), name)?;
        }

        let (db_type, meta_flags) = match config.db_type {
            DbTypeConfig::Btree => (DbType::Btree, MetaFlags { duplicates: config.duplicates, ..Default::default() }),
            DbTypeConfig::Recno => (
                DbType::Recno,
                MetaFlags { record_numbering: true, ..Default::default() },
            ),
            DbTypeConfig::Hash => (DbType::Hash, MetaFlags::default()),
            DbTypeConfig::Queue => (
                DbType::Queue,
                MetaFlags { fixed_length: true, ..Default::default() },
            ),
        };

        let access = if is_new {
            Self::init_fresh(&env, &mpool, &file, fid, page_size, db_type, meta_flags, &config)?
        } else {
            Self::open_existing(&mpool, &file, fid, page_size, &config)?
        };

        Ok(Self { env, fid, file, access })
    }

    fn init_fresh(
        env: &Arc<Environment>,
        mpool: &Arc<crate::mpool::BufferPool>,
        file: &Arc<FilePool>,
        fid: Fid,
        page_size: usize,
        db_type: DbType,
        meta_flags: MetaFlags,
        config: &DbConfig,
    ) -> DbResult<AccessHandle> {
        let txn_mgr = env.txn_mgr()?.clone();
        let txn = txn_mgr.begin(None, Default::default())?;
        let mut meta = MetaPage::new(page_size as u32, db_type, meta_flags, fid);

        let access = match config.db_type {
            DbTypeConfig::Btree | DbTypeConfig::Recno => {
                let recno = config.db_type == DbTypeConfig::Recno;
                let bt = BTree::new(fid, mpool.clone(), file.clone(), page_size, config.duplicates, recno);
                bt.init(&txn, &mut meta)?;
                AccessHandle::Btree(bt)
            }
            DbTypeConfig::Hash => {
                let h = Hash::new(fid, mpool.clone(), file.clone(), page_size, config.nbuckets.max(1));
                h.init(&txn, &mut meta)?;
                AccessHandle::Hash(h)
            }
            DbTypeConfig::Queue => {
                let q = Queue::new(fid, mpool.clone(), file.clone(), page_size, config.record_len.max(1));
                q.init(&txn, &mut meta)?;
                AccessHandle::Queue(q)
            }
        };

        let meta_buf = mpool.get(fid, 0, MpoolGetFlags { create: true, ..Default::default() })?;
        meta_buf.write().bytes = meta.encode(page_size);
        mpool.put(&meta_buf, MpoolPutFlags { dirty: true, ..Default::default() })?;
        txn.commit()?;
        Ok(access)
    }

    fn open_existing(
        mpool: &Arc<crate::mpool::BufferPool>,
        file: &Arc<FilePool>,
        fid: Fid,
        page_size: usize,
        config: &DbConfig,
    ) -> DbResult<AccessHandle> {
        let meta_buf = mpool.get(fid, 0, MpoolGetFlags::default())?;
        let meta = MetaPage::decode(&meta_buf.read().bytes)?;
        mpool.put(&meta_buf, MpoolPutFlags::default())?;
        Ok(match meta.db_type {
            DbType::Btree | DbType::Recno => AccessHandle::Btree(BTree::new(
                fid,
                mpool.clone(),
                file.clone(),
                page_size,
                meta.meta_flags.duplicates,
                meta.db_type == DbType::Recno,
            )),
            DbType::Hash => AccessHandle::Hash(Hash::new(fid, mpool.clone(), file.clone(), page_size, meta.nparts.max(1))),
            DbType::Queue => AccessHandle::Queue(Queue::new(
                fid,
                mpool.clone(),
                file.clone(),
                page_size,
                config.record_len.max(1),
            )),
        })
    }

    pub fn fid(&self) -> Fid {
        self.fid
    }

    pub fn file(&self) -> &Arc<FilePool> {
        &self.file
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Begin a cursor over this database.
    pub fn cursor<'d>(&'d self, txn: &'d Transaction) -> crate::cursor::Cursor<'d> {
        crate::cursor::Cursor::new(self, txn)
    }

    pub fn get(&self, txn: &Transaction, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        match &self.access {
            AccessHandle::Btree(bt) => bt.get(txn, key),
            AccessHandle::Hash(h) => h.get(txn, key),
            AccessHandle::Queue(q) => {
                let recno = decode_recno(key)?;
                q.get(txn, recno)
            }
        }
    }

    pub fn put(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> DbResult<()> {
        match &self.access {
            AccessHandle::Btree(bt) => bt.put(txn, key, value),
            AccessHandle::Hash(h) => h.put(txn, key, value),
            AccessHandle::Queue(q) => {
                // Queue ignores the supplied key; records are addressed
                // by assigned, not caller-chosen, number.
                q.append(txn, value).map(|_| ())
            }
        }
    }

    pub fn del(&self, txn: &Transaction, key: &[u8]) -> DbResult<bool> {
        match &self.access {
            AccessHandle::Btree(bt) => bt.del(txn, key),
            AccessHandle::Hash(h) => h.del(txn, key),
            AccessHandle::Queue(q) => {
                let recno = decode_recno(key)?;
                q.del(txn, recno)
            }
        }
    }

    pub(crate) fn as_btree(&self) -> Option<&BTree> {
        match &self.access {
            AccessHandle::Btree(bt) => Some(bt),
            _ => None,
        }
    }

    pub(crate) fn as_hash(&self) -> Option<&Hash> {
        match &self.access {
            AccessHandle::Hash(h) => Some(h),
            _ => None,
        }
    }

    pub(crate) fn as_queue(&self) -> Option<&Queue> {
        match &self.access {
            AccessHandle::Queue(q) => Some(q),
            _ => None,
        }
    }
}

fn decode_recno(key: &[u8]) -> DbResult<u32> {
    key.try_into()
        .map(u32::from_be_bytes)
        .map_err(|_| DbError::Inval("queue record number must be a 4-byte big-endian key".into()))
}

fn mpool_peek_fid(file: &FilePool, page_size: usize) -> DbResult<Option<Fid>> {
    match file.read_page(0, page_size) {
        Ok(bytes) => match MetaPage::decode(&bytes) {
            Ok(meta) => Ok(Some(meta.uid)),
            Err(_) => Ok(None),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::env::OpenFlags;

    #[test]
    fn open_create_then_reopen_preserves_fid_and_data() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::open(dir.path(), OpenFlags::full(), EnvConfig::default()).unwrap();
        let db = Database::open(env.clone(), "t.db", DbConfig::default(), true).unwrap();
        let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
        db.put(&txn, b"k", b"v").unwrap();
        txn.commit().unwrap();
        assert_ne!(db.fid(), Fid::zero());
    }

    #[test]
    fn queue_put_ignores_caller_key_and_assigns_recno() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::open(dir.path(), OpenFlags::full(), EnvConfig::default()).unwrap();
        let cfg = DbConfig { db_type: DbTypeConfig::Queue, record_len: 4, ..Default::default() };
        let db = Database::open(env.clone(), "q.db", cfg, true).unwrap();
        let txn = env.txn_mgr().unwrap().begin(None, Default::default()).unwrap();
        db.put(&txn, b"ignored", b"abcd").unwrap();
        let first = 1u32.to_be_bytes();
        assert_eq!(db.get(&txn, &first).unwrap(), Some(b"abcd".to_vec()));
        txn.commit().unwrap();
    }
}
