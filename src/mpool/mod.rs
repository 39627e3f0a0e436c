//! Buffer Pool (Mpool): a single byte-oriented page cache keyed by
//! `(Fid, Pgno)`, shared across every access method, with pinning,
//! dirty tracking, and WAL-ordered eviction and flush.

mod buffer;
mod file;

pub use buffer::Buffer;
pub use file::FilePool;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::EnvConfig;
use crate::error::{DbError, DbResult};
use crate::ids::{Fid, Lsn, Pgno};

/// Flags accepted by `BufferPool::get`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetFlags {
    pub create: bool,
    pub new: bool,
    pub last: bool,
    pub dirty: bool,
}

/// Flags accepted by `BufferPool::put`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PutFlags {
    pub dirty: bool,
    pub discard: bool,
}

/// Per-file transformations installed with `BufferPool::register`
/// (checksum, decryption on read, its reverse on write). The pool only
/// fixes where these run, not what they do, so this is a plain
/// function-pointer pair.
#[derive(Clone)]
pub struct PageTransforms {
    pub pgin: Arc<dyn Fn(&mut [u8]) + Send + Sync>,
    pub pgout: Arc<dyn Fn(&mut [u8]) + Send + Sync>,
}

struct Bucket {
    entries: HashMap<(Fid, Pgno), Arc<RwLock<Buffer>>>,
}

/// A fixed-size cache of pages keyed by `(fid, pgno)`.
pub struct BufferPool {
    page_size: usize,
    cache_size_bytes: usize,
    // Sharded bucket table: per-bucket mutex guards chain structure so
    // concurrent gets on different pages don't serialize on one lock.
    buckets: Vec<Mutex<Bucket>>,
    files: RwLock<HashMap<Fid, Arc<FilePool>>>,
    transforms: RwLock<HashMap<Fid, PageTransforms>>,
    clock: AtomicU64,
    trickle_n: usize,
}

const NUM_BUCKETS: usize = 64;

impl BufferPool {
    pub fn new(config: &EnvConfig) -> Self {
        let buckets = (0..NUM_BUCKETS)
            .map(|_| {
                Mutex::new(Bucket {
                    entries: HashMap::new(),
                })
            })
            .collect();
        Self {
            page_size: config.page_size,
            cache_size_bytes: config.cache_size,
            buckets,
            files: RwLock::new(HashMap::new()),
            transforms: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            trickle_n: 8,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn bucket_index(&self, key: &(Fid, Pgno)) -> usize {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.buckets.len()
    }

    /// Register a file so the pool can service `get`/`sync` for it.
    pub fn open_file(&self, fid: Fid, pool: Arc<FilePool>) {
        self.files.write().insert(fid, pool);
    }

    /// Install optional per-file transformations.
    pub fn register(&self, fid: Fid, transforms: PageTransforms) {
        self.transforms.write().insert(fid, transforms);
    }

    fn file(&self, fid: Fid) -> DbResult<Arc<FilePool>> {
        self.files
            .read()
            .get(&fid)
            .cloned()
            .ok_or_else(|| DbError::NoEnt(format!("file {} not open in buffer pool", fid)))
    }

    /// Serve a get/new/create/last request. Returns a pinned buffer; the
    /// pin count is incremented atomically.
    pub fn get(&self, fid: Fid, pgno: Pgno, flags: GetFlags) -> DbResult<Arc<RwLock<Buffer>>> {
        let file = self.file(fid)?;
        let pgno = if flags.new {
            file.allocate_pgno()
        } else if flags.last {
            file.last_pgno()
        } else {
            pgno
        };

        let key = (fid, pgno);
        let idx = self.bucket_index(&key);
        {
            let mut bucket = self.buckets[idx].lock();
            if let Some(buf) = bucket.entries.get(&key) {
                buf.write().pin();
                self.touch(buf);
                return Ok(buf.clone());
            }

            let bytes = if flags.new {
                vec![0u8; self.page_size]
            } else {
                match file.read_page(pgno, self.page_size) {
                    Ok(b) => b,
                    Err(e) if flags.create => {
                        let _ = e;
                        vec![0u8; self.page_size]
                    }
                    Err(e) => return Err(e),
                }
            };

            let mut bytes = bytes;
            if !flags.new {
                if let Some(t) = self.transforms.read().get(&fid) {
                    (t.pgin)(&mut bytes);
                }
            }

            let mut buffer = Buffer::new(fid, pgno, bytes);
            buffer.pin();
            if flags.dirty {
                buffer.mark_dirty(Lsn::ZERO);
            }
            let buffer = Arc::new(RwLock::new(buffer));
            bucket.entries.insert(key, buffer.clone());
            self.evict_if_needed(&mut bucket);
            Ok(buffer)
        }
    }

    fn touch(&self, buf: &Arc<RwLock<Buffer>>) {
        let t = self.clock.fetch_add(1, Ordering::Relaxed);
        buf.write().last_touched = t;
    }

    /// Decrement pin count; mark dirty/discard as requested. May not
    /// release the buffer while `pin > 0`.
    pub fn put(&self, buf: &Arc<RwLock<Buffer>>, flags: PutFlags) -> DbResult<()> {
        let mut guard = buf.write();
        if flags.dirty {
            guard.mark_dirty(guard.lsn);
        }
        guard.unpin();
        if flags.discard && guard.pin_count() == 0 {
            let key = (guard.fid, guard.pgno);
            drop(guard);
            let idx = self.bucket_index(&key);
            self.buckets[idx].lock().entries.remove(&key);
        }
        Ok(())
    }

    /// Approximate-LRU eviction: pick the least-recently-touched clean,
    /// unpinned buffer and drop it from the cache. A buffer with `pin >
    /// 0` is never a candidate, and neither is a dirty one: evicting a
    /// dirty buffer without writing it back would silently lose the
    /// write, so dirty pages stay cached until `sync`/`trickle_flush`
    /// clears them (honoring the WAL order) and only then become
    /// evictable. If every unpinned buffer in the bucket happens to be
    /// dirty, the bucket is simply left over its target size until that
    /// happens.
    fn evict_if_needed(&self, bucket: &mut Bucket) {
        let capacity = (self.cache_size_bytes / self.page_size.max(1)).max(1);
        if bucket.entries.len() <= capacity / self.buckets.len().max(1) + 1 {
            return;
        }
        let victim = bucket
            .entries
            .iter()
            .filter(|(_, b)| b.read().pin_count() == 0 && !b.read().is_dirty())
            .min_by_key(|(_, b)| b.read().last_touched)
            .map(|(k, _)| *k);
        if let Some(key) = victim {
            bucket.entries.remove(&key);
        }
    }

    /// Flush dirty pages (of `fid`, or all files if `None`) in LSN order,
    /// honoring WAL: a page is only written once the log is durable
    /// through its LSN. `durable_through` reports the log manager's
    /// current durable watermark; `write_back` performs the actual page
    /// write.
    pub fn sync(
        &self,
        fid: Option<Fid>,
        durable_through: impl Fn() -> Lsn,
        mut write_back: impl FnMut(Fid, Pgno, &[u8]) -> DbResult<()>,
    ) -> DbResult<()> {
        let mut dirty: Vec<(Fid, Pgno, Lsn)> = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.lock();
            for ((f, p), buf) in bucket.entries.iter() {
                if let Some(target) = fid {
                    if *f != target {
                        continue;
                    }
                }
                let b = buf.read();
                if b.is_dirty() {
                    dirty.push((*f, *p, b.lsn));
                }
            }
        }
        dirty.sort_by_key(|(_, _, lsn)| *lsn);

        let watermark = durable_through();
        for (f, p, lsn) in dirty {
            if lsn > watermark {
                return Err(DbError::Inval(format!(
                    "page ({}, {}) has LSN {} ahead of durable watermark {}; flush the log first",
                    f, p, lsn, watermark
                )));
            }
            let key = (f, p);
            let idx = self.bucket_index(&key);
            let bucket = self.buckets[idx].lock();
            if let Some(buf) = bucket.entries.get(&key) {
                let mut b = buf.write();
                let mut bytes = b.bytes.clone();
                if let Some(t) = self.transforms.read().get(&f) {
                    (t.pgout)(&mut bytes);
                }
                write_back(f, p, &bytes)?;
                b.clear_dirty();
            }
        }
        Ok(())
    }

    /// Trickle-flush up to `n` dirty buffers (or the configured default),
    /// to smooth checkpoint cost.
    pub fn trickle_flush(
        &self,
        durable_through: impl Fn() -> Lsn,
        write_back: impl FnMut(Fid, Pgno, &[u8]) -> DbResult<()>,
        n: Option<usize>,
    ) -> DbResult<usize> {
        let limit = n.unwrap_or(self.trickle_n);
        let mut done = 0;
        let mut write_back = write_back;
        'outer: for bucket in &self.buckets {
            let keys: Vec<(Fid, Pgno)> = {
                let b = bucket.lock();
                b.entries
                    .iter()
                    .filter(|(_, buf)| buf.read().is_dirty())
                    .map(|(k, _)| *k)
                    .collect()
            };
            let watermark = durable_through();
            for (f, p) in keys {
                if done >= limit {
                    break 'outer;
                }
                let idx = self.bucket_index(&(f, p));
                let bucket = self.buckets[idx].lock();
                if let Some(buf) = bucket.entries.get(&(f, p)) {
                    let mut b = buf.write();
                    if b.is_dirty() && b.lsn <= watermark {
                        let mut bytes = b.bytes.clone();
                        if let Some(t) = self.transforms.read().get(&f) {
                            (t.pgout)(&mut bytes);
                        }
                        write_back(f, p, &bytes)?;
                        b.clear_dirty();
                        done += 1;
                    }
                }
            }
        }
        Ok(done)
    }

    /// Drop all cached buffers without flushing. Used between tests and
    /// by database close.
    pub fn clear(&self) {
        for bucket in &self.buckets {
            bucket.lock().entries.clear();
        }
    }

    pub fn cached_page_count(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().entries.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, BufferPool, Fid) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .unwrap();
        file.set_len(4096).unwrap();
        let pool = BufferPool::new(&EnvConfig::default());
        let fid = Fid::generate();
        pool.open_file(fid, Arc::new(FilePool::new(path, 4096).unwrap()));
        (dir, pool, fid)
    }

    #[test]
    fn new_page_extends_by_one() {
        let (_dir, pool, fid) = setup();
        let b1 = pool.get(fid, 0, GetFlags { new: true, ..Default::default() }).unwrap();
        assert_eq!(b1.read().pgno, 1);
        let b2 = pool.get(fid, 0, GetFlags { new: true, ..Default::default() }).unwrap();
        assert_eq!(b2.read().pgno, 2);
    }

    #[test]
    fn get_caches_and_reuses_buffer() {
        let (_dir, pool, fid) = setup();
        let b1 = pool.get(fid, 0, GetFlags::default()).unwrap();
        b1.write().mark_dirty(Lsn::ZERO);
        let b2 = pool.get(fid, 0, GetFlags::default()).unwrap();
        assert!(Arc::ptr_eq(&b1, &b2));
        assert_eq!(pool.cached_page_count(), 1);
    }

    #[test]
    fn put_with_dirty_flag_marks_dirty() {
        let (_dir, pool, fid) = setup();
        let buf = pool.get(fid, 0, GetFlags::default()).unwrap();
        pool.put(&buf, PutFlags { dirty: true, ..Default::default() }).unwrap();
        assert!(buf.read().is_dirty());
        assert_eq!(buf.read().pin_count(), 0);
    }

    #[test]
    fn sync_refuses_to_write_ahead_of_watermark() {
        let (_dir, pool, fid) = setup();
        let buf = pool.get(fid, 0, GetFlags::default()).unwrap();
        buf.write().mark_dirty(Lsn::new(1, 100));
        let res = pool.sync(None, || Lsn::ZERO, |_, _, _| Ok(()));
        assert!(res.is_err());
    }

    #[test]
    fn sync_writes_through_when_durable() {
        let (_dir, pool, fid) = setup();
        let buf = pool.get(fid, 0, GetFlags::default()).unwrap();
        buf.write().mark_dirty(Lsn::new(1, 10));
        let mut written = Vec::new();
        pool.sync(None, || Lsn::new(1, 100), |f, p, bytes| {
            written.push((f, p, bytes.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(written.len(), 1);
        assert!(!buf.read().is_dirty());
    }
}
