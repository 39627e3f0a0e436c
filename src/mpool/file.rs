//! Per-file page I/O for the buffer pool: read/write fixed-size pages and
//! track the high-water page number. Allocating a new page returns the
//! pgno one past the file's current high-water mark.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{DbError, DbResult};
use crate::ids::Pgno;

/// A single open database file, addressed by fixed-size page number.
pub struct FilePool {
    path: PathBuf,
    file: Mutex<File>,
    last_pgno: AtomicU32,
}

impl FilePool {
    pub fn new(path: impl AsRef<Path>, page_size: usize) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        let last_pgno = if len == 0 {
            0
        } else {
            ((len as usize) / page_size.max(1)).saturating_sub(1) as u32
        };
        Ok(Self {
            path,
            file: Mutex::new(file),
            last_pgno: AtomicU32::new(last_pgno),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_pgno(&self) -> Pgno {
        self.last_pgno.load(Ordering::SeqCst)
    }

    /// Extend the file by exactly one page and return its number.
    pub fn allocate_pgno(&self) -> Pgno {
        self.last_pgno.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Force the high-water mark to at least `pgno`, used by recovery
    /// when replaying an EXTEND allocation record.
    pub fn bump_last_pgno(&self, pgno: Pgno) {
        self.last_pgno.fetch_max(pgno, Ordering::SeqCst);
    }

    pub fn read_page(&self, pgno: Pgno, page_size: usize) -> DbResult<Vec<u8>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pgno as u64 * page_size as u64))?;
        let mut buf = vec![0u8; page_size];
        file.read_exact(&mut buf)
            .map_err(|e| DbError::Io(format!("reading page {}: {}", pgno, e)))?;
        Ok(buf)
    }

    pub fn write_page(&self, pgno: Pgno, bytes: &[u8]) -> DbResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pgno as u64 * bytes.len() as u64))?;
        file.write_all(bytes)?;
        Ok(())
    }

    pub fn sync_all(&self) -> DbResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_after_write_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.db");
        let fp = FilePool::new(&path, 16).unwrap();
        fp.write_page(0, &[7u8; 16]).unwrap();
        let got = fp.read_page(0, 16).unwrap();
        assert_eq!(got, vec![7u8; 16]);
    }

    #[test]
    fn allocate_pgno_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.db");
        let fp = FilePool::new(&path, 16).unwrap();
        assert_eq!(fp.allocate_pgno(), 1);
        assert_eq!(fp.allocate_pgno(), 2);
    }
}
