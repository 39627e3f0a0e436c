//! Hashing access method built on the same page/freelist primitives as
//! [`super::btree`]. Uses a fixed bucket count chosen at creation time,
//! with overflow-page chaining absorbing any bucket that fills past
//! capacity, rather than dynamic directory doubling.

use std::sync::Arc;

use crate::error::DbResult;
use crate::ids::{Fid, Pgno};
use crate::lock::{GetFlags as LockGetFlags, LockMode, LockObjectId};
use crate::log::RecordBody;
use crate::mpool::{BufferPool, FilePool, GetFlags as MpoolGetFlags, PutFlags as MpoolPutFlags};
use crate::serialize::{Decodeable, Encodeable, Writer};
use crate::txn::Transaction;

use super::freelist;
use super::meta::MetaPage;
use super::page::{PageHeader, PageType, HEADER_LEN};

fn lock_obj(fid: Fid, pgno: Pgno) -> LockObjectId {
    LockObjectId::page(fid, pgno)
}

/// FNV-1a. This is a bucket index, not a security boundary, so a cheap
/// non-cryptographic hash is enough.
fn hash_key(key: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for &b in key {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

struct BucketPage {
    header: PageHeader,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl BucketPage {
    fn new(pgno: Pgno, page_type: PageType) -> Self {
        Self { header: PageHeader::new(pgno, page_type), entries: Vec::new() }
    }

    fn decode(bytes: &[u8]) -> DbResult<Self> {
        let header = PageHeader::decode(bytes)?;
        let mut cursor = std::io::Cursor::new(&bytes[HEADER_LEN..]);
        let mut entries = Vec::with_capacity(header.entries as usize);
        for _ in 0..header.entries {
            let klen = u32::decode_from(&mut cursor)? as usize;
            let key = crate::serialize::read_exact(&mut cursor, klen)?;
            let vlen = u32::decode_from(&mut cursor)? as usize;
            let val = crate::serialize::read_exact(&mut cursor, vlen)?;
            entries.push((key, val));
        }
        Ok(Self { header, entries })
    }

    fn serialized_len(&self) -> usize {
        HEADER_LEN + self.entries.iter().map(|(k, v)| 8 + k.len() + v.len()).sum::<usize>()
    }

    fn encode(&self, page_size: usize) -> Vec<u8> {
        let mut w = Writer::new();
        for (k, v) in &self.entries {
            w.write(&(k.len() as u32));
            w.write_bytes(k);
            w.write(&(v.len() as u32));
            w.write_bytes(v);
        }
        let payload = w.into_bytes();
        let mut header = self.header;
        header.entries = self.entries.len() as u16;
        header.high_free_offset = page_size.saturating_sub(HEADER_LEN + payload.len()) as u16;
        let mut bytes = vec![0u8; page_size];
        header.write_into(&mut bytes);
        bytes[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(&payload);
        bytes
    }
}

/// A fixed-bucket-count hash table over one database file. Values over
/// roughly a page in size are rejected (`OpNotSup`); a caller needing
/// large values should use [`super::btree::BTree`], which carries full
/// overflow-page support.
pub struct Hash {
    fid: Fid,
    mpool: Arc<BufferPool>,
    file: Arc<FilePool>,
    page_size: usize,
    nbuckets: u32,
}

impl Hash {
    pub fn new(fid: Fid, mpool: Arc<BufferPool>, file: Arc<FilePool>, page_size: usize, nbuckets: u32) -> Self {
        Self { fid, mpool, file, page_size, nbuckets: nbuckets.max(1) }
    }

    /// Allocate `nbuckets` bucket-root pages (pgnos 1..=nbuckets, since
    /// the free list is empty on a fresh file and `new_page` always
    /// extends sequentially) and record the count on `meta`.
    pub fn init(&self, txn: &Transaction, meta: &mut MetaPage) -> DbResult<()> {
        meta.nparts = self.nbuckets;
        for _ in 0..self.nbuckets {
            let buf = freelist::new_page(txn, &self.mpool, &self.file, self.fid, PageType::HashBucket)?;
            self.mpool.put(&buf, MpoolPutFlags::default())?;
        }
        Ok(())
    }

    fn bucket_root(&self, key: &[u8]) -> Pgno {
        1 + (hash_key(key) % self.nbuckets as u64) as Pgno
    }

    pub fn get(&self, txn: &Transaction, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let mut pgno = self.bucket_root(key);
        txn.lock_get(lock_obj(self.fid, pgno), LockMode::Read, LockGetFlags::default())?;
        loop {
            let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
            let bytes = buf.read().bytes.clone();
            self.mpool.put(&buf, MpoolPutFlags::default())?;
            let page = BucketPage::decode(&bytes)?;
            if let Some((_, v)) = page.entries.iter().find(|(k, _)| k.as_slice() == key) {
                txn.lock_put(lock_obj(self.fid, pgno))?;
                return Ok(Some(v.clone()));
            }
            let next = page.header.next_pgno;
            txn.lock_put(lock_obj(self.fid, pgno))?;
            if next == 0 {
                return Ok(None);
            }
            txn.lock_get(lock_obj(self.fid, next), LockMode::Read, LockGetFlags::default())?;
            pgno = next;
        }
    }

    pub fn put(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> DbResult<()> {
        if HEADER_LEN + 8 + key.len() + value.len() > self.page_size {
            return Err(crate::error::DbError::OpNotSup);
        }
        let root = self.bucket_root(key);
        txn.lock_get(lock_obj(self.fid, root), LockMode::Write, LockGetFlags::default())?;

        let mut chain = vec![root];
        let mut pgno = root;
        loop {
            let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
            let before = buf.read().bytes.clone();
            self.mpool.put(&buf, MpoolPutFlags::default())?;
            let mut page = BucketPage::decode(&before)?;

            if let Some(slot) = page.entries.iter_mut().find(|(k, _)| k.as_slice() == key) {
                slot.1 = value.to_vec();
                let after = page.encode(self.page_size);
                self.commit_page(txn, pgno, before, after)?;
                for p in chain.into_iter().rev() {
                    if p != pgno {
                        txn.lock_put(lock_obj(self.fid, p))?;
                    }
                }
                txn.lock_put(lock_obj(self.fid, pgno))?;
                return Ok(());
            }

            let mut candidate = page.entries.clone();
            candidate.push((key.to_vec(), value.to_vec()));
            let fits = HEADER_LEN
                + candidate.iter().map(|(k, v)| 8 + k.len() + v.len()).sum::<usize>()
                <= self.page_size;

            if fits {
                page.entries.push((key.to_vec(), value.to_vec()));
                let after = page.encode(self.page_size);
                self.commit_page(txn, pgno, before, after)?;
                for p in chain.into_iter().rev() {
                    txn.lock_put(lock_obj(self.fid, p))?;
                }
                return Ok(());
            }

            if page.header.next_pgno == 0 {
                let overflow = freelist::new_page(txn, &self.mpool, &self.file, self.fid, PageType::HashOverflow)?;
                let overflow_pgno = overflow.read().pgno;
                self.mpool.put(&overflow, MpoolPutFlags::default())?;

                let mut with_link = BucketPage { header: page.header, entries: page.entries };
                with_link.header.next_pgno = overflow_pgno;
                let after = with_link.encode(self.page_size);
                self.commit_page(txn, pgno, before, after)?;

                let mut new_page = BucketPage::new(overflow_pgno, PageType::HashOverflow);
                new_page.entries.push((key.to_vec(), value.to_vec()));
                let new_bytes = new_page.encode(self.page_size);
                self.commit_new_page(txn, overflow_pgno, new_bytes)?;

                for p in chain.into_iter().rev() {
                    txn.lock_put(lock_obj(self.fid, p))?;
                }
                txn.lock_put(lock_obj(self.fid, overflow_pgno))?;
                return Ok(());
            }

            let next = page.header.next_pgno;
            txn.lock_get(lock_obj(self.fid, next), LockMode::Write, LockGetFlags::default())?;
            chain.push(next);
            pgno = next;
        }
    }

    pub fn del(&self, txn: &Transaction, key: &[u8]) -> DbResult<bool> {
        let root = self.bucket_root(key);
        txn.lock_get(lock_obj(self.fid, root), LockMode::Write, LockGetFlags::default())?;
        let mut chain = vec![root];
        let mut pgno = root;
        loop {
            let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
            let before = buf.read().bytes.clone();
            self.mpool.put(&buf, MpoolPutFlags::default())?;
            let mut page = BucketPage::decode(&before)?;
            if let Some(idx) = page.entries.iter().position(|(k, _)| k.as_slice() == key) {
                page.entries.remove(idx);
                let after = page.encode(self.page_size);
                self.commit_page(txn, pgno, before, after)?;
                for p in chain.into_iter().rev() {
                    txn.lock_put(lock_obj(self.fid, p))?;
                }
                return Ok(true);
            }
            let next = page.header.next_pgno;
            if next == 0 {
                for p in chain.into_iter().rev() {
                    txn.lock_put(lock_obj(self.fid, p))?;
                }
                return Ok(false);
            }
            txn.lock_get(lock_obj(self.fid, next), LockMode::Write, LockGetFlags::default())?;
            chain.push(next);
            pgno = next;
        }
    }

    fn commit_page(&self, txn: &Transaction, pgno: Pgno, before: Vec<u8>, after: Vec<u8>) -> DbResult<()> {
        let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
        let lsn = txn.log_update(RecordBody::Update { fid: self.fid, pgno, before, after: after.clone() })?;
        let mut guard = buf.write();
        guard.bytes = after;
        guard.mark_dirty(lsn);
        drop(guard);
        self.mpool.put(&buf, MpoolPutFlags { dirty: true, ..Default::default() })
    }

    fn commit_new_page(&self, txn: &Transaction, pgno: Pgno, after: Vec<u8>) -> DbResult<()> {
        let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
        let before = buf.read().bytes.clone();
        self.mpool.put(&buf, MpoolPutFlags::default())?;
        self.commit_page(txn, pgno, before, after)
    }

    pub fn nbuckets(&self) -> u32 {
        self.nbuckets
    }

    /// Every (key, value) pair across every bucket and its overflow
    /// chain, for the shared cursor contract's `FIRST`/`NEXT` over an
    /// access method that has no inherent key order.
    pub fn scan(&self, txn: &Transaction) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for bucket in 1..=self.nbuckets as Pgno {
            let mut pgno = bucket;
            loop {
                txn.lock_get(lock_obj(self.fid, pgno), LockMode::Read, LockGetFlags::default())?;
                let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
                let bytes = buf.read().bytes.clone();
                self.mpool.put(&buf, MpoolPutFlags::default())?;
                let page = BucketPage::decode(&bytes)?;
                out.extend(page.entries.iter().cloned());
                let next = page.header.next_pgno;
                txn.lock_put(lock_obj(self.fid, pgno))?;
                if next == 0 {
                    break;
                }
                pgno = next;
            }
        }
        Ok(out)
    }
}
