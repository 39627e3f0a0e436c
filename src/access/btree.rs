//! B-tree (and its record-number "recno" variant) over opaque byte
//! keys/values, with overflow pages for large values and duplicate-key
//! coexistence. Descends root pointer page -> internal page -> leaf
//! page, splitting a full leaf/internal page and propagating a new
//! separator upward, with a root split allocating a fresh root.
//! Splitting and locking follow a crabbing pattern: every page that
//! might have to be rewritten on the way down is write-locked as the
//! descent passes through it.

use std::sync::Arc;

use crate::error::{DbError, DbResult};
use crate::ids::{Fid, Lsn, Pgno};
use crate::lock::{GetFlags as LockGetFlags, LockMode, LockObjectId};
use crate::log::RecordBody;
use crate::mpool::{BufferPool, FilePool, GetFlags as MpoolGetFlags, PutFlags as MpoolPutFlags};
use crate::serialize::{Decodeable, Encodeable, Writer};
use crate::txn::Transaction;

use super::freelist;
use super::meta::MetaPage;
use super::page::{PageHeader, PageType, HEADER_LEN};

/// Payload too large for a leaf slot spills into chained overflow
/// pages. A quarter of the page is the threshold, matching the usual
/// "a single big value shouldn't dominate a leaf" rule of thumb.
fn overflow_threshold(page_size: usize) -> usize {
    page_size / 4
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ValueSlot {
    Inline(Vec<u8>),
    Overflow { pgno: Pgno, len: u32 },
}

fn lock_obj(fid: Fid, pgno: Pgno) -> LockObjectId {
    LockObjectId::page(fid, pgno)
}

struct LeafPage {
    header: PageHeader,
    entries: Vec<(Vec<u8>, ValueSlot)>,
}

impl LeafPage {
    fn new(pgno: Pgno) -> Self {
        Self {
            header: PageHeader::new(pgno, PageType::BtreeLeaf),
            entries: Vec::new(),
        }
    }

    fn decode(bytes: &[u8]) -> DbResult<Self> {
        let header = PageHeader::decode(bytes)?;
        let mut cursor = std::io::Cursor::new(&bytes[HEADER_LEN..]);
        let mut entries = Vec::with_capacity(header.entries as usize);
        for _ in 0..header.entries {
            let key_len = u32::decode_from(&mut cursor)? as usize;
            let key = crate::serialize::read_exact(&mut cursor, key_len)?;
            let is_overflow = bool::decode_from(&mut cursor)?;
            let slot = if is_overflow {
                let pgno = Pgno::decode_from(&mut cursor)?;
                let len = u32::decode_from(&mut cursor)?;
                ValueSlot::Overflow { pgno, len }
            } else {
                let val_len = u32::decode_from(&mut cursor)? as usize;
                ValueSlot::Inline(crate::serialize::read_exact(&mut cursor, val_len)?)
            };
            entries.push((key, slot));
        }
        Ok(Self { header, entries })
    }

    fn serialized_len(&self) -> usize {
        let mut n = HEADER_LEN;
        for (k, v) in &self.entries {
            n += 4 + k.len() + 1;
            n += match v {
                ValueSlot::Inline(bytes) => 4 + bytes.len(),
                ValueSlot::Overflow { .. } => 4 + 4,
            };
        }
        n
    }

    fn encode(&self, page_size: usize) -> Vec<u8> {
        let mut w = Writer::new();
        for (k, v) in &self.entries {
            w.write(&(k.len() as u32));
            w.write_bytes(k);
            match v {
                ValueSlot::Inline(bytes) => {
                    w.write(&false);
                    w.write(&(bytes.len() as u32));
                    w.write_bytes(bytes);
                }
                ValueSlot::Overflow { pgno, len } => {
                    w.write(&true);
                    w.write(pgno);
                    w.write(len);
                }
            }
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

    /// First index whose key is `>= key` (lower_bound), per standard
    /// sorted-leaf search.
    fn lower_bound(&self, key: &[u8]) -> usize {
        self.entries.partition_point(|(k, _)| k.as_slice() < key)
    }
}

struct InternalPage {
    header: PageHeader,
    children: Vec<Pgno>,
    separators: Vec<Vec<u8>>,
}

impl InternalPage {
    fn new(pgno: Pgno, left: Pgno, right: Pgno, sep: Vec<u8>) -> Self {
        Self {
            header: PageHeader::new(pgno, PageType::BtreeInternal),
            children: vec![left, right],
            separators: vec![sep],
        }
    }

    fn decode(bytes: &[u8]) -> DbResult<Self> {
        let header = PageHeader::decode(bytes)?;
        let mut cursor = std::io::Cursor::new(&bytes[HEADER_LEN..]);
        let n_children = u32::decode_from(&mut cursor)? as usize;
        let mut children = Vec::with_capacity(n_children);
        for _ in 0..n_children {
            children.push(Pgno::decode_from(&mut cursor)?);
        }
        let mut separators = Vec::with_capacity(n_children.saturating_sub(1));
        for _ in 0..n_children.saturating_sub(1) {
            let len = u32::decode_from(&mut cursor)? as usize;
            separators.push(crate::serialize::read_exact(&mut cursor, len)?);
        }
        Ok(Self { header, children, separators })
    }

    fn serialized_len(&self) -> usize {
        let mut n = HEADER_LEN + 4 + self.children.len() * 4;
        for s in &self.separators {
            n += 4 + s.len();
        }
        n
    }

    fn encode(&self, page_size: usize) -> Vec<u8> {
        let mut w = Writer::new();
        w.write(&(self.children.len() as u32));
        for c in &self.children {
            w.write(c);
        }
        for s in &self.separators {
            w.write(&(s.len() as u32));
            w.write_bytes(s);
        }
        let payload = w.into_bytes();
        let mut header = self.header;
        header.entries = self.children.len() as u16;
        header.high_free_offset = page_size.saturating_sub(HEADER_LEN + payload.len()) as u16;
        let mut bytes = vec![0u8; page_size];
        header.write_into(&mut bytes);
        bytes[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(&payload);
        bytes
    }

    /// Index of the child subtree that may contain `key`.
    fn child_index(&self, key: &[u8]) -> usize {
        self.separators.partition_point(|s| s.as_slice() <= key)
    }

    fn insert_child(&mut self, at: usize, sep: Vec<u8>, child: Pgno) {
        self.separators.insert(at, sep);
        self.children.insert(at + 1, child);
    }
}

/// An ordered key/value store over one database file. `recno` selects
/// the record-number positional variant; this crate's recno mode tracks
/// the key/record counts on the meta page but performs positional
/// lookup by scanning the leaf chain rather than maintaining
/// per-subtree counts.
pub struct BTree {
    fid: Fid,
    mpool: Arc<BufferPool>,
    file: Arc<FilePool>,
    page_size: usize,
    pub duplicates: bool,
    pub recno: bool,
}

impl BTree {
    pub fn new(fid: Fid, mpool: Arc<BufferPool>, file: Arc<FilePool>, page_size: usize, duplicates: bool, recno: bool) -> Self {
        Self { fid, mpool, file, page_size, duplicates, recno }
    }

    /// Create the initial empty root leaf for a freshly created
    /// database file and record its pgno on `meta`.
    pub fn init(&self, txn: &Transaction, meta: &mut MetaPage) -> DbResult<()> {
        let page_type = if self.recno { PageType::RecnoLeaf } else { PageType::BtreeLeaf };
        let root = freelist::new_page(txn, &self.mpool, &self.file, self.fid, page_type)?;
        meta.root_pgno = root.read().pgno;
        self.mpool.put(&root, MpoolPutFlags::default())?;
        Ok(())
    }

    fn root_pgno(&self) -> DbResult<Pgno> {
        let buf = self.mpool.get(self.fid, 0, MpoolGetFlags::default())?;
        let meta = MetaPage::decode(&buf.read().bytes)?;
        self.mpool.put(&buf, MpoolPutFlags::default())?;
        Ok(meta.root_pgno)
    }

    /// Current root, allocating a fresh empty leaf if `truncate` left the
    /// tree rootless (pgno 0 is the meta page, never a data page).
    fn ensure_root(&self, txn: &Transaction) -> DbResult<Pgno> {
        let existing = self.root_pgno()?;
        if existing != 0 {
            return Ok(existing);
        }
        let page_type = if self.recno { PageType::RecnoLeaf } else { PageType::BtreeLeaf };
        let root = freelist::new_page(txn, &self.mpool, &self.file, self.fid, page_type)?;
        let pgno = root.read().pgno;
        self.mpool.put(&root, MpoolPutFlags::default())?;
        self.set_root_pgno(txn, pgno)?;
        Ok(pgno)
    }

    /// Payload bytes held per overflow page. Leaves `next_pgno` (written
    /// into the header, not the payload) out of the per-page budget;
    /// `read_overflow` must use the exact same cap so page boundaries
    /// line up on replay.
    fn overflow_chunk_cap(&self) -> usize {
        self.page_size - HEADER_LEN
    }

    fn write_overflow(&self, txn: &Transaction, value: &[u8]) -> DbResult<Pgno> {
        let chunk_cap = self.overflow_chunk_cap();
        let mut pages = Vec::new();
        let mut offset = 0;
        while offset < value.len() {
            let end = (offset + chunk_cap).min(value.len());
            let buf = freelist::new_page(txn, &self.mpool, &self.file, self.fid, PageType::Overflow)?;
            pages.push((buf.read().pgno, value[offset..end].to_vec()));
            offset = end;
        }
        for i in 0..pages.len() {
            let (pgno, chunk) = &pages[i];
            let next = pages.get(i + 1).map(|(p, _)| *p).unwrap_or(0);
            let buf = self.mpool.get(self.fid, *pgno, MpoolGetFlags::default())?;
            let before = buf.read().bytes.clone();
            let mut header = PageHeader::new(*pgno, PageType::Overflow);
            header.next_pgno = next;
            let mut bytes = vec![0u8; self.page_size];
            header.write_into(&mut bytes);
            bytes[HEADER_LEN..HEADER_LEN + chunk.len()].copy_from_slice(chunk);
            let lsn = txn.log_update(RecordBody::Update {
                fid: self.fid,
                pgno: *pgno,
                before,
                after: bytes.clone(),
            })?;
            let mut guard = buf.write();
            guard.bytes = bytes;
            guard.mark_dirty(lsn);
            drop(guard);
            self.mpool.put(&buf, MpoolPutFlags { dirty: true, ..Default::default() })?;
        }
        Ok(pages.first().map(|(p, _)| *p).unwrap_or(0))
    }

    fn read_overflow(&self, mut pgno: Pgno, total_len: usize) -> DbResult<Vec<u8>> {
        let chunk_cap = self.overflow_chunk_cap();
        let mut out = Vec::with_capacity(total_len);
        while pgno != 0 && out.len() < total_len {
            let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
            let (chunk, next) = {
                let g = buf.read();
                let header = PageHeader::decode(&g.bytes)?;
                let take = (total_len - out.len()).min(chunk_cap);
                (g.bytes[HEADER_LEN..HEADER_LEN + take].to_vec(), header.next_pgno)
            };
            out.extend_from_slice(&chunk);
            self.mpool.put(&buf, MpoolPutFlags::default())?;
            pgno = next;
        }
        Ok(out)
    }

    fn resolve(&self, slot: &ValueSlot) -> DbResult<Vec<u8>> {
        match slot {
            ValueSlot::Inline(bytes) => Ok(bytes.clone()),
            ValueSlot::Overflow { pgno, len } => self.read_overflow(*pgno, *len as usize),
        }
    }

    /// Point lookup. Descends with true crabbing: a
    /// child is read-locked before its parent's read lock is released,
    /// and only one lock is held at a time once past the root.
    pub fn get(&self, txn: &Transaction, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let mut pgno = self.root_pgno()?;
        if pgno == 0 {
            return Ok(None);
        }
        txn.lock_get(lock_obj(self.fid, pgno), LockMode::Read, LockGetFlags::default())?;
        loop {
            let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
            let bytes = buf.read().bytes.clone();
            self.mpool.put(&buf, MpoolPutFlags::default())?;
            let header = PageHeader::decode(&bytes)?;
            if header.page_type == PageType::BtreeInternal || header.page_type == PageType::RecnoInternal {
                let page = InternalPage::decode(&bytes)?;
                let idx = page.child_index(key);
                let child = page.children[idx];
                txn.lock_get(lock_obj(self.fid, child), LockMode::Read, LockGetFlags::default())?;
                txn.lock_put(lock_obj(self.fid, pgno))?;
                pgno = child;
                continue;
            }
            let leaf = LeafPage::decode(&bytes)?;
            let idx = leaf.lower_bound(key);
            let found = leaf
                .entries
                .get(idx)
                .filter(|(k, _)| k.as_slice() == key)
                .map(|(_, v)| v.clone());
            txn.lock_put(lock_obj(self.fid, pgno))?;
            return found.map(|v| self.resolve(&v)).transpose();
        }
    }

    /// Insert or overwrite `key`. Write-locks the
    /// entire root-to-leaf path (conservative crabbing: any page on the
    /// path might need to absorb a propagated split) and releases it
    /// once the leaf (and any split fallout) is durably applied.
    pub fn put(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> DbResult<()> {
        let mut path: Vec<Pgno> = Vec::new();
        let mut pgno = self.ensure_root(txn)?;
        txn.lock_get(lock_obj(self.fid, pgno), LockMode::Write, LockGetFlags::default())?;
        path.push(pgno);

        loop {
            let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
            let header = PageHeader::decode(&buf.read().bytes)?;
            self.mpool.put(&buf, MpoolPutFlags::default())?;
            if header.page_type != PageType::BtreeInternal && header.page_type != PageType::RecnoInternal {
                break;
            }
            let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
            let page = InternalPage::decode(&buf.read().bytes)?;
            self.mpool.put(&buf, MpoolPutFlags::default())?;
            let idx = page.child_index(key);
            let child = page.children[idx];
            txn.lock_get(lock_obj(self.fid, child), LockMode::Write, LockGetFlags::default())?;
            path.push(child);
            pgno = child;
        }

        let leaf_pgno = pgno;
        let slot = self.to_slot(txn, value)?;
        let result = self.insert_into_leaf(txn, leaf_pgno, key, slot, &mut path);

        for p in path.into_iter().rev() {
            txn.lock_put(lock_obj(self.fid, p))?;
        }
        result
    }

    fn to_slot(&self, txn: &Transaction, value: &[u8]) -> DbResult<ValueSlot> {
        if value.len() > overflow_threshold(self.page_size) {
            let pgno = self.write_overflow(txn, value)?;
            Ok(ValueSlot::Overflow { pgno, len: value.len() as u32 })
        } else {
            Ok(ValueSlot::Inline(value.to_vec()))
        }
    }

    fn insert_into_leaf(
        &self,
        txn: &Transaction,
        leaf_pgno: Pgno,
        key: &[u8],
        slot: ValueSlot,
        path: &mut Vec<Pgno>,
    ) -> DbResult<()> {
        let buf = self.mpool.get(self.fid, leaf_pgno, MpoolGetFlags::default())?;
        let before = buf.read().bytes.clone();
        self.mpool.put(&buf, MpoolPutFlags::default())?;
        let mut leaf = LeafPage::decode(&before)?;

        let idx = leaf.lower_bound(key);
        match leaf.entries.get(idx) {
            Some((k, _)) if k == key && !self.duplicates => {
                leaf.entries[idx].1 = slot;
            }
            _ => {
                leaf.entries.insert(idx, (key.to_vec(), slot));
            }
        }

        if leaf.serialized_len() <= self.page_size {
            let after = leaf.encode(self.page_size);
            self.commit_page(txn, leaf_pgno, before, after)?;
            return Ok(());
        }

        // Split the overfull leaf in half; the right half's first key
        // becomes the separator promoted to the parent.
        let mid = leaf.entries.len() / 2;
        let right_entries = leaf.entries.split_off(mid);
        let right_buf = freelist::new_page(txn, &self.mpool, &self.file, self.fid, PageType::BtreeLeaf)?;
        let right_pgno = right_buf.read().pgno;
        self.mpool.put(&right_buf, MpoolPutFlags::default())?;

        let sep = right_entries[0].0.clone();
        let mut right = LeafPage::new(right_pgno);
        right.header.next_pgno = leaf.header.next_pgno;
        right.entries = right_entries;
        leaf.header.next_pgno = right_pgno;

        let left_after = leaf.encode(self.page_size);
        self.commit_page(txn, leaf_pgno, before, left_after)?;
        let right_after_bytes = right.encode(self.page_size);
        self.commit_new_page(txn, right_pgno, right_after_bytes)?;

        self.propagate_split(txn, path, leaf_pgno, sep, right_pgno)
    }

    /// Insert `(sep, new_child)` into the parent of `left_child` on
    /// `path`, splitting that parent (and recursing upward, including a
    /// root split) as needed.
    fn propagate_split(
        &self,
        txn: &Transaction,
        path: &mut Vec<Pgno>,
        left_child: Pgno,
        sep: Vec<u8>,
        new_child: Pgno,
    ) -> DbResult<()> {
        // `path`'s last element is `left_child` itself; its parent (if
        // any) is the element before it.
        let parent_idx = path.iter().rposition(|&p| p == left_child).and_then(|i| i.checked_sub(1));

        let parent_pgno = match parent_idx {
            Some(i) => path[i],
            None => {
                // Splitting the root: allocate a new internal root.
                let new_root = freelist::new_page(txn, &self.mpool, &self.file, self.fid, PageType::BtreeInternal)?;
                let new_root_pgno = new_root.read().pgno;
                self.mpool.put(&new_root, MpoolPutFlags::default())?;
                let root_page = InternalPage::new(new_root_pgno, left_child, new_child, sep);
                let bytes = root_page.encode(self.page_size);
                self.commit_new_page(txn, new_root_pgno, bytes)?;
                self.set_root_pgno(txn, new_root_pgno)?;
                path.insert(0, new_root_pgno);
                txn.lock_get(lock_obj(self.fid, new_root_pgno), LockMode::Write, LockGetFlags::default())?;
                return Ok(());
            }
        };

        let buf = self.mpool.get(self.fid, parent_pgno, MpoolGetFlags::default())?;
        let before = buf.read().bytes.clone();
        self.mpool.put(&buf, MpoolPutFlags::default())?;
        let mut parent = InternalPage::decode(&before)?;
        let at = parent.children.iter().position(|&c| c == left_child).unwrap_or(0);
        parent.insert_child(at, sep, new_child);

        if parent.serialized_len() <= self.page_size {
            let after = parent.encode(self.page_size);
            self.commit_page(txn, parent_pgno, before, after)
        } else {
            let mid = parent.children.len() / 2;
            let right_children = parent.children.split_off(mid);
            let right_seps = parent.separators.split_off(mid);
            let promoted = parent.separators.pop().expect("internal split always has a middle separator");

            let right_buf = freelist::new_page(txn, &self.mpool, &self.file, self.fid, PageType::BtreeInternal)?;
            let right_pgno = right_buf.read().pgno;
            self.mpool.put(&right_buf, MpoolPutFlags::default())?;
            let right = InternalPage {
                header: PageHeader::new(right_pgno, PageType::BtreeInternal),
                children: right_children,
                separators: right_seps,
            };

            let left_after = parent.encode(self.page_size);
            self.commit_page(txn, parent_pgno, before, left_after)?;
            let right_bytes = right.encode(self.page_size);
            self.commit_new_page(txn, right_pgno, right_bytes)?;

            self.propagate_split(txn, path, parent_pgno, promoted, right_pgno)
        }
    }

    fn set_root_pgno(&self, txn: &Transaction, new_root: Pgno) -> DbResult<()> {
        let buf = self.mpool.get(self.fid, 0, MpoolGetFlags::default())?;
        let before = buf.read().bytes.clone();
        self.mpool.put(&buf, MpoolPutFlags::default())?;
        let mut meta = MetaPage::decode(&before)?;
        meta.root_pgno = new_root;
        let after = meta.encode(self.page_size);
        self.commit_page(txn, 0, before, after)
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

    /// Remove `key`. No rebalancing/merge is performed on underflow: a
    /// leaf is simply left sparse, and `truncate`/`reclaim` still
    /// reclaims every page regardless of fill.
    pub fn del(&self, txn: &Transaction, key: &[u8]) -> DbResult<bool> {
        let mut pgno = self.root_pgno()?;
        if pgno == 0 {
            return Ok(false);
        }
        txn.lock_get(lock_obj(self.fid, pgno), LockMode::Write, LockGetFlags::default())?;
        let mut locked = vec![pgno];
        loop {
            let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
            let bytes = buf.read().bytes.clone();
            self.mpool.put(&buf, MpoolPutFlags::default())?;
            let header = PageHeader::decode(&bytes)?;
            if header.page_type != PageType::BtreeInternal && header.page_type != PageType::RecnoInternal {
                let mut leaf = LeafPage::decode(&bytes)?;
                let idx = leaf.lower_bound(key);
                let removed = if leaf.entries.get(idx).map(|(k, _)| k.as_slice()) == Some(key) {
                    leaf.entries.remove(idx);
                    true
                } else {
                    false
                };
                if removed {
                    let after = leaf.encode(self.page_size);
                    self.commit_page(txn, pgno, bytes, after)?;
                }
                for p in locked.into_iter().rev() {
                    txn.lock_put(lock_obj(self.fid, p))?;
                }
                return Ok(removed);
            }
            let page = InternalPage::decode(&bytes)?;
            let idx = page.child_index(key);
            let child = page.children[idx];
            txn.lock_get(lock_obj(self.fid, child), LockMode::Write, LockGetFlags::default())?;
            locked.push(child);
            pgno = child;
        }
    }

    /// Positional lookup for the recno variant: scans the
    /// leftmost-to-rightmost leaf chain rather than consulting a
    /// maintained per-subtree count.
    pub fn get_by_record_number(&self, txn: &Transaction, n: u32) -> DbResult<Option<Vec<u8>>> {
        let mut remaining = n as usize;
        let mut pgno = self.leftmost_leaf(txn)?;
        loop {
            if pgno == 0 {
                return Ok(None);
            }
            txn.lock_get(lock_obj(self.fid, pgno), LockMode::Read, LockGetFlags::default())?;
            let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
            let leaf = LeafPage::decode(&buf.read().bytes)?;
            self.mpool.put(&buf, MpoolPutFlags::default())?;
            if remaining < leaf.entries.len() {
                let value = self.resolve(&leaf.entries[remaining].1)?;
                txn.lock_put(lock_obj(self.fid, pgno))?;
                return Ok(Some(value));
            }
            remaining -= leaf.entries.len();
            let next = leaf.header.next_pgno;
            txn.lock_put(lock_obj(self.fid, pgno))?;
            pgno = next;
        }
    }

    /// First key/value in sorted order, per the shared cursor contract's
    /// `FIRST` positioning.
    pub fn first(&self, txn: &Transaction) -> DbResult<Option<(Vec<u8>, Vec<u8>)>> {
        let mut pgno = self.leftmost_leaf(txn)?;
        while pgno != 0 {
            txn.lock_get(lock_obj(self.fid, pgno), LockMode::Read, LockGetFlags::default())?;
            let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
            let leaf = LeafPage::decode(&buf.read().bytes)?;
            self.mpool.put(&buf, MpoolPutFlags::default())?;
            if let Some((k, v)) = leaf.entries.first() {
                let value = self.resolve(v)?;
                txn.lock_put(lock_obj(self.fid, pgno))?;
                return Ok(Some((k.clone(), value)));
            }
            let next = leaf.header.next_pgno;
            txn.lock_put(lock_obj(self.fid, pgno))?;
            pgno = next;
        }
        Ok(None)
    }

    /// Smallest entry strictly greater than `key`, per the shared cursor
    /// contract's `NEXT` positioning. Descends to the leaf that would
    /// hold `key`, then walks the leaf chain via `next_pgno` until it
    /// finds an entry past it.
    pub fn next(&self, txn: &Transaction, key: &[u8]) -> DbResult<Option<(Vec<u8>, Vec<u8>)>> {
        let mut pgno = self.root_pgno()?;
        if pgno != 0 {
            txn.lock_get(lock_obj(self.fid, pgno), LockMode::Read, LockGetFlags::default())?;
            loop {
                let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
                let bytes = buf.read().bytes.clone();
                self.mpool.put(&buf, MpoolPutFlags::default())?;
                let header = PageHeader::decode(&bytes)?;
                if header.page_type == PageType::BtreeInternal || header.page_type == PageType::RecnoInternal {
                    let page = InternalPage::decode(&bytes)?;
                    let idx = page.child_index(key);
                    let child = page.children[idx];
                    txn.lock_get(lock_obj(self.fid, child), LockMode::Read, LockGetFlags::default())?;
                    txn.lock_put(lock_obj(self.fid, pgno))?;
                    pgno = child;
                    continue;
                }
                break;
            }
        }
        loop {
            if pgno == 0 {
                return Ok(None);
            }
            let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
            let leaf = LeafPage::decode(&buf.read().bytes)?;
            self.mpool.put(&buf, MpoolPutFlags::default())?;
            let idx = leaf.entries.partition_point(|(k, _)| k.as_slice() <= key);
            if let Some((k, v)) = leaf.entries.get(idx) {
                let value = self.resolve(v)?;
                txn.lock_put(lock_obj(self.fid, pgno))?;
                return Ok(Some((k.clone(), value)));
            }
            let next = leaf.header.next_pgno;
            txn.lock_put(lock_obj(self.fid, pgno))?;
            pgno = next;
        }
    }

    fn leftmost_leaf(&self, txn: &Transaction) -> DbResult<Pgno> {
        let mut pgno = self.root_pgno()?;
        if pgno == 0 {
            return Ok(0);
        }
        loop {
            txn.lock_get(lock_obj(self.fid, pgno), LockMode::Read, LockGetFlags::default())?;
            let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
            let header = PageHeader::decode(&buf.read().bytes)?;
            if header.page_type != PageType::BtreeInternal && header.page_type != PageType::RecnoInternal {
                self.mpool.put(&buf, MpoolPutFlags::default())?;
                txn.lock_put(lock_obj(self.fid, pgno))?;
                return Ok(pgno);
            }
            let page = InternalPage::decode(&buf.read().bytes)?;
            self.mpool.put(&buf, MpoolPutFlags::default())?;
            let next = page.children[0];
            txn.lock_put(lock_obj(self.fid, pgno))?;
            pgno = next;
        }
    }

    /// Recursive depth-first free. `reclaim` additionally frees the meta
    /// page itself (deleting the database); `truncate` leaves it in
    /// place, ready for reuse.
    pub fn truncate(&self, txn: &Transaction) -> DbResult<u32> {
        txn.lock_get(lock_obj(self.fid, 0), LockMode::Write, LockGetFlags::default())?;
        let root = self.root_pgno()?;
        let mut freed = 0u32;
        self.free_subtree(txn, root, &mut freed)?;
        self.set_root_pgno(txn, 0)?;
        Ok(freed)
    }

    pub fn reclaim(&self, txn: &Transaction) -> DbResult<u32> {
        let freed = self.truncate(txn)?;
        freelist::free_page(txn, &self.mpool, self.fid, 0)?;
        Ok(freed + 1)
    }

    fn free_subtree(&self, txn: &Transaction, pgno: Pgno, freed: &mut u32) -> DbResult<()> {
        if pgno == 0 {
            return Ok(());
        }
        let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
        let bytes = buf.read().bytes.clone();
        self.mpool.put(&buf, MpoolPutFlags::default())?;
        let header = PageHeader::decode(&bytes)?;
        if header.page_type == PageType::BtreeInternal || header.page_type == PageType::RecnoInternal {
            let page = InternalPage::decode(&bytes)?;
            for child in page.children {
                self.free_subtree(txn, child, freed)?;
            }
        } else {
            let leaf = LeafPage::decode(&bytes)?;
            for (_, slot) in &leaf.entries {
                if let ValueSlot::Overflow { pgno, .. } = slot {
                    self.free_subtree_overflow(txn, *pgno, freed)?;
                }
            }
        }
        freelist::free_page(txn, &self.mpool, self.fid, pgno)?;
        *freed += 1;
        Ok(())
    }

    fn free_subtree_overflow(&self, txn: &Transaction, mut pgno: Pgno, freed: &mut u32) -> DbResult<()> {
        while pgno != 0 {
            let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
            let header = PageHeader::decode(&buf.read().bytes)?;
            self.mpool.put(&buf, MpoolPutFlags::default())?;
            let next = header.next_pgno;
            freelist::free_page(txn, &self.mpool, self.fid, pgno)?;
            *freed += 1;
            pgno = next;
        }
        Ok(())
    }

    pub fn page_lsn(&self, pgno: Pgno) -> DbResult<Lsn> {
        let buf = self.mpool.get(self.fid, pgno, MpoolGetFlags::default())?;
        let lsn = buf.read().lsn;
        self.mpool.put(&buf, MpoolPutFlags::default())?;
        Ok(lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::lock::LockManager;
    use crate::log::LogManager;
    use crate::txn::{TxnConfig, TxnManager};

    fn harness(page_size: usize) -> (tempfile::TempDir, BTree, Arc<TxnManager>) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = EnvConfig::default();
        cfg.page_size = page_size;
        let mpool = Arc::new(BufferPool::new(&cfg));
        let path = dir.path().join("t.db");
        let file = Arc::new(FilePool::new(&path, page_size).unwrap());
        let fid = Fid::generate();
        mpool.open_file(fid, file.clone());

        let log = Arc::new(LogManager::open(dir.path(), &cfg).unwrap());
        let lock = Arc::new(LockManager::new(&cfg));
        let txn_mgr = Arc::new(TxnManager::new(log, lock));
        txn_mgr.attach_mpool(mpool.clone());

        let bt = BTree::new(fid, mpool.clone(), file, page_size, false, false);
        let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();
        let meta_buf = mpool.get(fid, 0, MpoolGetFlags { create: true, ..Default::default() }).unwrap();
        let mut meta = MetaPage::new(page_size as u32, super::super::meta::DbType::Btree, Default::default(), fid);
        bt.init(&txn, &mut meta).unwrap();
        let bytes = meta.encode(page_size);
        meta_buf.write().bytes = bytes;
        mpool.put(&meta_buf, MpoolPutFlags { dirty: true, ..Default::default() }).unwrap();
        txn.commit().unwrap();

        (dir, bt, txn_mgr)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, bt, txn_mgr) = harness(4096);
        let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();
        bt.put(&txn, b"apple", b"red").unwrap();
        bt.put(&txn, b"banana", b"yellow").unwrap();
        assert_eq!(bt.get(&txn, b"apple").unwrap(), Some(b"red".to_vec()));
        assert_eq!(bt.get(&txn, b"banana").unwrap(), Some(b"yellow".to_vec()));
        assert_eq!(bt.get(&txn, b"cherry").unwrap(), None);
        txn.commit().unwrap();
    }

    #[test]
    fn many_inserts_force_a_split_and_stay_queryable() {
        let (_dir, bt, txn_mgr) = harness(256);
        let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();
        for i in 0..200u32 {
            let key = format!("k{:05}", i);
            bt.put(&txn, key.as_bytes(), b"v").unwrap();
        }
        for i in 0..200u32 {
            let key = format!("k{:05}", i);
            assert_eq!(bt.get(&txn, key.as_bytes()).unwrap(), Some(b"v".to_vec()));
        }
        txn.commit().unwrap();
    }

    #[test]
    fn delete_removes_key() {
        let (_dir, bt, txn_mgr) = harness(4096);
        let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();
        bt.put(&txn, b"k", b"v").unwrap();
        assert!(bt.del(&txn, b"k").unwrap());
        assert_eq!(bt.get(&txn, b"k").unwrap(), None);
        assert!(!bt.del(&txn, b"k").unwrap());
        txn.commit().unwrap();
    }

    #[test]
    fn overflow_value_round_trips() {
        let (_dir, bt, txn_mgr) = harness(256);
        let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();
        let big = vec![7u8; 500];
        bt.put(&txn, b"big", &big).unwrap();
        assert_eq!(bt.get(&txn, b"big").unwrap(), Some(big));
        txn.commit().unwrap();
    }

    #[test]
    fn truncate_frees_every_page_s6() {
        let (_dir, bt, txn_mgr) = harness(256);
        let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();
        for i in 0..100u32 {
            bt.put(&txn, format!("k{:05}", i).as_bytes(), b"v").unwrap();
        }
        let freed = bt.truncate(&txn).unwrap();
        assert!(freed > 1, "a multi-level tree frees more than just the root");
        assert_eq!(bt.get(&txn, b"k00000").unwrap(), None);
        txn.commit().unwrap();
    }

    #[test]
    fn first_and_next_walk_in_sorted_order() {
        let (_dir, bt, txn_mgr) = harness(256);
        let txn = txn_mgr.begin(None, TxnConfig::default()).unwrap();
        for i in [3, 1, 4, 1, 5, 9, 2, 6] {
            bt.put(&txn, format!("k{:02}", i).as_bytes(), b"v").unwrap();
        }
        let mut seen = Vec::new();
        let (k, _) = bt.first(&txn).unwrap().unwrap();
        seen.push(k.clone());
        let mut cur = k;
        while let Some((k, _)) = bt.next(&txn, &cur).unwrap() {
            seen.push(k.clone());
            cur = k;
        }
        let mut expected: Vec<Vec<u8>> = [1, 2, 3, 4, 5, 6, 9]
            .iter()
            .map(|i| format!("k{:02}", i).into_bytes())
            .collect();
        expected.sort();
        assert_eq!(seen, expected);
        txn.commit().unwrap();
    }
}
