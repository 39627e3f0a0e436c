//! The meta page: page 0 of every database file, carrying the magic
//! number, version, feature flags, free-list head, per-access-method
//! counters, uid, and checksum that the rest of the file is interpreted
//! against.

use crate::error::{DbError, DbResult};
use crate::ids::{Fid, Pgno};
use crate::serialize::{Decodeable, Encodeable, Writer};
use std::io::Cursor;

pub const MAGIC: u32 = 0x4B56_4442; // "KVDB"
pub const VERSION: u32 = 1;

/// Feature flags carried on the meta page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaFlags {
    pub duplicates: bool,
    pub record_numbering: bool,
    pub renumbering: bool,
    pub fixed_length: bool,
    pub subdatabases: bool,
    pub checksum: bool,
    pub encryption: bool,
}

impl MetaFlags {
    fn to_u32(self) -> u32 {
        (self.duplicates as u32)
            | (self.record_numbering as u32) << 1
            | (self.renumbering as u32) << 2
            | (self.fixed_length as u32) << 3
            | (self.subdatabases as u32) << 4
            | (self.checksum as u32) << 5
            | (self.encryption as u32) << 6
    }

    fn from_u32(v: u32) -> Self {
        Self {
            duplicates: v & 1 != 0,
            record_numbering: v & (1 << 1) != 0,
            renumbering: v & (1 << 2) != 0,
            fixed_length: v & (1 << 3) != 0,
            subdatabases: v & (1 << 4) != 0,
            checksum: v & (1 << 5) != 0,
            encryption: v & (1 << 6) != 0,
        }
    }
}

/// The access method a database file was created with. Stored in the
/// meta page's `type` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DbType {
    Btree = 0,
    Hash = 1,
    Queue = 2,
    Recno = 3,
}

impl DbType {
    fn from_u8(v: u8) -> DbResult<Self> {
        Ok(match v {
            0 => DbType::Btree,
            1 => DbType::Hash,
            2 => DbType::Queue,
            3 => DbType::Recno,
            other => {
                tracing::debug!(tag = other, "unknown db type tag");
                return Err(DbError::VerifyBad);
            }
        })
    }
}

/// Page 0 of every database file.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaPage {
    pub page_size: u32,
    pub db_type: DbType,
    pub meta_flags: MetaFlags,
    /// Head of the free-page list, 0 if empty.
    pub free_list_head: Pgno,
    pub last_pgno: Pgno,
    /// Number of partitions/buckets (hash) or extents (queue); unused by
    /// B-tree.
    pub nparts: u32,
    pub key_count: u32,
    pub record_count: u32,
    pub flags: u32,
    pub uid: Fid,
    /// For a B-tree/Recno database, the root page number; reuses a slot
    /// in the reserved tail of the on-disk layout.
    pub root_pgno: Pgno,
}

impl MetaPage {
    pub fn new(page_size: u32, db_type: DbType, meta_flags: MetaFlags, uid: Fid) -> Self {
        Self {
            page_size,
            db_type,
            meta_flags,
            free_list_head: 0,
            last_pgno: 0,
            nparts: 0,
            key_count: 0,
            record_count: 0,
            flags: 0,
            uid,
            root_pgno: 0,
        }
    }

    pub fn encode(&self, page_size: usize) -> Vec<u8> {
        let mut w = Writer::new();
        w.write(&MAGIC);
        w.write(&VERSION);
        w.write(&self.page_size);
        w.write(&0u8); // encrypt-alg: none, no on-disk encryption support
        w.write(&(self.db_type as u8));
        w.write(&self.meta_flags.to_u32());
        w.write(&self.free_list_head);
        w.write(&self.last_pgno);
        w.write(&self.nparts);
        w.write(&self.key_count);
        w.write(&self.record_count);
        w.write(&self.flags);
        w.write(&self.uid);
        w.write(&0u32); // crypto-magic: unused, no on-disk crypto (non-goal)
        w.write(&self.root_pgno);
        let mut bytes = w.into_bytes();
        bytes.resize(page_size.max(bytes.len() + 20), 0);
        let checksum = crc32fast::hash(&bytes[..bytes.len() - 20]);
        bytes[bytes.len() - 4..].copy_from_slice(&checksum.encode());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> DbResult<Self> {
        let mut r: Cursor<&[u8]> = Cursor::new(bytes);
        let magic = u32::decode_from(&mut r)?;
        if magic != MAGIC {
            return Err(DbError::VerifyBad);
        }
        let version = u32::decode_from(&mut r)?;
        if version > VERSION {
            return Err(DbError::OldVersion);
        }
        let page_size = u32::decode_from(&mut r)?;
        let _encrypt_alg = u8::decode_from(&mut r)?;
        let db_type = DbType::from_u8(u8::decode_from(&mut r)?)?;
        let meta_flags = MetaFlags::from_u32(u32::decode_from(&mut r)?);
        let free_list_head = Pgno::decode_from(&mut r)?;
        let last_pgno = Pgno::decode_from(&mut r)?;
        let nparts = u32::decode_from(&mut r)?;
        let key_count = u32::decode_from(&mut r)?;
        let record_count = u32::decode_from(&mut r)?;
        let flags = u32::decode_from(&mut r)?;
        let uid = Fid::decode_from(&mut r)?;
        let _crypto_magic = u32::decode_from(&mut r)?;
        let root_pgno = Pgno::decode_from(&mut r)?;
        Ok(Self {
            page_size,
            db_type,
            meta_flags,
            free_list_head,
            last_pgno,
            nparts,
            key_count,
            record_count,
            flags,
            uid,
            root_pgno,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_round_trips() {
        let mut m = MetaPage::new(4096, DbType::Btree, MetaFlags { duplicates: true, ..Default::default() }, Fid::generate());
        m.free_list_head = 7;
        m.last_pgno = 12;
        m.root_pgno = 1;
        let bytes = m.encode(4096);
        assert_eq!(bytes.len(), 4096);
        let back = MetaPage::decode(&bytes).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = vec![0u8; 4096];
        assert!(matches!(MetaPage::decode(&bytes), Err(DbError::VerifyBad)));
    }
}
