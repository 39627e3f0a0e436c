//! The page header every non-meta page begins with: an LSN, links to
//! neighboring pages, the page's type tag, and the bookkeeping a page-level
//! access method needs to manage its free space.

use crate::ids::{Lsn, Pgno};
use crate::serialize::{Decodeable, Encodeable, Writer};
use std::io::{Cursor, Read};

/// Page type tag. `Invalid` marks a page on the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Meta = 0,
    BtreeInternal = 1,
    BtreeLeaf = 2,
    RecnoInternal = 3,
    RecnoLeaf = 4,
    Duplicate = 5,
    Overflow = 6,
    HashBucket = 7,
    HashOverflow = 8,
    QueueMeta = 9,
    QueueData = 10,
    Invalid = 11,
}

impl PageType {
    pub fn from_u8(v: u8) -> std::io::Result<Self> {
        Ok(match v {
            0 => PageType::Meta,
            1 => PageType::BtreeInternal,
            2 => PageType::BtreeLeaf,
            3 => PageType::RecnoInternal,
            4 => PageType::RecnoLeaf,
            5 => PageType::Duplicate,
            6 => PageType::Overflow,
            7 => PageType::HashBucket,
            8 => PageType::HashOverflow,
            9 => PageType::QueueMeta,
            10 => PageType::QueueData,
            11 => PageType::Invalid,
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown page type tag {}", other),
                ))
            }
        })
    }
}

/// Byte length of the encoded header: lsn(8) + pgno(4) + prev(4) +
/// next(4) + entries(2) + high_free_offset(2) + level(1) + type(1).
pub const HEADER_LEN: usize = 8 + 4 + 4 + 4 + 2 + 2 + 1 + 1;

/// The fixed header every non-meta page carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub lsn: Lsn,
    pub pgno: Pgno,
    pub prev_pgno: Pgno,
    pub next_pgno: Pgno,
    pub entries: u16,
    pub high_free_offset: u16,
    pub level: u8,
    pub page_type: PageType,
}

impl PageHeader {
    pub fn invalid(pgno: Pgno, next_pgno: Pgno) -> Self {
        Self {
            lsn: Lsn::ZERO,
            pgno,
            prev_pgno: 0,
            next_pgno,
            entries: 0,
            high_free_offset: 0,
            level: 0,
            page_type: PageType::Invalid,
        }
    }

    pub fn new(pgno: Pgno, page_type: PageType) -> Self {
        Self {
            lsn: Lsn::ZERO,
            pgno,
            prev_pgno: 0,
            next_pgno: 0,
            entries: 0,
            high_free_offset: 0,
            level: 0,
            page_type,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write(&self.lsn);
        w.write(&self.pgno);
        w.write(&self.prev_pgno);
        w.write(&self.next_pgno);
        w.write(&self.entries);
        w.write(&self.high_free_offset);
        w.write(&self.level);
        w.write(&(self.page_type as u8));
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> std::io::Result<Self> {
        let mut r: Cursor<&[u8]> = Cursor::new(bytes);
        Self::decode_from(&mut r)
    }

    pub fn decode_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            lsn: Lsn::decode_from(r)?,
            pgno: Pgno::decode_from(r)?,
            prev_pgno: Pgno::decode_from(r)?,
            next_pgno: Pgno::decode_from(r)?,
            entries: u16::decode_from(r)?,
            high_free_offset: u16::decode_from(r)?,
            level: u8::decode_from(r)?,
            page_type: PageType::from_u8(u8::decode_from(r)?)?,
        })
    }

    /// Overwrite a page's header in-place within its full byte buffer;
    /// the payload region past `HEADER_LEN` is left untouched.
    pub fn write_into(&self, page: &mut [u8]) {
        let bytes = self.encode();
        page[..bytes.len()].copy_from_slice(&bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = PageHeader {
            lsn: Lsn::new(2, 48),
            pgno: 5,
            prev_pgno: 4,
            next_pgno: 6,
            entries: 12,
            high_free_offset: 200,
            level: 0,
            page_type: PageType::BtreeLeaf,
        };
        let bytes = h.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        let back = PageHeader::decode(&bytes).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn write_into_preserves_payload_tail() {
        let mut page = vec![0xAAu8; 64];
        let h = PageHeader::new(3, PageType::BtreeLeaf);
        h.write_into(&mut page);
        assert_eq!(&page[HEADER_LEN..], &vec![0xAAu8; 64 - HEADER_LEN][..]);
    }
}
