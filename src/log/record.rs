//! Typed log records and their on-disk framing.
//!
//! Each record is a `u32` type tag followed by the transaction id, the
//! previous LSN for this transaction (for backward chaining during
//! undo), and a type-specific payload: page ALLOC/FREE (carrying the
//! free-list head and extend-flag state undo needs to relink exactly),
//! generic page-image UPDATE, file-open registration, and NEWFILE.

use crate::ids::{Fid, Lsn, Pgno};
use crate::serialize::{read_blob, Decodeable, Encodeable, Writer};
use std::io::Read;

/// Locker/transaction id as carried on the wire; reuses the lock
/// manager's `LockerId` space so transaction ids and log record owners
/// never need a separate namespace.
pub type TxnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum RecordTag {
    Begin = 0,
    Commit = 1,
    Abort = 2,
    Checkpoint = 3,
    Alloc = 4,
    Free = 5,
    Update = 6,
    FileOpen = 7,
    NewFile = 8,
    RecoveryDone = 9,
    Prepare = 10,
}

impl RecordTag {
    fn from_u32(v: u32) -> std::io::Result<Self> {
        Ok(match v {
            0 => RecordTag::Begin,
            1 => RecordTag::Commit,
            2 => RecordTag::Abort,
            3 => RecordTag::Checkpoint,
            4 => RecordTag::Alloc,
            5 => RecordTag::Free,
            6 => RecordTag::Update,
            7 => RecordTag::FileOpen,
            8 => RecordTag::NewFile,
            9 => RecordTag::RecoveryDone,
            10 => RecordTag::Prepare,
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown log record tag {}", other),
                ))
            }
        })
    }
}

/// Type-specific payload of a log record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    /// Emitted when a transaction begins. Writing this is deferred until
    /// the transaction's first actual write, so read-only transactions
    /// never touch the log.
    Begin,
    Commit,
    Abort,
    /// `active` pairs each still-open transaction with its first LSN;
    /// `open_files` pairs each registered fid with the name recovery
    /// should reopen it under.
    Checkpoint {
        active: Vec<(TxnId, Lsn)>,
        open_files: Vec<(Fid, String)>,
    },
    /// A page was pulled off (or the file was extended for) the free
    /// list. `old_free_head` is the free-list head before this
    /// allocation, so abort can relink it exactly.
    Alloc {
        fid: Fid,
        pgno: Pgno,
        old_free_head: Pgno,
        extended: bool,
        pre_extend_last_pgno: Pgno,
    },
    /// A page was returned to the free list. Carries the page's full
    /// pre-free image for undo.
    Free {
        fid: Fid,
        pgno: Pgno,
        old_free_head: Pgno,
        old_image: Vec<u8>,
    },
    /// A page's contents changed; carries enough of the before-image to
    /// undo and the after-image for redo.
    Update {
        fid: Fid,
        pgno: Pgno,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    /// Registers a fid -> file-system name mapping so recovery can
    /// rebuild the open-file table.
    FileOpen { fid: Fid, name: String },
    /// Marks that the remainder of the current log file is padding and
    /// the next record starts at offset zero of a new file.
    NewFile,
    RecoveryDone,
    /// Two-phase-commit prepare marker. A transaction left at PREPARE
    /// when the log ends is re-exposed by recovery rather than undone.
    Prepare,
}

impl RecordBody {
    fn tag(&self) -> RecordTag {
        match self {
            RecordBody::Begin => RecordTag::Begin,
            RecordBody::Commit => RecordTag::Commit,
            RecordBody::Abort => RecordTag::Abort,
            RecordBody::Checkpoint { .. } => RecordTag::Checkpoint,
            RecordBody::Alloc { .. } => RecordTag::Alloc,
            RecordBody::Free { .. } => RecordTag::Free,
            RecordBody::Update { .. } => RecordTag::Update,
            RecordBody::FileOpen { .. } => RecordTag::FileOpen,
            RecordBody::NewFile => RecordTag::NewFile,
            RecordBody::RecoveryDone => RecordTag::RecoveryDone,
            RecordBody::Prepare => RecordTag::Prepare,
        }
    }

    fn encode_payload(&self, w: &mut Writer) {
        match self {
            RecordBody::Begin
            | RecordBody::Commit
            | RecordBody::Abort
            | RecordBody::NewFile
            | RecordBody::RecoveryDone
            | RecordBody::Prepare => {}
            RecordBody::Checkpoint { active, open_files } => {
                w.write(&(active.len() as u32));
                for (txn, lsn) in active {
                    w.write(txn);
                    w.write(lsn);
                }
                w.write(&(open_files.len() as u32));
                for (fid, name) in open_files {
                    w.write(fid);
                    w.write_string(name);
                }
            }
            RecordBody::Alloc {
                fid,
                pgno,
                old_free_head,
                extended,
                pre_extend_last_pgno,
            } => {
                w.write(fid);
                w.write(pgno);
                w.write(old_free_head);
                w.write(extended);
                w.write(pre_extend_last_pgno);
            }
            RecordBody::Free {
                fid,
                pgno,
                old_free_head,
                old_image,
            } => {
                w.write(fid);
                w.write(pgno);
                w.write(old_free_head);
                w.write_blob(old_image);
            }
            RecordBody::Update {
                fid,
                pgno,
                before,
                after,
            } => {
                w.write(fid);
                w.write(pgno);
                w.write_blob(before);
                w.write_blob(after);
            }
            RecordBody::FileOpen { fid, name } => {
                w.write(fid);
                w.write_string(name);
            }
        }
    }

    fn decode_payload<R: Read>(tag: RecordTag, r: &mut R) -> std::io::Result<Self> {
        Ok(match tag {
            RecordTag::Begin => RecordBody::Begin,
            RecordTag::Commit => RecordBody::Commit,
            RecordTag::Abort => RecordBody::Abort,
            RecordTag::NewFile => RecordBody::NewFile,
            RecordTag::RecoveryDone => RecordBody::RecoveryDone,
            RecordTag::Prepare => RecordBody::Prepare,
            RecordTag::Checkpoint => {
                let n = u32::decode_from(r)?;
                let mut active = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    active.push((TxnId::decode_from(r)?, Lsn::decode_from(r)?));
                }
                let m = u32::decode_from(r)?;
                let mut open_files = Vec::with_capacity(m as usize);
                for _ in 0..m {
                    let fid = Fid::decode_from(r)?;
                    let name = crate::serialize::read_string(r)?;
                    open_files.push((fid, name));
                }
                RecordBody::Checkpoint { active, open_files }
            }
            RecordTag::Alloc => RecordBody::Alloc {
                fid: Fid::decode_from(r)?,
                pgno: Pgno::decode_from(r)?,
                old_free_head: Pgno::decode_from(r)?,
                extended: bool::decode_from(r)?,
                pre_extend_last_pgno: Pgno::decode_from(r)?,
            },
            RecordTag::Free => RecordBody::Free {
                fid: Fid::decode_from(r)?,
                pgno: Pgno::decode_from(r)?,
                old_free_head: Pgno::decode_from(r)?,
                old_image: read_blob(r)?,
            },
            RecordTag::Update => RecordBody::Update {
                fid: Fid::decode_from(r)?,
                pgno: Pgno::decode_from(r)?,
                before: read_blob(r)?,
                after: read_blob(r)?,
            },
            RecordTag::FileOpen => RecordBody::FileOpen {
                fid: Fid::decode_from(r)?,
                name: crate::serialize::read_string(r)?,
            },
        })
    }
}

/// A single log record, addressed by `lsn` once appended.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub body: RecordBody,
}

impl LogRecord {
    pub fn new(txn_id: TxnId, prev_lsn: Lsn, body: RecordBody) -> Self {
        Self {
            lsn: Lsn::ZERO,
            txn_id,
            prev_lsn,
            body,
        }
    }

    /// Encode the record's type/txn/prev-lsn/payload fields. The length
    /// prefix and checksum that frame this payload on disk are added
    /// separately by `LogManager::encode_framed`.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write(&(self.body.tag() as u32));
        w.write(&self.txn_id);
        w.write(&self.prev_lsn);
        self.body.encode_payload(&mut w);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> std::io::Result<Self> {
        let mut cursor = std::io::Cursor::new(bytes);
        let tag = RecordTag::from_u32(u32::decode_from(&mut cursor)?)?;
        let txn_id = TxnId::decode_from(&mut cursor)?;
        let prev_lsn = Lsn::decode_from(&mut cursor)?;
        let body = RecordBody::decode_payload(tag, &mut cursor)?;
        Ok(LogRecord {
            lsn: Lsn::ZERO,
            txn_id,
            prev_lsn,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_record_round_trips() {
        let rec = LogRecord::new(
            7,
            Lsn::new(1, 10),
            RecordBody::Update {
                fid: Fid::zero(),
                pgno: 3,
                before: vec![1, 2, 3],
                after: vec![4, 5, 6],
            },
        );
        let bytes = rec.encode();
        let back = LogRecord::decode(&bytes).unwrap();
        assert_eq!(rec.txn_id, back.txn_id);
        assert_eq!(rec.prev_lsn, back.prev_lsn);
        assert_eq!(rec.body, back.body);
    }

    #[test]
    fn checkpoint_record_round_trips() {
        let rec = LogRecord::new(
            0,
            Lsn::ZERO,
            RecordBody::Checkpoint {
                active: vec![(5, Lsn::new(1, 1)), (9, Lsn::new(1, 50))],
                open_files: vec![(Fid::zero(), "users.db".into())],
            },
        );
        let bytes = rec.encode();
        let back = LogRecord::decode(&bytes).unwrap();
        assert_eq!(rec.body, back.body);
    }
}
