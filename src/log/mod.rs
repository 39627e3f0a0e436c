//! Log Manager: durable, append-only, segmented write-ahead log.
//!
//! Records are appended to `log.NNNNNNNNNN`-named segment files with a
//! NEWFILE rollover marker once a segment fills, each record framed
//! with a length prefix and a CRC32 checksum (`crc32fast`). A
//! `durable_through` watermark, advanced by `flush`, is consumed by
//! [`crate::mpool::BufferPool::sync`] to enforce the write-ahead
//! invariant: no dirty page may reach disk before the log record that
//! describes it is durable.

pub mod record;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::config::EnvConfig;
use crate::error::{DbError, DbResult};
use crate::ids::{Fid, Lsn};
use crate::serialize::{Decodeable, Encodeable};

pub use record::{LogRecord, RecordBody, TxnId};

const MAGIC: u32 = 0x4B56_4C47; // "KVLG"
const VERSION: u32 = 1;
/// magic(4) + version(4) + file-number(4).
const HEADER_LEN: u32 = 12;
/// length(4) + checksum(4) prefix on every framed record.
const FRAME_PREFIX_LEN: u32 = 8;

fn log_file_name(num: u32) -> String {
    format!("log.{:010}", num)
}

fn log_file_path(dir: &Path, num: u32) -> PathBuf {
    dir.join(log_file_name(num))
}

/// Highest existing `log.NNNNNNNNNN` file number in `dir`, or `None` if
/// the directory holds no log files yet.
fn highest_existing_file_number(dir: &Path) -> DbResult<Option<u32>> {
    let mut max = None;
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(suffix) = name.strip_prefix("log.") {
                if let Ok(num) = suffix.parse::<u32>() {
                    max = Some(max.map_or(num, |m: u32| m.max(num)));
                }
            }
        }
    }
    Ok(max)
}

struct LogFileState {
    num: u32,
    file: File,
    offset: u32,
}

impl LogFileState {
    fn create(dir: &Path, num: u32) -> DbResult<Self> {
        let path = log_file_path(dir, num);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.write_all(&MAGIC.encode())?;
        file.write_all(&VERSION.encode())?;
        file.write_all(&num.encode())?;
        file.sync_all()?;
        Ok(Self {
            num,
            file,
            offset: HEADER_LEN,
        })
    }

    fn open_existing(dir: &Path, num: u32) -> DbResult<Self> {
        let path = log_file_path(dir, num);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        let mut cursor = std::io::Cursor::new(&header[..]);
        let magic = u32::decode_from(&mut cursor)?;
        if magic != MAGIC {
            return Err(DbError::VerifyBad);
        }
        let _version = u32::decode_from(&mut cursor)?;
        let file_num = u32::decode_from(&mut cursor)?;
        if file_num != num {
            return Err(DbError::VerifyBad);
        }
        let end = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            num,
            file,
            offset: end as u32,
        })
    }
}

/// Per-transaction bookkeeping the log manager needs to build
/// CHECKPOINT records: the LSN of the transaction's first log record.
struct ActiveTxn {
    first_lsn: Lsn,
}

/// Appends, reads back, and rotates the write-ahead log. One
/// [`LogManager`] is owned by the [`crate::env::Environment`] it
/// belongs to.
pub struct LogManager {
    dir: PathBuf,
    file_max: u64,
    state: Mutex<LogFileState>,
    durable_through: Mutex<Lsn>,
    active_txns: RwLock<HashMap<TxnId, ActiveTxn>>,
    open_files: RwLock<HashMap<Fid, String>>,
    autoremove: bool,
}

impl LogManager {
    /// Open (or create) the log directory's segment files. Resumes
    /// appending at the end of the highest numbered existing segment,
    /// or creates segment 1 if none exist.
    pub fn open(home: &Path, config: &EnvConfig) -> DbResult<Self> {
        let dir = config.log_dir.clone().unwrap_or_else(|| home.to_path_buf());
        fs::create_dir_all(&dir)?;
        let state = match highest_existing_file_number(&dir)? {
            Some(num) => LogFileState::open_existing(&dir, num)?,
            None => LogFileState::create(&dir, 1)?,
        };
        let durable = Lsn::new(state.num, state.offset);
        Ok(Self {
            dir,
            file_max: config.log_file_max,
            state: Mutex::new(state),
            durable_through: Mutex::new(durable),
            active_txns: RwLock::new(HashMap::new()),
            open_files: RwLock::new(HashMap::new()),
            autoremove: config.flags.log_autoremove,
        })
    }

    fn encode_framed(record: &LogRecord) -> Vec<u8> {
        let body = record.encode();
        let checksum = crc32fast::hash(&body);
        let mut framed = Vec::with_capacity(FRAME_PREFIX_LEN as usize + body.len());
        framed.extend_from_slice(&(body.len() as u32).encode());
        framed.extend_from_slice(&checksum.encode());
        framed.extend_from_slice(&body);
        framed
    }

    /// Append `body` to the log and return the LSN it was written at.
    /// Rolls to a new segment first if `body` would not fit within
    /// `log_file_max`.
    pub fn put(&self, txn_id: TxnId, prev_lsn: Lsn, body: RecordBody) -> DbResult<Lsn> {
        let mut record = LogRecord::new(txn_id, prev_lsn, body);
        let framed = Self::encode_framed(&record);
        let needed = framed.len() as u64;

        let mut state = self.state.lock();
        if (state.offset as u64) + needed > self.file_max {
            Self::roll_locked(&mut state, &self.dir)?;
        }
        let lsn = Lsn::new(state.num, state.offset);
        state.file.seek(SeekFrom::Start(state.offset as u64))?;
        state.file.write_all(&framed)?;
        state.offset += framed.len() as u32;
        record.lsn = lsn;
        drop(state);

        if txn_id != 0 {
            self.active_txns
                .write()
                .entry(txn_id)
                .or_insert(ActiveTxn { first_lsn: lsn });
        }
        Ok(lsn)
    }

    /// Write a NEWFILE marker, padding out the rest of the current
    /// segment, then start the next one.
    pub fn newfile(&self) -> DbResult<()> {
        let mut state = self.state.lock();
        Self::roll_locked(&mut state, &self.dir)
    }

    fn roll_locked(state: &mut LogFileState, dir: &Path) -> DbResult<()> {
        let marker = LogRecord::new(0, Lsn::new(state.num, state.offset), RecordBody::NewFile);
        let framed = Self::encode_framed(&marker);
        state.file.seek(SeekFrom::Start(state.offset as u64))?;
        state.file.write_all(&framed)?;
        state.file.sync_all()?;

        let next_num = state.num + 1;
        *state = LogFileState::create(dir, next_num)?;
        Ok(())
    }

    /// Force the current segment file to stable storage and advance the
    /// durable-through watermark to the current tail. `upto` names the
    /// caller's required LSN but is not used to limit what gets synced:
    /// there is no partial-file fsync here, so every call flushes the
    /// whole current segment regardless of `upto`.
    pub fn flush(&self, _upto: Option<Lsn>) -> DbResult<Lsn> {
        let state = self.state.lock();
        state.file.sync_all()?;
        let tail = Lsn::new(state.num, state.offset);
        drop(state);

        let mut watermark = self.durable_through.lock();
        if tail > *watermark {
            *watermark = tail;
        }
        Ok(*watermark)
    }

    /// Current durable-through watermark: no dirty page may be written
    /// to its data file until its LSN is <= this value.
    pub fn durable_lsn(&self) -> Lsn {
        *self.durable_through.lock()
    }

    pub fn note_txn_commit_or_abort(&self, txn_id: TxnId) {
        self.active_txns.write().remove(&txn_id);
    }

    pub fn register_file(&self, fid: Fid, name: &str) -> DbResult<Lsn> {
        self.open_files.write().insert(fid, name.to_string());
        self.put(0, Lsn::ZERO, RecordBody::FileOpen { fid, name: name.to_string() })
    }

    pub fn unregister_file(&self, fid: &Fid) {
        self.open_files.write().remove(fid);
    }

    /// Build and append a CHECKPOINT record summarizing currently open
    /// transactions and files.
    pub fn checkpoint(&self) -> DbResult<Lsn> {
        let active: Vec<(TxnId, Lsn)> = self
            .active_txns
            .read()
            .iter()
            .map(|(id, t)| (*id, t.first_lsn))
            .collect();
        let open_files: Vec<(Fid, String)> = self
            .open_files
            .read()
            .iter()
            .map(|(fid, name)| (*fid, name.clone()))
            .collect();
        let lsn = self.put(0, Lsn::ZERO, RecordBody::Checkpoint { active, open_files })?;
        self.flush(Some(lsn))?;
        if self.autoremove {
            self.remove_files_before(lsn.file);
        }
        Ok(lsn)
    }

    fn remove_files_before(&self, keep_from: u32) {
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(suffix) = name.strip_prefix("log.") {
                    if let Ok(num) = suffix.parse::<u32>() {
                        if num < keep_from {
                            let _ = fs::remove_file(entry.path());
                        }
                    }
                }
            }
        }
    }

    /// Open a forward cursor iterating log records from `from`
    /// forward. Used by recovery to replay the log.
    pub fn cursor(&self, from: Lsn) -> DbResult<LogCursor> {
        let start_num = if from.is_zero() { 1 } else { from.file };
        LogCursor::new(self.dir.clone(), start_num, from.offset.max(HEADER_LEN))
    }

    pub fn oldest_active_lsn(&self) -> Option<Lsn> {
        self.active_txns
            .read()
            .values()
            .map(|t| t.first_lsn)
            .min()
    }
}

/// Forward iterator over log records across segment files.
pub struct LogCursor {
    dir: PathBuf,
    file: Option<File>,
    num: u32,
    offset: u32,
}

impl LogCursor {
    fn new(dir: PathBuf, start_num: u32, start_offset: u32) -> DbResult<Self> {
        let path = log_file_path(&dir, start_num);
        let file = if path.exists() {
            let mut f = File::open(&path)?;
            f.seek(SeekFrom::Start(start_offset as u64))?;
            Some(f)
        } else {
            None
        };
        Ok(Self {
            dir,
            file,
            num: start_num,
            offset: start_offset,
        })
    }

    fn advance_file(&mut self) -> DbResult<bool> {
        self.num += 1;
        let path = log_file_path(&self.dir, self.num);
        if !path.exists() {
            self.file = None;
            return Ok(false);
        }
        let mut f = File::open(&path)?;
        f.seek(SeekFrom::Start(HEADER_LEN as u64))?;
        self.offset = HEADER_LEN;
        self.file = Some(f);
        Ok(true)
    }

    /// Read the next record, or `None` at end of the log. A NEWFILE
    /// marker is consumed transparently and the cursor moves on to the
    /// next segment.
    pub fn next_record(&mut self) -> DbResult<Option<LogRecord>> {
        loop {
            let file = match self.file.as_mut() {
                Some(f) => f,
                None => return Ok(None),
            };
            let mut len_buf = [0u8; 4];
            if file.read_exact(&mut len_buf).is_err() {
                if !self.advance_file()? {
                    return Ok(None);
                }
                continue;
            }
            let len = u32::from_le_bytes(len_buf);
            let mut checksum_buf = [0u8; 4];
            file.read_exact(&mut checksum_buf)
                .map_err(|e| DbError::Io(format!("truncated log record checksum: {}", e)))?;
            let checksum = u32::from_le_bytes(checksum_buf);
            let mut body = vec![0u8; len as usize];
            file.read_exact(&mut body)
                .map_err(|e| DbError::Io(format!("truncated log record body: {}", e)))?;
            if crc32fast::hash(&body) != checksum {
                return Err(DbError::VerifyBad);
            }
            let lsn = Lsn::new(self.num, self.offset);
            self.offset += FRAME_PREFIX_LEN + len;

            let mut record = LogRecord::decode(&body)?;
            record.lsn = lsn;
            if matches!(record.body, RecordBody::NewFile) {
                if !self.advance_file()? {
                    return Ok(None);
                }
                continue;
            }
            return Ok(Some(record));
        }
    }
}

impl Iterator for LogCursor {
    type Item = DbResult<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(rec)) => Some(Ok(rec)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;

    fn test_config(dir: &Path) -> EnvConfig {
        let mut cfg = EnvConfig::default();
        cfg.log_dir = Some(dir.to_path_buf());
        cfg.log_file_max = 256;
        cfg
    }

    #[test]
    fn put_then_cursor_replays_records() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let lm = LogManager::open(dir.path(), &cfg).unwrap();

        let lsn1 = lm
            .put(1, Lsn::ZERO, RecordBody::Begin)
            .unwrap();
        let lsn2 = lm
            .put(
                1,
                lsn1,
                RecordBody::Update {
                    fid: Fid::zero(),
                    pgno: 1,
                    before: vec![0; 4],
                    after: vec![1; 4],
                },
            )
            .unwrap();
        assert!(lsn2 > lsn1);

        let mut cursor = lm.cursor(Lsn::ZERO).unwrap();
        let first = cursor.next_record().unwrap().unwrap();
        assert_eq!(first.body, RecordBody::Begin);
        let second = cursor.next_record().unwrap().unwrap();
        assert!(matches!(second.body, RecordBody::Update { .. }));
        assert!(cursor.next_record().unwrap().is_none());
    }

    #[test]
    fn rolls_to_new_segment_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let lm = LogManager::open(dir.path(), &cfg).unwrap();

        let mut last_lsn = Lsn::ZERO;
        for _ in 0..20 {
            last_lsn = lm
                .put(
                    1,
                    last_lsn,
                    RecordBody::Update {
                        fid: Fid::zero(),
                        pgno: 1,
                        before: vec![0; 8],
                        after: vec![1; 8],
                    },
                )
                .unwrap();
        }
        assert!(last_lsn.file > 1, "expected at least one rollover");
        assert!(log_file_path(dir.path(), 1).exists());
        assert!(log_file_path(dir.path(), last_lsn.file).exists());
    }

    #[test]
    fn flush_advances_durable_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let lm = LogManager::open(dir.path(), &cfg).unwrap();
        assert_eq!(lm.durable_lsn(), Lsn::new(1, HEADER_LEN));
        let lsn = lm.put(1, Lsn::ZERO, RecordBody::Begin).unwrap();
        lm.flush(Some(lsn)).unwrap();
        assert!(lm.durable_lsn() >= lsn);
    }

    #[test]
    fn checkpoint_records_active_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let lm = LogManager::open(dir.path(), &cfg).unwrap();
        let begin = lm.put(3, Lsn::ZERO, RecordBody::Begin).unwrap();
        lm.checkpoint().unwrap();

        let mut cursor = lm.cursor(Lsn::ZERO).unwrap();
        let _ = cursor.next_record().unwrap().unwrap(); // BEGIN
        let ckpt = cursor.next_record().unwrap().unwrap();
        match ckpt.body {
            RecordBody::Checkpoint { active, .. } => {
                assert_eq!(active, vec![(3, begin)]);
            }
            other => panic!("expected checkpoint, got {:?}", other),
        }
    }
}
