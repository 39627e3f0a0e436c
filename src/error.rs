//! Structured error kinds returned by every entry point in the crate.
//!
//! A tagged enum rather than a single string-message error so callers can
//! match on kind instead of parsing text.

use thiserror::Error;

/// One of the error kinds an entry point can return. `Ok` is represented
/// by `Result::Ok`, not a variant here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("invalid argument: {0}")]
    Inval(String),

    #[error("no such file or object: {0}")]
    NoEnt(String),

    #[error("operation would block")]
    Busy,

    #[error("key not found")]
    NotFound,

    #[error("record exists but is empty")]
    KeyEmpty,

    #[error("key already exists")]
    KeyExist,

    #[error("lock wait timed out")]
    LockTimeout,

    #[error("transaction wait timed out")]
    TxnTimeout,

    #[error("deadlock detected, transaction must abort")]
    Deadlock,

    #[error("environment requires recovery")]
    RunRecovery,

    #[error("lock not granted")]
    NotGranted,

    #[error("on-disk format is older than this build supports")]
    OldVersion,

    #[error("page failed integrity verification")]
    VerifyBad,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("allocator exhausted (region or disk)")]
    NoSpace,

    #[error("feature disabled at open time")]
    OpNotSup,

    #[error("no server available (client/server deployments only)")]
    NoServer,

    #[error("environment panic, entry points are disabled until the environment is re-created")]
    Panic,

    #[error("lock manager has no free locks/objects/lockers")]
    LockNotEnoughSpace,
}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        DbError::Io(e.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;
