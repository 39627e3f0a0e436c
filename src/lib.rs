//! `kvcore`: an embeddable, transactional, page-structured key/value
//! storage engine.
//!
//! Five layers, from the ground up, map onto this crate's top-level
//! modules:
//!
//!   - [`env`] — environment, region allocator, mutex service
//!   - [`mpool`] — buffer pool
//!   - [`lock`] — lock manager
//!   - [`log`], [`txn`] — log manager, transactions, recovery
//!   - [`access`] — B-tree, Hash, Queue access methods
//!
//! [`db`] and [`cursor`] compose one access method over the lower layers
//! behind a single [`db::Database`] handle and its [`cursor::Cursor`].

pub mod access;
pub mod config;
pub mod cursor;
pub mod db;
pub mod env;
pub mod error;
pub mod ids;
pub mod lock;
pub mod log;
pub mod mpool;
pub mod serialize;
pub mod txn;

pub use cursor::Cursor;
pub use db::{Database, DbConfig, DbTypeConfig};
pub use env::{Environment, OpenFlags};
pub use error::{DbError, DbResult};
pub use ids::{Fid, Lsn, Pgno};

/// Install a `tracing` subscriber reading `RUST_LOG` (or `kvcore=info`
/// if unset). Idempotent: later calls after the first are no-ops,
/// matching `tracing_subscriber`'s own global-default-already-set
/// behavior.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kvcore=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
