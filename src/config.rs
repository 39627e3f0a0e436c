//! The recognized configuration option set, read from a TOML file or
//! built programmatically with `EnvConfig::default()`.

use serde::Deserialize;
use std::path::PathBuf;

use crate::error::DbError;
use crate::lock::deadlock::DetectPolicy;

/// Flags accepted by `EnvConfig::flags`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EnvFlags {
    pub auto_commit: bool,
    pub cdb_alldb: bool,
    pub direct_db: bool,
    pub direct_log: bool,
    pub dsync_db: bool,
    pub dsync_log: bool,
    pub log_autoremove: bool,
    pub log_inmemory: bool,
    pub multiversion: bool,
    pub nolocking: bool,
    pub nommap: bool,
    pub nopanic: bool,
    pub overwrite: bool,
    pub region_init: bool,
    pub txn_nosync: bool,
    pub txn_nowait: bool,
    pub txn_snapshot: bool,
    pub yieldcpu: bool,
}

fn default_cache_size() -> usize {
    8 * 1024 * 1024
}
fn default_cache_count() -> usize {
    0
}
fn default_log_buffer_size() -> usize {
    32 * 1024
}
fn default_log_file_max() -> u64 {
    10 * 1024 * 1024
}
fn default_log_file_mode() -> u32 {
    0o600
}
fn default_page_size() -> usize {
    4096
}
fn default_lock_timeout_micros() -> u64 {
    0
}
fn default_txn_timeout_micros() -> u64 {
    0
}
fn default_lk_max_locks() -> u32 {
    1000
}
fn default_lk_max_lockers() -> u32 {
    1000
}
fn default_lk_max_objects() -> u32 {
    1000
}
fn default_lk_detect() -> DetectPolicy {
    DetectPolicy::Default
}

/// `EnvConfig` is the parsed form of the recognized option set. Unknown
/// keys fail deserialization with `DbError::Inval` rather than being
/// silently ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvConfig {
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_cache_count")]
    pub cache_count: usize,
    #[serde(default = "default_log_buffer_size")]
    pub log_buffer_size: usize,
    #[serde(default = "default_log_file_max")]
    pub log_file_max: u64,
    #[serde(default = "default_log_file_mode")]
    pub log_file_mode: u32,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_lock_timeout_micros")]
    pub lock_timeout_micros: u64,
    #[serde(default = "default_txn_timeout_micros")]
    pub txn_timeout_micros: u64,
    #[serde(default = "default_lk_max_locks")]
    pub lk_max_locks: u32,
    #[serde(default = "default_lk_max_lockers")]
    pub lk_max_lockers: u32,
    #[serde(default = "default_lk_max_objects")]
    pub lk_max_objects: u32,
    #[serde(default = "default_lk_detect")]
    pub lk_detect: DetectPolicy,
    #[serde(default)]
    pub flags: EnvFlags,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
            cache_count: default_cache_count(),
            log_buffer_size: default_log_buffer_size(),
            log_file_max: default_log_file_max(),
            log_file_mode: default_log_file_mode(),
            log_dir: None,
            data_dir: None,
            tmp_dir: None,
            page_size: default_page_size(),
            lock_timeout_micros: default_lock_timeout_micros(),
            txn_timeout_micros: default_txn_timeout_micros(),
            lk_max_locks: default_lk_max_locks(),
            lk_max_lockers: default_lk_max_lockers(),
            lk_max_objects: default_lk_max_objects(),
            lk_detect: default_lk_detect(),
            flags: EnvFlags::default(),
        }
    }
}

impl EnvConfig {
    /// Parse a configuration text file. Unrecognized keys are rejected
    /// with `DbError::Inval` by `#[serde(deny_unknown_fields)]`.
    pub fn from_toml_str(text: &str) -> Result<Self, DbError> {
        toml::from_str(text).map_err(|e| DbError::Inval(e.to_string()))
    }

    /// `page_size` must be a power of two in [512, 65536].
    pub fn validate(&self) -> Result<(), DbError> {
        if !self.page_size.is_power_of_two() || self.page_size < 512 || self.page_size > 65536 {
            return Err(DbError::Inval(format!(
                "page_size must be a power of two in [512, 65536], got {}",
                self.page_size
            )));
        }
        Ok(())
    }
}
