//! Durable per-shard update log (ulog): an append-only transaction log paired
//! with an in-memory key index, backing near-real-time document lookups,
//! crash recovery, and peer-sync replication ahead of a search index commit.
//!
//! The crate is organized the way its SpacetimeDB `commitlog` ancestor is:
//! a small wire-format module ([`record`]), a refcounted file abstraction
//! ([`log_file`]), a storage backend trait ([`repo`]) with `Fs` and `Memory`
//! implementations, and the stateful pieces built on top of them
//! ([`key_index`], [`update_log`], [`replayer`], [`recent_updates`]).

#![allow(unused)]

use std::num::NonZeroUsize;
use std::path::PathBuf;

pub mod dbq;
pub mod document;
pub mod error;
pub mod key_index;
pub mod locks;
pub mod log_file;
pub mod metrics;
pub mod old_deletes;
pub mod record;
pub mod recent_updates;
pub mod repo;
pub mod replayer;
pub mod update_log;

pub use crate::document::Document;
pub use crate::error::UpdateLogError;
pub use crate::log_file::{LogFile, SyncLevel, WeakLogFile};
pub use crate::record::LogRecord;
pub use crate::update_log::{State, UpdateLog};

/// [`UpdateLog`] configuration. A flat struct with a `Default` impl, in the
/// teacher's own style (see `commitlog::Options` in `lib.rs`): no builder
/// macro, validated once at [`UpdateLog::open`].
#[derive(Clone, Debug)]
pub struct Options {
    /// Directory holding the log files. Relative paths are resolved against
    /// the shard instance directory and must not escape it — see
    /// [`error::ConfigError::PathEscapesInstanceDir`].
    pub dir: PathBuf,

    /// Flush/fsync policy applied after every [`LogFile::append`].
    ///
    /// Default: [`SyncLevel::Flush`].
    pub sync_level: SyncLevel,

    /// Target number of records to retain across `old_logs` after a commit.
    ///
    /// Default: 100.
    pub num_records_to_keep: usize,

    /// Hard cap on the number of retained log files, regardless of
    /// `num_records_to_keep`.
    ///
    /// Default: 10.
    pub max_num_logs_to_keep: NonZeroUsize,

    /// Milliseconds [`locks::UpdateLocks`] will wait for the update lock
    /// before returning [`error::ServiceUnavailable`]. `0` means "no
    /// timeout" (wait forever).
    ///
    /// Default: 0.
    pub doc_lock_timeout_ms: u64,

    /// Size, in bytes, past which the active log is rotated even without an
    /// explicit commit — mirrors the teacher's `max_segment_size`, applied
    /// here as a safety valve on top of the record-count retention rule.
    ///
    /// Default: 1 GiB.
    pub max_log_file_size: u64,

    /// Accepted for backward compatibility; logged as obsolete and otherwise
    /// ignored.
    pub num_version_buckets: Option<u32>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            sync_level: SyncLevel::Flush,
            num_records_to_keep: 100,
            max_num_logs_to_keep: NonZeroUsize::new(10).unwrap(),
            doc_lock_timeout_ms: 0,
            max_log_file_size: 1024 * 1024 * 1024,
            num_version_buckets: None,
        }
    }
}

impl Options {
    /// Validate configuration that can be checked without touching the
    /// filesystem. Filesystem-dependent checks (path-escapes-instance-dir,
    /// path-conflict) happen in [`UpdateLog::open`], which has the instance
    /// directory and the directory-factory handle in scope.
    pub fn validate(&self) -> Result<(), error::ConfigError> {
        if let Some(n) = self.num_version_buckets {
            log::warn!("numVersionBuckets={n} is obsolete and ignored");
        }
        Ok(())
    }
}

/// Install an `env_logger` subscriber for test output, the way the teacher's
/// `tests/helpers.rs` does. Safe to call from every test in a process: the
/// underlying `try_init` is idempotent.
#[cfg(feature = "test")]
pub fn enable_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
