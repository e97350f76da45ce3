use std::io;

use thiserror::Error;

/// Errors raised while validating [`crate::Options`] or opening an
/// [`crate::UpdateLog`].
///
/// These are fatal to shard startup: per the error taxonomy, configuration
/// errors are never retried, only refused.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("log directory {0:?} escapes the shard instance directory")]
    PathEscapesInstanceDir(std::path::PathBuf),

    #[error("tlog path {0:?} is already in use by another shard")]
    PathConflict(std::path::PathBuf),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Per-record corruption encountered while traversing a [`crate::log_file::LogFile`].
///
/// Mirrors the commitlog's `Traversal` error: a trailing corrupt record is
/// tolerated (the stream just stops), an interior one is surfaced here so the
/// caller (replay, `RecentUpdates::update`) can count it.
#[derive(Debug, Error)]
pub enum Traversal {
    #[error("out-of-order record: expected-offset={expected_offset} actual-offset={actual_offset}")]
    OutOfOrder { expected_offset: u64, actual_offset: u64 },

    #[error("failed to decode log record at offset={offset}")]
    Decode {
        offset: u64,
        #[source]
        source: DecodeError,
    },

    #[error("checksum mismatch at offset={offset}")]
    Checksum {
        offset: u64,
        #[source]
        source: ChecksumMismatch,
    },

    #[error("unknown op code {0}")]
    UnknownOpCode(u8),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A checksum mismatch was detected when decoding a [`crate::record::LogRecord`].
#[derive(Debug, Error)]
#[error("checksum mismatch")]
pub struct ChecksumMismatch;

/// Failure to decode the bytes of a record (truncated, malformed length prefix, etc).
#[derive(Debug, Error)]
#[error("malformed record: {0}")]
pub struct DecodeError(pub String);

/// An invariant of the update log was violated.
///
/// Per §7's "invariant violation" row: fatal to the *current* operation, not
/// to the shard. Callers should surface this to whoever issued the offending
/// command.
#[derive(Debug, Error)]
pub enum InvalidState {
    #[error("partial-update chain entry at offset={offset} is neither ADD nor IN_PLACE_UPDATE (op={op})")]
    NotAnUpdateChainLink { offset: u64, op: u8 },

    #[error("version at offset={offset} does not match expected version={expected} (found {found})")]
    VersionMismatch { offset: u64, expected: i64, found: i64 },
}

/// Error returned by [`crate::UpdateLog::add`] / `delete` / `delete_by_query`.
///
/// Retains the payload that failed to flush, mirroring the commitlog's
/// `error::Append<T>`, so a caller can retry without re-building the command.
#[derive(Debug, Error)]
#[error("failed to append to log")]
pub struct Append<T> {
    pub command: T,
    #[source]
    pub source: io::Error,
}

/// The update lock could not be acquired within [`crate::Options::doc_lock_timeout_ms`].
#[derive(Debug, Error)]
#[error("timed out waiting {timeout_ms}ms for the update lock")]
pub struct ServiceUnavailable {
    pub timeout_ms: u64,
}

/// Top-level error type surfaced by the public [`crate::UpdateLog`] API.
#[derive(Debug, Error)]
pub enum UpdateLogError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    InvalidState(#[from] InvalidState),

    #[error(transparent)]
    ServiceUnavailable(#[from] ServiceUnavailable),

    #[error(transparent)]
    Traversal(#[from] Traversal),

    #[error("unknown op code {0}: future or corrupt flags byte")]
    UnknownOpCode(u8),

    #[error(transparent)]
    Io(#[from] io::Error),
}
