//! Replays a log's uncommitted tail through the normal ingest path (§4.3).
//!
//! Two call sites feed this: [`crate::UpdateLog::recover`] (startup, stale
//! current tlog plus any leftover buffer logs from an interrupted recovery)
//! and [`crate::UpdateLog::apply_buffered_updates`] (leader-failover,
//! draining the live `buffer_tlog`). Both route through the same
//! `replay_buffer_into_live`/`replay_stale` machinery; what differs is
//! whether the finishing phase (block updates, drain stragglers) applies.
//!
//! The teacher crate funnels appends through a single writer path guarded by
//! its own commit lock (see `commitlog.rs`'s `CommitLog::append`); this
//! module takes the same "serialize what must be serialized, nothing more"
//! shape, generalized to the spec's per-id ordered executor: records for the
//! same id are serialized, records for different ids run in parallel on
//! scoped worker threads, and a DBQ waits for quiescence of everything ahead
//! of it before running inline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::UpdateLogError;
use crate::log_file::LogFile;
use crate::record::LogRecord;
use crate::repo::Repo;
use crate::update_log::{AddCmd, DeleteByQueryCmd, DeleteCmd, UpdateLog};

/// Outcome of a single replay pass (§4.3 "Recovery info").
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecoveryInfo {
    pub adds: u64,
    pub deletes: u64,
    pub delete_by_query: u64,
    pub errors: u64,
    pub failed: bool,
    pub start_offset: u64,
}

impl RecoveryInfo {
    fn merge(&mut self, other: RecoveryInfo) {
        self.adds += other.adds;
        self.deletes += other.deletes;
        self.delete_by_query += other.delete_by_query;
        self.errors += other.errors;
        self.failed |= other.failed;
    }
}

#[derive(Default)]
struct Counters {
    adds: AtomicU64,
    deletes: AtomicU64,
    delete_by_query: AtomicU64,
    errors: AtomicU64,
    failed: AtomicBool,
}

impl Counters {
    fn into_info(self, start_offset: u64) -> RecoveryInfo {
        RecoveryInfo {
            adds: self.adds.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            delete_by_query: self.delete_by_query.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            start_offset,
        }
    }
}

/// Drives one or more [`LogFile`]s through an [`UpdateLog`]'s ingest path.
pub struct Replayer<R: Repo> {
    log: Arc<UpdateLog<R>>,
}

impl<R: Repo> Replayer<R> {
    pub fn new(log: Arc<UpdateLog<R>>) -> Self {
        Self { log }
    }

    /// `activeLog=false`: replay each of `logs` (assumed already-rotated,
    /// already-capped history) from start to its final record, suppressing
    /// re-appends since the bytes are already durable — indexing instead
    /// points straight at the original `(log, offset)` each record came
    /// from. Caps any log whose last record is not a `COMMIT`, so the next
    /// boot doesn't replay it again.
    pub fn replay_stale(&self, logs: Vec<LogFile>) -> Result<RecoveryInfo, UpdateLogError> {
        let mut total = RecoveryInfo::default();
        for log in logs {
            let counters = Counters::default();
            let (records, saw_trailing_commit) = read_tolerant(&log, 0, &counters);

            self.dispatch_batches(Some(&log), &records, &counters, true);

            if !saw_trailing_commit && !log.is_capped() {
                log.append(&LogRecord::Commit { version: 0 })?;
            }

            total.merge(counters.into_info(0));
            if total.failed {
                break;
            }
        }
        Ok(total)
    }

    /// `activeLog=true`: merge `source`'s content into the live log by
    /// routing every record back through the ingest path with real appends
    /// (`is_replay=false`). On the first EOF, blocks new updates, re-polls
    /// for stragglers that slipped in between that EOF and the lock
    /// acquisition, drains those, then returns — the caller unblocks updates
    /// and transitions state once this returns.
    pub fn replay_buffer_into_live(&self, source: &LogFile) -> Result<RecoveryInfo, UpdateLogError> {
        let counters = Counters::default();

        let (first_pass, _) = read_tolerant(source, 0, &counters);
        let mut cursor = encoded_end_offset(&first_pass, 0);
        self.dispatch_batches(None, &first_pass, &counters, false);

        if !counters.failed.load(Ordering::Relaxed) {
            let _write = self.log.block_updates()?;
            loop {
                let (stragglers, _) = read_tolerant(source, cursor, &counters);
                if stragglers.is_empty() {
                    break;
                }
                cursor = encoded_end_offset(&stragglers, cursor);
                self.dispatch_batches(None, &stragglers, &counters, false);
                if counters.failed.load(Ordering::Relaxed) {
                    break;
                }
            }
        }

        Ok(counters.into_info(0))
    }

    /// Split `records` on DBQ boundaries (a DBQ waits for everything ahead of
    /// it to finish, then runs inline) and, within each boundary, fan out by
    /// id across scoped worker threads — same id serialized, different ids
    /// concurrent. `origin`, when set, is the log each record's offset was
    /// read from, used to rebuild the `KeyIndex` entry directly rather than
    /// via a fresh append.
    fn dispatch_batches(&self, origin: Option<&LogFile>, records: &[(u64, LogRecord)], counters: &Counters, suppress_append: bool) {
        let mut groups: IndexMap<String, Vec<(u64, LogRecord)>> = IndexMap::new();

        for (offset, record) in records {
            if counters.failed.load(Ordering::Relaxed) {
                return;
            }

            match record {
                LogRecord::Commit { .. } => continue,
                LogRecord::DeleteByQuery { .. } => {
                    log::debug!("replay: awaiting quiescence of {} pending id-groups before DBQ at offset={offset}", groups.len());
                    self.flush_groups(origin, &mut groups, counters, suppress_append);
                    if counters.failed.load(Ordering::Relaxed) {
                        return;
                    }
                    dispatch_one(&self.log, origin, *offset, record.clone(), suppress_append, counters);
                }
                _ => {
                    let id = record.id().expect("ADD/DELETE always carry an id").to_string();
                    groups.entry(id).or_default().push((*offset, record.clone()));
                }
            }
        }

        self.flush_groups(origin, &mut groups, counters, suppress_append);
    }

    fn flush_groups(
        &self,
        origin: Option<&LogFile>,
        groups: &mut IndexMap<String, Vec<(u64, LogRecord)>>,
        counters: &Counters,
        suppress_append: bool,
    ) {
        if groups.is_empty() {
            return;
        }
        let batches: Vec<Vec<(u64, LogRecord)>> = groups.drain(..).map(|(_, cmds)| cmds).collect();
        let log = &self.log;

        std::thread::scope(|scope| {
            for cmds in batches {
                let log = Arc::clone(log);
                scope.spawn(move || {
                    for (offset, record) in cmds {
                        if counters.failed.load(Ordering::Relaxed) {
                            return;
                        }
                        dispatch_one(&log, origin, offset, record, suppress_append, counters);
                    }
                });
            }
        });
    }
}

/// Apply one record to `log`, counting the outcome into `counters`.
///
/// A `SERVICE_UNAVAILABLE` failure latches `counters.failed`; every other
/// error is counted and swallowed, per §4.3's "any command failing with
/// SERVICE_UNAVAILABLE latches an exception and aborts replay; all other
/// errors are counted, logged, and the replay continues".
fn dispatch_one<R: Repo>(
    log: &Arc<UpdateLog<R>>,
    origin: Option<&LogFile>,
    offset: u64,
    record: LogRecord,
    suppress_append: bool,
    counters: &Counters,
) {
    let result = match record {
        LogRecord::Add {
            id,
            version,
            doc,
            in_place_prev,
        } => {
            counters.adds.fetch_add(1, Ordering::Relaxed);
            log.add(AddCmd {
                id,
                version,
                doc,
                in_place_prev: in_place_prev.map(|(o, v)| (o as u64, v)),
                is_replay: suppress_append,
                replay_source: suppress_append.then(|| origin.map(|l| (l.incref(), offset))).flatten(),
                clear_caches: false,
            })
        }
        LogRecord::Delete { id, version } => {
            counters.deletes.fetch_add(1, Ordering::Relaxed);
            log.delete(DeleteCmd {
                id,
                version,
                is_replay: suppress_append,
            })
        }
        LogRecord::DeleteByQuery { query, version } => {
            counters.delete_by_query.fetch_add(1, Ordering::Relaxed);
            log.delete_by_query(DeleteByQueryCmd {
                query,
                version,
                ignore_index_writer: false,
                is_replay: suppress_append,
            })
        }
        LogRecord::Commit { .. } => return,
    };

    match result {
        Ok(()) => {}
        Err(e @ UpdateLogError::ServiceUnavailable(_)) => {
            log::error!("replay: offset={offset} hit SERVICE_UNAVAILABLE ({e}); aborting replay");
            counters.failed.store(true, Ordering::Relaxed);
            counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            log::warn!("replay: offset={offset} failed ({e}); counted and continuing");
            counters.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Forward-read `log` from `start`, tolerating a corrupt trailing record by
/// stopping the stream (counted as an error) rather than failing the whole
/// replay. Returns the records read and whether the stream ended on a
/// `COMMIT`.
fn read_tolerant(log: &LogFile, start: u64, counters: &Counters) -> (Vec<(u64, LogRecord)>, bool) {
    let mut out = Vec::new();
    let mut saw_commit = false;

    let reader = match log.forward_reader(start) {
        Ok(r) => r,
        Err(e) => {
            log::warn!("replay: failed to open forward reader on log id={} at start={start}: {e}", log.id());
            counters.errors.fetch_add(1, Ordering::Relaxed);
            return (out, false);
        }
    };

    for item in reader {
        match item {
            Ok((offset, record)) => {
                saw_commit = matches!(record, LogRecord::Commit { .. });
                out.push((offset, record));
            }
            Err(e) => {
                log::warn!("replay: corrupt record in log id={} at offset>={start} ({e}); stream stops here", log.id());
                counters.errors.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    (out, saw_commit)
}

/// Re-derive the byte offset just past the last record in `records`, used to
/// resume a forward read on the next pass over a still-growing buffer log.
fn encoded_end_offset(records: &[(u64, LogRecord)], fallback: u64) -> u64 {
    match records.last() {
        Some((offset, record)) => {
            let mut buf = Vec::new();
            let _ = record.write(&mut buf);
            offset + buf.len() as u64
        }
        None => fallback,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::document::Document;
    use crate::repo::Memory;
    use crate::Options;

    fn add(id: &str, version: i64) -> LogRecord {
        LogRecord::Add {
            id: id.to_string(),
            version,
            doc: Document::new(id.to_string(), BTreeMap::new()),
            in_place_prev: None,
        }
    }

    #[test]
    fn replay_stale_caps_uncommitted_log_and_indexes_records() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::default();
        let log = LogFile::create(dir.path().join("tlog.0000000000000000000"), 0, false, &opts).unwrap();
        log.append(&add("a", 1)).unwrap();
        log.append(&add("b", 2)).unwrap();
        assert!(!log.is_capped());

        let ulog = Arc::new(UpdateLog::open(Memory::new(), opts).unwrap());
        let replayer = Replayer::new(Arc::clone(&ulog));
        let info = replayer.replay_stale(vec![log.clone()]).unwrap();

        assert_eq!(info.adds, 2);
        assert!(!info.failed);
        assert!(log.is_capped());
        assert!(ulog.lookup("a").unwrap().is_some());
        assert!(ulog.lookup("b").unwrap().is_some());
    }

    #[test]
    fn replay_stale_counts_deletes_and_dbqs() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::default();
        let log = LogFile::create(dir.path().join("tlog.0000000000000000001"), 1, false, &opts).unwrap();
        log.append(&add("a", 1)).unwrap();
        log.append(&LogRecord::Delete {
            id: "a".to_string(),
            version: -2,
        })
        .unwrap();
        log.append(&LogRecord::Commit { version: 0 }).unwrap();

        let ulog = Arc::new(UpdateLog::open(Memory::new(), opts).unwrap());
        let replayer = Replayer::new(Arc::clone(&ulog));
        let info = replayer.replay_stale(vec![log]).unwrap();

        assert_eq!(info.adds, 1);
        assert_eq!(info.deletes, 1);
        assert!(!info.failed);
        assert_eq!(ulog.lookup_version("a").unwrap(), Some(-2));
    }
}
