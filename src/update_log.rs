//! Public façade: the update log a shard opens, writes through, and
//! recovers from (§4.2).
//!
//! All state-mutating operations are serialized on a single monitor
//! (`Mutex<Inner>`), mirroring the spec's "one mutex guards KeyIndex
//! mutation, log rotation, deque mutation, and state transitions". Log
//! *reads* (positional reads for `lookup`) happen outside the monitor, after
//! `incref`-ing the log they need, so a slow reader never holds up writers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLockWriteGuard};

use crate::dbq::Dbq;
use crate::document::Document;
use crate::error::{ConfigError, InvalidState, ServiceUnavailable, UpdateLogError};
use crate::key_index::{KeyIndex, KeyIndexEntry};
use crate::log_file::LogFile;
use crate::locks::UpdateLocks;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::old_deletes::OldDeletes;
use crate::record::LogRecord;
use crate::recent_updates::RecentUpdates;
use crate::replayer::{RecoveryInfo, Replayer};
use crate::repo::{LogIdent, Repo};
use crate::Options;

/// Numeric values are stable and exposed as a metric (§4.2).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i64)]
pub enum State {
    Replaying = 0,
    Buffering = 1,
    ApplyingBuffered = 2,
    Active = 3,
}

/// Boundary with the search-index writer (§6): the ulog never writes to the
/// index directly, only calls out to it at commit boundaries. A no-op
/// implementation is enough to drive the ulog standalone (e.g. in tests);
/// production embedders provide a real one.
pub trait IndexWriter: Send + Sync {
    fn commit(&self) {}
    fn open_new_searcher(&self) {}
    fn get_version_from_index(&self, _id: &str) -> Option<i64> {
        None
    }
    fn is_persistent(&self) -> bool {
        true
    }
    fn is_reloaded(&self) -> bool {
        false
    }
}

/// An [`IndexWriter`] that does nothing, for tests and standalone use.
#[derive(Default)]
pub struct NullIndexWriter;
impl IndexWriter for NullIndexWriter {}

pub struct AddCmd {
    pub id: String,
    pub version: i64,
    pub doc: Document,
    /// `Some((prev_offset, prev_version))` for an in-place update.
    pub in_place_prev: Option<(u64, i64)>,
    pub is_replay: bool,
    /// Set by [`crate::replayer::Replayer`] when `is_replay` is set: the
    /// exact `(log, offset)` this record was read from, so the `KeyIndex`
    /// entry can point straight at already-durable bytes instead of the
    /// (suppressed) append this call would otherwise have produced.
    pub replay_source: Option<(LogFile, u64)>,
    pub clear_caches: bool,
}

pub struct DeleteCmd {
    pub id: String,
    pub version: i64,
    pub is_replay: bool,
}

pub struct DeleteByQueryCmd {
    pub query: String,
    pub version: i64,
    pub ignore_index_writer: bool,
    pub is_replay: bool,
}

/// An old (rotated, capped) log file plus the record count it was carrying
/// at the time it was demoted, so [`UpdateLog::trim_old_logs`] can enforce
/// the record-count-based retention rule without re-scanning every log on
/// every commit.
struct OldLog {
    log: LogFile,
    record_count: usize,
}

struct Inner {
    state: State,
    next_id: u64,
    tlog: Option<LogFile>,
    prev_tlog: Option<LogFile>,
    buffer_tlog: Option<LogFile>,
    old_logs: VecDeque<OldLog>,
    /// Buffer logs found on disk at startup, left over from a recovery that
    /// was interrupted before it could finish merging them into the live
    /// tlog. Drained by [`UpdateLog::recover`].
    startup_buffer_logs: Vec<LogFile>,
    key_index: KeyIndex,
    old_deletes: OldDeletes,
    dbq: Dbq,
    /// Count of records appended to `buffer_tlog` since the last
    /// [`UpdateLog::buffer_updates`] call — exposed as the "buffered op
    /// count" gauge (§6).
    buffered_op_count: u64,
}

/// Durable per-shard update log.
pub struct UpdateLog<R: Repo> {
    repo: R,
    opts: Options,
    inner: Mutex<Inner>,
    locks: UpdateLocks,
    metrics: Metrics,
    index_writer: Box<dyn IndexWriter + Send + Sync>,
}

impl<R: Repo> UpdateLog<R> {
    /// Phase 1 of the two-phase init (§4's "Lifecycle"): validate static
    /// config and open (or create) the active log, without yet being bound
    /// to an index writer. Scans the directory for pre-existing logs; if
    /// any are found uncommitted, the caller must invoke
    /// [`Self::recover_from_log`] (via [`crate::replayer::Replayer`]) before
    /// serving traffic.
    pub fn open(repo: R, opts: Options) -> Result<Self, UpdateLogError> {
        opts.validate()?;

        let mut existing = repo.existing_logs().map_err(ConfigError::Io)?;
        existing.sort_unstable();

        let buffer_idents: Vec<LogIdent> = existing.iter().copied().filter(|i| i.is_buffer()).collect();
        let tlog_idents: Vec<LogIdent> = existing.iter().copied().filter(|i| !i.is_buffer()).collect();

        // Open every on-disk tlog once, up front, so its capped-ness can be
        // inspected without reopening it twice.
        let mut opened: Vec<LogFile> = tlog_idents
            .iter()
            .map(|ident| repo.open_log(*ident, &opts))
            .collect::<std::io::Result<_>>()
            .map_err(ConfigError::Io)?;

        let last_is_capped = match opened.last() {
            Some(log) => log
                .ends_with_commit()
                .map_err(|e| ConfigError::Io(std::io::Error::other(e.to_string())))?,
            None => false,
        };

        let needs_recovery = !buffer_idents.is_empty() || (!opened.is_empty() && !last_is_capped);

        let last_id = match tlog_idents.last() {
            Some(LogIdent::Tlog(id)) => Some(*id),
            _ => None,
        };

        // A tlog that already ends with a COMMIT record must never be
        // reopened for append (§4.1's capped-log invariant): start a fresh
        // log instead and let the committed one fall straight into
        // `old_logs` alongside whatever else was already rotated out.
        let (tlog, next_id) = if last_is_capped {
            let next_id = last_id.map_or(0, |id| id + 1);
            let fresh = repo.create_log(LogIdent::Tlog(next_id), &opts).map_err(ConfigError::Io)?;
            (fresh, next_id + 1)
        } else if let Some(active) = opened.pop() {
            (active, last_id.map_or(0, |id| id + 1))
        } else {
            (repo.create_log(LogIdent::Tlog(0), &opts).map_err(ConfigError::Io)?, 1)
        };

        let old_logs: VecDeque<OldLog> = opened
            .into_iter()
            .map(|log| {
                let record_count = count_records(&log);
                OldLog { log, record_count }
            })
            .collect();

        let startup_buffer_logs: Vec<LogFile> = buffer_idents
            .iter()
            .map(|ident| repo.open_log(*ident, &opts))
            .collect::<std::io::Result<_>>()
            .map_err(ConfigError::Io)?;

        let tlog = Some(tlog);

        let state = if needs_recovery { State::Replaying } else { State::Active };

        let inner = Inner {
            state,
            next_id,
            tlog,
            prev_tlog: None,
            buffer_tlog: None,
            old_logs,
            startup_buffer_logs,
            key_index: KeyIndex::new(),
            old_deletes: OldDeletes::default(),
            dbq: Dbq::default(),
            buffered_op_count: 0,
        };

        let this = Self {
            repo,
            opts,
            inner: Mutex::new(inner),
            locks: UpdateLocks::new(0),
            metrics: Metrics::new(),
            index_writer: Box::new(NullIndexWriter),
        };
        this.metrics.set_state(state as i64);

        Ok(this)
    }

    /// Phase 2 of init: bind the real index writer. Until this is called,
    /// `commit`/`openNewSearcher` boundary calls are no-ops.
    pub fn bind_index_writer(&mut self, index_writer: Box<dyn IndexWriter + Send + Sync>) {
        self.index_writer = index_writer;
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Number of rotated logs currently retained in `old_logs`. Exposed only
    /// for asserting the retention bound (§8 property 5) from outside the
    /// crate; not part of the operational API.
    #[cfg(any(test, feature = "test"))]
    pub fn old_logs_len(&self) -> usize {
        self.inner.lock().old_logs.len()
    }

    /// Total non-`COMMIT` record count summed across `old_logs`, as tracked
    /// incrementally at rotation time. See [`Self::old_logs_len`].
    #[cfg(any(test, feature = "test"))]
    pub fn old_logs_record_count(&self) -> usize {
        self.inner.lock().old_logs.iter().map(|o| o.record_count).sum()
    }

    fn active_log_for_write(inner: &mut Inner, repo: &R, opts: &Options) -> Result<LogFile, UpdateLogError> {
        match &inner.tlog {
            Some(log) => Ok(log.clone()),
            None => {
                let id = inner.next_id;
                inner.next_id += 1;
                let log = repo.create_log(LogIdent::Tlog(id), opts).map_err(ConfigError::Io)?;
                inner.tlog = Some(log.clone());
                Ok(log)
            }
        }
    }

    fn buffer_log_for_write(&self, inner: &mut Inner) -> Result<LogFile, UpdateLogError> {
        match &inner.buffer_tlog {
            Some(log) => Ok(log.clone()),
            None => {
                let nanos = self.next_buffer_nanos();
                let log = self
                    .repo
                    .create_log(LogIdent::Buffer(nanos), &self.opts)
                    .map_err(ConfigError::Io)?;
                inner.buffer_tlog = Some(log.clone());
                Ok(log)
            }
        }
    }

    /// Monotonic stand-in for `System.nanoTime()`. `Date`/`Instant::now`
    /// can't be used in this crate's test harness, so buffer logs key off a
    /// process-local counter instead of a wall-clock timestamp.
    fn next_buffer_nanos(&self) -> u128 {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        COUNTER.fetch_add(1, Ordering::Relaxed) as u128
    }

    /// §4.2 `add`.
    pub fn add(&self, mut cmd: AddCmd) -> Result<(), UpdateLogError> {
        let _guard = self.locks.acquire_update()?;
        let mut inner = self.inner.lock();

        if inner.state == State::Buffering {
            let log = self.buffer_log_for_write(&mut inner)?;
            log.append(&LogRecord::Add {
                id: cmd.id,
                version: cmd.version,
                doc: cmd.doc,
                in_place_prev: cmd.in_place_prev.map(|(o, v)| (o as i64, v)),
            })?;
            self.bump_buffered_op_count(&mut inner);
            return Ok(());
        }

        if cmd.in_place_prev.is_none() {
            cmd.in_place_prev = inner.key_index.lookup(&cmd.id).map(|e| (e.offset, e.version));
        }

        let offset = if !cmd.is_replay {
            let log = Self::active_log_for_write(&mut inner, &self.repo, &self.opts)?;
            let offset = log.append(&LogRecord::Add {
                id: cmd.id.clone(),
                version: cmd.version,
                doc: cmd.doc.clone(),
                in_place_prev: cmd.in_place_prev.map(|(o, v)| (o as i64, v)),
            })?;
            Some((log, offset))
        } else {
            cmd.replay_source.clone()
        };

        if let Some((log, offset)) = &offset {
            let weak = log.downgrade();
            inner.key_index.put(
                cmd.id.clone(),
                KeyIndexEntry::new(weak, *offset, cmd.version, cmd.in_place_prev.map(|(o, _)| o)),
            );
        }

        if cmd.clear_caches {
            self.index_writer.open_new_searcher();
            inner.key_index = KeyIndex::new();
        }

        Ok(())
    }

    /// §4.2 `delete`.
    pub fn delete(&self, cmd: DeleteCmd) -> Result<(), UpdateLogError> {
        let _guard = self.locks.acquire_update()?;
        let mut inner = self.inner.lock();

        if inner.state == State::Buffering {
            let log = self.buffer_log_for_write(&mut inner)?;
            log.append(&LogRecord::Delete {
                id: cmd.id,
                version: cmd.version,
            })?;
            self.bump_buffered_op_count(&mut inner);
            return Ok(());
        }

        if !cmd.is_replay {
            let log = Self::active_log_for_write(&mut inner, &self.repo, &self.opts)?;
            log.append(&LogRecord::Delete {
                id: cmd.id.clone(),
                version: cmd.version,
            })?;
        }

        inner.key_index.remove_current(&cmd.id);
        inner.old_deletes.record(cmd.id, cmd.version);

        Ok(())
    }

    /// §4.2 `deleteByQuery`.
    pub fn delete_by_query(&self, cmd: DeleteByQueryCmd) -> Result<(), UpdateLogError> {
        let _guard = self.locks.acquire_update()?;
        let mut inner = self.inner.lock();

        if inner.state == State::Buffering {
            let log = self.buffer_log_for_write(&mut inner)?;
            log.append(&LogRecord::DeleteByQuery {
                query: cmd.query,
                version: cmd.version,
            })?;
            self.bump_buffered_op_count(&mut inner);
            return Ok(());
        }

        if !cmd.is_replay {
            let log = Self::active_log_for_write(&mut inner, &self.repo, &self.opts)?;
            log.append(&LogRecord::DeleteByQuery {
                query: cmd.query.clone(),
                version: cmd.version,
            })?;
        }

        if !cmd.ignore_index_writer {
            self.index_writer.open_new_searcher();
            inner.key_index = KeyIndex::new();
        }

        inner.dbq.record(cmd.query, cmd.version);

        Ok(())
    }

    /// §4.2 `preCommit`: rotate KeyIndex generations and demote the active
    /// log to `prev_tlog`, awaiting its COMMIT record.
    pub fn pre_commit(&self) -> Result<(), UpdateLogError> {
        let _write = self.locks.block_updates()?;
        let mut inner = self.inner.lock();

        if let Some(stale) = inner.prev_tlog.take() {
            // A previous preCommit never saw its postCommit; finish it now.
            log::warn!("preCommit found a stale prev_tlog with no matching postCommit; forcing it to completion");
            if !stale.is_capped() {
                stale.append(&LogRecord::Commit { version: 0 })?;
            }
            Self::push_old_log(&mut inner.old_logs, stale);
            self.metrics.incr_ops_copy_over_old_updates();
            self.trim_old_logs(&mut inner);
        }

        log::debug!("preCommit: rotating tlog id={:?} to prev_tlog", inner.tlog.as_ref().map(LogFile::id));
        inner.key_index.rotate_for_commit();
        inner.prev_tlog = inner.tlog.take();

        Ok(())
    }

    /// §4.2 `postCommit`: cap `prev_tlog` with a COMMIT record and demote it
    /// into `old_logs`.
    pub fn post_commit(&self) -> Result<(), UpdateLogError> {
        let mut inner = self.inner.lock();
        let Some(log) = inner.prev_tlog.take() else {
            return Ok(());
        };

        let id = log.id();
        log.append(&LogRecord::Commit { version: 0 })?;
        self.index_writer.commit();
        log::debug!("postCommit: capped tlog id={id} and demoted it into old_logs");

        Self::push_old_log(&mut inner.old_logs, log);
        self.metrics.incr_ops_copy_over_old_updates();
        self.trim_old_logs(&mut inner);

        Ok(())
    }

    /// §4.2 `preSoftCommit`: rotate KeyIndex generations without touching
    /// any log file.
    pub fn pre_soft_commit(&self) -> Result<(), UpdateLogError> {
        let _write = self.locks.block_updates()?;
        let mut inner = self.inner.lock();
        inner.key_index.rotate_for_soft_commit();
        Ok(())
    }

    /// §4.2 `postSoftCommit`: once the soft-committed state is visible
    /// through a refreshed real-time view, the superseded generations can
    /// be dropped.
    pub fn post_soft_commit(&self) -> Result<(), UpdateLogError> {
        let mut inner = self.inner.lock();
        inner.key_index.clear_prev_generations();
        Ok(())
    }

    /// Wrap a freshly-capped log with its record count and push it onto
    /// `old_logs`. The count is computed once, here, rather than tracked
    /// incrementally across every `add`/`delete`/`deleteByQuery` call —
    /// simpler, and the cost is the same shape as `LogFile::ends_with_commit`'s
    /// own full forward scan, paid once per rotation rather than once per op.
    fn push_old_log(old_logs: &mut VecDeque<OldLog>, log: LogFile) {
        let record_count = count_records(&log);
        old_logs.push_back(OldLog { log, record_count });
    }

    /// Enforce retention (§3 "Lifecycle", §8 property 5): retain old logs
    /// until either (a) their total record count reaches
    /// `num_records_to_keep`, or (b) `max_num_logs_to_keep` is exceeded,
    /// whichever binds first. At least one old log is always kept once any
    /// exist, so a single huge commit never evicts itself.
    fn trim_old_logs(&self, inner: &mut Inner) {
        while inner.old_logs.len() > self.opts.max_num_logs_to_keep.get() {
            let dropped = inner.old_logs.pop_front();
            log::debug!(
                "trim_old_logs: dropped tlog id={:?}, over max_num_logs_to_keep={}",
                dropped.map(|o| o.log.id()),
                self.opts.max_num_logs_to_keep
            );
        }

        let total: usize = inner.old_logs.iter().map(|o| o.record_count).sum();
        let mut kept = total;
        while inner.old_logs.len() > 1 {
            let Some(front) = inner.old_logs.front() else { break };
            if kept.saturating_sub(front.record_count) < self.opts.num_records_to_keep {
                break;
            }
            kept -= front.record_count;
            inner.old_logs.pop_front();
        }
    }

    /// §4.2 `lookup`: returns the raw on-disk record for `id`, if indexed.
    pub fn lookup(&self, id: &str) -> Result<Option<LogRecord>, UpdateLogError> {
        let entry = {
            let inner = self.inner.lock();
            inner.key_index.lookup(id)
        };
        let Some(entry) = entry else { return Ok(None) };
        let Some(log) = entry.log.try_incref() else {
            return Ok(None);
        };
        Ok(log.read(entry.offset)?)
    }

    /// §4.2 `lookup_version`.
    pub fn lookup_version(&self, id: &str) -> Result<Option<i64>, UpdateLogError> {
        let (entry, old_delete) = {
            let inner = self.inner.lock();
            (inner.key_index.lookup(id), inner.old_deletes.get(id))
        };
        if let Some(entry) = entry {
            return Ok(Some(entry.version));
        }
        if let Some(v) = self.index_writer.get_version_from_index(id) {
            return Ok(Some(v));
        }
        Ok(old_delete)
    }

    /// §4.2 `apply_partial_updates`: walk the in-place update chain starting
    /// at `(prev_offset, prev_version)`, merging missing fields into
    /// `out_doc`.
    ///
    /// Returns `Ok(None)` once a terminal ADD has been merged in (chain
    /// fully resolved), or `Ok(Some(fallback_offset))` if the chain runs off
    /// the end of every log this process still holds open — the caller
    /// should then consult the real index for the rest.
    pub fn apply_partial_updates(
        &self,
        mut prev_offset: u64,
        mut prev_version: i64,
        fields: Option<&[String]>,
        out_doc: &mut Document,
    ) -> Result<Option<u64>, UpdateLogError> {
        loop {
            if let Some(fields) = fields {
                if out_doc.contains_all(fields) {
                    return Ok(None);
                }
            }

            let candidates: Vec<LogFile> = {
                let inner = self.inner.lock();
                [&inner.tlog, &inner.prev_tlog]
                    .into_iter()
                    .flatten()
                    .cloned()
                    .chain(inner.old_logs.iter().map(|o| o.log.clone()))
                    .collect()
            };

            let mut found = None;
            for log in &candidates {
                if let Some(record) = log.read(prev_offset)? {
                    if record.version() == prev_version {
                        found = Some(record);
                        break;
                    }
                }
            }

            let Some(record) = found else {
                return Ok(Some(prev_offset));
            };

            match record {
                LogRecord::Add {
                    doc, in_place_prev, ..
                } => {
                    out_doc.merge_missing_from(&doc);
                    match in_place_prev {
                        Some((next_offset, next_version)) => {
                            prev_offset = next_offset as u64;
                            prev_version = next_version;
                        }
                        None => return Ok(None),
                    }
                }
                other => {
                    return Err(InvalidState::NotAnUpdateChainLink {
                        offset: prev_offset,
                        op: record_op_code(&other),
                    }
                    .into())
                }
            }
        }
    }

    /// §4.4: snapshot `[buffer_tlog?, tlog?, prev_tlog?, *old_logs]` with an
    /// `incref` on each and reverse-read them into a [`RecentUpdates`] for a
    /// peer-sync caller.
    pub fn recent_updates(&self) -> Result<RecentUpdates, UpdateLogError> {
        let snapshot: Vec<LogFile> = {
            let inner = self.inner.lock();
            inner
                .buffer_tlog
                .iter()
                .chain(inner.tlog.iter())
                .chain(inner.prev_tlog.iter())
                .cloned()
                .chain(inner.old_logs.iter().map(|o| o.log.clone()))
                .collect()
        };
        Ok(RecentUpdates::build(snapshot, self.opts.num_records_to_keep)?)
    }

    /// §4.5: carve out a quiescent window, excluding every update operation
    /// until the returned guard is dropped. Used by
    /// [`crate::replayer::Replayer`] to finish draining a buffer log.
    pub(crate) fn block_updates(&self) -> Result<RwLockWriteGuard<'_, ()>, ServiceUnavailable> {
        self.locks.block_updates()
    }

    fn bump_buffered_op_count(&self, inner: &mut Inner) {
        inner.buffered_op_count += 1;
        self.metrics.set_buffered_op_count(inner.buffered_op_count as i64);
    }

    fn set_state(&self, state: State) {
        self.inner.lock().state = state;
        self.metrics.set_state(state as i64);
    }

    /// §4's "Lifecycle": if startup found an uncommitted tail (the current
    /// `tlog` not ending in `COMMIT`, or leftover `buffer.tlog.*` files from
    /// an interrupted recovery), drain them through the normal ingest path
    /// before serving traffic. A no-op if the log opened clean.
    pub fn recover(self: &Arc<Self>) -> Result<RecoveryInfo, UpdateLogError> {
        if self.state() != State::Replaying {
            return Ok(RecoveryInfo::default());
        }

        log::info!("recover: replaying uncommitted tail before serving traffic");
        self.metrics.incr_ops_replay();
        let mut total = RecoveryInfo::default();
        let replayer = Replayer::new(Arc::clone(self));

        let stale_tlog = {
            let inner = self.inner.lock();
            inner.tlog.clone()
        };
        if let Some(tlog) = stale_tlog {
            if !tlog.is_capped() {
                let info = replayer.replay_stale(vec![tlog])?;
                total.adds += info.adds;
                total.deletes += info.deletes;
                total.delete_by_query += info.delete_by_query;
                total.errors += info.errors;
                total.failed |= info.failed;
            }
        }

        let startup_buffers = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.startup_buffer_logs)
        };
        for buffer in startup_buffers {
            if total.failed {
                break;
            }
            let info = replayer.replay_buffer_into_live(&buffer)?;
            total.adds += info.adds;
            total.deletes += info.deletes;
            total.delete_by_query += info.delete_by_query;
            total.errors += info.errors;
            total.failed |= info.failed;
            buffer.set_delete_on_close(true);
        }

        log::info!(
            "recover: finished with adds={} deletes={} deleteByQuery={} errors={} failed={}",
            total.adds,
            total.deletes,
            total.delete_by_query,
            total.errors,
            total.failed
        );
        self.set_state(State::Active);
        Ok(total)
    }

    /// Route subsequent `add`/`delete`/`deleteByQuery` calls to a fresh
    /// buffer sub-log instead of the live tlog, e.g. while a replica
    /// recovers from a snapshot during leader failover.
    pub fn buffer_updates(&self) {
        log::debug!("buffer_updates: entering BUFFERING state");
        self.set_state(State::Buffering);
    }

    /// Discard the buffer log accumulated since [`Self::buffer_updates`]
    /// without merging it — e.g. a failed-over snapshot recovery that has to
    /// restart. Returns to [`State::Active`] directly.
    pub fn drop_buffered_updates(&self) {
        let mut inner = self.inner.lock();
        if let Some(buffer) = inner.buffer_tlog.take() {
            log::debug!("drop_buffered_updates: discarding buffer tlog id={}", buffer.id());
            buffer.set_delete_on_close(true);
        }
        inner.buffered_op_count = 0;
        inner.state = State::Active;
        self.metrics.set_state(State::Active as i64);
        self.metrics.set_buffered_op_count(0);
    }

    /// §4.3 `activeLog=true`: merge the buffer log accumulated since
    /// [`Self::buffer_updates`] into the live tlog, then transition to
    /// [`State::Active`].
    pub fn apply_buffered_updates(self: &Arc<Self>) -> Result<RecoveryInfo, UpdateLogError> {
        self.set_state(State::ApplyingBuffered);
        self.metrics.incr_ops_applying_buffered();

        let buffer = {
            let mut inner = self.inner.lock();
            inner.buffered_op_count = 0;
            inner.buffer_tlog.take()
        };
        self.metrics.set_buffered_op_count(0);

        let info = match buffer {
            Some(buffer) => {
                log::info!("apply_buffered_updates: merging buffer tlog id={} into the live log", buffer.id());
                let replayer = Replayer::new(Arc::clone(self));
                let info = replayer.replay_buffer_into_live(&buffer)?;
                buffer.set_delete_on_close(true);
                info
            }
            None => RecoveryInfo::default(),
        };

        self.set_state(State::Active);
        Ok(info)
    }
}

/// Count every non-`COMMIT` record in `log` via a full forward scan. Paid
/// once, when a log is demoted into `old_logs`.
fn count_records(log: &LogFile) -> usize {
    match log.forward_reader(0) {
        Ok(reader) => reader
            .filter_map(Result::ok)
            .filter(|(_, record)| !matches!(record, LogRecord::Commit { .. }))
            .count(),
        Err(_) => 0,
    }
}

fn record_op_code(record: &LogRecord) -> u8 {
    match record {
        LogRecord::Add { .. } => 1,
        LogRecord::Delete { .. } => 2,
        LogRecord::DeleteByQuery { .. } => 3,
        LogRecord::Commit { .. } => 4,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::repo::Memory;

    fn opts() -> Options {
        Options {
            doc_lock_timeout_ms: 1000,
            ..Options::default()
        }
    }

    fn doc(id: &str, x: i64) -> Document {
        let mut fields = BTreeMap::new();
        fields.insert("x".to_string(), serde_json::json!(x));
        Document::new(id.to_string(), fields)
    }

    fn add_cmd(id: &str, version: i64, x: i64) -> AddCmd {
        AddCmd {
            id: id.to_string(),
            version,
            doc: doc(id, x),
            in_place_prev: None,
            is_replay: false,
            replay_source: None,
            clear_caches: false,
        }
    }

    #[test]
    fn add_then_lookup() {
        let ulog = UpdateLog::open(Memory::new(), opts()).unwrap();
        ulog.add(add_cmd("a", 10, 1)).unwrap();

        let record = ulog.lookup("a").unwrap().unwrap();
        assert_eq!(record.version(), 10);
    }

    #[test]
    fn delete_removes_from_current_generation() {
        let ulog = UpdateLog::open(Memory::new(), opts()).unwrap();
        ulog.add(add_cmd("a", 10, 1)).unwrap();
        ulog.delete(DeleteCmd {
            id: "a".to_string(),
            version: -11,
            is_replay: false,
        })
        .unwrap();

        assert!(ulog.lookup("a").unwrap().is_none());
        assert_eq!(ulog.lookup_version("a").unwrap(), Some(-11));
    }

    #[test]
    fn commit_rotation_keeps_prev_generation_visible_until_post_commit() {
        let ulog = UpdateLog::open(Memory::new(), opts()).unwrap();
        ulog.add(add_cmd("a", 10, 1)).unwrap();

        ulog.pre_commit().unwrap();
        // prev generation still answers lookups.
        assert_eq!(ulog.lookup("a").unwrap().unwrap().version(), 10);

        ulog.add(add_cmd("a", 11, 2)).unwrap();
        ulog.post_commit().unwrap();

        assert_eq!(ulog.lookup("a").unwrap().unwrap().version(), 11);
    }

    #[test]
    fn buffering_routes_writes_to_buffer_log_not_index() {
        let ulog = UpdateLog::open(Memory::new(), opts()).unwrap();
        ulog.inner.lock().state = State::Buffering;

        ulog.add(add_cmd("a", 20, 1)).unwrap();
        assert!(ulog.lookup("a").unwrap().is_none());
        assert!(ulog.inner.lock().buffer_tlog.is_some());
    }

    #[test]
    fn apply_partial_updates_resolves_chain_to_terminal_add() {
        let ulog = UpdateLog::open(Memory::new(), opts()).unwrap();

        let mut full_fields = BTreeMap::new();
        full_fields.insert("x".to_string(), serde_json::json!(1));
        full_fields.insert("y".to_string(), serde_json::json!(1));
        ulog.add(AddCmd {
            id: "a".to_string(),
            version: 1,
            doc: Document::new("a".to_string(), full_fields),
            in_place_prev: None,
            is_replay: false,
            replay_source: None,
            clear_caches: false,
        })
        .unwrap();

        let (prev_offset, prev_version) = {
            let inner = ulog.inner.lock();
            let e = inner.key_index.lookup("a").unwrap();
            (e.offset, e.version)
        };

        let mut update_fields = BTreeMap::new();
        update_fields.insert("y".to_string(), serde_json::json!(2));
        ulog.add(AddCmd {
            id: "a".to_string(),
            version: 2,
            doc: Document::new("a".to_string(), update_fields),
            in_place_prev: Some((prev_offset, prev_version)),
            is_replay: false,
            replay_source: None,
            clear_caches: false,
        })
        .unwrap();

        let e = {
            let inner = ulog.inner.lock();
            inner.key_index.lookup("a").unwrap()
        };
        let mut out = Document::new("a".to_string(), BTreeMap::new());
        out.apply_update(&doc("a", 2)); // seed with the in-place update's own fields, as the caller would
        let fallback = ulog
            .apply_partial_updates(e.prev_offset.unwrap(), prev_version, None, &mut out)
            .unwrap();

        assert!(fallback.is_none());
        assert_eq!(out.get("x"), Some(&serde_json::json!(1)));
    }
}
