//! Plain atomic counters for the numbers operators care about: how many
//! updates are buffered, how much replay work remains, what lifecycle state
//! the log is in.
//!
//! Exporting to a metrics backend is an embedder-level concern, so this
//! exposes a point-in-time snapshot rather than wiring up `metrics`/
//! `prometheus` directly.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    buffered_op_count: AtomicI64,
    remaining_replay_log_count: AtomicI64,
    remaining_replay_byte_count: AtomicI64,
    state: AtomicI64,

    ops_replay: AtomicU64,
    ops_applying_buffered: AtomicU64,
    ops_copy_over_old_updates: AtomicU64,

    handler_start_time_millis: AtomicU64,
}

/// Point-in-time snapshot of [`Metrics`], suitable for an embedder's own
/// exporter to scrape.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsSnapshot {
    pub buffered_op_count: i64,
    pub remaining_replay_log_count: i64,
    pub remaining_replay_byte_count: i64,
    pub state: i64,
    pub ops_replay: u64,
    pub ops_applying_buffered: u64,
    pub ops_copy_over_old_updates: u64,
    pub handler_start_time_millis: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_buffered_op_count(&self, n: i64) {
        self.buffered_op_count.store(n, Ordering::Relaxed);
    }

    pub fn set_remaining_replay(&self, logs: i64, bytes: i64) {
        self.remaining_replay_log_count.store(logs, Ordering::Relaxed);
        self.remaining_replay_byte_count.store(bytes, Ordering::Relaxed);
    }

    pub fn set_state(&self, state: i64) {
        self.state.store(state, Ordering::Relaxed);
    }

    pub fn incr_ops_replay(&self) {
        self.ops_replay.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_ops_applying_buffered(&self) {
        self.ops_applying_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_ops_copy_over_old_updates(&self) {
        self.ops_copy_over_old_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_handler_start_time_millis(&self, millis: u64) {
        self.handler_start_time_millis.store(millis, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            buffered_op_count: self.buffered_op_count.load(Ordering::Relaxed),
            remaining_replay_log_count: self.remaining_replay_log_count.load(Ordering::Relaxed),
            remaining_replay_byte_count: self.remaining_replay_byte_count.load(Ordering::Relaxed),
            state: self.state.load(Ordering::Relaxed),
            ops_replay: self.ops_replay.load(Ordering::Relaxed),
            ops_applying_buffered: self.ops_applying_buffered.load(Ordering::Relaxed),
            ops_copy_over_old_updates: self.ops_copy_over_old_updates.load(Ordering::Relaxed),
            handler_start_time_millis: self.handler_start_time_millis.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_updates() {
        let m = Metrics::new();
        m.set_state(3);
        m.incr_ops_replay();
        m.incr_ops_replay();

        let snap = m.snapshot();
        assert_eq!(snap.state, 3);
        assert_eq!(snap.ops_replay, 2);
    }
}
