//! In-memory key → log-position index, the fast path for near-real-time
//! document lookups (§3 item 2, §4.2).
//!
//! There is no on-disk index: the three in-memory generations plus
//! [`crate::old_deletes::OldDeletes`] are the whole of it, consistent with
//! §6's "no separate manifest". Each generation is a plain `HashMap`, the
//! way the teacher keeps its offset index as a flat in-memory table (see
//! `index/mod.rs`), rather than anything more elaborate.

use std::collections::HashMap;

use crate::log_file::WeakLogFile;

/// Where to find one document's most recent record.
#[derive(Clone, Debug)]
pub struct KeyIndexEntry {
    pub log: WeakLogFile,
    pub offset: u64,
    pub version: i64,
    /// Offset of the record this one partially updates, if any — the chain
    /// link consumed by `apply_partial_updates`.
    pub prev_offset: Option<u64>,
}

impl KeyIndexEntry {
    pub fn new(log: WeakLogFile, offset: u64, version: i64, prev_offset: Option<u64>) -> Self {
        Self {
            log,
            offset,
            version,
            prev_offset,
        }
    }
}

/// Three-generation handoff across commits (§3, §8 Redesign Flags).
///
/// `current` is written against the active log. `preCommit` shifts
/// `current` into `prev` (backed by the tlog that's about to receive its
/// COMMIT record) and shifts the old `prev` into `prev2`, which survives
/// until the *next* hard commit discards it. A soft commit rotates the same
/// way but without touching any log file, which is why `prev`/`prev2` must
/// be able to outlive the tlog that originally backed `current`.
#[derive(Default)]
pub struct KeyIndex {
    current: HashMap<String, KeyIndexEntry>,
    prev: HashMap<String, KeyIndexEntry>,
    prev2: HashMap<String, KeyIndexEntry>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or overwrite) `id`'s latest position in the current generation.
    pub fn put(&mut self, id: String, entry: KeyIndexEntry) {
        self.current.insert(id, entry);
    }

    /// Mark `id` absent from the current generation (a delete observed after
    /// the last commit). Older generations are left untouched — lookups that
    /// fall through to them would return stale data, so callers must check
    /// `current` first regardless of whether this id is present there.
    ///
    /// Returns the removed entry, if any, so the caller can fold its version
    /// into `old_deletes`.
    pub fn remove_current(&mut self, id: &str) -> Option<KeyIndexEntry> {
        self.current.remove(id)
    }

    /// Lookup order: current → prev → prev2. Returns a clone since the
    /// caller needs to `try_incref` the log independently of this index's
    /// internal state.
    pub fn lookup(&self, id: &str) -> Option<KeyIndexEntry> {
        self.current
            .get(id)
            .or_else(|| self.prev.get(id))
            .or_else(|| self.prev2.get(id))
            .cloned()
    }

    /// `true` iff `id` has an entry in any generation. Used by the DBQ/lock
    /// interplay to decide whether a pending delete-by-query might apply.
    pub fn contains(&self, id: &str) -> bool {
        self.current.contains_key(id) || self.prev.contains_key(id) || self.prev2.contains_key(id)
    }

    /// `preCommit`'s generation rotation: `prev2 ← prev`, `prev ← current`,
    /// `current ← ∅`.
    pub fn rotate_for_commit(&mut self) {
        self.prev2 = std::mem::take(&mut self.prev);
        self.prev = std::mem::take(&mut self.current);
    }

    /// `preSoftCommit`'s rotation is identical in shape; kept as a separate
    /// method name so call sites read like the operations they model.
    pub fn rotate_for_soft_commit(&mut self) {
        self.rotate_for_commit();
    }

    /// `postSoftCommit`: once the soft-committed state is visible through a
    /// refreshed real-time view, the superseded generations can be dropped.
    pub fn clear_prev_generations(&mut self) {
        self.prev.clear();
        self.prev2.clear();
    }

    pub fn current_len(&self) -> usize {
        self.current.len()
    }

    pub fn iter_current(&self) -> impl Iterator<Item = (&str, &KeyIndexEntry)> {
        self.current.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_file::LogFile;
    use crate::Options;

    fn dummy_entry(offset: u64, version: i64) -> (LogFile, KeyIndexEntry) {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::default();
        let log = LogFile::create(dir.path().join("tlog.0000000000000000000"), 0, false, &opts).unwrap();
        let weak = log.downgrade();
        (log, KeyIndexEntry::new(weak, offset, version, None))
    }

    #[test]
    fn lookup_prefers_current_over_prev() {
        let mut idx = KeyIndex::new();
        let (_log1, e1) = dummy_entry(0, 1);
        let (_log2, e2) = dummy_entry(10, 2);

        idx.put("a".to_string(), e1);
        idx.rotate_for_commit();
        idx.put("a".to_string(), e2);

        assert_eq!(idx.lookup("a").unwrap().version, 2);
    }

    #[test]
    fn rotation_falls_through_to_prev2() {
        let mut idx = KeyIndex::new();
        let (_log, e) = dummy_entry(0, 1);
        idx.put("a".to_string(), e);

        idx.rotate_for_commit(); // a now in prev
        idx.rotate_for_commit(); // a now in prev2, current+prev empty

        assert_eq!(idx.lookup("a").unwrap().version, 1);

        idx.rotate_for_commit(); // a falls out of all three generations
        assert!(idx.lookup("a").is_none());
    }

    #[test]
    fn remove_current_only_hides_current_generation() {
        let mut idx = KeyIndex::new();
        let (_log, e) = dummy_entry(0, 1);
        idx.put("a".to_string(), e);
        idx.rotate_for_commit();

        assert!(idx.remove_current("a").is_none());
        assert_eq!(idx.lookup("a").unwrap().version, 1);
    }

    #[test]
    fn soft_commit_clear_drops_prev_generations() {
        let mut idx = KeyIndex::new();
        let (_log, e) = dummy_entry(0, 1);
        idx.put("a".to_string(), e);
        idx.rotate_for_soft_commit();
        idx.clear_prev_generations();

        assert!(idx.lookup("a").is_none());
    }
}
