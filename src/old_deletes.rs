//! Bounded record of deletes that have aged out of every
//! [`crate::key_index::KeyIndex`] generation (§4.2 "OldDeletes").
//!
//! The key index alone cannot distinguish "this id was never indexed" from
//! "this id was deleted before the last rotation dropped its generation" —
//! a lookup miss means either. `OldDeletes` remembers the delete's version
//! for a bounded, insertion-ordered window so `lookup_version` can still
//! answer correctly just after a commit, at the cost of eventually
//! forgetting very old deletes (which is fine: by then a peer-sync catch-up
//! would re-derive the same answer from the log itself).
//!
//! Built on `indexmap`, the way the rest of the SpacetimeDB workspace reaches
//! for it whenever insertion order plus O(1) lookup is needed together.

use indexmap::IndexMap;

const DEFAULT_CAPACITY: usize = 1000;

pub struct OldDeletes {
    capacity: usize,
    versions: IndexMap<String, i64>,
}

impl Default for OldDeletes {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl OldDeletes {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            versions: IndexMap::with_capacity(capacity),
        }
    }

    /// Record that `id` was deleted at `version`. Evicts the oldest entry if
    /// the map is at capacity and `id` is not already present.
    pub fn record(&mut self, id: String, version: i64) {
        if !self.versions.contains_key(&id) && self.versions.len() >= self.capacity {
            self.versions.shift_remove_index(0);
        }
        // Re-inserting an existing key updates its value in place but keeps
        // its original position; that's fine here, we only care about
        // eventual eviction order, not exact recency.
        self.versions.insert(id, version);
    }

    pub fn get(&self, id: &str) -> Option<i64> {
        self.versions.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
