//! Recent delete-by-query log, consulted when resolving whether a document
//! found via [`crate::key_index::KeyIndex`] has since been deleted by a
//! query rather than by id (§4.2 "DBQ list").
//!
//! A bounded deque ordered by descending `|version|` (most recent first),
//! deduplicated on `(version, query)`: a peer replaying the same DBQ twice
//! (e.g. across a commit boundary during recovery) must not grow the deque
//! unbounded.

use std::collections::VecDeque;

const DEFAULT_CAPACITY: usize = 100;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DbqEntry {
    pub query: String,
    pub version: i64,
}

pub struct Dbq {
    capacity: usize,
    entries: VecDeque<DbqEntry>,
}

impl Default for Dbq {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Dbq {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Insert a delete-by-query, keeping the deque sorted by descending
    /// `|version|` and deduplicated on `(version, query)`.
    pub fn record(&mut self, query: String, version: i64) {
        let key = version.unsigned_abs();
        if self
            .entries
            .iter()
            .any(|e| e.version == version && e.query == query)
        {
            return;
        }

        let pos = self
            .entries
            .iter()
            .position(|e| e.version.unsigned_abs() < key)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, DbqEntry { query, version });

        if self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
    }

    /// All entries with `|version|` greater than or equal to `since`, newest
    /// first — the queries a document at `since` might still be subject to.
    pub fn since(&self, since: i64) -> impl Iterator<Item = &DbqEntry> {
        let since = since.unsigned_abs();
        self.entries.iter().take_while(move |e| e.version.unsigned_abs() >= since)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_sorted_by_descending_version() {
        let mut dbq = Dbq::new(100);
        dbq.record("a:*".to_string(), -5);
        dbq.record("b:*".to_string(), -10);
        dbq.record("c:*".to_string(), -1);

        let versions: Vec<i64> = dbq.since(0).map(|e| e.version).collect();
        assert_eq!(versions, vec![-10, -5, -1]);
    }

    #[test]
    fn dedups_on_version_and_query() {
        let mut dbq = Dbq::new(100);
        dbq.record("a:*".to_string(), -5);
        dbq.record("a:*".to_string(), -5);
        assert_eq!(dbq.len(), 1);
    }

    #[test]
    fn evicts_lowest_version_past_capacity() {
        let mut dbq = Dbq::new(2);
        dbq.record("a:*".to_string(), -10);
        dbq.record("b:*".to_string(), -5);
        dbq.record("c:*".to_string(), -1);

        assert_eq!(dbq.len(), 2);
        let versions: Vec<i64> = dbq.since(0).map(|e| e.version).collect();
        assert_eq!(versions, vec![-10, -5]);
    }

    #[test]
    fn since_stops_at_older_entries() {
        let mut dbq = Dbq::new(100);
        dbq.record("a:*".to_string(), -10);
        dbq.record("b:*".to_string(), -5);

        let versions: Vec<i64> = dbq.since(-7).map(|e| e.version).collect();
        assert_eq!(versions, vec![-10]);
    }
}
