//! Read-side summary for peer-sync catch-up (§4.4).
//!
//! Constructed by snapshotting `[buffer_tlog?, tlog?, prev_tlog?, *old_logs]`
//! with an `incref` on each (mirroring the teacher's scoped-resource idiom:
//! see [`crate::log_file::LogFile::incref`]); the snapshot is held open for
//! the lifetime of this struct, then released on drop.

use std::collections::HashMap;

use itertools::Itertools;

use crate::error::UpdateLogError;
use crate::log_file::LogFile;
use crate::record::LogRecord;

/// One update, delete, or delete-by-query record surfaced to a peer-sync
/// caller, alongside the log offset it was read from (for `lookup`).
#[derive(Clone, Debug)]
pub struct RecentEntry {
    pub version: i64,
    pub record: LogRecord,
    pub from_buffer: bool,
}

/// Snapshot of the recent history of an [`crate::UpdateLog`], built by
/// reverse-reading its logs until `num_records_to_keep` distinct versions
/// have been collected.
pub struct RecentUpdates {
    _snapshot: Vec<LogFile>,
    update_list: Vec<RecentEntry>,
    delete_list: Vec<RecentEntry>,
    delete_by_query_list: Vec<RecentEntry>,
    by_version: HashMap<i64, RecentEntry>,
    buffer_updates: Vec<i64>,
}

impl RecentUpdates {
    /// Reverse-read `logs` (newest-first order expected: buffer, active,
    /// prev, then old logs oldest-last) until `num_records_to_keep` distinct
    /// versions have been collected, or every log is exhausted.
    pub fn build(logs: Vec<LogFile>, num_records_to_keep: usize) -> Result<Self, UpdateLogError> {
        let mut update_list = Vec::new();
        let mut delete_list = Vec::new();
        let mut delete_by_query_list = Vec::new();
        let mut by_version = HashMap::new();
        let mut buffer_updates = Vec::new();

        'logs: for log in &logs {
            for item in log.reverse_reader()? {
                let (_, record) = item?;
                let version = record.version();

                if let LogRecord::Commit { .. } = &record {
                    continue;
                }

                if log.is_buffer() {
                    buffer_updates.push(version);
                }

                let entry = RecentEntry {
                    version,
                    record: record.clone(),
                    from_buffer: log.is_buffer(),
                };

                by_version.entry(version).or_insert_with(|| entry.clone());

                match &record {
                    LogRecord::Add { .. } => update_list.push(entry.clone()),
                    LogRecord::Delete { .. } => {
                        update_list.push(entry.clone());
                        delete_list.push(entry);
                    }
                    LogRecord::DeleteByQuery { .. } => {
                        update_list.push(entry.clone());
                        delete_by_query_list.push(entry);
                    }
                    LogRecord::Commit { .. } => unreachable!(),
                }

                if by_version.len() >= num_records_to_keep {
                    break 'logs;
                }
            }
        }

        Ok(Self {
            _snapshot: logs,
            update_list,
            delete_list,
            delete_by_query_list,
            by_version,
            buffer_updates,
        })
    }

    /// First `n` newest (by encounter order) updates with `|version| ≤
    /// |max_version|`, deduplicated by version.
    pub fn get_versions(&self, n: usize, max_version: i64) -> Vec<i64> {
        let bound = max_version.unsigned_abs();
        self.update_list
            .iter()
            .map(|e| e.version)
            .filter(|v| v.unsigned_abs() <= bound)
            .unique()
            .take(n)
            .collect()
    }

    /// O(1) lookup of the record at `version`, if still within the snapshot.
    pub fn lookup(&self, version: i64) -> Option<&LogRecord> {
        self.by_version.get(&version).map(|e| &e.record)
    }

    /// Delete-by-query records strictly newer than `after_version`, skipping
    /// any version already present in `seen`.
    pub fn get_delete_by_query(&self, after_version: i64, seen: &std::collections::HashSet<i64>) -> Vec<&RecentEntry> {
        self.delete_by_query_list
            .iter()
            .filter(|e| e.version.unsigned_abs() > after_version.unsigned_abs())
            .filter(|e| !seen.contains(&e.version))
            .collect()
    }

    /// `true` iff `version` was read from a buffer log rather than a rotated
    /// tlog — peer-sync callers use this to filter out updates a replica
    /// accumulated for itself while recovering.
    pub fn is_from_buffer(&self, version: i64) -> bool {
        self.buffer_updates.contains(&version)
    }

    pub fn delete_list(&self) -> &[RecentEntry] {
        &self.delete_list
    }

    pub fn update_list(&self) -> &[RecentEntry] {
        &self.update_list
    }

    pub fn len(&self) -> usize {
        self.by_version.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_version.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::document::Document;
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
    fn collects_until_num_records_to_keep() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::default();
        let log = LogFile::create(dir.path().join("tlog.0000000000000000000"), 0, false, &opts).unwrap();

        for v in 1..=5 {
            log.append(&add("a", v)).unwrap();
        }

        let recent = RecentUpdates::build(vec![log], 3).unwrap();
        assert_eq!(recent.len(), 3);
        // Reverse-read order: newest first.
        assert_eq!(recent.update_list()[0].version, 5);
    }

    #[test]
    fn classifies_deletes_and_dbq() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::default();
        let log = LogFile::create(dir.path().join("tlog.0000000000000000000"), 0, false, &opts).unwrap();

        log.append(&add("a", 1)).unwrap();
        log.append(&LogRecord::Delete {
            id: "a".to_string(),
            version: -2,
        })
        .unwrap();
        log.append(&LogRecord::DeleteByQuery {
            query: "*:*".to_string(),
            version: -3,
        })
        .unwrap();

        let recent = RecentUpdates::build(vec![log], 100).unwrap();
        assert_eq!(recent.delete_list().len(), 1);
        assert_eq!(recent.get_delete_by_query(0, &Default::default()).len(), 1);
        assert_eq!(recent.lookup(1).unwrap().version(), 1);
    }

    #[test]
    fn get_versions_dedups_and_respects_max() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options::default();
        let log = LogFile::create(dir.path().join("tlog.0000000000000000000"), 0, false, &opts).unwrap();

        log.append(&add("a", 1)).unwrap();
        log.append(&add("a", 2)).unwrap();
        log.append(&add("b", 3)).unwrap();

        let recent = RecentUpdates::build(vec![log], 100).unwrap();
        let versions = recent.get_versions(10, 2);
        assert_eq!(versions, vec![2, 1]);
    }
}
