//! A minimal document representation good enough to exercise the partial
//! update chain resolver (§4.2 `apply_partial_updates`).
//!
//! The ulog core does not care about schema or query execution (§1
//! Non-goals), so a document is just an id plus a bag of named fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ID_FIELD: &str = "id";

/// A document as stored in, and read back from, the log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new(id: String, mut fields: BTreeMap<String, Value>) -> Self {
        fields.insert(ID_FIELD.to_string(), Value::String(id));
        Self { fields }
    }

    pub fn id(&self) -> Option<String> {
        self.fields.get(ID_FIELD).and_then(Value::as_str).map(str::to_string)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn contains_all(&self, fields: &[String]) -> bool {
        fields.iter().all(|f| self.fields.contains_key(f))
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Merge fields present in `other` but absent in `self`, in place.
    ///
    /// This is the "missing fields" merge used by `apply_partial_updates`:
    /// later (closer to the chain head) hops have already contributed their
    /// fields to `self`, so earlier hops only fill in what's still missing.
    pub fn merge_missing_from(&mut self, other: &Document) {
        for (k, v) in &other.fields {
            self.fields.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    /// Left-fold `update` over `self`, the way a normal (non-chained)
    /// in-place update is applied: `update`'s fields win.
    pub fn apply_update(&mut self, update: &Document) {
        for (k, v) in &update.fields {
            if k == ID_FIELD {
                continue;
            }
            self.fields.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, fields: &[(&str, i64)]) -> Document {
        let mut map = BTreeMap::new();
        for (k, v) in fields {
            map.insert((*k).to_string(), serde_json::json!(v));
        }
        Document::new(id.to_string(), map)
    }

    #[test]
    fn merge_missing_keeps_existing() {
        let mut full = doc("a", &[("x", 1), ("y", 1)]);
        let update = doc("a", &[("y", 99)]);
        full.merge_missing_from(&update);
        assert_eq!(full.get("x"), Some(&serde_json::json!(1)));
        assert_eq!(full.get("y"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn apply_update_overwrites() {
        let mut full = doc("a", &[("x", 1), ("y", 1)]);
        let update = doc("a", &[("y", 2)]);
        full.apply_update(&update);
        assert_eq!(full.get("x"), Some(&serde_json::json!(1)));
        assert_eq!(full.get("y"), Some(&serde_json::json!(2)));
    }
}
