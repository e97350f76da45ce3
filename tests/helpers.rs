//! Shared test scaffolding, the way the teacher's `tests/io.rs` keeps a
//! small `enable_logging` helper alongside its integration suites.

use std::collections::BTreeMap;

use ulog::repo::Memory;
use ulog::update_log::{AddCmd, DeleteByQueryCmd, DeleteCmd};
use ulog::{Document, Options, UpdateLog};

#[allow(dead_code)]
pub fn enable_logging() {
    ulog::enable_logging();
}

pub fn opts() -> Options {
    Options {
        doc_lock_timeout_ms: 1000,
        ..Options::default()
    }
}

pub fn open() -> UpdateLog<Memory> {
    UpdateLog::open(Memory::new(), opts()).expect("open in-memory update log")
}

pub fn doc(id: &str, x: i64) -> Document {
    let mut fields = BTreeMap::new();
    fields.insert("x".to_string(), serde_json::json!(x));
    Document::new(id.to_string(), fields)
}

pub fn add_cmd(id: &str, version: i64, x: i64) -> AddCmd {
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

pub fn delete_cmd(id: &str, version: i64) -> DeleteCmd {
    DeleteCmd {
        id: id.to_string(),
        version,
        is_replay: false,
    }
}

pub fn dbq_cmd(query: &str, version: i64) -> DeleteByQueryCmd {
    DeleteByQueryCmd {
        query: query.to_string(),
        version,
        ignore_index_writer: false,
        is_replay: false,
    }
}
