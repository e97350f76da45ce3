//! On-disk framing of a single [`LogRecord`].
//!
//! The wire format follows the same encode-then-checksum idiom as the
//! teacher crate's `Commit`/`Header` (see `commit.rs` in the SpacetimeDB
//! commitlog): fixed-width little-endian header fields, a length-prefixed
//! variable payload, and a trailing `crc32c` over everything that precedes
//! it.
//!
//! ```text
//! [flags: u8][version: i64][prev_offset: i64]?[prev_version: i64]?[payload_len: u32][payload][crc32c: u32]
//! ```
//!
//! The `prev_offset`/`prev_version` pair is present only when
//! [`OpFlags::IN_PLACE_UPDATE`] is set.

use std::io::{self, Read, Write};

use crc32c::{Crc32cReader, Crc32cWriter};

use crate::document::Document;
use crate::error::{ChecksumMismatch, DecodeError, Traversal};

bitflags::bitflags! {
    /// Low 3 bits: op code. Bit `0x08`: `IN_PLACE_UPDATE`, which combines
    /// with [`OpFlags::ADD`] (`flags == 0x09`) rather than being its own op.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct OpFlags: u8 {
        const ADD             = 0x01;
        const DELETE          = 0x02;
        const DELETE_BY_QUERY = 0x03;
        const COMMIT          = 0x04;
        const IN_PLACE_UPDATE = 0x08;
    }
}

const OP_MASK: u8 = 0x07;

impl OpFlags {
    pub fn op_code(self) -> u8 {
        self.bits() & OP_MASK
    }

    pub fn is_in_place_update(self) -> bool {
        self.contains(OpFlags::IN_PLACE_UPDATE)
    }
}

/// A single mutation as it is appended to / read from a [`crate::log_file::LogFile`].
#[derive(Clone, Debug, PartialEq)]
pub enum LogRecord {
    Add {
        id: String,
        /// Lamport-style per-shard timestamp. Negative iff this add is a
        /// tombstone rewrite (never true for a plain `Add`, but the field is
        /// signed throughout to keep arithmetic uniform with `Delete`).
        version: i64,
        doc: Document,
        /// `Some((prev_offset, prev_version))` iff this is an in-place update.
        in_place_prev: Option<(i64, i64)>,
    },
    Delete {
        id: String,
        /// Negative: `|version|` is the tombstone's timestamp.
        version: i64,
    },
    DeleteByQuery {
        query: String,
        version: i64,
    },
    Commit {
        version: i64,
    },
}

impl LogRecord {
    pub fn version(&self) -> i64 {
        match self {
            LogRecord::Add { version, .. }
            | LogRecord::Delete { version, .. }
            | LogRecord::DeleteByQuery { version, .. }
            | LogRecord::Commit { version } => *version,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            LogRecord::Add { id, .. } | LogRecord::Delete { id, .. } => Some(id),
            LogRecord::DeleteByQuery { .. } | LogRecord::Commit { .. } => None,
        }
    }

    pub fn in_place_prev(&self) -> Option<(i64, i64)> {
        match self {
            LogRecord::Add { in_place_prev, .. } => *in_place_prev,
            _ => None,
        }
    }

    fn flags(&self) -> OpFlags {
        match self {
            LogRecord::Add { in_place_prev, .. } => {
                let mut f = OpFlags::ADD;
                if in_place_prev.is_some() {
                    f |= OpFlags::IN_PLACE_UPDATE;
                }
                f
            }
            LogRecord::Delete { .. } => OpFlags::DELETE,
            LogRecord::DeleteByQuery { .. } => OpFlags::DELETE_BY_QUERY,
            LogRecord::Commit { .. } => OpFlags::COMMIT,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            LogRecord::Add { doc, .. } => serde_json::to_vec(doc).expect("Document always serializes"),
            LogRecord::Delete { id, .. } => id.as_bytes().to_vec(),
            LogRecord::DeleteByQuery { query, .. } => query.as_bytes().to_vec(),
            LogRecord::Commit { .. } => Vec::new(),
        }
    }

    /// Serialize and write `self` to `out`, returning the number of bytes
    /// written (the caller uses this to reserve the next offset).
    pub fn write<W: Write>(&self, out: W) -> io::Result<usize> {
        let mut out = Crc32cWriter::new(out);

        let flags = self.flags();
        out.write_all(&[flags.bits()])?;
        out.write_all(&self.version().to_le_bytes())?;

        if let Some((prev_offset, prev_version)) = self.in_place_prev() {
            out.write_all(&prev_offset.to_le_bytes())?;
            out.write_all(&prev_version.to_le_bytes())?;
        }

        let payload = self.payload();
        out.write_all(&(payload.len() as u32).to_le_bytes())?;
        out.write_all(&payload)?;

        let crc = out.crc32c();
        let mut out = out.into_inner();
        out.write_all(&crc.to_le_bytes())?;

        let header_len = 1 + 8 + if self.in_place_prev().is_some() { 16 } else { 0 } + 4;
        Ok(header_len + payload.len() + 4)
    }

    /// Read one [`LogRecord`] from `reader`, starting at `offset` (used only
    /// for error reporting).
    ///
    /// Returns `Ok(None)` at a clean EOF (no bytes at all could be read),
    /// which callers treat as "end of log". A *partial* record (EOF midway
    /// through the header or payload) is reported as a [`Traversal::Io`]
    /// wrapping an `UnexpectedEof`, which the caller treats as a tolerated
    /// trailing corruption per §4.1's failure semantics.
    pub fn read<R: Read>(reader: R, offset: u64) -> Result<Option<Self>, Traversal> {
        let mut reader = Crc32cReader::new(reader);

        let mut flags_byte = [0u8; 1];
        match reader.read_exact(&mut flags_byte) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Traversal::Io(e)),
        }
        let flags = OpFlags::from_bits(flags_byte[0]).ok_or(Traversal::UnknownOpCode(flags_byte[0]))?;

        let version = read_i64(&mut reader)?;

        let in_place_prev = if flags.is_in_place_update() {
            let prev_offset = read_i64(&mut reader)?;
            let prev_version = read_i64(&mut reader)?;
            Some((prev_offset, prev_version))
        } else {
            None
        };

        let len = read_u32(&mut reader)? as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).map_err(Traversal::Io)?;

        let computed = reader.crc32c();
        let stored = read_u32_plain(reader.into_inner())?;
        if computed != stored {
            return Err(Traversal::Checksum {
                offset,
                source: ChecksumMismatch,
            });
        }

        let op = flags.op_code();
        let record = match op {
            op if op == OpFlags::ADD.bits() => {
                let doc: Document = serde_json::from_slice(&payload).map_err(|e| Traversal::Decode {
                    offset,
                    source: DecodeError(e.to_string()),
                })?;
                let id = doc.id().ok_or_else(|| Traversal::Decode {
                    offset,
                    source: DecodeError("add record document has no id field".to_string()),
                })?;
                LogRecord::Add {
                    id,
                    version,
                    doc,
                    in_place_prev,
                }
            }
            op if op == OpFlags::DELETE.bits() => {
                let id = String::from_utf8(payload).map_err(|e| Traversal::Decode {
                    offset,
                    source: DecodeError(e.to_string()),
                })?;
                LogRecord::Delete { id, version }
            }
            op if op == OpFlags::DELETE_BY_QUERY.bits() => {
                let query = String::from_utf8(payload).map_err(|e| Traversal::Decode {
                    offset,
                    source: DecodeError(e.to_string()),
                })?;
                LogRecord::DeleteByQuery { query, version }
            }
            op if op == OpFlags::COMMIT.bits() => LogRecord::Commit { version },
            other => return Err(Traversal::UnknownOpCode(other)),
        };

        Ok(Some(record))
    }
}

fn read_i64<R: Read>(mut r: R) -> Result<i64, Traversal> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(Traversal::Io)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_u32<R: Read>(mut r: R) -> Result<u32, Traversal> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(Traversal::Io)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u32_plain<R: Read>(mut r: R) -> Result<u32, Traversal> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(Traversal::Io)?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;

    fn doc(fields: &[(&str, i64)]) -> Document {
        let mut map = BTreeMap::new();
        for (k, v) in fields {
            map.insert((*k).to_string(), serde_json::json!(v));
        }
        Document::new("a".to_string(), map)
    }

    #[test]
    fn add_roundtrip() {
        let record = LogRecord::Add {
            id: "a".to_string(),
            version: 10,
            doc: doc(&[("x", 1)]),
            in_place_prev: None,
        };

        let mut buf = Vec::new();
        record.write(&mut buf).unwrap();
        let decoded = LogRecord::read(&mut buf.as_slice(), 0).unwrap().unwrap();

        assert_eq!(record, decoded);
    }

    #[test]
    fn in_place_update_roundtrip() {
        let record = LogRecord::Add {
            id: "a".to_string(),
            version: 11,
            doc: doc(&[("y", 2)]),
            in_place_prev: Some((42, 10)),
        };

        let mut buf = Vec::new();
        record.write(&mut buf).unwrap();
        let decoded = LogRecord::read(&mut buf.as_slice(), 0).unwrap().unwrap();

        assert_eq!(record, decoded);
    }

    #[test]
    fn delete_by_query_roundtrip() {
        let record = LogRecord::DeleteByQuery {
            query: "*:*".to_string(),
            version: -11,
        };

        let mut buf = Vec::new();
        record.write(&mut buf).unwrap();
        let decoded = LogRecord::read(&mut buf.as_slice(), 0).unwrap().unwrap();

        assert_eq!(record, decoded);
    }

    #[test]
    fn commit_roundtrip() {
        let record = LogRecord::Commit { version: 5 };

        let mut buf = Vec::new();
        record.write(&mut buf).unwrap();
        let decoded = LogRecord::read(&mut buf.as_slice(), 0).unwrap().unwrap();

        assert_eq!(record, decoded);
    }

    #[test]
    fn eof_is_none_not_error() {
        let buf: Vec<u8> = Vec::new();
        assert!(LogRecord::read(&mut buf.as_slice(), 0).unwrap().is_none());
    }

    proptest! {
        #[test]
        fn bitflip_is_checksum_error_or_decode_error(pos in 0usize..64, mask in any::<u8>().prop_filter("nonzero", |m| *m != 0)) {
            let record = LogRecord::Add {
                id: "a".to_string(),
                version: 42,
                doc: doc(&[("f0", 1), ("f1", 2), ("f2", 3)]),
                in_place_prev: None,
            };

            let mut buf = Vec::new();
            record.write(&mut buf).unwrap();

            if pos < buf.len() {
                buf[pos] ^= mask;
                // A flip may coincidentally still be valid, so just check we never
                // get a different-but-Ok record back.
                match LogRecord::read(&mut buf.as_slice(), 0) {
                    Ok(Some(decoded)) => assert_eq!(decoded, record, "bitflip produced a different valid record"),
                    Ok(None) => {}
                    Err(_) => {}
                }
            }
        }
    }
}
