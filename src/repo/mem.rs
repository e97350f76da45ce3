use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, RwLock};

use crate::log_file::{LogFile, LogHandle};
use crate::Options;

use super::{LogIdent, Repo};

type SharedBytes = Arc<RwLock<Vec<u8>>>;

/// A log file backed by a `Vec<u8>`, the in-memory counterpart of a real
/// file handle. Unlike the teacher's `Segment` (which always appends,
/// `O_APPEND`-style), this behaves like an ordinary file: writes land at the
/// current position, since [`LogFile::append`] seeks explicitly before
/// writing.
#[derive(Clone, Default)]
pub struct MemHandle {
    pos: u64,
    buf: SharedBytes,
}

impl From<SharedBytes> for MemHandle {
    fn from(buf: SharedBytes) -> Self {
        Self { pos: 0, buf }
    }
}

impl Read for MemHandle {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let inner = self.buf.read().unwrap();
        let pos = self.pos as usize;
        if pos >= inner.len() {
            return Ok(0);
        }
        let n = (&inner[pos..]).read(out)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemHandle {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut inner = self.buf.write().unwrap();
        let pos = self.pos as usize;
        if pos + data.len() > inner.len() {
            inner.resize(pos + data.len(), 0);
        }
        inner[pos..pos + data.len()].copy_from_slice(data);
        self.pos += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(n) => {
                self.pos = n;
                return Ok(n);
            }
            SeekFrom::End(n) => (self.buf.read().unwrap().len() as u64, n),
            SeekFrom::Current(n) => (self.pos, n),
        };
        match base.checked_add_signed(offset) {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "seek out of bounds")),
        }
    }
}

impl LogHandle for MemHandle {
    fn sync_data(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn sync_all(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.buf.read().unwrap().len() as u64)
    }

    fn try_clone_handle(&self) -> io::Result<Box<dyn LogHandle>> {
        Ok(Box::new(MemHandle {
            pos: 0,
            buf: Arc::clone(&self.buf),
        }))
    }
}

/// In-memory [`Repo`], the counterpart of the teacher's `repo::Memory` used
/// throughout its test suite.
#[derive(Clone, Default)]
pub struct Memory(Arc<RwLock<BTreeMap<String, SharedBytes>>>);

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repo for Memory {
    fn create_log(&self, ident: LogIdent, opts: &Options) -> io::Result<LogFile> {
        let mut inner = self.0.write().unwrap();
        let name = ident.filename();
        if inner.contains_key(&name) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("log {name} already exists"),
            ));
        }
        let buf: SharedBytes = Default::default();
        inner.insert(name.clone(), Arc::clone(&buf));
        LogFile::from_handle(
            Box::new(MemHandle::from(buf)),
            name.into(),
            ident_id(ident),
            ident.is_buffer(),
            0,
            opts,
        )
    }

    fn open_log(&self, ident: LogIdent, opts: &Options) -> io::Result<LogFile> {
        let inner = self.0.read().unwrap();
        let name = ident.filename();
        let Some(buf) = inner.get(&name) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("log {name} does not exist")));
        };
        let len = buf.read().unwrap().len() as u64;
        let log = LogFile::from_handle(
            Box::new(MemHandle::from(Arc::clone(buf))),
            name.into(),
            ident_id(ident),
            ident.is_buffer(),
            len,
            opts,
        )?;
        if log.ends_with_commit().map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))? {
            log.set_capped_for_reopen();
        }
        Ok(log)
    }

    fn remove_log(&self, ident: LogIdent) -> io::Result<()> {
        let mut inner = self.0.write().unwrap();
        if inner.remove(&ident.filename()).is_none() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "log does not exist"));
        }
        Ok(())
    }

    fn existing_logs(&self) -> io::Result<Vec<LogIdent>> {
        let inner = self.0.read().unwrap();
        let mut tlogs = Vec::new();
        let mut buffers = Vec::new();
        for name in inner.keys() {
            if let Some(rest) = name.strip_prefix("buffer.tlog.") {
                if let Ok(nanos) = rest.parse::<u128>() {
                    buffers.push(LogIdent::Buffer(nanos));
                }
            } else if let Some(rest) = name.strip_prefix("tlog.") {
                if let Ok(id) = rest.parse::<u64>() {
                    tlogs.push(LogIdent::Tlog(id));
                }
            }
        }
        tlogs.sort_unstable();
        buffers.sort_unstable();
        tlogs.extend(buffers);
        Ok(tlogs)
    }
}

fn ident_id(ident: LogIdent) -> u64 {
    match ident {
        LogIdent::Tlog(id) => id,
        LogIdent::Buffer(nanos) => (nanos % u64::MAX as u128) as u64,
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, Write};

    use super::*;

    #[test]
    fn mem_handle_read_write_seek() {
        let mut handle = MemHandle::default();
        handle.write_all(b"hello").unwrap();
        handle.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 5];
        handle.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn create_then_open_round_trips_bytes() {
        let repo = Memory::new();
        let opts = Options::default();
        let log = repo.create_log(LogIdent::Tlog(0), &opts).unwrap();
        log.append(&crate::record::LogRecord::Commit { version: 1 }).unwrap();
        drop(log);

        let reopened = repo.open_log(LogIdent::Tlog(0), &opts).unwrap();
        assert!(reopened.ends_with_commit().unwrap());
    }
}
