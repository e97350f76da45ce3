use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::{io, sync::Arc};

use log::debug;

use crate::log_file::LogFile;
use crate::Options;

use super::{LogIdent, Repo};

const TLOG_PREFIX: &str = "tlog.";
const BUFFER_PREFIX: &str = "buffer.tlog.";

/// A [`Repo`] which stores log files as ordinary files on disk, the way the
/// teacher's `Fs` stores segments (see `repo/fs.rs`).
#[derive(Clone)]
pub struct Fs {
    root: Arc<PathBuf>,
}

impl fmt::Debug for Fs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fs").field("root", &self.root).finish()
    }
}

impl fmt::Display for Fs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.display())
    }
}

impl Fs {
    /// Open a repository rooted at `root`, which must name an extant,
    /// writeable directory.
    pub fn new(root: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root: Arc::new(root) })
    }

    pub fn path(&self, ident: LogIdent) -> PathBuf {
        self.root.join(ident.filename())
    }
}

impl Repo for Fs {
    fn create_log(&self, ident: LogIdent, opts: &Options) -> io::Result<LogFile> {
        debug!("creating log file {}", ident.filename());
        LogFile::create(self.path(ident), ident_id(ident), ident.is_buffer(), opts)
    }

    fn open_log(&self, ident: LogIdent, opts: &Options) -> io::Result<LogFile> {
        LogFile::open_for_append(self.path(ident), ident_id(ident), ident.is_buffer(), opts)
    }

    fn remove_log(&self, ident: LogIdent) -> io::Result<()> {
        fs::remove_file(self.path(ident))
    }

    fn existing_logs(&self) -> io::Result<Vec<LogIdent>> {
        let mut tlogs = Vec::new();
        let mut buffers = Vec::new();

        for entry in fs::read_dir(self.root.as_path())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if let Some(rest) = name.strip_prefix(BUFFER_PREFIX) {
                if let Ok(nanos) = rest.parse::<u128>() {
                    buffers.push(LogIdent::Buffer(nanos));
                }
            } else if let Some(rest) = name.strip_prefix(TLOG_PREFIX) {
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
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn existing_logs_sorted_tlogs_then_buffers() {
        let dir = tempdir().unwrap();
        let repo = Fs::new(dir.path().to_path_buf()).unwrap();
        let opts = Options::default();

        repo.create_log(LogIdent::Tlog(2), &opts).unwrap();
        repo.create_log(LogIdent::Tlog(1), &opts).unwrap();
        repo.create_log(LogIdent::Buffer(999), &opts).unwrap();

        let logs = repo.existing_logs().unwrap();
        assert_eq!(logs, vec![LogIdent::Tlog(1), LogIdent::Tlog(2), LogIdent::Buffer(999)]);
    }

    #[test]
    fn create_log_twice_fails() {
        let dir = tempdir().unwrap();
        let repo = Fs::new(dir.path().to_path_buf()).unwrap();
        let opts = Options::default();

        repo.create_log(LogIdent::Tlog(0), &opts).unwrap();
        assert_eq!(
            repo.create_log(LogIdent::Tlog(0), &opts).unwrap_err().kind(),
            io::ErrorKind::AlreadyExists
        );
    }
}
