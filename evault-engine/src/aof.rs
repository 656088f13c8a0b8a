//! # Append-Only Log
//!
//! Every mutating request is written here, verbatim in its wire encoding,
//! and synced before the mutation is applied. Replaying the file through the
//! same handlers rebuilds the store.
//!
//! ## Design Principles
//!
//! 1. **Write-Ahead**: `append` returns only after `sync_data`; an error means
//!    the caller must not apply the mutation.
//! 2. **Serialized Writers**: One mutex around the file handle keeps records
//!    from interleaving.
//! 3. **No Extra Framing**: The wire format already delimits records, so the
//!    file is a plain concatenation of request arrays.
//! 4. **Whole Records Only**: A failed write or sync is cut back to the last
//!    good length. If that cut fails too, the log refuses further appends.
//!
//! A record cut short by a crash is trimmed on replay so later appends start
//! on a clean boundary.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use evault_common::{encode_command, EvError, EvResult, RespParser, WireValue};

/// File operations the log needs besides writing.
trait LogFile: Write {
    fn len(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl LogFile for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Mutex-guarded file plus the length of its last complete record.
struct LogState<F> {
    file: F,
    len: u64,
    poisoned: bool,
}

impl<F: LogFile> LogState<F> {
    fn new(file: F) -> io::Result<Self> {
        let len = file.len()?;
        Ok(LogState {
            file,
            len,
            poisoned: false,
        })
    }

    fn append(&mut self, record: &[u8]) -> EvResult<()> {
        if self.poisoned {
            return Err(EvError::LogPoisoned);
        }
        let written = self
            .file
            .write_all(record)
            .map_err(|err| EvError::persistence("append log record", err))
            .and_then(|()| {
                self.file
                    .sync()
                    .map_err(|err| EvError::persistence("sync append log", err))
            });
        match written {
            Ok(()) => {
                self.len += record.len() as u64;
                Ok(())
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    /// Cuts the file back to the last complete record.
    fn rollback(&mut self) {
        let restored = self.file.len().and_then(|current| {
            if current == self.len {
                return Ok(());
            }
            self.file.truncate(self.len)?;
            self.file.sync()
        });
        if let Err(err) = restored {
            error!(
                error = %err,
                len = self.len,
                "append log rollback failed; refusing further appends"
            );
            self.poisoned = true;
        }
    }
}

pub struct AppendLog {
    path: PathBuf,
    state: Mutex<LogState<File>>,
}

impl AppendLog {
    /// Opens the log for appending, creating it if missing.
    pub fn open(path: impl AsRef<Path>) -> EvResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(|err| EvError::persistence("open append log", err))?;
        Self::with_file(path, file)
    }

    /// Opens an existing log without write access, so every append fails.
    #[cfg(test)]
    pub(crate) fn open_read_only(path: impl AsRef<Path>) -> EvResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|err| EvError::persistence("open append log", err))?;
        Self::with_file(path, file)
    }

    fn with_file(path: PathBuf, file: File) -> EvResult<Self> {
        let state =
            LogState::new(file).map_err(|err| EvError::persistence("stat append log", err))?;
        debug!(path = %path.display(), len = state.len, "append log opened");
        Ok(AppendLog {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one request record and forces it to stable storage.
    ///
    /// On failure the file is left as it was before the call.
    pub fn append(&self, tokens: &[Bytes]) -> EvResult<()> {
        let record = encode_command(tokens);
        self.state.lock().append(&record)
    }

    /// Decodes every record from the start of the file and hands it to
    /// `apply`, in file order. Returns the number of records applied.
    pub fn replay<F>(&self, mut apply: F) -> EvResult<usize>
    where
        F: FnMut(WireValue),
    {
        let mut state = self.state.lock();
        let data = std::fs::read(&self.path)
            .map_err(|err| EvError::persistence("read append log", err))?;
        let total = data.len();
        let mut buf = BytesMut::from(&data[..]);
        let mut parser = RespParser::new();
        let mut applied = 0;

        loop {
            let offset = total - buf.len();
            match parser.parse(&mut buf) {
                Ok(Some(record)) => {
                    apply(record);
                    applied += 1;
                }
                Ok(None) => break,
                Err(source) => return Err(EvError::CorruptLog { offset, source }),
            }
        }

        let valid = (total - buf.len()) as u64;
        if !buf.is_empty() {
            warn!(
                path = %self.path.display(),
                trailing_bytes = buf.len(),
                "dropping truncated record at end of append log"
            );
            state
                .file
                .truncate(valid)
                .map_err(|err| EvError::persistence("trim append log", err))?;
        }
        state.len = valid;
        Ok(applied)
    }
}
