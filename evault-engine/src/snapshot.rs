//! # Snapshot Files
//!
//! Purpose: Persist a point-in-time copy of the whole store in a compact
//! binary file, independent of the append log.
//!
//! ## Design Principles
//!
//! 1. **Atomic Replace**: Write to `<path>.tmp`, sync, then rename, so the
//!    canonical path always holds a complete snapshot.
//! 2. **Read-Lock Copy**: Saving copies under read locks only; traffic keeps
//!    flowing while the file is written.
//! 3. **Versioned Format**: A magic token and version byte reject foreign or
//!    future files at startup.
//!
//! ## File Layout
//!
//! ```text
//! +-----------+---------+-------------+------------------------+
//! | magic:9B  | ver:1B  | count:4B LE | count x entry          |
//! +-----------+---------+-------------+------------------------+
//!
//! entry:
//! +------------+-----+--------------+-------+---------+----------------------+
//! | klen:4B LE | key | vlen:4B LE   | value | flag:1B | expiry:8B LE (flag=1)|
//! +------------+-----+--------------+-------+---------+----------------------+
//! ```
//!
//! The expiry is a signed Unix timestamp in nanoseconds.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use tracing::{error, info};

use evault_common::{EvError, EvResult};

use crate::store::{Store, StoredEntry};

/// File magic token.
pub const SNAPSHOT_MAGIC: &[u8] = b"ECHOVAULT";

/// Current format version.
pub const SNAPSHOT_VERSION: u8 = 1;

/// Outcome of a successful save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotStats {
    pub entries: usize,
    pub bytes: usize,
}

/// Saves and loads snapshots at a fixed path.
pub struct Snapshotter {
    path: PathBuf,
    // Timer and BGSAVE saves share one temp path.
    save_lock: Mutex<()>,
}

impl Snapshotter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Snapshotter {
            path: path.into(),
            save_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a consistent copy of `store` and atomically replaces the file.
    pub fn save(&self, store: &Store) -> EvResult<SnapshotStats> {
        let _guard = self.save_lock.lock();
        let entries = store.snapshot();
        let data = encode_snapshot(&entries);

        let tmp = temp_path(&self.path);
        if let Err(err) = write_synced(&tmp, &data) {
            let _ = fs::remove_file(&tmp);
            return Err(EvError::persistence("write snapshot", err));
        }
        fs::rename(&tmp, &self.path)
            .map_err(|err| EvError::persistence("rename snapshot into place", err))?;

        Ok(SnapshotStats {
            entries: entries.len(),
            bytes: data.len(),
        })
    }

    /// Restores the snapshot into `store`. A missing file is a fresh start.
    ///
    /// Entries whose expiry has already passed are dropped. Returns the
    /// number of entries restored.
    pub fn load(&self, store: &Store) -> EvResult<usize> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(EvError::persistence("read snapshot", err)),
        };
        let entries = decode_snapshot(Bytes::from(data), SystemTime::now())?;
        let restored = entries.len();
        store.restore(entries);
        Ok(restored)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// Serializes entries into the snapshot format.
pub fn encode_snapshot(entries: &[StoredEntry]) -> Bytes {
    let mut out = BytesMut::with_capacity(SNAPSHOT_MAGIC.len() + 5);
    out.put_slice(SNAPSHOT_MAGIC);
    out.put_u8(SNAPSHOT_VERSION);
    // Bulk payloads are capped well below 4 GiB by the codec.
    out.put_u32_le(entries.len() as u32);
    for entry in entries {
        out.put_u32_le(entry.key.len() as u32);
        out.put_slice(&entry.key);
        out.put_u32_le(entry.value.len() as u32);
        out.put_slice(&entry.value);
        match entry.expires_at {
            Some(at) => {
                out.put_u8(1);
                out.put_i64_le(to_unix_nanos(at));
            }
            None => out.put_u8(0),
        }
    }
    out.freeze()
}

/// Parses a snapshot, dropping entries that expired at or before `now`.
pub fn decode_snapshot(mut data: Bytes, now: SystemTime) -> EvResult<Vec<StoredEntry>> {
    let magic = take(&mut data, SNAPSHOT_MAGIC.len(), "magic")?;
    if magic != SNAPSHOT_MAGIC {
        return Err(EvError::SnapshotMagic);
    }
    let version = take(&mut data, 1, "version")?[0];
    if version != SNAPSHOT_VERSION {
        return Err(EvError::SnapshotVersion(version));
    }
    let count = read_u32(&mut data, "entry count")?;

    let mut entries = Vec::with_capacity((count as usize).min(1 << 16));
    for _ in 0..count {
        let key_len = read_u32(&mut data, "key length")? as usize;
        let key = take(&mut data, key_len, "key")?;
        let value_len = read_u32(&mut data, "value length")? as usize;
        let value = take(&mut data, value_len, "value")?;
        let flag = take(&mut data, 1, "expiry flag")?[0];
        let expires_at = match flag {
            0 => None,
            1 => {
                if data.remaining() < 8 {
                    return Err(EvError::SnapshotTruncated("expiry"));
                }
                Some(from_unix_nanos(data.get_i64_le()))
            }
            other => return Err(EvError::SnapshotExpiryFlag(other)),
        };

        if expires_at.is_some_and(|at| at <= now) {
            continue;
        }
        entries.push(StoredEntry {
            key,
            value,
            expires_at,
        });
    }
    Ok(entries)
}

fn take(data: &mut Bytes, len: usize, what: &'static str) -> EvResult<Bytes> {
    if data.remaining() < len {
        return Err(EvError::SnapshotTruncated(what));
    }
    Ok(data.split_to(len))
}

fn read_u32(data: &mut Bytes, what: &'static str) -> EvResult<u32> {
    if data.remaining() < 4 {
        return Err(EvError::SnapshotTruncated(what));
    }
    Ok(data.get_u32_le())
}

fn to_unix_nanos(at: SystemTime) -> i64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_nanos())
            .map(|n| -n)
            .unwrap_or(i64::MIN),
    }
}

fn from_unix_nanos(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}

struct WorkerSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Periodic background saver.
///
/// Runs on its own thread for the lifetime of the handle. A failed save is
/// logged and the next tick tries again. `stop` (or drop) wakes the thread
/// and joins it.
pub struct SnapshotWorker {
    signal: Arc<WorkerSignal>,
    handle: Option<JoinHandle<()>>,
}

impl SnapshotWorker {
    pub fn start(
        snapshotter: Arc<Snapshotter>,
        store: Arc<Store>,
        interval: Duration,
    ) -> EvResult<Self> {
        let signal = Arc::new(WorkerSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("evault-snapshot".to_string())
            .spawn(move || run_worker(&thread_signal, &snapshotter, &store, interval))
            .map_err(|err| EvError::persistence("spawn snapshot worker", err))?;

        info!(interval_secs = interval.as_secs(), "background snapshots enabled");
        Ok(SnapshotWorker {
            signal,
            handle: Some(handle),
        })
    }

    /// Signals the worker and waits for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        let _ = handle.join();
    }
}

impl Drop for SnapshotWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(signal: &WorkerSignal, snapshotter: &Snapshotter, store: &Store, interval: Duration) {
    loop {
        {
            let mut stopped = signal.stopped.lock();
            if !*stopped {
                signal.wake.wait_for(&mut stopped, interval);
            }
            if *stopped {
                return;
            }
        }

        let started = Instant::now();
        match snapshotter.save(store) {
            Ok(stats) => info!(
                path = %snapshotter.path().display(),
                entries = stats.entries,
                bytes = stats.bytes,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "snapshot saved"
            ),
            Err(err) => error!(error = %err, "scheduled snapshot failed"),
        }
    }
}
