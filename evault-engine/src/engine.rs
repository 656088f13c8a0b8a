//! # Engine
//!
//! Single entry point for executing requests against the store.
//!
//! ## Design Principles
//!
//! 1. **Closed Dispatch**: Requests resolve through the command table into a
//!    typed [`Command`]; unknown names never reach a handler.
//! 2. **Write-Ahead Ordering**: A mutation is appended to the log, then
//!    applied, then broadcast, all under one store write guard. The log and
//!    the replication stream therefore see writes in apply order.
//! 3. **Shared Batches**: `EXEC` runs every queued request under one guard
//!    through the same path as single requests.
//! 4. **Storage Only**: Session commands (MULTI/EXEC/DISCARD/SYNC/INFO) belong
//!    to the connection and are rejected here.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use tracing::{error, info, warn};

use evault_common::{encode_command, ErrorCategory, EvError, EvResult, WireValue};

use crate::aof::AppendLog;
use crate::command::{Command, CommandTable};
use crate::peers::{PeerSet, PeerSubscription};
use crate::snapshot::{SnapshotStats, SnapshotWorker, Snapshotter};
use crate::store::{Store, StoreWriter, StoredEntry};

/// Where the engine keeps its files.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `None` runs without an append log.
    pub aof_path: Option<PathBuf>,
    pub snapshot_path: PathBuf,
}

pub struct Engine {
    store: Arc<Store>,
    log: Option<AppendLog>,
    snapshots: Arc<Snapshotter>,
    peers: PeerSet,
    commands: CommandTable,
}

impl Engine {
    /// Restores state (snapshot first, then the log on top) and opens the
    /// log for appending. Any failure here is fatal to startup.
    pub fn open(config: EngineConfig) -> EvResult<Self> {
        let store = Arc::new(Store::new());
        let snapshots = Arc::new(Snapshotter::new(config.snapshot_path));
        let restored = snapshots.load(&store)?;
        info!(
            path = %snapshots.path().display(),
            entries = restored,
            "snapshot loaded"
        );

        let log = config.aof_path.map(AppendLog::open).transpose()?;
        let engine = Engine {
            store,
            log,
            snapshots,
            peers: PeerSet::new(),
            commands: CommandTable::builtin(),
        };

        if let Some(log) = &engine.log {
            let replayed = engine.replay(log)?;
            info!(
                path = %log.path().display(),
                records = replayed,
                keys = engine.store.len(),
                "append log replayed"
            );
        }
        Ok(engine)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    /// Executes one request and returns its reply. Errors become `Error`
    /// replies; persistence failures are also logged.
    pub fn execute(&self, tokens: &[Bytes]) -> WireValue {
        self.dispatch(tokens, None)
            .unwrap_or_else(|err| self.reject(err))
    }

    /// Executes queued requests as one batch under a single store write
    /// guard. One reply per request, in order; a failing slot does not stop
    /// the rest.
    pub fn execute_batch(&self, requests: &[Vec<Bytes>]) -> Vec<WireValue> {
        let mut writer = self.store.write();
        let mut replies = Vec::with_capacity(requests.len());
        for tokens in requests {
            let reply = self
                .dispatch(tokens, Some(&mut writer))
                .unwrap_or_else(|err| self.reject(err));
            replies.push(reply);
        }
        replies
    }

    /// Registers a replication peer and returns the frames that rebuild the
    /// current dataset on it. Registration happens under the store write
    /// guard, so every later mutation reaches the peer's queue exactly once
    /// and after these frames.
    pub fn attach_peer(&self) -> (PeerSubscription, Vec<Bytes>) {
        let writer = self.store.write();
        let now = SystemTime::now();
        let frames = writer
            .live_entries()
            .into_iter()
            .map(|entry| full_sync_frame(entry, now))
            .collect();
        let subscription = self.peers.register();
        drop(writer);
        (subscription, frames)
    }

    /// Saves a snapshot on the calling thread.
    pub fn save(&self) -> EvResult<SnapshotStats> {
        self.snapshots.save(&self.store)
    }

    /// Starts a save on a background thread and returns immediately.
    pub fn bgsave(&self) -> WireValue {
        let snapshots = Arc::clone(&self.snapshots);
        let store = Arc::clone(&self.store);
        let spawned = thread::Builder::new()
            .name("evault-bgsave".to_string())
            .spawn(move || {
                let started = Instant::now();
                match snapshots.save(&store) {
                    Ok(stats) => info!(
                        entries = stats.entries,
                        bytes = stats.bytes,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "BGSAVE completed"
                    ),
                    Err(err) => error!(error = %err, "BGSAVE failed"),
                }
            });
        match spawned {
            Ok(_) => WireValue::simple("Background saving started"),
            Err(err) => self.reject(EvError::persistence("spawn bgsave", err)),
        }
    }

    /// Starts periodic background snapshots.
    pub fn start_snapshot_worker(&self, interval: Duration) -> EvResult<SnapshotWorker> {
        SnapshotWorker::start(
            Arc::clone(&self.snapshots),
            Arc::clone(&self.store),
            interval,
        )
    }

    fn dispatch(
        &self,
        tokens: &[Bytes],
        batch: Option<&mut StoreWriter<'_>>,
    ) -> EvResult<WireValue> {
        let (spec, command) = self.commands.resolve(tokens)?;
        match command {
            Command::Ping(None) => Ok(WireValue::simple("PONG")),
            Command::Ping(Some(message)) => Ok(WireValue::bulk(message)),
            Command::Get { key } => {
                let value = match batch {
                    Some(writer) => writer.get(&key),
                    None => self.store.get(&key),
                };
                Ok(value.map_or_else(WireValue::null, WireValue::bulk))
            }
            Command::Set { .. } | Command::Del { .. } => match batch {
                Some(writer) => self.write_through(writer, tokens, command),
                None => self.write_through(&mut self.store.write(), tokens, command),
            },
            Command::Bgsave => Ok(self.bgsave()),
            Command::Multi | Command::Exec | Command::Discard | Command::Sync | Command::Info => {
                Err(EvError::SessionCommand(spec.name))
            }
        }
    }

    fn write_through(
        &self,
        writer: &mut StoreWriter<'_>,
        tokens: &[Bytes],
        command: Command,
    ) -> EvResult<WireValue> {
        if let Some(log) = &self.log {
            log.append(tokens)?;
        }
        let reply = apply_write(writer, command)?;
        self.peers.broadcast(encode_command(tokens));
        Ok(reply)
    }

    fn replay(&self, log: &AppendLog) -> EvResult<usize> {
        log.replay(|record| {
            let Some(tokens) = record.into_tokens() else {
                warn!("skipping append log record that is not a command array");
                return;
            };
            match self.commands.resolve(&tokens) {
                Ok((spec, command)) if spec.mutating => {
                    if let Err(err) = apply_write(&mut self.store.write(), command) {
                        warn!(error = %err, "skipping append log record");
                    }
                }
                Ok((spec, _)) => warn!(command = spec.name, "skipping non-mutating log record"),
                Err(err) => warn!(error = %err, "skipping unreadable log record"),
            }
        })
    }

    fn reject(&self, err: EvError) -> WireValue {
        if err.category() == ErrorCategory::Persistence {
            error!(error = %err, "write rejected");
        }
        err.reply()
    }
}

fn full_sync_frame(entry: StoredEntry, now: SystemTime) -> Bytes {
    let mut tokens = vec![Bytes::from_static(b"SET"), entry.key, entry.value];
    if let Some(at) = entry.expires_at {
        // At least 1ms so a key about to lapse is not sent as PX 0.
        let remaining = at.duration_since(now).unwrap_or_default().as_millis().max(1);
        tokens.push(Bytes::from_static(b"PX"));
        tokens.push(Bytes::from(remaining.to_string()));
    }
    encode_command(&tokens)
}

fn apply_write(writer: &mut StoreWriter<'_>, command: Command) -> EvResult<WireValue> {
    match command {
        Command::Set { key, value, ttl } => {
            writer.set(key, value, ttl);
            Ok(WireValue::ok())
        }
        Command::Del { key } => Ok(WireValue::Integer(i64::from(writer.del(&key)))),
        _ => Err(EvError::InvalidRequest("not a write command")),
    }
}
