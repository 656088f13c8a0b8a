pub mod aof;
pub mod command;
pub mod engine;
pub mod peers;
pub mod snapshot;
pub mod store;

pub use aof::AppendLog;
pub use command::{Command, CommandKind, CommandSpec, CommandTable};
pub use engine::{Engine, EngineConfig};
pub use peers::{PeerSet, PeerSubscription};
pub use snapshot::{SnapshotStats, SnapshotWorker, Snapshotter};
pub use store::{Store, StoreWriter, StoredEntry};
