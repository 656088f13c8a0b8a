//! # Server Configuration
//!
//! Command-line flags (with environment fallbacks) and the paths derived
//! from them. The parsed struct is read-only for the rest of the process.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use evault_common::{EvError, EvResult};
use evault_engine::EngineConfig;

/// EchoVault - in-memory key-value server with AOF, snapshots and replication.
#[derive(Parser, Debug, Clone)]
#[command(name = "evault-server")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Port to listen on.
    #[arg(long, env = "EVAULT_PORT", default_value_t = 6379)]
    pub port: u16,

    /// Address to bind.
    #[arg(long, env = "EVAULT_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Start as a replica of "<host> <port>". Empty means primary.
    #[arg(long = "replicaof", env = "EVAULT_REPLICAOF", default_value = "")]
    pub replica_of: String,

    /// Directory for the append log and snapshot files.
    #[arg(long, env = "EVAULT_DIR", default_value = ".")]
    pub dir: PathBuf,

    /// Seconds between background snapshots; 0 disables them.
    #[arg(long = "save-interval", env = "EVAULT_SAVE_INTERVAL", default_value_t = 60)]
    pub save_interval_secs: u64,
}

impl Config {
    /// Resolves the replication role from `--replicaof`.
    pub fn role(&self) -> EvResult<Role> {
        Ok(match ReplicaOf::parse(&self.replica_of)? {
            Some(upstream) => Role::Replica(upstream),
            None => Role::Primary,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn aof_path(&self) -> PathBuf {
        self.dir.join(format!("database_{}.aof", self.port))
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(format!("database_{}.rdb", self.port))
    }

    pub fn save_interval(&self) -> Option<Duration> {
        (self.save_interval_secs > 0).then(|| Duration::from_secs(self.save_interval_secs))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            aof_path: Some(self.aof_path()),
            snapshot_path: self.snapshot_path(),
        }
    }
}

/// Upstream primary address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaOf {
    pub host: String,
    pub port: u16,
}

impl ReplicaOf {
    /// Parses `"<host> <port>"`. Blank input yields `None`.
    pub fn parse(text: &str) -> EvResult<Option<Self>> {
        let mut parts = text.split_whitespace();
        let Some(host) = parts.next() else {
            return Ok(None);
        };
        let port = parts
            .next()
            .and_then(|port| port.parse::<u16>().ok())
            .ok_or_else(|| EvError::Config(format!("replicaof needs \"<host> <port>\", got {text:?}")))?;
        if parts.next().is_some() {
            return Err(EvError::Config(format!(
                "replicaof takes exactly two fields, got {text:?}"
            )));
        }
        Ok(Some(ReplicaOf {
            host: host.to_string(),
            port,
        }))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ReplicaOf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.host, self.port)
    }
}

/// Replication role, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica(ReplicaOf),
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Replica(_) => "replica",
        }
    }
}
