//! # EchoVault Error Types
//!
//! ## Design Principles
//!
//! 1. **One Error Enum**: Every layer reports through `EvError` so the session
//!    can turn any failure into a wire reply.
//! 2. **Categorized Variants**: Each variant maps to a coarse category that
//!    decides whether the connection survives.
//! 3. **Wire-Ready Messages**: `Display` text is the reply body without the
//!    `ERR` prefix; `reply()` adds it.

use std::io;

use thiserror::Error;

use crate::codec::RespError;
use crate::protocol::WireValue;

/// Result type used across EchoVault components.
pub type EvResult<T> = core::result::Result<T, EvError>;

/// High-level category for grouping errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCategory {
    /// Bad arguments or transaction misuse; the connection stays open.
    Command,
    /// Malformed wire input; the connection is closed after the reply.
    Protocol,
    /// Log or snapshot I/O and snapshot format failures.
    Persistence,
    /// Upstream link failures on a replica.
    Replication,
    /// Invalid startup configuration.
    Config,
}

impl ErrorCategory {
    /// Returns true if the connection that produced the error must be closed.
    pub const fn closes_connection(self) -> bool {
        matches!(self, Self::Protocol)
    }
}

#[derive(Debug, Error)]
pub enum EvError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),

    #[error("value is not an integer or out of range")]
    NotInteger,

    #[error("syntax error")]
    Syntax,

    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("MULTI calls can not be nested")]
    NestedMulti,

    #[error("EXEC without MULTI")]
    ExecWithoutMulti,

    #[error("DISCARD without MULTI")]
    DiscardWithoutMulti,

    #[error("Command not allowed inside a transaction")]
    NotAllowedInMulti,

    #[error("'{0}' is handled by the connection, not the engine")]
    SessionCommand(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(#[from] RespError),

    #[error("persistence failure: {context}: {source}")]
    Persistence {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("persistence failure: append log disabled after a failed rollback")]
    LogPoisoned,

    #[error("append log corrupt at byte {offset}: {source}")]
    CorruptLog {
        offset: usize,
        #[source]
        source: RespError,
    },

    #[error("snapshot has bad magic")]
    SnapshotMagic,

    #[error("unsupported snapshot version {0}")]
    SnapshotVersion(u8),

    #[error("snapshot truncated while reading {0}")]
    SnapshotTruncated(&'static str),

    #[error("snapshot entry has invalid expiry flag {0}")]
    SnapshotExpiryFlag(u8),

    #[error("replication link failure: {0}")]
    Replication(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EvError {
    /// Wraps an I/O error with a short description of the failed step.
    pub fn persistence(context: &'static str, source: io::Error) -> Self {
        Self::Persistence { context, source }
    }

    /// Returns the coarse category of the error.
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownCommand(_)
            | Self::WrongArity(_)
            | Self::NotInteger
            | Self::Syntax
            | Self::InvalidRequest(_)
            | Self::NestedMulti
            | Self::ExecWithoutMulti
            | Self::DiscardWithoutMulti
            | Self::NotAllowedInMulti
            | Self::SessionCommand(_) => ErrorCategory::Command,
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Persistence { .. }
            | Self::LogPoisoned
            | Self::CorruptLog { .. }
            | Self::SnapshotMagic
            | Self::SnapshotVersion(_)
            | Self::SnapshotTruncated(_)
            | Self::SnapshotExpiryFlag(_) => ErrorCategory::Persistence,
            Self::Replication(_) => ErrorCategory::Replication,
            Self::Config(_) => ErrorCategory::Config,
        }
    }

    /// Builds the error reply sent to a client.
    pub fn reply(&self) -> WireValue {
        WireValue::Error(format!("ERR {self}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_error_categories() {
        assert_eq!(EvError::Syntax.category(), ErrorCategory::Command);
        assert_eq!(
            EvError::Protocol(RespError::UnknownType(b'?')).category(),
            ErrorCategory::Protocol
        );
        assert_eq!(EvError::SnapshotMagic.category(), ErrorCategory::Persistence);
        assert_eq!(
            EvError::Config("port".to_string()).category(),
            ErrorCategory::Config
        );
    }

    #[test]
    fn only_protocol_errors_close_connection() {
        assert!(ErrorCategory::Protocol.closes_connection());
        assert!(!ErrorCategory::Command.closes_connection());
        assert!(!ErrorCategory::Persistence.closes_connection());
    }

    #[test]
    fn reply_carries_err_prefix() {
        assert_eq!(
            EvError::WrongArity("get").reply(),
            WireValue::Error("ERR wrong number of arguments for 'get' command".to_string())
        );
        assert_eq!(
            EvError::UnknownCommand("FOO".to_string()).reply(),
            WireValue::Error("ERR unknown command 'FOO'".to_string())
        );
    }

    #[test]
    fn persistence_reply_includes_step() {
        let err = EvError::persistence("append", io::Error::other("disk full"));
        let WireValue::Error(text) = err.reply() else {
            panic!("expected error reply");
        };
        assert!(text.starts_with("ERR persistence failure: append"));
        assert!(text.contains("disk full"));
    }
}
