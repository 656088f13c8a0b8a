//! # Command Table
//!
//! Requests arrive as token lists. The table resolves the first token to a
//! [`CommandSpec`] and [`Command::parse`] validates the rest into a typed
//! variant, so handlers never see raw argument slices.
//!
//! The table is built once; an unknown name is a lookup miss that becomes
//! `ERR unknown command`.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use evault_common::{EvError, EvResult};

/// Every command the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Ping,
    Set,
    Get,
    Del,
    Bgsave,
    Multi,
    Exec,
    Discard,
    Sync,
    Info,
}

/// Accepted argument counts, not counting the command name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    AtMost(usize),
}

impl Arity {
    fn accepts(self, args: usize) -> bool {
        match self {
            Arity::Exact(n) => args == n,
            Arity::AtLeast(n) => args >= n,
            Arity::AtMost(n) => args <= n,
        }
    }
}

/// Metadata for one command table entry.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub kind: CommandKind,
    /// Lowercase name used in error messages.
    pub name: &'static str,
    pub arity: Arity,
    /// Logged to the append log and broadcast to replicas.
    pub mutating: bool,
    /// May be queued between MULTI and EXEC.
    pub queueable: bool,
}

/// A validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping(Option<Bytes>),
    Set {
        key: Bytes,
        value: Bytes,
        ttl: Option<Duration>,
    },
    Get {
        key: Bytes,
    },
    Del {
        key: Bytes,
    },
    Bgsave,
    Multi,
    Exec,
    Discard,
    Sync,
    Info,
}

impl Command {
    /// Checks arity and argument syntax for `spec`.
    pub fn parse(spec: &CommandSpec, args: &[Bytes]) -> EvResult<Command> {
        if !spec.arity.accepts(args.len()) {
            return Err(EvError::WrongArity(spec.name));
        }
        let command = match spec.kind {
            CommandKind::Ping => Command::Ping(args.first().cloned()),
            CommandKind::Set => parse_set(args)?,
            CommandKind::Get => Command::Get {
                key: args[0].clone(),
            },
            CommandKind::Del => Command::Del {
                key: args[0].clone(),
            },
            CommandKind::Bgsave => Command::Bgsave,
            CommandKind::Multi => Command::Multi,
            CommandKind::Exec => Command::Exec,
            CommandKind::Discard => Command::Discard,
            CommandKind::Sync => Command::Sync,
            CommandKind::Info => Command::Info,
        };
        Ok(command)
    }
}

// SET key value [EX seconds | PX milliseconds]
fn parse_set(args: &[Bytes]) -> EvResult<Command> {
    let key = args[0].clone();
    let value = args[1].clone();
    let ttl = match &args[2..] {
        [] => None,
        [unit, amount] => {
            let amount = parse_u64(amount)?;
            if unit.eq_ignore_ascii_case(b"EX") {
                Some(Duration::from_secs(amount))
            } else if unit.eq_ignore_ascii_case(b"PX") {
                Some(Duration::from_millis(amount))
            } else {
                return Err(EvError::Syntax);
            }
        }
        _ => return Err(EvError::Syntax),
    };
    Ok(Command::Set { key, value, ttl })
}

fn parse_u64(data: &[u8]) -> EvResult<u64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse::<u64>().ok())
        .ok_or(EvError::NotInteger)
}

/// Name to spec registry.
#[derive(Debug, Clone)]
pub struct CommandTable {
    entries: HashMap<String, CommandSpec>,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CommandTable {
    /// Builds the table with every supported command.
    pub fn builtin() -> Self {
        let specs = [
            spec(CommandKind::Ping, "ping", Arity::AtMost(1), false, true),
            spec(CommandKind::Set, "set", Arity::AtLeast(2), true, true),
            spec(CommandKind::Get, "get", Arity::Exact(1), false, true),
            spec(CommandKind::Del, "del", Arity::Exact(1), true, true),
            spec(CommandKind::Bgsave, "bgsave", Arity::Exact(0), false, true),
            spec(CommandKind::Multi, "multi", Arity::Exact(0), false, false),
            spec(CommandKind::Exec, "exec", Arity::Exact(0), false, false),
            spec(CommandKind::Discard, "discard", Arity::Exact(0), false, false),
            spec(CommandKind::Sync, "sync", Arity::Exact(0), false, false),
            spec(CommandKind::Info, "info", Arity::AtMost(1), false, false),
        ];
        let entries = specs
            .into_iter()
            .map(|spec| (spec.name.to_ascii_uppercase(), spec))
            .collect();
        CommandTable { entries }
    }

    /// Case-insensitive lookup by command name.
    pub fn lookup(&self, name: &[u8]) -> Option<&CommandSpec> {
        let name = std::str::from_utf8(name).ok()?;
        self.entries.get(&name.to_ascii_uppercase())
    }

    /// Resolves a full request (name + args) into its spec and typed command.
    pub fn resolve(&self, tokens: &[Bytes]) -> EvResult<(&CommandSpec, Command)> {
        let Some((name, args)) = tokens.split_first() else {
            return Err(EvError::InvalidRequest("empty command"));
        };
        let spec = self
            .lookup(name)
            .ok_or_else(|| EvError::UnknownCommand(String::from_utf8_lossy(name).into_owned()))?;
        let command = Command::parse(spec, args)?;
        Ok((spec, command))
    }

    /// Returns true if the request names a mutating command.
    pub fn is_mutating(&self, tokens: &[Bytes]) -> bool {
        tokens
            .first()
            .and_then(|name| self.lookup(name))
            .is_some_and(|spec| spec.mutating)
    }
}

const fn spec(
    kind: CommandKind,
    name: &'static str,
    arity: Arity,
    mutating: bool,
    queueable: bool,
) -> CommandSpec {
    CommandSpec {
        kind,
        name,
        arity,
        mutating,
        queueable,
    }
}
