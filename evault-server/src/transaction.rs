//! # Transactions
//!
//! Per-connection MULTI/EXEC/DISCARD state.
//!
//! While queuing, recognized commands are stored verbatim and answered with
//! `+QUEUED`; nothing touches the store until `EXEC`. Argument errors in a
//! queued command surface in that command's `EXEC` slot.

use bytes::Bytes;

use evault_common::{EvError, WireValue};
use evault_engine::{Command, CommandKind, Engine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Normal,
    Queuing,
}

#[derive(Debug, Default)]
pub struct Transaction {
    mode: Mode,
    queue: Vec<Vec<Bytes>>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_queuing(&self) -> bool {
        self.mode == Mode::Queuing
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Handles one non-empty request for this connection.
    ///
    /// Outside a transaction everything except MULTI/EXEC/DISCARD goes
    /// straight to the engine.
    pub fn handle(&mut self, engine: &Engine, tokens: Vec<Bytes>) -> WireValue {
        let Some(spec) = tokens.first().and_then(|name| engine.commands().lookup(name)) else {
            return match self.mode {
                Mode::Normal => engine.execute(&tokens),
                Mode::Queuing => unknown_command(&tokens).reply(),
            };
        };
        let spec = *spec;

        match spec.kind {
            CommandKind::Multi | CommandKind::Exec | CommandKind::Discard => {
                match Command::parse(&spec, &tokens[1..]) {
                    Ok(Command::Multi) => self.begin(),
                    Ok(Command::Exec) => self.exec(engine),
                    Ok(_) => self.discard(),
                    Err(err) => err.reply(),
                }
            }
            _ if self.mode == Mode::Normal => engine.execute(&tokens),
            _ if spec.queueable => {
                self.queue.push(tokens);
                WireValue::simple("QUEUED")
            }
            _ => EvError::NotAllowedInMulti.reply(),
        }
    }

    fn begin(&mut self) -> WireValue {
        if self.is_queuing() {
            return EvError::NestedMulti.reply();
        }
        self.mode = Mode::Queuing;
        WireValue::ok()
    }

    fn exec(&mut self, engine: &Engine) -> WireValue {
        if !self.is_queuing() {
            return EvError::ExecWithoutMulti.reply();
        }
        let queue = std::mem::take(&mut self.queue);
        self.mode = Mode::Normal;
        WireValue::Array(engine.execute_batch(&queue))
    }

    fn discard(&mut self) -> WireValue {
        if !self.is_queuing() {
            return EvError::DiscardWithoutMulti.reply();
        }
        self.queue.clear();
        self.mode = Mode::Normal;
        WireValue::ok()
    }
}

fn unknown_command(tokens: &[Bytes]) -> EvError {
    let name = tokens.first().map(|name| String::from_utf8_lossy(name).into_owned());
    EvError::UnknownCommand(name.unwrap_or_default())
}
