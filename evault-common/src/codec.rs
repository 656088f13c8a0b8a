//! # RESP2 Parser
//!
//! Parse RESP2 values from a streaming buffer (TCP socket, log file, or
//! replication link).
//!
//! ## Design Principles
//!
//! 1. **All-or-Nothing**: A value is consumed from the buffer only once it is
//!    complete; partial frames leave the buffer untouched and return `None`.
//! 2. **Streaming Friendly**: Callers append bytes as they arrive and call
//!    `parse` again. A parser remembers how far it got into an incomplete
//!    top-level array and how many bytes it is waiting for, so feeding a
//!    large frame in small pieces stays linear. A parser therefore belongs to
//!    one buffer, which may only grow between calls that return `None`.
//! 3. **Bounded**: Lengths and nesting are capped so a hostile peer cannot
//!    force huge allocations.
//! 4. **Fail Fast**: Malformed frames return a `RespError` immediately.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::protocol::WireValue;

/// Largest accepted bulk string payload.
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Largest accepted array length.
pub const MAX_ELEMENTS: usize = 1024 * 1024;

/// Deepest accepted array nesting.
pub const MAX_NESTING_DEPTH: usize = 32;

/// RESP parser errors surfaced to the server for client responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RespError {
    #[error("unknown type byte {0:#04x}")]
    UnknownType(u8),
    #[error("invalid length")]
    InvalidLength,
    #[error("invalid integer")]
    InvalidInteger,
    #[error("bulk string not terminated by CRLF")]
    MissingTerminator,
    #[error("simple string is not valid UTF-8")]
    InvalidUtf8,
    #[error("bulk length {0} exceeds limit")]
    BulkTooLarge(usize),
    #[error("array length {0} exceeds limit")]
    TooManyElements(usize),
    #[error("arrays nested too deeply")]
    TooDeep,
}

/// RESP2 parser for complete values.
#[derive(Debug)]
pub struct RespParser {
    max_bulk: usize,
    /// Buffer length below which the pending value cannot be complete.
    need: usize,
    pending: Option<PendingArray>,
}

/// Progress through a top-level array whose elements have not all arrived.
#[derive(Debug)]
struct PendingArray {
    /// Offset just past the last complete element.
    pos: usize,
    remaining: usize,
    items: Vec<WireValue>,
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RespParser {
    /// Creates a parser with the default limits.
    pub fn new() -> Self {
        Self::with_max_bulk(MAX_BULK_SIZE)
    }

    /// Creates a parser with a custom bulk size limit.
    pub fn with_max_bulk(max_bulk: usize) -> Self {
        RespParser {
            max_bulk,
            need: 0,
            pending: None,
        }
    }

    /// Attempts to parse a single value from the buffer.
    ///
    /// Returns `Ok(None)` if more data is required.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<WireValue>, RespError> {
        if buf.len() < self.need {
            return Ok(None);
        }
        self.need = 0;
        let data = &buf[..];

        let mut frame = match self.pending.take() {
            Some(frame) => frame,
            None if data.first() == Some(&b'*') => {
                let mut pos = 1;
                let Some(line) = read_line(data, &mut pos) else {
                    self.need = data.len() + 1;
                    return Ok(None);
                };
                let count = parse_count(line)?;
                PendingArray {
                    pos,
                    remaining: count,
                    items: Vec::with_capacity(count.min(64)),
                }
            }
            None => {
                let mut pos = 0;
                return match self.parse_value(data, &mut pos, 0)? {
                    Some(value) => {
                        buf.advance(pos);
                        Ok(Some(value))
                    }
                    None => Ok(None),
                };
            }
        };

        while frame.remaining > 0 {
            let mut pos = frame.pos;
            match self.parse_value(data, &mut pos, 1)? {
                Some(item) => {
                    frame.items.push(item);
                    frame.pos = pos;
                    frame.remaining -= 1;
                }
                None => {
                    self.pending = Some(frame);
                    return Ok(None);
                }
            }
        }
        buf.advance(frame.pos);
        Ok(Some(WireValue::Array(frame.items)))
    }

    fn parse_value(
        &mut self,
        data: &[u8],
        pos: &mut usize,
        depth: usize,
    ) -> Result<Option<WireValue>, RespError> {
        let Some(&prefix) = data.get(*pos) else {
            self.need = *pos + 1;
            return Ok(None);
        };
        if !matches!(prefix, b'+' | b'-' | b':' | b'$' | b'*') {
            return Err(RespError::UnknownType(prefix));
        }
        *pos += 1;
        let Some(line) = read_line(data, pos) else {
            self.need = data.len() + 1;
            return Ok(None);
        };

        match prefix {
            b'+' => Ok(Some(WireValue::SimpleString(parse_text(line)?))),
            b'-' => Ok(Some(WireValue::Error(parse_text(line)?))),
            b':' => Ok(Some(WireValue::Integer(parse_i64(line)?))),
            b'$' => {
                if line == b"-1" {
                    return Ok(Some(WireValue::BulkString(None)));
                }
                let len = parse_usize(line)?;
                if len > self.max_bulk {
                    return Err(RespError::BulkTooLarge(len));
                }
                if data.len() < *pos + len + 2 {
                    self.need = *pos + len + 2;
                    return Ok(None);
                }
                let body = Bytes::copy_from_slice(&data[*pos..*pos + len]);
                if &data[*pos + len..*pos + len + 2] != b"\r\n" {
                    return Err(RespError::MissingTerminator);
                }
                *pos += len + 2;
                Ok(Some(WireValue::BulkString(Some(body))))
            }
            _ => {
                let count = parse_count(line)?;
                if depth >= MAX_NESTING_DEPTH {
                    return Err(RespError::TooDeep);
                }
                let mut items = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    match self.parse_value(data, pos, depth + 1)? {
                        Some(item) => items.push(item),
                        None => return Ok(None),
                    }
                }
                Ok(Some(WireValue::Array(items)))
            }
        }
    }
}

/// Returns the bytes up to the next CRLF and moves `pos` past it.
fn read_line<'a>(data: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let start = *pos;
    let mut idx = start + 1;
    while idx < data.len() {
        if data[idx] == b'\n' && data[idx - 1] == b'\r' {
            *pos = idx + 1;
            return Some(&data[start..idx - 1]);
        }
        idx += 1;
    }
    None
}

fn parse_usize(data: &[u8]) -> Result<usize, RespError> {
    if data.is_empty() {
        return Err(RespError::InvalidLength);
    }
    let mut value: usize = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(RespError::InvalidLength);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as usize))
            .ok_or(RespError::InvalidLength)?;
    }
    Ok(value)
}

fn parse_count(data: &[u8]) -> Result<usize, RespError> {
    let count = parse_usize(data)?;
    if count > MAX_ELEMENTS {
        return Err(RespError::TooManyElements(count));
    }
    Ok(count)
}

fn parse_i64(data: &[u8]) -> Result<i64, RespError> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or(RespError::InvalidInteger)
}

fn parse_text(data: &[u8]) -> Result<String, RespError> {
    String::from_utf8(data.to_vec()).map_err(|_| RespError::InvalidUtf8)
}
