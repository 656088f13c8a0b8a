//! # Wire Values
//!
//! Purpose: Define the RESP2 value model shared by requests, replies, the
//! append log, and the replication stream.
//!
//! ## Design Principles
//!
//! 1. **One Shape Everywhere**: A request is an `Array` of `BulkString`
//!    tokens, and the same value is what gets logged and replicated.
//! 2. **Binary-Safe Bulk**: Bulk payloads are `Bytes` so keys and values are
//!    never forced through UTF-8.
//! 3. **Exact Encoding**: Encoding a decoded value reproduces its input bytes.
//!
//! ## Wire Layout Example
//!
//! ```text
//! SET key v  ->  *3\r\n $3\r\nSET\r\n $3\r\nkey\r\n $1\r\nv\r\n
//!
//! +--------+----------------+-----------------------------+
//! | prefix | header         | body                        |
//! +--------+----------------+-----------------------------+
//! | *      | <count>\r\n    | <count> encoded values      |
//! | $      | <len>\r\n      | <len> raw bytes + \r\n      |
//! | $      | -1\r\n         | (null bulk, no body)        |
//! | +      | <text>\r\n     |                             |
//! | -      | <text>\r\n     |                             |
//! | :      | <integer>\r\n  |                             |
//! +--------+----------------+-----------------------------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// Line terminator used by every RESP header.
pub const CRLF: &[u8] = b"\r\n";

/// RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string (`$-1`).
    BulkString(Option<Bytes>),
    Array(Vec<WireValue>),
}

impl WireValue {
    /// `+OK`.
    pub fn ok() -> Self {
        WireValue::SimpleString("OK".to_string())
    }

    /// `$-1`.
    pub fn null() -> Self {
        WireValue::BulkString(None)
    }

    pub fn simple(text: impl Into<String>) -> Self {
        WireValue::SimpleString(text.into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        WireValue::BulkString(Some(data.into()))
    }

    /// Builds the request form of a command: an array of bulk tokens.
    pub fn command<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        WireValue::Array(tokens.into_iter().map(WireValue::bulk).collect())
    }

    /// Returns true for `Error` replies.
    pub fn is_error(&self) -> bool {
        matches!(self, WireValue::Error(_))
    }

    /// Appends the wire encoding of this value to `out`.
    pub fn encode_into(&self, out: &mut BytesMut) {
        match self {
            WireValue::SimpleString(text) => {
                out.put_u8(b'+');
                out.put_slice(text.as_bytes());
                out.put_slice(CRLF);
            }
            WireValue::Error(text) => {
                out.put_u8(b'-');
                out.put_slice(text.as_bytes());
                out.put_slice(CRLF);
            }
            WireValue::Integer(n) => {
                out.put_u8(b':');
                out.put_slice(n.to_string().as_bytes());
                out.put_slice(CRLF);
            }
            WireValue::BulkString(None) => out.put_slice(b"$-1\r\n"),
            WireValue::BulkString(Some(data)) => {
                out.put_u8(b'$');
                out.put_slice(data.len().to_string().as_bytes());
                out.put_slice(CRLF);
                out.put_slice(data);
                out.put_slice(CRLF);
            }
            WireValue::Array(items) => {
                out.put_u8(b'*');
                out.put_slice(items.len().to_string().as_bytes());
                out.put_slice(CRLF);
                for item in items {
                    item.encode_into(out);
                }
            }
        }
    }

    /// Encodes this value into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode_into(&mut out);
        out.freeze()
    }

    /// Extracts request tokens when the value is an array of non-null bulk
    /// strings. Returns `None` for any other shape.
    pub fn into_tokens(self) -> Option<Vec<Bytes>> {
        let WireValue::Array(items) = self else {
            return None;
        };
        items
            .into_iter()
            .map(|item| match item {
                WireValue::BulkString(Some(data)) => Some(data),
                _ => None,
            })
            .collect()
    }
}

/// Encodes a token list as a request array without building a `WireValue`.
///
/// Used on the write path (log records and replication frames).
pub fn encode_command(tokens: &[Bytes]) -> Bytes {
    let mut out = BytesMut::new();
    out.put_u8(b'*');
    out.put_slice(tokens.len().to_string().as_bytes());
    out.put_slice(CRLF);
    for token in tokens {
        out.put_u8(b'$');
        out.put_slice(token.len().to_string().as_bytes());
        out.put_slice(CRLF);
        out.put_slice(token);
        out.put_slice(CRLF);
    }
    out.freeze()
}
