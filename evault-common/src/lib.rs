// evault-common - Wire protocol and shared error types for EchoVault

pub mod codec;
pub mod error;
pub mod protocol;

// Re-export for convenience
pub use codec::{RespError, RespParser};
pub use error::*;
pub use protocol::{encode_command, WireValue};
