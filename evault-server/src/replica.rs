//! # Replica Link
//!
//! Connects to the primary, sends `SYNC` and applies every mutating command
//! it streams back through the local engine, so the replica logs and
//! persists what it applies. There is no reconnect: when the link ends the
//! replica keeps serving its current data.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use evault_common::{EvError, EvResult, RespParser, WireValue};
use evault_engine::Engine;

use crate::config::ReplicaOf;

/// Runs the replication link on a background task.
pub fn spawn(upstream: ReplicaOf, engine: Arc<Engine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match replicate(&upstream, &engine).await {
            Ok(applied) => info!(upstream = %upstream, applied, "replication link closed by primary"),
            Err(err) => error!(upstream = %upstream, error = %err, "replication link failed"),
        }
    })
}

/// Follows `upstream` until it disconnects. Returns the number of applied
/// commands.
pub async fn replicate(upstream: &ReplicaOf, engine: &Engine) -> EvResult<u64> {
    let mut stream = TcpStream::connect(upstream.addr())
        .await
        .map_err(EvError::Replication)?;
    stream
        .write_all(&WireValue::command(["SYNC"]).to_bytes())
        .await
        .map_err(EvError::Replication)?;
    info!(upstream = %upstream, "replication link established");

    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut parser = RespParser::new();
    let mut applied = 0u64;
    loop {
        while let Some(frame) = parser.parse(&mut buf)? {
            if apply_frame(engine, frame) {
                applied += 1;
            }
        }
        let read = stream.read_buf(&mut buf).await.map_err(EvError::Replication)?;
        if read == 0 {
            return Ok(applied);
        }
    }
}

fn apply_frame(engine: &Engine, frame: WireValue) -> bool {
    let tokens = match frame {
        WireValue::Array(_) => match frame.into_tokens() {
            Some(tokens) if !tokens.is_empty() => tokens,
            _ => {
                warn!("ignoring malformed replication frame");
                return false;
            }
        },
        WireValue::Error(text) => {
            warn!(%text, "primary replied with an error");
            return false;
        }
        other => {
            debug!(frame = ?other, "ignoring primary status reply");
            return false;
        }
    };

    if !engine.commands().is_mutating(&tokens) {
        debug!("ignoring non-mutating replication frame");
        return false;
    }
    let reply = engine.execute(&tokens);
    if let WireValue::Error(text) = &reply {
        warn!(%text, "replicated command failed");
        return false;
    }
    true
}
