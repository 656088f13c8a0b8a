//! # Connection Handling
//!
//! Accept loop plus one task per client.
//!
//! ## Design Principles
//!
//! 1. **Buffer Reuse**: Each session owns one read and one write buffer for
//!    its lifetime; pipelined requests are answered in a single flush.
//! 2. **Localized Failures**: Command errors become replies. Only malformed
//!    wire input or socket errors end a session.
//! 3. **Opt-In Streaming**: A session that sends `SYNC` becomes a replication
//!    peer and afterwards also drains its peer queue onto the socket. A peer
//!    that falls too far behind is disconnected and must sync again.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use evault_common::{EvError, RespParser, WireValue};
use evault_engine::{Command, Engine, PeerSubscription};

use crate::config::Role;
use crate::metrics::Metrics;
use crate::transaction::Transaction;

const READ_BUFFER_CAPACITY: usize = 16 * 1024;

/// State shared by every connection.
pub struct ServerState {
    pub engine: Arc<Engine>,
    pub metrics: Metrics,
    pub role: Role,
}

impl ServerState {
    pub fn new(engine: Arc<Engine>, role: Role) -> Self {
        ServerState {
            engine,
            metrics: Metrics::new(),
            role,
        }
    }

    /// Renders the `INFO` report.
    pub fn info(&self) -> String {
        let metrics = self.metrics.snapshot();
        let mut lines = vec![
            "# Server".to_string(),
            format!("role:{}", self.role.name()),
        ];
        if let Role::Replica(upstream) = &self.role {
            lines.push(format!("upstream:{}", upstream.addr()));
        }
        lines.extend([
            format!("connected_clients:{}", metrics.connected_clients),
            format!("connected_replicas:{}", self.engine.peers().len()),
            format!("keys:{}", self.engine.store().len()),
            format!("total_commands_processed:{}", metrics.commands_total),
            format!("total_errors:{}", metrics.errors_total),
            format!("latency_mean_us:{}", metrics.latency.mean_us()),
            format!("latency_p99_us:{}", metrics.latency.quantile_us(0.99)),
        ]);
        let mut report = lines.join("\r\n");
        report.push_str("\r\n");
        report
    }
}

/// Accepts connections until `shutdown` resolves.
pub async fn run<F>(listener: TcpListener, state: Arc<ServerState>, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if let Err(err) = tune_socket(&stream) {
                        debug!(%addr, error = %err, "could not tune client socket");
                    }
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, addr, state).await {
                            debug!(%addr, error = %err, "connection closed with error");
                        }
                    });
                }
                // Usually descriptor exhaustion; keep serving existing clients.
                Err(err) => warn!(error = %err, "accept failed"),
            },
        }
    }
}

fn tune_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_keepalive(true)
}

/// Serves one client until it disconnects or sends malformed input.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> io::Result<()> {
    state.metrics.client_connected();
    debug!(%addr, "client connected");
    let mut session = Session::new(stream, addr, Arc::clone(&state));
    let result = session.serve().await;
    state.metrics.client_disconnected();
    debug!(%addr, "client disconnected");
    result
}

enum Event {
    Read(usize),
    Frame(Bytes),
    PeerClosed,
}

struct Session {
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    parser: RespParser,
    tx: Transaction,
    peer: Option<PeerSubscription>,
}

impl Session {
    fn new(stream: TcpStream, addr: SocketAddr, state: Arc<ServerState>) -> Self {
        Session {
            stream,
            addr,
            state,
            read_buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            write_buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            parser: RespParser::new(),
            tx: Transaction::new(),
            peer: None,
        }
    }

    async fn serve(&mut self) -> io::Result<()> {
        loop {
            if !self.drain_requests() {
                self.flush().await?;
                return Ok(());
            }
            self.flush().await?;

            match self.next_event().await? {
                Event::Read(0) => {
                    if !self.read_buf.is_empty() {
                        debug!(addr = %self.addr, pending = self.read_buf.len(), "client left mid-request");
                    }
                    return Ok(());
                }
                Event::Read(_) => {}
                Event::Frame(frame) => self.stream.write_all(&frame).await?,
                Event::PeerClosed => {
                    warn!(addr = %self.addr, "replica dropped from the stream; closing connection");
                    return Ok(());
                }
            }
        }
    }

    /// Answers every complete request in the read buffer. Returns false when
    /// the session must close after flushing.
    fn drain_requests(&mut self) -> bool {
        loop {
            match self.parser.parse(&mut self.read_buf) {
                Ok(Some(value)) => {
                    if let Some(reply) = self.handle_value(value) {
                        reply.encode_into(&mut self.write_buf);
                    }
                }
                Ok(None) => return true,
                Err(err) => {
                    warn!(addr = %self.addr, error = %err, "protocol error; closing connection");
                    EvError::from(err).reply().encode_into(&mut self.write_buf);
                    return false;
                }
            }
        }
    }

    fn handle_value(&mut self, value: WireValue) -> Option<WireValue> {
        match value {
            WireValue::Array(ref items) if items.is_empty() => None,
            WireValue::Array(_) => match value.into_tokens() {
                Some(tokens) => self.handle_request(tokens),
                None => Some(EvError::InvalidRequest("expected an array of bulk strings").reply()),
            },
            _ => {
                debug!(addr = %self.addr, "ignoring non-array request");
                None
            }
        }
    }

    /// Returns `None` when the reply was already written to the buffer.
    fn handle_request(&mut self, tokens: Vec<Bytes>) -> Option<WireValue> {
        let started = Instant::now();
        let engine = Arc::clone(&self.state.engine);
        let reply = if self.tx.is_queuing() {
            Some(self.tx.handle(&engine, tokens))
        } else {
            match engine.commands().resolve(&tokens) {
                Ok((_, Command::Sync)) => {
                    self.attach_peer(&engine);
                    None
                }
                Ok((_, Command::Info)) => Some(WireValue::bulk(self.state.info())),
                _ => Some(self.tx.handle(&engine, tokens)),
            }
        };
        let failed = reply.as_ref().is_some_and(WireValue::is_error);
        self.state.metrics.record_command(started.elapsed(), failed);
        reply
    }

    /// Turns this session into a replication peer. The `+OK` is followed by
    /// the current dataset as `SET` frames, then the live stream.
    fn attach_peer(&mut self, engine: &Engine) {
        if self.peer.is_some() {
            WireValue::ok().encode_into(&mut self.write_buf);
            return;
        }
        let (subscription, frames) = engine.attach_peer();
        info!(
            addr = %self.addr,
            peer = subscription.id(),
            keys = frames.len(),
            "replica attached"
        );
        WireValue::ok().encode_into(&mut self.write_buf);
        for frame in &frames {
            self.write_buf.extend_from_slice(frame);
        }
        self.peer = Some(subscription);
    }

    async fn next_event(&mut self) -> io::Result<Event> {
        match self.peer.as_mut() {
            Some(peer) => tokio::select! {
                read = self.stream.read_buf(&mut self.read_buf) => read.map(Event::Read),
                frame = peer.recv() => Ok(frame.map_or(Event::PeerClosed, Event::Frame)),
            },
            None => self.stream.read_buf(&mut self.read_buf).await.map(Event::Read),
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.write_buf).await?;
        self.write_buf.clear();
        Ok(())
    }
}
