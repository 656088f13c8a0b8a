//! Shared harness: an in-process server on an ephemeral port and a raw
//! RESP client.

#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use evault_common::{encode_command, RespParser, WireValue};
use evault_engine::{Engine, EngineConfig};
use evault_server::server::{self, ServerState};
use evault_server::Role;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn engine_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        aof_path: Some(dir.join("database.aof")),
        snapshot_path: dir.join("database.rdb"),
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub engine: Arc<Engine>,
    pub state: Arc<ServerState>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<io::Result<()>>,
}

impl TestServer {
    pub async fn start(dir: &Path, role: Role) -> Self {
        let engine = Arc::new(Engine::open(engine_config(dir)).unwrap());
        Self::with_engine(engine, role).await
    }

    pub async fn with_engine(engine: Arc<Engine>, role: Role) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::new(Arc::clone(&engine), role));
        let (shutdown, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server::run(listener, Arc::clone(&state), async move {
            let _ = rx.await;
        }));
        TestServer {
            addr,
            engine,
            state,
            shutdown: Some(shutdown),
            handle,
        }
    }

    pub async fn client(&self) -> Client {
        Client::connect(self.addr).await
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        (&mut self.handle).await.unwrap().unwrap();
    }
}

pub struct Client {
    stream: TcpStream,
    buf: BytesMut,
    parser: RespParser,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        Client {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: BytesMut::with_capacity(4096),
            parser: RespParser::new(),
        }
    }

    pub async fn send_raw(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.unwrap();
    }

    pub async fn send(&mut self, parts: &[&str]) {
        self.send_raw(&request(parts)).await;
    }

    pub async fn call(&mut self, parts: &[&str]) -> WireValue {
        self.send(parts).await;
        self.read_reply().await
    }

    pub async fn read_reply(&mut self) -> WireValue {
        loop {
            if let Some(value) = self.parser.parse(&mut self.buf).unwrap() {
                return value;
            }
            let read = tokio::time::timeout(REPLY_TIMEOUT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for reply")
                .unwrap();
            assert!(read > 0, "server closed the connection");
        }
    }

    /// True once the server has closed its side.
    pub async fn is_closed(&mut self) -> bool {
        let mut scratch = [0u8; 64];
        match tokio::time::timeout(REPLY_TIMEOUT, self.stream.read(&mut scratch)).await {
            Ok(Ok(0)) | Ok(Err(_)) => true,
            Ok(Ok(_)) | Err(_) => false,
        }
    }
}

pub fn request(parts: &[&str]) -> Bytes {
    let tokens: Vec<Bytes> = parts
        .iter()
        .map(|part| Bytes::copy_from_slice(part.as_bytes()))
        .collect();
    encode_command(&tokens)
}

pub fn bulk_text(value: &WireValue) -> String {
    match value {
        WireValue::BulkString(Some(data)) => String::from_utf8_lossy(data).into_owned(),
        other => panic!("expected bulk string, got {other:?}"),
    }
}

/// Polls `check` until it returns true or a few seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + REPLY_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
