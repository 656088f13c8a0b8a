//! Durability across restarts: append log replay, snapshots and BGSAVE.

mod common;

use std::sync::Arc;
use std::time::Duration;

use evault_common::WireValue;
use evault_engine::Engine;
use evault_server::Role;

use common::{engine_config, eventually, TestServer};

#[tokio::test]
async fn acknowledged_writes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let server = TestServer::start(dir.path(), Role::Primary).await;
        let mut client = server.client().await;
        assert_eq!(client.call(&["SET", "kept", "1"]).await, WireValue::ok());
        assert_eq!(client.call(&["SET", "dropped", "2"]).await, WireValue::ok());
        assert_eq!(client.call(&["DEL", "dropped"]).await, WireValue::Integer(1));
        server.stop().await;
    }

    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;
    assert_eq!(client.call(&["GET", "kept"]).await, WireValue::bulk("1"));
    assert_eq!(client.call(&["GET", "dropped"]).await, WireValue::null());
    server.stop().await;
}

#[tokio::test]
async fn bgsave_snapshot_restores_without_log() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;
    client.call(&["SET", "a", "1"]).await;
    client.call(&["SET", "b", "2", "EX", "600"]).await;
    assert_eq!(
        client.call(&["BGSAVE"]).await,
        WireValue::simple("Background saving started")
    );
    let snapshot = dir.path().join("database.rdb");
    let snapshot = &snapshot;
    assert!(eventually(move || async move { snapshot.exists() }).await);
    server.stop().await;

    std::fs::remove_file(dir.path().join("database.aof")).unwrap();
    let restored = Arc::new(Engine::open(engine_config(dir.path())).unwrap());
    let server = TestServer::with_engine(restored, Role::Primary).await;
    let mut client = server.client().await;
    assert_eq!(client.call(&["GET", "a"]).await, WireValue::bulk("1"));
    assert_eq!(client.call(&["GET", "b"]).await, WireValue::bulk("2"));
    assert!(server.engine.store().expires_at(b"b").is_some());
    server.stop().await;
}

#[tokio::test]
async fn log_writes_after_snapshot_win() {
    let dir = tempfile::tempdir().unwrap();
    {
        let server = TestServer::start(dir.path(), Role::Primary).await;
        let mut client = server.client().await;
        client.call(&["SET", "a", "old"]).await;
        server.engine.save().unwrap();
        client.call(&["SET", "a", "new"]).await;
        server.stop().await;
    }

    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;
    assert_eq!(client.call(&["GET", "a"]).await, WireValue::bulk("new"));
    server.stop().await;
}

#[tokio::test]
async fn periodic_snapshots_capture_writes() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let worker = server
        .engine
        .start_snapshot_worker(Duration::from_millis(50))
        .unwrap();
    let mut client = server.client().await;
    client.call(&["SET", "tick", "1"]).await;

    let snapshot = dir.path().join("database.rdb");
    let snapshot = &snapshot;
    assert!(eventually(move || async move { snapshot.exists() }).await);
    worker.stop();
    server.stop().await;
}
