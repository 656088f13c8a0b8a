//! MULTI/EXEC/DISCARD over the wire.

mod common;

use evault_common::WireValue;
use evault_server::Role;

use common::TestServer;

#[tokio::test]
async fn exec_runs_queued_commands_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;
    let mut observer = server.client().await;

    assert_eq!(client.call(&["MULTI"]).await, WireValue::ok());
    assert_eq!(client.call(&["SET", "a", "1"]).await, WireValue::simple("QUEUED"));
    assert_eq!(client.call(&["SET", "a", "2"]).await, WireValue::simple("QUEUED"));
    assert_eq!(client.call(&["GET", "a"]).await, WireValue::simple("QUEUED"));
    assert_eq!(observer.call(&["GET", "a"]).await, WireValue::null());

    assert_eq!(
        client.call(&["EXEC"]).await,
        WireValue::Array(vec![WireValue::ok(), WireValue::ok(), WireValue::bulk("2")])
    );
    assert_eq!(observer.call(&["GET", "a"]).await, WireValue::bulk("2"));

    server.stop().await;
}

#[tokio::test]
async fn discard_leaves_state_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;

    client.call(&["SET", "a", "before"]).await;
    client.call(&["MULTI"]).await;
    client.call(&["SET", "a", "after"]).await;
    client.call(&["DEL", "a"]).await;
    assert_eq!(client.call(&["DISCARD"]).await, WireValue::ok());
    assert_eq!(client.call(&["GET", "a"]).await, WireValue::bulk("before"));

    server.stop().await;
}

#[tokio::test]
async fn control_errors_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;

    assert_eq!(
        client.call(&["EXEC"]).await,
        WireValue::Error("ERR EXEC without MULTI".to_string())
    );
    assert_eq!(
        client.call(&["DISCARD"]).await,
        WireValue::Error("ERR DISCARD without MULTI".to_string())
    );
    client.call(&["MULTI"]).await;
    assert_eq!(
        client.call(&["MULTI"]).await,
        WireValue::Error("ERR MULTI calls can not be nested".to_string())
    );
    assert_eq!(
        client.call(&["INFO"]).await,
        WireValue::Error("ERR Command not allowed inside a transaction".to_string())
    );
    assert!(client.call(&["WHAT"]).await.is_error());
    assert_eq!(client.call(&["EXEC"]).await, WireValue::Array(vec![]));

    server.stop().await;
}

#[tokio::test]
async fn transactions_are_per_connection() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut queuing = server.client().await;
    let mut plain = server.client().await;

    queuing.call(&["MULTI"]).await;
    assert_eq!(plain.call(&["SET", "b", "1"]).await, WireValue::ok());
    assert_eq!(queuing.call(&["GET", "b"]).await, WireValue::simple("QUEUED"));
    assert_eq!(
        queuing.call(&["EXEC"]).await,
        WireValue::Array(vec![WireValue::bulk("1")])
    );

    server.stop().await;
}

#[tokio::test]
async fn exec_result_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let server = TestServer::start(dir.path(), Role::Primary).await;
        let mut client = server.client().await;
        client.call(&["MULTI"]).await;
        client.call(&["SET", "x", "1"]).await;
        client.call(&["SET", "y", "2"]).await;
        client.call(&["EXEC"]).await;
        server.stop().await;
    }

    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;
    assert_eq!(client.call(&["GET", "x"]).await, WireValue::bulk("1"));
    assert_eq!(client.call(&["GET", "y"]).await, WireValue::bulk("2"));
    server.stop().await;
}
