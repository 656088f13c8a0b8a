//! End-to-end request handling over a raw TCP connection.

mod common;

use evault_common::WireValue;
use evault_server::Role;

use common::{bulk_text, request, Client, TestServer};

#[tokio::test]
async fn basic_commands_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;

    assert_eq!(client.call(&["PING"]).await, WireValue::simple("PONG"));
    assert_eq!(client.call(&["ping", "hello"]).await, WireValue::bulk("hello"));
    assert_eq!(client.call(&["SET", "name", "vault"]).await, WireValue::ok());
    assert_eq!(client.call(&["GET", "name"]).await, WireValue::bulk("vault"));
    assert_eq!(client.call(&["DEL", "name"]).await, WireValue::Integer(1));
    assert_eq!(client.call(&["GET", "name"]).await, WireValue::null());
    assert_eq!(client.call(&["DEL", "name"]).await, WireValue::Integer(0));

    server.stop().await;
}

#[tokio::test]
async fn expired_keys_read_as_null() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;

    assert_eq!(client.call(&["SET", "k", "v", "PX", "30"]).await, WireValue::ok());
    assert_eq!(client.call(&["GET", "k"]).await, WireValue::bulk("v"));
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    assert_eq!(client.call(&["GET", "k"]).await, WireValue::null());

    server.stop().await;
}

#[tokio::test]
async fn command_errors_keep_the_connection_open() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;

    assert_eq!(
        client.call(&["FLY", "away"]).await,
        WireValue::Error("ERR unknown command 'FLY'".to_string())
    );
    assert_eq!(
        client.call(&["GET"]).await,
        WireValue::Error("ERR wrong number of arguments for 'get' command".to_string())
    );
    assert_eq!(
        client.call(&["SET", "k", "v", "EX", "soon"]).await,
        WireValue::Error("ERR value is not an integer or out of range".to_string())
    );
    assert_eq!(
        client.call(&["SET", "k", "v", "KEEPTTL"]).await,
        WireValue::Error("ERR syntax error".to_string())
    );
    assert_eq!(client.call(&["PING"]).await, WireValue::simple("PONG"));

    server.stop().await;
}

#[tokio::test]
async fn pipelined_requests_answer_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;

    let mut batch = Vec::new();
    batch.extend_from_slice(&request(&["SET", "a", "1"]));
    batch.extend_from_slice(&request(&["GET", "a"]));
    batch.extend_from_slice(&request(&["DEL", "a"]));
    client.send_raw(&batch).await;

    assert_eq!(client.read_reply().await, WireValue::ok());
    assert_eq!(client.read_reply().await, WireValue::bulk("1"));
    assert_eq!(client.read_reply().await, WireValue::Integer(1));

    server.stop().await;
}

#[tokio::test]
async fn request_split_across_writes_is_reassembled() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;

    let frame = request(&["SET", "split", "value"]);
    let (head, tail) = frame.split_at(7);
    client.send_raw(head).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    client.send_raw(tail).await;
    assert_eq!(client.read_reply().await, WireValue::ok());
    assert_eq!(client.call(&["GET", "split"]).await, WireValue::bulk("value"));

    server.stop().await;
}

#[tokio::test]
async fn binary_values_are_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;

    client
        .send_raw(b"*3\r\n$3\r\nSET\r\n$3\r\nbin\r\n$4\r\n\x00\r\n\xff\r\n")
        .await;
    assert_eq!(client.read_reply().await, WireValue::ok());
    assert_eq!(
        client.call(&["GET", "bin"]).await,
        WireValue::bulk(&b"\x00\r\n\xff"[..])
    );

    server.stop().await;
}

#[tokio::test]
async fn non_array_and_empty_requests_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;

    client.send_raw(b"+hello\r\n*0\r\n").await;
    assert_eq!(client.call(&["PING"]).await, WireValue::simple("PONG"));

    server.stop().await;
}

#[tokio::test]
async fn non_bulk_elements_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;

    client.send_raw(b"*2\r\n$3\r\nGET\r\n:1\r\n").await;
    assert!(client.read_reply().await.is_error());
    assert_eq!(client.call(&["PING"]).await, WireValue::simple("PONG"));

    server.stop().await;
}

#[tokio::test]
async fn malformed_input_closes_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;

    client.send_raw(b"?bogus\r\n").await;
    match client.read_reply().await {
        WireValue::Error(text) => assert!(text.starts_with("ERR Protocol error"), "{text}"),
        other => panic!("expected protocol error, got {other:?}"),
    }
    assert!(client.is_closed().await);

    let mut other = Client::connect(server.addr).await;
    assert_eq!(other.call(&["PING"]).await, WireValue::simple("PONG"));

    server.stop().await;
}

#[tokio::test]
async fn info_reports_server_state() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut client = server.client().await;

    client.call(&["SET", "a", "1"]).await;
    client.call(&["NOPE"]).await;
    let info = bulk_text(&client.call(&["INFO"]).await);
    assert!(info.contains("role:primary"), "{info}");
    assert!(info.contains("keys:1"), "{info}");
    assert!(info.contains("connected_clients:1"), "{info}");
    assert!(info.contains("connected_replicas:0"), "{info}");
    assert!(info.contains("total_commands_processed:2"), "{info}");
    assert!(info.contains("total_errors:1"), "{info}");

    server.stop().await;
}

#[tokio::test]
async fn clients_share_one_keyspace() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path(), Role::Primary).await;
    let mut writer = server.client().await;
    let mut reader = server.client().await;

    assert_eq!(writer.call(&["SET", "shared", "yes"]).await, WireValue::ok());
    assert_eq!(reader.call(&["GET", "shared"]).await, WireValue::bulk("yes"));

    server.stop().await;
}
