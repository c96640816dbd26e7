//! End-to-end: record a stream, play it back, delete it.
//!
//! The daemon runs in-process over an in-memory store with a mock
//! authorization upstream that allows everything.
//!
//! # Coverage
//! - Hello-world round trip: interim `100 Continue` with Location, final
//!   `204`, then a `GET` returning the exact bytes.
//! - Wire-level record conversation: both responses on one connection.
//! - Late reader: a `GET` after close sees the full log and terminates.
//! - Delete: `GET` after `DELETE` is `200` with an empty body; a second
//!   `DELETE` still answers `204`.

use std::net::SocketAddr;
use std::sync::Arc;

use htee_store::MemoryStore;
use htee_test_utils::{MockUpstream, UpstreamMode};
use hteed::proxy::UpstreamProxy;
use hteed::{Server, Services};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

/// Spin up an in-process daemon over a fresh memory store.
/// Returns the bound address and the upstream mock (kept alive by the caller).
async fn start_daemon(mode: UpstreamMode) -> (SocketAddr, Arc<MemoryStore>, MockUpstream) {
    let upstream = MockUpstream::start(mode).await;
    let store = Arc::new(MemoryStore::new());
    let proxy = UpstreamProxy::new(&upstream.url(), "test-token").unwrap();
    let services = Arc::new(Services::new(store.clone(), proxy));

    let server = Server::bind("127.0.0.1:0", services).await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run());

    (addr, store, upstream)
}

async fn get(addr: SocketAddr, path: &str) -> (u16, Vec<u8>) {
    let res = reqwest::get(format!("http://{addr}{path}")).await.unwrap();
    let status = res.status().as_u16();
    let body = res.bytes().await.unwrap().to_vec();
    (status, body)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hello_world_round_trip() {
    let (addr, _store, _upstream) = start_daemon(UpstreamMode::Allow).await;

    let client = htee_client::Client::new(&format!("http://{addr}"), None).unwrap();
    let mut upload = client.post("/test/hello").await.unwrap();
    assert_eq!(upload.interim().status, 100);
    assert_eq!(upload.location(), Some("/test/hello"));

    upload.send(b"Hello, World!").await.unwrap();
    let fin = upload.finish().await.unwrap();
    assert_eq!(fin.status, 204);
    assert!(fin.header("date").is_some());
    assert_eq!(fin.header("connection"), Some("close"));

    let (status, body) = get(addr, "/test/hello").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"Hello, World!");
}

#[tokio::test]
async fn record_conversation_speaks_both_responses_on_one_connection() {
    let (addr, _store, _upstream) = start_daemon(UpstreamMode::Allow).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(
        b"POST /test/wire HTTP/1.1\r\n\
          Host: htee\r\n\
          Transfer-Encoding: chunked\r\n\
          Expect: 100-continue\r\n\r\n\
          5\r\nwired\r\n0\r\n\r\n",
    )
    .await
    .unwrap();

    let mut wire = Vec::new();
    conn.read_to_end(&mut wire).await.unwrap();
    let text = String::from_utf8_lossy(&wire);

    assert!(text.starts_with("HTTP/1.1 100 Continue\r\n"), "got: {text}");
    assert!(text.contains("Location: /test/wire\r\n"), "got: {text}");

    let final_at = text.find("HTTP/1.1 204 No Content\r\n").expect("final response");
    assert!(final_at > 0);
    let final_head = &text[final_at..];
    assert!(final_head.contains("Date: "), "got: {final_head}");
    assert!(final_head.contains("Connection: close\r\n"), "got: {final_head}");

    let (status, body) = get(addr, "/test/wire").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"wired");
}

#[tokio::test]
async fn late_reader_sees_the_full_log_and_end_of_stream() {
    let (addr, _store, _upstream) = start_daemon(UpstreamMode::Allow).await;

    let client = htee_client::Client::new(&format!("http://{addr}"), None).unwrap();
    let mut upload = client.post("/test/late").await.unwrap();
    for i in 0..20 {
        upload.send(format!("chunk-{i};").as_bytes()).await.unwrap();
    }
    assert_eq!(upload.finish().await.unwrap().status, 204);

    let expected: String = (0..20).map(|i| format!("chunk-{i};")).collect();

    // The reader attaches long after the writer is gone; the GET must both
    // return everything and actually terminate.
    let (status, body) = get(addr, "/test/late").await;
    assert_eq!(status, 200);
    assert_eq!(body, expected.as_bytes());
}

#[tokio::test]
async fn delete_then_get_yields_an_empty_stream() {
    let (addr, _store, _upstream) = start_daemon(UpstreamMode::Allow).await;
    let http = reqwest::Client::new();

    let client = htee_client::Client::new(&format!("http://{addr}"), None).unwrap();
    let mut upload = client.post("/test/bye").await.unwrap();
    upload.send(b"Goodbye World!").await.unwrap();
    assert_eq!(upload.finish().await.unwrap().status, 204);

    let (status, body) = get(addr, "/test/bye").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"Goodbye World!");

    let res = http
        .delete(format!("http://{addr}/test/bye"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 204);

    let (status, body) = get(addr, "/test/bye").await;
    assert_eq!(status, 200);
    assert!(body.is_empty());

    // Delete is terminal but repeatable.
    let res = http
        .delete(format!("http://{addr}/test/bye"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 204);
}

#[tokio::test]
async fn empty_upload_records_an_empty_closed_stream() {
    let (addr, _store, _upstream) = start_daemon(UpstreamMode::Allow).await;

    let client = htee_client::Client::new(&format!("http://{addr}"), None).unwrap();
    let upload = client.post("/test/empty").await.unwrap();
    assert_eq!(upload.finish().await.unwrap().status, 204);

    let (status, body) = get(addr, "/test/empty").await;
    assert_eq!(status, 200);
    assert!(body.is_empty());
}
