//! End-to-end: Server-Sent Events playback.
//!
//! # Coverage
//! - A stored stream replayed as SSE: one JSON-quoted `data:` event for the
//!   prefix, then the terminal `event:eof`.
//! - Live appends arrive as separate events, in order.
//! - SSE response headers: `Content-Type`, `Cache-Control`, `Connection`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use htee_store::MemoryStore;
use htee_test_utils::{MockUpstream, UpstreamMode};
use hteed::proxy::UpstreamProxy;
use hteed::{Server, Services};

async fn start_daemon() -> (SocketAddr, MockUpstream) {
    let upstream = MockUpstream::start(UpstreamMode::Allow).await;
    let store = Arc::new(MemoryStore::new());
    let proxy = UpstreamProxy::new(&upstream.url(), "test-token").unwrap();
    let services = Arc::new(Services::new(store, proxy));

    let server = Server::bind("127.0.0.1:0", services).await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run());

    (addr, upstream)
}

#[tokio::test]
async fn closed_stream_replays_as_one_event_plus_eof() {
    let (addr, _upstream) = start_daemon().await;

    let client = htee_client::Client::new(&format!("http://{addr}"), None).unwrap();
    let mut upload = client.post("/test/sse").await.unwrap();
    upload.send(b"hello\nworld").await.unwrap();
    assert_eq!(upload.finish().await.unwrap().status, 204);

    let res = reqwest::Client::new()
        .get(format!("http://{addr}/test/sse"))
        .header("accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(res.headers()["content-type"], "text/event-stream");
    assert_eq!(res.headers()["cache-control"], "no-cache");

    let body = res.text().await.unwrap();
    assert_eq!(body, "data:\"hello\\nworld\"\n\nevent:eof\ndata:\n\n");
}

#[tokio::test]
async fn live_appends_arrive_as_separate_events_in_order() {
    let (addr, _upstream) = start_daemon().await;

    let client = htee_client::Client::new(&format!("http://{addr}"), None).unwrap();
    let mut upload = client.post("/test/sse-live").await.unwrap();

    let res = reqwest::Client::new()
        .get(format!("http://{addr}/test/sse-live"))
        .header("accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let mut body = res.bytes_stream();
    let mut received = String::new();

    upload.send(b"Part 1").await.unwrap();
    read_until(&mut received, &mut body, "data:\"Part 1\"\n\n").await;

    upload.send(b"Part 2").await.unwrap();
    read_until(&mut received, &mut body, "data:\"Part 2\"\n\n").await;

    assert_eq!(upload.finish().await.unwrap().status, 204);

    while let Some(chunk) = body.next().await {
        received.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
    }
    assert_eq!(
        received,
        "data:\"Part 1\"\n\ndata:\"Part 2\"\n\nevent:eof\ndata:\n\n"
    );
}

async fn read_until<S, B>(received: &mut String, body: &mut S, marker: &str)
where
    S: futures_util::Stream<Item = Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !received.ends_with(marker) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "never saw {marker:?}, have {received:?}"
        );
        match tokio::time::timeout(Duration::from_secs(5), body.next()).await {
            Ok(Some(chunk)) => {
                received.push_str(&String::from_utf8_lossy(chunk.unwrap().as_ref()));
            }
            Ok(None) => panic!("reader ended early at {received:?}"),
            Err(_) => panic!("reader timed out at {received:?}"),
        }
    }
}
