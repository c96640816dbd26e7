//! End-to-end: the authorization upstream in front of the engine.
//!
//! # Coverage
//! - Startup ping carries the bearer header and expects `200 PONG!`.
//! - Every request is mirrored exactly once, with the bearer header and
//!   `X-Forwarded-For` set and the path rebased onto the upstream URL.
//! - A `202` rewrite redirects a record to another stream name.
//! - A deny verdict is copied to the client verbatim.
//! - `X-Htee-Downstream-Continue` still records the upload behind a deny.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use htee_store::{MemoryStore, StreamState, StreamStore};
use htee_test_utils::{MockUpstream, UpstreamMode};
use hteed::proxy::UpstreamProxy;
use hteed::{Server, Services};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

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

#[tokio::test]
async fn startup_ping_carries_the_configured_token() {
    let upstream = MockUpstream::start(UpstreamMode::Allow).await;
    let proxy = UpstreamProxy::new(&upstream.url(), "deadbeef").unwrap();

    proxy.ping().await.unwrap();

    let requests = upstream.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/ping");
    assert_eq!(
        requests[0].header("x-htee-authorization"),
        Some("Token deadbeef")
    );
}

#[tokio::test]
async fn every_request_is_mirrored_exactly_once() {
    let (addr, _store, upstream) = start_daemon(UpstreamMode::Allow).await;

    let client = htee_client::Client::new(&format!("http://{addr}"), None).unwrap();
    let mut upload = client.post("/test/mirror").await.unwrap();
    upload.send(b"bytes").await.unwrap();
    assert_eq!(upload.finish().await.unwrap().status, 204);

    let res = reqwest::get(format!("http://{addr}/test/mirror")).await.unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(res.bytes().await.unwrap().as_ref(), b"bytes");

    // Wait out the fire-and-forget closed notification.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let requests = upstream.requests().await;
        let mirrors: Vec<_> = requests
            .iter()
            .filter(|r| r.path == "/test/mirror")
            .collect();

        if mirrors.len() >= 3 {
            // One mirror per incoming request plus the close notification;
            // the PUT is fire-and-forget so its arrival order is free.
            let post = mirrors.iter().find(|r| r.method == "POST").expect("POST mirror");
            let put = mirrors.iter().find(|r| r.method == "PUT").expect("PUT notification");
            let get = mirrors.iter().find(|r| r.method == "GET").expect("GET mirror");
            assert_eq!(mirrors.len(), 3);

            // Chunked uploads mirror with an empty body.
            assert!(post.body.is_empty());
            assert_eq!(
                post.header("x-htee-authorization"),
                Some("Token test-token")
            );
            assert_eq!(post.header("x-forwarded-for"), Some("127.0.0.1"));

            assert_eq!(
                serde_json::from_slice::<serde_json::Value>(&put.body).unwrap(),
                serde_json::json!({"stream": "test/mirror", "status": "closed"})
            );

            assert_eq!(
                get.header("x-htee-authorization"),
                Some("Token test-token")
            );
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected 3 mirrored requests, saw {mirrors:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn rewrite_verdict_redirects_the_record() {
    let (addr, _store, _upstream) = start_daemon(UpstreamMode::Rewrite(serde_json::json!({
        "path": "/rewritten"
    })))
    .await;

    let client = htee_client::Client::new(&format!("http://{addr}"), None).unwrap();
    let mut upload = client.post("/original").await.unwrap();
    upload.send(b"moved").await.unwrap();
    assert_eq!(upload.finish().await.unwrap().status, 204);

    // Every GET is rewritten to /rewritten as well, so any path replays the
    // redirected stream.
    let res = reqwest::get(format!("http://{addr}/whatever")).await.unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(res.bytes().await.unwrap().as_ref(), b"moved");
}

#[tokio::test]
async fn deny_verdict_is_copied_to_the_client() {
    let (addr, _store, _upstream) = start_daemon(UpstreamMode::Deny {
        status: 402,
        headers: vec![("x-reason".to_owned(), "billing".to_owned())],
        body: "Payment Required".to_owned(),
    })
    .await;

    let res = reqwest::get(format!("http://{addr}/test/denied")).await.unwrap();
    assert_eq!(res.status().as_u16(), 402);
    assert_eq!(res.headers()["x-reason"], "billing");
    assert_eq!(res.text().await.unwrap(), "Payment Required");
}

#[tokio::test]
async fn downstream_continue_still_records_behind_a_deny() {
    let (addr, store, _upstream) = start_daemon(UpstreamMode::Deny {
        status: 402,
        headers: vec![("x-htee-downstream-continue".to_owned(), "1".to_owned())],
        body: "Payment Required".to_owned(),
    })
    .await;

    // Pipeline the whole upload; the deny response arrives regardless.
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(
        b"POST /test/sneaky HTTP/1.1\r\n\
          Host: htee\r\n\
          Transfer-Encoding: chunked\r\n\r\n\
          6\r\nsneaky\r\n0\r\n\r\n",
    )
    .await
    .unwrap();

    let mut wire = Vec::new();
    conn.read_to_end(&mut wire).await.unwrap();
    let text = String::from_utf8_lossy(&wire);
    assert!(text.starts_with("HTTP/1.1 402 "), "got: {text}");
    assert!(
        !text.contains("x-htee-downstream-continue"),
        "marker header must not leak: {text}"
    );

    // The engine still ran: the body is in the store, closed.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let snap = store.snapshot("test/sneaky").await.unwrap();
        if snap.state == StreamState::Closed && &snap.prefix[..] == b"sneaky" {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "discarded record never landed: state {:?}, {:?}",
            snap.state,
            snap.prefix
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn client_surfaces_a_denied_upload() {
    let (addr, _store, _upstream) = start_daemon(UpstreamMode::Deny {
        status: 403,
        headers: vec![],
        body: "no".to_owned(),
    })
    .await;

    let client = htee_client::Client::new(&format!("http://{addr}"), None).unwrap();
    match client.post("/test/denied").await {
        Err(htee_client::ClientError::Rejected(head)) => {
            assert_eq!(head.status, 403);
        }
        other => panic!("expected rejection, got {:?}", other.map(|_| "upload")),
    }
}
