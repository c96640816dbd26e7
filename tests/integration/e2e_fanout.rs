//! End-to-end: live readers following a writer.
//!
//! # Coverage
//! - Lockstep ordering: a reader attached before close observes every part
//!   in write order, with the writer waiting for the reader between parts.
//! - Fan-out: many readers attached before the first write all observe the
//!   identical byte sequence.

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
async fn lockstep_reader_observes_parts_in_write_order() {
    let (addr, _upstream) = start_daemon().await;

    let client = htee_client::Client::new(&format!("http://{addr}"), None).unwrap();
    let mut upload = client.post("/test/lockstep").await.unwrap();

    // Attach the reader before the first write.
    let res = reqwest::get(format!("http://{addr}/test/lockstep"))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let mut body = res.bytes_stream();

    let mut received: Vec<u8> = Vec::new();
    let mut expected: Vec<u8> = Vec::new();

    for i in 1..=100 {
        let part = format!("Part {i}");
        expected.extend_from_slice(part.as_bytes());
        upload.send(part.as_bytes()).await.unwrap();

        // Writer waits for the reader to catch up before the next part.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while received.len() < expected.len() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "reader stalled at {} of {} bytes",
                received.len(),
                expected.len()
            );
            match tokio::time::timeout(Duration::from_secs(5), body.next()).await {
                Ok(Some(chunk)) => received.extend_from_slice(&chunk.unwrap()),
                Ok(None) => panic!("reader ended early"),
                Err(_) => panic!("reader timed out"),
            }
        }
        assert_eq!(received, expected, "reader diverged at part {i}");
    }

    assert_eq!(upload.finish().await.unwrap().status, 204);

    // Stream close ends the reader.
    while let Some(chunk) = body.next().await {
        received.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(received, expected);
}

#[tokio::test]
async fn fan_out_readers_all_observe_the_same_sequence() {
    const READERS: usize = 10;
    const PARTS: usize = 100;

    let (addr, _upstream) = start_daemon().await;

    // The writer's accepted POST opens the stream, so readers attached
    // before the first write wait for it instead of reading end-of-stream.
    let client = htee_client::Client::new(&format!("http://{addr}"), None).unwrap();
    let mut upload = client.post("/test/fanout").await.unwrap();

    let mut readers = Vec::new();
    for _ in 0..READERS {
        let res = reqwest::get(format!("http://{addr}/test/fanout"))
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 200);
        readers.push(tokio::spawn(async move {
            let mut body = res.bytes_stream();
            let mut received = Vec::new();
            while let Some(chunk) = body.next().await {
                received.extend_from_slice(&chunk.unwrap());
            }
            received
        }));
    }

    let mut expected: Vec<u8> = Vec::new();
    for i in 1..=PARTS {
        let part = format!("Part {i}");
        expected.extend_from_slice(part.as_bytes());
        upload.send(part.as_bytes()).await.unwrap();
    }
    assert_eq!(upload.finish().await.unwrap().status, 204);

    for reader in readers {
        let received = tokio::time::timeout(Duration::from_secs(10), reader)
            .await
            .expect("reader timed out")
            .unwrap();
        assert_eq!(received, expected);
    }
}
