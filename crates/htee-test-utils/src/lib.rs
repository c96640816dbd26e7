// htee-test-utils: Shared test doubles for the end-to-end suites.
//
// Provides a mock authorization upstream that records every mirrored
// request and answers with a configurable verdict.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// One request the upstream received, captured for assertions.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// How the mock answers mirrored requests.  `/ping` always answers
/// `200 PONG!` regardless of mode.
#[derive(Debug, Clone)]
pub enum UpstreamMode {
    /// `204`: every request is allowed through untouched.
    Allow,
    /// `202` with this JSON rewrite payload.
    Rewrite(serde_json::Value),
    /// Any other response, copied to the client by the daemon.
    Deny {
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
    },
}

#[derive(Clone)]
struct MockState {
    mode: UpstreamMode,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

/// A mock authorization upstream for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound address.  Each
/// test can spin up its own isolated instance.
pub struct MockUpstream {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    /// Handle to the background server; dropped when the mock is dropped.
    _task: tokio::task::JoinHandle<()>,
}

impl MockUpstream {
    /// Start the mock, answering every mirrored request per `mode`.
    pub async fn start(mode: UpstreamMode) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = MockState {
            mode,
            requests: requests.clone(),
        };

        let router = Router::new().fallback(handle).with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock upstream");
        let addr = listener.local_addr().expect("local_addr after bind");

        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("mock upstream server error");
        });

        MockUpstream {
            addr,
            requests,
            _task: task,
        }
    }

    /// Base URL for daemon configuration.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Every request received so far, in arrival order.
    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().await.clone()
    }
}

async fn handle(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let recorded = RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_owned(),
        headers: headers
            .iter()
            .filter_map(|(n, v)| Some((n.to_string(), v.to_str().ok()?.to_owned())))
            .collect(),
        body: body.to_vec(),
    };
    state.requests.lock().await.push(recorded);

    if uri.path() == "/ping" {
        return response(StatusCode::OK, &[], "PONG!");
    }

    match &state.mode {
        UpstreamMode::Allow => response(StatusCode::NO_CONTENT, &[], ""),
        UpstreamMode::Rewrite(payload) => response(
            StatusCode::ACCEPTED,
            &[("content-type".to_owned(), "application/json".to_owned())],
            &payload.to_string(),
        ),
        UpstreamMode::Deny {
            status,
            headers,
            body,
        } => response(
            StatusCode::from_u16(*status).expect("valid deny status"),
            headers,
            body,
        ),
    }
}

fn response(status: StatusCode, headers: &[(String, String)], body: &str) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder
        .body(axum::body::Body::from(body.to_owned()))
        .expect("valid mock response")
}
