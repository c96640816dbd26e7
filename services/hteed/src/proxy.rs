//! Upstream authorization proxy.
//!
//! Every incoming request is mirrored to the configured web upstream before
//! the stream engine runs.  The upstream's status picks the verdict: `204`
//! lets the request through untouched, `202` rewrites it first, and any
//! other status is copied back to the client verbatim, optionally still
//! driving the engine when the response carries
//! `X-Htee-Downstream-Continue`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::http::request::RequestHead;

/// Bearer header added to every mirrored request.
pub const AUTH_HEADER: &str = "x-htee-authorization";

/// Response header that keeps the engine running behind a deny verdict.
pub const DOWNSTREAM_CONTINUE_HEADER: &str = "x-htee-downstream-continue";

/// Hop-by-hop headers, never mirrored upstream.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Timeout for the startup ping.
const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for a mirrored request's response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

/// What the upstream decided about a request.
pub enum Verdict {
    /// `204`: run the engine on the request as-is.
    Allow,
    /// `202`: apply the rewrite, then run the engine.
    Rewrite(Rewrite),
    /// Anything else: copy this response to the client.
    Forward(ForwardResponse),
}

/// Partial request rewrite returned by a `202` upstream response.
/// Empty fields leave the request untouched.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Rewrite {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// An upstream response to be copied to the client.
pub struct ForwardResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub downstream_continue: bool,
}

// ---------------------------------------------------------------------------
// UpstreamProxy
// ---------------------------------------------------------------------------

/// The mirror client.  Immutable after construction; safe to share.
pub struct UpstreamProxy {
    base: Url,
    auth_header: String,
    client: reqwest::Client,
}

impl UpstreamProxy {
    pub fn new(base_url: &str, token: &str) -> Result<Self, ProxyError> {
        let base = Url::parse(base_url)
            .map_err(|e| ProxyError::Invalid(format!("upstream URL '{base_url}': {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(RESPONSE_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Invalid(format!("building upstream client: {e}")))?;
        Ok(UpstreamProxy {
            base,
            auth_header: format!("Token {token}"),
            client,
        })
    }

    /// Startup check: `GET /ping` must answer `200 OK` within one second.
    pub async fn ping(&self) -> Result<(), ProxyError> {
        let url = self.rebase("/ping")?;
        let res = self
            .client
            .get(url)
            .header(AUTH_HEADER, &self.auth_header)
            .timeout(PING_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProxyError::Unavailable(e.to_string()))?;
        if res.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(ProxyError::Ping(res.status()))
        }
    }

    /// Mirror a request and interpret the upstream's verdict.
    ///
    /// `body` is the buffered request body for non-chunked requests; chunked
    /// bodies are mirrored as empty.
    pub async fn authorize(
        &self,
        method: &str,
        head: &RequestHead,
        body: Option<Bytes>,
        peer: IpAddr,
    ) -> Result<Verdict, ProxyError> {
        let url = self.rebase(&head.target)?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| ProxyError::Invalid(format!("method '{method}': {e}")))?;

        let mut headers = mirror_headers(&head.headers, peer);
        let auth = HeaderValue::from_str(&self.auth_header)
            .map_err(|e| ProxyError::Invalid(format!("auth header: {e}")))?;
        headers.insert(AUTH_HEADER, auth);
        if let Some(host) = head.header("host") {
            if let Ok(value) = HeaderValue::from_str(host) {
                headers.insert("x-forwarded-host", value);
            }
        }

        let res = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body.unwrap_or_default())
            .send()
            .await
            .map_err(|e| ProxyError::Unavailable(e.to_string()))?;

        match res.status() {
            StatusCode::NO_CONTENT => Ok(Verdict::Allow),
            StatusCode::ACCEPTED => {
                let rewrite: Rewrite = res
                    .json()
                    .await
                    .map_err(|e| ProxyError::RewriteParse(e.to_string()))?;
                Ok(Verdict::Rewrite(rewrite))
            }
            status => {
                let mut headers = res.headers().clone();
                let downstream_continue = headers.remove(DOWNSTREAM_CONTINUE_HEADER).is_some();
                let body = res
                    .bytes()
                    .await
                    .map_err(|e| ProxyError::Unavailable(e.to_string()))?;
                Ok(Verdict::Forward(ForwardResponse {
                    status,
                    headers,
                    body,
                    downstream_continue,
                }))
            }
        }
    }

    /// Fire-and-forget: tell the upstream a stream finished recording.
    pub async fn notify_closed(&self, name: &str) {
        let url = match self.rebase(&format!("/{name}")) {
            Ok(url) => url,
            Err(e) => {
                warn!(name, error = %e, "closed notification skipped");
                return;
            }
        };
        let payload = serde_json::json!({ "stream": name, "status": "closed" });
        let result = self
            .client
            .put(url)
            .header(AUTH_HEADER, &self.auth_header)
            .json(&payload)
            .send()
            .await;
        match result {
            Ok(res) if res.status() != StatusCode::NO_CONTENT => {
                warn!(name, status = %res.status(), "unexpected closed-notification response");
            }
            Ok(_) => {}
            Err(e) => warn!(name, error = %e, "closed notification failed"),
        }
    }

    fn rebase(&self, path_and_query: &str) -> Result<Url, ProxyError> {
        self.base
            .join(path_and_query)
            .map_err(|e| ProxyError::Invalid(format!("rebasing '{path_and_query}': {e}")))
    }
}

/// Copy `headers` minus hop-by-hop entries, appending `peer` to any prior
/// `X-Forwarded-For` value.
fn mirror_headers(headers: &HeaderMap, peer: IpAddr) -> HeaderMap {
    let mut mirrored = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str();
        // Host and Content-Length are set by the mirror's own client.
        if lower == "host" || lower == "content-length" || HOP_BY_HOP.contains(&lower) {
            continue;
        }
        mirrored.append(name.clone(), value.clone());
    }

    let forwarded = match mirrored
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) => format!("{prior}, {peer}"),
        None => peer.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        mirrored.insert("x-forwarded-for", value);
    }
    mirrored
}

/// Rails verb tunneling: a urlencoded `POST` whose form carries a `_method`
/// field takes that method, uppercased.
pub fn rails_method_override(method: &str, head: &RequestHead, body: Option<&[u8]>) -> Option<String> {
    if method != "POST" {
        return None;
    }
    if head.header("content-type") != Some("application/x-www-form-urlencoded") {
        return None;
    }
    let body = body?;
    url::form_urlencoded::parse(body)
        .find(|(key, _)| key == "_method")
        .filter(|(_, value)| !value.is_empty())
        .map(|(_, value)| value.to_uppercase())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("upstream ping: expected 200 OK, got {0}")]
    Ping(StatusCode),
    #[error("parsing rewrite response: {0}")]
    RewriteParse(String),
    #[error("{0}")]
    Invalid(String),
}
